//! Segment orchestrator.
//!
//! Every media segment the player wants goes through [`SegmentOrchestrator::fetch`].
//! It either resolves with bytes received from a responsible neighbor or
//! rejects, meaning the player must fetch the segment from the server.
//! The same component answers SEGMENT requests from neighbors.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;

use shoal_core::config::SegmentConfig;
use shoal_core::wire::{NoDataReason, SegmentMessage, StreamType};
use shoal_core::{Message, PeerId};

use crate::dispatch::ProtocolHandler;
use crate::error::{FetchRejection, ServerReason};
use crate::link::Link;
use crate::link_pool::LinkPool;
use crate::neighbors::NeighborManager;
use crate::playback::PlaybackState;
use crate::player::MediaPlayer;
use crate::responsibility::{self, Member, ResponsibilityCoordinator, ResponsiblePeer};
use crate::segment_cache::SegmentCache;
use crate::telemetry::Telemetry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Initialization,
    Media,
}

/// One segment the player is about to download.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRequest {
    pub url: String,
    pub kind: SegmentKind,
    pub stream_type: StreamType,
    pub index: u64,
    pub rep_id: String,
    /// Presentation time of the segment's first frame, in seconds.
    pub start_time: f64,
    /// Segment duration in seconds.
    pub duration: f64,
}

/// Recorded when a fetch reaches the responsibility step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub rep_id: String,
    pub responsible: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FetchMetrics {
    pub from_peer: u64,
    pub from_server: u64,
    pub connections: usize,
}

/// How asking the responsible peers ended.
enum PeerFetch {
    Data(Bytes),
    Exhausted,
    Deadline,
}

pub struct SegmentOrchestrator {
    me: PeerId,
    enabled: bool,
    config: SegmentConfig,
    ready: AtomicBool,
    started: AtomicBool,
    init_counts: Mutex<HashMap<StreamType, u32>>,
    decisions: DashMap<(StreamType, u64), (Decision, Instant)>,
    from_peer: AtomicU64,
    from_server: AtomicU64,
    cache: Arc<SegmentCache>,
    playback: Arc<PlaybackState>,
    player: Arc<dyn MediaPlayer>,
    neighbors: Arc<NeighborManager>,
    responsibility: ResponsibilityCoordinator,
    pool: Arc<LinkPool>,
    telemetry: Arc<dyn Telemetry>,
}

impl SegmentOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        enabled: bool,
        config: SegmentConfig,
        upload: u64,
        cache: Arc<SegmentCache>,
        playback: Arc<PlaybackState>,
        player: Arc<dyn MediaPlayer>,
        neighbors: Arc<NeighborManager>,
        pool: Arc<LinkPool>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        let me = pool.local_id();
        Self {
            me,
            enabled,
            config,
            ready: AtomicBool::new(false),
            started: AtomicBool::new(false),
            init_counts: Mutex::new(HashMap::new()),
            decisions: DashMap::new(),
            from_peer: AtomicU64::new(0),
            from_server: AtomicU64::new(0),
            cache,
            playback,
            player,
            neighbors,
            responsibility: ResponsibilityCoordinator::new(me, upload),
            pool,
            telemetry,
        }
    }

    /// Peers may be asked once the node is registered and its timers run.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn decision(&self, stream: StreamType, index: u64) -> Option<Decision> {
        self.decisions.get(&(stream, index)).map(|d| d.0.clone())
    }

    /// Drop cached segments and decisions older than the cache TTL.
    pub fn sweep(&self) -> (usize, usize) {
        let segments = self.cache.sweep();
        let ttl = self.config.cache_ttl();
        let before = self.decisions.len();
        self.decisions.retain(|_, (_, decided)| decided.elapsed() < ttl);
        (segments, before.saturating_sub(self.decisions.len()))
    }

    pub async fn expiry_loop(&self, period: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = interval.tick() => {
                    let (segments, decisions) = self.sweep();
                    if segments > 0 || decisions > 0 {
                        tracing::debug!(segments, decisions, "expired segment state");
                    }
                }
            }
        }
    }

    fn init_count(&self, stream: StreamType) -> u32 {
        self.init_counts.lock().get(&stream).copied().unwrap_or(0)
    }

    pub fn metrics(&self) -> FetchMetrics {
        FetchMetrics {
            from_peer: self.from_peer.load(Ordering::Relaxed),
            from_server: self.from_server.load(Ordering::Relaxed),
            connections: self.pool.len(),
        }
    }

    /// Player restarted: prime the buffer from the server again.
    pub fn reset(&self) {
        self.init_counts.lock().clear();
        self.from_peer.store(0, Ordering::Relaxed);
        self.from_server.store(0, Ordering::Relaxed);
    }

    fn reject(&self, url: &str, reason: ServerReason) -> FetchRejection {
        tracing::debug!(url, %reason, "fetching from server");
        self.from_server.fetch_add(1, Ordering::Relaxed);
        self.telemetry.report_from_server(reason);
        FetchRejection::new(reason)
    }

    /// Time to wait before asking peers, or `None` if the segment is too
    /// close to playback to involve peers at all.
    fn wait_time(&self, request: &SegmentRequest) -> Option<f64> {
        let until_playback = request.start_time - self.player.current_time();
        let low_buffer = request.duration * 4.0;
        let receive = request.duration * 2.0;
        if until_playback < receive + low_buffer {
            None
        } else if until_playback < self.config.max_wait_secs + receive + low_buffer {
            Some(until_playback - receive - low_buffer)
        } else {
            Some(self.config.max_wait_secs)
        }
    }

    fn track_bitrate(&self, request: &SegmentRequest) -> u64 {
        let bitrate = self
            .player
            .bandwidth_for_representation(&request.rep_id)
            .unwrap_or(0);
        let previous = self.playback.set_bitrate(request.stream_type, bitrate);
        if request.stream_type == StreamType::Video && previous != bitrate {
            let neighbors = self.neighbors.clone();
            tokio::spawn(async move { neighbors.notify_bitrate_change(bitrate).await });
        }
        bitrate
    }

    pub async fn fetch(&self, request: &SegmentRequest) -> Result<Bytes, FetchRejection> {
        self.started.store(true, Ordering::Release);
        let url = request.url.as_str();
        if !self.enabled {
            return Err(self.reject(url, ServerReason::Disabled));
        }
        if !self.is_ready() {
            return Err(self.reject(url, ServerReason::NotReady));
        }
        if request.kind == SegmentKind::Initialization {
            return Err(self.reject(url, ServerReason::Initialization));
        }

        let bitrate = self.track_bitrate(request);

        {
            let mut counts = self.init_counts.lock();
            let count = counts.entry(request.stream_type).or_insert(0);
            if *count < self.config.init_count {
                *count += 1;
                return Err(self.reject(url, ServerReason::InitBuffer));
            }
        }

        let Some(wait) = self.wait_time(request) else {
            return Err(self.reject(url, ServerReason::LowBuffer));
        };

        let neighbors: Vec<Member> = self
            .neighbors
            .outbound()
            .iter()
            .map(|p| Member {
                id: p.id,
                upload: p.upload,
            })
            .collect();
        let assignment =
            self.responsibility
                .calculate(request.stream_type, request.index, bitrate, &neighbors);
        self.decisions.insert(
            (request.stream_type, request.index),
            (
                Decision {
                    rep_id: request.rep_id.clone(),
                    responsible: assignment.self_responsible,
                },
                Instant::now(),
            ),
        );
        if assignment.self_responsible {
            return Err(self.reject(url, ServerReason::Responsible));
        }

        tokio::time::sleep(Duration::from_secs_f64(wait.max(0.0))).await;

        let receive = Duration::from_secs_f64(request.duration * 2.0);
        match self.fetch_from_peers(request, assignment.peers, receive).await {
            PeerFetch::Data(data) => {
                self.cache.put(request.url.clone(), data.clone());
                self.from_peer.fetch_add(1, Ordering::Relaxed);
                self.telemetry.report_from_peer();
                Ok(data)
            }
            PeerFetch::Exhausted => Err(self.reject(url, ServerReason::NoPeers)),
            PeerFetch::Deadline => Err(self.reject(url, ServerReason::Fallback)),
        }
    }

    /// Ask responsible peers one at a time, weighted by upload, until one
    /// answers with data or `receive` has passed since the first attempt.
    /// No attempt outlives that deadline.
    async fn fetch_from_peers(
        &self,
        request: &SegmentRequest,
        mut peers: Vec<ResponsiblePeer>,
        receive: Duration,
    ) -> PeerFetch {
        let deadline = Instant::now() + receive;
        loop {
            if Instant::now() >= deadline {
                return PeerFetch::Deadline;
            }
            let Some(peer) = responsibility::pick_weighted(&mut peers, &mut rand::thread_rng()) else {
                return PeerFetch::Exhausted;
            };
            let link = match tokio::time::timeout_at(deadline, self.pool.connect(peer.id)).await {
                Ok(Ok(link)) => link,
                Ok(Err(e)) => {
                    tracing::debug!(peer = peer.id, error = %e, "segment peer unreachable");
                    continue;
                }
                Err(_) => return PeerFetch::Deadline,
            };
            let ask = Message::Segment(SegmentMessage::Request {
                sender: self.me,
                stream_type: request.stream_type,
                index: request.index,
                rep_id: request.rep_id.clone(),
                url: request.url.clone(),
            });
            let remaining = deadline.saturating_duration_since(Instant::now());
            match link.request(ask, remaining).await {
                Ok(Message::Segment(SegmentMessage::Response {
                    data: Some(data), ..
                })) => {
                    tracing::debug!(peer = peer.id, url = %request.url, "segment from peer");
                    return PeerFetch::Data(data);
                }
                Ok(Message::Segment(SegmentMessage::Response { reason, .. })) => {
                    tracing::debug!(
                        peer = peer.id,
                        url = %request.url,
                        reason = reason.map(NoDataReason::as_str).unwrap_or("NONE"),
                        "peer has no data"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(peer = peer.id, url = %request.url, error = %e, "segment request failed");
                }
            }
        }
    }

    fn no_data_reason(&self, stream: StreamType, index: u64, rep_id: &str) -> NoDataReason {
        match self.decision(stream, index) {
            None if !self.started.load(Ordering::Acquire) => NoDataReason::NotStarted,
            None if self.init_count(stream) < self.config.init_count => NoDataReason::InitBuffer,
            None if self.player.is_paused() => NoDataReason::Paused,
            None => NoDataReason::NoDecisionYet,
            Some(d) if d.rep_id != rep_id => NoDataReason::OtherBitrate,
            Some(d) if !d.responsible => NoDataReason::NotResponsible,
            Some(_) => NoDataReason::NotYetDownloaded,
        }
    }
}

#[async_trait]
impl ProtocolHandler for SegmentOrchestrator {
    async fn handle_request(&self, _link: &Arc<Link>, msg: Message) -> Option<Message> {
        let Message::Segment(SegmentMessage::Request {
            sender,
            stream_type,
            index,
            rep_id,
            url,
        }) = msg
        else {
            return None;
        };
        let data = self.cache.get(&url);
        let reason = match data {
            Some(_) => {
                tracing::debug!(peer = sender, url = %url, "serving cached segment");
                None
            }
            None => {
                let reason = self.no_data_reason(stream_type, index, &rep_id);
                tracing::debug!(peer = sender, url = %url, reason = reason.as_str(), "no data for peer");
                self.telemetry.report_no_data(reason);
                Some(reason)
            }
        };
        Some(Message::Segment(SegmentMessage::Response {
            sender: self.me,
            url,
            data,
            reason,
        }))
    }
}
