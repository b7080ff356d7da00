//! Simulated viewers: a player clock plus the loop that requests segments.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::broadcast;
use tokio::time::Instant;

use shoal_core::config::SimulationConfig;
use shoal_core::wire::StreamType;
use shoal_services::{MediaPlayer, OverlayNode, SegmentKind, SegmentRequest};

use crate::origin::Origin;

/// Segments are requested while their start lies within this many seconds
/// of the playback position.
const LOOKAHEAD_SECS: f64 = 20.0;
const PAUSE_PROBABILITY: f64 = 0.01;
const SWITCH_PROBABILITY: f64 = 0.05;

// ── Player ───────────────────────────────────────────────────────────────────

struct Clock {
    position: f64,
    playing_since: Option<Instant>,
}

/// Player whose position advances with wall time while playing.
pub struct SimPlayer {
    clock: Mutex<Clock>,
    representations: HashMap<String, u64>,
}

impl SimPlayer {
    pub fn new(sim: &SimulationConfig) -> Self {
        let mut representations: HashMap<String, u64> = sim
            .bitrates
            .iter()
            .map(|&bps| (video_rep(bps), bps))
            .collect();
        representations.insert(audio_rep(sim.audio_bitrate), sim.audio_bitrate);
        Self {
            clock: Mutex::new(Clock {
                position: 0.0,
                playing_since: None,
            }),
            representations,
        }
    }

    pub fn resume(&self) {
        let mut clock = self.clock.lock();
        if clock.playing_since.is_none() {
            clock.playing_since = Some(Instant::now());
        }
    }

    pub fn pause(&self) {
        let mut clock = self.clock.lock();
        if let Some(since) = clock.playing_since.take() {
            clock.position += since.elapsed().as_secs_f64();
        }
    }
}

impl MediaPlayer for SimPlayer {
    fn current_time(&self) -> f64 {
        let clock = self.clock.lock();
        clock.position
            + clock
                .playing_since
                .map(|since| since.elapsed().as_secs_f64())
                .unwrap_or(0.0)
    }

    fn is_paused(&self) -> bool {
        self.clock.lock().playing_since.is_none()
    }

    fn bandwidth_for_representation(&self, rep_id: &str) -> Option<u64> {
        self.representations.get(rep_id).copied()
    }
}

fn video_rep(bps: u64) -> String {
    format!("video-{bps}")
}

fn audio_rep(bps: u64) -> String {
    format!("audio-{bps}")
}

fn segment_url(rep_id: &str, index: u64) -> String {
    format!("/live/{rep_id}/{index}.m4s")
}

fn init_url(rep_id: &str) -> String {
    format!("/live/{rep_id}/init.mp4")
}

// ── Viewer loop ──────────────────────────────────────────────────────────────

pub struct Viewer {
    node: Arc<OverlayNode>,
    player: Arc<SimPlayer>,
    origin: Arc<Origin>,
    bitrates: Vec<u64>,
    audio_rep: String,
    duration: f64,
    rng: StdRng,
}

impl Viewer {
    pub fn new(
        node: Arc<OverlayNode>,
        player: Arc<SimPlayer>,
        origin: Arc<Origin>,
        sim: &SimulationConfig,
    ) -> Self {
        Self {
            node,
            player,
            origin,
            bitrates: sim.bitrates.clone(),
            audio_rep: audio_rep(sim.audio_bitrate),
            duration: sim.segment_duration_secs,
            rng: StdRng::from_entropy(),
        }
    }

    fn request(&self, stream_type: StreamType, rep_id: &str, index: u64) -> SegmentRequest {
        SegmentRequest {
            url: segment_url(rep_id, index),
            kind: SegmentKind::Media,
            stream_type,
            index,
            rep_id: rep_id.to_string(),
            start_time: index as f64 * self.duration,
            duration: self.duration,
        }
    }

    fn init_request(&self, stream_type: StreamType, rep_id: &str) -> SegmentRequest {
        SegmentRequest {
            url: init_url(rep_id),
            kind: SegmentKind::Initialization,
            stream_type,
            index: 0,
            rep_id: rep_id.to_string(),
            start_time: 0.0,
            duration: 0.0,
        }
    }

    fn download(&self, request: SegmentRequest) {
        let node = self.node.clone();
        let origin = self.origin.clone();
        tokio::spawn(async move {
            match node.fetch(&request).await {
                Ok(data) => {
                    tracing::trace!(node = node.id(), url = %request.url, bytes = data.len(), "segment from peer");
                }
                Err(rejection) => {
                    tracing::trace!(node = node.id(), url = %request.url, reason = %rejection, "segment from origin");
                    let data = origin.get(&request.url).await;
                    node.store_segment(&request.url, data);
                }
            }
        });
    }

    fn pick_bitrate(&mut self) -> Option<u64> {
        if self.bitrates.is_empty() {
            return None;
        }
        let i = self.rng.gen_range(0..self.bitrates.len());
        Some(self.bitrates[i])
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let Some(mut bitrate) = self.pick_bitrate() else {
            tracing::warn!(node = self.node.id(), "empty bitrate ladder, viewer idle");
            return;
        };
        let tick = Duration::from_secs_f64((self.duration / 4.0).max(0.05));

        self.player.resume();
        self.node.play();
        self.download(self.init_request(StreamType::Video, &video_rep(bitrate)));
        self.download(self.init_request(StreamType::Audio, &self.audio_rep));

        let mut index = 0u64;
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = tokio::time::sleep(tick) => {}
            }

            if self.player.is_paused() {
                if self.rng.gen_bool(0.25) {
                    tracing::debug!(node = self.node.id(), "viewer resumes");
                    self.player.resume();
                    self.node.play();
                }
                continue;
            }
            if self.rng.gen_bool(PAUSE_PROBABILITY) {
                tracing::debug!(node = self.node.id(), "viewer pauses");
                self.player.pause();
                self.node.pause().await;
                continue;
            }

            let start = index as f64 * self.duration;
            if start > self.player.current_time() + LOOKAHEAD_SECS {
                continue;
            }
            if self.rng.gen_bool(SWITCH_PROBABILITY) {
                if let Some(next) = self.pick_bitrate() {
                    if next != bitrate {
                        tracing::debug!(node = self.node.id(), from = bitrate, to = next, "viewer switches bitrate");
                        bitrate = next;
                        self.download(self.init_request(StreamType::Video, &video_rep(bitrate)));
                    }
                }
            }
            self.download(self.request(StreamType::Video, &video_rep(bitrate), index));
            self.download(self.request(StreamType::Audio, &self.audio_rep, index));
            index += 1;
        }
    }
}
