//! One overlay participant: every component wired together with its timers.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use shoal_core::config::ShoalConfig;
use shoal_core::{Label, PeerDescriptor, PeerId};

use crate::bootstrap::{Bootstrap, BootstrapQueue};
use crate::close_peers::ClosePeerExplorer;
use crate::coordinates::{CoordinateStore, VivaldiProtocol};
use crate::error::FetchRejection;
use crate::link_pool::LinkPool;
use crate::neighbors::NeighborManager;
use crate::overlay::OverlayController;
use crate::playback::PlaybackState;
use crate::player::{BandwidthProbe, MediaPlayer};
use crate::sampling::SamplingProtocol;
use crate::segment_cache::SegmentCache;
use crate::segments::{FetchMetrics, SegmentOrchestrator, SegmentRequest};
use crate::telemetry::Telemetry;
use crate::transport::{ChannelLabel, Transport};

/// Everything a node needs from its surroundings.
pub struct NodeContext {
    pub transport: Arc<dyn Transport>,
    pub bootstrap: Arc<dyn Bootstrap>,
    pub player: Arc<dyn MediaPlayer>,
    pub probe: Arc<dyn BandwidthProbe>,
    pub telemetry: Arc<dyn Telemetry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub id: PeerId,
    pub x: f64,
    pub y: f64,
    pub uncertainty: f64,
    pub upload_bps: u64,
    pub playing: bool,
    pub video_bitrate: u64,
    pub view: usize,
    pub close_peers: usize,
    pub inbound: usize,
    pub outbound: usize,
    pub blacklisted: usize,
    pub pooled_links: usize,
    pub cached_segments: usize,
    pub fetch: FetchMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct NeighborStatus {
    pub id: PeerId,
    pub inbound: Vec<PeerDescriptor>,
    pub outbound: Vec<PeerDescriptor>,
    pub close_peers: Vec<PeerDescriptor>,
}

pub struct OverlayNode {
    id: PeerId,
    upload: u64,
    coords: Arc<CoordinateStore>,
    sampling: Arc<SamplingProtocol>,
    close_peers: Arc<ClosePeerExplorer>,
    neighbors: Arc<NeighborManager>,
    orchestrator: Arc<SegmentOrchestrator>,
    playback: Arc<PlaybackState>,
    cache: Arc<SegmentCache>,
    pool: Arc<LinkPool>,
    bootstrap: Arc<BootstrapQueue>,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl OverlayNode {
    /// Measure bandwidth, wire the components, register at the bootstrap
    /// service and start every timer.
    pub async fn start(config: &ShoalConfig, ctx: NodeContext) -> Arc<Self> {
        let id = ctx.transport.local_id();
        let upload = match ctx.probe.measure().await {
            Ok(bandwidth) => bandwidth.upload_bps,
            Err(e) => {
                tracing::warn!(node = id, error = %e, "bandwidth probe failed, using configured upload");
                config.node.upload_bps
            }
        };
        let overlay = &config.overlay;

        let coords = Arc::new(CoordinateStore::new());
        let bootstrap = Arc::new(BootstrapQueue::new(id, ctx.bootstrap));
        let pool = LinkPool::new(ctx.transport.clone(), overlay.connect_timeout());
        let sampling = Arc::new(SamplingProtocol::new(
            id,
            upload,
            coords.clone(),
            bootstrap.clone(),
            overlay.request_timeout(),
        ));
        let vivaldi = Arc::new(VivaldiProtocol::new(
            coords.clone(),
            sampling.clone(),
            overlay.request_timeout(),
        ));
        let controller = Arc::new(OverlayController::new(
            ctx.transport.clone(),
            sampling.clone(),
            vivaldi.clone(),
            overlay.connect_timeout(),
        ));
        let close_peers = Arc::new(ClosePeerExplorer::new(
            coords.clone(),
            sampling.clone(),
            pool.clone(),
            overlay.request_timeout(),
        ));
        let playback = Arc::new(PlaybackState::new());
        let neighbors = NeighborManager::new(
            upload,
            playback.clone(),
            coords.clone(),
            close_peers.clone(),
            pool.clone(),
            overlay.neighbor_request_timeout(),
        );
        let cache = Arc::new(SegmentCache::new(config.segments.cache_ttl()));
        let orchestrator = Arc::new(SegmentOrchestrator::new(
            overlay.enabled,
            config.segments.clone(),
            upload,
            cache.clone(),
            playback.clone(),
            ctx.player,
            neighbors.clone(),
            pool.clone(),
            ctx.telemetry,
        ));

        pool.set_handler(Label::Vivaldi, vivaldi.clone());
        pool.set_handler(Label::ClosePeer, close_peers.clone());
        pool.set_handler(Label::Neighbor, neighbors.clone());
        pool.set_handler(Label::Segment, orchestrator.clone());

        let (shutdown, _) = broadcast::channel(1);
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(accept_loop(
            ctx.transport,
            pool.clone(),
            controller.clone(),
            shutdown.subscribe(),
        )));

        match bootstrap.register().await {
            Ok(known) => tracing::info!(node = id, known, upload, "node started"),
            Err(e) => tracing::warn!(node = id, error = %e, "bootstrap registration failed"),
        }

        let ms = Duration::from_millis;
        tasks.push(tokio::spawn(
            controller.run(ms(overlay.overlay_interval_ms), shutdown.subscribe()),
        ));
        tasks.push(tokio::spawn(vivaldi.run(
            pool.clone(),
            ms(overlay.vivaldi_interval_ms),
            shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(close_peers.clone().run(
            ms(overlay.close_peer_interval_ms),
            ms(overlay.sampling_refresh_interval_ms),
            shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(
            neighbors
                .clone()
                .run(ms(overlay.neighbor_interval_ms), shutdown.subscribe()),
        ));
        {
            let orchestrator = orchestrator.clone();
            let period = ms(config.segments.cache_sweep_interval_ms);
            let rx = shutdown.subscribe();
            tasks.push(tokio::spawn(async move { orchestrator.expiry_loop(period, rx).await }));
        }

        orchestrator.set_ready(true);

        Arc::new(Self {
            id,
            upload,
            coords,
            sampling,
            close_peers,
            neighbors,
            orchestrator,
            playback,
            cache,
            pool,
            bootstrap,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn upload(&self) -> u64 {
        self.upload
    }

    pub fn sampling(&self) -> &Arc<SamplingProtocol> {
        &self.sampling
    }

    pub fn close_peers(&self) -> &Arc<ClosePeerExplorer> {
        &self.close_peers
    }

    pub fn neighbors(&self) -> &Arc<NeighborManager> {
        &self.neighbors
    }

    pub fn orchestrator(&self) -> &Arc<SegmentOrchestrator> {
        &self.orchestrator
    }

    pub fn pool(&self) -> &Arc<LinkPool> {
        &self.pool
    }

    pub fn play(&self) {
        self.neighbors.play();
    }

    pub async fn pause(&self) {
        self.neighbors.pause().await;
    }

    pub async fn fetch(&self, request: &SegmentRequest) -> Result<Bytes, FetchRejection> {
        self.orchestrator.fetch(request).await
    }

    /// Keep a segment downloaded from the server so neighbors can get it.
    pub fn store_segment(&self, url: &str, data: Bytes) {
        self.cache.put(url, data);
    }

    pub fn status(&self) -> NodeStatus {
        let estimate = self.coords.estimate();
        NodeStatus {
            id: self.id,
            x: estimate.coord.x,
            y: estimate.coord.y,
            uncertainty: estimate.uncertainty,
            upload_bps: self.upload,
            playing: self.playback.is_playing(),
            video_bitrate: self.playback.video_bitrate(),
            view: self.sampling.len(),
            close_peers: self.close_peers.len(),
            inbound: self.neighbors.inbound().len(),
            outbound: self.neighbors.outbound().len(),
            blacklisted: self.neighbors.blacklisted(),
            pooled_links: self.pool.len(),
            cached_segments: self.cache.len(),
            fetch: self.orchestrator.metrics(),
        }
    }

    pub fn neighbor_status(&self) -> NeighborStatus {
        NeighborStatus {
            id: self.id,
            inbound: self.neighbors.inbound(),
            outbound: self.neighbors.outbound(),
            close_peers: self.close_peers.snapshot(),
        }
    }

    /// Stop timers, leave the bootstrap registry and close every link.
    pub async fn shutdown(&self) {
        self.orchestrator.set_ready(false);
        let _ = self.shutdown.send(());
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.bootstrap.unregister().await;
        self.pool.shutdown();
        tracing::info!(node = self.id, "node stopped");
    }
}

async fn accept_loop(
    transport: Arc<dyn Transport>,
    pool: Arc<LinkPool>,
    controller: Arc<OverlayController>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            conn = transport.accept() => match conn {
                Some(conn) => match conn.label {
                    ChannelLabel::Pool => pool.accept(conn),
                    ChannelLabel::Maintenance => controller.serve(conn),
                },
                None => {
                    tracing::debug!(node = pool.local_id(), "transport closed");
                    return;
                }
            }
        }
    }
}
