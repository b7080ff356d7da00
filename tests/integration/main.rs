//! Shoal integration test harness.
//!
//! Every test runs a small swarm of overlay nodes in-process over the
//! in-memory transport with the tokio clock paused, so protocol timers
//! fire as fast as the nodes can answer each other:
//!
//!   cargo test --test integration
//!
//! Each test builds and tears down its own swarm.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use shoal_core::config::ShoalConfig;
use shoal_core::wire::StreamType;
use shoal_core::PeerId;
use shoal_services::{
    FetchStats, MediaPlayer, MemoryBootstrap, MemoryNetwork, NodeContext, OverlayNode,
    SegmentKind, SegmentRequest, StaticProbe,
};

mod api;
mod membership;
mod neighbors;
mod segments;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const LOW: &str = "v400";
pub const HIGH: &str = "v1000";
pub const AUDIO: &str = "a64";
pub const SEGMENT_SECS: f64 = 2.0;

/// Player with a hand-set clock and a fixed representation ladder.
pub struct TestPlayer {
    time: Mutex<f64>,
    paused: AtomicBool,
}

impl TestPlayer {
    pub fn new() -> Self {
        Self {
            time: Mutex::new(0.0),
            paused: AtomicBool::new(false),
        }
    }

    pub fn set_time(&self, secs: f64) {
        *self.time.lock() = secs;
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }
}

impl MediaPlayer for TestPlayer {
    fn current_time(&self) -> f64 {
        *self.time.lock()
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    fn bandwidth_for_representation(&self, rep_id: &str) -> Option<u64> {
        match rep_id {
            LOW => Some(400_000),
            HIGH => Some(1_000_000),
            AUDIO => Some(64_000),
            _ => None,
        }
    }
}

pub struct Member {
    pub node: Arc<OverlayNode>,
    pub player: Arc<TestPlayer>,
}

pub struct Swarm {
    pub net: MemoryNetwork,
    pub bootstrap: Arc<MemoryBootstrap>,
    pub stats: Arc<FetchStats>,
    pub config: ShoalConfig,
    pub members: Vec<Member>,
}

impl Swarm {
    pub fn new(config: ShoalConfig) -> Self {
        Self {
            net: MemoryNetwork::new(),
            bootstrap: MemoryBootstrap::new(8),
            stats: Arc::new(FetchStats::new()),
            config,
            members: Vec::new(),
        }
    }

    /// Start a node at `position` on the latency plane.
    pub async fn join(&mut self, id: PeerId, position: (f64, f64), upload: u64) -> Arc<OverlayNode> {
        let player = Arc::new(TestPlayer::new());
        let ctx = NodeContext {
            transport: Arc::new(self.net.join_at(id, position)),
            bootstrap: self.bootstrap.clone(),
            player: player.clone(),
            probe: Arc::new(StaticProbe::symmetric(upload)),
            telemetry: self.stats.clone(),
        };
        let node = OverlayNode::start(&self.config, ctx).await;
        self.members.push(Member {
            node: node.clone(),
            player,
        });
        node
    }

    pub fn node(&self, id: PeerId) -> &Arc<OverlayNode> {
        &self.member(id).node
    }

    pub fn player(&self, id: PeerId) -> &Arc<TestPlayer> {
        &self.member(id).player
    }

    fn member(&self, id: PeerId) -> &Member {
        self.members
            .iter()
            .find(|m| m.node.id() == id)
            .unwrap_or_else(|| panic!("node {id} not in swarm"))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<OverlayNode>> {
        self.members.iter().map(|m| &m.node)
    }

    pub async fn shutdown(&self) {
        for member in &self.members {
            member.node.shutdown().await;
        }
    }
}

/// Defaults with the server priming disabled, so peers are asked at once.
pub fn unprimed_config() -> ShoalConfig {
    let mut config = ShoalConfig::default();
    config.segments.init_count = 0;
    config
}

pub fn media(stream_type: StreamType, rep_id: &str, index: u64) -> SegmentRequest {
    SegmentRequest {
        url: format!("/live/{rep_id}/{index}.m4s"),
        kind: SegmentKind::Media,
        stream_type,
        index,
        rep_id: rep_id.to_string(),
        start_time: index as f64 * SEGMENT_SECS,
        duration: SEGMENT_SECS,
    }
}

/// Start playback and request a segment at the playhead, which announces
/// the video bitrate without asking any peer.
pub async fn tune(node: &OverlayNode, rep_id: &str) {
    node.play();
    let at_playhead = media(StreamType::Video, rep_id, 0);
    assert!(node.fetch(&at_playhead).await.is_err());
}

/// Poll `cond` on the paused clock until it holds or `secs` pass.
pub async fn wait_for(secs: u64, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(secs);
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

pub fn outbound_ids(node: &OverlayNode) -> Vec<PeerId> {
    node.neighbors().outbound().iter().map(|p| p.id).collect()
}

pub fn inbound_ids(node: &OverlayNode) -> Vec<PeerId> {
    node.neighbors().inbound().iter().map(|p| p.id).collect()
}
