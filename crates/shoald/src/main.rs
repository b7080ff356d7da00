//! shoald: runs a local swarm of overlay nodes over the in-memory transport.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use shoal_core::config::ShoalConfig;
use shoal_core::PeerId;
use shoal_services::{
    FetchStats, MemoryBootstrap, MemoryNetwork, NodeContext, OverlayNode, StaticProbe,
};

mod origin;
mod viewer;

use origin::Origin;
use viewer::{SimPlayer, Viewer};

/// Bootstrap sample handed to a registering node.
const BOOTSTRAP_SAMPLE: usize = 8;
const JOIN_STAGGER: Duration = Duration::from_millis(150);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = ShoalConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = ShoalConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        ShoalConfig::default()
    });
    let sim = config.simulation.clone();
    tracing::info!(
        peers = sim.peers,
        enabled = config.overlay.enabled,
        "shoald starting"
    );

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("ctrl-c received");
            let _ = shutdown.send(());
        });
    }

    // ── Swarm ────────────────────────────────────────────────────────────────

    let network = MemoryNetwork::new();
    let bootstrap = MemoryBootstrap::new(BOOTSTRAP_SAMPLE);
    let stats = Arc::new(FetchStats::new());
    let origin = Arc::new(Origin::new(
        Duration::from_millis(sim.origin_latency_ms),
        sim.segment_bytes,
    ));
    let nodes: Arc<DashMap<PeerId, Arc<OverlayNode>>> = Arc::new(DashMap::new());

    let mut rng = StdRng::from_entropy();
    let side = (sim.max_link_latency_ms as f64 / std::f64::consts::SQRT_2).max(1.0);
    let mut viewers = Vec::with_capacity(sim.peers);
    for id in 1..=sim.peers as PeerId {
        let position = (rng.gen_range(0.0..side), rng.gen_range(0.0..side));
        // Uploads spread between a quarter and twice the configured capacity.
        let upload = (config.node.upload_bps as f64 * rng.gen_range(0.25..2.0)) as u64;
        let player = Arc::new(SimPlayer::new(&sim));
        let ctx = NodeContext {
            transport: Arc::new(network.join_at(id, position)),
            bootstrap: bootstrap.clone(),
            player: player.clone(),
            probe: Arc::new(StaticProbe::symmetric(upload)),
            telemetry: stats.clone(),
        };
        let node = OverlayNode::start(&config, ctx).await;
        nodes.insert(id, node.clone());
        viewers.push(tokio::spawn(
            Viewer::new(node, player, origin.clone(), &sim).run(shutdown_tx.subscribe()),
        ));
        tokio::time::sleep(JOIN_STAGGER).await;
    }
    tracing::info!(nodes = nodes.len(), "swarm joined");

    let stats_printer = {
        let stats = stats.clone();
        let origin = origin.clone();
        let nodes = nodes.clone();
        let period = Duration::from_secs(sim.stats_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                stats.log_stats();
                let (mut playing, mut pooled, mut outbound, mut inbound) = (0, 0, 0, 0);
                for node in nodes.iter() {
                    let status = node.status();
                    playing += usize::from(status.playing);
                    pooled += status.pooled_links;
                    outbound += status.outbound;
                    inbound += status.inbound;
                }
                tracing::info!(
                    nodes = nodes.len(),
                    playing,
                    pooled,
                    outbound,
                    inbound,
                    origin_served = origin.served(),
                    "swarm snapshot"
                );
            }
        })
    };

    // Status HTTP endpoint
    if sim.api_port != 0 {
        let state = shoal_api::ApiState {
            nodes: nodes.clone(),
            stats: stats.clone(),
            shutdown_tx: shutdown_tx.clone(),
        };
        let port = sim.api_port;
        tokio::spawn(async move {
            if let Err(e) = shoal_api::serve(state, port).await {
                tracing::error!(error = %e, "status server failed");
            }
        });
    }

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = stats_printer      => tracing::error!("stats printer exited: {:?}", r),
    }

    for viewer in viewers {
        viewer.abort();
    }
    let all: Vec<Arc<OverlayNode>> = nodes.iter().map(|n| n.value().clone()).collect();
    for node in all {
        node.shutdown().await;
    }
    stats.log_stats();
    Ok(())
}
