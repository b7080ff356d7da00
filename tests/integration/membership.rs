use crate::*;

use shoal_services::{BootstrapQueue, CoordinateStore, SamplingProtocol};

// ══════════════════════════════════════════════════════════════════════════════
//  Peer sampling and close peers
// ══════════════════════════════════════════════════════════════════════════════

/// Two nodes with empty views: the first falls through to the bootstrap
/// service exactly once, the second is served from its registration sample.
#[tokio::test(start_paused = true)]
async fn empty_view_falls_back_to_bootstrap_once() {
    let bootstrap = MemoryBootstrap::new(8);
    let first = Arc::new(BootstrapQueue::new(1, bootstrap.clone()));
    let second = Arc::new(BootstrapQueue::new(2, bootstrap.clone()));
    assert_eq!(first.register().await.unwrap(), 0);
    assert_eq!(second.register().await.unwrap(), 1);

    let timeout = Duration::from_secs(3);
    let a = SamplingProtocol::new(1, 1_000, Arc::new(CoordinateStore::new()), first, timeout);
    let b = SamplingProtocol::new(2, 1_000, Arc::new(CoordinateStore::new()), second, timeout);

    assert_eq!(a.next_peer().await.unwrap().id, 2);
    assert_eq!(bootstrap.refill_count(), 1);
    assert_eq!(b.next_peer().await.unwrap().id, 1);
    assert_eq!(bootstrap.refill_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn views_and_close_sets_fill_up() {
    let mut swarm = Swarm::new(ShoalConfig::default());
    for id in 1..=8 {
        swarm.join(id, ((id * 7) as f64, (id * 3) as f64), 5_000_000).await;
    }

    let filled = wait_for(60, || {
        swarm
            .nodes()
            .all(|n| n.sampling().len() >= 3 && n.close_peers().len() >= 3)
    })
    .await;
    assert!(filled, "views did not fill");

    for node in swarm.nodes() {
        let view = node.sampling().snapshot();
        assert!(view.iter().all(|p| p.id != node.id()));

        let close = node.close_peers().snapshot();
        assert!(close.len() <= 16);
        assert!(close.iter().all(|p| p.id != node.id()));
        assert!(close.windows(2).all(|w| w[0].distance <= w[1].distance));
    }
    swarm.shutdown().await;
}

/// Coordinates settle so that nodes of one cluster end up nearer each
/// other than nodes of the other cluster.
#[tokio::test(start_paused = true)]
async fn coordinates_separate_distant_clusters() {
    let mut swarm = Swarm::new(ShoalConfig::default());
    for id in 1..=4 {
        swarm.join(id, (id as f64, 0.0), 5_000_000).await;
    }
    for id in 5..=8 {
        swarm.join(id, (300.0 + id as f64, 300.0), 5_000_000).await;
    }
    tokio::time::sleep(Duration::from_secs(90)).await;

    let points: Vec<(PeerId, f64, f64)> = swarm
        .nodes()
        .map(|n| {
            let s = n.status();
            (s.id, s.x, s.y)
        })
        .collect();
    let cluster = |id: PeerId| id <= 4;
    let (mut near, mut near_n, mut far, mut far_n) = (0.0, 0, 0.0, 0);
    for (i, a) in points.iter().enumerate() {
        for b in &points[i + 1..] {
            let d = ((a.1 - b.1).powi(2) + (a.2 - b.2).powi(2)).sqrt();
            if cluster(a.0) == cluster(b.0) {
                near += d;
                near_n += 1;
            } else {
                far += d;
                far_n += 1;
            }
        }
    }
    let near = near / near_n as f64;
    let far = far / far_n as f64;
    assert!(far > 2.0 * near, "intra {near:.1} vs inter {far:.1}");
    swarm.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_leaves_the_bootstrap_registry() {
    let mut swarm = Swarm::new(ShoalConfig::default());
    swarm.join(1, (0.0, 0.0), 1_000_000).await;
    swarm.join(2, (10.0, 0.0), 1_000_000).await;
    assert!(swarm.bootstrap.is_registered(1));

    swarm.node(1).shutdown().await;
    assert!(!swarm.bootstrap.is_registered(1));
    assert!(swarm.node(1).pool().is_empty());
    swarm.node(2).shutdown().await;
}
