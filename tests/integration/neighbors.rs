use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Neighbor lists
// ══════════════════════════════════════════════════════════════════════════════

async fn tuned_swarm(count: u64, rep_id: &str) -> Swarm {
    let mut swarm = Swarm::new(ShoalConfig::default());
    for id in 1..=count {
        swarm.join(id, (id as f64 * 10.0, 0.0), 5_000_000).await;
    }
    for node in swarm.nodes() {
        tune(node, rep_id).await;
    }
    swarm
}

/// Every outbound entry is mirrored by an inbound entry on the other side.
fn mirrored(swarm: &Swarm) -> bool {
    swarm.nodes().all(|node| {
        outbound_ids(node)
            .into_iter()
            .all(|peer| inbound_ids(swarm.node(peer)).contains(&node.id()))
    })
}

#[tokio::test(start_paused = true)]
async fn peers_on_one_bitrate_become_neighbors() {
    let swarm = tuned_swarm(4, LOW).await;

    let formed = wait_for(90, || {
        swarm.nodes().all(|n| !outbound_ids(n).is_empty()) && mirrored(&swarm)
    })
    .await;
    assert!(formed, "neighbor lists did not form");

    for node in swarm.nodes() {
        assert!(!outbound_ids(node).contains(&node.id()));
        let outbound = node.neighbors().outbound();
        assert!(outbound.windows(2).all(|w| w[0].distance <= w[1].distance));
        assert!(outbound.iter().all(|p| p.bitrate == 400_000));
    }
    swarm.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn other_bitrate_is_blacklisted_not_admitted() {
    let mut swarm = tuned_swarm(3, LOW).await;
    let odd = swarm.join(4, (15.0, 0.0), 5_000_000).await;
    tune(&odd, HIGH).await;

    let settled = wait_for(90, || {
        odd.neighbors().blacklisted() > 0 && swarm.nodes().take(3).all(|n| !outbound_ids(n).is_empty())
    })
    .await;
    assert!(settled);

    assert!(outbound_ids(&odd).is_empty());
    assert!(inbound_ids(&odd).is_empty());
    for node in swarm.nodes().take(3) {
        assert!(!outbound_ids(node).contains(&4));
        assert!(!inbound_ids(node).contains(&4));
    }
    swarm.shutdown().await;
}

/// A pausing node drops its neighbors and every one of them blacklists it.
#[tokio::test(start_paused = true)]
async fn pause_blacklists_the_sender_at_neighbors() {
    let swarm = tuned_swarm(4, LOW).await;
    let paused = swarm.node(1);
    assert!(wait_for(90, || !outbound_ids(paused).is_empty() && !inbound_ids(paused).is_empty()).await);

    let mut before = outbound_ids(paused);
    before.extend(inbound_ids(paused));
    paused.pause().await;

    assert!(!paused.neighbors().is_playing());
    assert!(outbound_ids(paused).is_empty());
    assert!(inbound_ids(paused).is_empty());

    let notified = wait_for(10, || before.iter().all(|&id| swarm.node(id).neighbors().is_blacklisted(1))).await;
    assert!(notified, "not every neighbor blacklisted the paused node");
    for node in swarm.nodes().skip(1) {
        assert!(!outbound_ids(node).contains(&1));
        assert!(!inbound_ids(node).contains(&1));
    }
    swarm.shutdown().await;
}

/// Moving to another representation notifies the old neighbors.
#[tokio::test(start_paused = true)]
async fn bitrate_change_leaves_old_neighbors() {
    let swarm = tuned_swarm(3, LOW).await;
    let mover = swarm.node(2);
    assert!(wait_for(90, || !outbound_ids(mover).is_empty()).await);
    let before = outbound_ids(mover);

    tune(mover, HIGH).await;

    let left = wait_for(10, || {
        before.iter().all(|&id| {
            let node = swarm.node(id);
            node.neighbors().is_blacklisted(2) && !outbound_ids(node).contains(&2)
        })
    })
    .await;
    assert!(left);
    assert!(outbound_ids(mover).iter().all(|id| !before.contains(id)));
    swarm.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn crashed_neighbor_is_dropped() {
    let swarm = tuned_swarm(4, LOW).await;
    assert!(wait_for(90, || swarm.nodes().any(|n| outbound_ids(n).contains(&3))).await);

    swarm.net.crash(3);

    let dropped = wait_for(30, || {
        swarm
            .nodes()
            .filter(|n| n.id() != 3)
            .all(|n| !outbound_ids(n).contains(&3) && !inbound_ids(n).contains(&3))
    })
    .await;
    assert!(dropped);
    swarm.shutdown().await;
}
