use crate::*;

use shoal_core::wire::NoDataReason;
use shoal_services::ServerReason;

// ══════════════════════════════════════════════════════════════════════════════
//  Segment delivery
// ══════════════════════════════════════════════════════════════════════════════

/// Segment far enough ahead that the fetch waits before asking peers.
fn ahead(rep_id: &str, index: u64) -> SegmentRequest {
    SegmentRequest {
        start_time: 30.0,
        ..media(StreamType::Video, rep_id, index)
    }
}

/// Nodes 1 and 2 as mutual outbound neighbors on the low representation.
async fn pair() -> Swarm {
    let mut swarm = Swarm::new(unprimed_config());
    swarm.join(1, (0.0, 0.0), 5_000_000).await;
    swarm.join(2, (20.0, 0.0), 5_000_000).await;
    for node in swarm.nodes() {
        tune(node, LOW).await;
    }
    let linked = wait_for(90, || {
        outbound_ids(swarm.node(1)).contains(&2) && outbound_ids(swarm.node(2)).contains(&1)
    })
    .await;
    assert!(linked, "pair did not become neighbors");
    swarm
}

/// Index 1 falls on node 1 (1 mod 16), whose upload covers the pair on its
/// own. Node 1 downloads it from the server and node 2 gets it from node 1.
#[tokio::test(start_paused = true)]
async fn responsible_neighbor_serves_the_segment() {
    let swarm = pair().await;
    let request = ahead(LOW, 1);

    let first = swarm.node(1).fetch(&request).await;
    assert_eq!(first.unwrap_err().reason, ServerReason::Responsible);
    let decision = swarm
        .node(1)
        .orchestrator()
        .decision(StreamType::Video, 1)
        .unwrap();
    assert!(decision.responsible);
    swarm
        .node(1)
        .store_segment(&request.url, bytes::Bytes::from_static(b"segment-1"));

    let data = swarm.node(2).fetch(&request).await.unwrap();
    assert_eq!(&data[..], b"segment-1");
    assert!(!swarm
        .node(2)
        .orchestrator()
        .decision(StreamType::Video, 1)
        .unwrap()
        .responsible);

    assert_eq!(swarm.node(2).orchestrator().metrics().from_peer, 1);
    assert_eq!(swarm.stats.from_peer(), 1);
    // Node 2 keeps what it received for its own neighbors.
    assert_eq!(swarm.node(2).status().cached_segments, 1);
    swarm.shutdown().await;
}

/// The responsible neighbor has not decided on the index yet: it answers
/// without data and the fetch falls back to the server.
#[tokio::test(start_paused = true)]
async fn undecided_neighbor_answers_no_decision_yet() {
    let swarm = pair().await;

    let result = swarm.node(2).fetch(&ahead(LOW, 1)).await;
    assert_eq!(result.unwrap_err().reason, ServerReason::NoPeers);
    assert_eq!(swarm.stats.no_data(NoDataReason::NoDecisionYet), 1);
    assert_eq!(swarm.stats.from_server(ServerReason::NoPeers), 1);
    swarm.shutdown().await;
}

/// The neighbor decided for another representation of the same index.
#[tokio::test(start_paused = true)]
async fn neighbor_on_other_representation_reports_it() {
    let swarm = pair().await;
    let audio = |rep: &str| SegmentRequest {
        url: format!("/live/{rep}/1.m4s"),
        stream_type: StreamType::Audio,
        ..ahead(rep, 1)
    };

    // Audio does not move the video bitrate, so the pair stays intact.
    let first = swarm.node(1).fetch(&audio(AUDIO)).await;
    assert_eq!(first.unwrap_err().reason, ServerReason::Responsible);

    let mut other = audio(AUDIO);
    other.rep_id = "a128".into();
    other.url = "/live/a128/1.m4s".into();
    let result = swarm.node(2).fetch(&other).await;
    assert_eq!(result.unwrap_err().reason, ServerReason::NoPeers);
    assert_eq!(swarm.stats.no_data(NoDataReason::OtherBitrate), 1);
    swarm.shutdown().await;
}

/// The responsible neighbor stops answering: the attempt runs into the
/// receive deadline and the fetch falls back to the server.
#[tokio::test(start_paused = true)]
async fn silent_responsible_neighbor_hits_the_deadline() {
    let swarm = pair().await;
    swarm.net.silence(1);

    let started = tokio::time::Instant::now();
    let result = swarm.node(2).fetch(&ahead(LOW, 1)).await;
    assert_eq!(result.unwrap_err().reason, ServerReason::Fallback);
    // 6s wait before asking, then one receive window of 2 × 2s.
    assert!(started.elapsed() >= Duration::from_secs(10));
    assert!(started.elapsed() < Duration::from_secs(11));
    assert_eq!(swarm.stats.from_server(ServerReason::Fallback), 1);
    assert_eq!(swarm.node(2).orchestrator().metrics().from_peer, 0);
    swarm.shutdown().await;
}

/// Nodes 1 and 17 are both responsible for index 1 (both are 1 mod 16).
/// Node 17 declares an upload so large that it is almost always asked
/// first; it has nothing, so node 2 moves on to node 1.
#[tokio::test(start_paused = true)]
async fn empty_answer_moves_on_to_the_next_responsible_peer() {
    let mut swarm = Swarm::new(unprimed_config());
    swarm.join(1, (0.0, 0.0), 5_000_000).await;
    swarm.join(2, (10.0, 0.0), 5_000_000).await;
    swarm.join(17, (20.0, 0.0), 1_000_000_000_000_000).await;
    for node in swarm.nodes() {
        tune(node, LOW).await;
    }
    let linked = wait_for(90, || {
        let out = outbound_ids(swarm.node(2));
        out.contains(&1) && out.contains(&17)
    })
    .await;
    assert!(linked, "node 2 did not pick up both neighbors");

    let request = ahead(LOW, 1);
    swarm
        .node(1)
        .store_segment(&request.url, bytes::Bytes::from_static(b"segment-1"));

    let data = swarm.node(2).fetch(&request).await.unwrap();
    assert_eq!(&data[..], b"segment-1");
    assert_eq!(swarm.stats.no_data(NoDataReason::NoDecisionYet), 1);
    assert_eq!(swarm.stats.from_peer(), 1);
    assert_eq!(swarm.stats.from_server(ServerReason::NoPeers), 0);
    swarm.shutdown().await;
}

/// The first segments of each stream type always come from the server.
#[tokio::test(start_paused = true)]
async fn priming_goes_to_the_server() {
    let mut swarm = Swarm::new(ShoalConfig::default());
    let node = swarm.join(1, (0.0, 0.0), 5_000_000).await;
    node.play();

    for index in 0..4 {
        let result = node.fetch(&ahead(LOW, index)).await;
        assert_eq!(result.unwrap_err().reason, ServerReason::InitBuffer);
    }
    // Fifth segment: alone in the neighborhood, so responsible.
    let result = node.fetch(&ahead(LOW, 4)).await;
    assert_eq!(result.unwrap_err().reason, ServerReason::Responsible);
    assert_eq!(swarm.stats.from_server(ServerReason::InitBuffer), 4);
    assert_eq!(node.orchestrator().metrics().from_server, 5);
    swarm.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn disabled_overlay_always_uses_the_server() {
    let mut config = ShoalConfig::default();
    config.overlay.enabled = false;
    let mut swarm = Swarm::new(config);
    let node = swarm.join(1, (0.0, 0.0), 5_000_000).await;

    let result = node.fetch(&ahead(LOW, 9)).await;
    assert_eq!(result.unwrap_err().reason, ServerReason::Disabled);
    assert_eq!(swarm.stats.from_server(ServerReason::Disabled), 1);
    swarm.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn initialization_segments_skip_peers() {
    let swarm = pair().await;
    let init = SegmentRequest {
        url: "/live/v400/init.mp4".into(),
        kind: SegmentKind::Initialization,
        ..ahead(LOW, 0)
    };
    let result = swarm.node(2).fetch(&init).await;
    assert_eq!(result.unwrap_err().reason, ServerReason::Initialization);
    assert_eq!(swarm.stats.from_peer(), 0);
    swarm.shutdown().await;
}
