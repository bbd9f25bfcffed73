//! End-to-end mesh scenarios

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use canopy_core::{CanopyError, KeyId};
use canopy_routing::LinkState;
use canopy_runtime::{NodeConfig, NodeEvent, NodeState};
use canopy_wire::{LinkStatus, Message, MessageType};

use crate::{MeshHarness, RawPeer, SETTLE_TIMEOUT};

const ROOT: u16 = 20000;

/// Two-level tree under 20000:
///
/// ```text
///                 20000 B/B
///               /           \
///        30000 A/A        50000 C/C
///        /   |   \        /   |   \
///   40000 40001 40002  60000 60001 60002
///   a/b/c d/e/f g/h/i  1/2/3 4/5/6 7/8/9
/// ```
async fn subscription_tree() -> MeshHarness {
    let mut mesh = MeshHarness::new();
    let subs: [(u16, &str); 9] = [
        (20000, "B/B"),
        (30000, "A/A"),
        (50000, "C/C"),
        (40000, "a/b/c"),
        (40001, "d/e/f"),
        (40002, "g/h/i"),
        (60000, "1/2/3"),
        (60001, "4/5/6"),
        (60002, "7/8/9"),
    ];
    for &(port, _) in &subs {
        mesh.add_node(port).unwrap();
    }
    mesh.build_tree(&[
        (30000, ROOT),
        (50000, ROOT),
        (40000, 30000),
        (40001, 30000),
        (40002, 30000),
        (60000, 50000),
        (60001, 50000),
        (60002, 50000),
    ])
    .await
    .unwrap();
    for &(port, pattern) in &subs {
        mesh.subscribe(port, &[pattern]).await.unwrap();
    }
    assert!(mesh.settle().await, "tree did not settle");
    mesh
}

async fn wait_event<F>(rx: &mut broadcast::Receiver<NodeEvent>, mut pred: F) -> Option<NodeEvent>
where
    F: FnMut(&NodeEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
    loop {
        let left = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(left, rx.recv()).await {
            Ok(Ok(event)) if pred(&event) => return Some(event),
            Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => return None,
        }
    }
}

/// Give in-flight frames time to land before asserting on absence
async fn quiesce() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_tree_aggregates_interest_toward_root() {
    let mesh = subscription_tree().await;

    assert!(
        mesh.wait_interest(ROOT, 30000, &["A/A", "a/b/c", "d/e/f", "g/h/i"])
            .await
    );
    assert!(
        mesh.wait_interest(ROOT, 50000, &["C/C", "1/2/3", "4/5/6", "7/8/9"])
            .await
    );
    // Interest flows down too, minus what came from the receiving side
    assert!(
        mesh.wait_interest(30000, ROOT, &["B/B", "C/C", "1/2/3", "4/5/6", "7/8/9"])
            .await
    );
    assert!(
        mesh.wait_interest(
            40000,
            30000,
            &["A/A", "B/B", "C/C", "d/e/f", "g/h/i", "1/2/3", "4/5/6", "7/8/9"]
        )
        .await
    );
    assert!(mesh.wait_interest(30000, 40000, &["a/b/c"]).await);
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_publication_reaches_only_matching_subscriber() {
    let mesh = subscription_tree().await;

    mesh.node(40000)
        .publish(&["1/2/3"], b"leaf to leaf".to_vec(), None)
        .await
        .unwrap();
    assert!(mesh.wait_received(60000, 1).await);

    let got = mesh.received(60000);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].payload, b"leaf to leaf");
    assert_eq!(got[0].matched, vec!["1/2/3".to_string()]);

    quiesce().await;
    for port in mesh.ports() {
        if port != 60000 {
            assert!(mesh.received(port).is_empty(), "unexpected delivery at {}", port);
        }
    }
    // Never offered to a branch without interest
    let sibling = mesh.snapshot(60001).await.unwrap();
    assert_eq!(sibling.router.routed, 0);
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_non_matching_topic_not_delivered() {
    let mesh = subscription_tree().await;

    mesh.node(40000)
        .publish(&["a/b/c"], b"self".to_vec(), None)
        .await
        .unwrap();
    mesh.node(60002)
        .publish(&["B/B"], b"to root".to_vec(), None)
        .await
        .unwrap();

    assert!(mesh.wait_received(ROOT, 1).await);
    assert!(mesh.wait_received(40000, 1).await);
    quiesce().await;

    let root = mesh.received(ROOT);
    assert_eq!(root.len(), 1);
    assert_eq!(root[0].topics, vec!["B/B".to_string()]);
    assert_eq!(root[0].payload, b"to root");
    assert_eq!(mesh.received(40000).len(), 1);
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_late_joiner_gets_no_history() {
    let mut mesh = subscription_tree().await;

    mesh.node(ROOT)
        .publish(&["late/topic"], b"before".to_vec(), None)
        .await
        .unwrap();
    quiesce().await;

    mesh.add_node(61000).unwrap();
    mesh.subscribe(61000, &["+/#"]).await.unwrap();
    mesh.link(61000, 60001).await.unwrap();
    assert!(mesh.settle().await);
    assert!(mesh.received(61000).is_empty());

    mesh.node(40002)
        .publish(&["late/topic"], b"after".to_vec(), None)
        .await
        .unwrap();
    assert!(mesh.wait_received(61000, 1).await);
    quiesce().await;

    let got = mesh.received(61000);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].payload, b"after");
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_cycle_delivers_exactly_once() {
    let mut mesh = MeshHarness::new();
    for port in [21000, 21001, 21002] {
        mesh.add_node(port).unwrap();
    }
    mesh.build_tree(&[(21001, 21000), (21002, 21001), (21000, 21002)])
        .await
        .unwrap();
    mesh.subscribe(21002, &["ring/+"]).await.unwrap();
    mesh.subscribe(21001, &["ring/#"]).await.unwrap();
    assert!(mesh.settle().await);

    let mut publisher = mesh
        .node(21000)
        .publisher(&["ring/one"], None)
        .await
        .unwrap();
    for i in 0..5u8 {
        publisher.publish(vec![i]).await.unwrap();
    }
    assert!(mesh.wait_received(21002, 5).await);
    assert!(mesh.wait_received(21001, 5).await);
    quiesce().await;

    for port in [21001, 21002] {
        let got = mesh.received(port);
        let seqs: Vec<u32> = got.iter().map(|r| r.seq).collect();
        assert_eq!(seqs.len(), 5, "duplicates at {}", port);
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted, vec![1, 2, 3, 4, 5]);
    }
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_network_key_mismatch() {
    let mut mesh = MeshHarness::new();
    mesh.add_node(22000).unwrap();

    let foreign = canopy_runtime::KeyStore::new();
    foreign.set_network_key(KeyId([0xF0; 16]), &[9; 32]).unwrap();
    mesh.add_node_with(22001, NodeConfig::default(), foreign)
        .unwrap();

    let mut events = mesh.node(22000).events();
    let result = mesh
        .node(22001)
        .link(MeshHarness::addr(22000), Some(Duration::from_millis(300)))
        .await;
    assert_eq!(result, Err(CanopyError::Timeout));

    let event = wait_event(&mut events, |e| {
        matches!(e, NodeEvent::AuthenticationFailed { .. })
    })
    .await;
    match event {
        Some(NodeEvent::AuthenticationFailed { remote, reason }) => {
            assert_eq!(remote, MeshHarness::addr(22001));
            assert_eq!(reason, CanopyError::Authentication);
        }
        other => panic!("expected authentication failure, got {:?}", other),
    }
    assert!(mesh.snapshot(22000).await.unwrap().links.is_empty());
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_sealed_publication_needs_content_key() {
    let mut mesh = MeshHarness::new();
    for port in [23000, 23001, 23002] {
        mesh.add_node(port).unwrap();
    }
    mesh.build_tree(&[(23001, 23000), (23002, 23001)]).await.unwrap();

    let key = KeyId([0xC0; 16]);
    mesh.node(23000).keystore().add_content_key(key, &[1; 32]).unwrap();
    mesh.node(23002).keystore().add_content_key(key, &[1; 32]).unwrap();

    mesh.subscribe(23001, &["secret"]).await.unwrap();
    mesh.subscribe(23002, &["secret"]).await.unwrap();
    assert!(mesh.settle().await);

    let mut events = mesh.node(23001).events();
    mesh.node(23000)
        .publish(&["secret"], b"classified".to_vec(), Some(key))
        .await
        .unwrap();

    // Keyless relay drops it and does not forward
    let event = wait_event(&mut events, |e| {
        matches!(e, NodeEvent::PublicationDropped { .. })
    })
    .await;
    assert!(matches!(
        event,
        Some(NodeEvent::PublicationDropped {
            reason: CanopyError::KeyNotFound(k),
            ..
        }) if k == key
    ));
    quiesce().await;
    assert!(mesh.received(23001).is_empty());
    assert!(mesh.received(23002).is_empty());

    mesh.node(23001).keystore().add_content_key(key, &[1; 32]).unwrap();
    mesh.node(23000)
        .publish(&["secret"], b"again".to_vec(), Some(key))
        .await
        .unwrap();
    assert!(mesh.wait_received(23002, 1).await);
    assert_eq!(mesh.received(23002)[0].payload, b"again");
    assert_eq!(mesh.received(23001)[0].payload, b"again");
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_already_linked_locally() {
    let mut mesh = MeshHarness::new();
    mesh.add_node(24000).unwrap();
    mesh.add_node(24001).unwrap();
    mesh.link(24001, 24000).await.unwrap();

    assert_eq!(
        mesh.link(24001, 24000).await,
        Err(CanopyError::AlreadyLinked)
    );
    // The inbound side refuses a second link to the same address too
    assert_eq!(
        mesh.link(24000, 24001).await,
        Err(CanopyError::AlreadyLinked)
    );
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_already_linked_from_remote() {
    let mut mesh = MeshHarness::new();
    mesh.add_node(25000).unwrap();
    let mut raw = RawPeer::bind(mesh.network(), 25001, mesh.keystore().unwrap()).unwrap();
    let target = MeshHarness::addr(25000);

    // The peer answers our handshake with AlreadyLinked
    let node = mesh.node(25000);
    let (result, answered) = tokio::join!(
        node.link(raw.local_addr(), Some(Duration::from_secs(2))),
        async {
            let (_, from) = raw.recv_type(MessageType::Handshake, SETTLE_TIMEOUT).await?;
            raw.send_handshake_ack(from, LinkStatus::AlreadyLinked)
        }
    );
    answered.unwrap();
    assert_eq!(result, Err(CanopyError::AlreadyLinked));

    // A second identity claiming an already linked address is refused
    raw.send_handshake(target).unwrap();
    let (frame, _) = raw
        .recv_type(MessageType::HandshakeAck, SETTLE_TIMEOUT)
        .await
        .unwrap();
    assert!(matches!(
        frame.message,
        Message::HandshakeAck(ack) if ack.status == LinkStatus::Accepted
    ));

    raw.set_identity(canopy_crypto::Identity::generate());
    raw.send_handshake(target).unwrap();
    let (frame, _) = raw
        .recv_type(MessageType::HandshakeAck, SETTLE_TIMEOUT)
        .await
        .unwrap();
    assert!(matches!(
        frame.message,
        Message::HandshakeAck(ack) if ack.status == LinkStatus::AlreadyLinked
    ));
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_self_link_rejected() {
    let mut mesh = MeshHarness::new();
    let addr = mesh.add_node(26000).unwrap();
    assert_eq!(
        mesh.node(26000).link(addr, Some(Duration::from_secs(2))).await,
        Err(CanopyError::LinkRejected)
    );
    assert!(mesh.snapshot(26000).await.unwrap().links.is_empty());
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_link_to_silent_address_times_out() {
    let mut mesh = MeshHarness::new();
    mesh.add_node(27000).unwrap();
    let mut events = mesh.node(27000).events();

    let result = mesh
        .node(27000)
        .link(MeshHarness::addr(27999), Some(Duration::from_millis(200)))
        .await;
    assert_eq!(result, Err(CanopyError::Timeout));

    let closed = wait_event(&mut events, |e| {
        matches!(
            e,
            NodeEvent::LinkStateChanged {
                state: LinkState::Failed,
                ..
            }
        )
    })
    .await;
    assert!(closed.is_some());
    assert!(mesh.snapshot(27000).await.unwrap().links.is_empty());
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_stop_tears_down_links() {
    let mut mesh = MeshHarness::new();
    mesh.add_node(28000).unwrap();
    mesh.add_node(28001).unwrap();
    mesh.link(28001, 28000).await.unwrap();
    assert!(mesh.settle().await);

    mesh.node(28001).stop().await.unwrap();
    assert_eq!(mesh.node(28001).state(), NodeState::Stopped);
    assert_eq!(
        mesh.node(28001)
            .publish(&["x"], b"late".to_vec(), None)
            .await
            .unwrap_err(),
        CanopyError::Closed
    );

    let parent = mesh.node(28000);
    let gone = crate::eventually(SETTLE_TIMEOUT, move || async move {
        parent
            .snapshot()
            .await
            .map(|s| s.links.is_empty())
            .unwrap_or(false)
    })
    .await;
    assert!(gone);
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_unsubscribe_prunes_interest() {
    let mut mesh = MeshHarness::new();
    for port in [29000, 29001, 29002] {
        mesh.add_node(port).unwrap();
    }
    mesh.build_tree(&[(29001, 29000), (29002, 29001)]).await.unwrap();

    let wide = mesh.subscribe(29002, &["x/#"]).await.unwrap();
    let narrow = mesh.subscribe(29002, &["x/y", "z"]).await.unwrap();
    assert!(mesh.wait_interest(29000, 29001, &["x/#", "z"]).await);

    mesh.node(29002).unsubscribe(wide).await.unwrap();
    assert!(mesh.wait_interest(29000, 29001, &["x/y", "z"]).await);

    mesh.node(29002).unsubscribe(narrow).await.unwrap();
    assert!(mesh.wait_interest(29000, 29001, &[]).await);
    assert!(mesh.settle().await);

    mesh.node(29000)
        .publish(&["x/y"], b"nobody".to_vec(), None)
        .await
        .unwrap();
    quiesce().await;
    assert!(mesh.received(29002).is_empty());
    assert_eq!(mesh.snapshot(29001).await.unwrap().router.routed, 0);
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_empty_advertisement_acknowledged() {
    let mut mesh = MeshHarness::new();
    mesh.add_node(31000).unwrap();
    mesh.add_node(31001).unwrap();
    mesh.link(31001, 31000).await.unwrap();
    assert!(mesh.settle().await);

    for (port, peer) in [(31000, 31001), (31001, 31000)] {
        let link = mesh.link_snapshot(port, peer).await.unwrap();
        assert!(link.interest_sent.is_empty());
        assert!(link.interest_received.is_empty());
        assert!(link.sent_revision >= 1);
        assert!(link.acknowledged);
    }
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_acknowledgements_travel_back_to_publisher() {
    let mut mesh = MeshHarness::new();
    for port in [32000, 32001, 32002] {
        mesh.add_node(port).unwrap();
    }
    mesh.build_tree(&[(32001, 32000), (32002, 32001)]).await.unwrap();
    mesh.subscribe_acking(32002, &["ask/+"]).await.unwrap();
    mesh.subscribe(32001, &["ask/#"]).await.unwrap();
    assert!(mesh.settle().await);

    let acks = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&acks);
    let mut publisher = mesh
        .node(32000)
        .publisher_with_acks(&["ask/q"], None, move |ack| sink.lock().push(ack.clone()))
        .await
        .unwrap();
    publisher.publish(b"ping".to_vec()).await.unwrap();

    let seen = Arc::clone(&acks);
    assert!(
        crate::eventually(SETTLE_TIMEOUT, move || {
            let seen = Arc::clone(&seen);
            async move { !seen.lock().is_empty() }
        })
        .await
    );
    quiesce().await;

    let acks = acks.lock().clone();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].pub_id, publisher.pub_id());
    assert_eq!(acks[0].seq, 1);
    assert_eq!(acks[0].from, mesh.node(32002).node_id());
    assert_eq!(acks[0].payload, b"ping");
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_custom_separators() {
    let mut mesh = MeshHarness::new();
    let config = NodeConfig {
        separators: "/.".into(),
        ..NodeConfig::default()
    };
    for port in [33000, 33001] {
        let keystore = mesh.keystore().unwrap();
        mesh.add_node_with(port, config.clone(), keystore).unwrap();
    }
    mesh.link(33001, 33000).await.unwrap();
    mesh.subscribe(33001, &["sensor.+/temp"]).await.unwrap();
    assert!(mesh.wait_interest(33000, 33001, &["sensor/+/temp"]).await);

    mesh.node(33000)
        .publish(&["sensor/kitchen.temp"], b"21".to_vec(), None)
        .await
        .unwrap();
    assert!(mesh.wait_received(33001, 1).await);
    assert_eq!(
        mesh.received(33001)[0].matched,
        vec!["sensor/kitchen/temp".to_string()]
    );
    mesh.shutdown().await;
}

/// Every node sees no interest on any of its links
async fn no_interest_anywhere(mesh: &MeshHarness) -> bool {
    for port in mesh.ports() {
        let Ok(snapshot) = mesh.snapshot(port).await else {
            return false;
        };
        if snapshot.links.iter().any(|l| !l.interest_received.is_empty()) {
            return false;
        }
    }
    true
}

#[tokio::test]
async fn test_cyclic_unsubscribe_withdraws_interest() {
    let mut mesh = MeshHarness::new();
    for port in [21000, 21001, 21002] {
        mesh.add_node(port).unwrap();
    }
    mesh.build_tree(&[(21001, 21000), (21002, 21001), (21000, 21002)])
        .await
        .unwrap();
    let sub = mesh.subscribe(21002, &["ring/+"]).await.unwrap();
    assert!(mesh.settle().await);
    assert!(mesh.wait_interest(21000, 21002, &["ring/+"]).await);
    assert!(mesh.wait_interest(21001, 21002, &["ring/+"]).await);

    mesh.node(21002).unsubscribe(sub).await.unwrap();
    assert!(mesh.settle().await);
    quiesce().await;
    assert!(no_interest_anywhere(&mesh).await);

    // Nothing is forwarded around the ring any more
    mesh.node(21000)
        .publish(&["ring/gone"], b"nobody".to_vec(), None)
        .await
        .unwrap();
    quiesce().await;
    for port in [21001, 21002] {
        assert_eq!(mesh.snapshot(port).await.unwrap().router.routed, 0);
    }
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_large_subscription_generalized_to_fit() {
    let mut mesh = MeshHarness::new();
    mesh.add_node(23000).unwrap();
    mesh.add_node(23001).unwrap();
    mesh.link(23001, 23000).await.unwrap();

    let patterns: Vec<String> = (0..3000)
        .map(|i| format!("bulk/sensor-{i:05}/reading"))
        .collect();
    let patterns: Vec<&str> = patterns.iter().map(String::as_str).collect();
    mesh.subscribe(23001, &patterns).await.unwrap();

    assert!(mesh.wait_interest(23000, 23001, &["bulk/#"]).await);
    assert!(mesh.settle().await);
    let link = mesh.link_snapshot(23001, 23000).await.unwrap();
    assert_eq!(link.state, LinkState::Established);
    assert!(link.acknowledged);

    mesh.node(23000)
        .publish(&["bulk/sensor-01234/reading"], b"42".to_vec(), None)
        .await
        .unwrap();
    mesh.node(23000)
        .publish(&["bulk/elsewhere"], b"filtered".to_vec(), None)
        .await
        .unwrap();
    assert!(mesh.wait_received(23001, 1).await);
    quiesce().await;

    let got = mesh.received(23001);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].payload, b"42");
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_silent_peer_closed_and_restart_accepted() {
    let mut mesh = MeshHarness::new();
    let config = NodeConfig {
        keepalive_interval: Duration::from_millis(100),
        max_interest_retries: 3,
        ..NodeConfig::default()
    };
    let keystore = mesh.keystore().unwrap();
    let target = mesh.add_node_with(26500, config, keystore).unwrap();
    let mut raw = RawPeer::bind(mesh.network(), 26501, mesh.keystore().unwrap()).unwrap();
    let mut events = mesh.node(26500).events();

    assert_eq!(
        raw.handshake(target, SETTLE_TIMEOUT).await.unwrap(),
        LinkStatus::Accepted
    );
    raw.ack_interest(SETTLE_TIMEOUT).await.unwrap();

    // The node checks on the quiet link before giving up on it
    raw.recv_type(MessageType::Keepalive, SETTLE_TIMEOUT)
        .await
        .unwrap();
    let closed = wait_event(&mut events, |e| {
        matches!(
            e,
            NodeEvent::LinkStateChanged {
                state: LinkState::Closed,
                ..
            }
        )
    })
    .await;
    assert!(closed.is_some());
    let snapshot = mesh.snapshot(26500).await.unwrap();
    assert!(snapshot.links.is_empty());
    assert!(snapshot.runtime.keepalives_sent >= 3);

    // Back under a new identity from the same address
    raw.set_identity(canopy_crypto::Identity::generate());
    assert_eq!(
        raw.handshake(target, SETTLE_TIMEOUT).await.unwrap(),
        LinkStatus::Accepted
    );
    let snapshot = mesh.snapshot(26500).await.unwrap();
    let link = snapshot.link_to(raw.local_addr()).unwrap();
    assert_eq!(link.remote_node, Some(raw.node_id()));
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_answered_keepalives_keep_link_up() {
    let mut mesh = MeshHarness::new();
    let config = NodeConfig {
        keepalive_interval: Duration::from_millis(50),
        max_interest_retries: 2,
        ..NodeConfig::default()
    };
    for port in [26600, 26601] {
        let keystore = mesh.keystore().unwrap();
        mesh.add_node_with(port, config.clone(), keystore).unwrap();
    }
    mesh.link(26601, 26600).await.unwrap();
    assert!(mesh.settle().await);

    // Many keepalive periods without other traffic
    tokio::time::sleep(Duration::from_millis(600)).await;
    let link = mesh.link_snapshot(26600, 26601).await.unwrap();
    assert_eq!(link.state, LinkState::Established);
    assert!(mesh.snapshot(26600).await.unwrap().runtime.keepalives_sent > 0);
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_unlink_in_chain_prunes_upstream_interest() {
    let mut mesh = MeshHarness::new();
    for port in [35000, 35001, 35002] {
        mesh.add_node(port).unwrap();
    }
    mesh.build_tree(&[(35001, 35000), (35002, 35001)]).await.unwrap();
    mesh.subscribe(35002, &["chain/#"]).await.unwrap();
    assert!(mesh.wait_interest(35000, 35001, &["chain/#"]).await);

    let mut events = mesh.node(35002).events();
    let middle_to_leaf = mesh.link_snapshot(35001, 35002).await.unwrap().id;
    mesh.node(35001).unlink(middle_to_leaf).await.unwrap();
    assert_eq!(
        mesh.node(35001).unlink(middle_to_leaf).await,
        Err(CanopyError::LinkNotFound)
    );

    assert!(mesh.wait_interest(35000, 35001, &[]).await);
    // The leaf heard the teardown
    let closed = wait_event(&mut events, |e| {
        matches!(
            e,
            NodeEvent::LinkStateChanged {
                state: LinkState::Closed,
                ..
            }
        )
    })
    .await;
    assert!(closed.is_some());
    assert!(mesh.link_snapshot(35002, 35001).await.is_none());
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_dropped_link_attempt_cancelled() {
    let mut mesh = MeshHarness::new();
    mesh.add_node(36000).unwrap();
    let mut events = mesh.node(36000).events();

    let attempt = mesh
        .node(36000)
        .link(MeshHarness::addr(36999), Some(Duration::from_secs(30)));
    assert!(tokio::time::timeout(Duration::from_millis(50), attempt)
        .await
        .is_err());

    let failed = wait_event(&mut events, |e| {
        matches!(
            e,
            NodeEvent::LinkStateChanged {
                state: LinkState::Failed,
                ..
            }
        )
    })
    .await;
    match failed {
        Some(NodeEvent::LinkStateChanged { remote, .. }) => {
            assert_eq!(remote, MeshHarness::addr(36999));
        }
        other => panic!("expected failed link, got {:?}", other),
    }
    assert!(mesh.snapshot(36000).await.unwrap().links.is_empty());
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_replayed_teardown_ignored() {
    let mut mesh = MeshHarness::new();
    let target = mesh.add_node(37000).unwrap();
    let mut raw = RawPeer::bind(mesh.network(), 37001, mesh.keystore().unwrap()).unwrap();

    assert_eq!(
        raw.handshake(target, SETTLE_TIMEOUT).await.unwrap(),
        LinkStatus::Accepted
    );
    raw.ack_interest(SETTLE_TIMEOUT).await.unwrap();

    let teardown = raw.seal(&Message::Teardown).unwrap();
    raw.send_bytes(&teardown, target).unwrap();
    let node = mesh.node(37000);
    let gone = crate::eventually(SETTLE_TIMEOUT, move || async move {
        node.snapshot()
            .await
            .map(|s| s.links.is_empty())
            .unwrap_or(false)
    })
    .await;
    assert!(gone);

    // A fresh link, then the old teardown again
    assert_eq!(
        raw.handshake(target, SETTLE_TIMEOUT).await.unwrap(),
        LinkStatus::Accepted
    );
    raw.ack_interest(SETTLE_TIMEOUT).await.unwrap();
    raw.send_bytes(&teardown, target).unwrap();
    quiesce().await;

    let snapshot = mesh.snapshot(37000).await.unwrap();
    assert_eq!(snapshot.links.len(), 1);
    assert_eq!(snapshot.links[0].state, LinkState::Established);
    assert!(snapshot.runtime.replayed >= 1);

    // The same frame twice on one link counts once
    let ack = raw.seal(&Message::KeepaliveAck).unwrap();
    raw.send_bytes(&ack, target).unwrap();
    raw.send_bytes(&ack, target).unwrap();
    quiesce().await;
    let again = mesh.snapshot(37000).await.unwrap();
    assert_eq!(again.runtime.replayed, snapshot.runtime.replayed + 1);
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_peer_handshaking_again_restarts_interest() {
    let mut mesh = MeshHarness::new();
    let target = mesh.add_node(38000).unwrap();
    mesh.subscribe(38000, &["here"]).await.unwrap();
    let mut raw = RawPeer::bind(mesh.network(), 38001, mesh.keystore().unwrap()).unwrap();

    assert_eq!(
        raw.handshake(target, SETTLE_TIMEOUT).await.unwrap(),
        LinkStatus::Accepted
    );
    let first = raw.ack_interest(SETTLE_TIMEOUT).await.unwrap();

    // Same identity, fresh start: the advertisement is resent from scratch
    assert_eq!(
        raw.handshake(target, SETTLE_TIMEOUT).await.unwrap(),
        LinkStatus::Accepted
    );
    let second = raw.ack_interest(SETTLE_TIMEOUT).await.unwrap();
    assert_eq!((first, second), (1, 1));
    assert!(mesh.settle().await);

    let snapshot = mesh.snapshot(38000).await.unwrap();
    assert_eq!(snapshot.links.len(), 1);
    let link = snapshot.link_to(raw.local_addr()).unwrap();
    assert_eq!(link.state, LinkState::Established);
    assert_eq!(link.interest_sent.len(), 1);
    mesh.shutdown().await;
}

