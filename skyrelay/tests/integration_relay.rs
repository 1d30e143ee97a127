//! Integration tests for relay routing, reconnection and eviction against
//! real nodes on loopback.

use std::sync::Arc;
use std::time::Duration;

use skyrelay::config::{NodeConfig, RelayConfig};
use skyrelay::error::RelayError;
use skyrelay::node::{Node, NodeMetrics};
use skyrelay::policy::RoutingPolicy;
use skyrelay::protocol::{NodeEndpoint, RoutedMessage};
use skyrelay::relay::Relay;
use skyrelay::store::Store;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A node running on loopback, publishing to a throwaway unicast socket.
struct TestNode {
    endpoint: NodeEndpoint,
    store: Arc<Store>,
    metrics: Arc<NodeMetrics>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    _group: UdpSocket,
}

impl TestNode {
    async fn start_on(port: u16) -> Self {
        let group = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = NodeConfig {
            host: "127.0.0.1".to_string(),
            port,
            group_host: "127.0.0.1".to_string(),
            group_port: group.local_addr().unwrap().port(),
            ..NodeConfig::default()
        };

        let node = Node::bind(config).await.unwrap();
        let endpoint = NodeEndpoint::from(node.local_addr().unwrap());
        let store = node.store();
        let metrics = node.metrics();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(node.run(cancel.clone()));

        Self {
            endpoint,
            store,
            metrics,
            cancel,
            handle,
            _group: group,
        }
    }

    async fn start() -> Self {
        Self::start_on(0).await
    }

    async fn stop(self) {
        self.cancel.cancel();
        self.handle.await.unwrap();
    }
}

/// An endpoint nothing listens on.
fn dead_endpoint() -> NodeEndpoint {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let endpoint = NodeEndpoint::from(listener.local_addr().unwrap());
    drop(listener);
    endpoint
}

fn relay_config(nodes: Vec<NodeEndpoint>, policy: RoutingPolicy) -> RelayConfig {
    RelayConfig {
        ingest_host: "127.0.0.1".to_string(),
        ingest_port: 0,
        nodes,
        policy,
        connect_timeout_ms: 500,
        ..RelayConfig::default()
    }
}

async fn wait_for_len(store: &Store, len: usize) {
    for _ in 0..100 {
        if store.len() >= len {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("store has {} records, expected {len}", store.len());
}

#[tokio::test]
async fn test_unreachable_node_is_evicted_once() {
    let live = TestNode::start().await;
    let dead = dead_endpoint();

    let relay = Relay::bind(relay_config(
        vec![dead.clone(), live.endpoint.clone()],
        RoutingPolicy::RoundRobin,
    ))
    .await
    .unwrap();
    assert_eq!(relay.endpoints().len(), 2);

    // Round-robin starts at the dead endpoint: one reconnect, then eviction.
    let first = relay.route(RoutedMessage::new("Sul", "(1010.00;500.00;15.00;70.00)")).await;
    assert!(matches!(first, Err(RelayError::Unreachable { .. })));
    assert_eq!(relay.endpoints(), vec![live.endpoint.clone()]);

    for _ in 0..6 {
        let delivered = relay
            .route(RoutedMessage::new("Sul", "(1010.00;500.00;15.00;70.00)"))
            .await
            .unwrap();
        assert_eq!(delivered, live.endpoint);
    }
    wait_for_len(&live.store, 6).await;

    let snapshot = relay.metrics().snapshot();
    assert_eq!(snapshot.evictions, 1);
    assert_eq!(snapshot.reconnects, 1);
    assert_eq!(snapshot.forwarded, 6);
    assert_eq!(snapshot.dropped, 1);

    live.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_failures_evict_only_the_dead_node() {
    let a = TestNode::start().await;
    let b = TestNode::start().await;
    let dead = dead_endpoint();

    let relay = Arc::new(
        Relay::bind(relay_config(
            vec![a.endpoint.clone(), dead.clone(), b.endpoint.clone()],
            RoutingPolicy::RoundRobin,
        ))
        .await
        .unwrap(),
    );

    let mut tasks = Vec::new();
    for i in 0..60 {
        let relay = Arc::clone(&relay);
        tasks.push(tokio::spawn(async move {
            let payload = format!("({i}.00;500.00;15.00;70.00)");
            relay.route(RoutedMessage::new("Sul", payload)).await
        }));
    }

    let mut delivered = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(endpoint) => {
                assert!(endpoint == a.endpoint || endpoint == b.endpoint);
                delivered += 1;
            }
            Err(RelayError::Unreachable { endpoint, .. }) => {
                assert_eq!(endpoint, dead.to_string());
            }
            Err(e) => panic!("unexpected routing error: {e}"),
        }
    }

    assert_eq!(relay.endpoints(), vec![a.endpoint.clone(), b.endpoint.clone()]);
    let snapshot = relay.metrics().snapshot();
    assert_eq!(snapshot.evictions, 1);
    assert_eq!(snapshot.forwarded, delivered);
    assert_eq!(snapshot.forwarded + snapshot.dropped, 60);

    for _ in 0..100 {
        if (a.store.len() + b.store.len()) as u64 == delivered {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!((a.store.len() + b.store.len()) as u64, delivered);
    assert!(!a.store.is_empty());
    assert!(!b.store.is_empty());

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_duplicate_endpoints_share_one_connection() {
    let node = TestNode::start().await;

    let relay = Relay::bind(relay_config(
        vec![node.endpoint.clone(), node.endpoint.clone()],
        RoutingPolicy::RoundRobin,
    ))
    .await
    .unwrap();
    assert_eq!(relay.endpoints(), vec![node.endpoint.clone()]);

    for _ in 0..10 {
        relay
            .route(RoutedMessage::new("Norte", "975.50-1000.25-35.00-80.00"))
            .await
            .unwrap();
    }
    wait_for_len(&node.store, 10).await;

    assert_eq!(relay.metrics().snapshot().reconnects, 0);
    assert_eq!(node.metrics.snapshot().connections_total, 1);

    node.stop().await;
}

#[tokio::test]
async fn test_hash_policy_pins_identity_to_one_node() {
    let a = TestNode::start().await;
    let b = TestNode::start().await;

    let relay = Relay::bind(relay_config(
        vec![a.endpoint.clone(), b.endpoint.clone()],
        RoutingPolicy::Hash,
    ))
    .await
    .unwrap();

    let mut targets = Vec::new();
    for i in 0..10 {
        let payload = format!("990.00#600.00#2{i}.00#60.00");
        targets.push(relay.route(RoutedMessage::new("Oeste", payload)).await.unwrap());
    }
    assert!(targets.iter().all(|t| *t == targets[0]));

    let (chosen, other) = if targets[0] == a.endpoint { (&a, &b) } else { (&b, &a) };
    wait_for_len(&chosen.store, 10).await;
    assert!(other.store.is_empty());

    // Per-identity order survives the hop.
    let values = chosen.store.read_all("Oeste");
    assert_eq!(values[0], "[20.00//60.00//990.00//600.00]");
    assert_eq!(values[9], "[29.00//60.00//990.00//600.00]");

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_round_robin_spreads_evenly() {
    let a = TestNode::start().await;
    let b = TestNode::start().await;

    let relay = Relay::bind(relay_config(
        vec![a.endpoint.clone(), b.endpoint.clone()],
        RoutingPolicy::RoundRobin,
    ))
    .await
    .unwrap();

    for _ in 0..10 {
        relay
            .route(RoutedMessage::new("Norte", "975.50-1000.25-35.00-80.00"))
            .await
            .unwrap();
    }

    wait_for_len(&a.store, 5).await;
    wait_for_len(&b.store, 5).await;
    assert_eq!(a.store.len(), 5);
    assert_eq!(b.store.len(), 5);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_reconnects_to_restarted_node() {
    let node = TestNode::start().await;
    let port = node.endpoint.port;

    let relay = Relay::bind(relay_config(vec![node.endpoint.clone()], RoutingPolicy::Hash))
        .await
        .unwrap();
    relay
        .route(RoutedMessage::new("Leste", "{970.10,650.20,28.50,60.00}"))
        .await
        .unwrap();
    wait_for_len(&node.store, 1).await;

    node.stop().await;
    // Let the relay notice the hang-up.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let restarted = TestNode::start_on(port).await;
    let delivered = relay
        .route(RoutedMessage::new("Leste", "{970.10,650.20,28.50,60.00}"))
        .await
        .unwrap();
    assert_eq!(delivered.port, port);
    wait_for_len(&restarted.store, 1).await;

    assert_eq!(relay.endpoints().len(), 1);
    assert_eq!(relay.metrics().snapshot().reconnects, 1);
    assert_eq!(relay.metrics().snapshot().evictions, 0);

    restarted.stop().await;
}

#[tokio::test]
async fn test_ingest_loop_forwards_datagrams() {
    let node = TestNode::start().await;

    let mut config = relay_config(vec![node.endpoint.clone()], RoutingPolicy::Hash);
    config.max_in_flight = Some(4);
    let relay = Relay::bind(config).await.unwrap();
    let ingest = relay.local_addr().unwrap();
    let metrics = relay.metrics();

    let cancel = CancellationToken::new();
    let running = tokio::spawn(relay.run(cancel.clone()));

    let drone = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    drone.send_to(b"not a routed message", ingest).await.unwrap();
    let message = RoutedMessage::new("Sul", "(1010.00;500.00;15.00;70.00)");
    for _ in 0..3 {
        drone.send_to(&message.to_datagram(), ingest).await.unwrap();
    }

    wait_for_len(&node.store, 3).await;

    cancel.cancel();
    running.await.unwrap();

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.received, 4);
    assert_eq!(snapshot.forwarded, 3);
    assert_eq!(snapshot.dropped, 1);

    // The ingest port is free again once the loop has returned.
    std::net::UdpSocket::bind(ingest).unwrap();

    node.stop().await;
}
