//! Integration tests for the backend node.
//!
//! A test plays the relay: it opens a framed connection to a node bound on
//! loopback and reads the node's publications from a unicast "group" socket.

use std::time::Duration;

use skyrelay::channel::{DEFAULT_CONNECT_TIMEOUT, FramedChannel};
use skyrelay::config::NodeConfig;
use skyrelay::node::Node;
use skyrelay::protocol::{Frame, GroupAssignment, RoutedMessage};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Binds a socket standing in for the node's delivery group.
async fn group_socket() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

fn node_config(group: &UdpSocket) -> NodeConfig {
    NodeConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        group_host: "127.0.0.1".to_string(),
        group_port: group.local_addr().unwrap().port(),
        ..NodeConfig::default()
    }
}

async fn next_publication(group: &UdpSocket) -> String {
    let mut buf = [0u8; 1024];
    let (len, _) = timeout(Duration::from_secs(5), group.recv_from(&mut buf))
        .await
        .expect("publication timed out")
        .unwrap();
    String::from_utf8(buf[..len].to_vec()).unwrap()
}

fn routed(source_id: &str, payload: &str) -> Frame {
    Frame::Routed(RoutedMessage::new(source_id, payload))
}

#[tokio::test]
async fn test_node_normalizes_stores_and_publishes() {
    let group = group_socket().await;
    let node = Node::bind(node_config(&group)).await.unwrap();
    let addr = node.local_addr().unwrap().to_string();
    let store = node.store();
    let metrics = node.metrics();

    let cancel = CancellationToken::new();
    let running = tokio::spawn(node.run(cancel.clone()));

    let relay = FramedChannel::connect(&addr, DEFAULT_CONNECT_TIMEOUT)
        .await
        .unwrap();
    relay
        .send(&routed("Sul", "(1010.00;500.00;15.00;70.00)"))
        .await
        .unwrap();
    relay
        .send(&routed("Norte", "975.50-1000.25-35.00-80.00"))
        .await
        .unwrap();

    assert_eq!(
        next_publication(&group).await,
        "[15.00//70.00//1010.00//500.00]"
    );
    assert_eq!(
        next_publication(&group).await,
        "[35.00//80.00//975.50//1000.25]"
    );

    assert_eq!(
        store.read_all("Sul"),
        vec!["[15.00//70.00//1010.00//500.00]".to_string()]
    );
    assert_eq!(store.read_all("Norte").len(), 1);
    assert_eq!(store.keys(), vec!["Norte".to_string(), "Sul".to_string()]);

    relay.close().await;
    cancel.cancel();
    running.await.unwrap();

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.records_stored, 2);
    assert_eq!(snapshot.connections_total, 1);
    assert_eq!(snapshot.connections_active, 0);
}

#[tokio::test]
async fn test_malformed_payload_keeps_connection_alive() {
    let group = group_socket().await;
    let node = Node::bind(node_config(&group)).await.unwrap();
    let addr = node.local_addr().unwrap().to_string();
    let store = node.store();
    let metrics = node.metrics();

    let cancel = CancellationToken::new();
    let running = tokio::spawn(node.run(cancel.clone()));

    let relay = FramedChannel::connect(&addr, DEFAULT_CONNECT_TIMEOUT)
        .await
        .unwrap();

    // Leste with hyphens, a non-numeric field, and a frame kind nodes ignore.
    relay
        .send(&routed("Leste", "970.10-650.20-28.50-60.00"))
        .await
        .unwrap();
    relay
        .send(&routed("Oeste", "990.00#abc#25.00#60.00"))
        .await
        .unwrap();
    relay
        .send(&Frame::Assignment(GroupAssignment::new("225.7.8.9", 50004)))
        .await
        .unwrap();

    // Same connection still works afterwards.
    relay
        .send(&routed("Leste", "{970.10,650.20,28.50,60.00}"))
        .await
        .unwrap();

    assert_eq!(
        next_publication(&group).await,
        "[28.50//60.00//970.10//650.20]"
    );
    assert_eq!(store.read_all("Leste").len(), 1);
    assert!(store.read_all("Oeste").is_empty());
    assert!(relay.is_connected());

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.records_malformed, 2);
    assert_eq!(snapshot.frames_unexpected, 1);
    assert_eq!(snapshot.records_stored, 1);

    cancel.cancel();
    running.await.unwrap();
}

#[tokio::test]
async fn test_unknown_source_uses_delimiter_detection() {
    let group = group_socket().await;
    let node = Node::bind(node_config(&group)).await.unwrap();
    let addr = node.local_addr().unwrap().to_string();
    let store = node.store();

    let cancel = CancellationToken::new();
    let running = tokio::spawn(node.run(cancel.clone()));

    let relay = FramedChannel::connect(&addr, DEFAULT_CONNECT_TIMEOUT)
        .await
        .unwrap();
    relay
        .send(&routed("drone-17", "1000.00#700.00#22.00#65.00"))
        .await
        .unwrap();

    assert_eq!(
        next_publication(&group).await,
        "[22.00//65.00//1000.00//700.00]"
    );
    assert_eq!(store.read_all("drone-17").len(), 1);

    cancel.cancel();
    running.await.unwrap();
}

#[tokio::test]
async fn test_shutdown_drains_open_connections() {
    let group = group_socket().await;
    let node = Node::bind(node_config(&group)).await.unwrap();
    let addr = node.local_addr().unwrap().to_string();

    let cancel = CancellationToken::new();
    let running = tokio::spawn(node.run(cancel.clone()));

    let relay = FramedChannel::connect(&addr, DEFAULT_CONNECT_TIMEOUT)
        .await
        .unwrap();
    relay
        .send(&routed("Sul", "(1010.00;500.00;15.00;70.00)"))
        .await
        .unwrap();
    next_publication(&group).await;

    cancel.cancel();
    timeout(Duration::from_secs(5), running)
        .await
        .expect("node did not stop")
        .unwrap();

    // The node closed its end; the relay side sees the hang-up.
    let frame: Option<Frame> = timeout(Duration::from_secs(5), relay.receive())
        .await
        .unwrap()
        .unwrap();
    assert!(frame.is_none());
}
