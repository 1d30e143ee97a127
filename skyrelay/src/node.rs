//! Backend node: terminates relay connections, normalizes, stores and fans
//! out.
//!
//! # Design
//!
//! A node listens for [`FramedChannel`] connections from the relay. Each
//! accepted connection gets its own task that loops over incoming frames:
//!
//! 1. `receive` a [`Frame::Routed`]; `None` means the relay hung up.
//! 2. Normalize the payload, region-aware when the source identity names a
//!    region.
//! 3. Append the canonical string to the [`Store`] under the source identity.
//! 4. Publish the canonical string as one datagram to the node's group.
//!
//! Malformed payloads and failed publications are logged and skipped; they
//! never end the connection. Shutdown is cooperative: cancelling the token
//! stops the accept loop, each handler finishes the message it is on, and
//! [`Node::run`] returns once every handler has exited.
//!
//! # Example
//!
//! ```rust,no_run
//! use skyrelay::config::NodeConfig;
//! use skyrelay::node::Node;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let node = Node::bind(NodeConfig::default()).await?;
//! let store = node.store();
//!
//! let cancel = CancellationToken::new();
//! node.run(cancel.clone()).await;
//! println!("stored {} records", store.len());
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::channel::FramedChannel;
use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::net;
use crate::protocol::{Frame, RoutedMessage};
use crate::record::{self, Region};
use crate::store::Store;

/// Counters kept by a node.
#[derive(Debug, Default)]
pub struct NodeMetrics {
    /// Relay connections accepted.
    pub connections_total: AtomicU64,
    /// Relay connections currently open.
    pub connections_active: AtomicU64,
    /// Records normalized and stored.
    pub records_stored: AtomicU64,
    /// Payloads dropped as malformed.
    pub records_malformed: AtomicU64,
    /// Datagrams that could not be published.
    pub publish_failures: AtomicU64,
    /// Frames of a kind a node does not handle.
    pub frames_unexpected: AtomicU64,
}

/// Point-in-time copy of [`NodeMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeMetricsSnapshot {
    /// Connections accepted.
    pub connections_total: u64,
    /// Connections open.
    pub connections_active: u64,
    /// Records stored.
    pub records_stored: u64,
    /// Payloads dropped as malformed.
    pub records_malformed: u64,
    /// Failed publications.
    pub publish_failures: u64,
    /// Frames of an unexpected kind.
    pub frames_unexpected: u64,
}

impl NodeMetrics {
    /// Reads every counter.
    pub fn snapshot(&self) -> NodeMetricsSnapshot {
        NodeMetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            records_stored: self.records_stored.load(Ordering::Relaxed),
            records_malformed: self.records_malformed.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            frames_unexpected: self.frames_unexpected.load(Ordering::Relaxed),
        }
    }
}

/// State shared by every connection handler of one node.
#[derive(Debug)]
struct Shared {
    store: Arc<Store>,
    metrics: Arc<NodeMetrics>,
    publisher: UdpSocket,
    group: SocketAddr,
    max_frame_len: usize,
}

/// A bound, not yet running, backend node.
#[derive(Debug)]
pub struct Node {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl Node {
    /// Binds the listener and publisher with a fresh store.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Bind`] if the listener cannot be bound or
    /// [`NodeError::Publisher`] if the group is unusable.
    pub async fn bind(config: NodeConfig) -> Result<Self, NodeError> {
        Self::bind_with_store(config, Arc::new(Store::new())).await
    }

    /// Binds the listener and publisher, writing into `store`.
    ///
    /// # Errors
    ///
    /// See [`Node::bind`].
    pub async fn bind_with_store(config: NodeConfig, store: Arc<Store>) -> Result<Self, NodeError> {
        let bind_addr = config.bind_address();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|source| NodeError::Bind {
                addr: bind_addr.clone(),
                source,
            })?;

        let group =
            net::group_addr(&config.group_host, config.group_port).map_err(NodeError::Publisher)?;
        let publisher = net::publisher(config.multicast_ttl).map_err(NodeError::Publisher)?;

        tracing::info!(
            address = %bind_addr,
            group = %group,
            "node listening"
        );

        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                store,
                metrics: Arc::new(NodeMetrics::default()),
                publisher,
                group,
                max_frame_len: config.max_frame_len,
            }),
        })
    }

    /// Address the listener is actually bound to.
    ///
    /// # Errors
    ///
    /// Returns the underlying socket error.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The store this node appends to.
    pub fn store(&self) -> Arc<Store> {
        Arc::clone(&self.shared.store)
    }

    /// The node's counters; stays valid after [`Node::run`] consumes the node.
    pub fn metrics(&self) -> Arc<NodeMetrics> {
        Arc::clone(&self.shared.metrics)
    }

    /// Accepts relay connections until `cancel` fires, then waits for every
    /// connection handler to finish.
    pub async fn run(self, cancel: CancellationToken) {
        let Node { listener, shared } = self;
        let tracker = TaskTracker::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        shared.metrics.connections_total.fetch_add(1, Ordering::Relaxed);
                        shared.metrics.connections_active.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(peer = %peer, "relay connected");

                        let channel =
                            FramedChannel::new(stream).with_max_frame_len(shared.max_frame_len);
                        let shared = Arc::clone(&shared);
                        let cancel = cancel.clone();
                        tracker.spawn(async move {
                            handle_connection(&shared, channel, cancel).await;
                            shared.metrics.connections_active.fetch_sub(1, Ordering::Relaxed);
                            tracing::debug!(peer = %peer, "relay connection closed");
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept error");
                    }
                },
            }
        }

        drop(listener);
        tracker.close();
        tracker.wait().await;

        let snapshot = shared.metrics.snapshot();
        tracing::info!(
            records_stored = snapshot.records_stored,
            records_malformed = snapshot.records_malformed,
            publish_failures = snapshot.publish_failures,
            "node stopped"
        );
    }
}

/// Per-connection loop.
async fn handle_connection(shared: &Shared, channel: FramedChannel, cancel: CancellationToken) {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = channel.receive::<Frame>() => received,
        };

        match received {
            Ok(Some(Frame::Routed(message))) => shared.process(message).await,
            Ok(Some(other)) => {
                shared.metrics.frames_unexpected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(kind = other.kind(), "unexpected frame from relay, skipping");
            }
            Ok(None) => break,
            Err(e) if e.is_transport() => {
                tracing::warn!(peer = ?channel.peer_addr(), error = %e, "relay connection failed");
                break;
            }
            Err(e) => {
                shared.metrics.records_malformed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "undecodable frame, skipping");
            }
        }
    }

    channel.close().await;
}

impl Shared {
    /// Normalizes, stores and publishes one message.
    async fn process(&self, message: RoutedMessage) {
        let normalized = match message.source_id.parse::<Region>() {
            Ok(region) => record::normalize_for(region, &message.payload),
            Err(_) => record::normalize(&message.payload),
        };

        let canonical = match normalized {
            Ok(canonical) => canonical,
            Err(e) => {
                self.metrics.records_malformed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    source_id = %message.source_id,
                    payload = %message.payload,
                    error = %e,
                    "malformed payload dropped"
                );
                return;
            }
        };

        self.store.append(&message.source_id, canonical.as_str());
        self.metrics.records_stored.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(source_id = %message.source_id, record = %canonical, "record stored");

        if let Err(e) = self.publisher.send_to(canonical.as_bytes(), self.group).await {
            self.metrics.publish_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                group = %self.group,
                source_id = %message.source_id,
                error = %e,
                "multicast publish failed"
            );
        }
    }
}
