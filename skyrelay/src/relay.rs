//! The relay: receives drone datagrams and forwards each one to a backend
//! node.
//!
//! # Design
//!
//! The relay owns a [`RoutingTable`]: one vector of (endpoint, channel)
//! pairs behind one mutex. Connections are opened at startup; an endpoint
//! that refuses starts with no channel and gets its chance on first use.
//!
//! For every datagram a task is spawned that:
//!
//! 1. Picks a pool entry with the configured [`RoutingPolicy`].
//! 2. Sends a [`Frame::Routed`] on its channel.
//! 3. If the channel is missing, down, or the send fails, reconnects once.
//!    On success the new channel is installed and the frame resent; on
//!    failure the endpoint is evicted and the message dropped.
//!
//! The table lock is never held across network I/O. Eviction removes the
//! endpoint that was picked, looked up by identity, so two tasks failing on
//! the same node remove it once and never take a neighbour with it.
//!
//! Each installed channel also gets a watcher task that reads from it. The
//! node never writes on this connection, so the only thing a read can
//! observe is the node going away, which marks the channel disconnected
//! before the next send is attempted on it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::channel::FramedChannel;
use crate::config::RelayConfig;
use crate::error::{ChannelError, RelayError};
use crate::net::{self, MAX_DATAGRAM_LEN};
use crate::policy::{RoutingPolicy, Selector};
use crate::protocol::{Frame, NodeEndpoint, RoutedMessage};

/// Relay counters.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// Datagrams read from the ingest socket.
    pub received: AtomicU64,
    /// Messages delivered to a node.
    pub forwarded: AtomicU64,
    /// Datagrams or messages dropped for any reason.
    pub dropped: AtomicU64,
    /// Reconnect attempts.
    pub reconnects: AtomicU64,
    /// Endpoints evicted from the routing table.
    pub evictions: AtomicU64,
}

impl RelayMetrics {
    fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads every counter.
    pub fn snapshot(&self) -> RelayMetricsSnapshot {
        RelayMetricsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`RelayMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayMetricsSnapshot {
    /// Datagrams received.
    pub received: u64,
    /// Messages forwarded.
    pub forwarded: u64,
    /// Messages dropped.
    pub dropped: u64,
    /// Reconnect attempts.
    pub reconnects: u64,
    /// Endpoints evicted.
    pub evictions: u64,
}

/// An endpoint together with whatever channel it currently has.
type Picked = (NodeEndpoint, Option<Arc<FramedChannel>>);

/// Outcome of [`RoutingTable::install`].
enum Install {
    /// The new channel is in place; `replaced` is the dead one it displaced.
    Installed {
        channel: Arc<FramedChannel>,
        replaced: Option<Arc<FramedChannel>>,
    },
    /// A live channel was already installed; use it instead.
    Kept(Arc<FramedChannel>),
    /// The endpoint is no longer in the table.
    Evicted,
}

#[derive(Debug)]
struct PoolEntry {
    endpoint: NodeEndpoint,
    channel: Option<Arc<FramedChannel>>,
}

/// The relay's ordered set of backend nodes and their connections.
///
/// Endpoints and channels live in one vector of pairs, so removing an
/// endpoint always removes its channel with it.
#[derive(Debug)]
pub struct RoutingTable {
    entries: Mutex<Vec<PoolEntry>>,
    selector: Selector,
    policy: RoutingPolicy,
}

impl RoutingTable {
    /// Creates a table over `endpoints`, none of them connected yet.
    ///
    /// Repeated endpoints are kept once, at their first position.
    pub fn new(endpoints: Vec<NodeEndpoint>, policy: RoutingPolicy) -> Self {
        let mut entries: Vec<PoolEntry> = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            if entries.iter().any(|e| e.endpoint == endpoint) {
                tracing::warn!(endpoint = %endpoint, "duplicate node endpoint ignored");
                continue;
            }
            entries.push(PoolEntry {
                endpoint,
                channel: None,
            });
        }

        Self {
            entries: Mutex::new(entries),
            selector: Selector::new(),
            policy,
        }
    }

    /// The routing policy in use.
    pub fn policy(&self) -> RoutingPolicy {
        self.policy
    }

    /// Endpoints still in the table, in routing order.
    pub fn endpoints(&self) -> Vec<NodeEndpoint> {
        self.entries
            .lock()
            .iter()
            .map(|entry| entry.endpoint.clone())
            .collect()
    }

    /// Number of endpoints still in the table.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true once every endpoint has been evicted.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Chooses the entry for `identity`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::RoutingExhausted`] if the table is empty.
    fn pick(&self, identity: &str) -> Result<Picked, RelayError> {
        let entries = self.entries.lock();
        let index = self
            .selector
            .select(self.policy, identity, entries.len())
            .ok_or(RelayError::RoutingExhausted)?;
        let entry = &entries[index];
        Ok((entry.endpoint.clone(), entry.channel.clone()))
    }

    /// Installs `channel` for `endpoint` unless another task already put a
    /// live channel there.
    fn install(&self, endpoint: &NodeEndpoint, channel: Arc<FramedChannel>) -> Install {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.iter_mut().find(|e| &e.endpoint == endpoint) else {
            return Install::Evicted;
        };

        if let Some(existing) = &entry.channel
            && existing.is_connected()
        {
            return Install::Kept(Arc::clone(existing));
        }

        let replaced = entry.channel.replace(Arc::clone(&channel));
        Install::Installed { channel, replaced }
    }

    /// Removes `endpoint` and returns its channel, or `None` if it was
    /// already gone.
    fn evict(&self, endpoint: &NodeEndpoint) -> Option<Option<Arc<FramedChannel>>> {
        let mut entries = self.entries.lock();
        let position = entries.iter().position(|e| &e.endpoint == endpoint)?;
        Some(entries.remove(position).channel)
    }

    /// Detaches every channel, leaving the endpoints in place.
    fn take_channels(&self) -> Vec<Arc<FramedChannel>> {
        self.entries
            .lock()
            .iter_mut()
            .filter_map(|entry| entry.channel.take())
            .collect()
    }
}

#[derive(Debug)]
struct Inner {
    table: RoutingTable,
    metrics: Arc<RelayMetrics>,
    connect_timeout: Duration,
    watchers: TaskTracker,
}

/// A bound relay.
#[derive(Debug)]
pub struct Relay {
    socket: UdpSocket,
    inner: Arc<Inner>,
    in_flight: Option<Arc<Semaphore>>,
}

impl Relay {
    /// Binds the ingest socket and connects to every configured node.
    ///
    /// Nodes that cannot be reached are kept in the table without a channel.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Bind`] or [`RelayError::JoinGroup`] if the ingest
    /// socket cannot be set up.
    pub async fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        let socket = bind_ingest(&config)?;
        let local = socket.local_addr().ok();

        let inner = Arc::new(Inner {
            table: RoutingTable::new(config.nodes.clone(), config.policy),
            metrics: Arc::new(RelayMetrics::default()),
            connect_timeout: config.connect_timeout(),
            watchers: TaskTracker::new(),
        });

        for endpoint in inner.table.endpoints() {
            match inner.open(&endpoint).await {
                Ok(channel) => {
                    if let Some(channel) = inner.adopt(&endpoint, channel).await {
                        tracing::info!(endpoint = %endpoint, peer = ?channel.peer_addr(), "connected to node");
                    }
                }
                Err(e) => {
                    tracing::warn!(endpoint = %endpoint, error = %e, "node unavailable at startup");
                }
            }
        }

        tracing::info!(
            ingest = ?local,
            policy = %config.policy,
            nodes = inner.table.len(),
            "relay ready"
        );

        Ok(Self {
            socket,
            inner,
            in_flight: config.max_in_flight.map(|n| Arc::new(Semaphore::new(n))),
        })
    }

    /// Address the ingest socket is bound to.
    ///
    /// # Errors
    ///
    /// Returns the underlying socket error.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Endpoints still routable, in routing order.
    pub fn endpoints(&self) -> Vec<NodeEndpoint> {
        self.inner.table.endpoints()
    }

    /// The relay's counters.
    pub fn metrics(&self) -> Arc<RelayMetrics> {
        Arc::clone(&self.inner.metrics)
    }

    /// Routes one message, returning the endpoint it was delivered to.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::RoutingExhausted`] if no nodes remain, or
    /// [`RelayError::Unreachable`] if the chosen node failed and was evicted.
    pub async fn route(&self, message: RoutedMessage) -> Result<NodeEndpoint, RelayError> {
        self.inner.route(message).await
    }

    /// Reads datagrams until `cancel` fires, dispatching each on its own task.
    ///
    /// On cancellation the ingest socket is closed, dispatched tasks are
    /// awaited, and every node connection is closed. Take
    /// [`Relay::metrics`] first to read the counters afterwards.
    pub async fn run(self, cancel: CancellationToken) {
        let Self {
            socket,
            inner,
            in_flight,
        } = self;
        let dispatches = TaskTracker::new();
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];

        loop {
            let (len, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        tracing::warn!(error = %e, "ingest receive failed");
                        continue;
                    }
                },
            };
            inner.metrics.record_received();

            let message = match RoutedMessage::from_datagram(&buf[..len]) {
                Ok(message) => message,
                Err(e) => {
                    inner.metrics.record_dropped();
                    tracing::warn!(
                        peer = %peer,
                        datagram = %String::from_utf8_lossy(&buf[..len]),
                        error = %e,
                        "undecodable datagram dropped"
                    );
                    continue;
                }
            };

            let permit = match &in_flight {
                Some(limit) => tokio::select! {
                    _ = cancel.cancelled() => break,
                    permit = Arc::clone(limit).acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                },
                None => None,
            };

            let dispatcher = Arc::clone(&inner);
            dispatches.spawn(async move {
                let _permit = permit;
                dispatcher.dispatch(message).await;
            });
        }

        drop(socket);
        dispatches.close();
        dispatches.wait().await;

        for channel in inner.table.take_channels() {
            channel.close().await;
        }
        inner.watchers.close();
        inner.watchers.wait().await;

        let snapshot = inner.metrics.snapshot();
        tracing::info!(
            received = snapshot.received,
            forwarded = snapshot.forwarded,
            dropped = snapshot.dropped,
            reconnects = snapshot.reconnects,
            evictions = snapshot.evictions,
            "relay stopped"
        );
    }
}

impl Inner {
    /// Routes a message and logs whatever went wrong.
    async fn dispatch(&self, message: RoutedMessage) {
        let source_id = message.source_id.clone();
        let payload = message.payload.clone();

        match self.route(message).await {
            Ok(endpoint) => {
                tracing::trace!(source_id = %source_id, endpoint = %endpoint, "forwarded");
            }
            Err(RelayError::RoutingExhausted) => {
                tracing::error!(
                    source_id = %source_id,
                    payload = %payload,
                    "no backend nodes left, message dropped"
                );
            }
            Err(e) => {
                tracing::warn!(
                    source_id = %source_id,
                    payload = %payload,
                    error = %e,
                    "message dropped"
                );
            }
        }
    }

    async fn route(&self, message: RoutedMessage) -> Result<NodeEndpoint, RelayError> {
        let (endpoint, channel) = match self.table.pick(&message.source_id) {
            Ok(picked) => picked,
            Err(e) => {
                self.metrics.record_dropped();
                return Err(e);
            }
        };
        let frame = Frame::Routed(message);

        if let Some(channel) = channel.filter(|c| c.is_connected()) {
            match channel.send(&frame).await {
                Ok(()) => {
                    self.metrics.record_forwarded();
                    return Ok(endpoint);
                }
                Err(e) => {
                    tracing::warn!(endpoint = %endpoint, error = %e, "send failed, reconnecting");
                }
            }
        }

        self.metrics.record_reconnect();
        let result = match self.open(&endpoint).await {
            Ok(channel) => match self.adopt(&endpoint, channel).await {
                Some(channel) => channel.send(&frame).await,
                None => {
                    // Evicted by another task while we were connecting.
                    self.metrics.record_dropped();
                    return Err(RelayError::Unreachable {
                        endpoint: endpoint.to_string(),
                        source: ChannelError::Closed,
                    });
                }
            },
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.metrics.record_forwarded();
                Ok(endpoint)
            }
            Err(source) => {
                self.evict(&endpoint).await;
                self.metrics.record_dropped();
                Err(RelayError::Unreachable {
                    endpoint: endpoint.to_string(),
                    source,
                })
            }
        }
    }

    async fn open(&self, endpoint: &NodeEndpoint) -> Result<Arc<FramedChannel>, ChannelError> {
        let channel = FramedChannel::connect(&endpoint.address(), self.connect_timeout).await?;
        Ok(Arc::new(channel))
    }

    /// Installs a fresh channel and starts its watcher. Returns the channel
    /// to send on, or `None` if the endpoint is no longer in the table.
    async fn adopt(
        &self,
        endpoint: &NodeEndpoint,
        channel: Arc<FramedChannel>,
    ) -> Option<Arc<FramedChannel>> {
        match self.table.install(endpoint, Arc::clone(&channel)) {
            Install::Installed { channel, replaced } => {
                if let Some(replaced) = replaced {
                    replaced.close().await;
                }
                self.watch(endpoint.clone(), Arc::clone(&channel));
                Some(channel)
            }
            Install::Kept(existing) => {
                channel.close().await;
                Some(existing)
            }
            Install::Evicted => {
                channel.close().await;
                None
            }
        }
    }

    async fn evict(&self, endpoint: &NodeEndpoint) {
        let Some(channel) = self.table.evict(endpoint) else {
            return;
        };
        self.metrics.record_eviction();
        tracing::warn!(
            endpoint = %endpoint,
            remaining = self.table.len(),
            "node evicted from routing table"
        );

        if let Some(channel) = channel {
            channel.close().await;
        }
    }

    fn watch(&self, endpoint: NodeEndpoint, channel: Arc<FramedChannel>) {
        self.watchers.spawn(async move {
            loop {
                match channel.receive::<Frame>().await {
                    Ok(Some(frame)) => {
                        tracing::debug!(endpoint = %endpoint, kind = frame.kind(), "ignoring frame from node");
                    }
                    Ok(None) => break,
                    Err(e) if e.is_transport() => {
                        tracing::debug!(endpoint = %endpoint, error = %e, "node connection failed");
                        break;
                    }
                    Err(_) => {}
                }
            }
            tracing::debug!(endpoint = %endpoint, "node connection closed");
        });
    }
}

fn bind_ingest(config: &RelayConfig) -> Result<UdpSocket, RelayError> {
    let unspecified = SocketAddr::from(([0, 0, 0, 0], config.ingest_port));
    let group = net::parse_ipv4(&config.ingest_host).map_err(|source| RelayError::Bind {
        addr: unspecified,
        source,
    })?;
    let interface = net::parse_ipv4(&config.interface).map_err(|source| RelayError::JoinGroup {
        group: config.ingest_host.clone(),
        source,
    })?;

    net::group_receiver(group, config.ingest_port, interface).map_err(|source| {
        if group.is_multicast() {
            RelayError::JoinGroup {
                group: format!("{group}:{}", config.ingest_port),
                source,
            }
        } else {
            RelayError::Bind {
                addr: SocketAddr::from((group, config.ingest_port)),
                source,
            }
        }
    })
}
