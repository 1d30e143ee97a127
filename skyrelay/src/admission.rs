//! Admission: tells a subscriber which delivery group to join.
//!
//! A subscriber connects, sends one [`Frame::AdmissionRequest`] and gets one
//! [`Frame::Assignment`] back before the service closes the connection. A
//! request with an unknown policy, an empty identity, or that never arrives
//! is logged and the connection closed without a reply.
//!
//! ```rust,no_run
//! use skyrelay::admission::request_assignment;
//!
//! # async fn example() -> Result<(), skyrelay::error::AdmissionError> {
//! let group = request_assignment("127.0.0.1:50000", "station-3", "hash").await?;
//! println!("join {group}");
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::channel::{DEFAULT_CONNECT_TIMEOUT, FramedChannel};
use crate::config::AdmissionConfig;
use crate::error::AdmissionError;
use crate::policy::{RoutingPolicy, Selector};
use crate::protocol::{AdmissionRequest, Frame, GroupAssignment};

/// How long the service waits for a request after accepting.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Chooses groups for admission requests.
#[derive(Debug)]
pub struct Assigner {
    groups: Vec<GroupAssignment>,
    selector: Selector,
}

impl Assigner {
    /// Creates an assigner over `groups`.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::NoGroups`] if `groups` is empty.
    pub fn new(groups: Vec<GroupAssignment>) -> Result<Self, AdmissionError> {
        if groups.is_empty() {
            return Err(AdmissionError::NoGroups);
        }
        Ok(Self {
            groups,
            selector: Selector::new(),
        })
    }

    /// Groups handed out, in order.
    pub fn groups(&self) -> &[GroupAssignment] {
        &self.groups
    }

    /// Picks the group for `request`.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::Rejected`] for an empty identity or a
    /// policy other than `hash` or `round-robin`.
    pub fn assign(&self, request: &AdmissionRequest) -> Result<GroupAssignment, AdmissionError> {
        if request.identity.trim().is_empty() {
            return Err(AdmissionError::Rejected {
                reason: "empty identity".to_string(),
            });
        }

        let policy = match request.policy.as_str() {
            "hash" => RoutingPolicy::Hash,
            "round-robin" => RoutingPolicy::RoundRobin,
            other => {
                return Err(AdmissionError::Rejected {
                    reason: format!("unsupported policy '{other}', expected 'hash' or 'round-robin'"),
                });
            }
        };

        let index = self
            .selector
            .select(policy, &request.identity, self.groups.len())
            .ok_or(AdmissionError::NoGroups)?;
        Ok(self.groups[index].clone())
    }
}

/// A bound admission service.
#[derive(Debug)]
pub struct AdmissionService {
    listener: TcpListener,
    assigner: Arc<Assigner>,
}

impl AdmissionService {
    /// Binds the listener.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::NoGroups`] if no groups are configured or
    /// [`AdmissionError::Bind`] if the listener cannot be bound.
    pub async fn bind(config: AdmissionConfig) -> Result<Self, AdmissionError> {
        let assigner = Arc::new(Assigner::new(config.groups.clone())?);

        let bind_addr = config.bind_address();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|source| AdmissionError::Bind {
                addr: bind_addr.clone(),
                source,
            })?;

        tracing::info!(
            address = %bind_addr,
            groups = assigner.groups().len(),
            "admission listening"
        );

        Ok(Self { listener, assigner })
    }

    /// Address the listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns the underlying socket error.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves requests until `cancel` fires, then waits for open exchanges.
    pub async fn run(self, cancel: CancellationToken) {
        let tracker = TaskTracker::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let assigner = Arc::clone(&self.assigner);
                        tracker.spawn(async move {
                            let channel = FramedChannel::new(stream);
                            match serve(&assigner, &channel).await {
                                Ok(group) => {
                                    tracing::info!(peer = %peer, group = %group, "subscriber admitted");
                                }
                                Err(e) => {
                                    tracing::warn!(peer = %peer, error = %e, "admission rejected");
                                }
                            }
                            channel.close().await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept error");
                    }
                },
            }
        }

        tracker.close();
        tracker.wait().await;
        tracing::info!("admission stopped");
    }
}

async fn serve(assigner: &Assigner, channel: &FramedChannel) -> Result<GroupAssignment, AdmissionError> {
    let request = match timeout(REQUEST_TIMEOUT, channel.receive::<Frame>()).await {
        Err(_) => {
            return Err(AdmissionError::Rejected {
                reason: "no request before timeout".to_string(),
            });
        }
        Ok(received) => match received? {
            Some(Frame::AdmissionRequest(request)) => request,
            Some(other) => {
                return Err(AdmissionError::Rejected {
                    reason: format!("expected an admission request, got '{}'", other.kind()),
                });
            }
            None => {
                return Err(AdmissionError::Rejected {
                    reason: "connection closed before a request arrived".to_string(),
                });
            }
        },
    };

    let group = assigner.assign(&request)?;
    channel.send(&Frame::Assignment(group.clone())).await?;
    Ok(group)
}

/// Asks the admission service at `addr` for a group.
///
/// # Errors
///
/// Returns [`AdmissionError::Channel`] if the exchange fails, or
/// [`AdmissionError::Rejected`] if the service closes without answering.
pub async fn request_assignment(
    addr: &str,
    identity: &str,
    policy: &str,
) -> Result<GroupAssignment, AdmissionError> {
    let channel = FramedChannel::connect(addr, DEFAULT_CONNECT_TIMEOUT).await?;
    let request = Frame::AdmissionRequest(AdmissionRequest {
        identity: identity.to_string(),
        policy: policy.to_string(),
    });
    channel.send(&request).await?;

    let reply = channel.receive::<Frame>().await;
    channel.close().await;

    match reply? {
        Some(Frame::Assignment(group)) => Ok(group),
        Some(other) => Err(AdmissionError::Rejected {
            reason: format!("unexpected reply '{}'", other.kind()),
        }),
        None => Err(AdmissionError::Rejected {
            reason: "service closed the connection without an assignment".to_string(),
        }),
    }
}
