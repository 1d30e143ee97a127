//! Message shapes exchanged between drones, the relay, nodes, the admission
//! service and subscribers.
//!
//! Stream connections carry [`Frame`]s: one JSON object per line, tagged with
//! its kind so a receiver never has to guess what it is decoding:
//!
//! ```text
//! {"kind":"routed","body":{"source_id":"Sul","payload":"(1010.00;500.00;15.00;70.00)"}}
//! {"kind":"admission_request","body":{"identity":"user-7","policy":"hash"}}
//! {"kind":"assignment","body":{"host":"225.7.8.9","port":50004}}
//! ```
//!
//! Ingest datagrams carry a bare [`RoutedMessage`] object.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// A raw telemetry payload tagged with the identity of the drone that sent it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutedMessage {
    /// Drone or region identity; the routing key.
    pub source_id: String,
    /// Raw region-specific wire string.
    pub payload: String,
}

impl RoutedMessage {
    /// Creates a routed message.
    pub fn new(source_id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            payload: payload.into(),
        }
    }

    /// Serializes the message into an ingest datagram.
    pub fn to_datagram(&self) -> Vec<u8> {
        // A struct of two strings always serializes.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Decodes an ingest datagram.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Decode`] if the bytes are not a routed message.
    pub fn from_datagram(bytes: &[u8]) -> Result<Self, RelayError> {
        serde_json::from_slice(bytes).map_err(RelayError::Decode)
    }
}

/// A subscriber's request for a delivery group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionRequest {
    /// Subscriber identity; the hashing key.
    pub identity: String,
    /// Policy selector, e.g. `"hash"` or `"round-robin"`.
    pub policy: String,
}

/// The multicast group a subscriber should join.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupAssignment {
    /// Group address.
    pub host: String,
    /// Group port.
    pub port: u16,
}

impl GroupAssignment {
    /// Creates an assignment.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for GroupAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A backend node address as known to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeEndpoint {
    /// Host name or IP.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl NodeEndpoint {
    /// Creates an endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port`, suitable for `TcpStream::connect`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl From<SocketAddr> for NodeEndpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for NodeEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A message on a framed stream connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Frame {
    /// Relay to node: one telemetry message.
    Routed(RoutedMessage),
    /// Subscriber to admission: request a group.
    AdmissionRequest(AdmissionRequest),
    /// Admission to subscriber: the assigned group.
    Assignment(GroupAssignment),
}

impl Frame {
    /// Short name of the frame kind, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Routed(_) => "routed",
            Frame::AdmissionRequest(_) => "admission_request",
            Frame::Assignment(_) => "assignment",
        }
    }
}
