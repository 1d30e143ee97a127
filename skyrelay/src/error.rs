//! Error types for the skyrelay telemetry fabric.

use std::net::SocketAddr;

use thiserror::Error;

/// The main error type for all skyrelay operations.
///
/// Each component has its own error enum; this type aggregates them so that
/// binaries can propagate any failure with `?`.
#[derive(Error, Debug)]
pub enum SkyrelayError {
    /// A telemetry payload could not be parsed or normalized.
    #[error("malformed payload: {0}")]
    Record(#[from] RecordError),

    /// A framed channel failed.
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// The relay could not start or route.
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    /// The node could not start.
    #[error("node error: {0}")]
    Node(#[from] NodeError),

    /// An admission request failed or was rejected.
    #[error("admission error: {0}")]
    Admission(#[from] AdmissionError),

    /// Configuration could not be loaded or is invalid.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// A subscriber could not join its group.
    #[error("subscriber error: {0}")]
    Subscriber(#[from] SubscriberError),

    /// A drone could not open its socket.
    #[error("drone error: {0}")]
    Drone(#[from] DroneError),
}

/// Errors raised while parsing a raw or canonical telemetry payload.
///
/// Every variant is a flavour of the "malformed payload" condition: the
/// record is dropped and the caller carries on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// The payload was empty or only brackets and whitespace.
    #[error("empty payload")]
    Empty,

    /// None of the recognised delimiters appear in the payload.
    #[error("no recognised delimiter in '{payload}'")]
    UnknownDelimiter {
        /// The offending payload.
        payload: String,
    },

    /// More than one candidate delimiter appears and no region was given to
    /// disambiguate.
    #[error("ambiguous delimiters {found:?} in '{payload}'")]
    AmbiguousDelimiter {
        /// The delimiters found, in priority order.
        found: Vec<char>,
        /// The offending payload.
        payload: String,
    },

    /// Splitting did not yield exactly four fields.
    #[error("expected 4 fields split on '{delimiter}', got {count} in '{payload}'")]
    FieldCount {
        /// The delimiter used for the split.
        delimiter: char,
        /// The number of fields produced.
        count: usize,
        /// The offending payload.
        payload: String,
    },

    /// A field is not a finite number.
    #[error("field {index} ('{field}') is not a finite number")]
    InvalidNumber {
        /// Zero-based field position.
        index: usize,
        /// The field text.
        field: String,
    },

    /// The payload does not follow the wire scheme of the region it was
    /// tagged with.
    #[error("payload '{payload}' does not match the {region} wire format")]
    RegionMismatch {
        /// The region the payload claimed to come from.
        region: String,
        /// The offending payload.
        payload: String,
    },

    /// A canonical string is not of the form `[t//h//p//r]`.
    #[error("invalid canonical record '{0}'")]
    InvalidCanonical(String),

    /// A region name is not one of the four known regions.
    #[error("unknown region '{0}'")]
    UnknownRegion(String),
}

/// Errors raised by a [`FramedChannel`](crate::channel::FramedChannel).
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Connecting to the peer failed or timed out.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// The peer address.
        addr: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A read or write on the stream failed.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// A message could not be serialized.
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),

    /// A frame could not be deserialized into the expected shape.
    #[error("failed to decode frame '{frame}': {source}")]
    Decode {
        /// The raw frame text.
        frame: String,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A frame exceeded the maximum length before its newline arrived.
    #[error("frame exceeds {limit} bytes")]
    FrameTooLong {
        /// The configured limit.
        limit: usize,
    },

    /// The channel has been closed locally.
    #[error("channel is closed")]
    Closed,
}

impl ChannelError {
    /// Returns true when the error means the connection is unusable and
    /// should be reconnected, as opposed to a single bad frame.
    pub fn is_transport(&self) -> bool {
        !matches!(self, ChannelError::Decode { .. })
    }
}

/// Errors raised by the relay.
#[derive(Error, Debug)]
pub enum RelayError {
    /// The ingest socket could not be bound.
    #[error("failed to bind ingest socket {addr}: {source}")]
    Bind {
        /// The address that could not be bound.
        addr: SocketAddr,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The ingest socket could not join its multicast group.
    #[error("failed to join ingest group {group}: {source}")]
    JoinGroup {
        /// The group address.
        group: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Every backend has been evicted; there is nowhere to route.
    #[error("routing exhausted: no backend nodes remain")]
    RoutingExhausted,

    /// The selected node failed, the single reconnect attempt failed too, and
    /// the node was evicted; the message was dropped.
    #[error("node {endpoint} unreachable, evicted: {source}")]
    Unreachable {
        /// The evicted endpoint.
        endpoint: String,
        /// The failure of the reconnect attempt.
        #[source]
        source: ChannelError,
    },

    /// A datagram did not contain a routed message.
    #[error("failed to decode datagram: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Errors raised by a node.
#[derive(Error, Debug)]
pub enum NodeError {
    /// The listening socket could not be bound.
    #[error("failed to bind node listener {addr}: {source}")]
    Bind {
        /// The address that could not be bound.
        addr: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The multicast publisher socket could not be created.
    #[error("failed to open multicast publisher: {0}")]
    Publisher(#[source] std::io::Error),
}

/// Errors raised by the admission service and its client helper.
#[derive(Error, Debug)]
pub enum AdmissionError {
    /// The listening socket could not be bound.
    #[error("failed to bind admission listener {addr}: {source}")]
    Bind {
        /// The address that could not be bound.
        addr: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The request was invalid and no assignment was issued.
    #[error("admission rejected: {reason}")]
    Rejected {
        /// Why the request was rejected.
        reason: String,
    },

    /// The admission service has no groups to hand out.
    #[error("no delivery groups configured")]
    NoGroups,

    /// The exchange with the admission service failed.
    #[error("admission exchange failed: {0}")]
    Channel(#[from] ChannelError),
}

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config '{}': {source}", path.display())]
    Read {
        /// The config file path.
        path: std::path::PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid JSON for the expected shape.
    #[error("failed to parse config '{}': {source}", path.display())]
    Parse {
        /// The config file path.
        path: std::path::PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A value is out of range or inconsistent.
    #[error("invalid config: {reason}")]
    Invalid {
        /// Description of what is invalid.
        reason: String,
    },
}

/// Errors raised by a subscriber.
#[derive(Error, Debug)]
pub enum SubscriberError {
    /// Obtaining an assignment failed.
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    /// The assigned group could not be joined.
    #[error("failed to join group {group}: {source}")]
    JoinGroup {
        /// The group address.
        group: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Receiving from the group failed.
    #[error("receive failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by a drone simulator.
#[derive(Error, Debug)]
pub enum DroneError {
    /// The sending socket could not be opened.
    #[error("failed to open drone socket: {0}")]
    Socket(#[source] std::io::Error),

    /// The configured interval range is empty.
    #[error("invalid interval range {min_ms}ms..{max_ms}ms")]
    InvalidInterval {
        /// Lower bound in milliseconds.
        min_ms: u64,
        /// Upper bound in milliseconds.
        max_ms: u64,
    },
}

/// Type alias for `Result<T, SkyrelayError>`.
pub type Result<T> = std::result::Result<T, SkyrelayError>;
