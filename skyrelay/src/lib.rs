//! # skyrelay
//!
//! Drone telemetry fabric: ingest, routing, normalization and fan-out.
//!
//! Simulated drones over four regions publish sensor readings as UDP
//! datagrams, each region in its own wire format. A relay receives them and
//! forwards each one over a persistent stream connection to one of several
//! backend nodes, chosen by a routing policy. A node normalizes the payload
//! into one canonical format, appends it to an in-memory store, and publishes
//! it to a multicast group. Subscribers ask an admission service which group
//! to join.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - One canonical record format, `[temperature//humidity//pressure//radiation]`
//! - Deterministic hash routing by default; round-robin and random on request
//! - A failing node gets one reconnect attempt, then leaves the routing table
//! - Malformed payloads are logged and dropped, never fatal
//! - Cooperative shutdown through a shared cancellation token
//!
//! ## Quick Start
//!
//! ```rust
//! use skyrelay::{Region, Store, normalize_for};
//!
//! let canonical = normalize_for(Region::Sul, "(1010.00;500.00;15.00;70.00)").unwrap();
//! assert_eq!(canonical, "[15.00//70.00//1010.00//500.00]");
//!
//! let store = Store::new();
//! store.append("Sul", canonical);
//! assert_eq!(store.read_all("Sul").len(), 1);
//! ```
//!
//! ## Architecture
//!
//! - [`Relay`]: ingest socket, routing table, reconnect-then-evict
//! - [`Node`]: framed connection handler, normalizer, store, publisher
//! - [`AdmissionService`]: hands subscribers a delivery group
//! - [`Drone`] and [`Subscriber`]: the two ends of the fabric
//!
//! ## Modules
//!
//! - [`record`]: regions, wire formats, normalization
//! - [`protocol`]: frames and datagram shapes
//! - [`channel`]: newline-delimited JSON over TCP
//! - [`store`]: append-only in-memory log
//! - [`policy`]: hash, round-robin and random selection
//! - [`net`]: UDP and multicast socket setup
//! - [`config`]: JSON configuration
//! - [`error`]: error types

pub mod admission;
pub mod channel;
pub mod config;
pub mod drone;
pub mod error;
pub mod net;
pub mod node;
pub mod policy;
pub mod protocol;
pub mod record;
pub mod relay;
pub mod store;
pub mod subscriber;

// Re-export primary API types at crate root for convenience.
pub use admission::{AdmissionService, request_assignment};
pub use channel::FramedChannel;
pub use config::{AdmissionConfig, ClusterConfig, DroneConfig, NodeConfig, RelayConfig};
pub use drone::Drone;
pub use error::{Result, SkyrelayError};
pub use node::Node;
pub use policy::RoutingPolicy;
pub use protocol::{Frame, GroupAssignment, NodeEndpoint, RoutedMessage};
pub use record::{Reading, Record, Region, normalize, normalize_for};
pub use relay::{Relay, RoutingTable};
pub use store::Store;
pub use subscriber::Subscriber;
