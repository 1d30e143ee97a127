//! Configuration for every skyrelay component.
//!
//! Each component has its own config struct with defaults matching the
//! reference deployment. [`ClusterConfig`] bundles them for running a whole
//! fabric from one JSON file:
//!
//! ```json
//! {
//!   "relay": { "ingest_host": "230.0.0.1", "ingest_port": 49999, "policy": "round-robin" },
//!   "nodes": [
//!     { "port": 50001, "group_host": "225.7.8.9", "group_port": 50004 },
//!     { "port": 50002, "group_host": "225.7.8.10", "group_port": 50005 }
//!   ],
//!   "admission": { "port": 50000 }
//! }
//! ```
//!
//! Missing fields take their defaults. Durations are given in milliseconds.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::DEFAULT_MAX_FRAME_LEN;
use crate::error::ConfigError;
use crate::net::parse_ipv4;
use crate::policy::RoutingPolicy;
use crate::protocol::{GroupAssignment, NodeEndpoint};
use crate::record::Region;

/// Default ingest group the drones publish to.
pub const DEFAULT_INGEST_GROUP: &str = "230.0.0.1";
/// Default ingest port.
pub const DEFAULT_INGEST_PORT: u16 = 49999;
/// Default admission port.
pub const DEFAULT_ADMISSION_PORT: u16 = 50000;
/// Default port of the first node; further nodes count up from here.
pub const DEFAULT_NODE_PORT: u16 = 50001;
/// Default delivery group of the first node.
pub const DEFAULT_NODE_GROUP: &str = "225.7.8.9";
/// Default delivery port of the first node.
pub const DEFAULT_NODE_GROUP_PORT: u16 = 50004;

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        reason: reason.into(),
    }
}

/// Relay configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address the ingest socket receives on; a multicast address is joined.
    pub ingest_host: String,
    /// Ingest UDP port.
    pub ingest_port: u16,
    /// Local interface used to join a multicast ingest group.
    pub interface: String,
    /// Backend nodes, in routing order.
    pub nodes: Vec<NodeEndpoint>,
    /// How a node is chosen for each message.
    pub policy: RoutingPolicy,
    /// Timeout for each connect and reconnect attempt.
    pub connect_timeout_ms: u64,
    /// Upper bound on concurrently dispatched datagrams; unbounded if unset.
    pub max_in_flight: Option<usize>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ingest_host: DEFAULT_INGEST_GROUP.to_string(),
            ingest_port: DEFAULT_INGEST_PORT,
            interface: "0.0.0.0".to_string(),
            nodes: vec![
                NodeEndpoint::new("127.0.0.1", DEFAULT_NODE_PORT),
                NodeEndpoint::new("127.0.0.1", DEFAULT_NODE_PORT + 1),
            ],
            policy: RoutingPolicy::Hash,
            connect_timeout_ms: 2000,
            max_in_flight: None,
        }
    }
}

impl RelayConfig {
    /// Connect timeout as a `Duration`.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Checks the config for values that cannot work.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_ipv4(&self.ingest_host).map_err(|e| invalid(format!("relay ingest_host: {e}")))?;
        parse_ipv4(&self.interface).map_err(|e| invalid(format!("relay interface: {e}")))?;
        if self.nodes.is_empty() {
            return Err(invalid("relay needs at least one node endpoint"));
        }
        let mut seen = HashSet::new();
        for endpoint in &self.nodes {
            if !seen.insert(endpoint) {
                return Err(invalid(format!("duplicate relay node {endpoint}")));
            }
        }
        if self.connect_timeout_ms == 0 {
            return Err(invalid("relay connect_timeout_ms must be > 0"));
        }
        if self.max_in_flight == Some(0) {
            return Err(invalid("relay max_in_flight must be > 0 when set"));
        }
        Ok(())
    }
}

/// Node configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Listen address for relay connections.
    pub host: String,
    /// Listen port for relay connections.
    pub port: u16,
    /// Group that normalized records are published to.
    pub group_host: String,
    /// Group port.
    pub group_port: u16,
    /// Multicast TTL of published datagrams.
    pub multicast_ttl: u32,
    /// Largest accepted frame from the relay.
    pub max_frame_len: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_NODE_PORT,
            group_host: DEFAULT_NODE_GROUP.to_string(),
            group_port: DEFAULT_NODE_GROUP_PORT,
            multicast_ttl: 1,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl NodeConfig {
    /// `host:port` of the listener.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The delivery group as handed out by admission.
    pub fn group(&self) -> GroupAssignment {
        GroupAssignment::new(self.group_host.clone(), self.group_port)
    }

    /// Checks the config for values that cannot work.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_ipv4(&self.group_host).map_err(|e| invalid(format!("node group_host: {e}")))?;
        if self.group_port == 0 {
            return Err(invalid("node group_port must be > 0"));
        }
        if self.max_frame_len == 0 {
            return Err(invalid("node max_frame_len must be > 0"));
        }
        Ok(())
    }
}

/// Admission service configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Listen address.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Delivery groups handed out to subscribers.
    pub groups: Vec<GroupAssignment>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_ADMISSION_PORT,
            groups: vec![
                GroupAssignment::new(DEFAULT_NODE_GROUP, DEFAULT_NODE_GROUP_PORT),
                GroupAssignment::new("225.7.8.10", DEFAULT_NODE_GROUP_PORT + 1),
            ],
        }
    }
}

impl AdmissionConfig {
    /// `host:port` of the listener.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Checks the config for values that cannot work.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.groups.is_empty() {
            return Err(invalid("admission needs at least one group"));
        }
        for group in &self.groups {
            parse_ipv4(&group.host).map_err(|e| invalid(format!("admission group: {e}")))?;
        }
        Ok(())
    }
}

/// Drone simulator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DroneConfig {
    /// Relay ingest address the drones send to.
    pub target_host: String,
    /// Relay ingest port.
    pub target_port: u16,
    /// Regions to fly; one drone per region.
    pub regions: Vec<Region>,
    /// Shortest pause between two readings.
    pub min_interval_ms: u64,
    /// Longest pause between two readings.
    pub max_interval_ms: u64,
}

impl Default for DroneConfig {
    fn default() -> Self {
        Self {
            target_host: DEFAULT_INGEST_GROUP.to_string(),
            target_port: DEFAULT_INGEST_PORT,
            regions: Region::ALL.to_vec(),
            min_interval_ms: 2000,
            max_interval_ms: 5000,
        }
    }
}

impl DroneConfig {
    /// Checks the config for values that cannot work.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_ipv4(&self.target_host).map_err(|e| invalid(format!("drone target_host: {e}")))?;
        if self.regions.is_empty() {
            return Err(invalid("drone needs at least one region"));
        }
        if self.min_interval_ms > self.max_interval_ms {
            return Err(invalid(format!(
                "drone min_interval_ms ({}) exceeds max_interval_ms ({})",
                self.min_interval_ms, self.max_interval_ms
            )));
        }
        Ok(())
    }
}

/// Configuration of a whole fabric: one relay, its nodes, admission and the
/// drone fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Relay settings.
    pub relay: RelayConfig,
    /// One entry per node.
    pub nodes: Vec<NodeConfig>,
    /// Admission settings.
    pub admission: AdmissionConfig,
    /// Drone fleet settings.
    pub drone: DroneConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let nodes = vec![
            NodeConfig::default(),
            NodeConfig {
                port: DEFAULT_NODE_PORT + 1,
                group_host: "225.7.8.10".to_string(),
                group_port: DEFAULT_NODE_GROUP_PORT + 1,
                ..NodeConfig::default()
            },
        ];

        Self {
            relay: RelayConfig::default(),
            nodes,
            admission: AdmissionConfig::default(),
            drone: DroneConfig::default(),
        }
    }
}

impl ClusterConfig {
    /// Loads and validates a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`], [`ConfigError::Parse`] or
    /// [`ConfigError::Invalid`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: ClusterConfig =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Validates every section and the consistency between them.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.relay.validate()?;
        self.admission.validate()?;
        self.drone.validate()?;

        if self.nodes.is_empty() {
            return Err(invalid("cluster needs at least one node"));
        }

        let mut ports = HashSet::new();
        for node in &self.nodes {
            node.validate()?;
            if !ports.insert(node.port) {
                return Err(invalid(format!("duplicate node port {}", node.port)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ClusterConfig::default();
        config.validate().unwrap();

        assert_eq!(config.relay.ingest_port, 49999);
        assert_eq!(config.relay.nodes.len(), 2);
        assert_eq!(config.nodes[0].group(), GroupAssignment::new("225.7.8.9", 50004));
        assert_eq!(config.admission.port, 50000);
        assert_eq!(config.drone.regions.len(), 4);
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "relay": {{ "policy": "round-robin", "max_in_flight": 64 }},
                "nodes": [{{ "port": 6001 }}],
                "drone": {{ "regions": ["Sul", "Oeste"], "min_interval_ms": 10, "max_interval_ms": 20 }}
            }}"#
        )
        .unwrap();

        let config = ClusterConfig::load(file.path()).unwrap();
        assert_eq!(config.relay.policy, RoutingPolicy::RoundRobin);
        assert_eq!(config.relay.max_in_flight, Some(64));
        assert_eq!(config.relay.ingest_port, DEFAULT_INGEST_PORT);
        assert_eq!(config.nodes.len(), 1);
        assert_eq!(config.nodes[0].port, 6001);
        assert_eq!(config.nodes[0].group_port, DEFAULT_NODE_GROUP_PORT);
        assert_eq!(config.drone.regions, vec![Region::Sul, Region::Oeste]);
    }

    #[test]
    fn test_load_errors() {
        let missing = ClusterConfig::load("/nonexistent/skyrelay.json");
        assert!(matches!(missing, Err(ConfigError::Read { .. })));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            ClusterConfig::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_duplicate_relay_nodes_rejected() {
        let mut config = RelayConfig::default();
        config.nodes = vec![
            NodeEndpoint::new("127.0.0.1", 6000),
            NodeEndpoint::new("127.0.0.1", 6001),
            NodeEndpoint::new("127.0.0.1", 6000),
        ];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate relay node 127.0.0.1:6000"));
    }

    #[test]
    fn test_validation_failures() {
        let mut config = ClusterConfig::default();
        config.relay.nodes.clear();
        assert!(config.validate().is_err());

        let mut config = ClusterConfig::default();
        config.nodes[1].port = config.nodes[0].port;
        assert!(config.validate().is_err());

        let mut config = ClusterConfig::default();
        config.drone.min_interval_ms = 10_000;
        assert!(config.validate().is_err());

        let mut config = ClusterConfig::default();
        config.admission.groups = vec![GroupAssignment::new("not-an-ip", 1)];
        assert!(config.validate().is_err());

        let mut config = ClusterConfig::default();
        config.relay.max_in_flight = Some(0);
        assert!(config.validate().is_err());
    }
}
