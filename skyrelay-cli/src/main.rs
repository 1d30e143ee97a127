//! CLI for the skyrelay telemetry fabric.
//!
//! Runs each component on its own (relay, node, admission, drones,
//! subscriber), a whole fabric in one process, or normalizes a single
//! payload.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use skyrelay::config::ClusterConfig;
use skyrelay::drone;
use skyrelay::net;
use skyrelay::{
    AdmissionService, Node, NodeEndpoint, Region, Relay, RoutingPolicy, Store, Subscriber,
};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

type CliResult = Result<(), Box<dyn std::error::Error>>;

/// skyrelay: drone telemetry relay, normalizer and fan-out.
#[derive(Parser)]
#[command(name = "skyrelay", version, about)]
struct Cli {
    /// JSON config file; built-in defaults are used when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. "info" or "skyrelay=debug". RUST_LOG takes precedence.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Receive drone datagrams and route them to backend nodes.
    Relay {
        /// Ingest address; a multicast address is joined.
        #[arg(long)]
        ingest_host: Option<String>,

        /// Ingest UDP port.
        #[arg(long)]
        ingest_port: Option<u16>,

        /// Backend node as host:port; repeat for several nodes.
        #[arg(long = "node", value_parser = parse_endpoint)]
        nodes: Vec<NodeEndpoint>,

        /// Routing policy: hash, round-robin or random.
        #[arg(long)]
        policy: Option<RoutingPolicy>,

        /// Bound on concurrently dispatched datagrams.
        #[arg(long)]
        max_in_flight: Option<usize>,
    },

    /// Accept relay connections, normalize, store and publish.
    Node {
        /// Which configured node to run (0-based).
        #[arg(long, default_value = "0")]
        index: usize,

        /// Listen port.
        #[arg(long)]
        port: Option<u16>,

        /// Delivery group address.
        #[arg(long)]
        group_host: Option<String>,

        /// Delivery group port.
        #[arg(long)]
        group_port: Option<u16>,
    },

    /// Hand out delivery groups to subscribers.
    Admission {
        /// Listen port.
        #[arg(long)]
        port: Option<u16>,
    },

    /// Fly simulated drones that send readings to the relay.
    Drone {
        /// Relay ingest address.
        #[arg(long)]
        target_host: Option<String>,

        /// Relay ingest port.
        #[arg(long)]
        target_port: Option<u16>,

        /// Region to fly; repeat for several drones. Defaults to all four.
        #[arg(long = "region")]
        regions: Vec<Region>,

        /// Shortest pause between readings, in milliseconds.
        #[arg(long)]
        min_interval_ms: Option<u64>,

        /// Longest pause between readings, in milliseconds.
        #[arg(long)]
        max_interval_ms: Option<u64>,
    },

    /// Ask admission for a group and print the readings published to it.
    Subscribe {
        /// Admission service address.
        #[arg(long, default_value = "127.0.0.1:50000")]
        admission: String,

        /// Subscriber identity.
        #[arg(long, default_value = "subscriber")]
        identity: String,

        /// Assignment policy: hash or round-robin.
        #[arg(long, default_value = "hash")]
        policy: String,

        /// Interface used to join the group.
        #[arg(long, default_value = "0.0.0.0")]
        interface: Ipv4Addr,
    },

    /// Run nodes, relay, admission and drones in one process, then print the
    /// stores.
    Simulate {
        /// How long to run, in seconds.
        #[arg(long, default_value = "10")]
        duration: u64,

        /// Use unicast loopback addresses instead of multicast groups.
        #[arg(long)]
        loopback: bool,
    },

    /// Print the effective configuration as JSON.
    Config,

    /// Normalize one raw payload and print its canonical form.
    Normalize {
        /// Raw payload, e.g. "(1010.00;500.00;15.00;70.00)".
        payload: String,

        /// Region the payload came from; detected from the delimiter if omitted.
        #[arg(long)]
        region: Option<Region>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli.log_level) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }

    let result = match load_config(cli.config.as_ref()) {
        Ok(config) => run(cli.command, config).await,
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_logging(level: &str) -> CliResult {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| format!("invalid log level '{level}': {e}"))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<ClusterConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(ClusterConfig::load(path)?),
        None => Ok(ClusterConfig::default()),
    }
}

async fn run(command: Commands, config: ClusterConfig) -> CliResult {
    match command {
        Commands::Relay {
            ingest_host,
            ingest_port,
            nodes,
            policy,
            max_in_flight,
        } => {
            let mut relay = config.relay;
            if let Some(host) = ingest_host {
                relay.ingest_host = host;
            }
            if let Some(port) = ingest_port {
                relay.ingest_port = port;
            }
            if !nodes.is_empty() {
                relay.nodes = nodes;
            }
            if let Some(policy) = policy {
                relay.policy = policy;
            }
            if max_in_flight.is_some() {
                relay.max_in_flight = max_in_flight;
            }
            relay.validate()?;
            Ok(cmd_relay(relay).await?)
        }
        Commands::Node {
            index,
            port,
            group_host,
            group_port,
        } => {
            let mut node = config
                .nodes
                .get(index)
                .cloned()
                .ok_or_else(|| format!("no node at index {index} in config"))?;
            if let Some(port) = port {
                node.port = port;
            }
            if let Some(host) = group_host {
                node.group_host = host;
            }
            if let Some(port) = group_port {
                node.group_port = port;
            }
            node.validate()?;
            Ok(cmd_node(node).await?)
        }
        Commands::Admission { port } => {
            let mut admission = config.admission;
            if let Some(port) = port {
                admission.port = port;
            }
            admission.validate()?;
            Ok(cmd_admission(admission).await?)
        }
        Commands::Drone {
            target_host,
            target_port,
            regions,
            min_interval_ms,
            max_interval_ms,
        } => {
            let mut drone = config.drone;
            if let Some(host) = target_host {
                drone.target_host = host;
            }
            if let Some(port) = target_port {
                drone.target_port = port;
            }
            if !regions.is_empty() {
                drone.regions = regions;
            }
            if let Some(ms) = min_interval_ms {
                drone.min_interval_ms = ms;
            }
            if let Some(ms) = max_interval_ms {
                drone.max_interval_ms = ms;
            }
            drone.validate()?;
            Ok(cmd_drone(drone).await?)
        }
        Commands::Subscribe {
            admission,
            identity,
            policy,
            interface,
        } => Ok(cmd_subscribe(&admission, &identity, &policy, interface).await?),
        Commands::Simulate { duration, loopback } => {
            cmd_simulate(config, Duration::from_secs(duration), loopback).await
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Normalize { payload, region } => Ok(cmd_normalize(&payload, region)?),
    }
}

/// Implements `skyrelay relay`.
async fn cmd_relay(config: skyrelay::RelayConfig) -> skyrelay::Result<()> {
    let cancel = shutdown_token();
    let relay = Relay::bind(config).await?;
    relay.run(cancel).await;
    Ok(())
}

/// Implements `skyrelay node`.
async fn cmd_node(config: skyrelay::NodeConfig) -> skyrelay::Result<()> {
    let cancel = shutdown_token();
    let node = Node::bind(config).await?;
    let store = node.store();
    node.run(cancel).await;
    print_store("node", &store);
    Ok(())
}

/// Implements `skyrelay admission`.
async fn cmd_admission(config: skyrelay::AdmissionConfig) -> skyrelay::Result<()> {
    let cancel = shutdown_token();
    let service = AdmissionService::bind(config).await?;
    service.run(cancel).await;
    Ok(())
}

/// Implements `skyrelay drone`.
async fn cmd_drone(config: skyrelay::DroneConfig) -> skyrelay::Result<()> {
    let cancel = shutdown_token();
    let tracker = TaskTracker::new();
    drone::launch_fleet(&config, &tracker, &cancel)?;
    tracker.close();
    tracker.wait().await;
    Ok(())
}

/// Implements `skyrelay subscribe`.
async fn cmd_subscribe(admission: &str, identity: &str, policy: &str, interface: Ipv4Addr) -> skyrelay::Result<()> {
    let cancel = shutdown_token();
    let subscriber = Subscriber::join(admission, identity, policy, interface).await?;
    println!("Joined {}", subscriber.group());

    subscriber
        .run(cancel, |reading| {
            println!(
                "temperature={:.2} humidity={:.2} pressure={:.2} radiation={:.2}",
                reading.temperature, reading.humidity, reading.pressure, reading.radiation
            );
        })
        .await?;
    Ok(())
}

/// Implements `skyrelay simulate`.
async fn cmd_simulate(mut config: ClusterConfig, duration: Duration, loopback: bool) -> CliResult {
    if loopback {
        config.relay.ingest_host = "127.0.0.1".to_string();
        config.drone.target_host = "127.0.0.1".to_string();
        for node in &mut config.nodes {
            node.group_host = "127.0.0.1".to_string();
        }
        config.admission.groups = config.nodes.iter().map(|node| node.group()).collect();
    }
    config.relay.nodes = config
        .nodes
        .iter()
        .map(|node| NodeEndpoint::new("127.0.0.1", node.port))
        .collect();
    config.validate()?;

    let cancel = shutdown_token();
    let tracker = TaskTracker::new();

    let mut stores: Vec<(String, Arc<Store>)> = Vec::new();
    for node_config in config.nodes.clone() {
        let node = Node::bind(node_config).await?;
        stores.push((node.local_addr()?.to_string(), node.store()));
        tracker.spawn(node.run(cancel.clone()));
    }

    let admission = AdmissionService::bind(config.admission.clone()).await?;
    tracker.spawn(admission.run(cancel.clone()));

    let relay = Relay::bind(config.relay.clone()).await?;
    tracker.spawn(relay.run(cancel.clone()));

    let target = net::group_addr(&config.drone.target_host, config.drone.target_port)?;
    let count = drone::launch_fleet(&config.drone, &tracker, &cancel)?;
    println!("Simulating {count} drones against {target} for {}s", duration.as_secs());

    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(duration) => cancel.cancel(),
    }
    tracker.close();
    tracker.wait().await;

    for (name, store) in &stores {
        print_store(name, store);
    }
    Ok(())
}

/// Implements `skyrelay normalize`.
fn cmd_normalize(payload: &str, region: Option<Region>) -> skyrelay::Result<()> {
    let canonical = match region {
        Some(region) => skyrelay::normalize_for(region, payload)?,
        None => skyrelay::normalize(payload)?,
    };
    println!("{canonical}");
    Ok(())
}

fn print_store(name: &str, store: &Store) {
    println!("Store {name}: {} records", store.len());
    for (key, values) in store.read_everything() {
        println!("  {key} ({})", values.len());
        for value in values {
            println!("    {value}");
        }
    }
}

/// A token cancelled on Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("shutdown requested"),
            Err(e) => tracing::warn!(error = %e, "failed to listen for Ctrl-C"),
        }
        trigger.cancel();
    });
    cancel
}

/// Parses `host:port` into a node endpoint.
fn parse_endpoint(s: &str) -> Result<NodeEndpoint, String> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| format!("'{s}' is not host:port"))?;
    let port = port
        .parse::<u16>()
        .map_err(|e| format!("invalid port in '{s}': {e}"))?;
    if host.is_empty() {
        return Err(format!("missing host in '{s}'"));
    }
    Ok(NodeEndpoint::new(host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(
            parse_endpoint("127.0.0.1:50001").unwrap(),
            NodeEndpoint::new("127.0.0.1", 50001)
        );
        assert!(parse_endpoint("127.0.0.1").is_err());
        assert!(parse_endpoint(":50001").is_err());
        assert!(parse_endpoint("host:99999").is_err());
    }

    #[test]
    fn test_cli_parses_relay_flags() {
        let cli = Cli::try_parse_from([
            "skyrelay",
            "relay",
            "--node",
            "127.0.0.1:6001",
            "--node",
            "127.0.0.1:6002",
            "--policy",
            "round-robin",
        ])
        .unwrap();

        match cli.command {
            Commands::Relay { nodes, policy, .. } => {
                assert_eq!(nodes.len(), 2);
                assert_eq!(policy, Some(RoutingPolicy::RoundRobin));
            }
            _ => panic!("expected relay command"),
        }
    }

    #[test]
    fn test_normalize_errors_surface_as_record_errors() {
        assert!(cmd_normalize("(1;2;3;4)", Some(Region::Sul)).is_ok());
        assert!(matches!(
            cmd_normalize("1;2;3;4", Some(Region::Sul)),
            Err(skyrelay::SkyrelayError::Record(_))
        ));
        assert!(matches!(
            cmd_normalize("1|2|3|4", None),
            Err(skyrelay::SkyrelayError::Record(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_relay_nodes_fail_before_binding() {
        let cli = Cli::try_parse_from([
            "skyrelay",
            "relay",
            "--node",
            "127.0.0.1:6001",
            "--node",
            "127.0.0.1:6001",
        ])
        .unwrap();

        let err = run(cli.command, ClusterConfig::default()).await.unwrap_err();
        assert!(err.to_string().contains("duplicate relay node"));
    }
}
