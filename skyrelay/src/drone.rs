//! Drone simulator.
//!
//! A drone samples a reading for its region, encodes it in the region's wire
//! format and sends it as one ingest datagram, then sleeps a random interval
//! and repeats until cancelled.

use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::time::Duration;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::DroneConfig;
use crate::error::DroneError;
use crate::net;
use crate::protocol::RoutedMessage;
use crate::record::{Record, Region};

/// Draws a record uniformly within the region's ranges, rounded to two
/// decimals.
pub fn sample<R: Rng + ?Sized>(region: Region, rng: &mut R) -> Record {
    let ranges = region.ranges();
    Record::new(
        region,
        draw(rng, &ranges.pressure),
        draw(rng, &ranges.radiation),
        draw(rng, &ranges.temperature),
        draw(rng, &ranges.humidity),
    )
}

fn draw<R: Rng + ?Sized>(rng: &mut R, range: &RangeInclusive<f64>) -> f64 {
    let value = rng.random_range(range.clone());
    (value * 100.0).round() / 100.0
}

/// One simulated drone.
#[derive(Debug)]
pub struct Drone {
    region: Region,
    socket: UdpSocket,
    target: SocketAddr,
    interval: RangeInclusive<u64>,
}

impl Drone {
    /// Opens a sending socket for a drone over `region`.
    ///
    /// # Errors
    ///
    /// Returns [`DroneError::InvalidInterval`] if `min_ms > max_ms`, or
    /// [`DroneError::Socket`] if the socket cannot be opened.
    pub fn new(
        region: Region,
        target: SocketAddr,
        min_ms: u64,
        max_ms: u64,
    ) -> Result<Self, DroneError> {
        if min_ms > max_ms {
            return Err(DroneError::InvalidInterval { min_ms, max_ms });
        }
        let socket = net::publisher(1).map_err(DroneError::Socket)?;

        Ok(Self {
            region,
            socket,
            target,
            interval: min_ms..=max_ms,
        })
    }

    /// The drone's region.
    pub fn region(&self) -> Region {
        self.region
    }

    /// Samples and sends one reading, returning what was sent.
    ///
    /// # Errors
    ///
    /// Returns the socket error if the datagram cannot be sent.
    pub async fn send_once(&self) -> std::io::Result<Record> {
        let record = sample(self.region, &mut rand::rng());
        let message = RoutedMessage::new(self.region.name(), record.encode());
        self.socket.send_to(&message.to_datagram(), self.target).await?;
        Ok(record)
    }

    /// Sends readings until `cancel` fires. Send failures are logged.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(region = %self.region, target = %self.target, "drone launched");

        loop {
            match self.send_once().await {
                Ok(record) => {
                    tracing::debug!(region = %self.region, payload = %record.encode(), "reading sent");
                }
                Err(e) => {
                    tracing::warn!(region = %self.region, target = %self.target, error = %e, "send failed");
                }
            }

            let pause = Duration::from_millis(rand::rng().random_range(self.interval.clone()));
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        tracing::info!(region = %self.region, "drone landed");
    }
}

/// Launches one drone per configured region on `tracker`.
///
/// # Errors
///
/// Returns [`DroneError`] if the target is invalid or a drone cannot be
/// created; no drone is launched in that case.
pub fn launch_fleet(
    config: &DroneConfig,
    tracker: &TaskTracker,
    cancel: &CancellationToken,
) -> Result<usize, DroneError> {
    let target =
        net::group_addr(&config.target_host, config.target_port).map_err(DroneError::Socket)?;

    let drones = config
        .regions
        .iter()
        .map(|region| Drone::new(*region, target, config.min_interval_ms, config.max_interval_ms))
        .collect::<Result<Vec<_>, _>>()?;

    let count = drones.len();
    for drone in drones {
        tracker.spawn(drone.run(cancel.clone()));
    }
    Ok(count)
}
