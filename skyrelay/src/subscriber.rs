//! Subscriber: obtains a group from admission and reads normalized records
//! from it.

use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::admission::request_assignment;
use crate::error::SubscriberError;
use crate::net::{self, MAX_DATAGRAM_LEN};
use crate::protocol::GroupAssignment;
use crate::record::Reading;

/// A receiver joined to one delivery group.
#[derive(Debug)]
pub struct Subscriber {
    socket: UdpSocket,
    group: GroupAssignment,
}

impl Subscriber {
    /// Asks admission at `admission_addr` for a group and joins it.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriberError::Admission`] if no assignment is obtained or
    /// [`SubscriberError::JoinGroup`] if the group cannot be joined.
    pub async fn join(
        admission_addr: &str,
        identity: &str,
        policy: &str,
        interface: Ipv4Addr,
    ) -> Result<Self, SubscriberError> {
        let group = request_assignment(admission_addr, identity, policy).await?;
        tracing::info!(identity = %identity, group = %group, "assignment received");
        Self::open(group, interface)
    }

    /// Joins `group` directly, without asking admission.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriberError::JoinGroup`] if the group cannot be joined.
    pub fn open(group: GroupAssignment, interface: Ipv4Addr) -> Result<Self, SubscriberError> {
        let join_error = |source| SubscriberError::JoinGroup {
            group: group.to_string(),
            source,
        };
        let address = net::parse_ipv4(&group.host).map_err(join_error)?;
        let socket = net::group_receiver(address, group.port, interface).map_err(join_error)?;

        Ok(Self { socket, group })
    }

    /// The group this subscriber listens on.
    pub fn group(&self) -> &GroupAssignment {
        &self.group
    }

    /// Address the socket is bound to.
    ///
    /// # Errors
    ///
    /// Returns the underlying socket error.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Waits for the next datagram that decodes as a reading.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriberError::Io`] if the socket fails.
    pub async fn next_reading(&self) -> Result<Reading, SubscriberError> {
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        loop {
            let (len, peer) = self.socket.recv_from(&mut buf).await?;
            let text = String::from_utf8_lossy(&buf[..len]);
            match Reading::from_canonical(&text) {
                Ok(reading) => return Ok(reading),
                Err(e) => {
                    tracing::warn!(peer = %peer, datagram = %text, error = %e, "undecodable datagram skipped");
                }
            }
        }
    }

    /// Hands every reading to `on_reading` until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriberError::Io`] if the socket fails.
    pub async fn run<F>(self, cancel: CancellationToken, mut on_reading: F) -> Result<(), SubscriberError>
    where
        F: FnMut(Reading),
    {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                reading = self.next_reading() => on_reading(reading?),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_skips_undecodable_datagrams() {
        let subscriber =
            Subscriber::open(GroupAssignment::new("127.0.0.1", 0), Ipv4Addr::UNSPECIFIED).unwrap();
        let target = subscriber.local_addr().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"garbage", target).await.unwrap();
        sender
            .send_to(b"[15.00//70.00//1010.00//500.00]", target)
            .await
            .unwrap();

        let reading = subscriber.next_reading().await.unwrap();
        assert_eq!(reading.canonical(), "[15.00//70.00//1010.00//500.00]");
        assert_eq!(subscriber.group().host, "127.0.0.1");
    }

    #[test]
    fn test_open_rejects_bad_group() {
        assert!(matches!(
            Subscriber::open(GroupAssignment::new("nowhere", 1), Ipv4Addr::UNSPECIFIED),
            Err(SubscriberError::JoinGroup { .. })
        ));
    }
}
