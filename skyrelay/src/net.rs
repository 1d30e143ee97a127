//! UDP socket construction for ingest, publication and subscription.
//!
//! Group addresses may be multicast (the normal deployment) or plain unicast
//! addresses, which is handy on hosts without a multicast route: a receiver
//! bound to a unicast address simply listens there, and a publisher sends to
//! it directly.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

/// Largest datagram any component reads.
pub const MAX_DATAGRAM_LEN: usize = 64 * 1024;

/// Resolves `host` to an IPv4 address.
///
/// # Errors
///
/// Returns `InvalidInput` if `host` is not a literal IPv4 address.
pub fn parse_ipv4(host: &str) -> io::Result<Ipv4Addr> {
    host.trim().parse::<Ipv4Addr>().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("'{host}' is not an IPv4 address"),
        )
    })
}

/// Opens a UDP socket that receives datagrams addressed to `group:port`.
///
/// For a multicast `group` the socket binds the wildcard address with
/// `SO_REUSEADDR` (and `SO_REUSEPORT` on unix, so several local subscribers
/// can share a group) and joins the group on `interface`. For a unicast
/// address it binds that address directly.
///
/// # Errors
///
/// Returns any socket, bind or join failure.
pub fn group_receiver(group: Ipv4Addr, port: u16, interface: Ipv4Addr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;

    if group.is_multicast() {
        #[cfg(unix)]
        socket.set_reuse_port(true)?;

        let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
        socket.bind(&bind_addr.into())?;
        socket.join_multicast_v4(&group, &interface)?;
    } else {
        let bind_addr = SocketAddr::V4(SocketAddrV4::new(group, port));
        socket.bind(&bind_addr.into())?;
    }

    socket.set_nonblocking(true)?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

/// Opens an unbound-port UDP socket for sending to multicast groups.
///
/// Loopback is enabled so that subscribers on the same host receive what is
/// published.
///
/// # Errors
///
/// Returns any socket or bind failure.
pub fn publisher(ttl: u32) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
    socket.bind(&bind_addr.into())?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_multicast_ttl_v4(ttl)?;

    socket.set_nonblocking(true)?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

/// Builds the destination address for a group.
///
/// # Errors
///
/// Returns `InvalidInput` if `host` is not an IPv4 literal.
pub fn group_addr(host: &str, port: u16) -> io::Result<SocketAddr> {
    Ok(SocketAddr::new(IpAddr::V4(parse_ipv4(host)?), port))
}
