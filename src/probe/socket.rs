//! Raw ICMP socket plumbing shared by the echo engine and the TCP
//! traceroute listener.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

/// Create a raw ICMP(v6) socket. Requires CAP_NET_RAW or root.
pub fn create_raw_icmp_socket(ipv6: bool) -> io::Result<Socket> {
    let domain = if ipv6 { Domain::IPV6 } else { Domain::IPV4 };
    let protocol = if ipv6 {
        Protocol::ICMPV6
    } else {
        Protocol::ICMPV4
    };

    let socket = Socket::new(domain, Type::RAW, Some(protocol))?;
    socket.set_nonblocking(false)?;
    socket.set_read_timeout(Some(Duration::from_millis(100)))?;
    Ok(socket)
}

/// Bind the socket to a source address, or the unspecified address of the
/// matching family when none is given.
pub fn bind_source(socket: &Socket, src: Option<IpAddr>, ipv6: bool) -> io::Result<()> {
    let addr = match src {
        Some(ip) => SocketAddr::new(ip, 0),
        None if ipv6 => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        None => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
    };
    socket.bind(&SockAddr::from(addr))
}

/// Set the IPv4 TTL or IPv6 Hop Limit on a not-yet-connected socket.
/// socket2 hides the per-platform setsockopt argument differences.
pub fn set_hop_limit(socket: &Socket, ttl: u8, ipv6: bool) -> io::Result<()> {
    if ipv6 {
        socket.set_unicast_hops_v6(ttl as u32)
    } else {
        socket.set_ttl(ttl as u32)
    }
}

/// Send one packet to the target (port is meaningless for ICMP).
pub fn send_to(socket: &Socket, packet: &[u8], target: IpAddr) -> io::Result<usize> {
    let addr = SockAddr::from(SocketAddr::new(target, 0));
    socket.send_to(packet, &addr)
}

/// Receive one packet, returning its length and the responder address.
pub fn recv_from(socket: &Socket, buffer: &mut [u8]) -> io::Result<(usize, IpAddr)> {
    let uninit: &mut [MaybeUninit<u8>] = unsafe {
        std::slice::from_raw_parts_mut(buffer.as_mut_ptr() as *mut MaybeUninit<u8>, buffer.len())
    };
    let (len, addr) = socket.recv_from(uninit)?;
    let ip = addr
        .as_socket()
        .map(|s| s.ip())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-inet source address"))?;
    Ok((len, ip))
}

/// True for the error kinds a read deadline produces.
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
