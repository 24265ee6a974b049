//! Timed TCP connect probe and SYN-based traceroute.
//!
//! The traceroute variant fixes the TTL (or IPv6 Hop Limit) on the socket
//! before `connect` and races the SYN exchange against an ICMP Time
//! Exceeded listener: whichever answers first names the hop.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::TcpSocket;

use crate::probe::icmp::ICMP_HEADER_SIZE;
use crate::probe::socket::{
    bind_source, create_raw_icmp_socket, is_timeout, recv_from, set_hop_limit,
};
use crate::probe::{IcmpReturn, ProbeError, same_family};

const ICMPV4_TIME_EXCEEDED: u8 = 11;
const ICMPV6_TIME_EXCEEDED: u8 = 3;

/// Outcome of a timed connect.
#[derive(Debug, Clone, Default)]
pub struct TcpReturn {
    pub success: bool,
    pub dest_addr: String,
    pub dest_ip: String,
    pub dest_port: u16,
    pub src_ip: String,
    pub con_time: Duration,
}

/// Dial `ip:port` and measure the time to completion or failure. No data
/// is sent; the socket is closed right after the measurement.
pub async fn tcp_connect(
    host: &str,
    ip: IpAddr,
    src: Option<IpAddr>,
    port: u16,
    timeout: Duration,
) -> TcpReturn {
    let mut out = TcpReturn {
        dest_addr: host.to_string(),
        dest_ip: ip.to_string(),
        dest_port: port,
        src_ip: "0.0.0.0".to_string(),
        ..Default::default()
    };

    let start = Instant::now();
    let stream = tokio::time::timeout(timeout, async {
        let socket = if ip.is_ipv6() {
            TcpSocket::new_v6()?
        } else {
            TcpSocket::new_v4()?
        };
        if let Some(src_ip) = src {
            socket.bind(SocketAddr::new(src_ip, 0))?;
        }
        socket.connect(SocketAddr::new(ip, port)).await
    })
    .await;
    out.con_time = start.elapsed();

    match stream {
        Ok(Ok(stream)) => {
            out.success = true;
            if let Ok(local) = stream.local_addr() {
                out.src_ip = local.ip().to_string();
            }
        }
        Ok(Err(e)) => {
            tracing::debug!(instance = host, port, err = %e, "tcp connect failed");
        }
        Err(_) => {
            tracing::debug!(instance = host, port, "tcp connect timed out");
        }
    }

    out
}

/// One TTL-bounded SYN probe toward `ip:port`. Resolution of the race:
/// completed connect means the destination was reached; a Time Exceeded
/// names the hop that dropped the SYN; anything else is a timeout.
pub async fn tcp_traceroute(
    ip: IpAddr,
    port: u16,
    src: Option<IpAddr>,
    ttl: u8,
    timeout: Duration,
    ipv6_enabled: bool,
) -> Result<IcmpReturn, ProbeError> {
    let v6 = ip.is_ipv6();
    if v6 && !ipv6_enabled {
        return Ok(IcmpReturn::default());
    }
    if let Some(s) = src {
        if !same_family(s, ip) {
            return Err(ProbeError::InvalidSource {
                src: s.to_string(),
                target: ip.to_string(),
            });
        }
    }

    let start = Instant::now();
    let deadline = start + timeout;

    let mut listener =
        tokio::task::spawn_blocking(move || listen_time_exceeded(v6, src, deadline));
    let mut connector =
        tokio::task::spawn_blocking(move || connect_with_ttl(ip, port, src, ttl, timeout));

    let reached = |addr: IpAddr| IcmpReturn {
        success: true,
        addr: Some(addr),
        elapsed: start.elapsed(),
    };

    tokio::select! {
        l = &mut listener => {
            match l {
                Ok(Ok(Some(peer))) => Ok(reached(peer)),
                // Listener ended without a match (deadline or no raw-socket
                // privileges): the connect outcome decides
                _ => match connector.await {
                    Ok(Ok(())) => Ok(reached(ip)),
                    _ => Ok(IcmpReturn::default()),
                },
            }
        }
        c = &mut connector => {
            match c {
                Ok(Ok(())) => Ok(reached(ip)),
                // SYN was answered with an error or not at all; a paired
                // Time Exceeded may still be in flight
                _ => match listener.await {
                    Ok(Ok(Some(peer))) => Ok(reached(peer)),
                    _ => Ok(IcmpReturn::default()),
                },
            }
        }
    }
}

/// Blocking connect with the hop limit fixed before the SYN leaves.
fn connect_with_ttl(
    ip: IpAddr,
    port: u16,
    src: Option<IpAddr>,
    ttl: u8,
    timeout: Duration,
) -> std::io::Result<()> {
    let domain = if ip.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    set_hop_limit(&socket, ttl, ip.is_ipv6())?;
    if let Some(src_ip) = src {
        socket.bind(&SockAddr::from(SocketAddr::new(src_ip, 0)))?;
    }
    socket.connect_timeout(&SockAddr::from(SocketAddr::new(ip, port)), timeout)?;
    Ok(())
}

/// Blocking raw-ICMP read loop that returns the source of the first Time
/// Exceeded seen before the deadline.
fn listen_time_exceeded(
    v6: bool,
    src: Option<IpAddr>,
    deadline: Instant,
) -> std::io::Result<Option<IpAddr>> {
    let socket = create_raw_icmp_socket(v6)?;
    bind_source(&socket, src, v6)?;

    let mut buffer = [0u8; 1500];
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        socket.set_read_timeout(Some(deadline - now))?;

        let (len, responder) = match recv_from(&socket, &mut buffer) {
            Ok(v) => v,
            Err(e) if is_timeout(&e) => continue,
            Err(e) => return Err(e),
        };

        if is_time_exceeded(&buffer[..len], v6) {
            return Ok(Some(responder));
        }
    }
}

fn is_time_exceeded(data: &[u8], v6: bool) -> bool {
    if v6 {
        // Raw ICMPv6 sockets deliver the message without the IPv6 header
        return data.len() >= ICMP_HEADER_SIZE && data[0] == ICMPV6_TIME_EXCEEDED;
    }
    let Some(ip) = pnet::packet::ipv4::Ipv4Packet::new(data) else {
        return false;
    };
    let header_len = (ip.get_header_length() as usize) * 4;
    data.len() >= header_len + ICMP_HEADER_SIZE && data[header_len] == ICMPV4_TIME_EXCEEDED
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_to_listening_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let out = tcp_connect(
            "localhost",
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            None,
            port,
            Duration::from_secs(1),
        )
        .await;

        assert!(out.success);
        assert_eq!(out.dest_port, port);
        assert_eq!(out.src_ip, "127.0.0.1");
        assert!(out.con_time > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_reports_failure() {
        // Bind and drop to get a port that is very likely closed
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let out = tcp_connect(
            "localhost",
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            None,
            port,
            Duration::from_secs(1),
        )
        .await;

        assert!(!out.success);
        assert_eq!(out.src_ip, "0.0.0.0");
    }

    #[tokio::test]
    async fn test_traceroute_ipv6_disabled_short_circuits() {
        let out = tcp_traceroute(
            "2001:db8::1".parse().unwrap(),
            80,
            None,
            4,
            Duration::from_millis(50),
            false,
        )
        .await
        .unwrap();
        assert!(!out.success);
    }

    #[test]
    fn test_is_time_exceeded_v4() {
        let mut data = vec![0u8; 20];
        data[0] = 0x45;
        let mut icmp = vec![0u8; 8];
        icmp[0] = ICMPV4_TIME_EXCEEDED;
        data.extend_from_slice(&icmp);
        assert!(is_time_exceeded(&data, false));

        data[20] = 0; // echo reply type instead
        assert!(!is_time_exceeded(&data, false));
    }
}
