//! One-shot TTL-bounded ICMP Echo exchange.
//!
//! This engine is both the pinger and the per-hop probe of the MTR
//! traceroute: with `ttl` below the path length the matching answer is a
//! Time Exceeded from the hop that dropped the packet, otherwise an Echo
//! Reply from the destination.

use pnet::packet::MutablePacket;
use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::{IcmpCode, IcmpType, IcmpTypes, checksum};
use pnet::packet::ipv4::Ipv4Packet;
use std::net::{IpAddr, Ipv6Addr};
use std::time::{Duration, Instant};

use crate::probe::socket::{
    bind_source, create_raw_icmp_socket, is_timeout, recv_from, send_to, set_hop_limit,
};
use crate::probe::{ProbeError, same_family};

/// ICMP header size (fixed)
pub const ICMP_HEADER_SIZE: usize = 8;
/// Default Echo payload size
pub const DEFAULT_PAYLOAD_SIZE: usize = 56;
/// The first 4 payload bytes carry the sequence number
pub const MIN_PAYLOAD_SIZE: usize = 4;

const ICMPV4_ECHO_REPLY: u8 = 0;
const ICMPV4_ECHO_REQUEST: u8 = 8;
const ICMPV4_TIME_EXCEEDED: u8 = 11;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;
const ICMPV6_TIME_EXCEEDED: u8 = 3;

const IPPROTO_ICMP: u8 = 1;
const IPPROTO_ICMPV6: u8 = 58;
const IPV6_HEADER_LEN: usize = 40;

/// Outcome of a single exchange.
#[derive(Debug, Clone, Default)]
pub struct IcmpReturn {
    pub success: bool,
    pub addr: Option<IpAddr>,
    pub elapsed: Duration,
}

impl IcmpReturn {
    fn failed() -> Self {
        Self::default()
    }
}

/// Send one Echo with the given TTL and wait for the matching Echo Reply or
/// Time Exceeded until `timeout` elapses. Blocking; callers run it on a
/// blocking task.
#[allow(clippy::too_many_arguments)]
pub fn icmp(
    dest: IpAddr,
    src: Option<IpAddr>,
    ttl: u8,
    id: u16,
    timeout: Duration,
    seq: u16,
    payload_size: usize,
    ipv6_enabled: bool,
) -> Result<IcmpReturn, ProbeError> {
    let v6 = dest.is_ipv6();
    if v6 && !ipv6_enabled {
        return Ok(IcmpReturn::failed());
    }
    if let Some(s) = src {
        if !same_family(s, dest) {
            return Err(ProbeError::InvalidSource {
                src: s.to_string(),
                target: dest.to_string(),
            });
        }
    }

    let v6_addrs = match (src, dest) {
        (Some(IpAddr::V6(s)), IpAddr::V6(d)) => Some((s, d)),
        _ => None,
    };
    let packet = build_echo_request(id, seq, payload_size, v6, v6_addrs);

    let start = Instant::now();
    let deadline = start + timeout;

    let socket = create_raw_icmp_socket(v6)?;
    bind_source(&socket, src, v6)?;
    set_hop_limit(&socket, ttl, v6)?;

    send_to(&socket, &packet, dest)?;

    let mut buffer = [0u8; 1500];
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Ok(IcmpReturn::failed());
        }
        socket.set_read_timeout(Some(deadline - now))?;

        let (len, responder) = match recv_from(&socket, &mut buffer) {
            Ok(v) => v,
            Err(e) if is_timeout(&e) => continue,
            Err(e) => return Err(e.into()),
        };

        if matches_probe(&buffer[..len], responder, dest, id, seq, v6) {
            return Ok(IcmpReturn {
                success: true,
                addr: Some(responder),
                elapsed: start.elapsed(),
            });
        }
        // Somebody else's packet, keep reading until the deadline
    }
}

/// Build an Echo Request whose payload is `payload_size` bytes: the
/// little-endian sequence number followed by 'x' filler.
pub fn build_echo_request(
    id: u16,
    seq: u16,
    payload_size: usize,
    v6: bool,
    v6_addrs: Option<(Ipv6Addr, Ipv6Addr)>,
) -> Vec<u8> {
    let payload_size = payload_size.max(MIN_PAYLOAD_SIZE);
    let mut buffer = vec![0u8; ICMP_HEADER_SIZE + payload_size];

    {
        let mut packet =
            MutableEchoRequestPacket::new(&mut buffer).expect("buffer holds a full echo header");
        if v6 {
            packet.set_icmp_type(IcmpType::new(ICMPV6_ECHO_REQUEST));
        } else {
            packet.set_icmp_type(IcmpTypes::EchoRequest);
        }
        packet.set_icmp_code(IcmpCode::new(0));
        packet.set_identifier(id);
        packet.set_sequence_number(seq);

        let payload = packet.payload_mut();
        payload[0..4].copy_from_slice(&(seq as u32).to_le_bytes());
        for byte in payload[4..].iter_mut() {
            *byte = b'x';
        }
    }

    if v6 {
        // The ICMPv6 checksum covers the IPv6 pseudo-header, so it needs
        // concrete source/destination addresses. When the socket is bound
        // to :: the kernel fills the checksum in (RFC 3542 mandates it for
        // raw ICMPv6 sockets).
        if let Some((src, dst)) = v6_addrs {
            let cksum = icmpv6_checksum(&buffer, src, dst);
            buffer[2..4].copy_from_slice(&cksum.to_be_bytes());
        }
    } else {
        let cksum = checksum(
            &pnet::packet::icmp::IcmpPacket::new(&buffer).expect("buffer holds a full echo header"),
        );
        buffer[2..4].copy_from_slice(&cksum.to_be_bytes());
    }

    buffer
}

/// ICMPv6 checksum over the pseudo-header (RFC 8200) plus the message.
fn icmpv6_checksum(data: &[u8], src: Ipv6Addr, dest: Ipv6Addr) -> u16 {
    let mut sum = 0u32;

    for segment in src.segments() {
        sum += u32::from(segment);
    }
    for segment in dest.segments() {
        sum += u32::from(segment);
    }
    sum += data.len() as u32;
    sum += u32::from(IPPROTO_ICMPV6);

    let mut i = 0;
    while i + 1 < data.len() {
        // checksum field itself counts as zero
        if i != 2 {
            sum += u32::from(u16::from_be_bytes([data[i], data[i + 1]]));
        }
        i += 2;
    }
    if i < data.len() {
        sum += u32::from(data[i]) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum >> 16) + (sum & 0xFFFF);
    }
    !sum as u16
}

/// Decide whether a received packet answers our probe.
fn matches_probe(
    data: &[u8],
    responder: IpAddr,
    dest: IpAddr,
    id: u16,
    seq: u16,
    v6: bool,
) -> bool {
    // A raw IPv4 socket delivers the IP header; raw ICMPv6 sockets deliver
    // the ICMPv6 message directly (the kernel strips the IPv6 header).
    let icmp_data: &[u8] = if v6 {
        data
    } else {
        let Some(ip) = Ipv4Packet::new(data) else {
            return false;
        };
        let header_len = (ip.get_header_length() as usize) * 4;
        if data.len() < header_len + ICMP_HEADER_SIZE {
            return false;
        }
        &data[header_len..]
    };

    if icmp_data.len() < ICMP_HEADER_SIZE {
        return false;
    }

    let (reply_type, exceeded_type) = if v6 {
        (ICMPV6_ECHO_REPLY, ICMPV6_TIME_EXCEEDED)
    } else {
        (ICMPV4_ECHO_REPLY, ICMPV4_TIME_EXCEEDED)
    };

    match icmp_data[0] {
        t if t == reply_type => responder == dest && matches_echo_reply(icmp_data, id, seq),
        t if t == exceeded_type => matches_embedded_echo(&icmp_data[ICMP_HEADER_SIZE..], id, seq, v6),
        _ => false,
    }
}

/// Echo Reply matches when the identifier equals ours and the first 4 data
/// bytes equal the sequence bytes we sent.
fn matches_echo_reply(icmp_data: &[u8], id: u16, seq: u16) -> bool {
    if icmp_data.len() < ICMP_HEADER_SIZE + 4 {
        return false;
    }
    let reply_id = u16::from_be_bytes([icmp_data[4], icmp_data[5]]);
    let reply_seq_bytes = &icmp_data[8..12];
    reply_id == id && reply_seq_bytes == (seq as u32).to_le_bytes()
}

/// A Time Exceeded quotes the original datagram: the inner IP header
/// followed by (at least) the first 8 bytes of our Echo Request.
fn matches_embedded_echo(quoted: &[u8], id: u16, seq: u16, v6: bool) -> bool {
    let echo: &[u8] = if v6 {
        if quoted.len() < IPV6_HEADER_LEN + ICMP_HEADER_SIZE {
            return false;
        }
        // Only Echo Requests we sent are quoted back; anything carrying a
        // different next header is not ours
        if quoted[6] != IPPROTO_ICMPV6 {
            return false;
        }
        &quoted[IPV6_HEADER_LEN..]
    } else {
        let Some(ip) = Ipv4Packet::new(quoted) else {
            return false;
        };
        if ip.get_next_level_protocol().0 != IPPROTO_ICMP {
            return false;
        }
        let header_len = (ip.get_header_length() as usize) * 4;
        if quoted.len() < header_len + ICMP_HEADER_SIZE {
            return false;
        }
        &quoted[header_len..]
    };

    let request_type = if v6 {
        ICMPV6_ECHO_REQUEST
    } else {
        ICMPV4_ECHO_REQUEST
    };
    if echo[0] != request_type {
        return false;
    }
    let quoted_id = u16::from_be_bytes([echo[4], echo[5]]);
    let quoted_seq = u16::from_be_bytes([echo[6], echo[7]]);
    quoted_id == id && quoted_seq == seq
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    #[test]
    fn test_build_echo_request_layout() {
        let packet = build_echo_request(1234, 5678, DEFAULT_PAYLOAD_SIZE, false, None);
        assert_eq!(packet.len(), ICMP_HEADER_SIZE + DEFAULT_PAYLOAD_SIZE);
        assert_eq!(packet[0], ICMPV4_ECHO_REQUEST);
        assert_eq!(packet[1], 0);
        assert_eq!(u16::from_be_bytes([packet[4], packet[5]]), 1234);
        assert_eq!(u16::from_be_bytes([packet[6], packet[7]]), 5678);
        // Payload: little-endian sequence, then 'x' filler
        assert_eq!(&packet[8..12], &5678u32.to_le_bytes());
        assert!(packet[12..].iter().all(|&b| b == b'x'));
    }

    #[test]
    fn test_build_echo_request_minimum_payload() {
        let packet = build_echo_request(1, 2, 0, false, None);
        assert_eq!(packet.len(), ICMP_HEADER_SIZE + MIN_PAYLOAD_SIZE);
    }

    #[test]
    fn test_build_echo_request_ipv6_checksum() {
        let src = Ipv6Addr::from_str("2001:db8::1").unwrap();
        let dst = Ipv6Addr::from_str("2001:db8::2").unwrap();
        let packet = build_echo_request(9, 7, 16, true, Some((src, dst)));
        assert_eq!(packet[0], ICMPV6_ECHO_REQUEST);
        let cksum = u16::from_be_bytes([packet[2], packet[3]]);
        assert_ne!(cksum, 0);
    }

    fn v4_reply_datagram(id: u16, seq: u16) -> Vec<u8> {
        // Minimal IPv4 header (IHL 5) + Echo Reply mirroring our payload
        let mut ip = vec![0u8; 20];
        ip[0] = 0x45;
        let mut icmp = build_echo_request(id, seq, 8, false, None);
        icmp[0] = ICMPV4_ECHO_REPLY;
        ip.extend_from_slice(&icmp);
        ip
    }

    #[test]
    fn test_matches_echo_reply_from_destination() {
        let dest = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));
        let data = v4_reply_datagram(42, 7);
        assert!(matches_probe(&data, dest, dest, 42, 7, false));
    }

    #[test]
    fn test_reply_from_wrong_host_is_ignored() {
        let dest = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));
        let other = IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1));
        let data = v4_reply_datagram(42, 7);
        assert!(!matches_probe(&data, other, dest, 42, 7, false));
    }

    #[test]
    fn test_reply_with_wrong_id_or_seq_is_ignored() {
        let dest = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));
        let data = v4_reply_datagram(42, 7);
        assert!(!matches_probe(&data, dest, dest, 43, 7, false));
        assert!(!matches_probe(&data, dest, dest, 42, 8, false));
    }

    #[test]
    fn test_matches_time_exceeded_with_embedded_echo() {
        let dest = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));
        let hop = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

        // Outer IPv4 header + Time Exceeded header
        let mut data = vec![0u8; 20];
        data[0] = 0x45;
        let mut te = vec![0u8; 8];
        te[0] = ICMPV4_TIME_EXCEEDED;
        data.extend_from_slice(&te);
        // Quoted: original IPv4 header (proto 1) + our echo request
        let mut inner_ip = vec![0u8; 20];
        inner_ip[0] = 0x45;
        inner_ip[9] = IPPROTO_ICMP;
        data.extend_from_slice(&inner_ip);
        data.extend_from_slice(&build_echo_request(42, 7, 8, false, None));

        assert!(matches_probe(&data, hop, dest, 42, 7, false));
        assert!(!matches_probe(&data, hop, dest, 42, 9, false));
    }

    #[test]
    fn test_ipv6_disabled_short_circuits() {
        let dest = IpAddr::from_str("2001:4860:4860::8888").unwrap();
        let out = icmp(
            dest,
            None,
            64,
            1,
            Duration::from_millis(10),
            1,
            DEFAULT_PAYLOAD_SIZE,
            false,
        )
        .unwrap();
        assert!(!out.success);
        assert!(out.addr.is_none());
    }

    #[test]
    fn test_mixed_family_source_rejected() {
        let dest = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));
        let src = IpAddr::from_str("::1").unwrap();
        let err = icmp(
            dest,
            Some(src),
            64,
            1,
            Duration::from_millis(10),
            1,
            DEFAULT_PAYLOAD_SIZE,
            true,
        )
        .unwrap_err();
        assert!(matches!(err, ProbeError::InvalidSource { .. }));
    }
}
