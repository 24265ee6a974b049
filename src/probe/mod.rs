pub mod http;
pub mod icmp;
pub mod id;
pub mod mtr;
pub mod ping;
pub mod socket;
pub mod tcp;

pub use http::{HttpResult, TransportCache, http_get};
pub use icmp::{IcmpReturn, icmp};
pub use id::IcmpIdSequence;
pub use mtr::{HopSummary, IcmpHop, MtrResult, mtr};
pub use ping::{PingResult, ping};
pub use tcp::{TcpReturn, tcp_connect, tcp_traceroute};

use std::net::IpAddr;
use thiserror::Error;

/// Errors produced by the probe engines. Workers record these into the
/// published result instead of propagating them further.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("source ip {src} is invalid for target {target}")]
    InvalidSource { src: String, target: String },
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),
    #[error("probe timed out")]
    Timeout,
    #[error("invalid url {url}: {reason}")]
    Url { url: String, reason: String },
    #[error("tls error: {0}")]
    Tls(String),
    #[error("http error: {0}")]
    Http(String),
}

/// A probe bound to an IPv4 source cannot reach an IPv6 destination and
/// vice versa.
pub(crate) fn same_family(src: IpAddr, dest: IpAddr) -> bool {
    src.is_ipv4() == dest.is_ipv4()
}
