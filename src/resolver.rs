//! Name resolution for target expansion: the host resolver by default, or
//! an operator-configured recursive resolver over UDP.

use anyhow::{Context, Result};
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{
    LookupIpStrategy, NameServerConfig, Protocol, ResolverConfig, ResolverOpts,
};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

pub struct Resolver {
    inner: TokioAsyncResolver,
}

impl Resolver {
    /// Resolver backed by the host configuration (`/etc/resolv.conf`),
    /// falling back to the library defaults when that cannot be read.
    pub fn system(timeout: Duration, ipv6: bool) -> Self {
        let (config, opts) = hickory_resolver::system_conf::read_system_conf()
            .unwrap_or_else(|_| (ResolverConfig::default(), ResolverOpts::default()));
        Self::build(config, opts_with(opts, timeout, ipv6))
    }

    /// Resolver that queries one custom recursive nameserver over UDP.
    pub fn custom(nameserver: SocketAddr, timeout: Duration, ipv6: bool) -> Self {
        let mut config = ResolverConfig::new();
        config.add_name_server(NameServerConfig::new(nameserver, Protocol::Udp));
        Self::build(config, opts_with(ResolverOpts::default(), timeout, ipv6))
    }

    fn build(config: ResolverConfig, opts: ResolverOpts) -> Self {
        Self {
            inner: TokioAsyncResolver::tokio(config, opts),
        }
    }

    /// Expand a hostname to all of its addresses. IP literals pass through
    /// untouched (the engines gate disabled IPv6 themselves).
    pub async fn dest_addrs(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let lookup = self
            .inner
            .lookup_ip(host)
            .await
            .with_context(|| format!("resolving target {host}"))?;
        Ok(lookup.iter().collect())
    }

    /// Expand an SRV record to its member hosts. For `_tcp` services the
    /// members come back as `host:port`.
    pub async fn srv_hosts(&self, record: &str) -> Result<Vec<String>> {
        let tcp = srv_proto(record).is_some_and(|p| p.eq_ignore_ascii_case("tcp"));
        let lookup = self
            .inner
            .srv_lookup(record)
            .await
            .with_context(|| format!("resolving srv record {record}"))?;

        let mut hosts = Vec::new();
        for srv in lookup.iter() {
            let target = srv.target().to_string();
            let target = target.trim_end_matches('.');
            if tcp {
                hosts.push(format!("{}:{}", target, srv.port()));
            } else {
                hosts.push(target.to_string());
            }
        }
        Ok(hosts)
    }
}

fn opts_with(mut opts: ResolverOpts, timeout: Duration, ipv6: bool) -> ResolverOpts {
    opts.timeout = timeout;
    opts.ip_strategy = if ipv6 {
        LookupIpStrategy::Ipv4AndIpv6
    } else {
        LookupIpStrategy::Ipv4Only
    };
    opts
}

/// A host of the form `_service._proto.zone` names an SRV record.
pub fn is_srv_record(host: &str) -> bool {
    let mut labels = host.split('.');
    match (labels.next(), labels.next(), labels.next()) {
        (Some(service), Some(proto), Some(_zone)) => {
            service.starts_with('_') && proto.starts_with('_')
        }
        _ => false,
    }
}

/// The protocol component of an SRV-record host, without the underscore.
pub fn srv_proto(host: &str) -> Option<&str> {
    let proto = host.split('.').nth(1)?;
    proto.strip_prefix('_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_srv_record_detection() {
        assert!(is_srv_record("_smtp._tcp.example.com"));
        assert!(is_srv_record("_ping._udp.example.com"));
        assert!(!is_srv_record("example.com"));
        assert!(!is_srv_record("www._tcp.example.com"));
        assert!(!is_srv_record("_lonely"));
    }

    #[test]
    fn test_srv_proto_extraction() {
        assert_eq!(srv_proto("_smtp._tcp.example.com"), Some("tcp"));
        assert_eq!(srv_proto("_x._udp.zone"), Some("udp"));
        assert_eq!(srv_proto("example"), None);
    }

    #[tokio::test]
    async fn test_literals_resolve_without_queries() {
        // Nameserver is never contacted for literals
        let resolver = Resolver::custom(
            "127.0.0.1:53".parse().unwrap(),
            Duration::from_millis(250),
            true,
        );
        let ips = resolver.dest_addrs("192.0.2.7").await.unwrap();
        assert_eq!(ips, vec!["192.0.2.7".parse::<IpAddr>().unwrap()]);

        let ips = resolver.dest_addrs("2001:db8::1").await.unwrap();
        assert_eq!(ips.len(), 1);
    }
}
