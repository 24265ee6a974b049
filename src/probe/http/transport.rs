//! Transports for the HTTP tracer, interned per source IP and per proxy
//! URL. Entries are created once under a double-checked lock and retained
//! for the life of the process.
//!
//! A transport carries only per-key configuration (TLS client config,
//! egress bind, proxy). Connections are not pooled here: every probe run
//! opens a fresh connection so its DNS/connect/TLS phases are measured
//! live, and closes it when the response is drained.

use parking_lot::RwLock;
use rustls::ClientConfig;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use url::Url;

/// Object-safe alias for the probe byte streams (plain or TLS).
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// TLS facts captured at handshake time.
#[derive(Debug, Clone, Default)]
pub struct TlsMeta {
    pub version: String,
    pub earliest_cert_expiry: Option<i64>,
    pub last_chain_expiry: Option<i64>,
}

/// One interned transport: the shared TLS configuration, an optional
/// egress bind address, an optional proxy.
pub struct Transport {
    pub tls_config: Arc<ClientConfig>,
    pub local_addr: Option<IpAddr>,
    pub proxy: Option<Url>,
}

impl Transport {
    fn new(tls_config: Arc<ClientConfig>, local_addr: Option<IpAddr>, proxy: Option<Url>) -> Self {
        Self {
            tls_config,
            local_addr,
            proxy,
        }
    }
}

/// The three-way transport dispatch: one default transport, one per source
/// IP, one per proxy URL.
pub struct TransportCache {
    tls_config: Arc<ClientConfig>,
    default: Arc<Transport>,
    by_source: RwLock<HashMap<IpAddr, Arc<Transport>>>,
    by_proxy: RwLock<HashMap<String, Arc<Transport>>>,
}

impl Default for TransportCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportCache {
    pub fn new() -> Self {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        // The provider is named explicitly so the builder cannot trip over
        // another rustls backend linked in elsewhere
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let tls_config = Arc::new(
            ClientConfig::builder_with_provider(provider)
                .with_safe_default_protocol_versions()
                .expect("ring provider supports the default TLS versions")
                .with_root_certificates(roots)
                .with_no_client_auth(),
        );
        let default = Arc::new(Transport::new(tls_config.clone(), None, None));
        Self {
            tls_config,
            default,
            by_source: RwLock::new(HashMap::new()),
            by_proxy: RwLock::new(HashMap::new()),
        }
    }

    /// Proxy beats source IP beats the default transport.
    pub fn get(&self, src: Option<IpAddr>, proxy: Option<&Url>) -> Arc<Transport> {
        if let Some(proxy) = proxy {
            return self.proxy_transport(proxy);
        }
        if let Some(src) = src {
            return self.source_transport(src);
        }
        self.default.clone()
    }

    fn source_transport(&self, src: IpAddr) -> Arc<Transport> {
        {
            let map = self.by_source.read();
            if let Some(t) = map.get(&src) {
                return t.clone();
            }
        }
        let mut map = self.by_source.write();
        if let Some(t) = map.get(&src) {
            return t.clone();
        }
        let t = Arc::new(Transport::new(self.tls_config.clone(), Some(src), None));
        map.insert(src, t.clone());
        t
    }

    fn proxy_transport(&self, proxy: &Url) -> Arc<Transport> {
        let key = proxy.as_str().to_string();
        {
            let map = self.by_proxy.read();
            if let Some(t) = map.get(&key) {
                return t.clone();
            }
        }
        let mut map = self.by_proxy.write();
        if let Some(t) = map.get(&key) {
            return t.clone();
        }
        let t = Arc::new(Transport::new(
            self.tls_config.clone(),
            None,
            Some(proxy.clone()),
        ));
        map.insert(key, t.clone());
        t
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_is_interned() {
        let cache = TransportCache::new();
        let src: IpAddr = "192.168.1.10".parse().unwrap();
        let proxy = Url::parse("http://proxy.local:3128").unwrap();

        assert!(Arc::ptr_eq(&cache.get(None, None), &cache.get(None, None)));
        assert!(Arc::ptr_eq(
            &cache.get(Some(src), None),
            &cache.get(Some(src), None)
        ));
        assert!(Arc::ptr_eq(
            &cache.get(None, Some(&proxy)),
            &cache.get(Some(src), Some(&proxy))
        ));

        // Distinct keys get distinct transports
        let other: IpAddr = "192.168.1.11".parse().unwrap();
        assert!(!Arc::ptr_eq(
            &cache.get(Some(src), None),
            &cache.get(Some(other), None)
        ));
    }

    #[test]
    fn test_transports_share_one_tls_config() {
        let cache = TransportCache::new();
        let src: IpAddr = "192.168.1.10".parse().unwrap();
        let proxy = Url::parse("http://proxy.local:3128").unwrap();

        let a = cache.get(None, None);
        let b = cache.get(Some(src), None);
        let c = cache.get(None, Some(&proxy));
        assert!(Arc::ptr_eq(&a.tls_config, &b.tls_config));
        assert!(Arc::ptr_eq(&b.tls_config, &c.tls_config));
        assert_eq!(b.local_addr, Some(src));
        assert_eq!(c.proxy.as_ref().map(|p| p.as_str()), Some(proxy.as_str()));
    }
}
