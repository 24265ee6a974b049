//! Configuration document: loading (file or URL), validation, SRV
//! expansion and the reload-safe holder shared by the monitors.

use anyhow::{Context, Result, anyhow, bail};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::resolver::{Resolver, is_srv_record, srv_proto};

/// Probe transport for the MTR traceroute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MtrProtocol {
    #[default]
    Icmp,
    Tcp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfSection {
    /// Periodic reload cadence; zero disables the refresh loop.
    #[serde(default, with = "duration_serde")]
    pub refresh: Duration,
    /// Optional custom recursive resolver (`host:port`, UDP).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nameserver: Option<String>,
    #[serde(default = "default_nameserver_timeout", with = "duration_serde")]
    pub nameserver_timeout: Duration,
}

impl Default for ConfSection {
    fn default() -> Self {
        Self {
            refresh: Duration::ZERO,
            nameserver: None,
            nameserver_timeout: default_nameserver_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IcmpSection {
    #[serde(default = "default_probe_interval", with = "duration_serde")]
    pub interval: Duration,
    #[serde(default = "default_probe_timeout", with = "duration_serde")]
    pub timeout: Duration,
    #[serde(default = "default_count")]
    pub count: u64,
    #[serde(default = "default_payload_size")]
    pub payload_size: usize,
}

impl Default for IcmpSection {
    fn default() -> Self {
        Self {
            interval: default_probe_interval(),
            timeout: default_probe_timeout(),
            count: default_count(),
            payload_size: default_payload_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MtrSection {
    #[serde(default = "default_probe_interval", with = "duration_serde")]
    pub interval: Duration,
    #[serde(default = "default_probe_timeout", with = "duration_serde")]
    pub timeout: Duration,
    #[serde(default = "default_max_hops")]
    pub max_hops: u16,
    #[serde(default = "default_count")]
    pub count: u64,
    #[serde(default = "default_payload_size")]
    pub payload_size: usize,
    #[serde(default)]
    pub protocol: MtrProtocol,
    #[serde(default = "default_mtr_tcp_port")]
    pub tcp_port: u16,
}

impl Default for MtrSection {
    fn default() -> Self {
        Self {
            interval: default_probe_interval(),
            timeout: default_probe_timeout(),
            max_hops: default_max_hops(),
            count: default_count(),
            payload_size: default_payload_size(),
            protocol: MtrProtocol::default(),
            tcp_port: default_mtr_tcp_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpSection {
    #[serde(default = "default_probe_interval", with = "duration_serde")]
    pub interval: Duration,
    #[serde(default = "default_probe_timeout", with = "duration_serde")]
    pub timeout: Duration,
}

impl Default for TcpSection {
    fn default() -> Self {
        Self {
            interval: default_probe_interval(),
            timeout: default_probe_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpGetSection {
    #[serde(default = "default_http_interval", with = "duration_serde")]
    pub interval: Duration,
    #[serde(default = "default_http_timeout", with = "duration_serde")]
    pub timeout: Duration,
}

impl Default for HttpGetSection {
    fn default() -> Self {
        Self {
            interval: default_http_interval(),
            timeout: default_http_timeout(),
        }
    }
}

/// One configured probe target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub name: String,
    pub host: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

impl TargetConfig {
    /// `ICMP+MTR` contributes to both the ICMP and MTR namespaces.
    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind == kind || (self.kind == "ICMP+MTR" && (kind == "ICMP" || kind == "MTR"))
    }

    pub fn source_addr(&self) -> Option<IpAddr> {
        self.source_ip.as_deref().and_then(|s| s.parse().ok())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub conf: ConfSection,
    #[serde(default)]
    pub icmp: IcmpSection,
    #[serde(default)]
    pub mtr: MtrSection,
    #[serde(default)]
    pub tcp: TcpSection,
    #[serde(default)]
    pub http_get: HttpGetSection,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

const KNOWN_KINDS: [&str; 5] = ["ICMP", "MTR", "ICMP+MTR", "TCP", "HTTPGet"];
const MAX_MTR_BOUND: u64 = 65500;

/// Structural checks. Failures are fatal at startup and keep the previous
/// configuration on reload.
pub fn validate(cfg: &Config) -> Result<()> {
    if cfg.icmp.interval.is_zero()
        || cfg.mtr.interval.is_zero()
        || cfg.tcp.interval.is_zero()
        || cfg.http_get.interval.is_zero()
    {
        bail!("intervals (icmp, mtr, tcp, http_get) must be > 0");
    }
    if cfg.mtr.max_hops as u64 > MAX_MTR_BOUND {
        bail!("mtr.max_hops must be between 0 and {MAX_MTR_BOUND}");
    }
    if cfg.mtr.count > MAX_MTR_BOUND {
        bail!("mtr.count must be between 0 and {MAX_MTR_BOUND}");
    }

    let mut seen: HashMap<&str, HashSet<&str>> = HashMap::new();
    for target in &cfg.targets {
        if !KNOWN_KINDS.contains(&target.kind.as_str()) {
            bail!(
                "target {}: unknown type {:?}, allowed: (ICMP|MTR|ICMP+MTR|TCP|HTTPGet)",
                target.name,
                target.kind
            );
        }
        let kinds: &[&str] = if target.kind == "ICMP+MTR" {
            &["ICMP", "MTR"]
        } else {
            std::slice::from_ref(
                KNOWN_KINDS
                    .iter()
                    .find(|k| **k == target.kind)
                    .expect("kind checked above"),
            )
        };
        for kind in kinds.iter().copied() {
            if !seen.entry(kind).or_default().insert(target.name.as_str()) {
                bail!("found duplicated record: {}", target.name);
            }
        }
    }
    Ok(())
}

/// SRV expansion and probe-host filtering, applied before validation.
async fn expand_targets(
    raw: Vec<TargetConfig>,
    resolver: &Resolver,
    local_hostname: &str,
) -> Result<Vec<TargetConfig>> {
    let mut targets = Vec::with_capacity(raw.len());

    let keep = |t: &TargetConfig| match &t.probe {
        None => true,
        Some(hosts) => hosts.iter().any(|h| h == local_hostname),
    };

    for target in raw {
        if !KNOWN_KINDS.contains(&target.kind.as_str()) {
            bail!(
                "target {}: unknown type {:?}, allowed: (ICMP|MTR|ICMP+MTR|TCP|HTTPGet)",
                target.name,
                target.kind
            );
        }

        if is_srv_record(&target.host) {
            if target.kind == "TCP"
                && !srv_proto(&target.host).is_some_and(|p| p.eq_ignore_ascii_case("tcp"))
            {
                bail!(
                    "target {}: type TCP requires a _tcp srv record, got {}",
                    target.name,
                    target.host
                );
            }
            let members = match resolver.srv_hosts(&target.host).await {
                Ok(members) => members,
                Err(e) => {
                    tracing::warn!(instance = %target.name, host = %target.host, err = %e,
                        "skipping srv expansion");
                    continue;
                }
            };
            for member in members {
                let mut sub = target.clone();
                sub.name = member.clone();
                sub.host = member;
                if keep(&sub) {
                    targets.push(sub);
                }
            }
        } else if keep(&target) {
            targets.push(target);
        }
    }

    Ok(targets)
}

/// Reload-safe configuration slot. Readers take cheap `Arc` snapshots; a
/// failed reload leaves the previous configuration in place.
#[derive(Default)]
pub struct SafeConfig {
    cfg: RwLock<Arc<Config>>,
}

impl SafeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Arc<Config> {
        self.cfg.read().clone()
    }

    /// Load, expand and validate `source`, then swap it in.
    pub async fn reload(
        &self,
        source: &str,
        headers: &[(String, String)],
        resolver: &Resolver,
    ) -> Result<()> {
        let data = load_source(source, headers).await?;
        let mut cfg: Config =
            toml::from_str(&data).with_context(|| format!("parsing config {source}"))?;

        let local_hostname = hostname().unwrap_or_default();
        cfg.targets = expand_targets(cfg.targets, resolver, &local_hostname).await?;
        validate(&cfg)?;

        *self.cfg.write() = Arc::new(cfg);
        Ok(())
    }

    /// Install an already-built configuration after validation.
    pub fn replace(&self, cfg: Config) -> Result<()> {
        validate(&cfg)?;
        *self.cfg.write() = Arc::new(cfg);
        Ok(())
    }
}

/// Fetch the raw document from a local path or an http(s) URL.
async fn load_source(source: &str, headers: &[(String, String)]) -> Result<String> {
    if source.starts_with("http://") || source.starts_with("https://") {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .context("building config http client")?;
        let mut request = client.get(source);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("fetching config {source}"))?
            .error_for_status()
            .with_context(|| format!("fetching config {source}"))?;
        response.text().await.context("reading config body")
    } else {
        tokio::fs::read_to_string(source)
            .await
            .with_context(|| format!("reading config file {source}"))
    }
}

/// This exporter's hostname, used by the per-target `probe` filter.
#[cfg(unix)]
pub fn hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8(buf[..end].to_vec()).ok()
}

#[cfg(not(unix))]
pub fn hostname() -> Option<String> {
    std::env::var("COMPUTERNAME").ok()
}

/// Parse the `host:port` form the TCP kind (and tcp-mode MTR) expects.
pub fn split_host_port(host: &str) -> Result<(String, u16)> {
    let (name, port) = host
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("expected host:port, got {host:?}"))?;
    let port: u16 = port
        .parse()
        .map_err(|_| anyhow!("invalid port in {host:?}"))?;
    Ok((name.to_string(), port))
}

/// Durations are written as (fractional) seconds in the document.
pub mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("negative or non-finite duration"));
        }
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

fn default_nameserver_timeout() -> Duration {
    Duration::from_millis(250)
}
fn default_probe_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_probe_timeout() -> Duration {
    Duration::from_secs(4)
}
fn default_http_interval() -> Duration {
    Duration::from_secs(15)
}
fn default_http_timeout() -> Duration {
    Duration::from_secs(14)
}
fn default_count() -> u64 {
    10
}
fn default_payload_size() -> usize {
    56
}
fn default_max_hops() -> u16 {
    30
}
fn default_mtr_tcp_port() -> u16 {
    80
}
