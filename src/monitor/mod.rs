//! Probe supervision: four typed registries that keep the live worker set
//! in lockstep with the current configuration.

pub mod http;
pub mod mtr;
pub mod ping;
pub mod tcp;

pub use http::HttpMonitor;
pub use mtr::MtrMonitor;
pub use ping::PingMonitor;
pub use tcp::TcpMonitor;

use rand::Rng;
use std::time::Duration;

/// Worker key for the kinds that expand per resolved address.
pub(crate) fn worker_key(name: &str, ip: std::net::IpAddr) -> String {
    format!("{name} {ip}")
}

/// A malformed `source_ip` disables the target rather than failing every
/// probe it would issue.
pub(crate) fn parse_source(
    target: &crate::config::TargetConfig,
) -> Result<Option<std::net::IpAddr>, ()> {
    match &target.source_ip {
        None => Ok(None),
        Some(raw) => match raw.parse() {
            Ok(ip) => Ok(Some(ip)),
            Err(_) => {
                tracing::warn!(instance = %target.name, source_ip = %raw,
                    "invalid source ip, skipping target");
                Err(())
            }
        },
    }
}

/// Uniform random delay in `[0, interval/10)`, drawn once per add so a
/// large fleet spreads its probe schedules. A zero bound is not sampled.
pub(crate) fn add_jitter(interval: Duration) -> Duration {
    let bound = interval / 10;
    if bound.is_zero() {
        return Duration::ZERO;
    }
    let nanos = bound.as_nanos() as u64;
    Duration::from_nanos(rand::thread_rng().gen_range(0..nanos))
}

/// The four registries, reconciled together on reload. The collectors
/// hold their own handles to the individual monitors.
pub struct Monitors {
    pub ping: std::sync::Arc<PingMonitor>,
    pub mtr: std::sync::Arc<MtrMonitor>,
    pub tcp: std::sync::Arc<TcpMonitor>,
    pub http: std::sync::Arc<HttpMonitor>,
}

impl Monitors {
    /// Initial population from the current configuration.
    pub async fn add_all(&self) {
        self.ping.add_targets().await;
        self.mtr.add_targets().await;
        self.tcp.add_targets().await;
        self.http.add_targets().await;
    }

    /// Signal-driven reconciliation: start what the new configuration
    /// added, then retire what it dropped. No rebind pass — live workers
    /// keep their bound addresses until the periodic refresh runs.
    pub async fn reconcile(&self) {
        self.ping.add_targets().await;
        self.ping.del_targets().await;

        self.mtr.add_targets().await;
        self.mtr.del_targets().await;

        self.tcp.add_targets().await;
        self.tcp.del_targets().await;

        self.http.add_targets().await;
        self.http.del_targets().await;
    }

    /// Periodic-refresh reconciliation: retire removed targets, rebind
    /// workers whose DNS answers moved, then add what is missing. HTTPGet
    /// resolves per request and has no rebind step.
    pub async fn refresh(&self) {
        self.ping.del_targets().await;
        self.ping.check_active_targets().await;
        self.ping.add_targets().await;

        self.mtr.del_targets().await;
        self.mtr.check_active_targets().await;
        self.mtr.add_targets().await;

        self.tcp.del_targets().await;
        self.tcp.check_active_targets().await;
        self.tcp.add_targets().await;

        self.http.del_targets().await;
        self.http.add_targets().await;
    }

    /// Live worker inventory, one line per worker (SIGUSR1 dump).
    pub fn inventory(&self) -> Vec<String> {
        let mut lines = Vec::new();
        lines.extend(self.ping.inventory().into_iter().map(|l| format!("PING: {l}")));
        lines.extend(self.mtr.inventory().into_iter().map(|l| format!("MTR: {l}")));
        lines.extend(self.tcp.inventory().into_iter().map(|l| format!("TCP: {l}")));
        lines.extend(self.http.inventory().into_iter().map(|l| format!("HTTPGet: {l}")));
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_bounds() {
        let interval = Duration::from_secs(5);
        for _ in 0..100 {
            let jitter = add_jitter(interval);
            assert!(jitter < interval / 10);
        }
    }

    #[test]
    fn test_zero_bound_is_not_sampled() {
        assert_eq!(add_jitter(Duration::from_nanos(5)), Duration::ZERO);
        assert_eq!(add_jitter(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_worker_key_shape() {
        assert_eq!(
            worker_key("dns", "8.8.8.8".parse().unwrap()),
            "dns 8.8.8.8"
        );
    }
}
