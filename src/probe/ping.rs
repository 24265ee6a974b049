//! Per-run PING driver: a burst of Echo exchanges against one resolved
//! address, aggregated into a `PingResult`.

use std::net::IpAddr;
use std::time::Duration;

use crate::probe::icmp::icmp;
use crate::stats;

/// Echo TTL for plain pings (high enough to reach any destination).
const PING_TTL: u8 = 128;

/// Aggregated outcome of one probe run. The three `snt_*` counters hold
/// this run's contribution; the owning worker accumulates them across runs.
#[derive(Debug, Clone, Default)]
pub struct PingResult {
    pub success: bool,
    pub dest_addr: String,
    pub dest_ip: String,
    pub drop_rate: f64,
    pub best: Duration,
    pub worst: Duration,
    pub mean: Duration,
    pub sum: Duration,
    pub squared_deviation: Duration,
    pub uncorrected_sd: Duration,
    pub corrected_sd: Duration,
    pub range: Duration,
    pub snt_summary: u64,
    pub snt_fail_summary: u64,
    pub snt_time_summary: Duration,
}

/// Run `count` sequential echoes against `ip`. A reply from any other
/// address does not count as success. Never fails: probe errors surface as
/// lost packets.
#[allow(clippy::too_many_arguments)]
pub async fn ping(
    host: &str,
    ip: IpAddr,
    src: Option<IpAddr>,
    count: u64,
    timeout: Duration,
    icmp_id: u16,
    payload_size: usize,
    ipv6: bool,
) -> PingResult {
    let mut result = PingResult {
        dest_addr: host.to_string(),
        dest_ip: ip.to_string(),
        ..Default::default()
    };

    let mut samples: Vec<Duration> = Vec::with_capacity(count as usize);
    let mut best = Duration::ZERO;
    let mut worst = Duration::ZERO;
    let mut sum = Duration::ZERO;

    for seq in 0..count {
        let reply = tokio::task::spawn_blocking(move || {
            icmp(
                ip,
                src,
                PING_TTL,
                icmp_id,
                timeout,
                seq as u16,
                payload_size,
                ipv6,
            )
        })
        .await;

        let reply = match reply {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => {
                tracing::debug!(target_ip = %ip, err = %e, "echo failed");
                continue;
            }
            Err(e) => {
                tracing::debug!(target_ip = %ip, err = %e, "echo task failed");
                continue;
            }
        };

        if !reply.success || reply.addr != Some(ip) {
            continue;
        }

        let elapsed = reply.elapsed;
        if best.is_zero() || elapsed < best {
            best = elapsed;
        }
        if elapsed > worst {
            worst = elapsed;
        }
        sum += elapsed;
        samples.push(elapsed);
        result.success = true;
    }

    let succeeded = samples.len() as u64;
    result.drop_rate = stats::loss_rate(count, succeeded);
    result.best = best;
    result.worst = worst;
    result.sum = sum;
    if succeeded > 0 {
        result.mean = sum / succeeded as u32;
    }
    result.squared_deviation = stats::nanos_to_duration(stats::time_squared_deviation(&samples).sqrt());
    result.uncorrected_sd = stats::nanos_to_duration(stats::time_uncorrected_deviation(&samples));
    result.corrected_sd = stats::nanos_to_duration(stats::time_corrected_deviation(&samples));
    result.range = stats::time_range(&samples);
    result.snt_summary = count;
    result.snt_fail_summary = count - succeeded;
    result.snt_time_summary = sum;

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_zero_count_run_is_well_defined() {
        let out = ping(
            "lh",
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            None,
            0,
            Duration::from_millis(10),
            1,
            56,
            false,
        )
        .await;

        assert!(!out.success);
        assert_eq!(out.drop_rate, 0.0);
        assert_eq!(out.snt_summary, 0);
        assert_eq!(out.snt_fail_summary, 0);
        assert_eq!(out.snt_time_summary, Duration::ZERO);
        assert_eq!(out.dest_addr, "lh");
        assert_eq!(out.dest_ip, "127.0.0.1");
    }

    #[tokio::test]
    async fn test_disabled_ipv6_counts_as_loss() {
        let out = ping(
            "v6",
            "2001:db8::1".parse().unwrap(),
            None,
            2,
            Duration::from_millis(10),
            1,
            56,
            false,
        )
        .await;

        assert!(!out.success);
        assert_eq!(out.drop_rate, 1.0);
        assert_eq!(out.snt_summary, 2);
        assert_eq!(out.snt_fail_summary, 2);
    }
}
