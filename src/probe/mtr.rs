//! Per-run MTR driver: `count` incremental-TTL sweeps with per-hop
//! statistics, probed with ICMP Echo or TCP SYN.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use crate::config::MtrProtocol;
use crate::probe::icmp::icmp;
use crate::probe::tcp::tcp_traceroute;
use crate::stats;

/// One TTL level of the traced path.
#[derive(Debug, Clone, Default)]
pub struct IcmpHop {
    pub success: bool,
    pub address_from: String,
    pub address_to: String,
    pub ttl: u16,
    pub snt: u64,
    pub snt_fail: u64,
    pub last: Duration,
    pub sum: Duration,
    pub mean: Duration,
    pub best: Duration,
    pub worst: Duration,
    pub squared_deviation: Duration,
    pub uncorrected_sd: Duration,
    pub corrected_sd: Duration,
    pub range: Duration,
    /// Fraction in [0, 1], not percent.
    pub loss: f64,
}

/// Cross-run accumulator, keyed `"<ttl>_<responder>"` by the owning worker.
#[derive(Debug, Clone, Default)]
pub struct HopSummary {
    pub address_from: String,
    pub address_to: String,
    pub snt: u64,
    pub snt_fail: u64,
    pub snt_time: Duration,
}

/// Outcome of one MTR run. `hop_summary` is carried and merged across runs
/// by the worker; a fresh run returns it empty.
#[derive(Debug, Clone, Default)]
pub struct MtrResult {
    pub dest_addr: String,
    pub hops: Vec<IcmpHop>,
    pub hop_summary: HashMap<String, HopSummary>,
}

/// Per-TTL scratch state while the sweep is running.
#[derive(Debug, Default)]
struct TtlProbe {
    executed: bool,
    responder: Option<IpAddr>,
    succ: u64,
    last: Duration,
    sum: Duration,
    best: Duration,
    worst: Duration,
    samples: Vec<Duration>,
}

/// Run `count` rounds of TTL 1..=max_hops probes toward `ip`. Each round
/// stops at the first TTL answered by the destination itself.
#[allow(clippy::too_many_arguments)]
pub async fn mtr(
    host: &str,
    ip: IpAddr,
    src: Option<IpAddr>,
    max_hops: u16,
    count: u64,
    timeout: Duration,
    icmp_id: u16,
    payload_size: usize,
    protocol: MtrProtocol,
    tcp_port: u16,
    ipv6: bool,
) -> MtrResult {
    let mut result = MtrResult {
        dest_addr: host.to_string(),
        ..Default::default()
    };

    let mut probes: Vec<TtlProbe> = Vec::new();
    probes.resize_with(max_hops as usize + 1, TtlProbe::default);

    let mut seq: u16 = 0;
    for _ in 0..count {
        for ttl in 1..=max_hops {
            let state = &mut probes[ttl as usize];
            state.executed = true;

            let probe_seq = seq;
            seq = seq.wrapping_add(1);
            let reply = match protocol {
                MtrProtocol::Tcp => {
                    tcp_traceroute(ip, tcp_port, src, ttl.min(255) as u8, timeout, ipv6).await
                }
                MtrProtocol::Icmp => {
                    let id = icmp_id;
                    let join = tokio::task::spawn_blocking(move || {
                        icmp(
                            ip,
                            src,
                            ttl.min(255) as u8,
                            id,
                            timeout,
                            probe_seq,
                            payload_size,
                            ipv6,
                        )
                    })
                    .await;
                    match join {
                        Ok(res) => res,
                        Err(e) => {
                            tracing::debug!(instance = host, ttl, err = %e, "hop probe task failed");
                            continue;
                        }
                    }
                }
            };

            let reply = match reply {
                Ok(r) if r.success => r,
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(instance = host, ttl, err = %e, "hop probe failed");
                    continue;
                }
            };
            let responder = match reply.addr {
                Some(a) => a,
                None => continue,
            };

            state.responder = Some(responder);
            state.succ += 1;
            state.last = reply.elapsed;
            state.sum += reply.elapsed;
            if state.best.is_zero() || reply.elapsed < state.best {
                state.best = reply.elapsed;
            }
            if reply.elapsed > state.worst {
                state.worst = reply.elapsed;
            }
            state.samples.push(reply.elapsed);

            if responder == ip {
                break;
            }
        }
    }

    // Assemble hops for the TTLs that were exercised and answered, chaining
    // address_from through the previously emitted hop.
    let mut prev_responder: Option<IpAddr> = None;
    for ttl in 1..=max_hops as usize {
        let state = &probes[ttl];
        if !state.executed {
            break;
        }
        let responder = match state.responder {
            Some(r) => r,
            // Unresponsive TTL: nothing to report for this hop
            None => continue,
        };

        let hop = IcmpHop {
            success: true,
            address_from: prev_responder.unwrap_or(responder).to_string(),
            address_to: responder.to_string(),
            ttl: ttl as u16,
            snt: count,
            snt_fail: count - state.succ,
            last: state.last,
            sum: state.sum,
            mean: if state.succ > 0 {
                state.sum / state.succ as u32
            } else {
                Duration::ZERO
            },
            best: state.best,
            worst: state.worst,
            squared_deviation: stats::nanos_to_duration(
                stats::time_squared_deviation(&state.samples).sqrt(),
            ),
            uncorrected_sd: stats::nanos_to_duration(stats::time_uncorrected_deviation(
                &state.samples,
            )),
            corrected_sd: stats::nanos_to_duration(stats::time_corrected_deviation(&state.samples)),
            range: stats::time_range(&state.samples),
            loss: stats::loss_rate(count, state.succ),
        };
        result.hops.push(hop);
        prev_responder = Some(responder);

        if responder == ip {
            break;
        }
    }

    result
}

/// Merge one run's hops into the persistent per-hop summaries.
pub fn merge_hop_summaries(summary: &mut HashMap<String, HopSummary>, hops: &[IcmpHop]) {
    for hop in hops {
        let key = format!("{}_{}", hop.ttl, hop.address_to);
        let entry = summary.entry(key).or_default();
        entry.address_from = hop.address_from.clone();
        entry.address_to = hop.address_to.clone();
        entry.snt += hop.snt;
        entry.snt_fail += hop.snt_fail;
        entry.snt_time += hop.sum;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hop(ttl: u16, to: &str, snt: u64, fail: u64, sum_ms: u64) -> IcmpHop {
        IcmpHop {
            success: true,
            address_from: "10.0.0.1".into(),
            address_to: to.into(),
            ttl,
            snt,
            snt_fail: fail,
            sum: Duration::from_millis(sum_ms),
            ..Default::default()
        }
    }

    #[test]
    fn test_summary_accumulates_across_runs() {
        let mut summary = HashMap::new();

        merge_hop_summaries(&mut summary, &[hop(1, "10.0.0.2", 3, 1, 30)]);
        merge_hop_summaries(&mut summary, &[hop(1, "10.0.0.2", 3, 0, 24)]);

        let entry = summary.get("1_10.0.0.2").unwrap();
        assert_eq!(entry.snt, 6);
        assert_eq!(entry.snt_fail, 1);
        assert_eq!(entry.snt_time, Duration::from_millis(54));
        assert_eq!(entry.address_to, "10.0.0.2");
    }

    #[test]
    fn test_summary_keys_split_by_responder() {
        let mut summary = HashMap::new();

        // Same TTL answered by two different routers across runs
        merge_hop_summaries(&mut summary, &[hop(2, "10.0.0.2", 3, 0, 30)]);
        merge_hop_summaries(&mut summary, &[hop(2, "10.0.9.9", 3, 2, 10)]);

        assert_eq!(summary.len(), 2);
        assert_eq!(summary.get("2_10.0.0.2").unwrap().snt, 3);
        assert_eq!(summary.get("2_10.0.9.9").unwrap().snt_fail, 2);
    }
}
