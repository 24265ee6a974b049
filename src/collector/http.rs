//! `http_get_*` metric families.

use prometheus::core::Collector;
use prometheus::proto::MetricFamily;
use prometheus::{Gauge, GaugeVec, Opts};
use std::collections::HashMap;
use std::sync::Arc;

use crate::collector::DescriptorCache;
use crate::monitor::HttpMonitor;

const LABELS: [&str; 2] = ["name", "target"];

pub struct HttpMetricSet {
    time: GaugeVec,
    size: GaugeVec,
    status: GaugeVec,
}

impl HttpMetricSet {
    fn new(const_labels: &HashMap<String, String>) -> Self {
        let opts = |name: &str, help: &str| {
            Opts::new(name, help).const_labels(const_labels.clone())
        };
        Self {
            time: GaugeVec::new(
                opts("http_get_seconds", "HTTP Get Drill Down time in seconds"),
                &["name", "target", "type"],
            )
            .expect("static metric family"),
            size: GaugeVec::new(
                opts("http_get_content_bytes", "HTTP Get Content Size in bytes"),
                &LABELS,
            )
            .expect("static metric family"),
            status: GaugeVec::new(opts("http_get_status", "HTTP Get Status"), &LABELS)
                .expect("static metric family"),
        }
    }

    fn reset(&self) {
        self.time.reset();
        self.size.reset();
        self.status.reset();
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let mut families = Vec::new();
        families.extend(self.time.collect());
        families.extend(self.size.collect());
        families.extend(self.status.collect());
        families
    }
}

pub struct HttpCollector {
    monitor: Arc<HttpMonitor>,
    cache: DescriptorCache<HttpMetricSet>,
}

impl HttpCollector {
    pub fn new(monitor: Arc<HttpMonitor>) -> Self {
        Self {
            monitor,
            cache: DescriptorCache::new(),
        }
    }

    pub fn collect(&self) -> Vec<MetricFamily> {
        let metrics = self.monitor.export_metrics();
        let labels = self.monitor.export_labels();

        let mut families = Vec::new();
        let up = Gauge::new("http_get_up", "Exporter state").expect("static metric");
        up.set(if metrics.is_empty() { 0.0 } else { 1.0 });
        families.extend(up.collect());
        let targets =
            Gauge::new("http_get_targets", "Number of active targets").expect("static metric");
        targets.set(labels.len() as f64);
        families.extend(targets.collect());

        let resolved: Vec<_> = metrics
            .iter()
            .map(|(key, result)| {
                let user_labels = labels.get(key).cloned().unwrap_or_default();
                let set = self
                    .cache
                    .get_or_create(&user_labels, || HttpMetricSet::new(&user_labels));
                (key, result, set)
            })
            .collect();
        self.cache.for_each(|set| set.reset());

        for (key, result, set) in resolved {
            let base = [key.as_str(), result.dest_addr.as_str()];

            set.status
                .with_label_values(&base)
                .set(if result.success {
                    result.status as f64
                } else {
                    0.0
                });
            set.size
                .with_label_values(&base)
                .set(result.content_length as f64);

            let phases = [
                ("DNSLookup", result.dns_lookup.as_secs_f64()),
                ("TCPConnection", result.tcp_connection.as_secs_f64()),
                ("TLSHandshake", result.tls_handshake.as_secs_f64()),
                ("ServerProcessing", result.server_processing.as_secs_f64()),
                ("ContentTransfer", result.content_transfer.as_secs_f64()),
                ("Total", result.total.as_secs_f64()),
            ];
            for (phase, value) in phases {
                set.time
                    .with_label_values(&[base[0], base[1], phase])
                    .set(value);
            }
            // Certificate expiries surface as unix seconds, only when TLS
            // was actually negotiated
            if let Some(expiry) = result.tls_earliest_cert_expiry {
                set.time
                    .with_label_values(&[base[0], base[1], "TLSEarliestCertExpiry"])
                    .set(expiry as f64);
            }
            if let Some(expiry) = result.tls_last_chain_expiry {
                set.time
                    .with_label_values(&[base[0], base[1], "TLSLastChainExpiry"])
                    .set(expiry as f64);
            }
        }

        self.cache.for_each(|set| families.extend(set.collect()));
        families
    }
}
