//! `ping_*` metric families.

use prometheus::core::Collector;
use prometheus::proto::MetricFamily;
use prometheus::{Gauge, GaugeVec, Opts};
use std::collections::HashMap;
use std::sync::Arc;

use crate::collector::{DescriptorCache, name_from_key};
use crate::monitor::PingMonitor;

const LABELS: [&str; 3] = ["name", "target", "target_ip"];
const RTT_TYPES: [&str; 8] = ["best", "mean", "worst", "sum", "sd", "usd", "csd", "range"];

pub struct PingMetricSet {
    status: GaugeVec,
    rtt: GaugeVec,
    snt: GaugeVec,
    snt_fail: GaugeVec,
    snt_time: GaugeVec,
    loss: GaugeVec,
}

impl PingMetricSet {
    fn new(const_labels: &HashMap<String, String>) -> Self {
        let opts = |name: &str, help: &str| {
            Opts::new(name, help).const_labels(const_labels.clone())
        };
        let vec = |name: &str, help: &str, labels: &[&str]| {
            GaugeVec::new(opts(name, help), labels).expect("static metric family")
        };
        Self {
            status: vec("ping_status", "Ping Status", &LABELS),
            rtt: vec(
                "ping_rtt_seconds",
                "Round Trip Time in seconds",
                &["name", "target", "target_ip", "type"],
            ),
            snt: vec("ping_rtt_snt_count", "Packet sent count", &LABELS),
            snt_fail: vec("ping_rtt_snt_fail_count", "Packet sent fail count", &LABELS),
            snt_time: vec("ping_rtt_snt_seconds", "Packet sent time total", &LABELS),
            loss: vec("ping_loss_percent", "Packet loss in percent", &LABELS),
        }
    }

    fn reset(&self) {
        self.status.reset();
        self.rtt.reset();
        self.snt.reset();
        self.snt_fail.reset();
        self.snt_time.reset();
        self.loss.reset();
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let mut families = Vec::new();
        families.extend(self.status.collect());
        families.extend(self.rtt.collect());
        families.extend(self.snt.collect());
        families.extend(self.snt_fail.collect());
        families.extend(self.snt_time.collect());
        families.extend(self.loss.collect());
        families
    }
}

pub struct PingCollector {
    monitor: Arc<PingMonitor>,
    cache: DescriptorCache<PingMetricSet>,
}

impl PingCollector {
    pub fn new(monitor: Arc<PingMonitor>) -> Self {
        Self {
            monitor,
            cache: DescriptorCache::new(),
        }
    }

    pub fn collect(&self) -> Vec<MetricFamily> {
        let metrics = self.monitor.export_metrics();
        let labels = self.monitor.export_labels();

        let mut families = Vec::new();
        let up = Gauge::new("ping_up", "Exporter state").expect("static metric");
        up.set(if metrics.is_empty() { 0.0 } else { 1.0 });
        families.extend(up.collect());
        let targets = Gauge::new("ping_targets", "Number of active targets").expect("static metric");
        targets.set(labels.len() as f64);
        families.extend(targets.collect());

        // Resolve the family set per worker, clearing every interned set
        // before refilling so removed workers drop out of the exposition
        let resolved: Vec<_> = metrics
            .iter()
            .map(|(key, result)| {
                let user_labels = labels.get(key).cloned().unwrap_or_default();
                let set = self
                    .cache
                    .get_or_create(&user_labels, || PingMetricSet::new(&user_labels));
                (key, result, set)
            })
            .collect();
        self.cache.for_each(|set| set.reset());

        for (key, result, set) in resolved {
            let name = name_from_key(key);
            let base = [name, result.dest_addr.as_str(), result.dest_ip.as_str()];

            set.status
                .with_label_values(&base)
                .set(if result.success { 1.0 } else { 0.0 });

            let values = [
                result.best,
                result.mean,
                result.worst,
                result.sum,
                result.squared_deviation,
                result.uncorrected_sd,
                result.corrected_sd,
                result.range,
            ];
            for (rtt_type, value) in RTT_TYPES.into_iter().zip(values) {
                set.rtt
                    .with_label_values(&[base[0], base[1], base[2], rtt_type])
                    .set(value.as_secs_f64());
            }

            set.snt
                .with_label_values(&base)
                .set(result.snt_summary as f64);
            set.snt_fail
                .with_label_values(&base)
                .set(result.snt_fail_summary as f64);
            set.snt_time
                .with_label_values(&base)
                .set(result.snt_time_summary.as_secs_f64());
            // Fraction in [0,1]; the metric name is historical
            set.loss.with_label_values(&base).set(result.drop_rate);
        }

        self.cache.for_each(|set| families.extend(set.collect()));
        families
    }
}
