//! `mtr_*` metric families. The per-hop snt counters come from the
//! cross-run hop summaries and are exposed as counters.

use prometheus::core::Collector;
use prometheus::proto::{MetricFamily, MetricType};
use prometheus::{Gauge, GaugeVec, Opts};
use std::collections::HashMap;
use std::sync::Arc;

use crate::collector::DescriptorCache;
use crate::monitor::MtrMonitor;

const HOP_LABELS: [&str; 4] = ["name", "target", "ttl", "path"];
const RTT_TYPES: [&str; 10] = [
    "last", "sum", "best", "mean", "worst", "sd", "usd", "csd", "range", "loss",
];

pub struct MtrMetricSet {
    rtt: GaugeVec,
    hops: GaugeVec,
    snt: GaugeVec,
    snt_fail: GaugeVec,
    snt_time: GaugeVec,
}

impl MtrMetricSet {
    fn new(const_labels: &HashMap<String, String>) -> Self {
        let opts = |name: &str, help: &str| {
            Opts::new(name, help).const_labels(const_labels.clone())
        };
        let vec = |name: &str, help: &str, labels: &[&str]| {
            GaugeVec::new(opts(name, help), labels).expect("static metric family")
        };
        Self {
            rtt: vec(
                "mtr_rtt_seconds",
                "Round Trip Time in seconds",
                &["name", "target", "ttl", "path", "type"],
            ),
            hops: vec("mtr_hops", "Number of route hops", &["name", "target"]),
            snt: vec(
                "mtr_rtt_snt_count",
                "Round Trip Send Package Total",
                &HOP_LABELS,
            ),
            snt_fail: vec(
                "mtr_rtt_snt_fail_count",
                "Round Trip Send Package Fail Total",
                &HOP_LABELS,
            ),
            snt_time: vec(
                "mtr_rtt_snt_seconds",
                "Round Trip Send Package Time Total",
                &HOP_LABELS,
            ),
        }
    }

    fn reset(&self) {
        self.rtt.reset();
        self.hops.reset();
        self.snt.reset();
        self.snt_fail.reset();
        self.snt_time.reset();
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let mut families = Vec::new();
        families.extend(self.rtt.collect());
        families.extend(self.hops.collect());
        // The snt accumulators only grow, so they are exposed as counters
        for vec in [&self.snt, &self.snt_fail, &self.snt_time] {
            for mut family in vec.collect() {
                family.set_field_type(MetricType::COUNTER);
                for metric in family.mut_metric().iter_mut() {
                    let mut counter = prometheus::proto::Counter::default();
                    counter.set_value(metric.get_gauge().get_value());
                    metric.set_counter(counter);
                    metric.clear_gauge();
                }
                families.push(family);
            }
        }
        families
    }
}

pub struct MtrCollector {
    monitor: Arc<MtrMonitor>,
    cache: DescriptorCache<MtrMetricSet>,
}

impl MtrCollector {
    pub fn new(monitor: Arc<MtrMonitor>) -> Self {
        Self {
            monitor,
            cache: DescriptorCache::new(),
        }
    }

    pub fn collect(&self) -> Vec<MetricFamily> {
        let metrics = self.monitor.export_metrics();
        let labels = self.monitor.export_labels();

        let mut families = Vec::new();
        let up = Gauge::new("mtr_up", "Exporter state").expect("static metric");
        up.set(if metrics.is_empty() { 0.0 } else { 1.0 });
        families.extend(up.collect());
        let targets = Gauge::new("mtr_targets", "Number of active targets").expect("static metric");
        targets.set(labels.len() as f64);
        families.extend(targets.collect());

        let resolved: Vec<_> = metrics
            .iter()
            .map(|(key, result)| {
                let user_labels = labels.get(key).cloned().unwrap_or_default();
                let set = self
                    .cache
                    .get_or_create(&user_labels, || MtrMetricSet::new(&user_labels));
                (key, result, set)
            })
            .collect();
        self.cache.for_each(|set| set.reset());

        for (key, result, set) in resolved {
            let name = key.as_str();
            let target = result.dest_addr.as_str();
            set.hops
                .with_label_values(&[name, target])
                .set(result.hops.len() as f64);

            for hop in &result.hops {
                let ttl = hop.ttl.to_string();
                let path = hop.address_to.as_str();
                let values = [
                    hop.last.as_secs_f64(),
                    hop.sum.as_secs_f64(),
                    hop.best.as_secs_f64(),
                    hop.mean.as_secs_f64(),
                    hop.worst.as_secs_f64(),
                    hop.squared_deviation.as_secs_f64(),
                    hop.uncorrected_sd.as_secs_f64(),
                    hop.corrected_sd.as_secs_f64(),
                    hop.range.as_secs_f64(),
                    hop.loss,
                ];
                for (rtt_type, value) in RTT_TYPES.into_iter().zip(values) {
                    set.rtt
                        .with_label_values(&[name, target, &ttl, path, rtt_type])
                        .set(value);
                }
            }

            for (key, summary) in &result.hop_summary {
                let ttl = key.split('_').next().unwrap_or_default();
                let hop_labels = [name, target, ttl, summary.address_to.as_str()];
                set.snt
                    .with_label_values(&hop_labels)
                    .set(summary.snt as f64);
                set.snt_fail
                    .with_label_values(&hop_labels)
                    .set(summary.snt_fail as f64);
                set.snt_time
                    .with_label_values(&hop_labels)
                    .set(summary.snt_time.as_secs_f64());
            }
        }

        self.cache.for_each(|set| families.extend(set.collect()));
        families
    }
}
