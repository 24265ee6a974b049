//! `tcp_*` metric families.

use prometheus::core::Collector;
use prometheus::proto::MetricFamily;
use prometheus::{Gauge, GaugeVec, Opts};
use std::collections::HashMap;
use std::sync::Arc;

use crate::collector::{DescriptorCache, name_from_key};
use crate::monitor::TcpMonitor;

const LABELS: [&str; 4] = ["name", "target", "target_ip", "port"];

pub struct TcpMetricSet {
    time: GaugeVec,
    status: GaugeVec,
}

impl TcpMetricSet {
    fn new(const_labels: &HashMap<String, String>) -> Self {
        let vec = |name: &str, help: &str| {
            GaugeVec::new(
                Opts::new(name, help).const_labels(const_labels.clone()),
                &LABELS,
            )
            .expect("static metric family")
        };
        Self {
            time: vec("tcp_connection_seconds", "Connection time in seconds"),
            status: vec("tcp_connection_status", "Connection Status"),
        }
    }

    fn reset(&self) {
        self.time.reset();
        self.status.reset();
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let mut families = Vec::new();
        families.extend(self.time.collect());
        families.extend(self.status.collect());
        families
    }
}

pub struct TcpCollector {
    monitor: Arc<TcpMonitor>,
    cache: DescriptorCache<TcpMetricSet>,
}

impl TcpCollector {
    pub fn new(monitor: Arc<TcpMonitor>) -> Self {
        Self {
            monitor,
            cache: DescriptorCache::new(),
        }
    }

    pub fn collect(&self) -> Vec<MetricFamily> {
        let metrics = self.monitor.export_metrics();
        let labels = self.monitor.export_labels();

        let mut families = Vec::new();
        let up = Gauge::new("tcp_up", "Exporter state").expect("static metric");
        up.set(if metrics.is_empty() { 0.0 } else { 1.0 });
        families.extend(up.collect());
        let targets = Gauge::new("tcp_targets", "Number of active targets").expect("static metric");
        targets.set(labels.len() as f64);
        families.extend(targets.collect());

        let resolved: Vec<_> = metrics
            .iter()
            .map(|(key, result)| {
                let user_labels = labels.get(key).cloned().unwrap_or_default();
                let set = self
                    .cache
                    .get_or_create(&user_labels, || TcpMetricSet::new(&user_labels));
                (key, result, set)
            })
            .collect();
        self.cache.for_each(|set| set.reset());

        for (key, result, set) in resolved {
            let port = result.dest_port.to_string();
            let base = [
                name_from_key(key),
                result.dest_addr.as_str(),
                result.dest_ip.as_str(),
                port.as_str(),
            ];
            set.time
                .with_label_values(&base)
                .set(result.con_time.as_secs_f64());
            set.status
                .with_label_values(&base)
                .set(if result.success { 1.0 } else { 0.0 });
        }

        self.cache.for_each(|set| families.extend(set.collect()));
        families
    }
}
