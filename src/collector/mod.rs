//! Scrape-side metric assembly: per-kind collectors that turn worker
//! snapshots into metric families, plus the descriptor cache that interns
//! one family set per user-label fingerprint.

pub mod http;
pub mod mtr;
pub mod ping;
pub mod tcp;

pub use http::HttpCollector;
pub use mtr::MtrCollector;
pub use ping::PingCollector;
pub use tcp::TcpCollector;

use parking_lot::RwLock;
use prometheus::Encoder;
use prometheus::TextEncoder;
use prometheus::proto::MetricFamily;
use std::collections::HashMap;
use std::sync::Arc;

/// Stable fingerprint of a label-value set.
pub fn label_fingerprint(labels: &HashMap<String, String>) -> String {
    let mut pairs: Vec<_> = labels.iter().collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Interns one metric-family set per label-value fingerprint. The metrics
/// library rejects two physically distinct descriptors with the same name,
/// so equal label maps must share one set. Insert-only; entries live as
/// long as the process.
pub struct DescriptorCache<T> {
    sets: RwLock<HashMap<String, Arc<T>>>,
}

impl<T> Default for DescriptorCache<T> {
    fn default() -> Self {
        Self {
            sets: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> DescriptorCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Double-checked lookup: read-lock miss, write-lock re-check, insert.
    pub fn get_or_create<F: FnOnce() -> T>(
        &self,
        labels: &HashMap<String, String>,
        build: F,
    ) -> Arc<T> {
        let key = label_fingerprint(labels);
        {
            let sets = self.sets.read();
            if let Some(set) = sets.get(&key) {
                return set.clone();
            }
        }
        let mut sets = self.sets.write();
        if let Some(set) = sets.get(&key) {
            return set.clone();
        }
        let set = Arc::new(build());
        sets.insert(key, set.clone());
        set
    }

    /// Visit every interned set (reset-before-fill on the scrape path).
    pub fn for_each(&self, mut f: impl FnMut(&Arc<T>)) {
        for set in self.sets.read().values() {
            f(set);
        }
    }
}

/// Families with equal names must be emitted as one block; the collectors
/// produce one family per label fingerprint, so group them here. Empty
/// families are dropped.
pub fn merge_families(families: Vec<MetricFamily>) -> Vec<MetricFamily> {
    let mut merged: Vec<MetricFamily> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for mut family in families {
        if family.get_metric().is_empty() {
            continue;
        }
        match index.get(family.get_name()) {
            Some(&i) => {
                for metric in family.take_metric().into_iter() {
                    merged[i].mut_metric().push(metric);
                }
            }
            None => {
                index.insert(family.get_name().to_string(), merged.len());
                merged.push(family);
            }
        }
    }
    merged
}

/// Text exposition of the given families plus the default registry
/// (process metrics and friends).
pub fn encode_metrics(mut families: Vec<MetricFamily>) -> String {
    families.extend(prometheus::gather());
    let families = merge_families(families);
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&families, &mut buffer) {
        tracing::error!(err = %e, "metric encoding failed");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// The worker key carries `"<name> <ip>"` for the per-address kinds; the
/// name label is the part before the address.
pub(crate) fn name_from_key(key: &str) -> &str {
    key.rsplit_once(' ').map(|(name, _)| name).unwrap_or(key)
}
