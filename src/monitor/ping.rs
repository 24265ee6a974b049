//! PING registry: one worker per (target, resolved address).

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use crate::config::{Config, SafeConfig, TargetConfig};
use crate::monitor::{add_jitter, parse_source, worker_key};
use crate::probe::{IcmpIdSequence, PingResult};
use crate::resolver::Resolver;
use crate::target::ping::{PingSettings, PingTarget};

const KIND: &str = "ICMP";

pub struct PingMonitor {
    sc: Arc<SafeConfig>,
    resolver: Arc<Resolver>,
    icmp_id: Arc<IcmpIdSequence>,
    ipv6: bool,
    max_concurrent_jobs: usize,
    targets: RwLock<HashMap<String, Arc<PingTarget>>>,
}

impl PingMonitor {
    pub fn new(
        sc: Arc<SafeConfig>,
        resolver: Arc<Resolver>,
        icmp_id: Arc<IcmpIdSequence>,
        ipv6: bool,
        max_concurrent_jobs: usize,
    ) -> Self {
        Self {
            sc,
            resolver,
            icmp_id,
            ipv6,
            max_concurrent_jobs,
            targets: RwLock::new(HashMap::new()),
        }
    }

    fn settings(&self, cfg: &Config) -> PingSettings {
        PingSettings {
            interval: cfg.icmp.interval,
            timeout: cfg.icmp.timeout,
            count: cfg.icmp.count,
            payload_size: cfg.icmp.payload_size,
            ipv6: self.ipv6,
            max_concurrent_jobs: self.max_concurrent_jobs,
        }
    }

    /// Desired worker keys for one configured target.
    async fn resolve_target(&self, target: &TargetConfig) -> Option<Vec<IpAddr>> {
        match self.resolver.dest_addrs(&target.host).await {
            Ok(ips) if !ips.is_empty() => Some(ips),
            Ok(_) => {
                tracing::warn!(kind = KIND, instance = %target.host, "no addresses resolved, skipping");
                None
            }
            Err(e) => {
                tracing::warn!(kind = KIND, instance = %target.host, err = %e, "skipping resolve");
                None
            }
        }
    }

    /// Start workers for configured targets that have none yet.
    pub async fn add_targets(&self) {
        let cfg = self.sc.current();
        for target in cfg.targets.iter().filter(|t| t.is_kind(KIND)) {
            let src = match parse_source(target) {
                Ok(src) => src,
                Err(()) => continue,
            };
            let Some(ips) = self.resolve_target(target).await else {
                continue;
            };
            for ip in ips {
                let key = worker_key(&target.name, ip);
                if self.targets.read().contains_key(&key) {
                    continue;
                }
                self.add_target(&cfg, key, target, ip, src);
            }
        }
    }

    fn add_target(
        &self,
        cfg: &Config,
        key: String,
        target: &TargetConfig,
        ip: IpAddr,
        src: Option<IpAddr>,
    ) {
        let delay = add_jitter(cfg.icmp.interval);
        tracing::info!(kind = KIND, instance = %key, host = %target.host, delay = ?delay, "adding target");
        let worker = PingTarget::new(
            self.icmp_id.clone(),
            delay,
            key.clone(),
            target.host.clone(),
            ip,
            src,
            target.labels.clone(),
            self.settings(cfg),
        );
        if let Some(old) = self.targets.write().insert(key, worker) {
            tokio::spawn(async move { old.stop().await });
        }
    }

    /// Stop workers whose targets left the configuration.
    pub async fn del_targets(&self) {
        let cfg = self.sc.current();
        let mut desired = HashSet::new();
        for target in cfg.targets.iter().filter(|t| t.is_kind(KIND)) {
            if let Some(ips) = self.resolve_target(target).await {
                for ip in ips {
                    desired.insert(worker_key(&target.name, ip));
                }
            }
        }

        let stale: Vec<String> = self
            .targets
            .read()
            .keys()
            .filter(|key| !desired.contains(*key))
            .cloned()
            .collect();
        for key in stale {
            self.remove_target(&key).await;
        }
    }

    async fn remove_target(&self, key: &str) {
        // Take the worker out under the lock, stop it after releasing
        let worker = self.targets.write().remove(key);
        if let Some(worker) = worker {
            tracing::info!(kind = KIND, instance = %key, "removing target");
            worker.stop().await;
        }
    }

    /// Rebind workers whose hostname no longer resolves to their bound IP.
    pub async fn check_active_targets(&self) {
        let cfg = self.sc.current();
        let live: Vec<(String, IpAddr)> = self
            .targets
            .read()
            .iter()
            .map(|(key, worker)| (key.clone(), worker.ip()))
            .collect();

        for (key, bound_ip) in live {
            let Some((name, _)) = key.rsplit_once(' ') else {
                continue;
            };
            let Some(target) = cfg
                .targets
                .iter()
                .find(|t| t.is_kind(KIND) && t.name == name)
            else {
                continue;
            };
            let src = match parse_source(target) {
                Ok(src) => src,
                Err(()) => continue,
            };
            let Some(ips) = self.resolve_target(target).await else {
                continue;
            };
            if ips.contains(&bound_ip) {
                continue;
            }

            tracing::info!(kind = KIND, instance = %key, host = %target.host,
                "bound address no longer resolves, rebinding");
            self.remove_target(&key).await;
            for ip in ips {
                self.add_target(&cfg, worker_key(&target.name, ip), target, ip, src);
            }
        }
    }

    /// Stop everything (shutdown).
    pub async fn stop(&self) {
        let all: Vec<String> = self.targets.read().keys().cloned().collect();
        for key in all {
            self.remove_target(&key).await;
        }
    }

    /// Snapshot of every worker's last result, for the scrape path.
    pub fn export_metrics(&self) -> HashMap<String, PingResult> {
        self.targets
            .read()
            .iter()
            .filter_map(|(key, worker)| worker.compute().map(|r| (key.clone(), r)))
            .collect()
    }

    pub fn export_labels(&self) -> HashMap<String, HashMap<String, String>> {
        self.targets
            .read()
            .iter()
            .map(|(key, worker)| (key.clone(), worker.labels().clone()))
            .collect()
    }

    pub fn inventory(&self) -> Vec<String> {
        self.targets
            .read()
            .values()
            .map(|w| format!("{} ({}/{})", w.name(), w.host(), w.ip()))
            .collect()
    }
}
