//! MTR registry: one worker per target name, bound to the first resolved
//! address.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use crate::config::{Config, MtrProtocol, SafeConfig, TargetConfig, split_host_port};
use crate::monitor::{add_jitter, parse_source};
use crate::probe::{IcmpIdSequence, MtrResult};
use crate::resolver::Resolver;
use crate::target::mtr::{MtrSettings, MtrTarget};

const KIND: &str = "MTR";

pub struct MtrMonitor {
    sc: Arc<SafeConfig>,
    resolver: Arc<Resolver>,
    icmp_id: Arc<IcmpIdSequence>,
    ipv6: bool,
    max_concurrent_jobs: usize,
    targets: RwLock<HashMap<String, Arc<MtrTarget>>>,
}

impl MtrMonitor {
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

    fn settings(&self, cfg: &Config) -> MtrSettings {
        MtrSettings {
            interval: cfg.mtr.interval,
            timeout: cfg.mtr.timeout,
            max_hops: cfg.mtr.max_hops,
            count: cfg.mtr.count,
            payload_size: cfg.mtr.payload_size,
            protocol: cfg.mtr.protocol,
            tcp_port: cfg.mtr.tcp_port,
            ipv6: self.ipv6,
            max_concurrent_jobs: self.max_concurrent_jobs,
        }
    }

    /// A `host:port` form is honored only for the tcp protocol; otherwise
    /// the default tcp_port rides along unused.
    fn split_target(cfg: &Config, target: &TargetConfig) -> (String, u16) {
        if cfg.mtr.protocol == MtrProtocol::Tcp {
            if let Ok((host, port)) = split_host_port(&target.host) {
                return (host, port);
            }
        }
        (target.host.clone(), cfg.mtr.tcp_port)
    }

    async fn resolve_first(&self, host: &str) -> Option<IpAddr> {
        match self.resolver.dest_addrs(host).await {
            Ok(ips) if !ips.is_empty() => ips.first().copied(),
            Ok(_) => {
                tracing::warn!(kind = KIND, instance = %host, "no addresses resolved, skipping");
                None
            }
            Err(e) => {
                tracing::warn!(kind = KIND, instance = %host, err = %e, "skipping resolve");
                None
            }
        }
    }

    pub async fn add_targets(&self) {
        let cfg = self.sc.current();
        for target in cfg.targets.iter().filter(|t| t.is_kind(KIND)) {
            if self.targets.read().contains_key(&target.name) {
                continue;
            }
            let src = match parse_source(target) {
                Ok(src) => src,
                Err(()) => continue,
            };
            let (host, _port) = Self::split_target(&cfg, target);
            let Some(ip) = self.resolve_first(&host).await else {
                continue;
            };
            self.add_target(&cfg, target, ip, src);
        }
    }

    fn add_target(&self, cfg: &Config, target: &TargetConfig, ip: IpAddr, src: Option<IpAddr>) {
        let (host, port) = Self::split_target(cfg, target);
        let mut settings = self.settings(cfg);
        settings.tcp_port = port;
        let delay = add_jitter(cfg.mtr.interval);
        tracing::info!(kind = KIND, instance = %target.name, host = %host, ip = %ip, delay = ?delay,
            "adding target");
        let worker = MtrTarget::new(
            self.icmp_id.clone(),
            delay,
            target.name.clone(),
            host,
            ip,
            src,
            target.labels.clone(),
            settings,
        );
        if let Some(old) = self.targets.write().insert(target.name.clone(), worker) {
            tokio::spawn(async move { old.stop().await });
        }
    }

    pub async fn del_targets(&self) {
        let cfg = self.sc.current();
        let desired: HashSet<&str> = cfg
            .targets
            .iter()
            .filter(|t| t.is_kind(KIND))
            .map(|t| t.name.as_str())
            .collect();

        let stale: Vec<String> = self
            .targets
            .read()
            .keys()
            .filter(|key| !desired.contains(key.as_str()))
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

    pub async fn check_active_targets(&self) {
        let cfg = self.sc.current();
        let live: Vec<(String, IpAddr)> = self
            .targets
            .read()
            .iter()
            .map(|(key, worker)| (key.clone(), worker.ip()))
            .collect();

        for (name, bound_ip) in live {
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
            let (host, _port) = Self::split_target(&cfg, target);
            let ips = match self.resolver.dest_addrs(&host).await {
                Ok(ips) if !ips.is_empty() => ips,
                _ => continue,
            };
            if ips.contains(&bound_ip) {
                continue;
            }

            tracing::info!(kind = KIND, instance = %name, host = %host,
                "bound address no longer resolves, rebinding");
            self.remove_target(&name).await;
            if let Some(ip) = ips.first().copied() {
                self.add_target(&cfg, target, ip, src);
            }
        }
    }

    pub async fn stop(&self) {
        let all: Vec<String> = self.targets.read().keys().cloned().collect();
        for key in all {
            self.remove_target(&key).await;
        }
    }

    pub fn export_metrics(&self) -> HashMap<String, MtrResult> {
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
