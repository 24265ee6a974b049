//! TCP registry: one worker per (target, resolved address). Targets name
//! their peer as `host:port`.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use crate::config::{Config, SafeConfig, TargetConfig, split_host_port};
use crate::monitor::{add_jitter, parse_source, worker_key};
use crate::probe::TcpReturn;
use crate::resolver::Resolver;
use crate::target::tcp::{TcpSettings, TcpTarget};

const KIND: &str = "TCP";

pub struct TcpMonitor {
    sc: Arc<SafeConfig>,
    resolver: Arc<Resolver>,
    max_concurrent_jobs: usize,
    targets: RwLock<HashMap<String, Arc<TcpTarget>>>,
}

impl TcpMonitor {
    pub fn new(sc: Arc<SafeConfig>, resolver: Arc<Resolver>, max_concurrent_jobs: usize) -> Self {
        Self {
            sc,
            resolver,
            max_concurrent_jobs,
            targets: RwLock::new(HashMap::new()),
        }
    }

    fn settings(&self, cfg: &Config) -> TcpSettings {
        TcpSettings {
            interval: cfg.tcp.interval,
            timeout: cfg.tcp.timeout,
            max_concurrent_jobs: self.max_concurrent_jobs,
        }
    }

    /// `host:port` split plus resolution; malformed targets are skipped
    /// with a warning.
    async fn resolve_target(&self, target: &TargetConfig) -> Option<(String, u16, Vec<IpAddr>)> {
        let (host, port) = match split_host_port(&target.host) {
            Ok(parts) => parts,
            Err(e) => {
                tracing::warn!(kind = KIND, instance = %target.name, err = %e, "skipping target");
                return None;
            }
        };
        match self.resolver.dest_addrs(&host).await {
            Ok(ips) if !ips.is_empty() => Some((host, port, ips)),
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
            let src = match parse_source(target) {
                Ok(src) => src,
                Err(()) => continue,
            };
            let Some((host, port, ips)) = self.resolve_target(target).await else {
                continue;
            };
            for ip in ips {
                let key = worker_key(&target.name, ip);
                if self.targets.read().contains_key(&key) {
                    continue;
                }
                self.add_target(&cfg, key, target, &host, ip, port, src);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn add_target(
        &self,
        cfg: &Config,
        key: String,
        target: &TargetConfig,
        host: &str,
        ip: IpAddr,
        port: u16,
        src: Option<IpAddr>,
    ) {
        let delay = add_jitter(cfg.tcp.interval);
        tracing::info!(kind = KIND, instance = %key, host = %host, port, delay = ?delay, "adding target");
        let worker = TcpTarget::new(
            delay,
            key.clone(),
            host.to_string(),
            ip,
            port,
            src,
            target.labels.clone(),
            self.settings(cfg),
        );
        if let Some(old) = self.targets.write().insert(key, worker) {
            tokio::spawn(async move { old.stop().await });
        }
    }

    pub async fn del_targets(&self) {
        let cfg = self.sc.current();
        let mut desired = HashSet::new();
        for target in cfg.targets.iter().filter(|t| t.is_kind(KIND)) {
            if let Some((_, _, ips)) = self.resolve_target(target).await {
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
            let Some((host, port, ips)) = self.resolve_target(target).await else {
                continue;
            };
            if ips.contains(&bound_ip) {
                continue;
            }

            tracing::info!(kind = KIND, instance = %key, host = %host,
                "bound address no longer resolves, rebinding");
            self.remove_target(&key).await;
            for ip in ips {
                self.add_target(&cfg, worker_key(&target.name, ip), target, &host, ip, port, src);
            }
        }
    }

    pub async fn stop(&self) {
        let all: Vec<String> = self.targets.read().keys().cloned().collect();
        for key in all {
            self.remove_target(&key).await;
        }
    }

    pub fn export_metrics(&self) -> HashMap<String, TcpReturn> {
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
