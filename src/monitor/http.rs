//! HTTPGet registry: one worker per target name. The target host is the
//! URL itself; resolution happens inside the tracer on each probe.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use url::Url;

use crate::config::{Config, SafeConfig, TargetConfig};
use crate::monitor::{add_jitter, parse_source};
use crate::probe::{HttpResult, TransportCache};
use crate::resolver::Resolver;
use crate::target::http::{HttpSettings, HttpTarget};

const KIND: &str = "HTTPGet";

pub struct HttpMonitor {
    sc: Arc<SafeConfig>,
    resolver: Arc<Resolver>,
    transports: Arc<TransportCache>,
    max_concurrent_jobs: usize,
    targets: RwLock<HashMap<String, Arc<HttpTarget>>>,
}

impl HttpMonitor {
    pub fn new(
        sc: Arc<SafeConfig>,
        resolver: Arc<Resolver>,
        transports: Arc<TransportCache>,
        max_concurrent_jobs: usize,
    ) -> Self {
        Self {
            sc,
            resolver,
            transports,
            max_concurrent_jobs,
            targets: RwLock::new(HashMap::new()),
        }
    }

    fn settings(&self, cfg: &Config) -> HttpSettings {
        HttpSettings {
            interval: cfg.http_get.interval,
            timeout: cfg.http_get.timeout,
            max_concurrent_jobs: self.max_concurrent_jobs,
        }
    }

    /// Both the target URL and the proxy URL (when present) must parse
    /// before a worker is constructed.
    fn validate_target(target: &TargetConfig) -> Option<Option<Url>> {
        if let Err(e) = Url::parse(&target.host) {
            tracing::warn!(kind = KIND, instance = %target.name, url = %target.host, err = %e,
                "invalid url, skipping target");
            return None;
        }
        match &target.proxy {
            None => Some(None),
            Some(raw) => match Url::parse(raw) {
                Ok(proxy) => Some(Some(proxy)),
                Err(e) => {
                    tracing::warn!(kind = KIND, instance = %target.name, proxy = %raw, err = %e,
                        "invalid proxy url, skipping target");
                    None
                }
            },
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
            let Some(proxy) = Self::validate_target(target) else {
                continue;
            };

            let delay = add_jitter(cfg.http_get.interval);
            tracing::info!(kind = KIND, instance = %target.name, url = %target.host, delay = ?delay,
                "adding target");
            let worker = HttpTarget::new(
                self.transports.clone(),
                self.resolver.clone(),
                delay,
                target.name.clone(),
                target.host.clone(),
                src,
                proxy,
                target.labels.clone(),
                self.settings(&cfg),
            );
            if let Some(old) = self.targets.write().insert(target.name.clone(), worker) {
                tokio::spawn(async move { old.stop().await });
            }
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

    pub async fn stop(&self) {
        let all: Vec<String> = self.targets.read().keys().cloned().collect();
        for key in all {
            self.remove_target(&key).await;
        }
    }

    pub fn export_metrics(&self) -> HashMap<String, HttpResult> {
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
            .map(|w| format!("{} ({})", w.name(), w.url()))
            .collect()
    }
}
