//! HTTPGet worker: periodic traced GETs against one URL.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use url::Url;

use crate::probe::{HttpResult, TransportCache, http_get};
use crate::resolver::Resolver;
use crate::target::{spawn_probe_loop, stop_worker};

#[derive(Debug, Clone, Copy)]
pub struct HttpSettings {
    pub interval: Duration,
    pub timeout: Duration,
    pub max_concurrent_jobs: usize,
}

pub struct HttpTarget {
    name: String,
    url: String,
    src: Option<IpAddr>,
    proxy: Option<Url>,
    labels: HashMap<String, String>,
    settings: HttpSettings,
    transports: Arc<TransportCache>,
    resolver: Arc<Resolver>,
    result: RwLock<Option<HttpResult>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl HttpTarget {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transports: Arc<TransportCache>,
        resolver: Arc<Resolver>,
        startup_delay: Duration,
        name: String,
        url: String,
        src: Option<IpAddr>,
        proxy: Option<Url>,
        labels: HashMap<String, String>,
        settings: HttpSettings,
    ) -> Arc<Self> {
        let target = Arc::new(Self {
            name,
            url,
            src,
            proxy,
            labels,
            settings,
            transports,
            resolver,
            result: RwLock::new(None),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });

        let worker = target.clone();
        spawn_probe_loop(
            target.cancel.clone(),
            target.tracker.clone(),
            startup_delay,
            settings.interval,
            Arc::new(Semaphore::new(settings.max_concurrent_jobs)),
            move || {
                let worker = worker.clone();
                async move { worker.probe().await }
            },
        );
        target
    }

    async fn probe(&self) {
        let data = match http_get(
            &self.transports,
            &self.url,
            self.src,
            self.proxy.as_ref(),
            self.settings.timeout,
            &self.resolver,
        )
        .await
        {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(instance = %self.name, url = %self.url, err = %e, "http get failed");
                HttpResult {
                    dest_addr: self.url.clone(),
                    ..Default::default()
                }
            }
        };
        tracing::debug!(instance = %self.name, result = ?data, "http result");
        *self.result.write() = Some(data);
    }

    pub async fn stop(&self) {
        stop_worker(&self.cancel, &self.tracker).await;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn labels(&self) -> &HashMap<String, String> {
        &self.labels
    }

    pub fn compute(&self) -> Option<HttpResult> {
        self.result.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failed_probe_publishes_unsuccessful_result() {
        let resolver = Arc::new(Resolver::custom(
            "127.0.0.1:53".parse().unwrap(),
            Duration::from_millis(250),
            true,
        ));
        let target = HttpTarget::new(
            Arc::new(TransportCache::new()),
            resolver,
            Duration::ZERO,
            "blackhole".to_string(),
            "http://192.0.2.1/".to_string(),
            None,
            None,
            HashMap::new(),
            HttpSettings {
                interval: Duration::from_millis(80),
                timeout: Duration::from_millis(30),
                max_concurrent_jobs: 3,
            },
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        let result = target.compute().expect("result after first interval");
        assert!(!result.success);
        assert_eq!(result.dest_addr, "http://192.0.2.1/");
        assert_eq!(result.status, 0);

        target.stop().await;
    }
}
