//! TCP worker: periodic timed connects against one resolved address.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::probe::{TcpReturn, tcp_connect};
use crate::target::{spawn_probe_loop, stop_worker};

#[derive(Debug, Clone, Copy)]
pub struct TcpSettings {
    pub interval: Duration,
    pub timeout: Duration,
    pub max_concurrent_jobs: usize,
}

pub struct TcpTarget {
    name: String,
    host: String,
    ip: IpAddr,
    port: u16,
    src: Option<IpAddr>,
    labels: HashMap<String, String>,
    settings: TcpSettings,
    result: RwLock<Option<TcpReturn>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl TcpTarget {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        startup_delay: Duration,
        name: String,
        host: String,
        ip: IpAddr,
        port: u16,
        src: Option<IpAddr>,
        labels: HashMap<String, String>,
        settings: TcpSettings,
    ) -> Arc<Self> {
        let target = Arc::new(Self {
            name,
            host,
            ip,
            port,
            src,
            labels,
            settings,
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
        let data = tcp_connect(
            &self.host,
            self.ip,
            self.src,
            self.port,
            self.settings.timeout,
        )
        .await;
        tracing::debug!(instance = %self.name, result = ?data, "tcp result");
        *self.result.write() = Some(data);
    }

    pub async fn stop(&self) {
        stop_worker(&self.cancel, &self.tracker).await;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn labels(&self) -> &HashMap<String, String> {
        &self.labels
    }

    pub fn compute(&self) -> Option<TcpReturn> {
        self.result.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_worker_probes_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let target = TcpTarget::new(
            Duration::ZERO,
            "lh 127.0.0.1".to_string(),
            "lh".to_string(),
            "127.0.0.1".parse().unwrap(),
            port,
            None,
            HashMap::new(),
            TcpSettings {
                interval: Duration::from_millis(50),
                timeout: Duration::from_millis(500),
                max_concurrent_jobs: 3,
            },
        );

        tokio::time::sleep(Duration::from_millis(150)).await;
        let result = target.compute().expect("result after first interval");
        assert!(result.success);
        assert_eq!(result.dest_port, port);
        assert!(result.con_time > Duration::ZERO);

        target.stop().await;
    }
}
