//! PING worker: periodic Echo bursts against one resolved address.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::probe::{IcmpIdSequence, PingResult, ping};
use crate::target::{spawn_probe_loop, stop_worker};

/// Scalar knobs shared by every ping worker of one monitor.
#[derive(Debug, Clone, Copy)]
pub struct PingSettings {
    pub interval: Duration,
    pub timeout: Duration,
    pub count: u64,
    pub payload_size: usize,
    pub ipv6: bool,
    pub max_concurrent_jobs: usize,
}

pub struct PingTarget {
    name: String,
    host: String,
    ip: IpAddr,
    src: Option<IpAddr>,
    labels: HashMap<String, String>,
    settings: PingSettings,
    icmp_id: Arc<IcmpIdSequence>,
    result: RwLock<Option<PingResult>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl PingTarget {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        icmp_id: Arc<IcmpIdSequence>,
        startup_delay: Duration,
        name: String,
        host: String,
        ip: IpAddr,
        src: Option<IpAddr>,
        labels: HashMap<String, String>,
        settings: PingSettings,
    ) -> Arc<Self> {
        let target = Arc::new(Self {
            name,
            host,
            ip,
            src,
            labels,
            settings,
            icmp_id,
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
        let id = self.icmp_id.next();
        let mut data = ping(
            &self.host,
            self.ip,
            self.src,
            self.settings.count,
            self.settings.timeout,
            id,
            self.settings.payload_size,
            self.settings.ipv6,
        )
        .await;

        let mut slot = self.result.write();
        // The snt counters are monotonic across runs
        if let Some(prev) = slot.as_ref() {
            data.snt_summary += prev.snt_summary;
            data.snt_fail_summary += prev.snt_fail_summary;
            data.snt_time_summary += prev.snt_time_summary;
        }
        tracing::debug!(instance = %self.name, result = ?data, "ping result");
        *slot = Some(data);
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

    /// Snapshot of the last published result.
    pub fn compute(&self) -> Option<PingResult> {
        self.result.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> PingSettings {
        PingSettings {
            interval: Duration::from_millis(50),
            timeout: Duration::from_millis(20),
            // Zero echoes: the probe publishes without touching the network
            count: 0,
            payload_size: 56,
            ipv6: false,
            max_concurrent_jobs: 3,
        }
    }

    #[tokio::test]
    async fn test_worker_publishes_and_accumulates() {
        let target = PingTarget::new(
            Arc::new(IcmpIdSequence::new()),
            Duration::ZERO,
            "lh 127.0.0.1".to_string(),
            "lh".to_string(),
            "127.0.0.1".parse().unwrap(),
            None,
            HashMap::new(),
            settings(),
        );

        assert!(target.compute().is_none());
        tokio::time::sleep(Duration::from_millis(120)).await;

        let result = target.compute().expect("result after first interval");
        assert_eq!(result.dest_ip, "127.0.0.1");
        assert!(!result.success);

        target.stop().await;
        // Stopped worker keeps serving its last snapshot
        assert!(target.compute().is_some());
    }
}
