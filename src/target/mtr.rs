//! MTR worker: periodic traceroute sweeps with cross-run hop summaries.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::MtrProtocol;
use crate::probe::mtr::merge_hop_summaries;
use crate::probe::{IcmpIdSequence, MtrResult, mtr};
use crate::target::{spawn_probe_loop, stop_worker};

#[derive(Debug, Clone, Copy)]
pub struct MtrSettings {
    pub interval: Duration,
    pub timeout: Duration,
    pub max_hops: u16,
    pub count: u64,
    pub payload_size: usize,
    pub protocol: MtrProtocol,
    pub tcp_port: u16,
    pub ipv6: bool,
    pub max_concurrent_jobs: usize,
}

pub struct MtrTarget {
    name: String,
    host: String,
    ip: IpAddr,
    src: Option<IpAddr>,
    labels: HashMap<String, String>,
    settings: MtrSettings,
    icmp_id: Arc<IcmpIdSequence>,
    result: RwLock<Option<MtrResult>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl MtrTarget {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        icmp_id: Arc<IcmpIdSequence>,
        startup_delay: Duration,
        name: String,
        host: String,
        ip: IpAddr,
        src: Option<IpAddr>,
        labels: HashMap<String, String>,
        settings: MtrSettings,
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
        let mut data = mtr(
            &self.host,
            self.ip,
            self.src,
            self.settings.max_hops,
            self.settings.count,
            self.settings.timeout,
            id,
            self.settings.payload_size,
            self.settings.protocol,
            self.settings.tcp_port,
            self.settings.ipv6,
        )
        .await;

        if data.hops.is_empty() {
            tracing::warn!(instance = %self.name, "mtr run produced no hops");
        }

        let mut slot = self.result.write();
        let mut summary = slot
            .take()
            .map(|previous| previous.hop_summary)
            .unwrap_or_default();
        merge_hop_summaries(&mut summary, &data.hops);
        data.hop_summary = summary;
        tracing::debug!(instance = %self.name, hops = data.hops.len(), "mtr result");
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

    pub fn compute(&self) -> Option<MtrResult> {
        self.result.read().clone()
    }
}
