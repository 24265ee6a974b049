//! Target workers: one independent jittered scheduler per resolved target.

pub mod http;
pub mod mtr;
pub mod ping;
pub mod tcp;

pub use http::HttpTarget;
pub use mtr::MtrTarget;
pub use ping::PingTarget;
pub use tcp::TcpTarget;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// The shared probe loop: wait out the startup jitter, fire one probe
/// immediately, then one per interval tick. A tick that finds all probe
/// slots taken is dropped, never queued. Ticks missed while probing are
/// skipped rather than bursted.
pub(crate) fn spawn_probe_loop<F, Fut>(
    cancel: CancellationToken,
    tracker: TaskTracker,
    startup_delay: Duration,
    interval: Duration,
    jobs: Arc<Semaphore>,
    probe: F,
) where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let loop_cancel = cancel.clone();
    let loop_tracker = tracker.clone();
    tracker.spawn(async move {
        if !startup_delay.is_zero() {
            tokio::select! {
                _ = loop_cancel.cancelled() => return,
                _ = tokio::time::sleep(startup_delay) => {}
            }
        }

        // The first tick completes at once, so the first probe follows the
        // jitter directly instead of waiting out a full interval.
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = loop_cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let Ok(permit) = jobs.clone().try_acquire_owned() else {
                        tracing::debug!("probe slots saturated, dropping tick");
                        continue;
                    };
                    let fut = probe();
                    loop_tracker.spawn(async move {
                        fut.await;
                        drop(permit);
                    });
                }
            }
        }
    });
}

/// Cancel the loop and wait for in-flight probes to drain.
pub(crate) async fn stop_worker(cancel: &CancellationToken, tracker: &TaskTracker) {
    cancel.cancel();
    tracker.close();
    tracker.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_first_probe_fires_right_after_jitter() {
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        spawn_probe_loop(
            cancel.clone(),
            tracker.clone(),
            Duration::ZERO,
            Duration::from_secs(3600),
            Arc::new(Semaphore::new(1)),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        // Well under one interval: only the immediate first probe has run
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        stop_worker(&cancel, &tracker).await;
    }

    #[tokio::test]
    async fn test_saturated_ticks_are_dropped() {
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let started = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(tokio::sync::Notify::new());

        let counter = started.clone();
        let hold = gate.clone();
        spawn_probe_loop(
            cancel.clone(),
            tracker.clone(),
            Duration::ZERO,
            Duration::from_millis(10),
            Arc::new(Semaphore::new(1)),
            move || {
                let counter = counter.clone();
                let hold = hold.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    // Block the single slot until released
                    hold.notified().await;
                }
            },
        );

        // Many ticks elapse while the only slot is held
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(started.load(Ordering::SeqCst), 1);

        gate.notify_waiters();
        stop_worker(&cancel, &tracker).await;
    }

    #[tokio::test]
    async fn test_stop_waits_for_inflight_probe() {
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let events = log.clone();
        spawn_probe_loop(
            cancel.clone(),
            tracker.clone(),
            Duration::ZERO,
            Duration::from_secs(3600),
            Arc::new(Semaphore::new(1)),
            move || {
                let events = events.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    events.lock().push("probe done");
                }
            },
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        stop_worker(&cancel, &tracker).await;
        log.lock().push("stopped");

        assert_eq!(*log.lock(), vec!["probe done", "stopped"]);
    }

    #[tokio::test]
    async fn test_cancel_during_jitter_exits_cleanly() {
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        spawn_probe_loop(
            cancel.clone(),
            tracker.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(1),
            Arc::new(Semaphore::new(1)),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        stop_worker(&cancel, &tracker).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
