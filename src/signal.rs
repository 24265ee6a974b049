//! Reload plumbing and unix signal handling: SIGHUP reloads and
//! reconciles, SIGUSR1 dumps the live worker inventory.

use std::sync::Arc;

use crate::config::SafeConfig;
use crate::monitor::Monitors;
use crate::resolver::Resolver;

/// Everything a reload needs, shared by the signal handler and the
/// periodic refresh loop.
pub struct ReloadContext {
    pub sc: Arc<SafeConfig>,
    pub resolver: Arc<Resolver>,
    pub monitors: Arc<Monitors>,
    pub config_source: String,
    pub config_headers: Vec<(String, String)>,
}

impl ReloadContext {
    /// Load the configuration; a failure keeps the previous one and the
    /// live workers.
    async fn reload_config(&self) -> bool {
        tracing::info!(source = %self.config_source, "reloading config");
        if let Err(e) = self
            .sc
            .reload(&self.config_source, &self.config_headers, &self.resolver)
            .await
        {
            tracing::error!(err = %e, "reloading config skipped");
            return false;
        }
        true
    }

    /// SIGHUP path: reload, then add-then-del on every kind.
    pub async fn reload_on_signal(&self) {
        if self.reload_config().await {
            self.monitors.reconcile().await;
        }
    }

    /// Refresh-ticker path: reload, then the del / rebind / add sweep.
    pub async fn reload_on_refresh(&self) {
        if self.reload_config().await {
            self.monitors.refresh().await;
        }
    }
}

#[cfg(unix)]
pub fn spawn_signal_handlers(ctx: Arc<ReloadContext>) {
    use tokio::signal::unix::{SignalKind, signal};

    tokio::spawn(async move {
        let mut hup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(err = %e, "installing SIGHUP handler failed");
                return;
            }
        };
        let mut usr1 = match signal(SignalKind::user_defined1()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(err = %e, "installing SIGUSR1 handler failed");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = hup.recv() => {
                    tracing::debug!("signal: HUP");
                    ctx.reload_on_signal().await;
                }
                _ = usr1.recv() => {
                    tracing::debug!("signal: USR1");
                    for line in ctx.monitors.inventory() {
                        println!("{line}");
                    }
                }
            }
        }
    });
}

/// Windows has no SIGHUP/SIGUSR1; reloads come from the refresh loop only.
#[cfg(not(unix))]
pub fn spawn_signal_handlers(_ctx: Arc<ReloadContext>) {}

/// Periodic `conf.refresh` loop; a zero cadence disables it.
pub fn spawn_refresh_loop(ctx: Arc<ReloadContext>) {
    let interval = ctx.sc.current().conf.refresh;
    if interval.is_zero() {
        return;
    }
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Skip the immediate first tick; the initial load already happened
        ticker.tick().await;
        loop {
            ticker.tick().await;
            ctx.reload_on_refresh().await;
        }
    });
}
