use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

use netprobe::cli::Args;
use netprobe::collector::{HttpCollector, MtrCollector, PingCollector, TcpCollector};
use netprobe::config::SafeConfig;
use netprobe::monitor::{HttpMonitor, Monitors, MtrMonitor, PingMonitor, TcpMonitor};
use netprobe::probe::{IcmpIdSequence, TransportCache};
use netprobe::resolver::Resolver;
use netprobe::server::{self, AppState};
use netprobe::signal::{ReloadContext, spawn_refresh_loop, spawn_signal_handlers};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if let Err(e) = args.validate() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&args.log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting netprobe");

    // The first load runs against the host resolver; SRV expansion cannot
    // use conf.nameserver before the configuration itself is loaded.
    let bootstrap_resolver = Resolver::system(Duration::from_millis(250), args.ipv6);
    let sc = Arc::new(SafeConfig::new());
    sc.reload(&args.config_file, &args.config_file_header, &bootstrap_resolver)
        .await
        .context("loading configuration")?;

    let cfg = sc.current();
    let resolver = Arc::new(match &cfg.conf.nameserver {
        Some(nameserver) => {
            let addr = nameserver
                .parse()
                .with_context(|| format!("parsing conf.nameserver {nameserver:?}"))?;
            tracing::info!(nameserver = %nameserver, "configured custom DNS resolver");
            Resolver::custom(addr, cfg.conf.nameserver_timeout, args.ipv6)
        }
        None => {
            tracing::info!("configured default DNS resolver");
            Resolver::system(cfg.conf.nameserver_timeout, args.ipv6)
        }
    });

    let icmp_id = Arc::new(IcmpIdSequence::new());
    let transports = Arc::new(TransportCache::new());

    let monitors = Arc::new(Monitors {
        ping: Arc::new(PingMonitor::new(
            sc.clone(),
            resolver.clone(),
            icmp_id.clone(),
            args.ipv6,
            args.max_concurrent_jobs,
        )),
        mtr: Arc::new(MtrMonitor::new(
            sc.clone(),
            resolver.clone(),
            icmp_id.clone(),
            args.ipv6,
            args.max_concurrent_jobs,
        )),
        tcp: Arc::new(TcpMonitor::new(
            sc.clone(),
            resolver.clone(),
            args.max_concurrent_jobs,
        )),
        http: Arc::new(HttpMonitor::new(
            sc.clone(),
            resolver.clone(),
            transports,
            args.max_concurrent_jobs,
        )),
    });

    {
        let monitors = monitors.clone();
        tokio::spawn(async move { monitors.add_all().await });
    }

    let ctx = Arc::new(ReloadContext {
        sc: sc.clone(),
        resolver: resolver.clone(),
        monitors: monitors.clone(),
        config_source: args.config_file.clone(),
        config_headers: args.config_file_header.clone(),
    });
    spawn_signal_handlers(ctx.clone());
    spawn_refresh_loop(ctx);

    #[cfg(target_os = "linux")]
    {
        let process = prometheus::process_collector::ProcessCollector::for_self();
        if let Err(e) = prometheus::default_registry().register(Box::new(process)) {
            tracing::warn!(err = %e, "process collector registration failed");
        }
    }

    let auth = match &args.web_config_file {
        Some(path) => Some(server::load_web_config(path).await?),
        None => None,
    };

    let state = Arc::new(AppState {
        ping: PingCollector::new(monitors.ping.clone()),
        mtr: MtrCollector::new(monitors.mtr.clone()),
        tcp: TcpCollector::new(monitors.tcp.clone()),
        http: HttpCollector::new(monitors.http.clone()),
        monitors,
        metrics_path: args.web_metrics_path.clone(),
        profiling: args.profiling,
        auth,
    });

    server::serve(state, &args.web_listen_address).await
}
