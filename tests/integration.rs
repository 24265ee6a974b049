//! Integration tests for the config -> reconciliation -> scrape pipeline.
//!
//! Targets use IP literals so no DNS queries (and no raw-socket
//! privileges) are needed; ping targets run with count = 0, which probes
//! nothing but still publishes results.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use netprobe::collector::{PingCollector, encode_metrics};
use netprobe::config::{Config, SafeConfig, TargetConfig};
use netprobe::monitor::{HttpMonitor, Monitors, MtrMonitor, PingMonitor, TcpMonitor};
use netprobe::probe::{IcmpIdSequence, TransportCache};
use netprobe::resolver::Resolver;

fn target(name: &str, host: &str, kind: &str) -> TargetConfig {
    TargetConfig {
        name: name.to_string(),
        host: host.to_string(),
        kind: kind.to_string(),
        proxy: None,
        probe: None,
        source_ip: None,
        labels: HashMap::new(),
    }
}

fn fast_config(targets: Vec<TargetConfig>) -> Config {
    let mut cfg = Config::default();
    cfg.icmp.interval = Duration::from_millis(50);
    cfg.icmp.timeout = Duration::from_millis(20);
    cfg.icmp.count = 0;
    cfg.mtr.interval = Duration::from_millis(50);
    cfg.mtr.timeout = Duration::from_millis(20);
    cfg.mtr.count = 0;
    cfg.tcp.interval = Duration::from_millis(50);
    cfg.tcp.timeout = Duration::from_millis(20);
    cfg.http_get.interval = Duration::from_millis(50);
    cfg.http_get.timeout = Duration::from_millis(20);
    cfg.targets = targets;
    cfg
}

fn test_resolver() -> Arc<Resolver> {
    // Only IP literals are resolved in these tests; the nameserver is
    // never contacted
    Arc::new(Resolver::custom(
        "127.0.0.1:53".parse().unwrap(),
        Duration::from_millis(250),
        true,
    ))
}

fn monitors(sc: Arc<SafeConfig>) -> Monitors {
    let resolver = test_resolver();
    let icmp_id = Arc::new(IcmpIdSequence::new());
    Monitors {
        ping: Arc::new(PingMonitor::new(
            sc.clone(),
            resolver.clone(),
            icmp_id.clone(),
            true,
            3,
        )),
        mtr: Arc::new(MtrMonitor::new(
            sc.clone(),
            resolver.clone(),
            icmp_id,
            true,
            3,
        )),
        tcp: Arc::new(TcpMonitor::new(sc.clone(), resolver.clone(), 3)),
        http: Arc::new(HttpMonitor::new(
            sc,
            resolver,
            Arc::new(TransportCache::new()),
            3,
        )),
    }
}

#[tokio::test]
async fn test_add_targets_expands_per_kind() {
    let sc = Arc::new(SafeConfig::new());
    sc.replace(fast_config(vec![
        target("both", "127.0.0.1", "ICMP+MTR"),
        target("web", "http://127.0.0.1:1/", "HTTPGet"),
        target("port", "127.0.0.1:9", "TCP"),
    ]))
    .unwrap();

    let m = monitors(sc);
    m.add_all().await;

    // ICMP+MTR lands in both the ping and mtr registries
    assert_eq!(m.ping.export_labels().len(), 1);
    assert!(m.ping.export_labels().contains_key("both 127.0.0.1"));
    assert_eq!(m.mtr.export_labels().len(), 1);
    assert!(m.mtr.export_labels().contains_key("both"));
    assert_eq!(m.tcp.export_labels().len(), 1);
    assert!(m.tcp.export_labels().contains_key("port 127.0.0.1"));
    assert_eq!(m.http.export_labels().len(), 1);
    assert!(m.http.export_labels().contains_key("web"));

    m.ping.stop().await;
    m.mtr.stop().await;
    m.tcp.stop().await;
    m.http.stop().await;
}

#[tokio::test]
async fn test_add_is_idempotent_and_del_converges() {
    let sc = Arc::new(SafeConfig::new());
    sc.replace(fast_config(vec![
        target("a", "127.0.0.1", "ICMP"),
        target("b", "127.0.0.2", "ICMP"),
    ]))
    .unwrap();

    let m = monitors(sc.clone());

    // add ∘ add is the identity on the live set
    m.ping.add_targets().await;
    m.ping.add_targets().await;
    let mut keys: Vec<String> = m.ping.export_labels().into_keys().collect();
    keys.sort();
    assert_eq!(keys, vec!["a 127.0.0.1", "b 127.0.0.2"]);

    // del over an unchanged configuration removes nothing
    m.ping.del_targets().await;
    assert_eq!(m.ping.export_labels().len(), 2);

    // removing one target from the config retires exactly its worker
    sc.replace(fast_config(vec![target("a", "127.0.0.1", "ICMP")]))
        .unwrap();
    m.ping.del_targets().await;
    m.ping.add_targets().await;
    let keys: Vec<String> = m.ping.export_labels().into_keys().collect();
    assert_eq!(keys, vec!["a 127.0.0.1"]);

    m.ping.stop().await;
}

#[tokio::test]
async fn test_rebind_on_ip_change() {
    let sc = Arc::new(SafeConfig::new());
    sc.replace(fast_config(vec![target("a", "127.0.0.1", "ICMP")]))
        .unwrap();

    let m = monitors(sc.clone());
    m.ping.add_targets().await;
    assert!(m.ping.export_labels().contains_key("a 127.0.0.1"));

    // The host now "resolves" elsewhere: the old worker is retired and a
    // fresh one bound to the new address
    sc.replace(fast_config(vec![target("a", "127.0.0.9", "ICMP")]))
        .unwrap();
    m.ping.check_active_targets().await;

    let keys: Vec<String> = m.ping.export_labels().into_keys().collect();
    assert_eq!(keys, vec!["a 127.0.0.9"]);

    m.ping.stop().await;
}

#[tokio::test]
async fn test_malformed_tcp_target_is_skipped() {
    let sc = Arc::new(SafeConfig::new());
    sc.replace(fast_config(vec![
        target("no-port", "127.0.0.1", "TCP"),
        target("ok", "127.0.0.1:9", "TCP"),
    ]))
    .unwrap();

    let m = monitors(sc);
    m.tcp.add_targets().await;

    let keys: Vec<String> = m.tcp.export_labels().into_keys().collect();
    assert_eq!(keys, vec!["ok 127.0.0.1"]);

    m.tcp.stop().await;
}

#[tokio::test]
async fn test_reconcile_after_reload_is_stable() {
    let sc = Arc::new(SafeConfig::new());
    sc.replace(fast_config(vec![
        target("a", "127.0.0.1", "ICMP"),
        target("b", "127.0.0.1:9", "TCP"),
    ]))
    .unwrap();

    let m = monitors(sc.clone());
    m.add_all().await;
    assert_eq!(m.ping.export_labels().len(), 1);
    assert_eq!(m.tcp.export_labels().len(), 1);

    // Reload with target b removed; the signal-style add-then-del pass
    // retires it without disturbing a (and without panicking on b's
    // in-flight probes)
    sc.replace(fast_config(vec![target("a", "127.0.0.1", "ICMP")]))
        .unwrap();
    m.reconcile().await;

    assert_eq!(m.ping.export_labels().len(), 1);
    assert!(m.tcp.export_labels().is_empty());

    // The periodic del / rebind / add sweep is a no-op on a stable config
    m.refresh().await;
    assert_eq!(m.ping.export_labels().len(), 1);
    assert!(m.tcp.export_labels().is_empty());

    m.ping.stop().await;
}

#[tokio::test]
async fn test_scrape_exposes_ping_families() {
    let sc = Arc::new(SafeConfig::new());
    let mut cfg = fast_config(vec![target("lh", "127.0.0.1", "ICMP")]);
    cfg.targets[0]
        .labels
        .insert("dc".to_string(), "local".to_string());
    sc.replace(cfg).unwrap();

    let m = monitors(sc);
    m.ping.add_targets().await;

    // Wait out the jitter (< 5ms) and the first probe
    tokio::time::sleep(Duration::from_millis(200)).await;

    let collector = PingCollector::new(m.ping.clone());
    let text = encode_metrics(collector.collect());

    assert!(text.contains("ping_up 1"));
    assert!(text.contains("ping_targets 1"));
    // count = 0 probes nothing: status 0, loss fraction 0
    assert!(text.contains("ping_status{"));
    assert!(text.contains("name=\"lh\""));
    assert!(text.contains("target_ip=\"127.0.0.1\""));
    assert!(text.contains("dc=\"local\""));
    assert!(text.contains("ping_loss_percent{"));
    assert!(text.contains("ping_rtt_seconds{"));
    assert!(text.contains("type=\"best\""));

    m.ping.stop().await;

    // Workers gone: the exporter reports itself down for the kind
    let text = encode_metrics(collector.collect());
    assert!(text.contains("ping_up 0"));
    assert!(text.contains("ping_targets 0"));
}

#[tokio::test]
async fn test_empty_config_scrape_is_well_formed() {
    let sc = Arc::new(SafeConfig::new());
    sc.replace(fast_config(Vec::new())).unwrap();

    let m = monitors(sc);
    m.add_all().await;

    let collector = PingCollector::new(m.ping.clone());
    let text = encode_metrics(collector.collect());
    assert!(text.contains("ping_up 0"));
    assert!(text.contains("ping_targets 0"));
    assert!(!text.contains("ping_status{"));
}
