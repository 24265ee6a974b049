use clap::{ArgAction, Parser};

/// Multi-probe network reachability and latency exporter (ICMP ping, MTR,
/// TCP connect, HTTP GET).
#[derive(Parser, Debug, Clone)]
#[command(name = "netprobe")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Addresses to listen on for HTTP requests (repeatable)
    #[arg(long = "web.listen-address", default_value = ":9427")]
    pub web_listen_address: Vec<String>,

    /// Path under which the metrics are exposed
    #[arg(long = "web.metrics.path", default_value = "/metrics")]
    pub web_metrics_path: String,

    /// Endpoint-protection configuration file (basic_auth_users)
    #[arg(long = "web.config.file")]
    pub web_config_file: Option<String>,

    /// Exporter configuration file or http(s) URL
    #[arg(long = "config.file", default_value = "/app/cfg/netprobe.toml")]
    pub config_file: String,

    /// KEY=VALUE header for loading the configuration from a URL (repeatable)
    #[arg(long = "config.file.header", value_parser = parse_header)]
    pub config_file_header: Vec<(String, String)>,

    /// Enable IPv6 probing
    #[arg(long = "ipv6", default_value_t = true, action = ArgAction::Set, num_args = 1)]
    pub ipv6: bool,

    /// Expose /debug/vars
    #[arg(long = "profiling")]
    pub profiling: bool,

    /// Maximum concurrent probe operations per target. Higher values raise
    /// throughput at the cost of memory, CPU and file descriptors.
    #[arg(long = "max-concurrent-jobs", default_value_t = 3)]
    pub max_concurrent_jobs: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,
}

fn parse_header(input: &str) -> Result<(String, String), String> {
    input
        .split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected HEADER=VALUE, got {input:?}"))
}

impl Args {
    pub fn validate(&self) -> Result<(), String> {
        if self.web_listen_address.is_empty() {
            return Err("at least one --web.listen-address is required".into());
        }
        if self.max_concurrent_jobs == 0 {
            return Err("--max-concurrent-jobs must be at least 1".into());
        }
        if !self.web_metrics_path.starts_with('/') {
            return Err(format!(
                "--web.metrics.path must start with '/', got {:?}",
                self.web_metrics_path
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["netprobe"]);
        assert_eq!(args.web_listen_address, vec![":9427"]);
        assert_eq!(args.web_metrics_path, "/metrics");
        assert!(args.ipv6);
        assert!(!args.profiling);
        assert_eq!(args.max_concurrent_jobs, 3);
        args.validate().unwrap();
    }

    #[test]
    fn test_repeatable_flags() {
        let args = Args::parse_from([
            "netprobe",
            "--web.listen-address",
            ":9427",
            "--web.listen-address",
            "127.0.0.1:9428",
            "--config.file.header",
            "Authorization=Bearer xyz",
            "--ipv6",
            "false",
        ]);
        assert_eq!(args.web_listen_address.len(), 2);
        assert_eq!(
            args.config_file_header,
            vec![("Authorization".to_string(), "Bearer xyz".to_string())]
        );
        assert!(!args.ipv6);
    }

    #[test]
    fn test_bad_header_rejected() {
        assert!(
            Args::try_parse_from(["netprobe", "--config.file.header", "no-equals"]).is_err()
        );
    }

    #[test]
    fn test_zero_jobs_rejected() {
        let args = Args::parse_from(["netprobe", "--max-concurrent-jobs", "0"]);
        assert!(args.validate().is_err());
    }
}
