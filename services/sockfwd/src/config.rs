//! Relay configuration.
//!
//! Every flag can also be supplied through a `SOCKFWD_*` environment variable.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::error::StartupError;
use crate::proxy::DEFAULT_MAX_POOLED;

const SIGNAL_HELP: &str = "\
The sockfwd process will accept a:
  USR1 signal to print uptime and connection stats
  USR2 signal to toggle connection logging (--quiet)";

/// Forward connections from a unix socket to a remote TCP address.
#[derive(Debug, Clone, Parser)]
#[command(name = "sockfwd")]
#[command(version, about, long_about = None, after_help = SIGNAL_HELP)]
pub struct Config {
    /// Path to unix socket file to listen on.
    #[arg(long, env = "SOCKFWD_SOCKET_ADDR", default_value = "/var/run/fwd.sock")]
    pub socket_addr: PathBuf,

    /// Remote tcp socket address to forward to.
    #[arg(long, env = "SOCKFWD_TCP_ADDR", default_value = "127.0.0.1:22")]
    pub tcp_addr: String,

    /// Suppress connection logs.
    #[arg(long, env = "SOCKFWD_QUIET")]
    pub quiet: bool,

    /// Log level used when RUST_LOG is unset (trace, debug, info, warn, error).
    #[arg(long, env = "SOCKFWD_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, env = "SOCKFWD_LOG_JSON")]
    pub log_json: bool,

    /// Upstream dial timeout in milliseconds (0 disables the timeout).
    #[arg(long, env = "SOCKFWD_CONNECT_TIMEOUT_MS", default_value_t = 5000)]
    pub connect_timeout_ms: u64,

    /// Close a session once neither direction has moved bytes for this many seconds.
    #[arg(long, env = "SOCKFWD_IDLE_TIMEOUT_SECS")]
    pub idle_timeout_secs: Option<u64>,

    /// Maximum number of idle copy buffers kept for reuse.
    #[arg(long, env = "SOCKFWD_MAX_POOLED_BUFFERS", default_value_t = DEFAULT_MAX_POOLED)]
    pub max_pooled_buffers: usize,
}

impl Config {
    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_ms > 0).then(|| Duration::from_millis(self.connect_timeout_ms))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Resolve the upstream address once at startup.
    ///
    /// Sessions dial the original string, so DNS changes are picked up
    /// without a restart.
    pub async fn resolve_upstream(&self) -> Result<Vec<SocketAddr>, StartupError> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(self.tcp_addr.as_str())
            .await
            .map_err(|source| StartupError::UpstreamResolve {
                addr: self.tcp_addr.clone(),
                source,
            })?
            .collect();

        if addrs.is_empty() {
            return Err(StartupError::UpstreamUnresolved {
                addr: self.tcp_addr.clone(),
            });
        }

        Ok(addrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["sockfwd"]).unwrap();
        assert_eq!(config.socket_addr, PathBuf::from("/var/run/fwd.sock"));
        assert_eq!(config.tcp_addr, "127.0.0.1:22");
        assert!(!config.quiet);
        assert_eq!(config.connect_timeout(), Some(Duration::from_secs(5)));
        assert!(config.idle_timeout().is_none());
        assert_eq!(config.max_pooled_buffers, DEFAULT_MAX_POOLED);
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = Config::try_parse_from([
            "sockfwd",
            "--socket-addr",
            "/tmp/test.sock",
            "--tcp-addr",
            "127.0.0.1:9000",
            "--quiet",
            "--connect-timeout-ms",
            "0",
            "--idle-timeout-secs",
            "30",
        ])
        .unwrap();
        assert_eq!(config.socket_addr, PathBuf::from("/tmp/test.sock"));
        assert_eq!(config.tcp_addr, "127.0.0.1:9000");
        assert!(config.quiet);
        assert!(config.connect_timeout().is_none());
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_resolve_upstream_literal() {
        let config =
            Config::try_parse_from(["sockfwd", "--tcp-addr", "127.0.0.1:9000"]).unwrap();
        let addrs = config.resolve_upstream().await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:9000".parse::<SocketAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_resolve_upstream_rejects_missing_port() {
        let config = Config::try_parse_from(["sockfwd", "--tcp-addr", "127.0.0.1"]).unwrap();
        let err = config.resolve_upstream().await.unwrap_err();
        assert_eq!(err.reason_code(), "upstream_resolve_failed");
    }
}
