//! Error types for relay startup.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Fatal startup errors. Any of these aborts the process before the first
/// connection is accepted.
#[derive(Debug, Error)]
pub enum StartupError {
    /// Something other than a unix socket occupies the listen path.
    #[error("non-socket file already exists at {}", path.display())]
    NotASocket { path: PathBuf },

    /// A stale socket file exists but could not be removed.
    #[error("failed to remove existing socket at {}: {source}", path.display())]
    StaleSocketRemove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The listen path could not be inspected.
    #[error("failed to stat socket path {}: {source}", path.display())]
    SocketStat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The upstream address failed to resolve.
    #[error("failed to resolve tcp address {addr}: {source}")]
    UpstreamResolve {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The upstream address resolved to nothing.
    #[error("tcp address {addr} resolved to no addresses")]
    UpstreamUnresolved { addr: String },

    /// Binding the unix listener failed.
    #[error("failed to listen on {}: {source}", path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Signal handlers could not be installed.
    #[error("signal setup failed: {0}")]
    Signal(#[source] io::Error),
}

impl StartupError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            StartupError::NotASocket { .. } => "not_a_socket",
            StartupError::StaleSocketRemove { .. } => "stale_socket_remove_failed",
            StartupError::SocketStat { .. } => "socket_stat_failed",
            StartupError::UpstreamResolve { .. } => "upstream_resolve_failed",
            StartupError::UpstreamUnresolved { .. } => "upstream_unresolved",
            StartupError::Bind { .. } => "bind_failed",
            StartupError::Signal(_) => "signal_setup_failed",
        }
    }
}
