//! Shared relay context.
//!
//! One `RelayState` is created at startup and handed to the forwarder and the
//! control surface. Counters are eventually consistent: readers see a snapshot,
//! not a transaction tied to session state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Relay-wide counters.
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Sessions ever started (upstream dial succeeded).
    pub sessions_total: AtomicU64,
    /// Sessions currently open.
    pub sessions_open: AtomicU64,
    /// Upstream dials that failed.
    pub dial_failures: AtomicU64,
    /// Failed accepts on the unix listener.
    pub accept_errors: AtomicU64,
    /// Bytes copied from clients to the upstream.
    pub bytes_to_upstream: AtomicU64,
    /// Bytes copied from the upstream to clients.
    pub bytes_from_upstream: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub sessions_total: u64,
    pub sessions_open: u64,
    pub dial_failures: u64,
    pub accept_errors: u64,
    pub bytes_to_upstream: u64,
    pub bytes_from_upstream: u64,
}

impl RelayStats {
    /// Record a session start, returning its id.
    pub fn session_opened(&self) -> u64 {
        self.sessions_open.fetch_add(1, Ordering::Relaxed);
        self.sessions_total.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn session_closed(&self) {
        self.sessions_open.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn sessions_total(&self) -> u64 {
        self.sessions_total.load(Ordering::Relaxed)
    }

    pub fn sessions_open(&self) -> u64 {
        self.sessions_open.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sessions_total: self.sessions_total.load(Ordering::Relaxed),
            sessions_open: self.sessions_open.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
            bytes_to_upstream: self.bytes_to_upstream.load(Ordering::Relaxed),
            bytes_from_upstream: self.bytes_from_upstream.load(Ordering::Relaxed),
        }
    }
}

/// Context shared by every session and the control surface.
#[derive(Debug)]
pub struct RelayState {
    stats: RelayStats,
    quiet: AtomicBool,
    started_at: Instant,
}

impl RelayState {
    pub fn new(quiet: bool) -> Self {
        Self {
            stats: RelayStats::default(),
            quiet: AtomicBool::new(quiet),
            started_at: Instant::now(),
        }
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    /// Whether per-connection log lines are suppressed.
    pub fn is_quiet(&self) -> bool {
        self.quiet.load(Ordering::Relaxed)
    }

    /// Flip the quiet flag, returning the new value.
    pub fn toggle_quiet(&self) -> bool {
        !self.quiet.fetch_xor(true, Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}
