//! Runtime control surface.
//!
//! Control events arrive from the signal layer (or directly from tests) and
//! are dispatched against the shared [`RelayState`]. Dispatch itself is
//! synchronous and touches no OS state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::resources;
use crate::state::{RelayState, StatsSnapshot};

/// Tagged control event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// Close the listener, remove the socket and exit.
    Shutdown,
    /// Log uptime and connection statistics.
    DumpStats,
    /// Flip per-connection logging.
    ToggleLog,
}

/// What the caller should do after an event was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    Continue,
    Shutdown,
}

/// Snapshot logged on [`ControlEvent::DumpStats`].
#[derive(Debug, Clone)]
pub struct StatsReport {
    pub version: &'static str,
    pub uptime: Duration,
    /// Tasks alive on the current tokio runtime.
    pub live_tasks: Option<usize>,
    /// Resident memory of the process.
    pub resident_memory_bytes: Option<u64>,
    pub stats: StatsSnapshot,
}

/// Dispatches control events against the relay state.
pub struct Controller {
    state: Arc<RelayState>,
}

impl Controller {
    pub fn new(state: Arc<RelayState>) -> Self {
        Self { state }
    }

    /// Handle a single event.
    pub fn handle(&self, event: ControlEvent) -> ControlOutcome {
        match event {
            ControlEvent::Shutdown => {
                info!("Received shutdown signal");
                ControlOutcome::Shutdown
            }
            ControlEvent::DumpStats => {
                let report = self.report();
                info!(
                    version = report.version,
                    uptime = ?report.uptime,
                    live_tasks = report.live_tasks,
                    resident_memory_bytes = report.resident_memory_bytes,
                    connections_open = report.stats.sessions_open,
                    connections_total = report.stats.sessions_total,
                    dial_failures = report.stats.dial_failures,
                    accept_errors = report.stats.accept_errors,
                    bytes_to_upstream = report.stats.bytes_to_upstream,
                    bytes_from_upstream = report.stats.bytes_from_upstream,
                    "stats"
                );
                ControlOutcome::Continue
            }
            ControlEvent::ToggleLog => {
                let quiet = self.state.toggle_quiet();
                info!(connection_logging = !quiet, "connection logging toggled");
                ControlOutcome::Continue
            }
        }
    }

    /// Build a stats report without mutating anything.
    pub fn report(&self) -> StatsReport {
        StatsReport {
            version: env!("CARGO_PKG_VERSION"),
            uptime: self.state.uptime(),
            live_tasks: tokio::runtime::Handle::try_current()
                .ok()
                .map(|handle| handle.metrics().num_alive_tasks()),
            resident_memory_bytes: resources::resident_memory_bytes(),
            stats: self.state.stats().snapshot(),
        }
    }

    /// Handle events until one asks for shutdown.
    ///
    /// A closed channel means no event source is left, which is treated as a
    /// shutdown request.
    pub async fn run(&self, mut events: mpsc::Receiver<ControlEvent>) {
        while let Some(event) = events.recv().await {
            if self.handle(event) == ControlOutcome::Shutdown {
                return;
            }
        }

        warn!("control channel closed, shutting down");
    }
}
