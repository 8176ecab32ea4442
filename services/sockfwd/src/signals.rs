//! OS signal translation.
//!
//! - SIGINT, SIGTERM: shutdown
//! - SIGUSR1: dump stats
//! - SIGUSR2: toggle connection logging

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::debug;

use crate::control::ControlEvent;
use crate::error::StartupError;

/// Install signal handlers and forward them as [`ControlEvent`]s.
///
/// Handlers are registered before this returns, so signals delivered after
/// the call are never lost to the default disposition.
pub fn spawn_signal_listener() -> Result<mpsc::Receiver<ControlEvent>, StartupError> {
    let mut sigint = signal(SignalKind::interrupt()).map_err(StartupError::Signal)?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(StartupError::Signal)?;
    let mut sigusr1 = signal(SignalKind::user_defined1()).map_err(StartupError::Signal)?;
    let mut sigusr2 = signal(SignalKind::user_defined2()).map_err(StartupError::Signal)?;

    let (tx, rx) = mpsc::channel(16);

    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                Some(()) = sigint.recv() => ControlEvent::Shutdown,
                Some(()) = sigterm.recv() => ControlEvent::Shutdown,
                Some(()) = sigusr1.recv() => ControlEvent::DumpStats,
                Some(()) = sigusr2.recv() => ControlEvent::ToggleLog,
                else => break,
            };

            debug!(event = ?event, "signal received");
            if tx.send(event).await.is_err() {
                break;
            }
        }
    });

    Ok(rx)
}
