//! Unix socket listener lifecycle.
//!
//! The listener owns the socket file: a stale socket left by a previous run is
//! removed before binding, and the file is removed again on shutdown. Anything
//! at the path that is not a socket is left alone and aborts startup.

use std::fs;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UnixListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::forwarder::Forwarder;
use crate::error::StartupError;

/// Back-off after a failed accept.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Make `path` available for binding.
///
/// Missing paths are fine. An existing socket file is treated as stale and
/// removed. Any other file type is an error.
pub fn prepare_socket_path(path: &Path) -> Result<(), StartupError> {
    match fs::metadata(path) {
        Ok(meta) => {
            if !meta.file_type().is_socket() {
                return Err(StartupError::NotASocket {
                    path: path.to_path_buf(),
                });
            }
            fs::remove_file(path).map_err(|source| StartupError::StaleSocketRemove {
                path: path.to_path_buf(),
                source,
            })?;
            info!(path = %path.display(), "Removed stale socket");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(StartupError::SocketStat {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// A bound unix socket listener feeding the forwarder.
pub struct Listener {
    socket_path: PathBuf,
    listener: UnixListener,
    forwarder: Arc<Forwarder>,
}

impl Listener {
    /// Prepare the socket path and bind. Must be called within a tokio runtime.
    pub fn bind(
        socket_path: impl Into<PathBuf>,
        forwarder: Arc<Forwarder>,
    ) -> Result<Self, StartupError> {
        let socket_path = socket_path.into();
        prepare_socket_path(&socket_path)?;

        let listener = UnixListener::bind(&socket_path).map_err(|source| StartupError::Bind {
            path: socket_path.clone(),
            source,
        })?;

        debug!(path = %socket_path.display(), "Listener bound");

        Ok(Self {
            socket_path,
            listener,
            forwarder,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept connections until `shutdown` flips to true (or its sender is
    /// dropped), then close the listener and remove the socket file.
    ///
    /// Accept errors are logged and skipped; they never end the loop.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            path = %self.socket_path.display(),
            upstream = %self.forwarder.upstream_addr(),
            "Listening"
        );

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let forwarder = Arc::clone(&self.forwarder);
                        tokio::spawn(async move {
                            forwarder.forward(stream).await;
                        });
                    }
                    Err(e) => {
                        self.forwarder
                            .state()
                            .stats()
                            .accept_errors
                            .fetch_add(1, Ordering::Relaxed);
                        error!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        self.shutdown();
    }

    /// Close the listener and remove its socket file.
    pub fn shutdown(self) {
        let Self {
            socket_path,
            listener,
            ..
        } = self;
        drop(listener);

        match fs::remove_file(&socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %socket_path.display(), error = %e, "failed to remove socket");
            }
        }

        info!(path = %socket_path.display(), "closed listener and removed socket");
    }
}
