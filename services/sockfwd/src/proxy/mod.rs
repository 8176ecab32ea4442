//! Unix socket to TCP forwarding.
//!
//! This module provides:
//! - Unix socket listener lifecycle (stale socket cleanup, accept loop, shutdown)
//! - Per-connection sessions with one copy task per direction
//! - A shared pool of fixed-size copy buffers
//!
//! ## Architecture
//!
//! ```text
//! Client -> Unix Listener -> Forwarder -> TCP Upstream
//!                               |
//!                 2 copy tasks + pooled buffers
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{BufferPool, Forwarder, ForwarderConfig, Listener};
//!
//! let state = Arc::new(RelayState::new(false));
//! let forwarder = Arc::new(Forwarder::new(
//!     ForwarderConfig::new("127.0.0.1:22"),
//!     state,
//!     BufferPool::default(),
//! ));
//!
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let listener = Listener::bind("/var/run/fwd.sock", forwarder)?;
//! listener.run(shutdown_rx).await;
//! ```

mod buffer_pool;
mod forwarder;
mod listener;

pub use buffer_pool::{BufferPool, PooledBuffer, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_POOLED};
pub use forwarder::{Direction, Forwarder, ForwarderConfig, DEFAULT_CONNECT_TIMEOUT};
pub use listener::{prepare_socket_path, Listener};
