//! sockfwd
//!
//! Forwards connections accepted on a unix domain socket to a fixed TCP
//! address, copying bytes both ways until either side closes.
//!
//! This binary:
//! - Validates the socket path and resolves the upstream before listening
//! - Accepts unix socket connections and dials the upstream per connection
//! - Dumps stats on SIGUSR1 and toggles connection logging on SIGUSR2
//! - Removes its socket file on SIGINT/SIGTERM and exits cleanly

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::{debug, error};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sockfwd::proxy::{BufferPool, Forwarder, ForwarderConfig, Listener};
use sockfwd::{signals, Config, Controller, RelayState, StartupError};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // Initialize tracing (prefer RUST_LOG, fallback to --log-level)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(config.log_json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!config.log_json).then(|| tracing_subscriber::fmt::layer().compact()))
        .init();

    if let Err(e) = run(config).await {
        error!(reason = e.reason_code(), error = %e, "startup failed");
        return Err(e.into());
    }

    Ok(())
}

async fn run(config: Config) -> Result<(), StartupError> {
    let upstream = config.resolve_upstream().await?;
    debug!(tcp_addr = %config.tcp_addr, resolved = ?upstream, "Upstream resolved");

    // Handlers go in before the socket exists so an early SIGTERM still
    // cleans it up.
    let events = signals::spawn_signal_listener()?;

    let state = Arc::new(RelayState::new(config.quiet));
    let forwarder = Arc::new(Forwarder::new(
        ForwarderConfig {
            upstream_addr: config.tcp_addr.clone(),
            connect_timeout: config.connect_timeout(),
            idle_timeout: config.idle_timeout(),
        },
        Arc::clone(&state),
        BufferPool::with_max_pooled(config.max_pooled_buffers),
    ));

    let listener = Listener::bind(&config.socket_addr, forwarder)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener_handle = tokio::spawn(listener.run(shutdown_rx));

    Controller::new(state).run(events).await;

    let _ = shutdown_tx.send(true);
    if let Err(e) = listener_handle.await {
        error!(error = %e, "Listener task failed");
    }

    Ok(())
}
