//! Per-connection forwarding.
//!
//! Each accepted connection becomes a session: the upstream TCP connection is
//! dialed, then two copy tasks run one per direction. When either direction
//! ends (clean EOF or I/O error) it shuts down its destination's write side,
//! the remaining task is aborted, and both connections are dropped. Session
//! bookkeeping runs exactly once, after both tasks have been joined.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn, Instrument};

use super::buffer_pool::BufferPool;
use crate::state::RelayState;

/// Default connect timeout for upstream dials.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Forwarder configuration.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Upstream `host:port`, resolved on every dial.
    pub upstream_addr: String,
    /// Upstream dial timeout. `None` waits for the OS.
    pub connect_timeout: Option<Duration>,
    /// Session idle timeout. A session closes once neither direction has
    /// moved bytes for this long. `None` lets sessions idle forever.
    pub idle_timeout: Option<Duration>,
}

impl ForwarderConfig {
    pub fn new(upstream_addr: impl Into<String>) -> Self {
        Self {
            upstream_addr: upstream_addr.into(),
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            idle_timeout: None,
        }
    }
}

/// Copy direction within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client (unix socket) to upstream (TCP).
    ToUpstream,
    /// Upstream (TCP) to client (unix socket).
    FromUpstream,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ToUpstream => "client->upstream",
            Direction::FromUpstream => "upstream->client",
        }
    }
}

/// Bytes moved by one session, updated per chunk so an aborted copy task
/// still reports what it forwarded. Also tracks the last time either
/// direction moved data, shared by both copy tasks for the idle timeout.
#[derive(Debug)]
struct SessionBytes {
    to_upstream: AtomicU64,
    from_upstream: AtomicU64,
    opened_at: Instant,
    /// Milliseconds since `opened_at` of the most recent chunk.
    last_active_ms: AtomicU64,
}

impl SessionBytes {
    fn new() -> Self {
        Self {
            to_upstream: AtomicU64::new(0),
            from_upstream: AtomicU64::new(0),
            opened_at: Instant::now(),
            last_active_ms: AtomicU64::new(0),
        }
    }

    fn record(&self, direction: Direction, n: usize) {
        let counter = match direction {
            Direction::ToUpstream => &self.to_upstream,
            Direction::FromUpstream => &self.from_upstream,
        };
        counter.fetch_add(n as u64, Ordering::Relaxed);

        let now_ms = self.opened_at.elapsed().as_millis() as u64;
        self.last_active_ms.fetch_max(now_ms, Ordering::Relaxed);
    }

    /// When the session becomes idle if no direction moves bytes before then.
    fn idle_deadline(&self, limit: Duration) -> Instant {
        let last = Duration::from_millis(self.last_active_ms.load(Ordering::Relaxed));
        self.opened_at + last + limit
    }
}

/// Dials the upstream and pumps bytes for each inbound connection.
pub struct Forwarder {
    config: ForwarderConfig,
    state: Arc<RelayState>,
    buffers: BufferPool,
}

impl Forwarder {
    pub fn new(config: ForwarderConfig, state: Arc<RelayState>, buffers: BufferPool) -> Self {
        Self {
            config,
            state,
            buffers,
        }
    }

    pub fn state(&self) -> &Arc<RelayState> {
        &self.state
    }

    pub fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    pub fn upstream_addr(&self) -> &str {
        &self.config.upstream_addr
    }

    /// Forward one inbound connection until both directions have finished.
    ///
    /// If the upstream cannot be dialed the inbound connection is dropped
    /// (closed) and no session counters are touched.
    pub async fn forward<S>(&self, inbound: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let upstream = match self.dial().await {
            Ok(stream) => stream,
            Err(e) => {
                self.state
                    .stats()
                    .dial_failures
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    upstream = %self.config.upstream_addr,
                    error = %e,
                    "tcp dial failed"
                );
                drop(inbound);
                return;
            }
        };

        let id = self.state.stats().session_opened();
        self.run_session(id, inbound, upstream)
            .instrument(tracing::info_span!("session", id))
            .await;
    }

    async fn dial(&self) -> io::Result<TcpStream> {
        let addr = self.config.upstream_addr.as_str();
        debug!(upstream = %addr, "Connecting to upstream");

        let stream = match self.config.connect_timeout {
            Some(limit) => match timeout(limit, TcpStream::connect(addr)).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout"));
                }
            },
            None => TcpStream::connect(addr).await?,
        };

        // Interactive protocols (ssh) stall behind Nagle otherwise.
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    async fn run_session<S>(&self, id: u64, inbound: S, upstream: TcpStream)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let started = Instant::now();
        let stats = self.state.stats();

        if !self.state.is_quiet() {
            info!(
                id,
                total = stats.sessions_total(),
                open = stats.sessions_open(),
                "connection opened"
            );
        }

        let (inbound_read, inbound_write) = tokio::io::split(inbound);
        let (upstream_read, upstream_write) = upstream.into_split();
        let bytes = Arc::new(SessionBytes::new());

        let mut pumps = JoinSet::new();
        pumps.spawn(pump(
            Direction::ToUpstream,
            inbound_read,
            upstream_write,
            self.buffers.clone(),
            self.config.idle_timeout,
            Arc::clone(&bytes),
        ));
        pumps.spawn(pump(
            Direction::FromUpstream,
            upstream_read,
            inbound_write,
            self.buffers.clone(),
            self.config.idle_timeout,
            Arc::clone(&bytes),
        ));

        // Whichever side ends first closes the whole session.
        if let Some(Ok((direction, result))) = pumps.join_next().await {
            match result {
                Ok(()) => debug!(direction = direction.as_str(), "stream ended"),
                Err(e) => debug!(direction = direction.as_str(), error = %e, "stream failed"),
            }
        }
        pumps.abort_all();
        while pumps.join_next().await.is_some() {}

        let to_upstream = bytes.to_upstream.load(Ordering::Relaxed);
        let from_upstream = bytes.from_upstream.load(Ordering::Relaxed);
        stats
            .bytes_to_upstream
            .fetch_add(to_upstream, Ordering::Relaxed);
        stats
            .bytes_from_upstream
            .fetch_add(from_upstream, Ordering::Relaxed);
        stats.session_closed();

        if !self.state.is_quiet() {
            info!(
                id,
                duration = ?started.elapsed(),
                bytes_to_upstream = to_upstream,
                bytes_from_upstream = from_upstream,
                open = stats.sessions_open(),
                "connection closed"
            );
        }
    }
}

/// Copy one direction of a session, then shut down the destination's write
/// side. The leased buffer goes back to the pool when this returns or is
/// aborted.
async fn pump<R, W>(
    direction: Direction,
    mut reader: R,
    mut writer: W,
    buffers: BufferPool,
    idle_timeout: Option<Duration>,
    bytes: Arc<SessionBytes>,
) -> (Direction, io::Result<()>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = buffers.acquire();
    let result = copy_stream(
        direction,
        &mut reader,
        &mut writer,
        &mut buf,
        idle_timeout,
        &bytes,
    )
    .await;

    let _ = writer.shutdown().await;
    (direction, result)
}

/// Copy until EOF. With an idle timeout, a read that outlives the session
/// deadline is re-armed if the other direction moved bytes in the meantime.
async fn copy_stream<R, W>(
    direction: Direction,
    reader: &mut R,
    writer: &mut W,
    buf: &mut [u8],
    idle_timeout: Option<Duration>,
    bytes: &SessionBytes,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let read_result = match idle_timeout {
            Some(limit) => match timeout_at(bytes.idle_deadline(limit), reader.read(buf)).await {
                Ok(result) => result,
                Err(_) if Instant::now() < bytes.idle_deadline(limit) => continue,
                Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
            },
            None => reader.read(buf).await,
        };

        match read_result? {
            0 => return Ok(()),
            n => {
                writer.write_all(&buf[..n]).await?;
                bytes.record(direction, n);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn spawn_echo() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut rd, mut wr) = stream.into_split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });
        addr
    }

    async fn closed_port() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    fn forwarder(upstream: std::net::SocketAddr, quiet: bool) -> Arc<Forwarder> {
        Arc::new(Forwarder::new(
            ForwarderConfig::new(upstream.to_string()),
            Arc::new(RelayState::new(quiet)),
            BufferPool::new(1024, 8),
        ))
    }

    #[test]
    fn test_forwarder_config_default() {
        let config = ForwarderConfig::new("127.0.0.1:22");
        assert_eq!(config.connect_timeout, Some(DEFAULT_CONNECT_TIMEOUT));
        assert!(config.idle_timeout.is_none());
    }

    #[tokio::test]
    async fn test_session_echo_counts_and_releases() {
        let fwd = forwarder(spawn_echo().await, false);
        let (mut client, inbound) = tokio::io::duplex(4096);

        let session = tokio::spawn({
            let fwd = Arc::clone(&fwd);
            async move { fwd.forward(inbound).await }
        });

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(fwd.state().stats().sessions_open(), 1);

        drop(client);
        session.await.unwrap();

        let snapshot = fwd.state().stats().snapshot();
        assert_eq!(snapshot.sessions_total, 1);
        assert_eq!(snapshot.sessions_open, 0);
        assert_eq!(snapshot.bytes_to_upstream, 4);
        assert_eq!(snapshot.bytes_from_upstream, 4);

        // Both copy tasks handed their buffers back.
        assert_eq!(fwd.buffers().allocated(), 2);
        assert_eq!(fwd.buffers().idle_count(), 2);
    }

    #[tokio::test]
    async fn test_dial_failure_closes_inbound() {
        let fwd = forwarder(closed_port().await, false);
        let (mut client, inbound) = tokio::io::duplex(64);

        fwd.forward(inbound).await;

        let mut buf = [0u8; 8];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "inbound should be closed after dial failure");

        let snapshot = fwd.state().stats().snapshot();
        assert_eq!(snapshot.sessions_total, 0);
        assert_eq!(snapshot.sessions_open, 0);
        assert_eq!(snapshot.dial_failures, 1);
        assert_eq!(fwd.buffers().allocated(), 0);
    }

    #[tokio::test]
    async fn test_upstream_close_ends_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"bye").await.unwrap();
        });

        let fwd = forwarder(addr, true);
        let (mut client, inbound) = tokio::io::duplex(64);
        let session = tokio::spawn({
            let fwd = Arc::clone(&fwd);
            async move { fwd.forward(inbound).await }
        });

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"bye");

        session.await.unwrap();
        assert_eq!(fwd.state().stats().sessions_open(), 0);
        assert_eq!(fwd.state().stats().sessions_total(), 1);
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (hold_tx, hold_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            let _ = hold_rx.await;
        });

        let mut config = ForwarderConfig::new(addr.to_string());
        config.idle_timeout = Some(Duration::from_millis(50));
        let fwd = Forwarder::new(config, Arc::new(RelayState::new(true)), BufferPool::default());

        let (_client, inbound) = tokio::io::duplex(64);
        timeout(Duration::from_secs(5), fwd.forward(inbound))
            .await
            .expect("idle session should be closed");

        assert_eq!(fwd.state().stats().sessions_open(), 0);
        drop(hold_tx);
    }

    #[tokio::test]
    async fn test_one_way_transfer_outlives_idle_timeout() {
        const CHUNKS: usize = 20;

        // Upstream trickles one byte every 50 ms, then holds the connection.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (hold_tx, hold_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            for i in 0..CHUNKS {
                stream.write_all(&[i as u8]).await.unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            let _ = hold_rx.await;
        });

        let mut config = ForwarderConfig::new(addr.to_string());
        config.idle_timeout = Some(Duration::from_millis(200));
        let fwd = Arc::new(Forwarder::new(
            config,
            Arc::new(RelayState::new(true)),
            BufferPool::default(),
        ));

        // The client never writes.
        let (mut client, inbound) = tokio::io::duplex(64);
        let session = tokio::spawn({
            let fwd = Arc::clone(&fwd);
            async move { fwd.forward(inbound).await }
        });

        let mut received = [0u8; CHUNKS];
        timeout(Duration::from_secs(5), client.read_exact(&mut received))
            .await
            .expect("stream should keep flowing")
            .unwrap();
        let expected: Vec<u8> = (0..CHUNKS as u8).collect();
        assert_eq!(&received[..], &expected[..]);

        // Once the upstream goes quiet too, the session is idle and closes.
        timeout(Duration::from_secs(5), session)
            .await
            .expect("idle session should be closed")
            .unwrap();
        let snapshot = fwd.state().stats().snapshot();
        assert_eq!(snapshot.sessions_open, 0);
        assert_eq!(snapshot.bytes_from_upstream, CHUNKS as u64);
        assert_eq!(snapshot.bytes_to_upstream, 0);
        drop(hold_tx);
    }
}
