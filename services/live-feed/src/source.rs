//! Byte-stream sources
//!
//! A [`ByteStreamSource`] knows how to open a raw byte connection to the
//! feed. The connector calls `prepare` and `open` once per connection
//! attempt and drops the returned stream when the attempt ends, which is
//! what closes the socket or file.
//!
//! Two sources ship with the service:
//! - [`TcpByteSource`]: a live TCP feed guarded by a heartbeat window.
//! - [`ReplayByteSource`]: a captured byte sequence replayed a fixed
//!   number of times, after which the source reports itself exhausted.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::net::{lookup_host, TcpSocket};
use tokio::time::{Instant, Sleep};
use tracing::{debug, info, warn};

use crate::config::SourceConfig;
use crate::error::FeedError;

/// An open, readable feed connection.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Opens raw byte connections to the feed.
#[async_trait]
pub trait ByteStreamSource: Send + Sync {
    /// Human-readable endpoint, used in logs.
    fn describe(&self) -> String;

    /// Allocate whatever a connection attempt needs before connecting.
    async fn prepare(&self) -> Result<(), FeedError> {
        Ok(())
    }

    /// Establish the connection.
    async fn open(&self) -> Result<ByteStream, FeedError>;

    /// Diagnostic hook invoked when a read phase ends with an error.
    fn on_read_error(&self, _err: &FeedError) {}
}

/// Build the source named by the configuration.
pub fn from_config(config: &SourceConfig) -> Arc<dyn ByteStreamSource> {
    match config {
        SourceConfig::Tcp {
            host,
            port,
            connect_timeout_ms,
            heartbeat_timeout_ms,
        } => Arc::new(
            TcpByteSource::new(host.clone(), *port)
                .with_connect_timeout(Duration::from_millis(*connect_timeout_ms))
                .with_heartbeat_timeout(Duration::from_millis(*heartbeat_timeout_ms)),
        ),
        SourceConfig::Replay { path, replays } => {
            Arc::new(ReplayByteSource::from_file(path.clone(), *replays))
        }
    }
}

// ── TCP ─────────────────────────────────────────────────────────────

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(150);

/// Live TCP feed.
pub struct TcpByteSource {
    host: String,
    port: u16,
    connect_timeout: Duration,
    heartbeat_timeout: Duration,
    /// Addresses resolved by the last `prepare`.
    resolved: Mutex<Vec<SocketAddr>>,
    /// Peer of the current connection, for read-error diagnostics.
    peer: Mutex<Option<SocketAddr>>,
}

impl TcpByteSource {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            resolved: Mutex::new(Vec::new()),
            peer: Mutex::new(None),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn resolved_addrs(&self) -> Vec<SocketAddr> {
        self.resolved
            .lock()
            .map(|addrs| addrs.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ByteStreamSource for TcpByteSource {
    fn describe(&self) -> String {
        format!("tcp://{}", self.endpoint())
    }

    async fn prepare(&self) -> Result<(), FeedError> {
        let addrs: Vec<SocketAddr> = lookup_host((self.host.as_str(), self.port))
            .await?
            .collect();
        if addrs.is_empty() {
            return Err(FeedError::Unresolved {
                endpoint: self.endpoint(),
            });
        }
        debug!(endpoint = %self.endpoint(), addrs = ?addrs, "Resolved feed endpoint");
        if let Ok(mut resolved) = self.resolved.lock() {
            *resolved = addrs;
        }
        Ok(())
    }

    async fn open(&self) -> Result<ByteStream, FeedError> {
        let addrs = self.resolved_addrs();
        if addrs.is_empty() {
            return Err(FeedError::Unresolved {
                endpoint: self.endpoint(),
            });
        }

        let mut last_err = None;
        for addr in addrs {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };

            match tokio::time::timeout(self.connect_timeout, socket.connect(addr)).await {
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true)?;
                    info!(peer = %addr, heartbeat = ?self.heartbeat_timeout, "TCP feed connected");
                    if let Ok(mut peer) = self.peer.lock() {
                        *peer = Some(addr);
                    }
                    return Ok(Box::new(HeartbeatStream::new(stream, self.heartbeat_timeout)));
                }
                Ok(Err(e)) => {
                    debug!(peer = %addr, error = %e, "TCP connect failed");
                    last_err = Some(FeedError::Io(e));
                }
                Err(_) => {
                    debug!(peer = %addr, timeout = ?self.connect_timeout, "TCP connect timed out");
                    last_err = Some(FeedError::ConnectTimeout {
                        endpoint: addr.to_string(),
                        timeout: self.connect_timeout,
                    });
                }
            }
        }

        Err(last_err.unwrap_or_else(|| FeedError::Unresolved {
            endpoint: self.endpoint(),
        }))
    }

    fn on_read_error(&self, err: &FeedError) {
        let peer = self.peer.lock().ok().and_then(|peer| *peer);
        warn!(
            endpoint = %self.endpoint(),
            peer = ?peer,
            heartbeat = ?self.heartbeat_timeout,
            error = %err,
            "TCP feed read failed"
        );
    }
}

/// Fails a read that waits longer than `window` for the next byte.
pub struct HeartbeatStream<S> {
    inner: S,
    window: Duration,
    deadline: Pin<Box<Sleep>>,
    waiting: bool,
}

impl<S> HeartbeatStream<S> {
    pub fn new(inner: S, window: Duration) -> Self {
        Self {
            inner,
            window,
            deadline: Box::pin(tokio::time::sleep(window)),
            waiting: false,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for HeartbeatStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        // The window starts when the reader begins waiting, not when the
        // previous read returned.
        if !this.waiting {
            this.deadline.as_mut().reset(Instant::now() + this.window);
            this.waiting = true;
        }

        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.waiting = false;
                Poll::Ready(result)
            }
            Poll::Pending => match this.deadline.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    this.waiting = false;
                    Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no data received for {:?}", this.window),
                    )))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

// ── Replay ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Capture {
    Memory(Arc<[u8]>),
    File(PathBuf),
}

/// Replays a captured byte sequence.
///
/// Each `open` yields the full capture from the start; the decoder sees
/// end-of-stream when the capture ends. After `replays` opens the source
/// is exhausted and every further `open` fails permanently.
#[derive(Debug)]
pub struct ReplayByteSource {
    capture: Capture,
    replays: usize,
    opened: AtomicUsize,
}

impl ReplayByteSource {
    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>, replays: usize) -> Self {
        Self {
            capture: Capture::Memory(bytes.into()),
            replays,
            opened: AtomicUsize::new(0),
        }
    }

    pub fn from_file(path: impl Into<PathBuf>, replays: usize) -> Self {
        Self {
            capture: Capture::File(path.into()),
            replays,
            opened: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ByteStreamSource for ReplayByteSource {
    fn describe(&self) -> String {
        match &self.capture {
            Capture::Memory(bytes) => format!("replay://memory({} bytes)", bytes.len()),
            Capture::File(path) => format!("replay://{}", path.display()),
        }
    }

    async fn open(&self) -> Result<ByteStream, FeedError> {
        let attempt = self.opened.fetch_add(1, Ordering::Relaxed);
        if attempt >= self.replays {
            return Err(FeedError::SourceExhausted(format!(
                "{} already replayed {} time(s)",
                self.describe(),
                self.replays
            )));
        }

        debug!(source = %self.describe(), replay = attempt + 1, of = self.replays, "Opening capture");
        match &self.capture {
            Capture::Memory(bytes) => Ok(Box::new(io::Cursor::new(Arc::clone(bytes)))),
            Capture::File(path) => {
                let file = tokio::fs::File::open(path).await?;
                Ok(Box::new(file))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_replay_yields_capture_then_exhausts() {
        let source = ReplayByteSource::from_bytes(b"abc".to_vec(), 2);

        for _ in 0..2 {
            let mut stream = source.open().await.unwrap();
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();
            assert_eq!(buf, b"abc");
        }

        let err = source.open().await.err().unwrap();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn test_replay_from_missing_file_is_transient() {
        let source = ReplayByteSource::from_file("/definitely/not/a/capture.bin", 1);
        let err = source.open().await.err().unwrap();
        assert!(matches!(err, FeedError::Io(_)));
        assert!(!err.is_permanent());
    }

    #[tokio::test]
    async fn test_replay_from_file() {
        let path = std::env::temp_dir().join(format!("live-feed-replay-{}.bin", std::process::id()));
        tokio::fs::write(&path, b"captured").await.unwrap();

        let source = ReplayByteSource::from_file(&path, 1);
        assert!(source.describe().starts_with("replay://"));
        let mut stream = source.open().await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"captured");

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_source_connects_and_reads() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"tick").await.unwrap();
        });

        let source = TcpByteSource::new("127.0.0.1", port);
        source.prepare().await.unwrap();
        let mut stream = source.open().await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"tick");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_open_without_prepare_is_unresolved() {
        let source = TcpByteSource::new("127.0.0.1", 1);
        assert!(matches!(
            source.open().await,
            Err(FeedError::Unresolved { .. })
        ));
    }

    #[tokio::test]
    async fn test_tcp_connection_refused() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let source = TcpByteSource::new("127.0.0.1", port)
            .with_connect_timeout(Duration::from_secs(1));
        source.prepare().await.unwrap();
        let err = source.open().await.err().unwrap();
        assert!(!err.is_permanent());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_times_out_silent_peer() {
        let (client, _server) = tokio::io::duplex(64);
        let mut stream = HeartbeatStream::new(client, Duration::from_secs(150));

        let mut buf = [0u8; 8];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_window_restarts_per_read() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut stream = HeartbeatStream::new(client, Duration::from_secs(10));

        // Sitting idle between reads does not count against the window.
        tokio::time::sleep(Duration::from_secs(30)).await;

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            server.write_all(b"x").await.unwrap();
            server
        });

        let mut buf = [0u8; 1];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(&buf, b"x");
        let _server = writer.await.unwrap();
    }
}
