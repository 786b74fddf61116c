//! Connection tracking.
//!
//! Every accepted connection is registered in a [`ConnectionRegistry`]
//! under a monotonic identifier and counted in a single atomic counter.
//! The registry entry and the counter are released exactly once, either
//! when the transport drops the connection or when shutdown force-closes
//! it.
//!
//! The byte transport is abstracted behind [`TransportConn`] so the
//! lifecycle controller can write WebSocket close frames or SSE events
//! straight onto the wire. [`TcpConn`] wraps a TCP socket; [`MemoryConn`]
//! wraps an in-memory duplex pipe for tests and embedding.

use std::fmt;
use std::future::poll_fn;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{ready, Context, Poll};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use trellis_core::{BoxFuture, CleanupHook, ConnectionHandle, ConnectionKind, SseSink};

/// A byte transport shared between the HTTP stack and the lifecycle
/// controller.
///
/// All methods take `&self`: the same connection is read and written by
/// the transport while shutdown may write a close frame or close it.
pub trait TransportConn: Send + Sync + 'static {
    /// Polls for inbound bytes. An empty fill means end of stream.
    fn poll_read_raw(&self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>>;

    /// Polls to write some of `buf`.
    fn poll_write_raw(&self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>>;

    /// Polls to flush buffered output.
    fn poll_flush_raw(&self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    /// Polls to shut down the write side.
    fn poll_shutdown_raw(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;

    /// Closes both directions immediately. Pending reads on either end
    /// observe end of stream.
    fn close(&self) -> io::Result<()>;

    /// Remote address, if the transport has one.
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Writes all of `bytes` and flushes.
    fn write_raw<'a>(&'a self, bytes: &'a [u8]) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            let mut written = 0;
            while written < bytes.len() {
                let n = poll_fn(|cx| self.poll_write_raw(cx, &bytes[written..])).await?;
                if n == 0 {
                    return Err(io::ErrorKind::WriteZero.into());
                }
                written += n;
            }
            poll_fn(|cx| self.poll_flush_raw(cx)).await
        })
    }

    /// Reads into `buf`, returning the number of bytes read; `0` means
    /// end of stream.
    fn read_raw<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(async move {
            let mut read_buf = ReadBuf::new(buf);
            poll_fn(|cx| self.poll_read_raw(cx, &mut read_buf)).await?;
            Ok(read_buf.filled().len())
        })
    }
}

/// A TCP connection.
///
/// Holds a duplicated socket handle so [`close`](TransportConn::close)
/// can shut the socket down while the stream is in use elsewhere.
pub struct TcpConn {
    stream: TcpStream,
    raw: std::net::TcpStream,
    peer: Option<SocketAddr>,
}

impl TcpConn {
    /// Wraps an accepted stream. Must be called inside a Tokio runtime.
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let peer = stream.peer_addr().ok();
        let std_stream = stream.into_std()?;
        let raw = std_stream.try_clone()?;
        let stream = TcpStream::from_std(std_stream)?;
        Ok(Self { stream, raw, peer })
    }

    /// Enables or disables `TCP_NODELAY`.
    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.stream.set_nodelay(nodelay)
    }
}

impl TransportConn for TcpConn {
    fn poll_read_raw(&self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        loop {
            ready!(self.stream.poll_read_ready(cx))?;
            match self.stream.try_read(buf.initialize_unfilled()) {
                Ok(n) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Poll::Ready(Err(e)),
            }
        }
    }

    fn poll_write_raw(&self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        loop {
            ready!(self.stream.poll_write_ready(cx))?;
            match self.stream.try_write(buf) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                other => return Poll::Ready(other),
            }
        }
    }

    fn poll_shutdown_raw(&self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(ignore_not_connected(self.raw.shutdown(Shutdown::Write)))
    }

    fn close(&self) -> io::Result<()> {
        ignore_not_connected(self.raw.shutdown(Shutdown::Both))
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

impl fmt::Debug for TcpConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConn").field("peer", &self.peer).finish()
    }
}

fn ignore_not_connected(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        other => other,
    }
}

/// An in-memory connection backed by a Tokio duplex pipe.
///
/// ```rust
/// use tokio::io::AsyncReadExt;
/// use trellis_server::{MemoryConn, TransportConn};
///
/// # tokio_test::block_on(async {
/// let (conn, mut client) = MemoryConn::pair(64);
/// conn.write_raw(b"ping").await.unwrap();
/// let mut buf = [0u8; 4];
/// client.read_exact(&mut buf).await.unwrap();
/// assert_eq!(&buf, b"ping");
/// # });
/// ```
pub struct MemoryConn {
    reader: Mutex<Option<ReadHalf<DuplexStream>>>,
    writer: Mutex<Option<WriteHalf<DuplexStream>>>,
    peer: Option<SocketAddr>,
}

impl MemoryConn {
    /// Creates a connection and the client end of its pipe.
    #[must_use]
    pub fn pair(max_buf_size: usize) -> (Self, DuplexStream) {
        let (server, client) = tokio::io::duplex(max_buf_size);
        let (reader, writer) = tokio::io::split(server);
        let conn = Self {
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            peer: None,
        };
        (conn, client)
    }

    /// Reports `peer` as the remote address.
    #[must_use]
    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }
}

fn closed_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "connection closed")
}

impl TransportConn for MemoryConn {
    fn poll_read_raw(&self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.reader.lock().as_mut() {
            Some(reader) => Pin::new(reader).poll_read(cx, buf),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_write_raw(&self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.writer.lock().as_mut() {
            Some(writer) => Pin::new(writer).poll_write(cx, buf),
            None => Poll::Ready(Err(closed_pipe())),
        }
    }

    fn poll_flush_raw(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.writer.lock().as_mut() {
            Some(writer) => Pin::new(writer).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown_raw(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.writer.lock().as_mut() {
            Some(writer) => Pin::new(writer).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn close(&self) -> io::Result<()> {
        drop(self.reader.lock().take());
        drop(self.writer.lock().take());
        Ok(())
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

impl fmt::Debug for MemoryConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryConn")
            .field("peer", &self.peer)
            .field("open", &self.writer.lock().is_some())
            .finish()
    }
}

/// A connection registered with a [`ConnectionRegistry`].
pub struct TrackedConnection {
    id: u64,
    transport: Arc<dyn TransportConn>,
    kind: AtomicU8,
    cleanup: Mutex<Option<CleanupHook>>,
    sse_sink: Mutex<Option<SseSink>>,
    released: AtomicBool,
    released_tx: watch::Sender<bool>,
    registry: Weak<RegistryInner>,
    accepted_at: Instant,
}

impl TrackedConnection {
    /// Identifier, unique within the registry.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Protocol tag.
    #[must_use]
    pub fn kind(&self) -> ConnectionKind {
        ConnectionKind::from_u8(self.kind.load(Ordering::Acquire))
    }

    /// Re-tags the connection.
    pub fn set_kind(&self, kind: ConnectionKind) {
        self.kind.store(kind as u8, Ordering::Release);
    }

    /// Registers the shutdown cleanup hook.
    pub fn set_cleanup(&self, hook: CleanupHook) {
        *self.cleanup.lock() = Some(hook);
    }

    /// The registered cleanup hook.
    #[must_use]
    pub fn cleanup(&self) -> Option<CleanupHook> {
        self.cleanup.lock().clone()
    }

    /// The SSE body sink, if the connection is streaming events.
    #[must_use]
    pub fn sse_sink(&self) -> Option<SseSink> {
        self.sse_sink.lock().clone()
    }

    /// The underlying transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn TransportConn> {
        &self.transport
    }

    /// Remote address.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.transport.peer_addr()
    }

    /// Time since the connection was tracked.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.accepted_at.elapsed()
    }

    /// Whether the connection has been released.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Completes once the connection is released.
    pub async fn released(&self) {
        let mut rx = self.released_tx.subscribe();
        let _ = rx.wait_for(|released| *released).await;
    }

    /// Force-closes the transport and releases the connection.
    pub fn close(&self) {
        if let Err(e) = self.transport.close() {
            tracing::debug!(conn_id = self.id, error = %e, "transport close failed");
        }
        self.release();
    }

    /// Removes the connection from its registry. Only the first call has
    /// an effect; returns whether this call was it.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.released_tx.send_replace(true);
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
        tracing::debug!(conn_id = self.id, kind = %self.kind(), "connection released");
        true
    }
}

impl ConnectionHandle for TrackedConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn kind(&self) -> ConnectionKind {
        TrackedConnection::kind(self)
    }

    fn set_kind(&self, kind: ConnectionKind) {
        TrackedConnection::set_kind(self, kind);
    }

    fn set_cleanup(&self, hook: CleanupHook) {
        TrackedConnection::set_cleanup(self, hook);
    }

    fn set_sse_sink(&self, sink: SseSink) {
        *self.sse_sink.lock() = Some(sink);
    }
}

impl fmt::Debug for TrackedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedConnection")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("released", &self.is_released())
            .finish_non_exhaustive()
    }
}

/// The I/O object handed to the HTTP stack. Dropping it releases the
/// connection.
pub struct TrackedIo {
    conn: Arc<TrackedConnection>,
}

impl TrackedIo {
    /// Wraps a tracked connection.
    #[must_use]
    pub fn new(conn: Arc<TrackedConnection>) -> Self {
        Self { conn }
    }
}

impl AsyncRead for TrackedIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.conn.transport.poll_read_raw(cx, buf)
    }
}

impl AsyncWrite for TrackedIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.conn.transport.poll_write_raw(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.conn.transport.poll_flush_raw(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.conn.transport.poll_shutdown_raw(cx)
    }
}

impl Drop for TrackedIo {
    fn drop(&mut self) {
        self.conn.release();
    }
}

#[derive(Default)]
struct RegistryInner {
    conns: DashMap<u64, Arc<TrackedConnection>>,
    active: AtomicUsize,
    next_id: AtomicU64,
    changed: Notify,
}

impl RegistryInner {
    fn remove(&self, id: u64) {
        if self.conns.remove(&id).is_some() {
            self.active.fetch_sub(1, Ordering::AcqRel);
        }
        self.changed.notify_waiters();
    }
}

/// Registry of live connections.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `transport` and returns its tracked handle.
    pub fn track(&self, transport: Arc<dyn TransportConn>) -> Arc<TrackedConnection> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let conn = Arc::new(TrackedConnection {
            id,
            transport,
            kind: AtomicU8::new(ConnectionKind::Plain as u8),
            cleanup: Mutex::new(None),
            sse_sink: Mutex::new(None),
            released: AtomicBool::new(false),
            released_tx: watch::channel(false).0,
            registry: Arc::downgrade(&self.inner),
            accepted_at: Instant::now(),
        });
        self.inner.active.fetch_add(1, Ordering::AcqRel);
        self.inner.conns.insert(id, Arc::clone(&conn));
        self.inner.changed.notify_waiters();
        tracing::debug!(conn_id = id, peer = ?conn.peer_addr(), "connection tracked");
        conn
    }

    /// Looks up a live connection.
    #[must_use]
    pub fn get(&self, id: u64) -> Option<Arc<TrackedConnection>> {
        self.inner.conns.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of live connections.
    #[must_use]
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Number of live connections of `kind`.
    #[must_use]
    pub fn count(&self, kind: ConnectionKind) -> usize {
        self.inner
            .conns
            .iter()
            .filter(|entry| entry.value().kind() == kind)
            .count()
    }

    /// Live connections ordered by identifier.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<TrackedConnection>> {
        let mut conns: Vec<_> = self
            .inner
            .conns
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        conns.sort_by_key(|c| c.id);
        conns
    }

    /// Waits until the next connection is tracked or released.
    pub async fn changed(&self) {
        self.inner.changed.notified().await;
    }

    /// Waits until no connection is live.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("active", &self.active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn memory(registry: &ConnectionRegistry) -> (Arc<TrackedConnection>, DuplexStream) {
        let (conn, client) = MemoryConn::pair(256);
        (registry.track(Arc::new(conn)), client)
    }

    #[tokio::test]
    async fn test_ids_are_monotonic() {
        let registry = ConnectionRegistry::new();
        let (a, _ca) = memory(&registry);
        let (b, _cb) = memory(&registry);
        assert!(b.id() > a.id());
        assert_eq!(registry.active(), 2);
        assert_eq!(
            registry.snapshot().iter().map(|c| c.id()).collect::<Vec<_>>(),
            vec![a.id(), b.id()]
        );
        assert!(registry.get(a.id()).is_some());
    }

    #[tokio::test]
    async fn test_release_is_close_once() {
        let registry = ConnectionRegistry::new();
        let (conn, _client) = memory(&registry);

        assert!(conn.release());
        assert!(!conn.release());
        conn.close();
        conn.close();

        assert_eq!(registry.active(), 0);
        assert!(registry.get(conn.id()).is_none());
        assert!(conn.is_released());
    }

    #[tokio::test]
    async fn test_close_signals_peer_eof() {
        let registry = ConnectionRegistry::new();
        let (conn, mut client) = memory(&registry);
        conn.close();

        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        assert!(conn.transport().write_raw(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_raw_io_roundtrip() {
        let registry = ConnectionRegistry::new();
        let (conn, mut client) = memory(&registry);

        conn.transport().write_raw(&[0x88, 0x02, 0x03, 0xE9]).await.unwrap();
        let mut frame = [0u8; 4];
        client.read_exact(&mut frame).await.unwrap();
        assert_eq!(frame, [0x88, 0x02, 0x03, 0xE9]);

        client.write_all(b"ok").await.unwrap();
        let mut buf = [0u8; 16];
        let n = conn.transport().read_raw(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ok");
    }

    #[tokio::test]
    async fn test_tracked_io_releases_on_drop() {
        let registry = ConnectionRegistry::new();
        let (conn, _client) = memory(&registry);
        let io = TrackedIo::new(Arc::clone(&conn));
        assert_eq!(registry.active(), 1);
        drop(io);
        assert_eq!(registry.active(), 0);
        tokio::time::timeout(Duration::from_secs(1), conn.released())
            .await
            .expect("released future should complete");
    }

    #[tokio::test]
    async fn test_wait_idle() {
        let registry = ConnectionRegistry::new();
        registry.wait_idle().await;

        let (conn, _client) = memory(&registry);
        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait_idle().await })
        };
        tokio::task::yield_now().await;
        conn.release();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait_idle should return")
            .unwrap();
    }

    #[tokio::test]
    async fn test_kind_tagging_through_handle() {
        let registry = ConnectionRegistry::new();
        let (conn, _client) = memory(&registry);
        let handle: Arc<dyn ConnectionHandle> = conn.clone();
        handle.set_kind(ConnectionKind::WebSocket);
        assert_eq!(conn.kind(), ConnectionKind::WebSocket);
        assert_eq!(registry.count(ConnectionKind::WebSocket), 1);
        assert_eq!(registry.count(ConnectionKind::Plain), 0);
    }

    #[tokio::test]
    async fn test_tcp_close_unblocks_peer() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();

        let conn = TcpConn::new(accepted).unwrap();
        assert!(conn.peer_addr().is_some());
        conn.write_raw(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        conn.close().unwrap();
        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(1), client.read_to_end(&mut rest))
            .await
            .expect("peer should see EOF")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }
}
