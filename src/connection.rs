//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Connection: exclusive owner of one transport stream
//!
//! A [`Connection`] owns the duplex byte stream of one accepted socket,
//! plain or TLS-wrapped. All writes go through a per-connection permit so
//! concurrent senders are serialized and the peer observes each submission
//! contiguously, in acquisition order. Reads are serialized the same way.
//!
//! Disconnect is idempotent: the first caller wins a single-shot flag,
//! tears the transport down best-effort, and fires the disconnected
//! notification exactly once; every later caller returns immediately.

use crate::{ConnectionId, ConnectionInfo, ConnectionState, HostListener, Protocol, ProtocolSocket};
use bytes::{Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

/// Read half of the installed transport, type-erased over plain/TLS streams
type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Write half of the installed transport
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Gather buffers above this capacity are dropped instead of pooled
const MAX_POOLED_CAPACITY: usize = 64 * 1024;
/// At most this many gather buffers are kept per connection
const POOL_LIMIT: usize = 4;

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed")
}

/// One accepted connection and its transport
///
/// Shared as `Arc<Connection>` between the accept pipeline, the installed
/// protocol, and the liveness schedulers. The transport itself is owned
/// exclusively here; protocol objects and the listener are referenced
/// without ownership.
pub struct Connection {
    /// Identity, unique for the server's lifetime
    id: ConnectionId,
    /// Peer address
    peer_addr: SocketAddr,
    /// Whether the transport is TLS-wrapped
    secure: bool,
    /// Listener that accepted this connection
    listener: Weak<HostListener>,

    /// Lifecycle state; advances monotonically Pending → Closed
    state: AtomicU8,
    /// Single-shot guard for the disconnected notification
    disconnect_fired: AtomicBool,
    /// Cancelled on disconnect; unblocks in-flight reads and writes
    shutdown: CancellationToken,

    /// Read half; the permit serializes readers
    reader: Mutex<Option<BoxedReader>>,
    /// Write half; the permit is the single-writer discipline
    writer: Mutex<Option<BoxedWriter>>,

    /// Installed protocol; null until a handshake wins
    protocol: RwLock<Option<Arc<dyn Protocol>>>,
    /// Protocol-supplied connection view
    socket: RwLock<Option<Arc<dyn ProtocolSocket>>>,

    /// When the connection was accepted
    created_at: Instant,
    /// Handshake deadline enforced by the keep-alive reaper
    deadline: Instant,
    /// Last observed activity (reads, writes, explicit keep-alive)
    last_activity: RwLock<Instant>,
    /// Set when a ping was sent and no pong arrived yet
    pong_required: AtomicBool,
    /// Suppress pings while application traffic proves liveness
    smart_health_check: AtomicBool,

    /// Rented gather buffers for segment sends
    buffer_pool: StdMutex<Vec<BytesMut>>,
}

impl Connection {
    /// Create a new connection in `Pending` state
    ///
    /// The transport is installed separately once the optional TLS wrap has
    /// completed; until then reads and writes fail.
    pub(crate) fn new(
        id: ConnectionId,
        peer_addr: SocketAddr,
        secure: bool,
        listener: Weak<HostListener>,
        request_timeout: Duration,
    ) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            id,
            peer_addr,
            secure,
            listener,
            state: AtomicU8::new(ConnectionState::Pending.as_u8()),
            disconnect_fired: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            protocol: RwLock::new(None),
            socket: RwLock::new(None),
            created_at: now,
            deadline: now + request_timeout,
            last_activity: RwLock::new(now),
            pong_required: AtomicBool::new(false),
            smart_health_check: AtomicBool::new(false),
            buffer_pool: StdMutex::new(Vec::new()),
        })
    }

    /// Install the (possibly TLS-wrapped) transport
    #[instrument(skip(self, stream), fields(connection_id = %self.id))]
    pub(crate) async fn install_transport<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        *self.reader.lock().await = Some(Box::new(reader));
        *self.writer.lock().await = Some(Box::new(writer));
    }

    // Identity and attributes

    /// Connection identity
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Peer address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Whether the transport is TLS-wrapped
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// The listener that accepted this connection, while it is alive
    pub fn listener(&self) -> Option<Arc<HostListener>> {
        self.listener.upgrade()
    }

    /// When the connection was accepted
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Handshake deadline
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    // State machine

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Advance the state; states only move forward, never back
    pub(crate) fn advance_state(&self, target: ConnectionState) {
        self.state.fetch_max(target.as_u8(), Ordering::AcqRel);
    }

    /// Check whether the connection has been disconnected
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Wait until the connection is disconnected
    pub async fn closed(&self) {
        self.shutdown.cancelled().await;
    }

    // Protocol installation

    /// The currently installed protocol, if any
    pub fn protocol(&self) -> Option<Arc<dyn Protocol>> {
        self.protocol
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Name of the installed protocol
    pub fn protocol_name(&self) -> Option<String> {
        self.protocol
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|p| p.name().to_string())
    }

    pub(crate) fn set_protocol(&self, protocol: Arc<dyn Protocol>) {
        *self
            .protocol
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(protocol);
    }

    /// The protocol-supplied socket view, if any
    pub fn socket(&self) -> Option<Arc<dyn ProtocolSocket>> {
        self.socket
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_socket(&self, socket: Arc<dyn ProtocolSocket>) {
        *self.socket.write().unwrap_or_else(PoisonError::into_inner) = Some(socket);
    }

    // Liveness

    /// Last observed activity
    pub fn last_activity(&self) -> Instant {
        *self
            .last_activity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        *self
            .last_activity
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Refresh the activity timestamp and clear the outstanding-ping flag
    ///
    /// Called by the protocol layer on pong receipt and by applications
    /// that have their own liveness signal.
    pub fn keep_alive(&self) {
        self.touch();
        self.pong_required.store(false, Ordering::Release);
    }

    /// Whether a ping is outstanding without a pong
    pub fn pong_required(&self) -> bool {
        self.pong_required.load(Ordering::Acquire)
    }

    /// Mark that a ping was sent and a pong is now expected
    pub(crate) fn mark_ping_sent(&self) {
        self.pong_required.store(true, Ordering::Release);
    }

    /// Whether pings are suppressed while application traffic flows
    pub fn smart_health_check(&self) -> bool {
        self.smart_health_check.load(Ordering::Acquire)
    }

    /// Enable or disable ping suppression on recent activity
    pub fn set_smart_health_check(&self, enabled: bool) {
        self.smart_health_check.store(enabled, Ordering::Release);
    }

    // Reading

    /// Read some bytes from the transport
    ///
    /// Readers are serialized. Returns `Ok(0)` on a clean peer close and an
    /// error once the connection is disconnected, including when the
    /// disconnect happens while this read is blocked.
    #[instrument(skip(self, buf), fields(connection_id = %self.id))]
    pub async fn read_some(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Err(closed_error());
        }
        let mut guard = self.reader.lock().await;
        let Some(reader) = guard.as_mut() else {
            return Err(closed_error());
        };

        let n = tokio::select! {
            result = reader.read(buf) => result?,
            _ = self.shutdown.cancelled() => return Err(closed_error()),
        };

        if n > 0 {
            self.touch();
        }
        Ok(n)
    }

    // Writing

    /// Send bytes to the peer
    ///
    /// Acquires the connection's write permit, writes and flushes. Returns
    /// false when the connection is closed or the write fails; a failed
    /// write disconnects the connection.
    #[instrument(skip(self, data), fields(connection_id = %self.id))]
    pub async fn send(&self, data: &[u8]) -> bool {
        self.write_serialized(data).await
    }

    /// Send a sub-range of a buffer
    ///
    /// Returns false when the range does not fit inside `data`.
    #[instrument(skip(self, data), fields(connection_id = %self.id))]
    pub async fn send_range(&self, data: &[u8], offset: usize, length: usize) -> bool {
        let Some(end) = offset.checked_add(length) else {
            return false;
        };
        if end > data.len() {
            return false;
        }
        self.write_serialized(&data[offset..end]).await
    }

    /// Send a sequence of segments as one contiguous write
    ///
    /// The segments are gathered into a buffer rented from the connection's
    /// pool; the buffer is returned on every exit path.
    #[instrument(skip(self, segments), fields(connection_id = %self.id))]
    pub async fn send_segments(&self, segments: &[Bytes]) -> bool {
        let total: usize = segments.iter().map(Bytes::len).sum();
        if total == 0 {
            return !self.is_closed();
        }

        let mut buffer = self.rent_buffer(total);
        for segment in segments {
            buffer.extend_from_slice(segment);
        }
        let ok = self.write_serialized(&buffer).await;
        self.return_buffer(buffer);
        ok
    }

    /// Send bytes without blocking the caller
    ///
    /// The write runs on its own task; `completion` fires with the drain
    /// outcome once the write permit has been acquired, the bytes written
    /// and flushed (true) or the attempt failed (false).
    #[instrument(skip(self, data, completion), fields(connection_id = %self.id))]
    pub fn send_with_callback<F>(self: Arc<Self>, data: Bytes, completion: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        tokio::spawn(async move {
            let ok = self.write_serialized(&data).await;
            completion(ok);
        });
    }

    /// The single write path behind every send variant
    async fn write_serialized(&self, data: &[u8]) -> bool {
        if self.is_closed() {
            return false;
        }
        if data.is_empty() {
            return true;
        }

        // The permit guard releases exactly once on every exit path below.
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return false;
        };

        let result = tokio::select! {
            result = async {
                writer.write_all(data).await?;
                writer.flush().await
            } => result,
            _ = self.shutdown.cancelled() => Err(closed_error()),
        };
        drop(guard);

        match result {
            Ok(()) => {
                trace!(len = data.len(), "wrote bytes");
                self.touch();
                true
            }
            Err(e) => {
                debug!(error = %e, "write failed, disconnecting");
                self.disconnect().await;
                false
            }
        }
    }

    fn rent_buffer(&self, capacity: usize) -> BytesMut {
        let pooled = self
            .buffer_pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        match pooled {
            Some(mut buffer) => {
                buffer.clear();
                buffer.reserve(capacity);
                buffer
            }
            None => BytesMut::with_capacity(capacity),
        }
    }

    fn return_buffer(&self, buffer: BytesMut) {
        if buffer.capacity() > MAX_POOLED_CAPACITY {
            return;
        }
        let mut pool = self
            .buffer_pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if pool.len() < POOL_LIMIT {
            pool.push(buffer);
        }
    }

    // Teardown

    /// Disconnect the connection
    ///
    /// Idempotent across concurrent callers: the state advances to Closed,
    /// in-flight reads and writes unblock, the transport is shut down
    /// best-effort, and the disconnected notification fires exactly once.
    #[instrument(skip(self), fields(connection_id = %self.id))]
    pub async fn disconnect(&self) {
        if self.disconnect_fired.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!(peer = %self.peer_addr, "disconnecting");
        self.advance_state(ConnectionState::Closing);
        self.shutdown.cancel();

        // Best-effort transport teardown. A writer currently holding the
        // permit observes the cancellation and bails out on its own; the
        // halves are dropped with the connection in that case.
        if let Ok(mut guard) = self.writer.try_lock() {
            if let Some(writer) = guard.as_mut() {
                let _ = writer.shutdown().await;
            }
            *guard = None;
        }
        if let Ok(mut guard) = self.reader.try_lock() {
            *guard = None;
        }

        self.advance_state(ConnectionState::Closed);

        let socket = self.socket();
        if let Some(socket) = socket {
            socket.on_disconnected().await;
        }
    }

    /// Snapshot of the connection for non-blocking queries
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            state: self.state(),
            peer_addr: self.peer_addr,
            secure: self.secure,
            protocol: self.protocol_name(),
            created_at: self.created_at,
            last_activity: self.last_activity(),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .field("secure", &self.secure)
            .field("protocol", &self.protocol_name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Handover, HandshakeResult};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client_task = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server, _) = listener.accept().await.unwrap();
        let client = client_task.await.unwrap();
        (server, client)
    }

    async fn test_connection() -> (Arc<Connection>, TcpStream) {
        let (server, client) = tcp_pair().await;
        let peer = server.peer_addr().unwrap();
        let connection = Connection::new(
            ConnectionId::new(1),
            peer,
            false,
            Weak::new(),
            Duration::from_secs(5),
        );
        connection.install_transport(server).await;
        (connection, client)
    }

    struct CountingSocket {
        disconnects: AtomicUsize,
    }

    #[async_trait]
    impl ProtocolSocket for CountingSocket {
        async fn ping(&self) -> bool {
            true
        }

        async fn pong(&self, _payload: Option<Bytes>) -> bool {
            true
        }

        async fn on_disconnected(&self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_send_reaches_peer() {
        let (connection, mut client) = test_connection().await;

        assert!(connection.send(b"hello").await);
        assert!(connection.send_range(b"xworldx", 1, 5).await);

        let mut buf = [0u8; 10];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"helloworld");
    }

    #[tokio::test]
    async fn test_send_range_out_of_bounds() {
        let (connection, _client) = test_connection().await;
        assert!(!connection.send_range(b"abc", 2, 5).await);
        assert!(!connection.send_range(b"abc", usize::MAX, 2).await);
        // The connection survives a rejected range.
        assert!(!connection.is_closed());
    }

    #[tokio::test]
    async fn test_send_segments_gathers() {
        let (connection, mut client) = test_connection().await;

        let segments = [
            Bytes::from_static(b"one"),
            Bytes::from_static(b"-"),
            Bytes::from_static(b"two"),
        ];
        assert!(connection.send_segments(&segments).await);

        let mut buf = [0u8; 7];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"one-two");
    }

    #[tokio::test]
    async fn test_send_with_callback() {
        let (connection, mut client) = test_connection().await;

        let (tx, rx) = tokio::sync::oneshot::channel();
        connection
            .clone()
            .send_with_callback(Bytes::from_static(b"async"), move |ok| {
                let _ = tx.send(ok);
            });
        assert!(rx.await.unwrap());

        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"async");
    }

    #[tokio::test]
    async fn test_concurrent_sends_are_contiguous() {
        let (connection, mut client) = test_connection().await;

        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let connection = connection.clone();
            tasks.push(tokio::spawn(async move {
                let payload = [b'a' + i; 64];
                assert!(connection.send(&payload).await);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let mut received = vec![0u8; 8 * 64];
        client.read_exact(&mut received).await.unwrap();

        // Each 64-byte submission must appear contiguously.
        for chunk in received.chunks(64) {
            assert!(chunk.iter().all(|b| *b == chunk[0]));
        }
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (connection, _client) = test_connection().await;
        let socket = Arc::new(CountingSocket {
            disconnects: AtomicUsize::new(0),
        });
        connection.set_socket(socket.clone());

        let a = connection.clone();
        let b = connection.clone();
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { a.disconnect().await }),
            tokio::spawn(async move { b.disconnect().await }),
        );
        ra.unwrap();
        rb.unwrap();
        connection.disconnect().await;

        assert_eq!(socket.disconnects.load(Ordering::SeqCst), 1);
        assert!(connection.is_closed());
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_send_after_disconnect_fails() {
        let (connection, _client) = test_connection().await;
        connection.disconnect().await;
        assert!(!connection.send(b"late").await);
    }

    #[tokio::test]
    async fn test_read_unblocks_on_disconnect() {
        let (connection, _client) = test_connection().await;

        let reader = connection.clone();
        let read_task = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            reader.read_some(&mut buf).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        connection.disconnect().await;

        let result = tokio::time::timeout(Duration::from_secs(1), read_task)
            .await
            .expect("read must unblock")
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_keep_alive_clears_pong_required() {
        let (connection, _client) = test_connection().await;

        connection.mark_ping_sent();
        assert!(connection.pong_required());

        connection.keep_alive();
        assert!(!connection.pong_required());
    }

    #[tokio::test]
    async fn test_state_is_monotonic() {
        let (connection, _client) = test_connection().await;

        connection.advance_state(ConnectionState::Handshaking);
        connection.advance_state(ConnectionState::Connected);
        // Attempting to go backwards is ignored.
        connection.advance_state(ConnectionState::Handshaking);
        assert_eq!(connection.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_info_snapshot() {
        let (connection, _client) = test_connection().await;
        let info = connection.info();
        assert_eq!(info.id, ConnectionId::new(1));
        assert_eq!(info.state, ConnectionState::Pending);
        assert!(!info.secure);
        assert!(info.protocol.is_none());
    }

    struct NullProtocol;

    #[async_trait]
    impl Protocol for NullProtocol {
        fn name(&self) -> &str {
            "null"
        }

        async fn attempt_handshake(
            &self,
            _connection: &Arc<Connection>,
            _peeked: &[u8],
        ) -> HandshakeResult {
            HandshakeResult::Rejected
        }

        async fn handle_connection(&self, _connection: Arc<Connection>, _handover: Handover) {}
    }

    #[tokio::test]
    async fn test_protocol_installation() {
        let (connection, _client) = test_connection().await;
        assert!(connection.protocol().is_none());

        connection.set_protocol(Arc::new(NullProtocol));
        assert_eq!(connection.protocol_name().as_deref(), Some("null"));
    }
}
