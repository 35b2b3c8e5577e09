//! Connection state machine and lifecycle tracking.
//!
//! # Responsibilities
//! - Track connection state (Open → Closing → Closed)
//! - Track device identity (Temporary → Identified)
//! - Serialize writes through a per-connection lock
//! - Count live handler tasks for drain on stop

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

use crate::observability::metrics;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Registry key prefix for connections that have not identified yet.
pub const TEMP_PREFIX: &str = "TEMP_";

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection state for lifecycle tracking.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connection is registered and serving frames.
    Open = 0,
    /// Connection is being torn down; no longer addressable.
    Closing = 1,
    /// Socket released and registry entry removed.
    Closed = 2,
}

impl From<u8> for ConnectionState {
    fn from(val: u8) -> Self {
        match val {
            0 => ConnectionState::Open,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Who is on the other end of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    /// Not identified yet; keyed by the peer's source port.
    Temporary(u16),
    /// Identified by the device's own id.
    Identified(String),
}

impl Identity {
    /// The registry key for this identity.
    pub fn key(&self) -> String {
        match self {
            Identity::Temporary(port) => format!("{}{}", TEMP_PREFIX, port),
            Identity::Identified(id) => id.clone(),
        }
    }

    pub fn device_id(&self) -> Option<&str> {
        match self {
            Identity::Temporary(_) => None,
            Identity::Identified(id) => Some(id),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Write half of a connection's socket.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One accepted socket, shared between its handler and the registry.
pub struct Connection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    identity: Mutex<Identity>,
    state: AtomicU8,
    last_activity: Mutex<Instant>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    close_tx: watch::Sender<bool>,
}

impl Connection {
    /// Wrap the write half of a freshly accepted socket.
    pub fn new(peer_addr: SocketAddr, writer: BoxedWriter) -> Self {
        let (close_tx, _) = watch::channel(false);
        Self {
            id: ConnectionId::new(),
            peer_addr,
            identity: Mutex::new(Identity::Temporary(peer_addr.port())),
            state: AtomicU8::new(ConnectionState::Open as u8),
            last_activity: Mutex::new(Instant::now()),
            writer: tokio::sync::Mutex::new(Some(writer)),
            close_tx,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn identity(&self) -> Identity {
        self.identity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_identity(&self, identity: Identity) {
        *self.identity.lock().unwrap_or_else(PoisonError::into_inner) = identity;
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Time since the last decoded frame.
    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Receiver that flips to `true` once the connection starts closing.
    pub fn close_signal(&self) -> watch::Receiver<bool> {
        self.close_tx.subscribe()
    }

    /// Move `Open → Closing` and wake the handler.
    ///
    /// Returns `true` only for the call that performed the transition.
    pub fn begin_close(&self) -> bool {
        let transitioned = self
            .state
            .compare_exchange(
                ConnectionState::Open as u8,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if transitioned {
            self.close_tx.send_replace(true);
        }
        transitioned
    }

    pub(crate) fn mark_closed(&self) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
    }

    /// Write one encoded frame under the connection's write lock.
    pub async fn send(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(w) => {
                w.write_all(bytes).await?;
                w.flush().await
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection already closed",
            )),
        }
    }

    /// Begin closing and shut down the write half. Shutdown errors are ignored.
    pub async fn close(&self) {
        self.begin_close();
        let writer = self.writer.lock().await.take();
        if let Some(mut w) = writer {
            if let Err(e) = w.shutdown().await {
                tracing::trace!(connection_id = %self.id, error = %e, "Socket shutdown failed");
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("identity", &self.identity())
            .field("state", &self.state())
            .finish()
    }
}

/// Tracks live connection handlers so `stop` can wait for them.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    active_count: Arc<AtomicU64>,
}

impl ConnectionTracker {
    /// Create a new connection tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new active connection. Returns a guard that decrements on drop.
    pub fn track(&self, id: ConnectionId) -> ConnectionGuard {
        self.active_count.fetch_add(1, Ordering::SeqCst);
        metrics::record_connection_opened();
        ConnectionGuard {
            active_count: Arc::clone(&self.active_count),
            id,
        }
    }

    /// Get current active connection count.
    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }

    /// Wait until every handler has exited or the deadline passes.
    ///
    /// Returns `true` if all handlers finished in time.
    pub async fn wait_for_idle(&self, deadline: Duration) -> bool {
        let start = Instant::now();
        while self.active_count.load(Ordering::SeqCst) > 0 {
            if start.elapsed() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }
}

/// Guard that tracks a connection handler's lifetime.
/// Decrements active count when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    active_count: Arc<AtomicU64>,
    id: ConnectionId,
}

impl ConnectionGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active_count.fetch_sub(1, Ordering::SeqCst);
        metrics::record_connection_closed();
        tracing::trace!(connection_id = %self.id, "Connection handler exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_connection(port: u16) -> (Connection, tokio::io::DuplexStream) {
        let (local, remote) = tokio::io::duplex(256);
        let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
        (Connection::new(addr, Box::new(local)), remote)
    }

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn identity_keys() {
        assert_eq!(Identity::Temporary(50123).key(), "TEMP_50123");
        assert_eq!(Identity::Identified("TRUCK_1".into()).key(), "TRUCK_1");
        assert_eq!(Identity::Temporary(1).device_id(), None);
    }

    #[tokio::test]
    async fn starts_temporary_and_open() {
        let (conn, _remote) = test_connection(40001);
        assert_eq!(conn.identity(), Identity::Temporary(40001));
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn begin_close_transitions_once() {
        let (conn, _remote) = test_connection(40002);
        let mut signal = conn.close_signal();

        assert!(conn.begin_close());
        assert!(!conn.begin_close());
        assert_eq!(conn.state(), ConnectionState::Closing);

        signal.changed().await.unwrap();
        assert!(*signal.borrow());
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        use tokio::io::AsyncReadExt;

        let (conn, mut remote) = test_connection(40003);
        conn.send(&[1, 2, 3, 0]).await.unwrap();
        let mut buf = [0u8; 4];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [1, 2, 3, 0]);

        conn.close().await;
        let err = conn.send(&[1, 2, 3, 0]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);

        // Shutdown reaches the peer as EOF.
        assert_eq!(remote.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn tracker_counts_and_drains() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.active_count(), 0);

        let guard1 = tracker.track(ConnectionId::new());
        let guard2 = tracker.track(ConnectionId::new());
        assert_eq!(tracker.active_count(), 2);

        drop(guard1);
        assert_eq!(tracker.active_count(), 1);
        assert!(!tracker.wait_for_idle(Duration::from_millis(50)).await);

        drop(guard2);
        assert!(tracker.wait_for_idle(Duration::from_millis(50)).await);
    }
}
