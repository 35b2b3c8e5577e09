//! Per-connection read loop.
//!
//! # Responsibilities
//! - Frame inbound bytes and decode them
//! - Promote the connection from `TEMP_<port>` to its device id
//! - Answer `HELLO` locally, check on idle identified devices
//! - Forward application messages to the consumer
//! - Remove the connection from the registry on exit, whatever the cause
//!
//! # Error Policy
//! ```text
//! decode failure        → log, keep reading (frame boundary still valid)
//! truncated / stalled   → close (stream desynchronized)
//! reset / aborted       → close
//! idle, identified      → send HEARTBEAT_CHECK, keep open
//! idle, anonymous       → close
//! other I/O error       → log, keep reading (bounded by max_consecutive_errors)
//! consumer error/panic  → log, keep reading
//! ```

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::broadcast;

use crate::config::ConnectionConfig;
use crate::gateway::consumer::{call_isolated, Consumer};
use crate::lifecycle::Shutdown;
use crate::net::connection::{BoxedWriter, Connection, ConnectionTracker, Identity};
use crate::net::registry::{PeerTable, Registry};
use crate::observability::metrics;
use crate::protocol::{command, Codec, Frame, FrameError, FrameReader, Message, Payload, ReadEvent};

/// State shared by every connection handler of one server.
pub(crate) struct ConnectionContext {
    pub(crate) config: ConnectionConfig,
    pub(crate) server_id: String,
    pub(crate) codec: Arc<dyn Codec>,
    pub(crate) consumer: Arc<dyn Consumer>,
    pub(crate) registry: Arc<Registry>,
    pub(crate) peers: Arc<PeerTable>,
    pub(crate) shutdown: Arc<Shutdown>,
    pub(crate) tracker: ConnectionTracker,
}

impl ConnectionContext {
    pub(crate) fn notify_registry_changed(&self) {
        let snapshot = self.registry.snapshot();
        call_isolated("on_registry_changed", || {
            self.consumer.on_registry_changed(&snapshot)
        });
    }

    /// Close every tracked socket and empty the registry. Returns how many
    /// sockets were closed.
    pub(crate) async fn close_all(&self) -> usize {
        // Every socket is in the peer table. Marking them closing first stops
        // late promotions from re-entering the registry after it is cleared.
        let peers = self.peers.drain();
        for conn in &peers {
            conn.begin_close();
        }
        let registered = self.registry.clear();
        for conn in registered.iter().chain(peers.iter()) {
            conn.close().await;
        }
        self.notify_registry_changed();
        peers.len()
    }
}

/// Why a connection handler exited.
#[derive(Debug)]
enum ExitReason {
    PeerClosed,
    Desync(FrameError),
    Transport(io::Error),
    IdleUnidentified,
    HeartbeatCheckFailed(io::Error),
    TooManyErrors(u32),
    Closed,
    Shutdown,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::PeerClosed => write!(f, "peer closed"),
            ExitReason::Desync(e) => write!(f, "stream desync: {}", e),
            ExitReason::Transport(e) => write!(f, "transport error: {}", e),
            ExitReason::IdleUnidentified => write!(f, "idle before identifying"),
            ExitReason::HeartbeatCheckFailed(e) => write!(f, "heartbeat check failed: {}", e),
            ExitReason::TooManyErrors(n) => write!(f, "{} consecutive errors", n),
            ExitReason::Closed => write!(f, "closed by server"),
            ExitReason::Shutdown => write!(f, "server shutdown"),
        }
    }
}

/// Transport errors after which the socket is unusable.
fn is_fatal(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Register a freshly accepted socket and spawn its handler task.
pub(crate) fn spawn_handler<R>(
    ctx: Arc<ConnectionContext>,
    reader: R,
    writer: BoxedWriter,
    peer_addr: SocketAddr,
) -> Arc<Connection>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let conn = Arc::new(Connection::new(peer_addr, writer));
    let guard = ctx.tracker.track(conn.id());
    let shutdown = ctx.shutdown.subscribe();

    ctx.peers.insert(conn.clone());
    if let Some(stale) = ctx.registry.put(conn.identity().key(), conn.clone()) {
        tracing::warn!(
            connection_id = %stale.id(),
            peer_addr = %stale.peer_addr(),
            "Temporary id reused, closing older connection"
        );
        tokio::spawn(async move { stale.close().await });
    }
    ctx.notify_registry_changed();

    tracing::info!(
        connection_id = %conn.id(),
        peer_addr = %peer_addr,
        temp_id = %conn.identity(),
        "Client connected"
    );

    let handler = ConnectionHandler {
        ctx,
        conn: conn.clone(),
    };
    tokio::spawn(async move {
        let _guard = guard;
        handler.run(reader, shutdown).await;
    });
    conn
}

struct ConnectionHandler {
    ctx: Arc<ConnectionContext>,
    conn: Arc<Connection>,
}

impl ConnectionHandler {
    async fn run<R>(self, reader: R, mut shutdown: broadcast::Receiver<()>)
    where
        R: AsyncRead + Unpin,
    {
        let mut frames = FrameReader::new(reader, self.ctx.config.idle_timeout());
        let reason = self.serve(&mut frames, &mut shutdown).await;
        drop(frames);
        self.cleanup(reason).await;
    }

    async fn serve<R>(
        &self,
        frames: &mut FrameReader<R>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> ExitReason
    where
        R: AsyncRead + Unpin,
    {
        let mut closed = self.conn.close_signal();
        let max_errors = self.ctx.config.max_consecutive_errors;
        let mut consecutive_errors = 0u32;

        loop {
            let event = tokio::select! {
                biased;
                _ = closed.wait_for(|closed| *closed) => return ExitReason::Closed,
                _ = shutdown.recv() => return ExitReason::Shutdown,
                event = frames.next_event() => event,
            };

            match event {
                Ok(ReadEvent::Frame(frame)) => {
                    consecutive_errors = 0;
                    if let Err(reason) = self.on_frame(frame).await {
                        return reason;
                    }
                }
                Ok(ReadEvent::Idle) => {
                    if let Err(reason) = self.on_idle().await {
                        return reason;
                    }
                }
                Ok(ReadEvent::Closed) => return ExitReason::PeerClosed,
                Err(e) if e.is_desync() => {
                    metrics::record_desync();
                    return ExitReason::Desync(e);
                }
                Err(FrameError::Io(e)) if is_fatal(&e) => return ExitReason::Transport(e),
                Err(e) => {
                    consecutive_errors += 1;
                    tracing::warn!(
                        connection_id = %self.conn.id(),
                        peer_addr = %self.conn.peer_addr(),
                        error = %e,
                        consecutive_errors,
                        "Unexpected read error"
                    );
                    if consecutive_errors >= max_errors {
                        return ExitReason::TooManyErrors(consecutive_errors);
                    }
                }
            }
        }
    }

    async fn on_frame(&self, frame: Frame) -> Result<(), ExitReason> {
        metrics::record_frame_received();
        let raw = frame.to_bytes();

        let message = match self.ctx.codec.decode(&raw) {
            Ok(message) => message,
            Err(e) => {
                metrics::record_decode_failure();
                tracing::warn!(
                    connection_id = %self.conn.id(),
                    peer_addr = %self.conn.peer_addr(),
                    error = %e,
                    raw = %hex(&raw),
                    "Discarding invalid message"
                );
                return Ok(());
            }
        };

        tracing::trace!(
            connection_id = %self.conn.id(),
            raw = %hex(&raw),
            command = %message.command,
            "Frame decoded"
        );
        self.conn.touch();

        if let Some(device_id) = message.device_id() {
            self.identify(device_id).await;
        }

        if message.is_hello() {
            metrics::record_heartbeat("hello");
            let device_id = message.device_id().unwrap_or_default();
            tracing::debug!(connection_id = %self.conn.id(), device_id, "Heartbeat received");
            self.send_protocol(device_id, command::HEARTBEAT_ACK)
                .await
                .map_err(ExitReason::Transport)?;
            metrics::record_heartbeat("ack");
            return Ok(());
        }

        self.dispatch(message);
        Ok(())
    }

    async fn on_idle(&self) -> Result<(), ExitReason> {
        match self.conn.identity() {
            Identity::Identified(device_id) => {
                tracing::info!(
                    connection_id = %self.conn.id(),
                    device_id = %device_id,
                    idle_for = ?self.conn.idle_for(),
                    "Device idle, sending heartbeat check"
                );
                self.send_protocol(&device_id, command::HEARTBEAT_CHECK)
                    .await
                    .map_err(ExitReason::HeartbeatCheckFailed)?;
                metrics::record_heartbeat("check");
                Ok(())
            }
            Identity::Temporary(_) => Err(ExitReason::IdleUnidentified),
        }
    }

    /// Promote (or re-key) this connection to `device_id`.
    async fn identify(&self, device_id: &str) {
        let previous = self.conn.identity();
        if previous.device_id() == Some(device_id) || !self.conn.is_open() {
            return;
        }

        self.conn
            .set_identity(Identity::Identified(device_id.to_string()));
        let superseded = self.ctx.registry.put(device_id, self.conn.clone());
        metrics::record_promotion();
        tracing::info!(
            connection_id = %self.conn.id(),
            previous = %previous,
            device_id,
            "Device registered"
        );

        if let Some(old) = superseded {
            tracing::warn!(
                device_id,
                old_connection = %old.id(),
                old_peer = %old.peer_addr(),
                new_connection = %self.conn.id(),
                "Device reconnected, closing previous connection"
            );
            // The old socket's write lock may be held by a stalled send.
            tokio::spawn(async move { old.close().await });
        }

        self.ctx.notify_registry_changed();
    }

    fn dispatch(&self, message: Message) {
        let command = message.command.clone();
        let sender = message.sender.clone();
        if let Some(Err(e)) = call_isolated("on_message", || self.ctx.consumer.on_message(message)) {
            tracing::warn!(
                connection_id = %self.conn.id(),
                sender = ?sender,
                command = %command,
                error = %e,
                "Consumer failed to handle message"
            );
        }
    }

    /// Send a payload-less protocol command on this connection.
    ///
    /// Encoding problems are logged and swallowed; only write errors surface.
    async fn send_protocol(&self, receiver: &str, command: &str) -> io::Result<()> {
        let bytes = match self
            .ctx
            .codec
            .encode(&self.ctx.server_id, receiver, command, &Payload::new())
        {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(
                    connection_id = %self.conn.id(),
                    receiver,
                    command,
                    error = %e,
                    "Cannot encode protocol reply"
                );
                return Ok(());
            }
        };
        self.conn.send(&bytes).await
    }

    async fn cleanup(&self, reason: ExitReason) {
        self.conn.begin_close();
        let removed = self.ctx.registry.remove_connection(self.conn.id());
        self.ctx
            .peers
            .remove(&self.conn.peer_addr(), self.conn.id());
        self.conn.close().await;
        self.conn.mark_closed();

        match &reason {
            ExitReason::PeerClosed | ExitReason::Closed | ExitReason::Shutdown => {
                tracing::info!(
                    connection_id = %self.conn.id(),
                    peer_addr = %self.conn.peer_addr(),
                    identity = %self.conn.identity(),
                    reason = %reason,
                    removed = ?removed,
                    "Connection closed"
                )
            }
            _ => tracing::warn!(
                connection_id = %self.conn.id(),
                peer_addr = %self.conn.peer_addr(),
                identity = %self.conn.identity(),
                reason = %reason,
                removed = ?removed,
                "Connection closed"
            ),
        }

        self.ctx.notify_registry_changed();
    }
}
