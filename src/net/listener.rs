//! TCP listener implementation.
//!
//! # Responsibilities
//! - Resolve and bind the configured address (address reuse, one retry)
//! - Accept incoming TCP connections until shutdown
//! - Apply per-socket options (keepalive, nodelay)
//! - Port availability helpers for startup fallback and the CLI

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use std::future::Future;
use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use crate::config::{KeepaliveConfig, ListenerConfig};
use crate::net::handler::{spawn_handler, ConnectionContext};

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("cannot resolve listen address {0}")]
    InvalidAddress(String),

    #[error("address {addr} already in use")]
    AddrInUse {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind: {0}")]
    Bind(#[source] io::Error),

    #[error("server is already running")]
    AlreadyRunning,

    #[error("start aborted by quiesce")]
    Aborted,
}

impl ListenerError {
    pub fn is_addr_in_use(&self) -> bool {
        matches!(self, ListenerError::AddrInUse { .. })
    }
}

/// Resolve `host:port` to the first socket address.
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr, ListenerError> {
    let resolved = tokio::net::lookup_host((host, port))
        .await
        .ok()
        .and_then(|mut addrs| addrs.next());
    resolved.ok_or_else(|| ListenerError::InvalidAddress(format!("{}:{}", host, port)))
}

/// Bind a listening socket, retrying once after the cooldown if the address
/// is still held by a previous instance.
pub async fn bind(addr: SocketAddr, config: &ListenerConfig) -> Result<TcpListener, ListenerError> {
    match bind_once(addr, config.backlog) {
        Ok(listener) => return Ok(listener),
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            tracing::warn!(
                address = %addr,
                cooldown = ?config.bind_retry_cooldown(),
                "Address in use, retrying bind after cooldown"
            );
        }
        Err(e) => return Err(ListenerError::Bind(e)),
    }

    tokio::time::sleep(config.bind_retry_cooldown()).await;

    bind_once(addr, config.backlog).map_err(|e| {
        if e.kind() == io::ErrorKind::AddrInUse {
            ListenerError::AddrInUse { addr, source: e }
        } else {
            ListenerError::Bind(e)
        }
    })
}

fn bind_once(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    if let Err(e) = socket.set_reuse_address(true) {
        tracing::debug!(error = %e, "SO_REUSEADDR not supported");
    }
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    if let Err(e) = socket.set_reuse_port(true) {
        tracing::debug!(error = %e, "SO_REUSEPORT not supported");
    }

    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;
    socket.set_nonblocking(true)?;

    TcpListener::from_std(socket.into())
}

/// Apply keepalive and nodelay to an accepted stream. Failures are logged.
pub fn configure_stream(stream: &TcpStream, keepalive: &KeepaliveConfig) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
    }
    if !keepalive.enabled {
        return;
    }

    let params = TcpKeepalive::new().with_time(Duration::from_secs(keepalive.idle_secs));
    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "freebsd", windows))]
    let params = params.with_interval(Duration::from_secs(keepalive.interval_secs));
    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "freebsd"))]
    let params = params.with_retries(keepalive.retries);

    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&params) {
        tracing::debug!(error = %e, "Failed to enable TCP keepalive");
    }
}

/// Source of accepted TCP streams.
pub(crate) trait Acceptor: Send + Sync + 'static {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;
}

impl Acceptor for TcpListener {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }
}

/// Accept connections until shutdown is signalled.
///
/// Each accept is bounded by `accept_wait` so the running flag is re-checked
/// even when no client connects. If accepting fails while the server is
/// running, the server is stopped: the running flag is cleared and every
/// connection closed, so a later `start` can bind again.
pub(crate) async fn run_accept_loop<A: Acceptor>(
    listener: A,
    ctx: Arc<ConnectionContext>,
    accept_wait: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        if !ctx.shutdown.is_running() {
            break;
        }

        let accepted = tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            accepted = tokio::time::timeout(accept_wait, listener.accept()) => accepted,
        };

        match accepted {
            Err(_elapsed) => continue,
            Ok(Ok((stream, peer_addr))) => {
                configure_stream(&stream, &ctx.config.keepalive);
                let (reader, writer) = stream.into_split();
                spawn_handler(ctx.clone(), reader, Box::new(writer), peer_addr);
            }
            Ok(Err(e)) => {
                if ctx.shutdown.trigger() {
                    tracing::error!(error = %e, "Accept failed, stopping gateway");
                    let closed = ctx.close_all().await;
                    tracing::info!(connections = closed, "Gateway stopped after accept failure");
                }
                break;
            }
        }
    }

    tracing::info!("Accept loop stopped");
}

/// Whether `host:port` cannot currently be bound.
pub fn is_port_in_use(host: &str, port: u16) -> bool {
    StdTcpListener::bind((host, port)).is_err()
}

/// First bindable port in the inclusive range `start..=max`.
///
/// Returns `None` when the range is empty or every port is taken.
pub fn find_available_port(host: &str, start: u16, max: u16) -> Option<u16> {
    (start..=max).find(|port| !is_port_in_use(host, *port))
}
