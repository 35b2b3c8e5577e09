//! Server facade: listener, registry and consumer wired together.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::GatewayConfig;
use crate::gateway::consumer::{call_isolated, Consumer};
use crate::gateway::sender::{CommandSender, SendError};
use crate::lifecycle::Shutdown;
use crate::net::connection::ConnectionTracker;
use crate::net::handler::ConnectionContext;
use crate::net::listener::{self, ListenerError};
use crate::net::registry::{PeerTable, Registry, RegistrySnapshot};
use crate::protocol::{BinaryCodec, Codec, Payload};

/// TCP gateway for fleet devices.
///
/// Created once; may be started, quiesced and started again. `quiesce` and
/// `stop` are idempotent and safe before `start`.
pub struct GatewayServer {
    config: GatewayConfig,
    ctx: Arc<ConnectionContext>,
    sender: CommandSender,
    accept_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    /// Serializes start against quiesce.
    lifecycle: tokio::sync::Mutex<()>,
    /// Wakes a `start` stuck in its bind retry when quiesce is requested.
    abort_start: Notify,
}

impl GatewayServer {
    /// Build a server around `codec` and attach `consumer` to it.
    pub fn new(config: GatewayConfig, codec: Arc<dyn Codec>, consumer: Arc<dyn Consumer>) -> Self {
        let registry = Arc::new(Registry::new());
        let sender = CommandSender::new(registry.clone(), codec.clone(), &config.protocol.server_id);

        let ctx = Arc::new(ConnectionContext {
            config: config.connection.clone(),
            server_id: config.protocol.server_id.clone(),
            codec,
            consumer: consumer.clone(),
            registry,
            peers: Arc::new(PeerTable::new()),
            shutdown: Arc::new(Shutdown::new()),
            tracker: ConnectionTracker::new(),
        });

        let attached = sender.clone();
        call_isolated("on_attach", move || consumer.on_attach(attached));

        Self {
            config,
            ctx,
            sender,
            accept_task: tokio::sync::Mutex::new(None),
            local_addr: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            abort_start: Notify::new(),
        }
    }

    /// Build a server using [`BinaryCodec`] with the configured server id.
    pub fn with_binary_codec(config: GatewayConfig, consumer: Arc<dyn Consumer>) -> Self {
        let codec = Arc::new(BinaryCodec::new(config.protocol.server_id.clone()));
        Self::new(config, codec, consumer)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Bind `host:port` and begin accepting. Returns the bound address.
    pub async fn start(&self, host: &str, port: u16) -> Result<SocketAddr, ListenerError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.ctx.shutdown.is_running() {
            return Err(ListenerError::AlreadyRunning);
        }

        let addr = listener::resolve(host, port).await?;
        let bound = tokio::select! {
            biased;
            _ = self.abort_start.notified() => {
                tracing::info!(address = %addr, "Start aborted by quiesce");
                return Err(ListenerError::Aborted);
            }
            bound = listener::bind(addr, &self.config.listener) => bound?,
        };
        let local_addr = bound.local_addr().map_err(ListenerError::Bind)?;

        self.ctx.shutdown.begin();
        let shutdown_rx = self.ctx.shutdown.subscribe();
        let task = tokio::spawn(listener::run_accept_loop(
            bound,
            self.ctx.clone(),
            self.config.listener.accept_wait(),
            shutdown_rx,
        ));

        *self.accept_task.lock().await = Some(task);
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(local_addr);

        tracing::info!(
            address = %local_addr,
            backlog = self.config.listener.backlog,
            server_id = %self.config.protocol.server_id,
            "Gateway listening"
        );
        Ok(local_addr)
    }

    /// Stop serving: close the listener and every socket, clear the registry.
    ///
    /// The server can be started again afterwards.
    pub async fn quiesce(&self) {
        self.abort_start.notify_waiters();
        let _lifecycle = self.lifecycle.lock().await;

        let was_running = self.ctx.shutdown.trigger();

        // A listener that failed on its own has already torn down; waiting on
        // its task still guarantees that teardown is complete.
        if let Some(task) = self.accept_task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Accept task ended abnormally");
            }
        }
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = None;

        if !was_running {
            tracing::debug!("Quiesce requested while not running");
            return;
        }
        tracing::info!("Quiescing gateway");

        let closed = self.ctx.close_all().await;
        tracing::info!(connections = closed, "Gateway quiesced");
    }

    /// Quiesce, then wait for connection handlers to finish.
    pub async fn stop(&self) {
        self.quiesce().await;

        let deadline = self.config.lifecycle.drain_timeout();
        if self.ctx.tracker.wait_for_idle(deadline).await {
            tracing::info!("Gateway stopped");
        } else {
            tracing::warn!(
                remaining = self.ctx.tracker.active_count(),
                timeout = ?deadline,
                "Drain timeout reached, handlers still running"
            );
        }
    }

    /// Send `command` to the device registered as `recipient`.
    pub async fn send_to(
        &self,
        recipient: &str,
        command: &str,
        payload: &Payload,
    ) -> Result<(), SendError> {
        self.sender.send_to(recipient, command, payload).await
    }

    pub fn sender(&self) -> CommandSender {
        self.sender.clone()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        self.ctx.registry.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.ctx.shutdown.is_running()
    }

    /// Bound address while the server is accepting.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        if !self.is_running() {
            return None;
        }
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of connection handlers still alive.
    pub fn active_connections(&self) -> u64 {
        self.ctx.tracker.active_count()
    }
}

impl Drop for GatewayServer {
    fn drop(&mut self) {
        // Wakes the accept loop and every handler; their sockets close as they unwind.
        self.ctx.shutdown.trigger();
    }
}

impl std::fmt::Debug for GatewayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayServer")
            .field("running", &self.is_running())
            .field("local_addr", &self.local_addr())
            .field("registered", &self.ctx.registry.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::consumer::ChannelConsumer;

    fn server() -> GatewayServer {
        let (consumer, _rx) = ChannelConsumer::new();
        GatewayServer::with_binary_codec(GatewayConfig::default(), consumer)
    }

    #[tokio::test]
    async fn stop_before_start_is_harmless() {
        let server = server();
        server.stop().await;
        server.quiesce().await;
        assert!(!server.is_running());
        assert!(server.snapshot().is_empty());
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let server = server();
        server.start("127.0.0.1", 0).await.unwrap();
        let err = server.start("127.0.0.1", 0).await.unwrap_err();
        assert!(matches!(err, ListenerError::AlreadyRunning));
        server.stop().await;
    }

    #[tokio::test]
    async fn consumer_is_attached_on_creation() {
        let (consumer, _rx) = ChannelConsumer::new();
        let _server = GatewayServer::with_binary_codec(GatewayConfig::default(), consumer.clone());
        assert_eq!(consumer.sender().unwrap().server_id(), "SERVER");
    }

    #[tokio::test]
    async fn quiesce_aborts_pending_bind_retry() {
        let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();

        let mut config = GatewayConfig::default();
        config.listener.bind_retry_cooldown_ms = 10_000;
        let (consumer, _rx) = ChannelConsumer::new();
        let server = Arc::new(GatewayServer::with_binary_codec(config, consumer));

        let starting = {
            let server = server.clone();
            tokio::spawn(async move { server.start("127.0.0.1", port).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        server.quiesce().await;

        let result = tokio::time::timeout(std::time::Duration::from_secs(2), starting)
            .await
            .expect("start did not return")
            .unwrap();
        assert!(matches!(result, Err(ListenerError::Aborted)));
        assert!(!server.is_running());
    }
}
