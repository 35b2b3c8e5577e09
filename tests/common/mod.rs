//! Shared utilities for integration testing.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use fleet_gateway::config::GatewayConfig;
use fleet_gateway::gateway::{Consumer, ConsumerError, GatewayServer};
use fleet_gateway::protocol::{BinaryCodec, Codec, Message, Payload};
use fleet_gateway::RegistrySnapshot;

pub const WAIT: Duration = Duration::from_secs(3);

/// Config tuned for fast tests: loopback, short idle timeout, quick drain.
pub fn test_config(idle_timeout_ms: u64) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.listener.host = "127.0.0.1".into();
    config.listener.port = 0;
    config.listener.accept_wait_ms = 50;
    config.listener.bind_retry_cooldown_ms = 50;
    config.connection.idle_timeout_ms = idle_timeout_ms;
    config.connection.keepalive.enabled = false;
    config.lifecycle.drain_timeout_ms = 2_000;
    config
}

/// Start a gateway on an ephemeral loopback port.
pub async fn start_gateway(
    idle_timeout_ms: u64,
) -> (Arc<GatewayServer>, Arc<RecordingConsumer>, SocketAddr) {
    let consumer = Arc::new(RecordingConsumer::default());
    let server = Arc::new(GatewayServer::with_binary_codec(
        test_config(idle_timeout_ms),
        consumer.clone(),
    ));
    let addr = server.start("127.0.0.1", 0).await.unwrap();
    (server, consumer, addr)
}

/// Consumer that keeps everything it is told.
#[derive(Default)]
pub struct RecordingConsumer {
    messages: Mutex<Vec<Message>>,
    snapshots: Mutex<Vec<RegistrySnapshot>>,
}

#[allow(dead_code)]
impl RecordingConsumer {
    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }

    pub fn snapshots(&self) -> Vec<RegistrySnapshot> {
        self.snapshots.lock().unwrap().clone()
    }

    pub async fn wait_for_messages(&self, count: usize) -> Vec<Message> {
        eventually(|| self.messages.lock().unwrap().len() >= count).await;
        self.messages()
    }
}

impl Consumer for RecordingConsumer {
    fn on_message(&self, message: Message) -> Result<(), ConsumerError> {
        self.messages.lock().unwrap().push(message);
        Ok(())
    }

    fn on_registry_changed(&self, snapshot: &RegistrySnapshot) {
        self.snapshots.lock().unwrap().push(snapshot.clone());
    }
}

/// Poll `check` until it holds or `WAIT` elapses.
pub async fn eventually<F: Fn() -> bool>(check: F) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within {:?}",
            WAIT
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// A fake truck speaking the binary protocol over real TCP.
pub struct TestDevice {
    stream: TcpStream,
    codec: BinaryCodec,
}

#[allow(dead_code)]
impl TestDevice {
    pub async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            codec: BinaryCodec::default(),
        }
    }

    pub fn local_port(&self) -> u16 {
        self.stream.local_addr().unwrap().port()
    }

    pub async fn send(&mut self, sender: &str, command: &str) {
        self.send_with(sender, command, &Payload::new()).await;
    }

    pub async fn send_with(&mut self, sender: &str, command: &str, payload: &Payload) {
        let bytes = self.codec.encode(sender, "SERVER", command, payload).unwrap();
        self.send_raw(&bytes).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// Read one full frame and decode it.
    pub async fn read_message(&mut self) -> Message {
        tokio::time::timeout(WAIT, async {
            let mut header = [0u8; 4];
            self.stream.read_exact(&mut header).await.unwrap();
            let mut bytes = header.to_vec();
            bytes.resize(4 + header[3] as usize, 0);
            self.stream.read_exact(&mut bytes[4..]).await.unwrap();
            self.codec.decode(&bytes).unwrap()
        })
        .await
        .expect("no message from gateway")
    }

    /// Assert nothing arrives for `quiet`.
    pub async fn expect_silence(&mut self, quiet: Duration) {
        let mut buf = [0u8; 1];
        if let Ok(result) = tokio::time::timeout(quiet, self.stream.read(&mut buf)).await {
            panic!("expected silence, got {:?}", result);
        }
    }

    /// Assert the gateway closes the socket.
    pub async fn expect_closed(&mut self) {
        let mut buf = [0u8; 16];
        let result = tokio::time::timeout(WAIT, self.stream.read(&mut buf))
            .await
            .expect("connection was not closed");
        match result {
            Ok(0) => {}
            Err(_) => {}
            Ok(n) => panic!("expected close, got {} bytes: {:?}", n, &buf[..n]),
        }
    }
}
