//! Outbound command path.

use std::io;
use std::sync::Arc;
use thiserror::Error;

use crate::net::registry::{Registry, RegistrySnapshot};
use crate::observability::metrics;
use crate::protocol::{Codec, CodecError, Payload};

/// Why a command could not be delivered.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("no open connection for {0}")]
    UnknownRecipient(String),

    #[error("cannot encode {command} for {recipient}: {source}")]
    Encode {
        recipient: String,
        command: String,
        #[source]
        source: CodecError,
    },

    #[error("write to {recipient} failed: {source}")]
    Write {
        recipient: String,
        #[source]
        source: io::Error,
    },
}

/// Cloneable handle for sending commands to registered devices.
#[derive(Clone)]
pub struct CommandSender {
    registry: Arc<Registry>,
    codec: Arc<dyn Codec>,
    server_id: Arc<str>,
}

impl CommandSender {
    pub(crate) fn new(registry: Arc<Registry>, codec: Arc<dyn Codec>, server_id: &str) -> Self {
        Self {
            registry,
            codec,
            server_id: Arc::from(server_id),
        }
    }

    /// Encode `command` and write it to the connection registered as `recipient`.
    ///
    /// A write failure removes the recipient's connection from the registry and
    /// closes it; its handler finishes the cleanup.
    pub async fn send_to(
        &self,
        recipient: &str,
        command: &str,
        payload: &Payload,
    ) -> Result<(), SendError> {
        let Some(conn) = self.registry.lookup(recipient) else {
            metrics::record_send("unknown_recipient");
            tracing::warn!(recipient, command, "Cannot send, recipient not connected");
            return Err(SendError::UnknownRecipient(recipient.to_string()));
        };

        let bytes = self
            .codec
            .encode(&self.server_id, recipient, command, payload)
            .map_err(|source| {
                metrics::record_send("encode_error");
                tracing::warn!(recipient, command, error = %source, "Cannot encode command");
                SendError::Encode {
                    recipient: recipient.to_string(),
                    command: command.to_string(),
                    source,
                }
            })?;

        if let Err(source) = conn.send(&bytes).await {
            metrics::record_send("write_error");
            tracing::warn!(
                recipient,
                command,
                connection_id = %conn.id(),
                error = %source,
                "Write failed, dropping connection"
            );
            self.registry.remove_connection(conn.id());
            conn.close().await;
            return Err(SendError::Write {
                recipient: recipient.to_string(),
                source,
            });
        }

        metrics::record_send("ok");
        tracing::debug!(recipient, command, connection_id = %conn.id(), "Command sent");
        Ok(())
    }

    pub fn is_connected(&self, id: &str) -> bool {
        self.registry.contains(id)
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        self.registry.snapshot()
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }
}

impl std::fmt::Debug for CommandSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSender")
            .field("server_id", &self.server_id)
            .field("registered", &self.registry.len())
            .finish()
    }
}
