//! Shutdown coordination for the gateway.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

/// Running flag plus a broadcast that wakes every long-running task.
///
/// The flag makes `trigger` idempotent; the broadcast lets tasks blocked in
/// `select!` observe shutdown without polling.
#[derive(Debug)]
pub struct Shutdown {
    running: AtomicBool,
    /// Broadcast channel sender.
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    /// Create a new shutdown coordinator in the stopped state.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            running: AtomicBool::new(false),
            tx,
        }
    }

    /// Mark the server running. Returns `false` if it already was.
    pub fn begin(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Clear the running flag and wake subscribers.
    ///
    /// Returns `false` (and sends nothing) if the server was not running.
    pub fn trigger(&self) -> bool {
        if !self.running.swap(false, Ordering::AcqRel) {
            return false;
        }
        let _ = self.tx.send(());
        true
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
