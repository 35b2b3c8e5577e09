//! Connection registry.
//!
//! # Responsibilities
//! - Map identifiers (`TEMP_<port>` or device id) to live connections
//! - Keep exactly one key per connection, so promotion is a single update
//! - Supersede older connections that claim an identifier already in use
//! - Track raw peer addresses for shutdown
//!
//! # Design Decisions
//! - One `RwLock` around the whole map: multi-key updates are atomic to readers
//! - Removal is by `ConnectionId`, so a late cleanup never evicts a newer socket
//! - The peer table is a `DashMap`; it has no multi-key invariant

use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};

use crate::net::connection::{Connection, ConnectionId};

/// Point-in-time view of the registry: identifier → peer address.
pub type RegistrySnapshot = BTreeMap<String, SocketAddr>;

/// Concurrency-safe identifier → connection map.
#[derive(Debug, Default)]
pub struct Registry {
    entries: RwLock<HashMap<String, Arc<Connection>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `conn` under `id`.
    ///
    /// Any other key that maps to `conn` is removed in the same critical
    /// section. If `id` was held by a different connection, that connection
    /// is moved to `Closing` under the lock and returned; the caller is
    /// responsible for shutting its socket down. A connection that is no
    /// longer open is never registered.
    pub fn put(&self, id: impl Into<String>, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        let id = id.into();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if !conn.is_open() {
            return None;
        }
        entries.retain(|key, existing| *key == id || existing.id() != conn.id());
        let superseded = entries
            .insert(id, conn.clone())
            .filter(|previous| previous.id() != conn.id());
        if let Some(previous) = &superseded {
            previous.begin_close();
        }
        superseded
    }

    /// Remove the entry for `id`, if any.
    pub fn remove(&self, id: &str) -> Option<Arc<Connection>> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    /// Resolve `id` to an open connection.
    pub fn lookup(&self, id: &str) -> Option<Arc<Connection>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .filter(|conn| conn.is_open())
            .cloned()
    }

    /// Remove every entry matching `predicate`. Returns the removed keys.
    pub fn remove_all<F>(&self, mut predicate: F) -> Vec<String>
    where
        F: FnMut(&str, &Connection) -> bool,
    {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = Vec::new();
        entries.retain(|key, conn| {
            if predicate(key, conn) {
                removed.push(key.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Remove every entry that maps to the given connection.
    pub fn remove_connection(&self, id: ConnectionId) -> Vec<String> {
        self.remove_all(|_, conn| conn.id() == id)
    }

    /// Drop every entry, returning the connections that were registered.
    pub fn clear(&self) -> Vec<Arc<Connection>> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, conn)| conn)
            .collect()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(key, conn)| (key.clone(), conn.peer_addr()))
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lookup(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Raw peer address → connection, for every accepted socket.
#[derive(Debug, Default)]
pub struct PeerTable {
    inner: DashMap<SocketAddr, Arc<Connection>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, conn: Arc<Connection>) {
        self.inner.insert(conn.peer_addr(), conn);
    }

    /// Remove `addr` only if it still belongs to connection `id`.
    pub fn remove(&self, addr: &SocketAddr, id: ConnectionId) -> bool {
        self.inner.remove_if(addr, |_, conn| conn.id() == id).is_some()
    }

    /// Remove and return every tracked connection.
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        let conns: Vec<Arc<Connection>> = self.inner.iter().map(|e| e.value().clone()).collect();
        for conn in &conns {
            self.inner.remove_if(&conn.peer_addr(), |_, c| c.id() == conn.id());
        }
        conns
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
