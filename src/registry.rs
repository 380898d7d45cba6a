//! Registry of live connections.
//!
//! Every connection whose loop has started and not yet exited holds a slot.
//! Insert, remove and size queries all go through the same mutex, and the
//! current size is mirrored into a watch channel so shutdown can wait for the
//! registry to empty without polling the lock.

use chrono::{DateTime, Utc};
use slab::Slab;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::trace;

/// Diagnostic record kept for each live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Registry slot, unique among live connections.
    pub id: usize,
    /// Remote address of the client.
    pub peer: SocketAddr,
    /// When the connection was accepted.
    pub accepted_at: DateTime<Utc>,
}

/// Mutex-guarded set of live connections.
///
/// Provides O(1) insert and remove.
#[derive(Debug)]
pub struct Registry {
    connections: Mutex<Slab<ConnectionInfo>>,
    count: watch::Sender<usize>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            connections: Mutex::new(Slab::new()),
            count,
        }
    }

    /// Record a new live connection.
    ///
    /// The returned guard removes the entry when dropped, so a connection is
    /// deregistered on every exit path of its task, panics included.
    pub fn register(self: &Arc<Self>, peer: SocketAddr) -> RegistryGuard {
        let mut connections = self.lock();
        let entry = connections.vacant_entry();
        let id = entry.key();
        entry.insert(ConnectionInfo {
            id,
            peer,
            accepted_at: Utc::now(),
        });
        self.count.send_replace(connections.len());
        trace!(conn_id = id, live = connections.len(), "registered");

        RegistryGuard {
            registry: Arc::clone(self),
            id,
        }
    }

    fn deregister(&self, id: usize) {
        let mut connections = self.lock();
        if connections.try_remove(id).is_some() {
            self.count.send_replace(connections.len());
            trace!(conn_id = id, live = connections.len(), "deregistered");
        }
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if no connections are live.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of every live connection's record.
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        self.lock().iter().map(|(_, info)| info.clone()).collect()
    }

    /// Subscribe to changes of the live connection count.
    pub fn watch(&self) -> watch::Receiver<usize> {
        self.count.subscribe()
    }

    // Registry contents stay consistent even if a holder panicked, so a
    // poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, Slab<ConnectionInfo>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Live registration of one connection. Dropping it deregisters.
#[derive(Debug)]
pub struct RegistryGuard {
    registry: Arc<Registry>,
    id: usize,
}

impl RegistryGuard {
    /// This connection's registry slot.
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
    }
}
