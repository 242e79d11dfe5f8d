//! Connection identity and lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Register every accepted connection until it closes
//! - Deliver close requests to individual connections
//! - Let shutdown wait for all connections to finish
//!
//! # Design Decisions
//! - The registry is a DashMap: accept, close and shutdown touch it from
//!   different threads without a global lock
//! - A connection leaves the registry when its guard drops, so a panicking
//!   connection task cannot leak an entry

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;

use crate::observability::metrics;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Handle that asks one connection to close.
///
/// Closing is level-triggered: a task that subscribes after `close()` still
/// observes the request.
#[derive(Debug, Clone)]
pub struct ConnectionCloser(Arc<watch::Sender<bool>>);

impl ConnectionCloser {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self(Arc::new(tx))
    }

    /// Request the connection to close.
    pub fn close(&self) {
        self.0.send_replace(true);
    }

    /// Whether a close was requested.
    pub fn is_closing(&self) -> bool {
        *self.0.borrow()
    }

    /// Receiver that resolves once a close is requested.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.0.subscribe()
    }
}

#[derive(Debug)]
struct ConnectionEntry {
    peer: SocketAddr,
    closer: ConnectionCloser,
}

/// Tracks live connections for shutdown.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionEntry>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new connection. The entry lives as long as the returned guard.
    pub fn register(self: &Arc<Self>, peer: SocketAddr) -> ConnectionGuard {
        let id = ConnectionId::new();
        let closer = ConnectionCloser::new();
        self.connections.insert(
            id,
            ConnectionEntry {
                peer,
                closer: closer.clone(),
            },
        );
        metrics::connection_opened();
        tracing::trace!(connection_id = %id, peer_addr = %peer, "Connection registered");

        ConnectionGuard {
            registry: Arc::clone(self),
            id,
            closer,
        }
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connection is live.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Ask every live connection to close. Returns how many were signalled.
    pub fn close_all(&self) -> usize {
        let mut signalled = 0;
        for entry in self.connections.iter() {
            tracing::trace!(
                connection_id = %entry.key(),
                peer_addr = %entry.value().peer,
                "Closing connection"
            );
            entry.value().closer.close();
            signalled += 1;
        }
        signalled
    }

    /// Wait until all connections are closed.
    pub async fn wait_for_close(&self) {
        while !self.connections.is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// Guard that tracks a connection's lifetime.
/// Removes the registry entry when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
    closer: ConnectionCloser,
}

impl ConnectionGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Close handle for this connection.
    pub fn closer(&self) -> &ConnectionCloser {
        &self.closer
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.connections.remove(&self.id);
        metrics::connection_closed();
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
        assert!(id1.to_string().starts_with("conn-"));
    }

    #[test]
    fn registry_counts_live_guards() {
        let registry = Arc::new(ConnectionRegistry::new());
        assert!(registry.is_empty());

        let guard1 = registry.register(peer());
        let guard2 = registry.register(peer());
        assert_eq!(registry.len(), 2);

        drop(guard1);
        assert_eq!(registry.len(), 1);

        drop(guard2);
        assert!(registry.is_empty());
    }

    #[test]
    fn close_all_reaches_late_subscribers() {
        let registry = Arc::new(ConnectionRegistry::new());
        let guard = registry.register(peer());

        assert_eq!(registry.close_all(), 1);
        let rx = guard.closer().subscribe();
        assert!(*rx.borrow());
        assert!(guard.closer().is_closing());
    }

    #[tokio::test]
    async fn wait_for_close_returns_when_empty() {
        let registry = Arc::new(ConnectionRegistry::new());
        let guard = registry.register(peer());

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.wait_for_close().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }
}
