//! Concurrent registry of live connections.
//!
//! The registry is the only state shared by every connection loop, the
//! hub, and the reaper. It is a sharded [`DashMap`], so callers never take an
//! external lock. Iteration always works on a snapshot of `Arc`s, which keeps
//! shard locks from being held across an `.await`.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tether_core::ConnectionId;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::metrics::WS_CONNECTIONS_ACTIVE;
use crate::transport::{CloseReason, OutboundTransport};

/// Id → connection map.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and publish a connection for `outbound`.
    ///
    /// The entity is fully built before it is inserted. A fresh id is drawn
    /// again in the (practically impossible) event of a collision.
    pub fn register(
        &self,
        outbound: Arc<dyn OutboundTransport>,
        metadata: HashMap<String, String>,
    ) -> Arc<Connection> {
        loop {
            match self.connections.entry(ConnectionId::new()) {
                Entry::Occupied(entry) => {
                    warn!(connection_id = %entry.key(), "connection id collision, regenerating");
                }
                Entry::Vacant(entry) => {
                    let connection =
                        Arc::new(Connection::new(entry.key().clone(), outbound, metadata));
                    let _ = entry.insert(connection.clone());
                    self.record_active();
                    debug!(connection_id = %connection.id(), "connection registered");
                    return connection;
                }
            }
        }
    }

    /// Look up a connection by id.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|entry| entry.value().clone())
    }

    /// Reverse lookup: the id registered for this transport, if any.
    pub fn id_of(&self, outbound: &Arc<dyn OutboundTransport>) -> Option<ConnectionId> {
        let target = Arc::as_ptr(outbound);
        self.connections
            .iter()
            .find(|entry| std::ptr::addr_eq(Arc::as_ptr(entry.value().outbound()), target))
            .map(|entry| entry.key().clone())
    }

    /// Lazily filter a snapshot of the registry.
    ///
    /// Connections registered or removed after the call may or may not be
    /// seen.
    pub fn find<'a, P>(&self, predicate: P) -> impl Iterator<Item = Arc<Connection>> + 'a
    where
        P: Fn(&Connection) -> bool + 'a,
    {
        self.snapshot()
            .into_iter()
            .filter(move |connection| predicate(connection.as_ref()))
    }

    /// Snapshot of every registered connection.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Snapshot of every registered id.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Number of registered connections.
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// Metadata snapshot for `id`.
    pub fn metadata(&self, id: &ConnectionId) -> Option<HashMap<String, String>> {
        self.get(id).map(|connection| connection.metadata())
    }

    /// Add a metadata entry to `id`. See [`Connection::add_value`].
    pub fn add_value(
        &self,
        id: &ConnectionId,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> bool {
        self.get(id)
            .is_some_and(|connection| connection.add_value(key, value))
    }

    /// Remove connections and close their transports with a normal closure.
    ///
    /// Unknown ids are skipped and close failures are swallowed. Returns how
    /// many connections this call actually removed.
    pub async fn remove(&self, ids: &[ConnectionId]) -> usize {
        let mut removed = 0;
        for id in ids {
            let Some((_, connection)) = self.connections.remove(id) else {
                continue;
            };
            removed += 1;
            connection.close(CloseReason::normal()).await;
            debug!(connection_id = %id, "connection removed");
        }
        if removed > 0 {
            self.record_active();
        }
        removed
    }

    /// Remove every connection and close its transport with `reason`.
    pub async fn close_all(&self, reason: CloseReason) -> usize {
        let mut closed = 0;
        for id in self.ids() {
            if let Some((_, connection)) = self.connections.remove(&id) {
                closed += 1;
                connection.close(reason.clone()).await;
            }
        }
        self.record_active();
        closed
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_active(&self) {
        metrics::gauge!(WS_CONNECTIONS_ACTIVE).set(self.connections.len() as f64);
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("count", &self.count())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{TransportState, memory};
    use std::collections::HashSet;

    fn meta(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn register(registry: &ConnectionRegistry) -> (Arc<Connection>, memory::MemoryPeer) {
        let (handle, peer) = memory::pair(8);
        (registry.register(handle.outbound, HashMap::new()), peer)
    }

    #[test]
    fn register_and_get() {
        let registry = ConnectionRegistry::new();
        let (handle, _peer) = memory::pair(8);
        let conn = registry.register(handle.outbound, meta(&[("room", "1"), ("user", "ada")]));

        let found = registry.get(conn.id()).unwrap();
        assert_eq!(found.metadata(), meta(&[("room", "1"), ("user", "ada")]));
        assert_eq!(registry.count(), 1);
        assert!(registry.contains(conn.id()));
    }

    #[test]
    fn get_unknown_is_none() {
        let registry = ConnectionRegistry::new();
        assert!(registry.get(&ConnectionId::new()).is_none());
        assert!(registry.metadata(&ConnectionId::new()).is_none());
        assert!(!registry.add_value(&ConnectionId::new(), "k", "v"));
    }

    #[test]
    fn reverse_lookup_by_transport() {
        let registry = ConnectionRegistry::new();
        let (handle, _peer) = memory::pair(8);
        let outbound = handle.outbound.clone();
        let conn = registry.register(handle.outbound, HashMap::new());
        let (_other, _other_peer) = register(&registry);

        assert_eq!(registry.id_of(&outbound), Some(conn.id().clone()));

        let (stranger, _p) = memory::pair(8);
        assert_eq!(registry.id_of(&stranger.outbound), None);
    }

    #[test]
    fn find_filters_by_metadata() {
        let registry = ConnectionRegistry::new();
        for room in ["1", "1", "2"] {
            let (handle, _peer) = memory::pair(8);
            let _ = registry.register(handle.outbound, meta(&[("room", room)]));
        }
        let in_room_one = registry
            .find(|c| c.value("room").as_deref() == Some("1"))
            .count();
        assert_eq!(in_room_one, 2);
        assert_eq!(registry.find(|_| false).count(), 0);
    }

    #[test]
    fn add_value_through_registry() {
        let registry = ConnectionRegistry::new();
        let (conn, _peer) = register(&registry);
        assert!(registry.add_value(conn.id(), "user", "ada"));
        assert!(!registry.add_value(conn.id(), "user", "bob"));
        assert_eq!(
            registry.metadata(conn.id()).unwrap().get("user").map(String::as_str),
            Some("ada")
        );
    }

    #[tokio::test]
    async fn remove_closes_transport() {
        let registry = ConnectionRegistry::new();
        let (conn, peer) = register(&registry);

        assert_eq!(registry.remove(&[conn.id().clone()]).await, 1);
        assert!(registry.get(conn.id()).is_none());
        assert!(registry.is_empty());
        assert_eq!(peer.state(), TransportState::Closed);
        assert_eq!(peer.close_reason(), Some(CloseReason::normal()));
    }

    #[tokio::test]
    async fn remove_twice_is_noop() {
        let registry = ConnectionRegistry::new();
        let (conn, _peer) = register(&registry);
        let id = conn.id().clone();

        assert_eq!(registry.remove(std::slice::from_ref(&id)).await, 1);
        assert_eq!(registry.remove(std::slice::from_ref(&id)).await, 0);
        assert_eq!(registry.remove(&[ConnectionId::new()]).await, 0);
    }

    #[tokio::test]
    async fn remove_many_skips_unknown() {
        let registry = ConnectionRegistry::new();
        let (a, _pa) = register(&registry);
        let (b, _pb) = register(&registry);
        let (c, _pc) = register(&registry);

        let removed = registry
            .remove(&[a.id().clone(), ConnectionId::new(), b.id().clone()])
            .await;
        assert_eq!(removed, 2);
        assert_eq!(registry.ids(), vec![c.id().clone()]);
    }

    #[tokio::test]
    async fn close_all_drains_registry() {
        let registry = ConnectionRegistry::new();
        let (_a, pa) = register(&registry);
        let (_b, pb) = register(&registry);

        assert_eq!(registry.close_all(CloseReason::going_away()).await, 2);
        assert!(registry.is_empty());
        assert_eq!(pa.close_reason(), Some(CloseReason::going_away()));
        assert_eq!(pb.close_reason(), Some(CloseReason::going_away()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_registrations_get_distinct_ids() {
        const N: usize = 200;
        let registry = Arc::new(ConnectionRegistry::new());

        let mut tasks = Vec::with_capacity(N);
        for _ in 0..N {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let (handle, peer) = memory::pair(1);
                let conn = registry.register(handle.outbound, HashMap::new());
                (conn.id().clone(), peer)
            }));
        }

        let mut ids = HashSet::new();
        let mut peers = Vec::new();
        for task in tasks {
            let (id, peer) = task.await.unwrap();
            assert!(ids.insert(id));
            peers.push(peer);
        }
        assert_eq!(registry.count(), N);
        assert_eq!(ids.len(), N);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_removals_of_same_id_remove_once() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (conn, _peer) = register(&registry);
        let id = conn.id().clone();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let id = id.clone();
            tasks.push(tokio::spawn(async move { registry.remove(&[id]).await }));
        }
        let mut total = 0;
        for task in tasks {
            total += task.await.unwrap();
        }
        assert_eq!(total, 1);
        assert!(registry.is_empty());
    }
}
