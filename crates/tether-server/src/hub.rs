//! Shared context handed to every handler call.
//!
//! A [`Hub`] bundles the registry and the settings and implements the
//! outbound operations: targeted sends, broadcast and lookups. It is
//! constructed once per server and passed explicitly; nothing here is global.

use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tether_core::ConnectionId;
use tether_settings::TetherSettings;
use tracing::debug;

use crate::connection::Connection;
use crate::metrics::WS_SEND_FAILURES_TOTAL;
use crate::registry::ConnectionRegistry;

/// Outcome of a broadcast.
///
/// Broadcast is not atomic: when `failed > 0` some recipients got the
/// message and some did not.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    /// Open connections a send was attempted on.
    pub attempted: usize,
    /// Sends that succeeded.
    pub delivered: usize,
    /// Sends that failed.
    pub failed: usize,
}

/// Registry plus settings, with the send/broadcast/query operations.
pub struct Hub {
    registry: Arc<ConnectionRegistry>,
    settings: Arc<TetherSettings>,
}

impl Hub {
    /// Create a hub with an empty registry.
    pub fn new(settings: Arc<TetherSettings>) -> Self {
        Self {
            registry: Arc::new(ConnectionRegistry::new()),
            settings,
        }
    }

    /// The connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Settings fixed at startup.
    pub fn settings(&self) -> &TetherSettings {
        &self.settings
    }

    /// Send `text` to the connection with `id`.
    ///
    /// `false` if the id is unknown, the transport is not open, or the send
    /// failed.
    pub async fn send_message(&self, id: &ConnectionId, text: &str) -> bool {
        match self.registry.get(id) {
            Some(connection) => self.send_to_entity(&connection, text).await,
            None => {
                debug!(connection_id = %id, "send to unknown connection");
                false
            }
        }
    }

    /// Send `text` to a connection already in hand.
    pub async fn send_to_entity(&self, connection: &Connection, text: &str) -> bool {
        let sent = connection.send(text).await;
        if !sent {
            metrics::counter!(WS_SEND_FAILURES_TOTAL).increment(1);
        }
        sent
    }

    /// Send `text` to every open connection.
    pub async fn broadcast(&self, text: &str) -> BroadcastReport {
        self.broadcast_where(text, |_| true).await
    }

    /// Send `text` to every open connection matching `predicate`.
    ///
    /// Sends run concurrently; one failing recipient does not affect the
    /// others.
    pub async fn broadcast_where<P>(&self, text: &str, predicate: P) -> BroadcastReport
    where
        P: Fn(&Connection) -> bool,
    {
        let targets: Vec<_> = self
            .registry
            .find(|connection| connection.is_open() && predicate(connection))
            .collect();

        let results = join_all(
            targets
                .iter()
                .map(|connection| self.send_to_entity(connection, text)),
        )
        .await;

        let delivered = results.iter().filter(|sent| **sent).count();
        let report = BroadcastReport {
            attempted: results.len(),
            delivered,
            failed: results.len() - delivered,
        };
        debug!(
            attempted = report.attempted,
            delivered = report.delivered,
            failed = report.failed,
            "broadcast complete"
        );
        report
    }

    /// Whether `id` is registered and its transport is open.
    ///
    /// Lookup misses and state-query failures both read as `false`.
    pub fn is_connected(&self, id: &ConnectionId) -> bool {
        self.registry
            .get(id)
            .is_some_and(|connection| connection.is_open())
    }

    /// Look up a connection.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.registry.get(id)
    }

    /// Connections matching `predicate`, from a registry snapshot.
    pub fn find<P>(&self, predicate: P) -> Vec<Arc<Connection>>
    where
        P: Fn(&Connection) -> bool,
    {
        self.registry.find(predicate).collect()
    }

    /// Number of registered connections.
    pub fn count(&self) -> usize {
        self.registry.count()
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
