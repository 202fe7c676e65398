//! A registered connection: identity, send half, handshake metadata and
//! one slot of application state.

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tether_core::{ConnectionId, StateError, TransportError};
use tracing::debug;

use crate::transport::{CloseReason, OutboundTransport, TransportState};

/// A live connection as stored in the registry.
///
/// Entities are built fully populated before they are published, so a
/// concurrent reader never sees a half-constructed one.
pub struct Connection {
    id: ConnectionId,
    outbound: Arc<dyn OutboundTransport>,
    metadata: RwLock<HashMap<String, String>>,
    state: OnceLock<Arc<dyn Any + Send + Sync>>,
    connected_at: DateTime<Utc>,
    disconnected: AtomicBool,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        outbound: Arc<dyn OutboundTransport>,
        metadata: HashMap<String, String>,
    ) -> Self {
        Self {
            id,
            outbound,
            metadata: RwLock::new(metadata),
            state: OnceLock::new(),
            connected_at: Utc::now(),
            disconnected: AtomicBool::new(false),
        }
    }

    /// Connection identifier.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Shared send half of the transport.
    pub fn outbound(&self) -> &Arc<dyn OutboundTransport> {
        &self.outbound
    }

    /// When the connection was registered.
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Current transport state. A failed query is reported as an error.
    pub fn transport_state(&self) -> Result<TransportState, TransportError> {
        self.outbound.state()
    }

    /// Whether the transport reports `Open`. Query failures count as closed.
    pub fn is_open(&self) -> bool {
        matches!(self.outbound.state(), Ok(TransportState::Open))
    }

    /// Send a text message.
    ///
    /// Returns `true` only if the transport was open and the send succeeded.
    pub async fn send(&self, text: &str) -> bool {
        if !self.is_open() {
            return false;
        }
        match self.outbound.send_text(text).await {
            Ok(()) => true,
            Err(err) => {
                debug!(connection_id = %self.id, error = %err, "send failed");
                false
            }
        }
    }

    /// Best-effort close; errors are logged and dropped.
    pub(crate) async fn close(&self, reason: CloseReason) {
        if let Err(err) = self.outbound.close(reason).await {
            debug!(connection_id = %self.id, error = %err, "close failed");
        }
    }

    // ── Metadata ────────────────────────────────────────────────────

    /// Look up a metadata value captured at handshake time.
    pub fn value(&self, key: &str) -> Option<String> {
        self.metadata.read().get(key).cloned()
    }

    /// Snapshot of all metadata.
    pub fn metadata(&self) -> HashMap<String, String> {
        self.metadata.read().clone()
    }

    /// Add a metadata entry.
    ///
    /// Empty keys or values are ignored and existing keys are never
    /// overwritten. Returns whether the entry was added.
    pub fn add_value(&self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let key = key.into();
        let value = value.into();
        if key.is_empty() || value.is_empty() {
            return false;
        }
        let mut metadata = self.metadata.write();
        if metadata.contains_key(&key) {
            return false;
        }
        let _ = metadata.insert(key, value);
        true
    }

    // ── Application state ───────────────────────────────────────────

    /// Attach application state. Can only be done once.
    pub fn set_state<T: Any + Send + Sync>(&self, value: T) -> Result<(), StateError> {
        self.state
            .set(Arc::new(value))
            .map_err(|_| StateError::AlreadySet)
    }

    /// Read the attached application state as `T`.
    pub fn state<T: Any + Send + Sync>(&self) -> Result<Arc<T>, StateError> {
        let stored = self.state.get().ok_or(StateError::Unset)?;
        Arc::clone(stored)
            .downcast::<T>()
            .map_err(|_| StateError::TypeMismatch {
                expected: type_name::<T>(),
            })
    }

    /// Whether application state has been attached.
    pub fn has_state(&self) -> bool {
        self.state.get().is_some()
    }

    // ── Teardown latch ──────────────────────────────────────────────

    /// Claim the teardown. Only the first caller gets `true`.
    pub(crate) fn begin_disconnect(&self) -> bool {
        self.disconnected
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether teardown has started.
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("connected_at", &self.connected_at)
            .field("metadata", &*self.metadata.read())
            .field("has_state", &self.has_state())
            .field("disconnected", &self.is_disconnected())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory;

    fn make_connection(metadata: &[(&str, &str)]) -> (Connection, memory::MemoryPeer) {
        let (handle, peer) = memory::pair(8);
        let metadata = metadata
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        let conn = Connection::new(ConnectionId::new(), handle.outbound, metadata);
        (conn, peer)
    }

    #[derive(Debug, PartialEq)]
    struct Player {
        name: String,
    }

    #[test]
    fn value_lookup() {
        let (conn, _peer) = make_connection(&[("room", "1")]);
        assert_eq!(conn.value("room").as_deref(), Some("1"));
        assert_eq!(conn.value("missing"), None);
    }

    #[test]
    fn add_value_does_not_overwrite() {
        let (conn, _peer) = make_connection(&[("room", "1")]);
        assert!(!conn.add_value("room", "2"));
        assert_eq!(conn.value("room").as_deref(), Some("1"));
        assert!(conn.add_value("user", "ada"));
        assert_eq!(conn.value("user").as_deref(), Some("ada"));
    }

    #[test]
    fn add_value_ignores_empty() {
        let (conn, _peer) = make_connection(&[]);
        assert!(!conn.add_value("", "x"));
        assert!(!conn.add_value("k", ""));
        assert!(conn.metadata().is_empty());
    }

    #[test]
    fn state_unset() {
        let (conn, _peer) = make_connection(&[]);
        assert_eq!(conn.state::<Player>().unwrap_err(), StateError::Unset);
        assert!(!conn.has_state());
    }

    #[test]
    fn state_roundtrip() {
        let (conn, _peer) = make_connection(&[]);
        conn.set_state(Player { name: "ada".into() }).unwrap();
        let player = conn.state::<Player>().unwrap();
        assert_eq!(player.name, "ada");
    }

    #[test]
    fn state_is_set_once() {
        let (conn, _peer) = make_connection(&[]);
        conn.set_state(1_u32).unwrap();
        assert_eq!(conn.set_state(2_u32).unwrap_err(), StateError::AlreadySet);
        assert_eq!(*conn.state::<u32>().unwrap(), 1);
    }

    #[test]
    fn state_type_mismatch_is_an_error() {
        let (conn, _peer) = make_connection(&[]);
        conn.set_state(Player { name: "ada".into() }).unwrap();
        let err = conn.state::<String>().unwrap_err();
        assert!(matches!(err, StateError::TypeMismatch { expected } if expected.contains("String")));
    }

    #[tokio::test]
    async fn send_while_open() {
        let (conn, peer) = make_connection(&[]);
        assert!(conn.send("hi").await);
        assert_eq!(peer.messages(), vec!["hi"]);
    }

    #[tokio::test]
    async fn send_after_close_returns_false() {
        let (conn, peer) = make_connection(&[]);
        conn.close(CloseReason::normal()).await;
        assert!(!conn.send("hi").await);
        assert_eq!(peer.send_attempts(), 0);
    }

    #[tokio::test]
    async fn send_failure_returns_false() {
        let (conn, peer) = make_connection(&[]);
        peer.fail_sends(true);
        assert!(!conn.send("hi").await);
    }

    #[test]
    fn state_query_failure_is_not_open() {
        let (conn, peer) = make_connection(&[]);
        peer.fail_state_queries(true);
        assert!(!conn.is_open());
        assert!(conn.transport_state().is_err());
    }

    #[test]
    fn disconnect_latch_fires_once() {
        let (conn, _peer) = make_connection(&[]);
        assert!(!conn.is_disconnected());
        assert!(conn.begin_disconnect());
        assert!(!conn.begin_disconnect());
        assert!(conn.is_disconnected());
    }
}
