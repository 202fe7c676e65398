//! Application handler contract and the authorization context.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tether_core::{ConnectionId, HandlerError};

use crate::connection::Connection;
use crate::hub::Hub;

/// What the application sees of an upgrade request when authorizing it.
///
/// The query parameters become the connection's metadata once it is
/// registered. Header names are stored lowercase.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpgradeRequest {
    /// Request path.
    pub path: String,
    /// Decoded query parameters.
    pub query: HashMap<String, String>,
    /// Request headers with lowercase names.
    pub headers: HashMap<String, String>,
}

impl UpgradeRequest {
    /// Request for `path` with no query or headers.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Add a query parameter.
    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.query.insert(key.into(), value.into());
        self
    }

    /// Add a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self
            .headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    /// Query parameter by name.
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    /// Header by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Application logic plugged into the connection lifecycle.
///
/// Every call is isolated by the dispatcher: an `Err` is logged, a panic is
/// caught, and neither reaches the connection loop or the reaper.
///
/// Ordering per connection: `on_connected` completes before the first
/// `on_received`; `on_received` calls are sequential; `on_disconnected` is
/// called at most once and only after `on_connected` was attempted.
#[async_trait]
pub trait SocketHandler: Send + Sync + 'static {
    /// Decide whether an upgrade request may become a connection.
    async fn authorize(&self, request: &UpgradeRequest) -> bool;

    /// A connection was registered.
    async fn on_connected(
        &self,
        hub: &Hub,
        id: &ConnectionId,
        connection: &Arc<Connection>,
    ) -> Result<(), HandlerError>;

    /// A text message arrived on a connection.
    async fn on_received(
        &self,
        hub: &Hub,
        id: &ConnectionId,
        connection: &Arc<Connection>,
        message: String,
    ) -> Result<(), HandlerError>;

    /// A connection is being torn down.
    ///
    /// The default removes it from the registry. Overrides do not have to:
    /// the dispatcher removes the connection afterwards either way.
    async fn on_disconnected(
        &self,
        hub: &Hub,
        id: &ConnectionId,
        _connection: &Arc<Connection>,
    ) -> Result<(), HandlerError> {
        let _ = hub.registry().remove(std::slice::from_ref(id)).await;
        Ok(())
    }
}
