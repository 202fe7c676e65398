//! Error types for tether.
//!
//! - [`TransportError`]: failures reported by the underlying duplex transport.
//!   These never reach callers of the send/broadcast API; they are converted
//!   to booleans or lifecycle events at the server boundary.
//! - [`StateError`]: failures of the per-connection application-state slot.
//! - [`HandlerError`]: errors returned by application handler callbacks.

use thiserror::Error;

/// Failure reported by a transport handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The transport is no longer open.
    #[error("transport is closed")]
    Closed,

    /// The peer went away without completing the close handshake.
    #[error("connection closed prematurely")]
    ClosedPrematurely,

    /// The peer violated the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Lower-level I/O failure.
    #[error("transport I/O error: {0}")]
    Io(String),
}

impl TransportError {
    /// Whether this error means the peer disappeared mid-transfer.
    #[must_use]
    pub fn is_premature_close(&self) -> bool {
        matches!(self, Self::ClosedPrematurely)
    }
}

/// Failure to store or decode per-connection application state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    /// State can only be attached once per connection.
    #[error("connection state has already been set")]
    AlreadySet,

    /// No state has been attached yet.
    #[error("connection state has not been set")]
    Unset,

    /// The stored state is of a different type than requested.
    #[error("connection state is not a `{expected}`")]
    TypeMismatch {
        /// Name of the type the caller asked for.
        expected: &'static str,
    },
}

/// Error returned from an application handler callback.
///
/// Handler errors are logged by the dispatcher and never interrupt the
/// connection loop or the reaper.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Free-form failure message.
    #[error("{0}")]
    Message(String),

    /// Application-state access failed.
    #[error(transparent)]
    State(#[from] StateError),

    /// A transport operation failed inside the handler.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Payload (de)serialization failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Any other error.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    /// Create a handler error from a message.
    #[must_use]
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}
