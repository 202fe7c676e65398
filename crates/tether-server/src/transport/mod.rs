//! Transport boundary.
//!
//! The wire protocol (handshake, framing, ping/pong) lives below this
//! module. A transport is consumed as two halves:
//!
//! - [`OutboundTransport`]: shared by the registry, handlers, broadcast and
//!   the reaper. Implementations serialize concurrent sends internally.
//! - [`InboundTransport`]: owned by exactly one connection loop. `receive`
//!   takes `&mut self`, so there is never more than one outstanding read.
//!
//! Closing the outbound half must unblock a pending `receive` on the
//! inbound half; hard shutdown relies on it.

pub mod memory;
pub mod ws;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use tether_core::TransportError;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Close status sent when a connection is torn down.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseReason {
    /// WebSocket close code (RFC 6455 §7.4).
    pub code: u16,
    /// Human-readable description.
    pub reason: String,
}

impl CloseReason {
    /// Create a close reason.
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// 1000: normal closure, used for every registry removal.
    pub fn normal() -> Self {
        Self::new(1000, "Closed by the connection manager")
    }

    /// 1001: the server is going away.
    pub fn going_away() -> Self {
        Self::new(1001, "Server shutting down")
    }

    /// 1008: the request was not authorized.
    pub fn policy_violation() -> Self {
        Self::new(1008, "Unauthorized")
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code, self.reason)
    }
}

/// Observable state of a transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportState {
    /// Handshake still in progress.
    Connecting,
    /// Open for sends and receives.
    Open,
    /// A close frame was received or sent; the handshake is not finished.
    Closing,
    /// Closed cleanly or force-closed locally.
    Closed,
    /// The underlying connection died without a close handshake.
    Aborted,
}

impl TransportState {
    /// Stable lowercase name, used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Aborted => "aborted",
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Self::Connecting => 0,
            Self::Open => 1,
            Self::Closing => 2,
            Self::Closed => 3,
            Self::Aborted => 4,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            3 => Self::Closed,
            _ => Self::Aborted,
        }
    }
}

/// A frame read from the inbound half.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Incoming {
    /// UTF-8 text message.
    Text(String),
    /// Binary message.
    Binary(Vec<u8>),
    /// The peer sent a close frame.
    Close(Option<CloseReason>),
}

/// Send side of a transport. Shared across tasks.
#[async_trait]
pub trait OutboundTransport: Send + Sync + 'static {
    /// Send a text message.
    async fn send_text(&self, text: &str) -> Result<(), TransportError>;

    /// Query the current state.
    ///
    /// An error means the state could not be determined; callers treat it
    /// the same as a non-open state.
    fn state(&self) -> Result<TransportState, TransportError>;

    /// Close the transport with a close status. Idempotent.
    async fn close(&self, reason: CloseReason) -> Result<(), TransportError>;
}

/// Receive side of a transport. Owned by a single connection loop.
#[async_trait]
pub trait InboundTransport: Send + 'static {
    /// Wait for the next frame.
    async fn receive(&mut self) -> Result<Incoming, TransportError>;
}

/// An accepted transport, as handed over by the acceptor.
pub struct TransportHandle {
    /// Shared send half; stored on the registered connection.
    pub outbound: Arc<dyn OutboundTransport>,
    /// Exclusive receive half; consumed by the connection loop.
    pub inbound: Box<dyn InboundTransport>,
}

impl TransportHandle {
    /// Bundle two halves into a handle.
    pub fn new(outbound: Arc<dyn OutboundTransport>, inbound: Box<dyn InboundTransport>) -> Self {
        Self { outbound, inbound }
    }
}

impl fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandle")
            .field("state", &self.outbound.state())
            .finish_non_exhaustive()
    }
}

/// State word plus a "closed" signal shared by the two halves of a transport.
///
/// Cancelling the token is what wakes a pending `receive` when the
/// outbound half is closed.
pub(crate) struct Lifecycle {
    state: AtomicU8,
    closed: CancellationToken,
}

impl Lifecycle {
    pub(crate) fn new(initial: TransportState) -> Self {
        Self {
            state: AtomicU8::new(initial.to_u8()),
            closed: CancellationToken::new(),
        }
    }

    pub(crate) fn get(&self) -> TransportState {
        TransportState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: TransportState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }

    /// Move to `Closed`, wake the reader, and return the previous state.
    pub(crate) fn begin_close(&self) -> TransportState {
        let previous = self
            .state
            .swap(TransportState::Closed.to_u8(), Ordering::AcqRel);
        self.closed.cancel();
        TransportState::from_u8(previous)
    }

    /// `Open` → `Closing` after the peer's close frame.
    pub(crate) fn mark_closing(&self) {
        let _ = self.state.compare_exchange(
            TransportState::Open.to_u8(),
            TransportState::Closing.to_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Record an unclean death unless the transport was already closed.
    pub(crate) fn mark_aborted(&self) {
        let closed = TransportState::Closed.to_u8();
        let aborted = TransportState::Aborted.to_u8();
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != closed).then_some(aborted)
            });
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }
}
