//! Per-connection loop: authorize, register, receive and dispatch, tear down.
//!
//! ```text
//! Connecting → Authorizing → Open → Closing → Closed
//!                  │
//!                  └─ denied → Closed (never registered)
//! ```
//!
//! The loop owns the inbound half of the transport, so there is exactly one
//! outstanding read per connection and messages on one connection are
//! dispatched strictly in order. Every way out of `Open` (close frame, peer
//! gone, read error, transport closed by someone else) goes through
//! [`Dispatcher::disconnect`].

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{Span, debug, instrument};

use crate::connection::Connection;
use crate::dispatcher::{DisconnectReason, Dispatcher};
use crate::handler::UpgradeRequest;
use crate::metrics::{WS_CONNECTIONS_TOTAL, WS_MESSAGES_RECEIVED_TOTAL, WS_REJECTIONS_TOTAL};
use crate::transport::{CloseReason, InboundTransport, Incoming, TransportHandle};

/// Phase of a connection loop, as reported in logs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    /// Transport accepted, nothing decided yet.
    Connecting,
    /// Waiting on the handler's authorization decision.
    Authorizing,
    /// Registered and receiving.
    Open,
    /// Running the disconnect path.
    Closing,
    /// Done; the transport is no longer touched.
    Closed,
}

impl LoopState {
    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Authorizing => "authorizing",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

/// How a served connection ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Authorization was denied; nothing was registered.
    Rejected,
    /// The connection was registered and has now been torn down.
    Closed(DisconnectReason),
}

/// Authorize and run a connection on an already accepted transport.
///
/// A denied request gets its transport closed with a policy-violation
/// status.
pub async fn serve(
    dispatcher: Arc<Dispatcher>,
    request: UpgradeRequest,
    transport: TransportHandle,
) -> SessionOutcome {
    enter(LoopState::Connecting);
    enter(LoopState::Authorizing);
    if !dispatcher.authorize(&request).await {
        metrics::counter!(WS_REJECTIONS_TOTAL).increment(1);
        debug!(path = %request.path, "upgrade request denied");
        if let Err(err) = transport
            .outbound
            .close(CloseReason::policy_violation())
            .await
        {
            debug!(error = %err, "closing rejected transport failed");
        }
        enter(LoopState::Closed);
        return SessionOutcome::Rejected;
    }
    SessionOutcome::Closed(run_authorized(dispatcher, request.query, transport).await)
}

/// Run a connection whose request was already authorized.
///
/// Registers the connection with `metadata`, runs `on_connected`, then
/// receives until the transport ends and disconnects.
#[instrument(skip_all, fields(connection_id = tracing::field::Empty))]
pub async fn run_authorized(
    dispatcher: Arc<Dispatcher>,
    metadata: HashMap<String, String>,
    transport: TransportHandle,
) -> DisconnectReason {
    let TransportHandle {
        outbound,
        mut inbound,
    } = transport;

    let connection = dispatcher.hub().registry().register(outbound, metadata);
    let _ = Span::current().record("connection_id", connection.id().as_str());
    metrics::counter!(WS_CONNECTIONS_TOTAL).increment(1);
    enter(LoopState::Open);

    dispatcher.connected(&connection).await;
    let reason = if dispatcher.is_shutting_down() {
        DisconnectReason::Shutdown
    } else {
        receive(&dispatcher, &connection, inbound.as_mut()).await
    };

    enter(LoopState::Closing);
    let _ = dispatcher.disconnect(&connection, reason).await;
    enter(LoopState::Closed);
    reason
}

async fn receive(
    dispatcher: &Dispatcher,
    connection: &Arc<Connection>,
    inbound: &mut dyn InboundTransport,
) -> DisconnectReason {
    loop {
        let text = match inbound.receive().await {
            Ok(Incoming::Text(text)) => text,
            Ok(Incoming::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(err) => {
                    debug!(len = err.as_bytes().len(), "skipping non-UTF-8 binary frame");
                    continue;
                }
            },
            Ok(Incoming::Close(frame)) => {
                debug!(close = ?frame, "peer sent close frame");
                return DisconnectReason::CloseFrame;
            }
            Err(err) if err.is_premature_close() => {
                debug!("peer went away without closing");
                return DisconnectReason::PrematureClose;
            }
            Err(err) => {
                debug!(error = %err, "receive failed");
                return DisconnectReason::ReceiveError;
            }
        };
        metrics::counter!(WS_MESSAGES_RECEIVED_TOTAL).increment(1);
        dispatcher.received(connection, text).await;
    }
}

fn enter(state: LoopState) {
    debug!(state = state.as_str(), "connection loop state");
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
