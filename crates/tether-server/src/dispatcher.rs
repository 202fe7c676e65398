//! Isolated invocation of the application handler and the single teardown
//! path shared by connection loops, the reaper and shutdown.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use tether_core::HandlerError;
use tether_settings::TetherSettings;
use tracing::{debug, error, info, warn};

use crate::connection::Connection;
use crate::handler::{SocketHandler, UpgradeRequest};
use crate::hub::Hub;
use crate::metrics::{WS_DISCONNECTIONS_TOTAL, WS_HANDLER_FAILURES_TOTAL};
use crate::transport::CloseReason;

/// Why a connection was torn down.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// The peer sent a close frame.
    CloseFrame,
    /// The peer went away without a close handshake.
    PrematureClose,
    /// Any other read failure.
    ReceiveError,
    /// The reaper found the transport no longer open.
    Reaped,
    /// The server is shutting down.
    Shutdown,
}

impl DisconnectReason {
    /// Stable label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CloseFrame => "close_frame",
            Self::PrematureClose => "premature_close",
            Self::ReceiveError => "receive_error",
            Self::Reaped => "reaped",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The application handler bound to its [`Hub`].
pub struct Dispatcher {
    hub: Arc<Hub>,
    handler: Arc<dyn SocketHandler>,
    shutting_down: AtomicBool,
}

impl Dispatcher {
    /// Build the hub from `settings`, then the handler from the hub.
    ///
    /// The factory receives the hub so handlers can keep a reference for
    /// work that happens outside handler calls.
    pub fn new<H, F>(settings: TetherSettings, factory: F) -> Arc<Self>
    where
        H: SocketHandler,
        F: FnOnce(&Arc<Hub>) -> H,
    {
        let hub = Arc::new(Hub::new(Arc::new(settings)));
        let handler = Arc::new(factory(&hub));
        Arc::new(Self {
            hub,
            handler,
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Shared context.
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Ask the handler whether `request` may connect.
    ///
    /// A handler that fails or panics denies the request.
    pub async fn authorize(&self, request: &UpgradeRequest) -> bool {
        let verdict = isolate("authorize", "", async {
            Ok::<_, HandlerError>(self.handler.authorize(request).await)
        })
        .await;
        verdict.unwrap_or(false)
    }

    /// Run `on_connected` for a freshly registered connection.
    pub async fn connected(&self, connection: &Arc<Connection>) {
        let id = connection.id();
        info!(connection_id = %id, "connection opened");
        let _ = isolate(
            "on_connected",
            id.as_str(),
            self.handler.on_connected(&self.hub, id, connection),
        )
        .await;
    }

    /// Run `on_received` for one message.
    pub async fn received(&self, connection: &Arc<Connection>, message: String) {
        debug!(connection_id = %connection.id(), len = message.len(), "dispatching message");
        let _ = isolate(
            "on_received",
            connection.id().as_str(),
            self.handler
                .on_received(&self.hub, connection.id(), connection, message),
        )
        .await;
    }

    /// Tear a connection down.
    ///
    /// The first call for a connection runs `on_disconnected` and then makes
    /// sure the connection is gone from the registry. Every later call is a
    /// no-op and returns `false`.
    pub async fn disconnect(&self, connection: &Arc<Connection>, reason: DisconnectReason) -> bool {
        if !connection.begin_disconnect() {
            debug!(connection_id = %connection.id(), %reason, "disconnect already handled");
            return false;
        }
        if reason == DisconnectReason::Shutdown {
            connection.close(CloseReason::going_away()).await;
        }

        let id = connection.id();
        let _ = isolate(
            "on_disconnected",
            id.as_str(),
            self.handler.on_disconnected(&self.hub, id, connection),
        )
        .await;
        let _ = self.hub.registry().remove(std::slice::from_ref(id)).await;

        metrics::counter!(WS_DISCONNECTIONS_TOTAL, "reason" => reason.as_str()).increment(1);
        info!(connection_id = %id, %reason, "connection closed");
        true
    }

    /// Whether [`Dispatcher::shutdown`] has started.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Disconnect every live connection, then force-close anything left.
    ///
    /// Closing the transports unblocks pending reads so every connection
    /// loop can finish. A connection registered after the snapshot sees
    /// [`Dispatcher::is_shutting_down`] and tears itself down. Returns the
    /// number of connections torn down.
    pub async fn shutdown(&self) -> usize {
        self.shutting_down.store(true, Ordering::SeqCst);
        let mut disconnected = 0;
        for connection in self.hub.registry().snapshot() {
            if self.disconnect(&connection, DisconnectReason::Shutdown).await {
                disconnected += 1;
            }
        }
        let stragglers = self
            .hub
            .registry()
            .close_all(CloseReason::going_away())
            .await;
        info!(disconnected, stragglers, "all connections closed");
        disconnected + stragglers
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("hub", &self.hub)
            .finish_non_exhaustive()
    }
}

/// Await a handler future, containing both errors and panics.
async fn isolate<T, F>(operation: &'static str, connection_id: &str, future: F) -> Option<T>
where
    F: Future<Output = Result<T, HandlerError>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(err)) => {
            metrics::counter!(WS_HANDLER_FAILURES_TOTAL, "operation" => operation).increment(1);
            warn!(operation, connection_id, error = %err, "handler returned an error");
            None
        }
        Err(panic) => {
            metrics::counter!(WS_HANDLER_FAILURES_TOTAL, "operation" => operation).increment(1);
            error!(
                operation,
                connection_id,
                panic = %panic_message(&panic),
                "handler panicked"
            );
            None
        }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
