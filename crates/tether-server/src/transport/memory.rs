//! In-memory channel transport.
//!
//! [`pair`] returns a server-side [`TransportHandle`] and a [`MemoryPeer`]
//! that plays the remote end: it injects frames, observes what the server
//! sent, and can simulate failures (failing sends, failing state queries,
//! or a silent death with no close frame).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tether_core::TransportError;
use tether_settings::ConnectionSettings;
use tokio::sync::mpsc;

use super::{
    CloseReason, InboundTransport, Incoming, Lifecycle, OutboundTransport, TransportHandle,
    TransportState,
};

type Frame = Result<Incoming, TransportError>;

struct Shared {
    lifecycle: Lifecycle,
    sent: Mutex<Vec<String>>,
    send_attempts: AtomicUsize,
    fail_sends: AtomicBool,
    fail_state: AtomicBool,
    close_reason: Mutex<Option<CloseReason>>,
}

/// Create a connected transport/peer pair.
///
/// `capacity` bounds the number of frames the peer can queue before the
/// server reads them.
pub fn pair(capacity: usize) -> (TransportHandle, MemoryPeer) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let shared = Arc::new(Shared {
        lifecycle: Lifecycle::new(TransportState::Open),
        sent: Mutex::new(Vec::new()),
        send_attempts: AtomicUsize::new(0),
        fail_sends: AtomicBool::new(false),
        fail_state: AtomicBool::new(false),
        close_reason: Mutex::new(None),
    });

    let handle = TransportHandle::new(
        Arc::new(MemoryOutbound {
            shared: shared.clone(),
        }),
        Box::new(MemoryInbound {
            rx,
            shared: shared.clone(),
        }),
    );
    (handle, MemoryPeer { tx, shared })
}

/// Create a pair whose channel holds `settings.buffer_size` frames.
pub fn pair_with(settings: &ConnectionSettings) -> (TransportHandle, MemoryPeer) {
    pair(settings.buffer_size)
}

/// Send half of the in-memory transport.
pub struct MemoryOutbound {
    shared: Arc<Shared>,
}

#[async_trait]
impl OutboundTransport for MemoryOutbound {
    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        let _ = self.shared.send_attempts.fetch_add(1, Ordering::Relaxed);
        if self.shared.lifecycle.get() != TransportState::Open {
            return Err(TransportError::Closed);
        }
        if self.shared.fail_sends.load(Ordering::Relaxed) {
            return Err(TransportError::Io("injected send failure".into()));
        }
        self.shared.sent.lock().push(text.to_owned());
        Ok(())
    }

    fn state(&self) -> Result<TransportState, TransportError> {
        if self.shared.fail_state.load(Ordering::Relaxed) {
            return Err(TransportError::Io("injected state query failure".into()));
        }
        Ok(self.shared.lifecycle.get())
    }

    async fn close(&self, reason: CloseReason) -> Result<(), TransportError> {
        if self.shared.lifecycle.begin_close() == TransportState::Closed {
            return Ok(());
        }
        *self.shared.close_reason.lock() = Some(reason);
        Ok(())
    }
}

/// Receive half of the in-memory transport.
pub struct MemoryInbound {
    rx: mpsc::Receiver<Frame>,
    shared: Arc<Shared>,
}

#[async_trait]
impl InboundTransport for MemoryInbound {
    async fn receive(&mut self) -> Result<Incoming, TransportError> {
        if self.shared.lifecycle.is_closed() {
            return Err(TransportError::Closed);
        }
        let frame = tokio::select! {
            frame = self.rx.recv() => frame,
            () = self.shared.lifecycle.closed() => return Err(TransportError::Closed),
        };
        match frame {
            Some(Ok(Incoming::Close(reason))) => {
                self.shared.lifecycle.mark_closing();
                Ok(Incoming::Close(reason))
            }
            Some(Ok(incoming)) => Ok(incoming),
            Some(Err(err)) => {
                self.shared.lifecycle.mark_aborted();
                Err(err)
            }
            None => {
                self.shared.lifecycle.mark_aborted();
                Err(TransportError::ClosedPrematurely)
            }
        }
    }
}

/// Remote end of an in-memory transport.
///
/// Dropping every clone of the peer makes the server's next read fail with
/// [`TransportError::ClosedPrematurely`].
#[derive(Clone)]
pub struct MemoryPeer {
    tx: mpsc::Sender<Frame>,
    shared: Arc<Shared>,
}

impl MemoryPeer {
    /// Deliver a text frame to the server.
    pub async fn send_text(&self, text: impl Into<String>) -> bool {
        self.tx.send(Ok(Incoming::Text(text.into()))).await.is_ok()
    }

    /// Deliver a binary frame to the server.
    pub async fn send_binary(&self, data: Vec<u8>) -> bool {
        self.tx.send(Ok(Incoming::Binary(data))).await.is_ok()
    }

    /// Deliver a normal-closure close frame to the server.
    pub async fn send_close(&self) -> bool {
        self.tx
            .send(Ok(Incoming::Close(Some(CloseReason::new(1000, "bye")))))
            .await
            .is_ok()
    }

    /// Make the server's next read fail with `err`.
    pub async fn send_error(&self, err: TransportError) -> bool {
        self.tx.send(Err(err)).await.is_ok()
    }

    /// Die silently: the state flips to `Aborted` but no frame or error is
    /// delivered, so a pending read stays blocked.
    pub fn kill(&self) {
        self.shared.lifecycle.set(TransportState::Aborted);
    }

    /// Make every subsequent server send fail.
    pub fn fail_sends(&self, fail: bool) {
        self.shared.fail_sends.store(fail, Ordering::Relaxed);
    }

    /// Make every subsequent state query fail.
    pub fn fail_state_queries(&self, fail: bool) {
        self.shared.fail_state.store(fail, Ordering::Relaxed);
    }

    /// Messages the server sent successfully, in order.
    pub fn messages(&self) -> Vec<String> {
        self.shared.sent.lock().clone()
    }

    /// Number of send calls that reached the transport, successful or not.
    pub fn send_attempts(&self) -> usize {
        self.shared.send_attempts.load(Ordering::Relaxed)
    }

    /// Current transport state as seen by the server.
    pub fn state(&self) -> TransportState {
        self.shared.lifecycle.get()
    }

    /// Close status the server used, if it closed the transport.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.close_reason.lock().clone()
    }

    /// Whether the server closed the transport.
    pub fn is_closed(&self) -> bool {
        self.shared.lifecycle.is_closed()
    }

    /// Wait until the server closes the transport.
    pub async fn closed(&self) {
        self.shared.lifecycle.closed().await;
    }
}
