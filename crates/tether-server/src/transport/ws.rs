//! axum WebSocket adapter.
//!
//! The socket is split. The stream is owned by the inbound half. The sink is
//! owned by a writer task fed through a bounded queue, so `send_text` never
//! waits on a slow peer; a full queue fails the send instead. The writer also
//! pings the peer and marks the transport `Aborted` once pongs stop coming.
//! Closing cancels any write in flight and gives the close frame a bounded
//! window to go out.

use std::error::Error as StdError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tether_core::TransportError;
use tether_settings::ConnectionSettings;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    CloseReason, InboundTransport, Incoming, Lifecycle, OutboundTransport, TransportHandle,
    TransportState,
};

/// Messages queued for the writer before sends start failing.
pub const SEND_QUEUE_CAPACITY: usize = 1024;

/// Upper bound on delivering the close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Ping cadence for a WebSocket transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Heartbeat {
    /// Time between pings.
    pub interval: Duration,
    /// A peer that sends nothing for this long is marked dead. Also bounds
    /// a single write.
    pub timeout: Duration,
}

impl Heartbeat {
    /// Create a heartbeat.
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Heartbeat from connection settings.
    pub fn from_settings(settings: &ConnectionSettings) -> Self {
        Self::new(settings.heartbeat_interval(), settings.heartbeat_timeout())
    }

    /// Consecutive silent intervals tolerated before the peer is dead.
    fn max_missed(self) -> u32 {
        let interval = self.interval.as_millis().max(1);
        u32::try_from(self.timeout.as_millis() / interval)
            .unwrap_or(u32::MAX)
            .max(1)
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::from_settings(&ConnectionSettings::default())
    }
}

struct Shared {
    lifecycle: Lifecycle,
    /// Set by the reader on any inbound frame, cleared by the writer on
    /// every heartbeat tick.
    alive: AtomicBool,
    close_reason: Mutex<Option<CloseReason>>,
    writer_done: CancellationToken,
}

/// Split an upgraded socket into a [`TransportHandle`] and start its writer.
pub fn split(socket: WebSocket, heartbeat: Heartbeat) -> TransportHandle {
    let (sink, stream) = socket.split();
    spawn_transport(sink, stream, heartbeat)
}

fn spawn_transport<S, R>(sink: S, stream: R, heartbeat: Heartbeat) -> TransportHandle
where
    S: Sink<Message, Error = axum::Error> + Send + Unpin + 'static,
    R: Stream<Item = Result<Message, axum::Error>> + Send + Unpin + 'static,
{
    let shared = Arc::new(Shared {
        lifecycle: Lifecycle::new(TransportState::Open),
        alive: AtomicBool::new(true),
        close_reason: Mutex::new(None),
        writer_done: CancellationToken::new(),
    });
    let (tx, rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
    let _writer = tokio::spawn(write_loop(sink, rx, shared.clone(), heartbeat));

    TransportHandle::new(
        Arc::new(WsOutbound {
            tx,
            shared: shared.clone(),
        }),
        Box::new(WsInbound { stream, shared }),
    )
}

/// Send half of a WebSocket transport.
pub struct WsOutbound {
    tx: mpsc::Sender<String>,
    shared: Arc<Shared>,
}

#[async_trait]
impl OutboundTransport for WsOutbound {
    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        if self.shared.lifecycle.get() != TransportState::Open {
            return Err(TransportError::Closed);
        }
        match self.tx.try_send(text.to_owned()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TransportError::Io("send queue full".into())),
            Err(TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }

    fn state(&self) -> Result<TransportState, TransportError> {
        Ok(self.shared.lifecycle.get())
    }

    async fn close(&self, reason: CloseReason) -> Result<(), TransportError> {
        {
            let mut slot = self.shared.close_reason.lock();
            if self.shared.lifecycle.is_closed() {
                return Ok(());
            }
            *slot = Some(reason);
            let _ = self.shared.lifecycle.begin_close();
        }
        time::timeout(CLOSE_TIMEOUT, self.shared.writer_done.cancelled())
            .await
            .map_err(|_| TransportError::Io("timed out sending close frame".into()))
    }
}

/// Receive half of a WebSocket transport.
pub struct WsInbound<R> {
    stream: R,
    shared: Arc<Shared>,
}

#[async_trait]
impl<R> InboundTransport for WsInbound<R>
where
    R: Stream<Item = Result<Message, axum::Error>> + Send + Unpin + 'static,
{
    async fn receive(&mut self) -> Result<Incoming, TransportError> {
        loop {
            let next = tokio::select! {
                next = self.stream.next() => next,
                () = self.shared.lifecycle.closed() => return Err(TransportError::Closed),
            };
            if matches!(next, Some(Ok(_))) {
                self.shared.alive.store(true, Ordering::Release);
            }
            match next {
                Some(Ok(Message::Text(text))) => return Ok(Incoming::Text(text.as_str().to_owned())),
                Some(Ok(Message::Binary(data))) => return Ok(Incoming::Binary(data.to_vec())),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    self.shared.lifecycle.mark_closing();
                    let reason = frame.map(|f| CloseReason::new(f.code, f.reason.as_str()));
                    return Ok(Incoming::Close(reason));
                }
                Some(Err(err)) => {
                    self.shared.lifecycle.mark_aborted();
                    return Err(classify(err));
                }
                None => {
                    self.shared.lifecycle.mark_aborted();
                    return Err(TransportError::ClosedPrematurely);
                }
            }
        }
    }
}

enum Write {
    Sent,
    Closed,
    Failed(TransportError),
}

/// Own the sink: forward queued text, ping on every tick, and send the
/// close frame once the transport is closed.
async fn write_loop<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<String>,
    shared: Arc<Shared>,
    heartbeat: Heartbeat,
) where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    let _done = shared.writer_done.clone().drop_guard();
    let max_missed = heartbeat.max_missed();
    let mut missed = 0_u32;
    let mut ticker = time::interval(heartbeat.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let _ = ticker.tick().await;

    loop {
        let message = tokio::select! {
            biased;
            () = shared.lifecycle.closed() => break,
            text = rx.recv() => match text {
                Some(text) => Message::Text(text.into()),
                None => break,
            },
            _ = ticker.tick() => {
                if shared.alive.swap(false, Ordering::AcqRel) {
                    missed = 0;
                } else {
                    missed += 1;
                    if missed >= max_missed {
                        warn!(missed, "peer stopped answering pings");
                        shared.lifecycle.mark_aborted();
                        return;
                    }
                }
                Message::Ping(vec![].into())
            }
        };

        match write(&mut sink, message, &shared.lifecycle, heartbeat.timeout).await {
            Write::Sent => {}
            Write::Closed => break,
            Write::Failed(err) => {
                debug!(error = %err, "write failed");
                shared.lifecycle.mark_aborted();
                return;
            }
        }
    }

    let reason = shared
        .close_reason
        .lock()
        .take()
        .unwrap_or_else(CloseReason::normal);
    let frame = CloseFrame {
        code: reason.code,
        reason: reason.reason.into(),
    };
    match time::timeout(CLOSE_TIMEOUT, sink.send(Message::Close(Some(frame)))).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(error = %classify(err), "close frame not delivered"),
        Err(_) => debug!("timed out sending close frame"),
    }
}

/// One bounded write that gives up as soon as the transport is closed.
async fn write<S>(sink: &mut S, message: Message, lifecycle: &Lifecycle, limit: Duration) -> Write
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    tokio::select! {
        biased;
        () = lifecycle.closed() => Write::Closed,
        result = time::timeout(limit, sink.send(message)) => match result {
            Ok(Ok(())) => Write::Sent,
            Ok(Err(err)) => Write::Failed(classify(err)),
            Err(_) => Write::Failed(TransportError::Io("write timed out".into())),
        },
    }
}

/// Map an axum socket error onto the transport error taxonomy.
///
/// Only the error chain and its messages are inspected, so this holds for
/// whichever tungstenite release axum links against.
fn classify(err: axum::Error) -> TransportError {
    let inner = err.into_inner();
    let mut current: Option<&(dyn StdError + 'static)> = Some(&*inner);
    while let Some(error) = current {
        if let Some(io) = error.downcast_ref::<std::io::Error>() {
            if is_disconnect(io.kind()) {
                return TransportError::ClosedPrematurely;
            }
            return TransportError::Io(io.to_string());
        }
        current = error.source();
    }

    let message = inner.to_string();
    let lower = message.to_ascii_lowercase();
    if lower.contains("without closing handshake") {
        TransportError::ClosedPrematurely
    } else if lower.contains("connection closed normally")
        || lower.contains("closed connection")
    {
        TransportError::Closed
    } else if lower.contains("protocol error") {
        TransportError::Protocol(message)
    } else {
        TransportError::Io(message)
    }
}

fn is_disconnect(kind: std::io::ErrorKind) -> bool {
    use std::io::ErrorKind;
    matches!(
        kind,
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
