//! Periodic sweep for connections whose transport died without the
//! connection loop noticing.
//!
//! A peer can vanish without a close frame or a read error reaching the
//! loop (half-open TCP, a transport that flips to `Aborted` silently). The
//! reaper looks at every registered connection once per interval and sends
//! anything not `Open` through [`Dispatcher::disconnect`], the same path the
//! loop uses, so a connection is torn down once no matter who sees it first.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::dispatcher::{DisconnectReason, Dispatcher};
use crate::metrics::WS_REAPED_TOTAL;
use crate::transport::TransportState;

/// Background sweeper.
#[derive(Debug)]
pub struct Reaper {
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
}

impl Reaper {
    /// Create a reaper sweeping every `interval`.
    pub fn new(dispatcher: Arc<Dispatcher>, interval: Duration) -> Self {
        Self {
            dispatcher,
            interval,
        }
    }

    /// Spawn a reaper that runs until `cancel` fires.
    pub fn spawn(
        dispatcher: Arc<Dispatcher>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(Self::new(dispatcher, interval).run(cancel))
    }

    /// Sweep every `interval` until `cancel` fires.
    ///
    /// The first sweep happens one full interval after start.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let _ = ticker.tick().await;

        info!(interval_ms = millis(self.interval), "reaper started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let _ = self.sweep().await;
                }
            }
        }
        info!("reaper stopped");
    }

    /// Run one sweep over a registry snapshot.
    ///
    /// Returns the number of connections this sweep tore down.
    pub async fn sweep(&self) -> usize {
        let mut reaped = 0;
        for connection in self.dispatcher.hub().registry().snapshot() {
            match connection.transport_state() {
                Ok(TransportState::Open) => continue,
                Ok(state) => {
                    debug!(connection_id = %connection.id(), state = state.as_str(), "transport not open");
                }
                Err(err) => {
                    debug!(connection_id = %connection.id(), error = %err, "transport state query failed");
                }
            }
            if self
                .dispatcher
                .disconnect(&connection, DisconnectReason::Reaped)
                .await
            {
                reaped += 1;
            }
        }
        if reaped > 0 {
            metrics::counter!(WS_REAPED_TOTAL).increment(u64::try_from(reaped).unwrap_or(u64::MAX));
            info!(reaped, "reaped dead connections");
        }
        reaped
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
