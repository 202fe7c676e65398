//! Handlers shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tether_server::{Connection, ConnectionId, HandlerError, Hub, SocketHandler, UpgradeRequest};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Connected(ConnectionId),
    Received(ConnectionId, String),
    Disconnected(ConnectionId),
}

/// Records callbacks and echoes every message back as `echo: <text>`.
///
/// Requests are authorized only when they carry a non-empty `room` query
/// parameter.
#[derive(Clone, Default)]
pub struct EchoRecorder {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EchoRecorder {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }

    pub fn connected(&self) -> usize {
        self.count(|e| matches!(e, Event::Connected(_)))
    }

    pub fn disconnected_for(&self, id: &ConnectionId) -> usize {
        self.count(|e| matches!(e, Event::Disconnected(c) if c == id))
    }
}

#[async_trait]
impl SocketHandler for EchoRecorder {
    async fn authorize(&self, request: &UpgradeRequest) -> bool {
        request.query_value("room").is_some_and(|room| !room.is_empty())
    }

    async fn on_connected(
        &self,
        _hub: &Hub,
        id: &ConnectionId,
        _connection: &Arc<Connection>,
    ) -> Result<(), HandlerError> {
        self.events.lock().push(Event::Connected(id.clone()));
        Ok(())
    }

    async fn on_received(
        &self,
        hub: &Hub,
        id: &ConnectionId,
        _connection: &Arc<Connection>,
        message: String,
    ) -> Result<(), HandlerError> {
        let reply = format!("echo: {message}");
        self.events.lock().push(Event::Received(id.clone(), message));
        let _ = hub.send_message(id, &reply).await;
        Ok(())
    }

    async fn on_disconnected(
        &self,
        hub: &Hub,
        id: &ConnectionId,
        _connection: &Arc<Connection>,
    ) -> Result<(), HandlerError> {
        self.events.lock().push(Event::Disconnected(id.clone()));
        let _ = hub.registry().remove(std::slice::from_ref(id)).await;
        Ok(())
    }
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}
