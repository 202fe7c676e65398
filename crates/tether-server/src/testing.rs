//! Recording handler shared by the unit tests.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tether_core::{ConnectionId, HandlerError};

use crate::connection::Connection;
use crate::handler::{SocketHandler, UpgradeRequest};
use crate::hub::Hub;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Event {
    Connected(ConnectionId),
    Received(ConnectionId, String),
    Disconnected(ConnectionId),
}

#[derive(Clone, Copy, Default)]
enum Mode {
    #[default]
    Normal,
    Deny,
    PanicOnAuthorize,
    Fail,
}

/// Records every callback. Does not remove on disconnect, so tests also
/// cover the dispatcher's own removal.
#[derive(Clone, Default)]
pub(crate) struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
    mode: Mode,
}

impl Recorder {
    pub(crate) fn denying() -> Self {
        Self {
            mode: Mode::Deny,
            ..Self::default()
        }
    }

    pub(crate) fn panicking_on_authorize() -> Self {
        Self {
            mode: Mode::PanicOnAuthorize,
            ..Self::default()
        }
    }

    /// `on_connected` and `on_disconnected` return errors; `on_received`
    /// panics on the message `"boom"`.
    pub(crate) fn failing() -> Self {
        Self {
            mode: Mode::Fail,
            ..Self::default()
        }
    }

    pub(crate) fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub(crate) fn connected(&self, id: &ConnectionId) -> usize {
        self.count(|e| matches!(e, Event::Connected(c) if c == id))
    }

    pub(crate) fn disconnected(&self, id: &ConnectionId) -> usize {
        self.count(|e| matches!(e, Event::Disconnected(c) if c == id))
    }

    pub(crate) fn received(&self, id: &ConnectionId) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Received(c, message) if c == id => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }

    fn push(&self, event: Event) {
        self.events.lock().push(event);
    }
}

#[async_trait]
impl SocketHandler for Recorder {
    async fn authorize(&self, _request: &UpgradeRequest) -> bool {
        match self.mode {
            Mode::Deny => false,
            Mode::PanicOnAuthorize => panic!("authorize exploded"),
            Mode::Normal | Mode::Fail => true,
        }
    }

    async fn on_connected(
        &self,
        _hub: &Hub,
        id: &ConnectionId,
        _connection: &Arc<Connection>,
    ) -> Result<(), HandlerError> {
        self.push(Event::Connected(id.clone()));
        match self.mode {
            Mode::Fail => Err(HandlerError::msg("on_connected failed")),
            _ => Ok(()),
        }
    }

    async fn on_received(
        &self,
        _hub: &Hub,
        id: &ConnectionId,
        _connection: &Arc<Connection>,
        message: String,
    ) -> Result<(), HandlerError> {
        let explode = matches!(self.mode, Mode::Fail) && message == "boom";
        self.push(Event::Received(id.clone(), message));
        assert!(!explode, "on_received exploded");
        Ok(())
    }

    async fn on_disconnected(
        &self,
        _hub: &Hub,
        id: &ConnectionId,
        _connection: &Arc<Connection>,
    ) -> Result<(), HandlerError> {
        self.push(Event::Disconnected(id.clone()));
        match self.mode {
            Mode::Fail => Err(HandlerError::msg("on_disconnected failed")),
            _ => Ok(()),
        }
    }
}
