//! Room chat: every connection joins the room named in its `room` query
//! parameter and text it sends is relayed to everyone in that room.
//!
//! Frames sent to clients are JSON objects tagged with `type`:
//! `welcome`, `joined`, `message`, `left`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tether_core::{ConnectionId, HandlerError};
use tether_server::{Connection, Hub, SocketHandler, UpgradeRequest};
use tracing::debug;

/// Per-connection state attached on connect.
#[derive(Debug)]
pub struct Member {
    /// Display name.
    pub name: String,
    /// Room joined.
    pub room: String,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Frame<'a> {
    Welcome {
        id: &'a str,
        name: &'a str,
        room: &'a str,
        members: usize,
    },
    Joined {
        name: &'a str,
    },
    Message {
        from: &'a str,
        text: &'a str,
    },
    Left {
        name: &'a str,
    },
}

/// Room-chat handler.
#[derive(Debug, Default, Clone, Copy)]
pub struct RoomChat;

impl RoomChat {
    async fn to_room(
        hub: &Hub,
        room: &str,
        except: Option<&ConnectionId>,
        frame: &Frame<'_>,
    ) -> Result<(), HandlerError> {
        let text = serde_json::to_string(frame)?;
        let report = hub
            .broadcast_where(&text, |c| {
                Some(c.id()) != except && c.value("room").as_deref() == Some(room)
            })
            .await;
        debug!(room, delivered = report.delivered, failed = report.failed, "room fan-out");
        Ok(())
    }
}

#[async_trait]
impl SocketHandler for RoomChat {
    async fn authorize(&self, request: &UpgradeRequest) -> bool {
        request
            .query_value("room")
            .is_some_and(|room| !room.trim().is_empty())
    }

    async fn on_connected(
        &self,
        hub: &Hub,
        id: &ConnectionId,
        connection: &Arc<Connection>,
    ) -> Result<(), HandlerError> {
        let room = connection
            .value("room")
            .ok_or_else(|| HandlerError::msg("connection has no room"))?;
        let name = connection
            .value("name")
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| format!("guest-{}", id.as_str().chars().take(8).collect::<String>()));
        connection.set_state(Member {
            name: name.clone(),
            room: room.clone(),
        })?;

        let members = hub
            .find(|c| c.value("room").as_deref() == Some(room.as_str()))
            .len();
        let welcome = serde_json::to_string(&Frame::Welcome {
            id: id.as_str(),
            name: &name,
            room: &room,
            members,
        })?;
        let _ = hub.send_to_entity(connection, &welcome).await;
        Self::to_room(hub, &room, Some(id), &Frame::Joined { name: &name }).await
    }

    async fn on_received(
        &self,
        hub: &Hub,
        _id: &ConnectionId,
        connection: &Arc<Connection>,
        message: String,
    ) -> Result<(), HandlerError> {
        let member = connection.state::<Member>()?;
        let frame = Frame::Message {
            from: &member.name,
            text: &message,
        };
        Self::to_room(hub, &member.room, None, &frame).await
    }

    async fn on_disconnected(
        &self,
        hub: &Hub,
        id: &ConnectionId,
        connection: &Arc<Connection>,
    ) -> Result<(), HandlerError> {
        let _ = hub.registry().remove(std::slice::from_ref(id)).await;
        let member = connection.state::<Member>()?;
        Self::to_room(hub, &member.room, None, &Frame::Left { name: &member.name }).await
    }
}
