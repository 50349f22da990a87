//! Built-in message handlers
//!
//! | type         | reply                                         |
//! |--------------|-----------------------------------------------|
//! | `ping`       | `pong` with `{"timestamp": <data>}`           |
//! | `join_room`  | `room_joined` with `{"room": ..}`             |
//! | `leave_room` | `room_left` with `{"room": ..}`               |
//! | `broadcast`  | none; fans out `{type, payload}` to hub/room  |
//! | `echo`       | `echo` with the data exactly as received      |
//! | `status`     | `status` describing the connection            |

use crate::client::Client;
use crate::error::{RealtimeError, RealtimeResult};
use crate::message::Message;
use crate::router::MessageRouter;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct RoomRequest {
    #[serde(default)]
    room: String,
}

impl RoomRequest {
    fn parse(message: &Message) -> RealtimeResult<String> {
        let request: RoomRequest = message.parse_data()?;
        let room = request.room.trim();
        if room.is_empty() {
            return Err(RealtimeError::invalid_payload("room name is required"));
        }
        Ok(room.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct BroadcastRequest {
    #[serde(default)]
    room: Option<String>,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    payload: Option<Value>,
}

#[derive(Debug, Serialize)]
struct StatusReply {
    client_id: String,
    user_id: Option<String>,
    connected_at: String,
    uptime_secs: u64,
    last_heartbeat: String,
}

/// Install every built-in handler on `router`
pub fn install_defaults(router: &MessageRouter) {
    router.register("ping", ping);
    router.register("join_room", join_room);
    router.register("leave_room", leave_room);
    router.register("broadcast", broadcast);
    router.register("echo", echo);
    router.register("status", status);
}

pub async fn ping(client: Arc<Client>, message: Message) -> RealtimeResult<()> {
    let timestamp = message.data_value()?;
    client.send(&Message::with_payload("pong", json!({ "timestamp": timestamp })))
}

pub async fn join_room(client: Arc<Client>, message: Message) -> RealtimeResult<()> {
    let room = RoomRequest::parse(&message)?;
    client.join_room(&room).await?;
    client.send(&Message::with_payload("room_joined", json!({ "room": room })))
}

pub async fn leave_room(client: Arc<Client>, message: Message) -> RealtimeResult<()> {
    let room = RoomRequest::parse(&message)?;
    client.leave_room(&room).await?;
    client.send(&Message::with_payload("room_left", json!({ "room": room })))
}

pub async fn broadcast(client: Arc<Client>, message: Message) -> RealtimeResult<()> {
    let request: BroadcastRequest = message.parse_data()?;
    if request.kind.is_empty() {
        return Err(RealtimeError::invalid_payload("broadcast type is required"));
    }

    let outbound = match request.payload {
        Some(payload) => Message::with_payload(request.kind, payload),
        None => Message::new(request.kind),
    };

    match request.room.filter(|room| !room.is_empty()) {
        Some(room) => {
            debug!(client_id = %client.id(), room = %room, "Client broadcast to room");
            client.hub().broadcast_to_room(&room, &outbound)
        }
        None => {
            debug!(client_id = %client.id(), "Client broadcast to all");
            client.hub().broadcast(&outbound)
        }
    }
}

pub async fn echo(client: Arc<Client>, message: Message) -> RealtimeResult<()> {
    let reply = match message.raw_data() {
        Some(raw) => Message::with_raw("echo", raw.to_owned()),
        None => Message::new("echo"),
    };
    client.send(&reply)
}

pub async fn status(client: Arc<Client>, _message: Message) -> RealtimeResult<()> {
    let reply = StatusReply {
        client_id: client.id().to_string(),
        user_id: client.user_id().map(str::to_string),
        connected_at: client.connected_at().to_rfc3339(),
        uptime_secs: client.connection_duration().as_secs(),
        last_heartbeat: client.last_heartbeat_at().to_rfc3339(),
    };
    client.send(&Message::from_serializable("status", &reply)?)
}
