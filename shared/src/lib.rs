//! Wire protocol shared by the relay server and its clients.
//!
//! Messages are JSON objects. Clients send player updates, the server relays
//! them verbatim and adds its own arrival/departure notices.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;

pub mod framing;

pub use framing::{extract_frame, parse_frame, Frame, FrameError, Framer, Framing};

pub const DEFAULT_ADDR: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8000;
/// Default size of the identifier pool, also used as the listen backlog.
pub const MAX_PLAYERS: usize = 20;
/// Receive buffer size; bounds a single read, and therefore a single message.
pub const MSG_SIZE: usize = 2048;
/// Delay between roster messages sent to a joining player.
pub const ROSTER_PACING: Duration = Duration::from_millis(100);
/// Time a new connection gets to send its username.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Value of the `object` field that marks a player message.
pub const PLAYER_OBJECT: &str = "player";

/// Position assigned to a player when it joins.
pub fn spawn_position() -> Value {
    json!([0, 1, 0])
}

/// Position recorded when a player update omits `position`.
pub fn reset_position() -> Value {
    json!([0, 0, 0])
}

/// Rotation at spawn and when an update omits `rotation`.
pub fn default_rotation() -> Value {
    json!(0)
}

/// Health at spawn and when an update omits `health`.
pub fn default_health() -> Value {
    json!(100)
}

/// Server-originated notice about a player joining or leaving.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PlayerNotice {
    pub id: String,
    pub object: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<Value>,
    pub joined: bool,
    pub left: bool,
}

impl PlayerNotice {
    /// Announces a player that joined, or describes one already present.
    pub fn arrival(id: &str, username: &str, position: Value, health: Value) -> Self {
        Self {
            id: id.to_string(),
            object: PLAYER_OBJECT.to_string(),
            username: Some(username.to_string()),
            position: Some(position),
            health: Some(health),
            joined: true,
            left: false,
        }
    }

    /// Announces a player that left. Carries no player state.
    pub fn departure(id: &str) -> Self {
        Self {
            id: id.to_string(),
            object: PLAYER_OBJECT.to_string(),
            username: None,
            position: None,
            health: None,
            joined: false,
            left: true,
        }
    }

    /// Compact JSON encoding as sent on the wire.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// State carried by a client's `"object": "player"` message.
///
/// Absent fields are reset to their defaults rather than left unchanged, so
/// a message carrying only `rotation` also moves the player back to the
/// origin with full health.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerUpdate {
    pub position: Value,
    pub rotation: Value,
    pub health: Value,
}

impl PlayerUpdate {
    /// Returns `None` when the message is not about a player.
    pub fn from_message(message: &Map<String, Value>) -> Option<Self> {
        if message.get("object").and_then(Value::as_str) != Some(PLAYER_OBJECT) {
            return None;
        }

        Some(Self {
            position: message
                .get("position")
                .cloned()
                .unwrap_or_else(reset_position),
            rotation: message
                .get("rotation")
                .cloned()
                .unwrap_or_else(default_rotation),
            health: message.get("health").cloned().unwrap_or_else(default_health),
        })
    }
}
