//! JSON wire protocol for live design collaboration.
//!
//! One JSON object per WebSocket frame:
//! ```text
//! {
//!   "type":      "cursor_move",                          event tag
//!   "data":      { "user_id": "u1", "x": 10, "y": 20 },  payload, shape depends on type
//!   "design_id": "designX",                              room
//!   "user_id":   "u1",                                   sender
//!   "timestamp": 1767225600                              unix seconds
//! }
//! ```
//!
//! Known tags decode into typed [`Event`] variants. Unknown tags are kept
//! as [`Event::Other`] and relayed untouched.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Room identifier: one per design being edited.
pub type RoomId = String;

/// Caller-supplied user identity. Never validated.
pub type UserId = String;

pub const DESIGN_UPDATE: &str = "design_update";
pub const CURSOR_MOVE: &str = "cursor_move";
pub const USER_JOINED: &str = "user_joined";

/// Cursor position of one collaborator, in canvas coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    #[serde(default)]
    pub user_id: UserId,
    pub x: f64,
    pub y: f64,
}

/// Presence payload for join announcements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    #[serde(default)]
    pub user_id: UserId,
}

/// Typed event payload, keyed by the wire `type` tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A design changed. The payload is the editor's own canvas document.
    DesignUpdate(Value),
    CursorMove(CursorPosition),
    UserJoined(Presence),
    /// Any tag this build does not know about.
    Other { kind: String, data: Value },
}

impl Event {
    /// Wire tag for this event.
    pub fn kind(&self) -> &str {
        match self {
            Self::DesignUpdate(_) => DESIGN_UPDATE,
            Self::CursorMove(_) => CURSOR_MOVE,
            Self::UserJoined(_) => USER_JOINED,
            Self::Other { kind, .. } => kind,
        }
    }

    fn from_parts(kind: String, data: Value) -> Result<Self, ProtocolError> {
        let event = match kind.as_str() {
            DESIGN_UPDATE => Self::DesignUpdate(data),
            CURSOR_MOVE => Self::CursorMove(typed_payload(CURSOR_MOVE, data)?),
            USER_JOINED => Self::UserJoined(typed_payload(USER_JOINED, data)?),
            _ => Self::Other { kind, data },
        };
        Ok(event)
    }

    fn into_parts(self) -> (String, Value) {
        match self {
            Self::DesignUpdate(data) => (DESIGN_UPDATE.to_string(), data),
            Self::CursorMove(cursor) => (
                CURSOR_MOVE.to_string(),
                json!({ "user_id": cursor.user_id, "x": cursor.x, "y": cursor.y }),
            ),
            Self::UserJoined(presence) => (
                USER_JOINED.to_string(),
                json!({ "user_id": presence.user_id }),
            ),
            Self::Other { kind, data } => (kind, data),
        }
    }
}

fn typed_payload<T: DeserializeOwned>(kind: &str, data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|source| ProtocolError::InvalidPayload {
        kind: kind.to_string(),
        source,
    })
}

/// Flat on-the-wire shape of a [`Message`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Frame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    design_id: RoomId,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    user_id: UserId,
    #[serde(default)]
    timestamp: i64,
}

/// One event travelling through the hub.
///
/// Transient: it lives for a single fan-out and is never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Frame", into = "Frame")]
pub struct Message {
    pub event: Event,
    /// Target room.
    pub design_id: RoomId,
    /// Sender identity; empty for server-side announcements.
    pub user_id: UserId,
    /// Unix epoch seconds.
    pub timestamp: i64,
}

impl TryFrom<Frame> for Message {
    type Error = ProtocolError;

    fn try_from(frame: Frame) -> Result<Self, Self::Error> {
        Ok(Self {
            event: Event::from_parts(frame.kind, frame.data)?,
            design_id: frame.design_id,
            user_id: frame.user_id,
            timestamp: frame.timestamp,
        })
    }
}

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        let (kind, data) = message.event.into_parts();
        Self {
            kind,
            data,
            design_id: message.design_id,
            user_id: message.user_id,
            timestamp: message.timestamp,
        }
    }
}

impl Message {
    /// Create a message for `design_id`, stamped with the current time.
    pub fn new(design_id: impl Into<RoomId>, event: Event) -> Self {
        Self {
            event,
            design_id: design_id.into(),
            user_id: UserId::new(),
            timestamp: unix_now(),
        }
    }

    /// A design was saved or changed outside the live session.
    pub fn design_update(design_id: impl Into<RoomId>, data: Value) -> Self {
        Self::new(design_id, Event::DesignUpdate(data))
    }

    pub fn cursor_move(
        design_id: impl Into<RoomId>,
        user_id: impl Into<UserId>,
        x: f64,
        y: f64,
    ) -> Self {
        let user_id = user_id.into();
        let mut message = Self::new(
            design_id,
            Event::CursorMove(CursorPosition {
                user_id: user_id.clone(),
                x,
                y,
            }),
        );
        message.user_id = user_id;
        message
    }

    pub fn user_joined(design_id: impl Into<RoomId>, user_id: impl Into<UserId>) -> Self {
        let user_id = user_id.into();
        let mut message = Self::new(
            design_id,
            Event::UserJoined(Presence {
                user_id: user_id.clone(),
            }),
        );
        message.user_id = user_id;
        message
    }

    /// Wire tag of the carried event.
    pub fn kind(&self) -> &str {
        self.event.kind()
    }

    /// Overwrite sender, room and time with what the connection knows.
    ///
    /// Whatever the peer put in those fields is discarded. Presence payloads
    /// that left `user_id` blank are filled in with the sender.
    pub fn stamp_sender(mut self, user_id: &str, design_id: &str) -> Self {
        self.user_id = user_id.to_string();
        self.design_id = design_id.to_string();
        self.timestamp = unix_now();
        match &mut self.event {
            Event::CursorMove(CursorPosition { user_id: payload_user, .. })
            | Event::UserJoined(Presence { user_id: payload_user }) => {
                if payload_user.is_empty() {
                    *payload_user = user_id.to_string();
                }
            }
            Event::DesignUpdate(_) | Event::Other { .. } => {}
        }
        self
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Parse one inbound frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(ProtocolError::Decode)
    }
}

/// Current wall-clock time in unix seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("Malformed frame: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("Invalid `{kind}` payload: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}
