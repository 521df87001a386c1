//! One-shot announcements into a room from outside the live session.
//!
//! The REST layer (design saves, joins through the API) is not a connected
//! client. These helpers build the event and hand it to the hub; nothing
//! is registered and nothing is returned.
//!
//! ```text
//! PUT /designs/:id ──► broadcast_design_update ──► Hub ──► every client in room :id
//! ```

use serde_json::Value;

use crate::hub::HubHandle;
use crate::protocol::{Message, RoomId, UserId};

impl HubHandle {
    /// Announce that a design changed.
    pub async fn broadcast_design_update(&self, design_id: impl Into<RoomId>, data: Value) {
        self.announce(Message::design_update(design_id, data)).await;
    }

    /// Announce a collaborator's cursor position.
    pub async fn broadcast_cursor_move(
        &self,
        design_id: impl Into<RoomId>,
        user_id: impl Into<UserId>,
        x: f64,
        y: f64,
    ) {
        self.announce(Message::cursor_move(design_id, user_id, x, y))
            .await;
    }

    pub async fn broadcast_user_joined(
        &self,
        design_id: impl Into<RoomId>,
        user_id: impl Into<UserId>,
    ) {
        self.announce(Message::user_joined(design_id, user_id)).await;
    }

    async fn announce(&self, message: Message) {
        let kind = message.kind().to_string();
        let room = message.design_id.clone();
        if let Err(e) = self.broadcast(message).await {
            log::warn!("Dropping {kind} announcement for room {room}: {e}");
        }
    }
}
