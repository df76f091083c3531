use log::{debug, warn};

use crate::client::models::message_store::MessageStore;
use crate::client::services::websocket_client::ConnectionManager;
use crate::common::models::Message;

/// What happened to a compose buffer handed to `OutboundDispatcher::send`.
///
/// `Blank` and `NotConnected` are no-ops, not errors: nothing is written to
/// the socket, the store is untouched and the buffer keeps its text so the UI
/// can show that the message did not go out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent { id: String },
    Blank,
    NotConnected,
}

impl SendOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, SendOutcome::Sent { .. })
    }
}

/// Turns composed text into a CHAT frame plus an optimistic local copy.
#[derive(Debug, Clone)]
pub struct OutboundDispatcher {
    room_id: String,
    username: String,
}

impl OutboundDispatcher {
    pub fn new(room_id: &str, username: &str) -> Self {
        Self {
            room_id: room_id.to_string(),
            username: username.to_string(),
        }
    }

    pub fn send(
        &self,
        compose: &mut String,
        connection: &ConnectionManager,
        store: &mut MessageStore,
    ) -> SendOutcome {
        let text = compose.trim();
        if text.is_empty() {
            return SendOutcome::Blank;
        }
        if !connection.is_open() {
            debug!("[SESSION] Not sending while {:?}", connection.state());
            return SendOutcome::NotConnected;
        }

        let message = Message::chat(&self.room_id, &self.username, text);
        if let Err(e) = connection.send(&message) {
            warn!("[SESSION] Failed to queue message: {}", e);
            return SendOutcome::NotConnected;
        }

        let id = message.id.clone();
        store.insert_optimistic(message);
        compose.clear();
        SendOutcome::Sent { id }
    }
}
