use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::sync::mpsc;

use crate::client::config::SessionConfig;
use crate::client::models::message_store::MessageStore;
use crate::client::services::api_client::HistorySource;
use crate::client::services::dispatcher::{OutboundDispatcher, SendOutcome};
use crate::client::services::history_loader::{HistoryEvent, HistoryLoader, HistoryUpdate};
use crate::client::services::websocket_client::{
    ConnectionEvent, ConnectionManager, ConnectionState, ConnectionUpdate,
};
use crate::common::models::Message;

/// What one turn of the session loop changed, for the UI to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    /// The store changed; re-render.
    Messages { revision: u64 },
    StateChanged(ConnectionState),
    HistoryLoaded { page: u32, added: usize, has_more: bool },
    HistoryFailed { page: u32 },
    /// An event was processed but nothing visible changed.
    Idle,
}

impl SessionUpdate {
    /// Whether a view showing the store and the connection status is stale.
    pub fn needs_redraw(&self) -> bool {
        match self {
            SessionUpdate::Messages { .. } | SessionUpdate::StateChanged(_) => true,
            SessionUpdate::HistoryLoaded { added, .. } => *added > 0,
            SessionUpdate::HistoryFailed { .. } | SessionUpdate::Idle => false,
        }
    }
}

enum Next {
    Connection(ConnectionEvent),
    History(HistoryEvent),
}

/// Everything one open chat room needs: its socket, its history cursor and
/// its message store.
///
/// All mutation happens on the task that calls `next_update`; the socket and
/// fetch tasks only ever post events to it.
pub struct RoomSession {
    room_id: String,
    username: String,
    announce_disconnects: bool,
    connection: ConnectionManager,
    connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    history: HistoryLoader,
    history_events: mpsc::UnboundedReceiver<HistoryEvent>,
    store: MessageStore,
    dispatcher: OutboundDispatcher,
    closed: bool,
}

impl RoomSession {
    /// Builds a session without touching the network.
    pub fn new(
        config: &SessionConfig,
        room_id: &str,
        username: &str,
        source: Arc<dyn HistorySource>,
    ) -> Self {
        let (connection, connection_events) = ConnectionManager::new(config, room_id, username);
        let (history, history_events) = HistoryLoader::new(config, source, room_id, username);
        Self {
            room_id: room_id.to_string(),
            username: username.to_string(),
            announce_disconnects: config.announce_disconnects,
            connection,
            connection_events,
            history,
            history_events,
            store: MessageStore::new(config.presentation),
            dispatcher: OutboundDispatcher::new(room_id, username),
            closed: false,
        }
    }

    /// Opens the room: connects the socket and requests the newest page.
    pub fn open(
        config: &SessionConfig,
        room_id: &str,
        username: &str,
        source: Arc<dyn HistorySource>,
    ) -> Self {
        let mut session = Self::new(config, room_id, username, source);
        info!("[SESSION] Opening room {} as {}", room_id, username);
        session.connection.connect();
        session.history.load_initial();
        session
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn history(&self) -> &HistoryLoader {
        &self.history
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Waits for the next internal event and applies it. Returns `None` once
    /// the session is closed.
    pub async fn next_update(&mut self) -> Option<SessionUpdate> {
        if self.closed {
            return None;
        }

        let next = tokio::select! {
            Some(event) = self.connection_events.recv() => Next::Connection(event),
            Some(event) = self.history_events.recv() => Next::History(event),
            else => return None,
        };

        Some(match next {
            Next::Connection(event) => self.apply_connection_event(event),
            Next::History(event) => self.apply_history_event(event),
        })
    }

    pub fn send(&mut self, compose: &mut String) -> SendOutcome {
        if self.closed {
            return SendOutcome::NotConnected;
        }
        self.dispatcher.send(compose, &self.connection, &mut self.store)
    }

    /// Scroll-to-end trigger.
    pub fn load_more(&mut self) -> bool {
        self.history.load_more()
    }

    /// The view regained focus.
    pub fn on_focus(&mut self) -> bool {
        self.connection.on_focus()
    }

    /// Tears the room down: closes the socket, cancels the pending reconnect
    /// and makes in-flight history fetches irrelevant.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        info!("[SESSION] Closing room {}", self.room_id);
        self.closed = true;
        self.connection.close();
        self.history.cancel();
    }

    /// `close()`, then waits (bounded) for the socket task to confirm it is gone.
    pub async fn shutdown(&mut self, wait: Duration) {
        self.close();
        let _ = tokio::time::timeout(wait, async {
            while self.connection.state() != ConnectionState::Disconnected {
                match self.connection_events.recv().await {
                    Some(event) => {
                        self.connection.handle_event(event);
                    }
                    None => break,
                }
            }
        })
        .await;
    }

    fn apply_connection_event(&mut self, event: ConnectionEvent) -> SessionUpdate {
        let was_open = self.connection.is_open();
        match self.connection.handle_event(event) {
            ConnectionUpdate::None => SessionUpdate::Idle,
            ConnectionUpdate::StateChanged(state) => {
                if was_open && state == ConnectionState::Disconnected && self.announce_disconnects {
                    self.store
                        .push_local(Message::system(&self.room_id, "Disconnected from the chat."));
                }
                SessionUpdate::StateChanged(state)
            }
            ConnectionUpdate::Message(message) => {
                let outcome = self.store.merge_realtime(message);
                if outcome.changed() {
                    SessionUpdate::Messages {
                        revision: self.store.revision(),
                    }
                } else {
                    debug!("[SESSION] Realtime message already present ({:?})", outcome);
                    SessionUpdate::Idle
                }
            }
        }
    }

    fn apply_history_event(&mut self, event: HistoryEvent) -> SessionUpdate {
        match self.history.handle_event(event) {
            HistoryUpdate::Loaded {
                page,
                append,
                messages,
                has_more,
            } => {
                let added = if messages.is_empty() {
                    0
                } else {
                    self.store.merge_history_page(messages, append)
                };
                SessionUpdate::HistoryLoaded {
                    page,
                    added,
                    has_more,
                }
            }
            HistoryUpdate::Failed { page } => SessionUpdate::HistoryFailed { page },
            HistoryUpdate::Settled | HistoryUpdate::None => SessionUpdate::Idle,
        }
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        self.close();
    }
}
