use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsFrame};
use url::Url;

use crate::client::config::SessionConfig;
use crate::common::error::{Result, SyncError};
use crate::common::models::{decode_frame, Message, MessageKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    /// `close()` was called on an open socket; waiting for the IO task to finish.
    Closing,
}

/// Raw happenings of the socket and its timers, delivered on the session's
/// event queue. Every event carries the generation of the `connect()` call it
/// belongs to so that late events of a superseded socket can be ignored.
#[derive(Debug)]
pub enum ConnectionEvent {
    Opened { generation: u64 },
    Frame { generation: u64, text: String },
    Error { generation: u64, error: SyncError },
    Closed { generation: u64 },
    ReconnectDue { generation: u64 },
}

/// Result of handling one `ConnectionEvent`.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionUpdate {
    None,
    StateChanged(ConnectionState),
    /// A CHAT/SYSTEM message for our room, ready for the store.
    Message(Message),
}

/// Owns the single WebSocket of a room session.
///
/// The socket itself lives in a background task; the manager only keeps the
/// sending half of its outgoing queue. All state transitions happen in
/// `handle_event`, called from the session loop.
pub struct ConnectionManager {
    socket_url: String,
    room_id: String,
    username: String,
    reconnect_delay: Duration,
    join_grace: Duration,
    state: ConnectionState,
    generation: u64,
    connect_attempts: u64,
    closed: bool,
    outgoing: Option<mpsc::UnboundedSender<Message>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    io_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    pub fn new(
        config: &SessionConfig,
        room_id: &str,
        username: &str,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let manager = Self {
            socket_url: config.socket_url.clone(),
            room_id: room_id.to_string(),
            username: username.to_string(),
            reconnect_delay: config.reconnect_delay,
            join_grace: config.join_grace,
            state: ConnectionState::Disconnected,
            generation: 0,
            connect_attempts: 0,
            closed: false,
            outgoing: None,
            events,
            io_task: None,
            reconnect_task: None,
        };
        (manager, rx)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Number of times `connect()` actually started a connection attempt.
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts
    }

    pub fn has_pending_reconnect(&self) -> bool {
        self.reconnect_task.is_some()
    }

    /// Socket address: room and identity travel as query parameters.
    pub fn connect_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.socket_url)?;
        url.query_pairs_mut()
            .append_pair("groupId", &self.room_id)
            .append_pair("username", &self.username);
        Ok(url)
    }

    /// Starts a connection attempt unless one is already open or in progress.
    pub fn connect(&mut self) {
        if self.closed {
            warn!("[WS:CLIENT] connect() after close ignored for room {}", self.room_id);
            return;
        }
        if matches!(self.state, ConnectionState::Connecting | ConnectionState::Open) {
            debug!("[WS:CLIENT] Already {:?}, not connecting again", self.state);
            return;
        }

        self.cancel_reconnect();
        if let Some(task) = self.io_task.take() {
            task.abort();
        }

        let url = match self.connect_url() {
            Ok(url) => url,
            Err(e) => {
                error!("[WS:CLIENT] Cannot build socket address from {}: {}", self.socket_url, e);
                return;
            }
        };

        self.generation += 1;
        self.connect_attempts += 1;
        self.state = ConnectionState::Connecting;

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel::<Message>();
        self.outgoing = Some(outgoing_tx);
        self.io_task = Some(tokio::spawn(run_socket(
            url,
            self.generation,
            self.room_id.clone(),
            self.username.clone(),
            self.join_grace,
            outgoing_rx,
            self.events.clone(),
        )));
    }

    /// Called when the view regains focus: a socket that is not open (and not
    /// already coming up) is reconnected right away.
    pub fn on_focus(&mut self) -> bool {
        if self.closed || self.state != ConnectionState::Disconnected {
            return false;
        }
        info!("[WS:CLIENT] Focus regained while disconnected, reconnecting now");
        self.connect();
        true
    }

    /// Queues a frame on the open socket.
    pub fn send(&self, message: &Message) -> Result<()> {
        if self.state != ConnectionState::Open {
            return Err(SyncError::NotConnected);
        }
        match &self.outgoing {
            Some(sender) => sender
                .send(message.clone())
                .map_err(|_| SyncError::NotConnected),
            None => Err(SyncError::NotConnected),
        }
    }

    /// Applies one event to the state machine.
    pub fn handle_event(&mut self, event: ConnectionEvent) -> ConnectionUpdate {
        let generation = match &event {
            ConnectionEvent::Opened { generation }
            | ConnectionEvent::Frame { generation, .. }
            | ConnectionEvent::Error { generation, .. }
            | ConnectionEvent::Closed { generation }
            | ConnectionEvent::ReconnectDue { generation } => *generation,
        };
        if generation != self.generation {
            debug!("[WS:CLIENT] Ignoring event of superseded connection #{}", generation);
            return ConnectionUpdate::None;
        }

        if self.closed {
            if let ConnectionEvent::Closed { .. } = event {
                self.state = ConnectionState::Disconnected;
                self.io_task = None;
                return ConnectionUpdate::StateChanged(self.state);
            }
            return ConnectionUpdate::None;
        }

        match event {
            ConnectionEvent::Opened { .. } => {
                info!("[WS:CLIENT] Connected to room {} as {}", self.room_id, self.username);
                self.state = ConnectionState::Open;
                ConnectionUpdate::StateChanged(self.state)
            }
            ConnectionEvent::Frame { text, .. } => self.handle_frame(&text),
            ConnectionEvent::Error { error, .. } => {
                // The close handler finalizes; an error alone changes nothing.
                warn!("[WS:CLIENT] {}", error);
                ConnectionUpdate::None
            }
            ConnectionEvent::Closed { .. } => {
                info!("[WS:CLIENT] WebSocket connection closed");
                self.state = ConnectionState::Disconnected;
                self.outgoing = None;
                self.io_task = None;
                self.schedule_reconnect();
                ConnectionUpdate::StateChanged(self.state)
            }
            ConnectionEvent::ReconnectDue { .. } => {
                self.reconnect_task = None;
                if self.state != ConnectionState::Disconnected {
                    return ConnectionUpdate::None;
                }
                self.connect();
                ConnectionUpdate::StateChanged(self.state)
            }
        }
    }

    /// Closes the socket for good: no reconnect will ever follow.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        info!("[WS:CLIENT] Closing connection to room {}", self.room_id);
        self.closed = true;
        self.cancel_reconnect();
        // Dropping the queue makes the IO task send a Close frame and exit.
        self.outgoing = None;

        if self.state == ConnectionState::Open {
            self.state = ConnectionState::Closing;
        } else {
            if let Some(task) = self.io_task.take() {
                task.abort();
            }
            self.state = ConnectionState::Disconnected;
        }
    }

    /// Marks the manager open with an in-memory outgoing queue.
    #[cfg(test)]
    pub(crate) fn open_for_test(&mut self) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.generation += 1;
        self.state = ConnectionState::Open;
        self.outgoing = Some(tx);
        rx
    }

    fn handle_frame(&mut self, text: &str) -> ConnectionUpdate {
        if self.state != ConnectionState::Open {
            return ConnectionUpdate::None;
        }
        let message = match decode_frame(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("[WS:CLIENT] Dropping malformed frame: {} - Raw: {}", e, text);
                return ConnectionUpdate::None;
            }
        };
        if message.kind == MessageKind::Join {
            debug!("[WS:CLIENT] {} announced itself", message.sender);
            return ConnectionUpdate::None;
        }
        if message.room_id != self.room_id {
            debug!(
                "[WS:CLIENT] Dropping frame for room {} (session room {})",
                message.room_id, self.room_id
            );
            return ConnectionUpdate::None;
        }
        ConnectionUpdate::Message(message)
    }

    fn schedule_reconnect(&mut self) {
        self.cancel_reconnect();
        info!("[WS:CLIENT] Reconnecting in {:?}...", self.reconnect_delay);
        let events = self.events.clone();
        let delay = self.reconnect_delay;
        let generation = self.generation;
        self.reconnect_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(ConnectionEvent::ReconnectDue { generation });
        }));
    }

    fn cancel_reconnect(&mut self) {
        if let Some(task) = self.reconnect_task.take() {
            task.abort();
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.cancel_reconnect();
    }
}

/// Drives one socket from connect to close, reporting everything as events.
async fn run_socket(
    url: Url,
    generation: u64,
    room_id: String,
    username: String,
    join_grace: Duration,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    info!("[WS:CLIENT] Connecting to {}", url);
    let ws_stream = match connect_async(url.as_str()).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            let _ = events.send(ConnectionEvent::Error {
                generation,
                error: SyncError::WebSocket(e),
            });
            let _ = events.send(ConnectionEvent::Closed { generation });
            return;
        }
    };
    let _ = events.send(ConnectionEvent::Opened { generation });

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let join_timer = tokio::time::sleep(join_grace);
    tokio::pin!(join_timer);
    let mut joined = false;

    loop {
        tokio::select! {
            _ = &mut join_timer, if !joined => {
                joined = true;
                let join = Message::join(&room_id, &username);
                match join.to_json() {
                    Ok(json) => {
                        if let Err(e) = ws_sender.send(WsFrame::Text(json)).await {
                            warn!("[WS:CLIENT] Error sending join message: {}", e);
                        }
                    }
                    Err(e) => warn!("[WS:CLIENT] Failed to serialize join message: {}", e),
                }
            }
            queued = outgoing.recv() => match queued {
                Some(message) => match message.to_json() {
                    Ok(json) => {
                        if let Err(e) = ws_sender.send(WsFrame::Text(json)).await {
                            let _ = events.send(ConnectionEvent::Error {
                                generation,
                                error: SyncError::WebSocket(e),
                            });
                            break;
                        }
                    }
                    Err(e) => warn!("[WS:CLIENT] Failed to serialize outgoing message: {}", e),
                },
                None => {
                    // Manager closed the session.
                    let _ = ws_sender.close().await;
                    break;
                }
            },
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(WsFrame::Text(text))) => {
                    let _ = events.send(ConnectionEvent::Frame { generation, text });
                }
                Some(Ok(WsFrame::Close(_))) | None => {
                    debug!("[WS:CLIENT] Connection closed by server");
                    break;
                }
                Some(Ok(_)) => {
                    // binary, ping, pong
                }
                Some(Err(e)) => {
                    let _ = events.send(ConnectionEvent::Error {
                        generation,
                        error: SyncError::WebSocket(e),
                    });
                    break;
                }
            },
        }
    }

    let _ = events.send(ConnectionEvent::Closed { generation });
}
