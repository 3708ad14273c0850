// src/websocket.rs

use crate::{
    auth::{AuthUser, Identity},
    config::WsSettings,
    error::{AppError, ProtocolError, StoreError, TransportError},
    hub::HubHandle,
    models::{ClientMessage, NewMessage, ServerMessage},
    state::{AppState, Connection, ConnectionId, Outbound, wait_for_close},
};
use axum::{
    body::Bytes,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket},
    },
    response::Response,
};
use chrono::Utc;
use futures_util::{
    sink::SinkExt,
    stream::{SplitSink, SplitStream, StreamExt},
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::time::{self, Instant, timeout};
use tracing::{debug, error, info, warn};

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    #[serde(default)]
    board_id: Option<String>,
}

/// The handler for `GET /ws/chat?board_id=..`.
/// The caller must already be authenticated; the socket starts out in `board_id`'s room.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Query(query): Query<ConnectQuery>,
) -> Result<Response, AppError> {
    let board_id = query
        .board_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::BadRequest("board_id is required".to_string()))?;

    info!(
        user_id = %identity.user_id,
        board_id = %board_id,
        "New client connecting"
    );
    let max_message_size = state.config.ws.max_message_size;
    Ok(ws
        .max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state, identity, board_id)))
}

/// Issues exactly one `Unregister` when dropped, whatever ended the connection.
struct Registration {
    hub: HubHandle,
    connection_id: ConnectionId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.hub.unregister(self.connection_id);
    }
}

/// Manages the lifecycle of one socket: register, run both pumps, unregister.
pub async fn handle_socket(socket: WebSocket, state: AppState, identity: Identity, board_id: String) {
    let settings = state.config.ws.clone();
    let (sink, stream) = socket.split();
    let (connection, outbound) = Connection::new(identity, settings.outbound_capacity);
    let connection_id = connection.id();

    state.hub.register(Arc::clone(&connection), board_id.clone());
    let registration = Registration {
        hub: state.hub.clone(),
        connection_id,
    };

    let mut write_task = tokio::spawn(write_pump(sink, outbound, connection_id, settings.clone()));
    let mut read_task = tokio::spawn(read_pump(stream, Arc::clone(&connection), state, board_id));

    tokio::select! {
        _ = &mut read_task => {
            drop(registration);
            // The unregister above closes the queue; give the writer time to send the close frame.
            if timeout(settings.write_wait, &mut write_task).await.is_err() {
                debug!(connection_id = %connection_id, "Write pump did not stop in time");
                write_task.abort();
            }
        }
        _ = &mut write_task => {
            read_task.abort();
            drop(registration);
        }
    }

    info!(
        connection_id = %connection_id,
        user_id = %connection.user_id(),
        "Client disconnected"
    );
}

/// Reads frames until the socket closes, errors, or goes quiet for longer than `pong_wait`.
async fn read_pump(
    mut stream: SplitStream<WebSocket>,
    connection: Arc<Connection>,
    state: AppState,
    board_id: String,
) {
    let pong_wait = state.config.ws.pong_wait;
    let connection_id = connection.id();
    let mut session = Session::new(connection, Some(board_id));

    loop {
        let frame = match timeout(pong_wait, stream.next()).await {
            Err(_) => {
                warn!(connection_id = %connection_id, "Read deadline expired");
                break;
            }
            Ok(None) => {
                debug!(connection_id = %connection_id, "WebSocket stream ended");
                break;
            }
            Ok(Some(Err(e))) => {
                warn!(connection_id = %connection_id, error = %e, "WebSocket receive error");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Message::Text(text) => session.handle_text(text.as_str(), &state).await,
            Message::Binary(_) => session.reject(&ProtocolError::Validation(
                "Binary frames are not supported".to_string(),
            )),
            // Any frame resets the deadline; pings are answered by the socket itself.
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(frame) => {
                info!(connection_id = %connection_id, reason = ?frame, "Client initiated close");
                break;
            }
        }
    }
}

/// Drains the outbound queue to the socket and keeps the connection alive with pings.
async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    outbound: Outbound,
    connection_id: ConnectionId,
    settings: WsSettings,
) {
    let Outbound {
        mut messages,
        mut close,
    } = outbound;
    let mut keepalive = time::interval_at(Instant::now() + settings.ping_period, settings.ping_period);

    let close_reason = loop {
        tokio::select! {
            biased;

            reason = wait_for_close(&mut close) => break Some(reason),
            next = messages.recv() => {
                let Some(message) = next else {
                    break None;
                };
                let text = match serde_json::to_string(message.as_ref()) {
                    Ok(text) => text,
                    Err(e) => {
                        error!(connection_id = %connection_id, error = %e, "Failed to serialize message");
                        continue;
                    }
                };
                if let Err(e) = write_frame(&mut sink, Message::Text(text.into()), &settings).await {
                    warn!(connection_id = %connection_id, error = %e, "Error writing message");
                    return;
                }
            }
            _ = keepalive.tick() => {
                if let Err(e) = write_frame(&mut sink, Message::Ping(Bytes::new()), &settings).await {
                    warn!(connection_id = %connection_id, error = %e, "Error writing ping");
                    return;
                }
            }
        }
    };

    let frame = close_reason.map(|reason| CloseFrame {
        code: reason.code(),
        reason: reason.reason().into(),
    });
    if let Err(e) = write_frame(&mut sink, Message::Close(frame), &settings).await {
        debug!(connection_id = %connection_id, error = %e, "Close frame not delivered");
    }
    debug!(connection_id = %connection_id, reason = ?close_reason, "Write pump stopped");
}

async fn write_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    frame: Message,
    settings: &WsSettings,
) -> Result<(), TransportError> {
    match timeout(settings.write_wait, sink.send(frame)).await {
        Ok(result) => result.map_err(TransportError::from),
        Err(_) => Err(TransportError::WriteTimeout),
    }
}

/// Per-connection protocol state: which room the connection is in, and how each frame is handled.
pub struct Session {
    connection: Arc<Connection>,
    room: Option<String>,
}

impl Session {
    pub fn new(connection: Arc<Connection>, room: Option<String>) -> Self {
        Self { connection, room }
    }

    pub fn room(&self) -> Option<&str> {
        self.room.as_deref()
    }

    pub async fn handle_text(&mut self, text: &str, state: &AppState) {
        match ClientMessage::decode(text) {
            Ok(message) => self.dispatch(message, state).await,
            Err(e) => {
                debug!(connection_id = %self.connection.id(), error = %e, "Rejected frame");
                self.reject(&e);
            }
        }
    }

    pub async fn dispatch(&mut self, message: ClientMessage, state: &AppState) {
        match message {
            ClientMessage::Message {
                board_id,
                content,
                mentions,
            } => self.handle_chat(board_id, content, mentions, state).await,
            ClientMessage::Ping { .. } => {
                self.connection.reply(ServerMessage::Pong {
                    timestamp: Utc::now().timestamp(),
                });
            }
            ClientMessage::Join { board_id } => self.handle_join(board_id, &state.hub),
            ClientMessage::Leave { board_id } => self.handle_leave(board_id, &state.hub),
        }
    }

    pub fn reject(&self, error: &ProtocolError) {
        self.connection.reply(ServerMessage::from(error));
    }

    /// Persists first, within `persist_timeout`; only a stored message is broadcast.
    async fn handle_chat(
        &mut self,
        board_id: Option<String>,
        content: String,
        mentions: Vec<String>,
        state: &AppState,
    ) {
        let Some(board_id) = board_id.or_else(|| self.room.clone()) else {
            self.reject(&ProtocolError::Validation("board_id is required".to_string()));
            return;
        };

        let message = NewMessage {
            board_id: board_id.clone(),
            user_id: self.connection.user_id().to_string(),
            username: self.connection.username().to_string(),
            content,
            mentions,
        };

        let persist_timeout = state.config.ws.persist_timeout;
        let saved = match timeout(persist_timeout, state.store.save_message(message)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(persist_timeout)),
        };

        match saved {
            Ok(saved) => {
                debug!(
                    connection_id = %self.connection.id(),
                    message_id = %saved.id,
                    board_id = %board_id,
                    "Message persisted"
                );
                state
                    .hub
                    .broadcast(board_id, ServerMessage::Message(saved), None);
            }
            Err(e) => {
                error!(
                    connection_id = %self.connection.id(),
                    board_id = %board_id,
                    error = %e,
                    "Failed to save message"
                );
                self.connection.reply(ServerMessage::Error {
                    message: "Failed to save message".to_string(),
                    code: Some("persistence".to_string()),
                });
            }
        }
    }

    fn handle_join(&mut self, board_id: String, hub: &HubHandle) {
        if let Some(current) = self.room.as_deref() {
            if current != board_id {
                hub.leave(self.connection.id(), current);
            }
        }
        hub.register(Arc::clone(&self.connection), board_id.clone());
        self.room = Some(board_id.clone());
        self.connection.reply(ServerMessage::Joined { board_id });
    }

    fn handle_leave(&mut self, board_id: Option<String>, hub: &HubHandle) {
        let Some(board_id) = board_id.or_else(|| self.room.clone()) else {
            self.reject(&ProtocolError::Validation("board_id is required".to_string()));
            return;
        };

        if self.room.as_deref() == Some(board_id.as_str()) {
            hub.leave(self.connection.id(), board_id.clone());
            self.room = None;
        }
        self.connection.reply(ServerMessage::Left { board_id });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::JwtResolver,
        config::Config,
        database::{MemoryMessageStore, MessageStore},
        error::StoreError,
        hub::Hub,
        models::ChatMessage,
    };
    use async_trait::async_trait;
    use std::time::Duration;

    struct FailingStore;

    #[async_trait]
    impl MessageStore for FailingStore {
        async fn save_message(&self, _message: NewMessage) -> Result<ChatMessage, StoreError> {
            Err(StoreError::Unavailable("disk on fire".to_string()))
        }

        async fn list_messages(
            &self,
            _board_id: &str,
            _limit: i64,
            _offset: i64,
        ) -> Result<Vec<ChatMessage>, StoreError> {
            Ok(Vec::new())
        }

        async fn count_messages(&self, _board_id: &str) -> Result<i64, StoreError> {
            Ok(0)
        }

        async fn get_message(&self, _id: &str) -> Result<Option<ChatMessage>, StoreError> {
            Ok(None)
        }
    }

    /// Never answers a save.
    struct StuckStore;

    #[async_trait]
    impl MessageStore for StuckStore {
        async fn save_message(&self, _message: NewMessage) -> Result<ChatMessage, StoreError> {
            std::future::pending().await
        }

        async fn list_messages(
            &self,
            _board_id: &str,
            _limit: i64,
            _offset: i64,
        ) -> Result<Vec<ChatMessage>, StoreError> {
            Ok(Vec::new())
        }

        async fn count_messages(&self, _board_id: &str) -> Result<i64, StoreError> {
            Ok(0)
        }

        async fn get_message(&self, _id: &str) -> Result<Option<ChatMessage>, StoreError> {
            Ok(None)
        }
    }

    fn test_state(store: Arc<dyn MessageStore>) -> AppState {
        test_state_with(store, Config::default())
    }

    fn test_state_with(store: Arc<dyn MessageStore>, config: Config) -> AppState {
        let (hub, _task) = Hub::spawn();
        AppState::new(hub, store, Arc::new(JwtResolver::new("secret")), config)
    }

    fn connect(user_id: &str, username: &str) -> (Arc<Connection>, Outbound) {
        Connection::new(
            Identity {
                user_id: user_id.to_string(),
                username: username.to_string(),
            },
            16,
        )
    }

    async fn next(outbound: &mut Outbound) -> ServerMessage {
        outbound
            .messages
            .recv()
            .await
            .map(|message| message.as_ref().clone())
            .unwrap()
    }

    fn error_code(message: &ServerMessage) -> Option<&str> {
        match message {
            ServerMessage::Error { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    #[tokio::test]
    async fn chat_message_is_persisted_then_broadcast_to_the_room() {
        let store = Arc::new(MemoryMessageStore::new());
        let state = test_state(store.clone());
        let (a, mut out_a) = connect("1", "alice");
        let (b, mut out_b) = connect("2", "bob");
        state.hub.register(a.clone(), "42");
        state.hub.register(b.clone(), "42");

        let mut session = Session::new(a.clone(), Some("42".to_string()));
        session
            .handle_text(r#"{"type":"message","payload":{"content":"hi"}}"#, &state)
            .await;

        let stored = store.list_messages("42", 10, 0).await.unwrap();
        assert_eq!(stored.len(), 1);
        let stored = &stored[0];

        for outbound in [&mut out_a, &mut out_b] {
            let ServerMessage::Message(received) = next(outbound).await else {
                panic!("expected a chat message");
            };
            assert_eq!(received.id, stored.id);
            assert_eq!(received.board_id, "42");
            assert_eq!(received.user_id, "1");
            assert_eq!(received.username, "alice");
            assert_eq!(received.content, "hi");
            assert_eq!(received.created_at, stored.created_at);
        }
    }

    #[tokio::test]
    async fn explicit_board_id_overrides_current_room() {
        let store = Arc::new(MemoryMessageStore::new());
        let state = test_state(store.clone());
        let (a, _out_a) = connect("1", "alice");
        let (b, mut out_b) = connect("2", "bob");
        state.hub.register(a.clone(), "42");
        state.hub.register(b.clone(), "43");

        let mut session = Session::new(a.clone(), Some("42".to_string()));
        session
            .handle_text(
                r#"{"type":"message","payload":{"board_id":43,"content":"over here","mentions":["bob"]}}"#,
                &state,
            )
            .await;

        let ServerMessage::Message(received) = next(&mut out_b).await else {
            panic!("expected a chat message");
        };
        assert_eq!(received.board_id, "43");
        assert_eq!(received.mentions, vec!["bob".to_string()]);
        assert_eq!(store.count_messages("43").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn empty_content_never_reaches_store_or_room() {
        let store = Arc::new(MemoryMessageStore::new());
        let state = test_state(store.clone());
        let (a, mut out_a) = connect("1", "alice");
        let (b, mut out_b) = connect("2", "bob");
        state.hub.register(a.clone(), "42");
        state.hub.register(b.clone(), "42");

        let mut session = Session::new(a.clone(), Some("42".to_string()));
        session
            .handle_text(r#"{"type":"message","payload":{"content":""}}"#, &state)
            .await;

        let reply = next(&mut out_a).await;
        assert_eq!(
            reply,
            ServerMessage::Error {
                message: "Content is required".to_string(),
                code: Some("validation".to_string()),
            }
        );
        assert_eq!(store.count_messages("42").await.unwrap(), 0);
        assert_eq!(state.hub.room_size("42").await, 2);
        assert!(out_b.messages.try_recv().is_err());
    }

    #[tokio::test]
    async fn persistence_failure_is_reported_and_not_broadcast() {
        let state = test_state(Arc::new(FailingStore));
        let (a, mut out_a) = connect("1", "alice");
        let (b, mut out_b) = connect("2", "bob");
        state.hub.register(a.clone(), "42");
        state.hub.register(b.clone(), "42");

        let mut session = Session::new(a.clone(), Some("42".to_string()));
        session
            .handle_text(r#"{"type":"message","payload":{"content":"hi"}}"#, &state)
            .await;

        assert_eq!(error_code(&next(&mut out_a).await), Some("persistence"));
        assert_eq!(state.hub.room_size("42").await, 2);
        assert!(out_a.messages.try_recv().is_err());
        assert!(out_b.messages.try_recv().is_err());
    }

    #[tokio::test]
    async fn stalled_store_times_out_without_broadcast() {
        let mut config = Config::default();
        config.ws.persist_timeout = Duration::from_millis(50);
        let state = test_state_with(Arc::new(StuckStore), config);
        let (a, mut out_a) = connect("1", "alice");
        let (b, mut out_b) = connect("2", "bob");
        state.hub.register(a.clone(), "42");
        state.hub.register(b.clone(), "42");

        let mut session = Session::new(a.clone(), Some("42".to_string()));
        timeout(
            Duration::from_secs(2),
            session.handle_text(r#"{"type":"message","payload":{"content":"hi"}}"#, &state),
        )
        .await
        .expect("handle_text should give up on the store");

        assert_eq!(
            next(&mut out_a).await,
            ServerMessage::Error {
                message: "Failed to save message".to_string(),
                code: Some("persistence".to_string()),
            }
        );
        assert_eq!(state.hub.room_size("42").await, 2);
        assert!(out_a.messages.try_recv().is_err());
        assert!(out_b.messages.try_recv().is_err());
    }

    #[tokio::test]
    async fn message_without_any_room_is_rejected() {
        let state = test_state(Arc::new(MemoryMessageStore::new()));
        let (a, mut out_a) = connect("1", "alice");

        let mut session = Session::new(a, None);
        session
            .handle_text(r#"{"type":"message","payload":{"content":"hi"}}"#, &state)
            .await;

        assert_eq!(
            next(&mut out_a).await,
            ServerMessage::Error {
                message: "board_id is required".to_string(),
                code: Some("validation".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn ping_is_answered_directly() {
        let state = test_state(Arc::new(MemoryMessageStore::new()));
        let (a, mut out_a) = connect("1", "alice");

        let before = Utc::now().timestamp();
        let mut session = Session::new(a, None);
        session
            .handle_text(r#"{"type":"ping","payload":{"timestamp":1}}"#, &state)
            .await;

        let ServerMessage::Pong { timestamp } = next(&mut out_a).await else {
            panic!("expected pong");
        };
        assert!(timestamp >= before);
    }

    #[tokio::test]
    async fn join_switches_rooms_and_leave_restores_state() {
        let state = test_state(Arc::new(MemoryMessageStore::new()));
        let (a, mut out_a) = connect("1", "alice");
        state.hub.register(a.clone(), "1");

        let mut session = Session::new(a.clone(), Some("1".to_string()));
        session
            .handle_text(r#"{"type":"join","payload":{"board_id":"7"}}"#, &state)
            .await;

        assert_eq!(
            next(&mut out_a).await,
            ServerMessage::Joined {
                board_id: "7".to_string()
            }
        );
        assert_eq!(session.room(), Some("7"));
        assert_eq!(state.hub.room_size("1").await, 0);
        assert_eq!(state.hub.room_size("7").await, 1);

        session
            .handle_text(r#"{"type":"leave","payload":{"board_id":"7"}}"#, &state)
            .await;

        assert_eq!(
            next(&mut out_a).await,
            ServerMessage::Left {
                board_id: "7".to_string()
            }
        );
        assert_eq!(session.room(), None);
        assert_eq!(state.hub.room_size("7").await, 0);
        assert!(!a.is_closing());
    }

    #[tokio::test]
    async fn leaving_another_room_keeps_membership() {
        let state = test_state(Arc::new(MemoryMessageStore::new()));
        let (a, mut out_a) = connect("1", "alice");
        state.hub.register(a.clone(), "1");

        let mut session = Session::new(a, Some("1".to_string()));
        session
            .handle_text(r#"{"type":"leave","payload":{"board_id":"2"}}"#, &state)
            .await;

        assert_eq!(
            next(&mut out_a).await,
            ServerMessage::Left {
                board_id: "2".to_string()
            }
        );
        assert_eq!(session.room(), Some("1"));
        assert_eq!(state.hub.room_size("1").await, 1);
    }

    #[tokio::test]
    async fn protocol_errors_keep_the_connection_open() {
        let state = test_state(Arc::new(MemoryMessageStore::new()));
        let (a, mut out_a) = connect("1", "alice");
        state.hub.register(a.clone(), "1");

        let mut session = Session::new(a.clone(), Some("1".to_string()));
        session.handle_text("{{{", &state).await;
        session
            .handle_text(r#"{"type":"teleport","payload":{}}"#, &state)
            .await;

        assert_eq!(error_code(&next(&mut out_a).await), Some("invalid_format"));
        let unknown = next(&mut out_a).await;
        assert_eq!(error_code(&unknown), Some("unknown_type"));
        assert!(matches!(
            unknown,
            ServerMessage::Error { ref message, .. } if message == "Unknown message type: teleport"
        ));
        assert_eq!(state.hub.room_size("1").await, 1);
        assert!(!a.is_closing());
    }
}
