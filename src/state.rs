// src/state.rs

use crate::{
    auth::{Identity, IdentityResolver},
    config::Config,
    database::MessageStore,
    hub::HubHandle,
    models::ServerMessage,
};
use axum::extract::ws::close_code;
use std::{fmt, sync::Arc};
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    watch,
};
use uuid::Uuid;

/// Process-unique id of one accepted socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Why a connection is being closed. Sent to the write pump through the close signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    Unregistered,
    /// The outbound queue was full when a broadcast arrived.
    SlowConsumer,
    Shutdown,
}

impl CloseReason {
    pub fn code(self) -> u16 {
        match self {
            Self::Unregistered => close_code::NORMAL,
            Self::SlowConsumer => close_code::POLICY,
            Self::Shutdown => close_code::AWAY,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Self::Unregistered => "",
            Self::SlowConsumer => "connection too slow",
            Self::Shutdown => "server shutting down",
        }
    }
}

/// Server-side handle for one client's live socket.
///
/// Shared between the hub (which enqueues broadcasts) and the connection's
/// read pump (which enqueues direct replies). The write pump owns the
/// receiving half, see [`Outbound`].
pub struct Connection {
    id: ConnectionId,
    identity: Identity,
    sender: mpsc::Sender<Arc<ServerMessage>>,
    close: watch::Sender<Option<CloseReason>>,
}

/// Receiving side of a connection's queue and close signal.
pub struct Outbound {
    pub messages: mpsc::Receiver<Arc<ServerMessage>>,
    pub close: watch::Receiver<Option<CloseReason>>,
}

impl Outbound {
    /// Resolves once the connection has been told to close.
    pub async fn closed(&mut self) -> CloseReason {
        wait_for_close(&mut self.close).await
    }
}

/// Resolves once a close reason is set. A dropped connection counts as unregistered.
pub async fn wait_for_close(close: &mut watch::Receiver<Option<CloseReason>>) -> CloseReason {
    match close.wait_for(Option::is_some).await {
        Ok(reason) => (*reason).unwrap_or(CloseReason::Unregistered),
        Err(_) => CloseReason::Unregistered,
    }
}

impl Connection {
    pub fn new(identity: Identity, capacity: usize) -> (Arc<Self>, Outbound) {
        let (sender, messages) = mpsc::channel(capacity);
        let (close, close_rx) = watch::channel(None);
        let connection = Arc::new(Connection {
            id: ConnectionId::new(),
            identity,
            sender,
            close,
        });
        (
            connection,
            Outbound {
                messages,
                close: close_rx,
            },
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.identity.user_id
    }

    pub fn username(&self) -> &str {
        &self.identity.username
    }

    /// Non-blocking enqueue used by the hub for broadcasts.
    pub fn try_send(&self, message: Arc<ServerMessage>) -> Result<(), TrySendError<Arc<ServerMessage>>> {
        self.sender.try_send(message)
    }

    /// Enqueues a direct reply. A full queue drops the reply rather than stalling the read pump.
    pub fn reply(&self, message: ServerMessage) -> bool {
        match self.sender.try_send(Arc::new(message)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(connection_id = %self.id, "outbound queue full, dropping reply");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Signals the write pump to send a close frame and stop. The first reason wins.
    pub fn close(&self, reason: CloseReason) {
        self.close.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    pub fn is_closing(&self) -> bool {
        self.close.borrow().is_some()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.identity.user_id)
            .field("username", &self.identity.username)
            .finish()
    }
}

/// The application's shared state, handed to every request handler and connection.
#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub store: Arc<dyn MessageStore>,
    pub identity: Arc<dyn IdentityResolver>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(
        hub: HubHandle,
        store: Arc<dyn MessageStore>,
        identity: Arc<dyn IdentityResolver>,
        config: Config,
    ) -> Self {
        Self {
            hub,
            store,
            identity,
            config: Arc::new(config),
        }
    }
}
