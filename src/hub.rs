// src/hub.rs

//! The connection hub: a single task that owns every room and performs all
//! broadcast fan-out. Everything else talks to it through [`HubHandle`].

use crate::{
    models::ServerMessage,
    state::{CloseReason, Connection, ConnectionId},
};
use std::{
    collections::{HashMap, HashSet},
    ops::ControlFlow,
    sync::Arc,
};
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot,
    },
    task::JoinHandle,
};
use tracing::{debug, info, warn};

/// Events consumed by the hub loop, in the order they were sent.
#[derive(Debug)]
pub enum HubCommand {
    Register {
        connection: Arc<Connection>,
        room: String,
    },
    /// Membership-only removal; the connection stays open.
    Leave {
        connection_id: ConnectionId,
        room: String,
    },
    /// Final removal; the connection is told to close.
    Unregister { connection_id: ConnectionId },
    Broadcast {
        room: String,
        message: ServerMessage,
        exclude: Option<ConnectionId>,
    },
    RoomSize {
        room: String,
        reply: oneshot::Sender<usize>,
    },
    Shutdown,
}

struct Member {
    connection: Arc<Connection>,
    room: Option<String>,
}

/// Room registry. Only mutated from inside [`Hub::run`].
pub struct Hub {
    rooms: HashMap<String, HashSet<ConnectionId>>,
    clients: HashMap<ConnectionId, Member>,
    commands: mpsc::UnboundedReceiver<HubCommand>,
}

impl Hub {
    pub fn new() -> (Hub, HubHandle) {
        let (tx, commands) = mpsc::unbounded_channel();
        let hub = Hub {
            rooms: HashMap::new(),
            clients: HashMap::new(),
            commands,
        };
        (hub, HubHandle { tx })
    }

    /// Creates a hub and runs it on its own task.
    pub fn spawn() -> (HubHandle, JoinHandle<()>) {
        let (hub, handle) = Hub::new();
        (handle, tokio::spawn(hub.run()))
    }

    pub async fn run(mut self) {
        info!("Hub started");
        while let Some(command) = self.commands.recv().await {
            if self.handle(command).is_break() {
                break;
            }
        }
        self.shutdown();
        info!("Hub stopped");
    }

    pub fn handle(&mut self, command: HubCommand) -> ControlFlow<()> {
        match command {
            HubCommand::Register { connection, room } => self.register(connection, room),
            HubCommand::Leave {
                connection_id,
                room,
            } => self.leave(connection_id, &room),
            HubCommand::Unregister { connection_id } => {
                self.unregister(connection_id, CloseReason::Unregistered)
            }
            HubCommand::Broadcast {
                room,
                message,
                exclude,
            } => {
                self.broadcast(&room, message, exclude);
            }
            HubCommand::RoomSize { room, reply } => {
                let _ = reply.send(self.room_size(&room));
            }
            HubCommand::Shutdown => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    /// Adds the connection to `room`, moving it out of any other room first.
    /// A connection that has already been told to close is never let back in.
    pub fn register(&mut self, connection: Arc<Connection>, room: String) {
        let id = connection.id();
        if connection.is_closing() {
            debug!(connection_id = %id, room = %room, "Ignoring register for closing connection");
            return;
        }
        let previous = match self.clients.get_mut(&id) {
            Some(member) if member.room.as_deref() == Some(room.as_str()) => return,
            Some(member) => member.room.replace(room.clone()),
            None => {
                self.clients.insert(
                    id,
                    Member {
                        connection: Arc::clone(&connection),
                        room: Some(room.clone()),
                    },
                );
                None
            }
        };
        if let Some(previous) = previous {
            self.remove_from_room(id, &previous);
        }

        self.rooms.entry(room.clone()).or_default().insert(id);
        info!(
            connection_id = %id,
            user_id = %connection.user_id(),
            room = %room,
            members = self.room_size(&room),
            "Client registered"
        );
    }

    /// Takes the connection out of `room` without closing it.
    pub fn leave(&mut self, id: ConnectionId, room: &str) {
        let Some(member) = self.clients.get_mut(&id) else {
            return;
        };
        if member.room.as_deref() != Some(room) {
            return;
        }
        member.room = None;
        self.remove_from_room(id, room);
        info!(connection_id = %id, room = %room, "Client left room");
    }

    /// Forgets the connection entirely and tells it to close. Repeated calls are no-ops.
    pub fn unregister(&mut self, id: ConnectionId, reason: CloseReason) {
        let Some(member) = self.clients.remove(&id) else {
            return;
        };
        if let Some(room) = &member.room {
            self.remove_from_room(id, room);
        }
        member.connection.close(reason);
        info!(
            connection_id = %id,
            user_id = %member.connection.user_id(),
            room = ?member.room,
            reason = ?reason,
            "Client unregistered"
        );
    }

    /// Enqueues `message` for every member of `room` except `exclude`.
    /// Members whose queue is full are dropped. Returns the number of deliveries.
    pub fn broadcast(
        &mut self,
        room: &str,
        message: ServerMessage,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let Some(members) = self.rooms.get(room) else {
            debug!(room = %room, "Broadcast to empty room");
            return 0;
        };

        let message = Arc::new(message);
        let mut delivered = 0;
        let mut dropped = Vec::new();
        for id in members {
            if Some(*id) == exclude {
                continue;
            }
            let Some(member) = self.clients.get(id) else {
                continue;
            };
            match member.connection.try_send(Arc::clone(&message)) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(connection_id = %id, room = %room, "Outbound queue full, dropping client");
                    dropped.push(*id);
                }
                Err(TrySendError::Closed(_)) => dropped.push(*id),
            }
        }

        for id in dropped {
            self.unregister(id, CloseReason::SlowConsumer);
        }
        debug!(room = %room, delivered, "Broadcast complete");
        delivered
    }

    pub fn room_size(&self, room: &str) -> usize {
        self.rooms.get(room).map_or(0, HashSet::len)
    }

    #[cfg(test)]
    fn room_of(&self, id: ConnectionId) -> Option<&str> {
        self.clients.get(&id).and_then(|member| member.room.as_deref())
    }

    #[cfg(test)]
    fn is_registered(&self, id: ConnectionId) -> bool {
        self.clients.contains_key(&id)
    }

    #[cfg(test)]
    fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Closes every known connection and clears all rooms.
    pub fn shutdown(&mut self) {
        let count = self.clients.len();
        for (_, member) in self.clients.drain() {
            member.connection.close(CloseReason::Shutdown);
        }
        self.rooms.clear();
        if count > 0 {
            info!(connections = count, "Hub closed all connections");
        }
    }

    fn remove_from_room(&mut self, id: ConnectionId, room: &str) {
        if let Some(members) = self.rooms.get_mut(room) {
            members.remove(&id);
            if members.is_empty() {
                self.rooms.remove(room);
                debug!(room = %room, "Room is empty, removing it");
            }
        }
    }
}

/// Cloneable sender side of the hub's intake.
#[derive(Clone, Debug)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubCommand>,
}

impl HubHandle {
    fn send(&self, command: HubCommand) {
        if self.tx.send(command).is_err() {
            debug!("Hub is not running, command dropped");
        }
    }

    pub fn register(&self, connection: Arc<Connection>, room: impl Into<String>) {
        self.send(HubCommand::Register {
            connection,
            room: room.into(),
        });
    }

    pub fn leave(&self, connection_id: ConnectionId, room: impl Into<String>) {
        self.send(HubCommand::Leave {
            connection_id,
            room: room.into(),
        });
    }

    pub fn unregister(&self, connection_id: ConnectionId) {
        self.send(HubCommand::Unregister { connection_id });
    }

    pub fn broadcast(
        &self,
        room: impl Into<String>,
        message: ServerMessage,
        exclude: Option<ConnectionId>,
    ) {
        self.send(HubCommand::Broadcast {
            room: room.into(),
            message,
            exclude,
        });
    }

    /// Number of connections currently in `room`; 0 once the hub has stopped.
    pub async fn room_size(&self, room: impl Into<String>) -> usize {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::RoomSize {
            room: room.into(),
            reply,
        });
        rx.await.unwrap_or(0)
    }

    pub fn shutdown(&self) {
        self.send(HubCommand::Shutdown);
    }
}
