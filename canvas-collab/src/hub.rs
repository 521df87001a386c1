//! Room-scoped fan-out coordinator.
//!
//! ```text
//!  receive tasks ──┐                                  ┌──► client queue ──► send task
//!  REST helpers  ──┼──► HubHandle ──► command queue ──► Hub::run ──► client queue ──► send task
//!                  │      (clone)       (ordered)      (HubState)   └──► client queue ──► send task
//! ```
//!
//! All membership state lives in [`HubState`] and is touched only by the
//! coordinator task, one command at a time. Nothing here takes a lock.
//!
//! Backpressure: each client's outbound queue is bounded. A broadcast that
//! finds a queue full evicts that client on the spot instead of waiting.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::CollabError;
use crate::protocol::{Message, RoomId, UserId};

/// Per-connection identifier. One user may hold several connections.
pub type ClientId = Uuid;

/// Item type of a client's outbound queue. Shared by every recipient of a fan-out.
pub type Outbound = Arc<Message>;

/// Pending messages each client may buffer before it counts as unresponsive.
pub const DEFAULT_CLIENT_QUEUE_CAPACITY: usize = 256;

/// Pending register/unregister/broadcast commands before callers wait.
pub const DEFAULT_COMMAND_CAPACITY: usize = 1024;

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Bound of the coordinator's command queue
    pub command_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            command_capacity: DEFAULT_COMMAND_CAPACITY,
        }
    }
}

/// The hub's half of a connected client.
///
/// Holds the sending side of the client's outbound queue. Dropping the
/// handle closes the queue, which is the send task's signal to hang up.
/// A connection that must stop reading as well (eviction, shutdown)
/// attaches a hangup channel with [`ClientHandle::with_hangup`]; it fires
/// whenever the hub lets go of the client.
#[derive(Debug)]
pub struct ClientHandle {
    pub id: ClientId,
    pub user_id: UserId,
    pub room_id: RoomId,
    queue: mpsc::Sender<Outbound>,
    hangup: Option<oneshot::Sender<()>>,
}

impl ClientHandle {
    pub fn new(
        id: ClientId,
        user_id: impl Into<UserId>,
        room_id: impl Into<RoomId>,
        queue: mpsc::Sender<Outbound>,
    ) -> Self {
        Self {
            id,
            user_id: user_id.into(),
            room_id: room_id.into(),
            queue,
            hangup: None,
        }
    }

    /// Signal `hangup` when this client leaves the hub for any reason.
    pub fn with_hangup(mut self, hangup: oneshot::Sender<()>) -> Self {
        self.hangup = Some(hangup);
        self
    }

    fn hang_up(&mut self) {
        if let Some(hangup) = self.hangup.take() {
            // The connection may already be gone.
            let _ = hangup.send(());
        }
    }
}

/// A room member as reported by membership queries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Member {
    pub id: ClientId,
    pub user_id: UserId,
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Queues the message was placed on
    pub delivered: usize,
    /// Clients dropped because their queue was full or gone
    pub evicted: Vec<ClientId>,
}

/// Hub statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub clients: usize,
    pub rooms: usize,
    pub messages_broadcast: u64,
    pub deliveries: u64,
    pub evictions: u64,
}

/// Membership state. Single writer: the coordinator.
///
/// Invariants:
/// - a client is in `rooms[r]` iff it is in `clients` with `room_id == r`
/// - `rooms` never holds an empty member set
#[derive(Debug, Default)]
pub struct HubState {
    clients: HashMap<ClientId, ClientHandle>,
    rooms: HashMap<RoomId, HashSet<ClientId>>,
    messages_broadcast: u64,
    deliveries: u64,
    evictions: u64,
}

impl HubState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client to the global set and to its room, creating the room if needed.
    pub fn register(&mut self, client: ClientHandle) {
        // Re-registering an id must not leave it behind in a previous room.
        if self.clients.contains_key(&client.id) {
            self.detach(client.id);
        }

        log::info!(
            "Client {} ({}) joined room {}",
            client.user_id,
            client.id,
            client.room_id
        );
        self.rooms
            .entry(client.room_id.clone())
            .or_default()
            .insert(client.id);
        self.clients.insert(client.id, client);
    }

    /// Remove a client and close its queue. Returns `false` if it was already gone.
    pub fn unregister(&mut self, id: ClientId) -> bool {
        match self.detach(id) {
            Some(client) => {
                log::info!(
                    "Client {} ({}) left room {}",
                    client.user_id,
                    client.id,
                    client.room_id
                );
                true
            }
            None => false,
        }
    }

    /// Fan a message out to every member of its room.
    ///
    /// Never blocks: a member whose queue is full (or whose send task has
    /// already exited) is evicted instead. Eviction candidates are collected
    /// first and removed after the member set has been walked.
    pub fn broadcast(&mut self, message: Message) -> BroadcastReport {
        let Some(members) = self.rooms.get(&message.design_id) else {
            log::trace!(
                "Dropping {} for room {} (no members)",
                message.kind(),
                message.design_id
            );
            return BroadcastReport::default();
        };

        let message = Arc::new(message);
        let mut report = BroadcastReport::default();

        for id in members {
            let Some(client) = self.clients.get(id) else {
                continue;
            };
            match client.queue.try_send(Arc::clone(&message)) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    log::warn!(
                        "Evicting client {} ({}) from room {}: outbound queue full",
                        client.user_id,
                        client.id,
                        client.room_id
                    );
                    report.evicted.push(*id);
                }
                Err(TrySendError::Closed(_)) => {
                    log::debug!(
                        "Evicting client {} ({}) from room {}: send task gone",
                        client.user_id,
                        client.id,
                        client.room_id
                    );
                    report.evicted.push(*id);
                }
            }
        }

        for id in &report.evicted {
            self.detach(*id);
        }

        self.messages_broadcast += 1;
        self.deliveries += report.delivered as u64;
        self.evictions += report.evicted.len() as u64;

        log::trace!(
            "Broadcast {} to room {}: {} delivered, {} evicted",
            message.kind(),
            message.design_id,
            report.delivered,
            report.evicted.len()
        );
        report
    }

    /// Current members of a room (empty if the room does not exist).
    pub fn members(&self, room_id: &str) -> Vec<Member> {
        self.rooms
            .get(room_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.clients.get(id))
            .map(|client| Member {
                id: client.id,
                user_id: client.user_id.clone(),
            })
            .collect()
    }

    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.keys().cloned().collect()
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        self.clients.contains_key(id)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            clients: self.clients.len(),
            rooms: self.rooms.len(),
            messages_broadcast: self.messages_broadcast,
            deliveries: self.deliveries,
            evictions: self.evictions,
        }
    }

    /// Drop every client, closing all outbound queues.
    pub fn close_all(&mut self) {
        self.rooms.clear();
        for (_, mut client) in self.clients.drain() {
            log::debug!("Closing client {} ({})", client.user_id, client.id);
            client.hang_up();
        }
    }

    fn detach(&mut self, id: ClientId) -> Option<ClientHandle> {
        let mut client = self.clients.remove(&id)?;
        client.hang_up();
        if let Some(members) = self.rooms.get_mut(&client.room_id) {
            members.remove(&id);
            if members.is_empty() {
                self.rooms.remove(&client.room_id);
                log::debug!("Room {} removed (empty)", client.room_id);
            }
        }
        Some(client)
    }
}

enum HubCommand {
    Register(ClientHandle),
    Unregister(ClientId),
    Broadcast(Message),
    Members {
        room_id: RoomId,
        reply: oneshot::Sender<Vec<Member>>,
    },
    Stats(oneshot::Sender<HubStats>),
    Shutdown,
}

/// The coordinator. Owns [`HubState`] and consumes commands in order.
pub struct Hub {
    state: HubState,
    commands: mpsc::Receiver<HubCommand>,
}

impl Hub {
    /// Create a hub and the handle used to talk to it.
    ///
    /// Nothing runs until [`Hub::run`] or [`Hub::start`] is called.
    pub fn new(config: HubConfig) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::channel(config.command_capacity.max(1));
        let hub = Self {
            state: HubState::new(),
            commands: rx,
        };
        (hub, HubHandle { commands: tx })
    }

    /// Spawn the coordinator loop on the current runtime.
    pub fn start(self) -> JoinHandle<HubStats> {
        tokio::spawn(self.run())
    }

    /// Coordinator loop.
    ///
    /// Runs until [`HubHandle::shutdown`] is called or every handle is
    /// dropped. On exit all clients are dropped, so every send task sees
    /// its queue close. Returns the final statistics.
    pub async fn run(mut self) -> HubStats {
        log::info!("Hub coordinator started");

        while let Some(command) = self.commands.recv().await {
            match command {
                HubCommand::Register(client) => self.state.register(client),
                HubCommand::Unregister(id) => {
                    self.state.unregister(id);
                }
                HubCommand::Broadcast(message) => {
                    self.state.broadcast(message);
                }
                HubCommand::Members { room_id, reply } => {
                    let _ = reply.send(self.state.members(&room_id));
                }
                HubCommand::Stats(reply) => {
                    let _ = reply.send(self.state.stats());
                }
                HubCommand::Shutdown => break,
            }
        }

        let stats = self.state.stats();
        self.state.close_all();
        log::info!(
            "Hub coordinator stopped: {} clients closed, {} messages broadcast, {} evictions",
            stats.clients,
            stats.messages_broadcast,
            stats.evictions
        );
        stats
    }
}

/// Cloneable front door to the coordinator.
#[derive(Debug, Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    async fn send(&self, command: HubCommand) -> Result<(), CollabError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| CollabError::HubClosed)
    }

    /// Make a client a broadcast target.
    pub async fn register(&self, client: ClientHandle) -> Result<(), CollabError> {
        self.send(HubCommand::Register(client)).await
    }

    /// Remove a client and close its queue. No-op if it is already gone.
    pub async fn unregister(&self, id: ClientId) -> Result<(), CollabError> {
        self.send(HubCommand::Unregister(id)).await
    }

    /// Queue a message for fan-out to `message.design_id`.
    pub async fn broadcast(&self, message: Message) -> Result<(), CollabError> {
        self.send(HubCommand::Broadcast(message)).await
    }

    /// Members of a room, as seen after every previously submitted command.
    pub async fn members(&self, room_id: impl Into<RoomId>) -> Result<Vec<Member>, CollabError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Members {
            room_id: room_id.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| CollabError::HubClosed)
    }

    pub async fn stats(&self) -> Result<HubStats, CollabError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Stats(reply)).await?;
        rx.await.map_err(|_| CollabError::HubClosed)
    }

    /// Ask the coordinator to stop once earlier commands are processed.
    pub async fn shutdown(&self) -> Result<(), CollabError> {
        self.send(HubCommand::Shutdown).await
    }

    /// Whether the coordinator has gone away.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}
