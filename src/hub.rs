//! Hub actor implementation
//!
//! The central actor that owns the room table and the registry of
//! connected clients. Every registration, unregistration, broadcast and
//! query arrives on one mpsc channel and is handled in arrival order, so
//! delivery order across the hub equals intake order and no lock guards
//! the tables.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::error::{AppError, SendError};
use crate::message::{Envelope, EnvelopeKind, MemberInfo};
use crate::room::{Room, RoomSummary};
use crate::types::{ClientId, ClientIdentity, RoomId};

/// Commands sent from adapters and the surrounding service to the hub
#[derive(Debug)]
pub enum HubCommand {
    /// New connection admitted to a room
    Register {
        identity: ClientIdentity,
        sender: mpsc::Sender<Envelope>,
        registration: Registration,
    },
    /// Connection closed (safe to send more than once)
    ///
    /// With a registration, only that registration is removed; a newer
    /// connection under the same id stays.
    Unregister {
        client_id: ClientId,
        registration: Option<Registration>,
    },
    /// Fan an envelope out to its room
    Broadcast {
        envelope: Envelope,
    },
    /// Current members of a room
    Snapshot {
        room_id: RoomId,
        reply: oneshot::Sender<Vec<ClientIdentity>>,
    },
    /// All live rooms
    Rooms {
        reply: oneshot::Sender<Vec<RoomSummary>>,
    },
}

/// Token for one registration of a connection id
///
/// Minted by `HubHandle::register`, unique per hub.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registration(u64);

/// Routing policy
#[derive(Debug, Clone, Default)]
pub struct HubConfig {
    /// Deliver chat messages back to their sender as well
    pub echo_to_sender: bool,
}

/// The hub actor
///
/// Processes commands until every `HubHandle` is dropped.
pub struct Hub {
    /// All registered clients: ClientId -> Client
    clients: HashMap<ClientId, Client>,
    /// Live rooms: RoomId -> Room (only rooms with members)
    rooms: HashMap<RoomId, Room>,
    config: HubConfig,
    /// Command receiver channel
    receiver: mpsc::Receiver<HubCommand>,
}

impl Hub {
    /// Create a new Hub with the given command receiver
    pub fn new(receiver: mpsc::Receiver<HubCommand>, config: HubConfig) -> Self {
        Self {
            clients: HashMap::new(),
            rooms: HashMap::new(),
            config,
            receiver,
        }
    }

    /// Run the hub event loop
    pub async fn run(mut self) {
        info!("Hub started");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!(
            "Hub shutting down with {} clients in {} rooms",
            self.clients.len(),
            self.rooms.len()
        );
    }

    /// Process a single command
    fn handle_command(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Register {
                identity,
                sender,
                registration,
            } => {
                self.handle_register(identity, sender, registration);
            }
            HubCommand::Unregister {
                client_id,
                registration,
            } => {
                self.handle_unregister(&client_id, registration);
            }
            HubCommand::Broadcast { envelope } => {
                self.handle_broadcast(envelope);
            }
            HubCommand::Snapshot { room_id, reply } => {
                let members = self
                    .rooms
                    .get(&room_id)
                    .map(Room::members)
                    .unwrap_or_default();
                let _ = reply.send(members);
            }
            HubCommand::Rooms { reply } => {
                let _ = reply.send(self.rooms.values().map(Room::summary).collect());
            }
        }
    }

    /// Handle a new member joining a room
    fn handle_register(
        &mut self,
        identity: ClientIdentity,
        sender: mpsc::Sender<Envelope>,
        registration: Registration,
    ) {
        let client_id = identity.connection_id.clone();

        if self.detach(&client_id, None).is_some() {
            warn!("Client {} registered twice, replacing previous connection", client_id);
        }

        let room = self.rooms.entry(identity.room_id.clone()).or_insert_with(|| {
            debug!("Room {} created", identity.room_id);
            Room::new(identity.room_id.clone())
        });
        room.add(identity.clone());

        info!(
            "Client {} ({}) joined room {} ({} members)",
            client_id,
            identity.display_name,
            identity.room_id,
            room.member_count()
        );

        let names = room
            .members()
            .into_iter()
            .map(|m| m.display_name)
            .collect::<Vec<_>>()
            .join(", ");

        let client = Client::new(identity.clone(), sender, registration);
        self.clients.insert(client_id.clone(), client);

        // The joiner receives its own join announcement
        self.fan_out(&Envelope::join(&identity), None);

        if let Some(client) = self.clients.get(&client_id) {
            let welcome = Envelope::system(identity.room_id, format!("Members: {}", names));
            let _ = client.offer(welcome);
        }

        debug!(
            "Total clients: {}, Total rooms: {}",
            self.clients.len(),
            self.rooms.len()
        );
    }

    /// Handle a member leaving; unknown ids and stale registrations are ignored
    fn handle_unregister(&mut self, client_id: &ClientId, registration: Option<Registration>) {
        let Some(identity) = self.detach(client_id, registration) else {
            debug!("Client {} already unregistered", client_id);
            return;
        };

        info!(
            "Client {} ({}) left room {}",
            client_id, identity.display_name, identity.room_id
        );

        self.fan_out(&Envelope::leave(&identity), None);

        debug!(
            "Total clients: {}, Total rooms: {}",
            self.clients.len(),
            self.rooms.len()
        );
    }

    /// Handle an envelope submitted for fan-out
    fn handle_broadcast(&mut self, envelope: Envelope) {
        let exclude = match envelope.kind() {
            EnvelopeKind::Chat if !self.config.echo_to_sender => envelope.sender_id().cloned(),
            _ => None,
        };
        let delivered = self.fan_out(&envelope, exclude.as_ref());
        debug!(
            "{:?} in room {} delivered to {} clients",
            envelope.kind(),
            envelope.room_id(),
            delivered
        );
    }

    /// Remove a client from the registry and its room
    ///
    /// Deletes the room once empty. Dropping the `Client` closes the
    /// adapter's outbound queue. A `registration` that no longer matches
    /// the current entry leaves it in place.
    fn detach(
        &mut self,
        client_id: &ClientId,
        registration: Option<Registration>,
    ) -> Option<ClientIdentity> {
        let current = self.clients.get(client_id)?.registration;
        if registration.is_some_and(|r| r != current) {
            debug!("Ignoring stale unregister for {}", client_id);
            return None;
        }
        let client = self.clients.remove(client_id)?;
        let room_id = &client.identity.room_id;

        if let Some(room) = self.rooms.get_mut(room_id) {
            room.remove(client_id);
            if room.is_empty() {
                self.rooms.remove(room_id);
                debug!("Room {} deleted (empty)", room_id);
            }
        }

        Some(client.identity)
    }

    /// Offer an envelope to every member of its room
    ///
    /// Never waits: a full or closed queue only skips that recipient.
    fn fan_out(&self, envelope: &Envelope, exclude: Option<&ClientId>) -> usize {
        let Some(room) = self.rooms.get(envelope.room_id()) else {
            debug!("No live room {}, dropping {:?}", envelope.room_id(), envelope.kind());
            return 0;
        };

        let mut delivered = 0;
        for member_id in room.member_ids() {
            if Some(member_id) == exclude {
                continue;
            }
            let Some(client) = self.clients.get(member_id) else {
                continue;
            };
            match client.offer(envelope.clone()) {
                Ok(()) => delivered += 1,
                Err(SendError::QueueFull) => {
                    debug!("Queue full for {}, dropping {:?}", member_id, envelope.kind());
                }
                Err(SendError::ChannelClosed) => {
                    debug!("Queue closed for {}, dropping {:?}", member_id, envelope.kind());
                }
            }
        }
        delivered
    }
}

/// Cloneable handle to a running hub
///
/// The only way other components reach the hub; pass it to every
/// connection handler that needs it.
#[derive(Debug, Clone)]
pub struct HubHandle {
    sender: mpsc::Sender<HubCommand>,
    next_registration: Arc<AtomicU64>,
}

impl HubHandle {
    pub fn new(sender: mpsc::Sender<HubCommand>) -> Self {
        Self {
            sender,
            next_registration: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create a hub and its handle; the caller spawns `Hub::run`
    pub fn channel(buffer: usize, config: HubConfig) -> (Hub, HubHandle) {
        let (tx, rx) = mpsc::channel(buffer);
        (Hub::new(rx, config), HubHandle::new(tx))
    }

    async fn send(&self, cmd: HubCommand) -> Result<(), AppError> {
        self.sender.send(cmd).await.map_err(|_| AppError::HubClosed)
    }

    /// Register an adapter's outbound queue under its identity
    ///
    /// The returned token identifies this registration for
    /// `unregister_registration`.
    pub async fn register(
        &self,
        identity: ClientIdentity,
        sender: mpsc::Sender<Envelope>,
    ) -> Result<Registration, AppError> {
        let registration = Registration(self.next_registration.fetch_add(1, Ordering::Relaxed));
        self.send(HubCommand::Register {
            identity,
            sender,
            registration,
        })
        .await?;
        Ok(registration)
    }

    /// Unregister a connection; no-op if it is already gone
    pub async fn unregister(&self, client_id: ClientId) -> Result<(), AppError> {
        self.send(HubCommand::Unregister {
            client_id,
            registration: None,
        })
        .await
    }

    /// Unregister one registration of a connection
    ///
    /// No-op if the id has since been registered again by another
    /// connection.
    pub async fn unregister_registration(
        &self,
        client_id: ClientId,
        registration: Registration,
    ) -> Result<(), AppError> {
        self.send(HubCommand::Unregister {
            client_id,
            registration: Some(registration),
        })
        .await
    }

    /// Submit an envelope for fan-out to its room
    pub async fn broadcast(&self, envelope: Envelope) -> Result<(), AppError> {
        self.send(HubCommand::Broadcast { envelope }).await
    }

    /// Broadcast a server notice to a room
    pub async fn system(&self, room_id: RoomId, content: String) -> Result<(), AppError> {
        self.broadcast(Envelope::system(room_id, content)).await
    }

    /// Current members of a room (empty for unknown rooms)
    pub async fn snapshot(&self, room_id: RoomId) -> Result<Vec<ClientIdentity>, AppError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Snapshot { room_id, reply }).await?;
        rx.await.map_err(|_| AppError::HubClosed)
    }

    /// Membership in the `{connection_id, username}` shape served to status queries
    pub async fn members(&self, room_id: RoomId) -> Result<Vec<MemberInfo>, AppError> {
        let members = self.snapshot(room_id).await?;
        Ok(members.iter().map(MemberInfo::from).collect())
    }

    /// Summaries of every live room
    pub async fn rooms(&self) -> Result<Vec<RoomSummary>, AppError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Rooms { reply }).await?;
        rx.await.map_err(|_| AppError::HubClosed)
    }
}
