//! Topic-scoped chat rooms.
//!
//! ```text
//!             ┌──────────── HubActor ────────────┐
//!  join/leave │ rooms:   key -> room mailbox     │
//!  send ────► │ members: conn -> (key, identity) │
//!             └──────┬───────────────┬───────────┘
//!                    ▼               ▼
//!               RoomActor "r1"   RoomActor "r2"    (own the member connections)
//! ```
//!
//! The hub only routes and keeps membership counts. Each room actor owns its
//! members' connections and serializes every write to them, which gives
//! per-room ordering. A room actor is spawned on first join and released when
//! the hub drops its mailbox at zero members.

use crate::config::RoomConfig;
use crate::connection::{fan_out, ConnId, Connection};
use crate::error::{RealtimeError, Result};
use shelfcast_types::{ChatFrame, Identity};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Active usernames per room.
pub type RoomSnapshot = BTreeMap<String, Vec<String>>;

/// Reply slot for a leave: the connection comes back to the caller.
type LeaveResponse = oneshot::Sender<Option<Connection>>;

/// Messages sent to the hub actor.
enum HubMessage {
    Join {
        room: String,
        conn: Connection,
    },
    Leave {
        id: ConnId,
        response: Option<LeaveResponse>,
    },
    Send {
        room: String,
        frame: ChatFrame,
    },
    Direct {
        id: ConnId,
        frame: ChatFrame,
    },
    RequestUsers {
        id: ConnId,
    },
    ListMembers {
        room: String,
        response: oneshot::Sender<Vec<Identity>>,
    },
    Evicted {
        room: String,
        id: ConnId,
    },
    Snapshot {
        response: oneshot::Sender<RoomSnapshot>,
    },
}

/// Messages sent to a room actor.
enum RoomMessage {
    Join {
        conn: Connection,
    },
    Leave {
        id: ConnId,
        response: Option<LeaveResponse>,
    },
    Send {
        frame: ChatFrame,
    },
    Direct {
        id: ConnId,
        frame: ChatFrame,
    },
    RequestUsers {
        id: ConnId,
    },
    ListMembers {
        response: oneshot::Sender<Vec<Identity>>,
    },
}

/// Mailbox of the room hub.
#[derive(Clone)]
pub struct RoomHub {
    sender: mpsc::Sender<HubMessage>,
}

impl RoomHub {
    /// Spawns the hub actor and returns its mailbox.
    pub fn spawn(config: RoomConfig) -> Self {
        let (sender, mailbox) = mpsc::channel(config.mailbox_size);
        let actor = HubActor {
            weak_self: sender.downgrade(),
            config,
            mailbox,
            rooms: HashMap::new(),
            members: HashMap::new(),
        };
        tokio::spawn(actor.run());
        Self { sender }
    }

    /// Adds a connection to a room, creating the room if absent.
    ///
    /// Existing members receive a `join` notice.
    pub async fn join(&self, room: impl Into<String>, conn: Connection) -> Result<()> {
        let room = room.into();
        self.sender.send(HubMessage::Join { room, conn }).await?;
        Ok(())
    }

    /// Removes a connection from its room and hands it back.
    ///
    /// Remaining members receive a `leave` notice. Returns `None` if the
    /// connection was in no room (never joined, or already dropped).
    pub async fn leave(&self, id: ConnId) -> Result<Option<Connection>> {
        let (response, receiver) = oneshot::channel();
        self.sender
            .send(HubMessage::Leave {
                id,
                response: Some(response),
            })
            .await?;
        Ok(receiver.await?)
    }

    /// Removes a connection from its room and closes it.
    pub async fn disconnect(&self, id: ConnId) -> Result<()> {
        self.sender
            .send(HubMessage::Leave { id, response: None })
            .await?;
        Ok(())
    }

    /// Broadcasts a frame to every member of a room.
    pub async fn send(&self, room: impl Into<String>, frame: ChatFrame) -> Result<()> {
        let room = room.into();
        self.sender.send(HubMessage::Send { room, frame }).await?;
        Ok(())
    }

    /// Writes a frame to a single member through its room.
    pub async fn direct(&self, id: ConnId, frame: ChatFrame) -> Result<()> {
        self.sender.send(HubMessage::Direct { id, frame }).await?;
        Ok(())
    }

    /// Answers `get_users` for a member: its room writes a `user_list` frame to it.
    pub async fn request_users(&self, id: ConnId) -> Result<()> {
        self.sender.send(HubMessage::RequestUsers { id }).await?;
        Ok(())
    }

    /// Point-in-time member list of a room (empty if the room does not exist).
    pub async fn list_members(&self, room: impl Into<String>) -> Result<Vec<Identity>> {
        let (response, receiver) = oneshot::channel();
        self.sender
            .send(HubMessage::ListMembers {
                room: room.into(),
                response,
            })
            .await?;
        Ok(receiver.await?)
    }

    /// Active usernames per room.
    pub async fn snapshot(&self) -> Result<RoomSnapshot> {
        let (response, receiver) = oneshot::channel();
        self.sender.send(HubMessage::Snapshot { response }).await?;
        Ok(receiver.await?)
    }

    /// Number of live rooms.
    pub async fn room_count(&self) -> Result<usize> {
        Ok(self.snapshot().await?.len())
    }
}

struct RoomEntry {
    sender: mpsc::Sender<RoomMessage>,
    members: usize,
}

/// Routes requests to rooms and tracks which room each connection is in.
struct HubActor {
    config: RoomConfig,
    mailbox: mpsc::Receiver<HubMessage>,
    weak_self: mpsc::WeakSender<HubMessage>,
    rooms: HashMap<String, RoomEntry>,
    members: HashMap<ConnId, (String, Identity)>,
}

impl HubActor {
    async fn run(mut self) {
        while let Some(message) = self.mailbox.recv().await {
            match message {
                HubMessage::Join { room, conn } => self.join(room, conn).await,
                HubMessage::Leave { id, response } => self.leave(id, response).await,
                HubMessage::Send { room, frame } => {
                    self.forward(&room, RoomMessage::Send { frame }).await;
                }
                HubMessage::Direct { id, frame } => {
                    if let Some(room) = self.room_of(id) {
                        self.forward(&room, RoomMessage::Direct { id, frame }).await;
                    }
                }
                HubMessage::RequestUsers { id } => {
                    if let Some(room) = self.room_of(id) {
                        self.forward(&room, RoomMessage::RequestUsers { id }).await;
                    }
                }
                HubMessage::ListMembers { room, response } => {
                    if self.rooms.contains_key(&room) {
                        self.forward(&room, RoomMessage::ListMembers { response })
                            .await;
                    } else {
                        let _ = response.send(Vec::new());
                    }
                }
                HubMessage::Evicted { room, id } => {
                    if self.room_of(id).as_deref() == Some(room.as_str()) {
                        self.members.remove(&id);
                        self.release_one(&room);
                    }
                }
                HubMessage::Snapshot { response } => {
                    let _ = response.send(self.snapshot());
                }
            }
        }
        debug!("Room hub stopped");
    }

    fn room_of(&self, id: ConnId) -> Option<String> {
        self.members.get(&id).map(|(room, _)| room.clone())
    }

    async fn join(&mut self, room: String, conn: Connection) {
        if !self.rooms.contains_key(&room) {
            let sender = self.spawn_room(room.clone());
            self.rooms.insert(room.clone(), RoomEntry { sender, members: 0 });
            info!(room = %room, "Room created");
        }
        if let Some(entry) = self.rooms.get_mut(&room) {
            entry.members += 1;
        }
        self.members
            .insert(conn.id, (room.clone(), conn.identity.clone()));
        self.forward(&room, RoomMessage::Join { conn }).await;
    }

    async fn leave(&mut self, id: ConnId, response: Option<LeaveResponse>) {
        let Some((room, _)) = self.members.remove(&id) else {
            if let Some(response) = response {
                let _ = response.send(None);
            }
            return;
        };
        self.forward(&room, RoomMessage::Leave { id, response })
            .await;
        self.release_one(&room);
    }

    /// Decrements a room's membership and releases the room at zero.
    fn release_one(&mut self, room: &str) {
        let empty = match self.rooms.get_mut(room) {
            Some(entry) => {
                entry.members = entry.members.saturating_sub(1);
                entry.members == 0
            }
            None => false,
        };
        if empty {
            // Queued messages still reach the room; it stops once they are drained.
            self.rooms.remove(room);
            info!(room = %room, "Room released");
        }
    }

    async fn forward(&mut self, room: &str, message: RoomMessage) {
        let Some(entry) = self.rooms.get(room) else {
            debug!(room = %room, "Dropping message for unknown room");
            return;
        };
        if entry.sender.send(message).await.is_err() {
            warn!(room = %room, "Room actor is gone");
            self.rooms.remove(room);
        }
    }

    fn spawn_room(&self, key: String) -> mpsc::Sender<RoomMessage> {
        let (sender, mailbox) = mpsc::channel(self.config.mailbox_size);
        let actor = RoomActor {
            key,
            config: self.config.clone(),
            mailbox,
            hub: self.weak_self.clone(),
            members: Vec::new(),
        };
        tokio::spawn(actor.run());
        sender
    }

    fn snapshot(&self) -> RoomSnapshot {
        let mut snapshot = RoomSnapshot::new();
        for (room, identity) in self.members.values() {
            snapshot
                .entry(room.clone())
                .or_default()
                .push(identity.username.clone());
        }
        for names in snapshot.values_mut() {
            names.sort();
        }
        snapshot
    }
}

/// Owns the member connections of one room.
struct RoomActor {
    key: String,
    config: RoomConfig,
    mailbox: mpsc::Receiver<RoomMessage>,
    hub: mpsc::WeakSender<HubMessage>,
    members: Vec<Connection>,
}

impl RoomActor {
    async fn run(mut self) {
        while let Some(message) = self.mailbox.recv().await {
            match message {
                RoomMessage::Join { conn } => {
                    let notice = ChatFrame::Join {
                        user_id: conn.identity.user_id.clone(),
                        username: conn.identity.username.clone(),
                        room: self.key.clone(),
                    };
                    self.broadcast(&notice).await;
                    debug!(room = %self.key, conn_id = %conn.id, identity = %conn.identity, "Member joined");
                    self.members.push(conn);
                }
                RoomMessage::Leave { id, response } => {
                    let conn = self.remove(id);
                    if let Some(conn) = &conn {
                        debug!(room = %self.key, conn_id = %id, "Member left");
                        let notice = self.leave_notice(&conn.identity);
                        self.broadcast(&notice).await;
                    }
                    match (response, conn) {
                        (Some(response), conn) => {
                            let _ = response.send(conn);
                        }
                        (None, Some(conn)) => conn.close().await,
                        (None, None) => {}
                    }
                }
                RoomMessage::Send { frame } => self.broadcast(&frame).await,
                RoomMessage::Direct { id, frame } => self.direct(id, &frame).await,
                RoomMessage::RequestUsers { id } => {
                    let frame = ChatFrame::UserList {
                        room: self.key.clone(),
                        users: self
                            .members
                            .iter()
                            .map(|m| m.identity.username.clone())
                            .collect(),
                    };
                    self.direct(id, &frame).await;
                }
                RoomMessage::ListMembers { response } => {
                    let _ = response.send(self.members.iter().map(|m| m.identity.clone()).collect());
                }
            }
        }

        for conn in self.members.drain(..) {
            conn.close().await;
        }
        debug!(room = %self.key, "Room stopped");
    }

    fn remove(&mut self, id: ConnId) -> Option<Connection> {
        let pos = self.members.iter().position(|m| m.id == id)?;
        Some(self.members.remove(pos))
    }

    fn leave_notice(&self, identity: &Identity) -> ChatFrame {
        ChatFrame::Leave {
            user_id: identity.user_id.clone(),
            username: identity.username.clone(),
            room: self.key.clone(),
        }
    }

    async fn broadcast(&mut self, frame: &ChatFrame) {
        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!(room = %self.key, error = %e, "Failed to encode chat frame");
                return;
            }
        };
        let failed = fan_out(self.members.iter_mut(), &text, self.config.write_deadline).await;
        self.evict(failed).await;
    }

    async fn direct(&mut self, id: ConnId, frame: &ChatFrame) {
        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!(room = %self.key, error = %e, "Failed to encode chat frame");
                return;
            }
        };
        let deadline = self.config.write_deadline;
        let result = match self.members.iter_mut().find(|m| m.id == id) {
            Some(conn) => conn.send(&text, deadline).await,
            None => Ok(()),
        };
        if let Err(e) = result {
            self.evict(vec![(id, e)]).await;
        }
    }

    /// Drops failed members, telling the others they left. Notices that fail
    /// in turn evict their targets too.
    async fn evict(&mut self, mut pending: Vec<(ConnId, RealtimeError)>) {
        while !pending.is_empty() {
            let mut notices = Vec::new();
            for (id, reason) in pending.drain(..) {
                if let Some(conn) = self.remove(id) {
                    warn!(room = %self.key, conn_id = %id, identity = %conn.identity, error = %reason, "Dropping room member");
                    self.report_evicted(id);
                    notices.push(self.leave_notice(&conn.identity));
                    conn.close().await;
                }
            }
            for notice in notices {
                let Ok(text) = notice.encode() else { continue };
                let failed =
                    fan_out(self.members.iter_mut(), &text, self.config.write_deadline).await;
                pending.extend(failed);
            }
        }
    }

    fn report_evicted(&self, id: ConnId) {
        let Some(hub) = self.hub.upgrade() else {
            return;
        };
        let room = self.key.clone();
        // Spawned so a full hub mailbox can never wait on this room in turn.
        tokio::spawn(async move {
            let _ = hub.send(HubMessage::Evicted { room, id }).await;
        });
    }
}

/// Drives the chat protocol for one connection.
///
/// While the connection is in no room the session owns it and writes to it
/// directly; once joined, the room owns it and the session goes through the hub.
pub struct ChatSession {
    hub: RoomHub,
    id: ConnId,
    identity: Identity,
    lobby: Option<Connection>,
    room: Option<String>,
    write_deadline: std::time::Duration,
}

impl ChatSession {
    /// Starts a session for a freshly accepted connection.
    pub fn new(hub: RoomHub, conn: Connection, write_deadline: std::time::Duration) -> Self {
        Self {
            hub,
            id: conn.id,
            identity: conn.identity.clone(),
            lobby: Some(conn),
            room: None,
            write_deadline,
        }
    }

    /// Connection id of this session.
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Room the session is currently in.
    pub fn room(&self) -> Option<&str> {
        self.room.as_deref()
    }

    /// Handles one inbound text frame.
    ///
    /// Undecodable frames are logged and discarded. An error return means the
    /// connection is gone and the session should end.
    pub async fn handle_text(&mut self, text: &str) -> Result<()> {
        let frame = match ChatFrame::decode_client(text) {
            Ok(frame) => frame,
            Err(shelfcast_types::ChatFrameError::Decode(e)) => {
                debug!(conn_id = %self.id, error = %e, "Discarding malformed chat frame");
                return Ok(());
            }
            Err(e) => {
                return self
                    .reply(ChatFrame::Error {
                        message: e.to_string(),
                    })
                    .await;
            }
        };
        debug!(
            conn_id = %self.id,
            frame = frame.type_name(),
            room = ?self.room,
            "Chat frame received"
        );

        match frame {
            ChatFrame::Join { room, .. } => self.join(room.trim().to_string()).await,
            ChatFrame::Leave { .. } => self.leave().await,
            ChatFrame::Message { message, .. } => match self.room.clone() {
                Some(room) => {
                    let frame = ChatFrame::Message {
                        user_id: self.identity.user_id.clone(),
                        username: self.identity.username.clone(),
                        message,
                        room: room.clone(),
                    };
                    self.hub.send(room, frame).await
                }
                None => {
                    self.reply(ChatFrame::Error {
                        message: "join a room first".into(),
                    })
                    .await
                }
            },
            ChatFrame::GetUsers { room } => {
                if self.room.is_some() {
                    self.hub.request_users(self.id).await
                } else if !room.trim().is_empty() {
                    let room = room.trim().to_string();
                    let users = self
                        .hub
                        .list_members(room.clone())
                        .await?
                        .into_iter()
                        .map(|identity| identity.username)
                        .collect();
                    self.reply(ChatFrame::UserList { room, users }).await
                } else {
                    self.reply(ChatFrame::Error {
                        message: "room must not be empty".into(),
                    })
                    .await
                }
            }
            ChatFrame::UserList { .. } | ChatFrame::Error { .. } => Ok(()),
        }
    }

    async fn join(&mut self, room: String) -> Result<()> {
        if self.room.as_deref() == Some(room.as_str()) {
            return Ok(());
        }
        if self.room.is_some() {
            self.leave().await?;
        }
        let conn = self.lobby.take().ok_or(RealtimeError::ChannelClosed)?;
        self.hub.join(room.clone(), conn).await?;
        self.room = Some(room);
        Ok(())
    }

    async fn leave(&mut self) -> Result<()> {
        if self.room.take().is_none() {
            return Ok(());
        }
        match self.hub.leave(self.id).await? {
            Some(conn) => {
                self.lobby = Some(conn);
                Ok(())
            }
            // The room already dropped the connection after a failed write.
            None => Err(RealtimeError::ChannelClosed),
        }
    }

    async fn reply(&mut self, frame: ChatFrame) -> Result<()> {
        match self.lobby.as_mut() {
            Some(conn) => conn.send(&frame.encode()?, self.write_deadline).await,
            None => self.hub.direct(self.id, frame).await,
        }
    }

    /// Ends the session: leaves the current room (notifying members) and closes the connection.
    pub async fn close(mut self) {
        if self.room.take().is_some() {
            let _ = self.hub.disconnect(self.id).await;
        }
        if let Some(conn) = self.lobby.take() {
            conn.close().await;
        }
    }
}
