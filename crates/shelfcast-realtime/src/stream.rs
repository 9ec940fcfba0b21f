//! Stream registry: persistent socket peers receiving progress events.
//!
//! Wire format is newline-delimited JSON. A single actor owns the live
//! connection set; [`StreamRegistry`] is its mailbox. Each accepted socket
//! gets a read task that only ever reads, and that never writes.

use crate::codec::LineCodec;
use crate::config::StreamConfig;
use crate::connection::{fan_out, Closed, ConnId, Connection, LineSink};
use crate::error::{RealtimeError, Result};
use futures::StreamExt;
use shelfcast_types::{Identity, ProgressEvent, StreamFrame, PONG};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, warn};

/// Messages sent to the stream registry actor.
enum Message {
    /// Add a connection to the broadcast set.
    Register { conn: Connection },
    /// Remove a connection; unknown ids are ignored.
    Unregister { id: ConnId },
    /// Fan an event out to every registered connection.
    Broadcast {
        event: ProgressEvent,
        response: Option<oneshot::Sender<usize>>,
    },
    /// A peer sent a liveness probe.
    Probe { id: ConnId },
    /// Request statistics.
    Stats { response: oneshot::Sender<StreamStats> },
}

/// Stream registry statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StreamStats {
    /// Currently registered peers.
    pub current_peers: usize,
    /// Peers registered since start.
    pub total_registered: u64,
    /// Broadcasts since start.
    pub total_broadcasts: u64,
    /// Peers dropped because a write failed or timed out.
    pub dropped_peers: u64,
}

/// Mailbox of the stream registry actor.
#[derive(Clone)]
pub struct StreamRegistry {
    sender: mpsc::Sender<Message>,
}

impl StreamRegistry {
    /// Spawns the registry actor and returns its mailbox.
    ///
    /// The actor runs until every clone of the mailbox is dropped.
    pub fn spawn(config: StreamConfig) -> Self {
        let (sender, mailbox) = mpsc::channel(config.mailbox_size);
        let actor = Actor {
            config,
            mailbox,
            peers: HashMap::new(),
            stats: StreamStats::default(),
        };
        tokio::spawn(actor.run());
        Self { sender }
    }

    /// Adds a connection to the broadcast set.
    pub async fn register(&self, conn: Connection) -> Result<ConnId> {
        let id = conn.id;
        self.sender.send(Message::Register { conn }).await?;
        Ok(id)
    }

    /// Removes a connection. Removing an unknown or already removed id is a no-op.
    pub async fn unregister(&self, id: ConnId) -> Result<()> {
        self.sender.send(Message::Unregister { id }).await?;
        Ok(())
    }

    /// Queues an event for every registered connection.
    ///
    /// Returns once the event is queued; delivery happens on the actor.
    pub async fn broadcast(&self, event: ProgressEvent) -> Result<()> {
        self.sender
            .send(Message::Broadcast {
                event,
                response: None,
            })
            .await?;
        Ok(())
    }

    /// Broadcasts an event and waits for the fan-out, returning how many peers received it.
    pub async fn broadcast_confirmed(&self, event: ProgressEvent) -> Result<usize> {
        let (response, receiver) = oneshot::channel();
        self.sender
            .send(Message::Broadcast {
                event,
                response: Some(response),
            })
            .await?;
        Ok(receiver.await?)
    }

    /// Number of registered peers.
    pub async fn peer_count(&self) -> Result<usize> {
        Ok(self.stats().await?.current_peers)
    }

    /// Registry statistics.
    pub async fn stats(&self) -> Result<StreamStats> {
        let (response, receiver) = oneshot::channel();
        self.sender.send(Message::Stats { response }).await?;
        Ok(receiver.await?)
    }

    async fn probe(&self, id: ConnId) -> Result<()> {
        self.sender.send(Message::Probe { id }).await?;
        Ok(())
    }

    /// Accepts stream peers until the listener fails irrecoverably.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!(addr = %listener.local_addr()?, "Stream registry listening");
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    let registry = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = registry.handle_connection(socket, peer_addr).await {
                            debug!(peer = %peer_addr, error = %e, "Stream connection ended");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept stream connection");
                }
            }
        }
    }

    /// Registers an accepted socket and runs its read loop until EOF, read
    /// error, or the registry dropping the peer.
    pub async fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        socket.set_nodelay(true)?;
        let (read_half, write_half) = socket.into_split();
        let identity = Identity::peer(peer_addr);
        let (conn, closed) = Connection::new(identity, LineSink::new(write_half));
        let id = self.register(conn).await?;
        debug!(conn_id = %id, peer = %peer_addr, "Stream peer connected");

        let result = self.read_loop(id, read_half, closed).await;
        self.unregister(id).await?;
        debug!(conn_id = %id, peer = %peer_addr, "Stream peer disconnected");
        result
    }

    async fn read_loop(
        &self,
        id: ConnId,
        read_half: tokio::net::tcp::OwnedReadHalf,
        mut closed: Closed,
    ) -> Result<()> {
        let mut frames = FramedRead::new(read_half, LineCodec::default());
        loop {
            tokio::select! {
                _ = &mut closed => return Ok(()),
                frame = frames.next() => match frame.transpose()? {
                    None => return Ok(()),
                    Some(frame) => match frame {
                        StreamFrame::Ping => self.probe(id).await?,
                        StreamFrame::Pong => {}
                        StreamFrame::Progress(_) => {
                            debug!(conn_id = %id, "Ignoring progress record sent by a peer");
                        }
                        StreamFrame::Malformed(reason) => {
                            debug!(conn_id = %id, error = %reason, "Discarding malformed frame");
                        }
                    },
                },
            }
        }
    }
}

/// Actor owning the live connection set.
struct Actor {
    config: StreamConfig,
    mailbox: mpsc::Receiver<Message>,
    peers: HashMap<ConnId, Connection>,
    stats: StreamStats,
}

impl Actor {
    async fn run(mut self) {
        while let Some(message) = self.mailbox.recv().await {
            match message {
                Message::Register { conn } => {
                    debug!(conn_id = %conn.id, identity = %conn.identity, "Registering stream peer");
                    self.peers.insert(conn.id, conn);
                    self.stats.total_registered += 1;
                }
                Message::Unregister { id } => {
                    if let Some(conn) = self.peers.remove(&id) {
                        conn.close().await;
                    }
                }
                Message::Broadcast { event, response } => {
                    let delivered = self.broadcast(&event).await;
                    if let Some(response) = response {
                        let _ = response.send(delivered);
                    }
                }
                Message::Probe { id } => {
                    let deadline = self.config.write_deadline;
                    let result = match self.peers.get_mut(&id) {
                        Some(conn) => conn.send(PONG, deadline).await,
                        None => Ok(()),
                    };
                    if let Err(e) = result {
                        self.drop_peer(id, &e).await;
                    }
                }
                Message::Stats { response } => {
                    let mut stats = self.stats.clone();
                    stats.current_peers = self.peers.len();
                    let _ = response.send(stats);
                }
            }
        }

        for (_, conn) in self.peers.drain() {
            conn.close().await;
        }
        debug!("Stream registry stopped");
    }

    async fn broadcast(&mut self, event: &ProgressEvent) -> usize {
        self.stats.total_broadcasts += 1;
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "Failed to encode progress event");
                return 0;
            }
        };

        let attempted = self.peers.len();
        let failed = fan_out(self.peers.values_mut(), &line, self.config.write_deadline).await;
        let delivered = attempted - failed.len();
        for (id, e) in failed {
            self.drop_peer(id, &e).await;
        }

        debug!(
            item_id = %event.item_id,
            recipients = delivered,
            "Progress broadcast"
        );
        delivered
    }

    async fn drop_peer(&mut self, id: ConnId, reason: &RealtimeError) {
        if let Some(conn) = self.peers.remove(&id) {
            warn!(conn_id = %id, identity = %conn.identity, error = %reason, "Dropping stream peer");
            self.stats.dropped_peers += 1;
            conn.close().await;
        }
    }
}
