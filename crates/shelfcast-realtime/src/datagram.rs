//! Datagram registry: connectionless clients receiving notification events.
//!
//! Datagram delivery gives no close signal, so membership is soft state:
//! clients `REGISTER`, answer every `PING` with `PONG`, and are evicted after
//! [`DatagramConfig::missed_heartbeats`] silent intervals. Broadcasts are
//! best-effort; a failed `send_to` is logged and skipped.

use crate::config::DatagramConfig;
use crate::error::{RealtimeError, Result};
use shelfcast_types::{
    Control, DatagramFrame, NotificationEvent, MAX_DATAGRAM_SIZE, PING, PONG, REGISTERED,
    UNREGISTERED,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Liveness of a registered client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    /// Answered within the last heartbeat interval.
    Registered,
    /// Missed at least one heartbeat; evicted if it stays silent.
    Suspect,
}

/// A registered datagram client.
#[derive(Debug)]
struct ClientRecord {
    /// Where notifications are sent.
    addr: SocketAddr,
    /// Last `REGISTER` or `PONG` received.
    last_seen: Instant,
    state: ClientState,
}

impl ClientRecord {
    fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            last_seen: Instant::now(),
            state: ClientState::Registered,
        }
    }

    fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.state = ClientState::Registered;
    }
}

/// Datagram registry statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DatagramStats {
    /// Currently registered clients.
    pub current_clients: usize,
    /// Registered clients that missed the latest heartbeat.
    pub suspect_clients: usize,
    /// Registrations since start (refreshes excluded).
    pub total_registered: u64,
    /// Clients evicted for missing heartbeats.
    pub evicted_clients: u64,
    /// Broadcasts since start.
    pub total_broadcasts: u64,
    /// Individual sends that failed.
    pub failed_sends: u64,
}

/// Messages sent to the datagram registry actor.
enum Message {
    /// A datagram to dispatch as if it arrived on the socket.
    Datagram { source: SocketAddr, payload: Vec<u8> },
    /// Send a notification to every registered client.
    Broadcast {
        event: NotificationEvent,
        response: Option<oneshot::Sender<usize>>,
    },
    /// Request statistics.
    Stats {
        response: oneshot::Sender<DatagramStats>,
    },
}

/// Mailbox of the datagram registry actor.
#[derive(Clone)]
pub struct DatagramRegistry {
    sender: mpsc::Sender<Message>,
    local_addr: SocketAddr,
}

impl DatagramRegistry {
    /// Binds the registry socket and spawns its actor.
    pub async fn bind(addr: SocketAddr, config: DatagramConfig) -> Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;

        let (sender, mailbox) = mpsc::channel(config.mailbox_size);
        let (inbound_tx, inbound) = mpsc::channel(config.mailbox_size);
        let receive_task = tokio::spawn(receive_loop(socket.clone(), inbound_tx));

        let actor = Actor {
            config,
            socket,
            mailbox,
            inbound,
            receive_task,
            clients: HashMap::new(),
            stats: DatagramStats::default(),
        };
        tokio::spawn(actor.run());

        info!(addr = %local_addr, "Datagram registry listening");
        Ok(Self { sender, local_addr })
    }

    /// Address the registry socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Dispatches a datagram on the reserved control literals.
    pub async fn handle_datagram(&self, source: SocketAddr, payload: Vec<u8>) -> Result<()> {
        self.sender
            .send(Message::Datagram { source, payload })
            .await?;
        Ok(())
    }

    /// Queues a notification for every registered client.
    pub async fn broadcast(&self, event: NotificationEvent) -> Result<()> {
        self.sender
            .send(Message::Broadcast {
                event,
                response: None,
            })
            .await?;
        Ok(())
    }

    /// Broadcasts and waits, returning how many sends succeeded.
    pub async fn broadcast_confirmed(&self, event: NotificationEvent) -> Result<usize> {
        let (response, receiver) = oneshot::channel();
        self.sender
            .send(Message::Broadcast {
                event,
                response: Some(response),
            })
            .await?;
        Ok(receiver.await?)
    }

    /// Number of registered clients.
    pub async fn client_count(&self) -> Result<usize> {
        Ok(self.stats().await?.current_clients)
    }

    /// Registry statistics.
    pub async fn stats(&self) -> Result<DatagramStats> {
        let (response, receiver) = oneshot::channel();
        self.sender.send(Message::Stats { response }).await?;
        Ok(receiver.await?)
    }
}

impl std::fmt::Debug for DatagramRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramRegistry")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

/// Reads datagrams and hands them to the actor.
async fn receive_loop(socket: Arc<UdpSocket>, inbound: mpsc::Sender<(SocketAddr, Vec<u8>)>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, source)) => {
                if inbound.send((source, buf[..len].to_vec())).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "Datagram receive error");
            }
        }
    }
}

/// Actor owning the client table.
struct Actor {
    config: DatagramConfig,
    socket: Arc<UdpSocket>,
    mailbox: mpsc::Receiver<Message>,
    inbound: mpsc::Receiver<(SocketAddr, Vec<u8>)>,
    receive_task: JoinHandle<()>,
    clients: HashMap<SocketAddr, ClientRecord>,
    stats: DatagramStats,
}

impl Actor {
    async fn run(mut self) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                message = self.mailbox.recv() => match message {
                    Some(message) => self.handle(message).await,
                    None => break,
                },
                Some((source, payload)) = self.inbound.recv() => {
                    self.handle_datagram(source, &payload).await;
                }
                _ = heartbeat.tick() => self.heartbeat().await,
            }
        }

        self.receive_task.abort();
        debug!("Datagram registry stopped");
    }

    async fn handle(&mut self, message: Message) {
        match message {
            Message::Datagram { source, payload } => self.handle_datagram(source, &payload).await,
            Message::Broadcast { event, response } => {
                let delivered = self.broadcast(&event).await;
                if let Some(response) = response {
                    let _ = response.send(delivered);
                }
            }
            Message::Stats { response } => {
                let mut stats = self.stats.clone();
                stats.current_clients = self.clients.len();
                stats.suspect_clients = self
                    .clients
                    .values()
                    .filter(|c| c.state == ClientState::Suspect)
                    .count();
                let _ = response.send(stats);
            }
        }
    }

    async fn handle_datagram(&mut self, source: SocketAddr, payload: &[u8]) {
        match DatagramFrame::parse(payload) {
            DatagramFrame::Control(Control::Register) => {
                match self.clients.get_mut(&source) {
                    Some(client) => client.touch(),
                    None => {
                        self.clients.insert(source, ClientRecord::new(source));
                        self.stats.total_registered += 1;
                        info!(client = %source, "Datagram client registered");
                    }
                }
                self.reply(REGISTERED, source).await;
            }
            DatagramFrame::Control(Control::Unregister) => {
                if self.clients.remove(&source).is_some() {
                    info!(client = %source, "Datagram client unregistered");
                }
                self.reply(UNREGISTERED, source).await;
            }
            DatagramFrame::Control(Control::Pong) => match self.clients.get_mut(&source) {
                Some(client) => client.touch(),
                None => debug!(client = %source, "PONG from unregistered address"),
            },
            DatagramFrame::Control(Control::Ping) => self.reply(PONG, source).await,
            DatagramFrame::Control(control) => {
                debug!(client = %source, control = control.as_str(), "Ignoring server-only control frame");
            }
            DatagramFrame::Notification(_) => {
                debug!(client = %source, "Notification payloads are not accepted from clients");
            }
            DatagramFrame::Malformed(reason) => {
                debug!(client = %source, error = %reason, "Discarding malformed datagram");
            }
        }
    }

    async fn heartbeat(&mut self) {
        let now = Instant::now();
        let evict_after = self.config.eviction_after();
        let interval = self.config.heartbeat_interval;

        let stale: Vec<SocketAddr> = self
            .clients
            .values()
            .filter(|c| now.duration_since(c.last_seen) > evict_after)
            .map(|c| c.addr)
            .collect();
        for addr in stale {
            self.clients.remove(&addr);
            self.stats.evicted_clients += 1;
            warn!(client = %addr, "Evicting datagram client after missed heartbeats");
        }

        for client in self.clients.values_mut() {
            if now.duration_since(client.last_seen) > interval {
                client.state = ClientState::Suspect;
            }
        }

        let targets: Vec<SocketAddr> = self.clients.keys().copied().collect();
        for addr in targets {
            if let Err(e) = self.send_to(PING.as_bytes(), addr).await {
                debug!(client = %addr, error = %e, "Heartbeat send failed");
            }
        }
    }

    async fn broadcast(&mut self, event: &NotificationEvent) -> usize {
        self.stats.total_broadcasts += 1;
        let payload = match serde_json::to_vec(event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to encode notification");
                return 0;
            }
        };

        let targets: Vec<SocketAddr> = self.clients.keys().copied().collect();
        let mut delivered = 0;
        for addr in targets {
            match self.send_to(&payload, addr).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    self.stats.failed_sends += 1;
                    warn!(client = %addr, error = %e, "Notification send failed");
                }
            }
        }

        debug!(
            kind = %event.kind,
            subject_id = %event.subject_id,
            recipients = delivered,
            "Notification broadcast"
        );
        delivered
    }

    async fn reply(&self, literal: &str, addr: SocketAddr) {
        if let Err(e) = self.send_to(literal.as_bytes(), addr).await {
            debug!(client = %addr, error = %e, "Control reply failed");
        }
    }

    async fn send_to(&self, payload: &[u8], addr: SocketAddr) -> Result<()> {
        send_with_deadline(&self.socket, payload, addr, self.config.send_deadline).await
    }
}

async fn send_with_deadline(
    socket: &UdpSocket,
    payload: &[u8],
    addr: SocketAddr,
    deadline: Duration,
) -> Result<()> {
    match tokio::time::timeout(deadline, socket.send_to(payload, addr)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(RealtimeError::PeerWrite(e.to_string())),
        Err(_) => Err(RealtimeError::WriteTimeout(deadline)),
    }
}
