//! Bridge client: consumes the socket registries as an ordinary peer and
//! republishes their events into the [`SseHub`].
//!
//! One supervisor task per upstream owns the whole connect → read →
//! reconnect cycle, so there is never more than one live connection per
//! upstream. A supervisor that exhausts its retry budget marks its feed
//! offline and exits; nothing else in the process is affected.

use crate::codec::LineCodec;
use crate::config::BridgeConfig;
use crate::error::{RealtimeError, Result};
use crate::retry::RetryPolicy;
use crate::sse::SseHub;
use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use shelfcast_types::{
    Control, DatagramFrame, Event, EventKind, StreamFrame, MAX_DATAGRAM_SIZE, PING, PONG,
    REGISTER, UNREGISTER,
};
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, timeout_at, Instant, Interval, MissedTickBehavior};
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

/// Connection state of one upstream feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamState {
    /// Connect attempts in progress.
    Connecting,
    /// Connected and receiving.
    Online,
    /// Not configured, retries exhausted, or shut down.
    Offline,
}

/// Point-in-time state of both feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BridgeSnapshot {
    pub stream: UpstreamState,
    pub datagram: UpstreamState,
}

/// Read-only view of the bridge's upstream states.
#[derive(Debug, Clone)]
pub struct BridgeStatus {
    stream: watch::Receiver<UpstreamState>,
    datagram: watch::Receiver<UpstreamState>,
}

impl BridgeStatus {
    /// State of the upstream feeding `kind`.
    pub fn get(&self, kind: EventKind) -> UpstreamState {
        *self.watch(kind).borrow()
    }

    /// Watch channel of the upstream feeding `kind`.
    pub fn watch(&self, kind: EventKind) -> watch::Receiver<UpstreamState> {
        match kind {
            EventKind::Progress => self.stream.clone(),
            EventKind::Notification => self.datagram.clone(),
        }
    }

    pub fn snapshot(&self) -> BridgeSnapshot {
        BridgeSnapshot {
            stream: *self.stream.borrow(),
            datagram: *self.datagram.borrow(),
        }
    }
}

/// Handle to the running bridge supervisors.
pub struct BridgeClient {
    shutdown: watch::Sender<bool>,
    status: BridgeStatus,
    tasks: Vec<JoinHandle<()>>,
}

impl BridgeClient {
    /// Starts one supervisor per configured upstream.
    pub fn start(config: BridgeConfig, sse: SseHub) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (stream_tx, stream) = watch::channel(UpstreamState::Offline);
        let (datagram_tx, datagram) = watch::channel(UpstreamState::Offline);
        let mut tasks = Vec::new();

        if let Some(addr) = config.stream_addr {
            let supervisor = Supervisor {
                kind: EventKind::Progress,
                addr,
                config: config.clone(),
                sse: sse.clone(),
                state: stream_tx,
                shutdown: shutdown_rx.clone(),
            };
            tasks.push(tokio::spawn(supervisor.run::<StreamLink>()));
        }
        if let Some(addr) = config.datagram_addr {
            let supervisor = Supervisor {
                kind: EventKind::Notification,
                addr,
                config: config.clone(),
                sse,
                state: datagram_tx,
                shutdown: shutdown_rx,
            };
            tasks.push(tokio::spawn(supervisor.run::<DatagramLink>()));
        }

        Self {
            shutdown,
            status: BridgeStatus { stream, datagram },
            tasks,
        }
    }

    /// Read-only view of the upstream states.
    pub fn status(&self) -> BridgeStatus {
        self.status.clone()
    }

    /// Stops both supervisors, unregistering from the datagram upstream.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Bridge supervisor panicked");
            }
        }
        info!("Bridge stopped");
    }
}

/// A connected upstream.
#[async_trait]
trait Link: Sized + Send {
    const TRANSPORT: &'static str;

    async fn connect(addr: SocketAddr, config: &BridgeConfig) -> Result<Self>;

    /// Waits for the next event. `Ok(None)` means a frame was consumed that
    /// carried no event. Must be cancel safe.
    async fn next_event(&mut self) -> Result<Option<Event>>;

    async fn close(self);
}

enum Ended {
    Shutdown,
    Lost(RealtimeError),
}

struct Supervisor {
    kind: EventKind,
    addr: SocketAddr,
    config: BridgeConfig,
    sse: SseHub,
    state: watch::Sender<UpstreamState>,
    shutdown: watch::Receiver<bool>,
}

impl Supervisor {
    async fn run<L: Link>(mut self) {
        let policy = RetryPolicy::fixed(self.config.max_attempts, self.config.retry_delay);
        let target = format!("{}://{}", L::TRANSPORT, self.addr);
        debug!(
            upstream = %target,
            max_attempts = policy.max_attempts,
            retry_budget_ms = policy.budget().as_millis() as u64,
            "Bridge supervisor started"
        );

        loop {
            self.set_state(UpstreamState::Connecting).await;
            let addr = self.addr;
            let config = &self.config;
            let connected = policy
                .execute(&target, &mut self.shutdown, |_| L::connect(addr, config))
                .await;

            let Some(link) = connected else {
                if !*self.shutdown.borrow() {
                    warn!(upstream = %target, feed = %self.kind, "Upstream unreachable, feed is offline");
                }
                break;
            };

            info!(upstream = %target, "Bridge connected");
            self.set_state(UpstreamState::Online).await;

            match self.pump(link).await {
                Ended::Shutdown => break,
                Ended::Lost(e) => {
                    warn!(upstream = %target, error = %e, "Bridge lost upstream, reconnecting");
                }
            }
        }

        self.set_state(UpstreamState::Offline).await;
    }

    async fn pump<L: Link>(&mut self, mut link: L) -> Ended {
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    link.close().await;
                    return Ended::Shutdown;
                }
                next = link.next_event() => match next {
                    Ok(Some(event)) => {
                        if self.sse.publish(event).await.is_err() {
                            // Nobody left to deliver to.
                            link.close().await;
                            return Ended::Shutdown;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => return Ended::Lost(e),
                }
            }
        }
    }

    async fn set_state(&self, state: UpstreamState) {
        self.state.send_replace(state);
        let _ = self.sse.set_status(self.kind, state).await;
    }
}

/// Stream upstream: newline-delimited JSON over TCP.
struct StreamLink {
    frames: FramedRead<OwnedReadHalf, LineCodec>,
    writer: OwnedWriteHalf,
    probe: Interval,
    write_deadline: std::time::Duration,
}

#[async_trait]
impl Link for StreamLink {
    const TRANSPORT: &'static str = "tcp";

    async fn connect(addr: SocketAddr, config: &BridgeConfig) -> Result<Self> {
        let socket = timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| RealtimeError::TransientNetwork(format!("connect to {addr} timed out")))?
            .map_err(|e| RealtimeError::TransientNetwork(e.to_string()))?;
        let (reader, writer) = socket.into_split();

        let mut probe = interval(config.heartbeat_interval);
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
        probe.reset();

        Ok(Self {
            frames: FramedRead::new(reader, LineCodec::default()),
            writer,
            probe,
            write_deadline: config.connect_timeout,
        })
    }

    async fn next_event(&mut self) -> Result<Option<Event>> {
        tokio::select! {
            _ = self.probe.tick() => {
                let probe = format!("{PING}\n");
                timeout(self.write_deadline, self.writer.write_all(probe.as_bytes()))
                    .await
                    .map_err(|_| RealtimeError::WriteTimeout(self.write_deadline))??;
                Ok(None)
            }
            frame = self.frames.next() => {
                let Some(frame) = frame.transpose()? else {
                    return Err(RealtimeError::TransientNetwork("upstream closed the stream".into()));
                };
                match frame {
                    StreamFrame::Progress(event) => Ok(Some(event.into())),
                    StreamFrame::Malformed(reason) => {
                        debug!(error = %reason, "Discarding malformed upstream line");
                        Ok(None)
                    }
                    StreamFrame::Ping | StreamFrame::Pong => Ok(None),
                }
            }
        }
    }

    async fn close(mut self) {
        let _ = self.writer.shutdown().await;
    }
}

/// Datagram upstream: a registered UDP client.
struct DatagramLink {
    socket: UdpSocket,
    liveness: std::time::Duration,
    last_ping: Instant,
    buf: Vec<u8>,
}

#[async_trait]
impl Link for DatagramLink {
    const TRANSPORT: &'static str = "udp";

    async fn connect(addr: SocketAddr, config: &BridgeConfig) -> Result<Self> {
        let local: SocketAddr = if addr.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(addr).await?;
        socket
            .send(REGISTER.as_bytes())
            .await
            .map_err(|e| RealtimeError::TransientNetwork(e.to_string()))?;

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let acked = timeout(config.connect_timeout, async {
            loop {
                let len = socket.recv(&mut buf).await?;
                if DatagramFrame::parse(&buf[..len])
                    == DatagramFrame::Control(Control::Registered)
                {
                    return Ok::<_, std::io::Error>(());
                }
            }
        })
        .await;
        match acked {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(RealtimeError::TransientNetwork(e.to_string())),
            Err(_) => {
                return Err(RealtimeError::TransientNetwork(format!(
                    "no registration ack from {addr}"
                )))
            }
        }

        Ok(Self {
            socket,
            liveness: config.liveness_window(),
            last_ping: Instant::now(),
            buf,
        })
    }

    async fn next_event(&mut self) -> Result<Option<Event>> {
        let deadline = self.last_ping + self.liveness;
        let len = match timeout_at(deadline, self.socket.recv(&mut self.buf)).await {
            Ok(received) => received.map_err(|e| RealtimeError::TransientNetwork(e.to_string()))?,
            Err(_) => {
                return Err(RealtimeError::TransientNetwork(
                    "upstream stopped sending heartbeats".into(),
                ))
            }
        };

        match DatagramFrame::parse(&self.buf[..len]) {
            DatagramFrame::Notification(event) => Ok(Some(event.into())),
            DatagramFrame::Control(Control::Ping) => {
                self.last_ping = Instant::now();
                self.socket
                    .send(PONG.as_bytes())
                    .await
                    .map_err(|e| RealtimeError::TransientNetwork(e.to_string()))?;
                Ok(None)
            }
            DatagramFrame::Control(_) => Ok(None),
            DatagramFrame::Malformed(reason) => {
                debug!(error = %reason, "Discarding malformed upstream datagram");
                Ok(None)
            }
        }
    }

    async fn close(self) {
        if let Err(e) = self.socket.send(UNREGISTER.as_bytes()).await {
            debug!(error = %e, "Failed to unregister from upstream");
        }
    }
}
