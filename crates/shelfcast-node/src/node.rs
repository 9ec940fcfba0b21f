//! Node lifecycle: binds every listener, wires the components together and
//! tears them down again.

use shelfcast_realtime::{
    BridgeClient, DatagramRegistry, RealtimeError, RoomHub, SseHub, StreamRegistry,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::api::{create_router, AppState};
use crate::auth::TokenVerifier;
use crate::config::NodeConfig;

/// Errors raised while starting a node.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("failed to bind {what} on {addr}: {source}")]
    Bind {
        what: &'static str,
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Realtime(#[from] RealtimeError),
}

/// A running node.
pub struct Node {
    http_addr: SocketAddr,
    stream_addr: SocketAddr,
    datagram_addr: SocketAddr,
    state: AppState,
    bridge: BridgeClient,
    stream_task: JoinHandle<Result<(), RealtimeError>>,
    http_task: JoinHandle<()>,
    http_shutdown: oneshot::Sender<()>,
    shutdown_grace: Duration,
}

impl Node {
    /// Starts every component described by `config`.
    pub async fn start(config: NodeConfig) -> Result<Self, NodeError> {
        config.validate()?;

        let sse = SseHub::spawn(config.sse_config());
        let rooms = RoomHub::spawn(config.room_config());

        let stream = StreamRegistry::spawn(config.stream_config());
        let stream_listener = bind("stream registry", config.stream.listen).await?;
        let stream_addr = stream_listener.local_addr()?;
        let stream_task = tokio::spawn(stream.clone().serve(stream_listener));

        let datagram = DatagramRegistry::bind(config.datagram.listen, config.datagram_config())
            .await
            .map_err(|e| match e {
                RealtimeError::Io(source) => NodeError::Bind {
                    what: "datagram registry",
                    addr: config.datagram.listen,
                    source,
                },
                other => other.into(),
            })?;
        let datagram_addr = datagram.local_addr();

        let bridge = BridgeClient::start(
            config.bridge_config(stream_addr, datagram_addr),
            sse.clone(),
        );

        let state = AppState {
            stream,
            datagram,
            rooms,
            sse,
            bridge: bridge.status(),
            verifier: Arc::new(TokenVerifier::new(
                config.auth.secret.as_bytes(),
                config.auth.issuer.as_deref(),
            )),
            chat_write_deadline: Duration::from_millis(config.rooms.write_deadline_ms),
        };

        let http_listener = bind("http", config.http.listen).await?;
        let http_addr = http_listener.local_addr()?;
        let (http_shutdown, shutdown_rx) = oneshot::channel::<()>();
        let router = create_router(state.clone());
        let http_task = tokio::spawn(async move {
            let server = axum::serve(http_listener, router).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                error!(error = %e, "HTTP server failed");
            }
        });

        info!(
            http = %http_addr,
            stream = %stream_addr,
            datagram = %datagram_addr,
            bridge = config.bridge.enabled,
            "Node started"
        );

        Ok(Self {
            http_addr,
            stream_addr,
            datagram_addr,
            state,
            bridge,
            stream_task,
            http_task,
            http_shutdown,
            shutdown_grace: Duration::from_millis(config.http.shutdown_grace_ms),
        })
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn stream_addr(&self) -> SocketAddr {
        self.stream_addr
    }

    pub fn datagram_addr(&self) -> SocketAddr {
        self.datagram_addr
    }

    /// Shared state, for producers running in the same process.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Stops accepting, stops the bridge, and gives open HTTP streams the
    /// configured grace period before cutting them.
    pub async fn shutdown(self) {
        let _ = self.http_shutdown.send(());
        self.bridge.shutdown().await;
        self.stream_task.abort();

        let mut http_task = self.http_task;
        if tokio::time::timeout(self.shutdown_grace, &mut http_task)
            .await
            .is_err()
        {
            warn!("Open HTTP streams outlived the shutdown grace period");
            http_task.abort();
        }
        info!("Node stopped");
    }
}

async fn bind(what: &'static str, addr: SocketAddr) -> Result<TcpListener, NodeError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| NodeError::Bind { what, addr, source })
}
