//! Node configuration.
//!
//! Values are layered: built-in defaults, then an optional YAML/TOML file,
//! then `SHELFCAST_`-prefixed environment variables (`__` separates nested
//! keys, e.g. `SHELFCAST_HTTP__LISTEN=0.0.0.0:8080`), then CLI flags.

use serde::{Deserialize, Serialize};
use shelfcast_realtime::{BridgeConfig, DatagramConfig, RoomConfig, SseConfig, StreamConfig};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "SHELFCAST";

/// Top-level node configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeConfig {
    pub http: HttpSection,
    pub stream: StreamSection,
    pub datagram: DatagramSection,
    pub rooms: RoomsSection,
    pub sse: SseSection,
    pub bridge: BridgeSection,
    pub auth: AuthSection,
    pub log: LogSection,
}

/// HTTP listener (SSE, chat WebSocket, status, ingest).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpSection {
    pub listen: SocketAddr,
    /// How long open streams may delay shutdown before they are cut.
    pub shutdown_grace_ms: u64,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            shutdown_grace_ms: 5_000,
        }
    }
}

/// Stream registry listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamSection {
    pub listen: SocketAddr,
    pub write_deadline_ms: u64,
    pub mailbox_size: usize,
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 9001)),
            write_deadline_ms: 5_000,
            mailbox_size: 1024,
        }
    }
}

/// Datagram registry socket.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatagramSection {
    pub listen: SocketAddr,
    pub heartbeat_interval_ms: u64,
    pub missed_heartbeats: u32,
    pub mailbox_size: usize,
}

impl Default for DatagramSection {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 9002)),
            heartbeat_interval_ms: 30_000,
            missed_heartbeats: 2,
            mailbox_size: 1024,
        }
    }
}

/// Chat rooms.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RoomsSection {
    pub write_deadline_ms: u64,
    pub mailbox_size: usize,
}

impl Default for RoomsSection {
    fn default() -> Self {
        Self {
            write_deadline_ms: 5_000,
            mailbox_size: 1024,
        }
    }
}

/// Browser event streams.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SseSection {
    /// Frames buffered per subscriber; the oldest is dropped when full.
    pub queue_size: usize,
    pub keepalive_ms: u64,
}

impl Default for SseSection {
    fn default() -> Self {
        Self {
            queue_size: 64,
            keepalive_ms: 30_000,
        }
    }
}

/// Bridge from the socket registries to the SSE hub.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BridgeSection {
    pub enabled: bool,
    /// Upstream stream registry; defaults to this node's own.
    pub stream_addr: Option<SocketAddr>,
    /// Upstream datagram registry; defaults to this node's own.
    pub datagram_addr: Option<SocketAddr>,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub missed_heartbeats: u32,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            enabled: true,
            stream_addr: None,
            datagram_addr: None,
            max_attempts: 10,
            retry_delay_ms: 5_000,
            connect_timeout_ms: 3_000,
            heartbeat_interval_ms: 30_000,
            missed_heartbeats: 2,
        }
    }
}

/// Token verification.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthSection {
    /// HS256 signing secret.
    pub secret: String,
    /// Required `iss` claim, if any.
    pub issuer: Option<String>,
}

/// Logging.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogSection {
    pub level: String,
    pub json: bool,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl NodeConfig {
    /// Loads defaults, the optional file at `path`, and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        Self::load_with_env(path, None)
    }

    /// Like [`NodeConfig::load`], reading variables from `env` instead of the process environment.
    pub fn load_with_env(
        path: Option<&Path>,
        env: Option<config::Map<String, String>>,
    ) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()?;

        let node: NodeConfig = config.try_deserialize()?;
        node.validate()?;
        Ok(node)
    }

    /// Rejects values the node cannot run with.
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        let invalid = |msg: &str| Err(config::ConfigError::Message(msg.to_string()));

        if self.auth.secret.is_empty() {
            return invalid("auth.secret must be set");
        }
        if self.sse.queue_size == 0 {
            return invalid("sse.queue_size must be positive");
        }
        if self.datagram.missed_heartbeats == 0 || self.bridge.missed_heartbeats == 0 {
            return invalid("missed_heartbeats must be positive");
        }
        if self.datagram.heartbeat_interval_ms == 0
            || self.bridge.heartbeat_interval_ms == 0
            || self.sse.keepalive_ms == 0
        {
            return invalid("heartbeat and keepalive periods must be positive");
        }
        if self.bridge.enabled && self.bridge.datagram_addr.is_none() {
            let window = self
                .bridge
                .heartbeat_interval_ms
                .saturating_mul(u64::from(self.bridge.missed_heartbeats));
            if window <= self.datagram.heartbeat_interval_ms {
                return invalid(
                    "bridge.heartbeat_interval_ms * bridge.missed_heartbeats must exceed \
                     datagram.heartbeat_interval_ms",
                );
            }
        }
        if self.bridge.max_attempts == 0 {
            return invalid("bridge.max_attempts must be positive");
        }
        if self.stream.mailbox_size == 0
            || self.datagram.mailbox_size == 0
            || self.rooms.mailbox_size == 0
        {
            return invalid("mailbox_size must be positive");
        }
        Ok(())
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            write_deadline: Duration::from_millis(self.stream.write_deadline_ms),
            mailbox_size: self.stream.mailbox_size,
        }
    }

    pub fn datagram_config(&self) -> DatagramConfig {
        DatagramConfig {
            heartbeat_interval: Duration::from_millis(self.datagram.heartbeat_interval_ms),
            missed_heartbeats: self.datagram.missed_heartbeats,
            mailbox_size: self.datagram.mailbox_size,
            ..Default::default()
        }
    }

    pub fn room_config(&self) -> RoomConfig {
        RoomConfig {
            write_deadline: Duration::from_millis(self.rooms.write_deadline_ms),
            mailbox_size: self.rooms.mailbox_size,
        }
    }

    pub fn sse_config(&self) -> SseConfig {
        SseConfig {
            queue_size: self.sse.queue_size,
            keepalive_interval: Duration::from_millis(self.sse.keepalive_ms),
            ..Default::default()
        }
    }

    /// Bridge settings; unset upstreams fall back to the given local registries.
    pub fn bridge_config(&self, local_stream: SocketAddr, local_datagram: SocketAddr) -> BridgeConfig {
        let (stream_addr, datagram_addr) = if self.bridge.enabled {
            (
                Some(self.bridge.stream_addr.unwrap_or_else(|| loopback(local_stream))),
                Some(self.bridge.datagram_addr.unwrap_or_else(|| loopback(local_datagram))),
            )
        } else {
            (None, None)
        };

        BridgeConfig {
            stream_addr,
            datagram_addr,
            max_attempts: self.bridge.max_attempts,
            retry_delay: Duration::from_millis(self.bridge.retry_delay_ms),
            connect_timeout: Duration::from_millis(self.bridge.connect_timeout_ms),
            heartbeat_interval: Duration::from_millis(self.bridge.heartbeat_interval_ms),
            missed_heartbeats: self.bridge.missed_heartbeats,
        }
    }
}

/// Wildcard listen addresses are reached over loopback.
fn loopback(addr: SocketAddr) -> SocketAddr {
    let mut addr = addr;
    if addr.ip().is_unspecified() {
        let ip = if addr.is_ipv4() {
            std::net::Ipv4Addr::LOCALHOST.into()
        } else {
            std::net::Ipv6Addr::LOCALHOST.into()
        };
        addr.set_ip(ip);
    }
    addr
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> Option<config::Map<String, String>> {
        let mut map = config::Map::new();
        for (k, v) in pairs {
            map.insert(k.to_string(), v.to_string());
        }
        Some(map)
    }

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.http.listen.port(), 8080);
        assert_eq!(config.stream.listen.port(), 9001);
        assert_eq!(config.datagram.listen.port(), 9002);
        assert_eq!(config.sse.queue_size, 64);
        assert_eq!(config.bridge.max_attempts, 10);
        assert_eq!(config.stream_config().write_deadline, Duration::from_secs(5));
        assert_eq!(
            config.datagram_config().eviction_after(),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_missing_secret_rejected() {
        let err = NodeConfig::load_with_env(None, env(&[])).unwrap_err();
        assert!(err.to_string().contains("auth.secret"));
    }

    #[test]
    fn test_env_overrides() {
        let config = NodeConfig::load_with_env(
            None,
            env(&[
                ("SHELFCAST_AUTH__SECRET", "s3cret"),
                ("SHELFCAST_HTTP__LISTEN", "127.0.0.1:18080"),
                ("SHELFCAST_SSE__QUEUE_SIZE", "8"),
                ("SHELFCAST_BRIDGE__ENABLED", "false"),
            ]),
        )
        .unwrap();
        assert_eq!(config.auth.secret, "s3cret");
        assert_eq!(config.http.listen, "127.0.0.1:18080".parse().unwrap());
        assert_eq!(config.sse.queue_size, 8);
        assert!(!config.bridge.enabled);
    }

    #[test]
    fn test_file_then_env() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "auth:\n  secret: from-file\nstream:\n  listen: 127.0.0.1:19001\nlog:\n  level: debug"
        )
        .unwrap();

        let config = NodeConfig::load_with_env(
            Some(file.path()),
            env(&[("SHELFCAST_LOG__LEVEL", "warn")]),
        )
        .unwrap();
        assert_eq!(config.auth.secret, "from-file");
        assert_eq!(config.stream.listen.port(), 19001);
        assert_eq!(config.log.level, "warn");
    }

    #[test]
    fn test_bridge_liveness_window_covers_local_heartbeat() {
        let raised = NodeConfig::load_with_env(
            None,
            env(&[
                ("SHELFCAST_AUTH__SECRET", "s3cret"),
                ("SHELFCAST_DATAGRAM__HEARTBEAT_INTERVAL_MS", "90000"),
            ]),
        )
        .unwrap_err();
        assert!(raised.to_string().contains("bridge.heartbeat_interval_ms"));

        let matched = NodeConfig::load_with_env(
            None,
            env(&[
                ("SHELFCAST_AUTH__SECRET", "s3cret"),
                ("SHELFCAST_DATAGRAM__HEARTBEAT_INTERVAL_MS", "90000"),
                ("SHELFCAST_BRIDGE__HEARTBEAT_INTERVAL_MS", "90000"),
            ]),
        );
        assert!(matched.is_ok());

        // a remote upstream has its own heartbeat
        let remote = NodeConfig::load_with_env(
            None,
            env(&[
                ("SHELFCAST_AUTH__SECRET", "s3cret"),
                ("SHELFCAST_DATAGRAM__HEARTBEAT_INTERVAL_MS", "90000"),
                ("SHELFCAST_BRIDGE__DATAGRAM_ADDR", "10.0.0.5:9002"),
            ]),
        );
        assert!(remote.is_ok());
    }

    #[test]
    fn test_bridge_targets_local_registries() {
        let config = NodeConfig::default();
        let bridge = config.bridge_config(
            "0.0.0.0:9001".parse().unwrap(),
            "127.0.0.1:9002".parse().unwrap(),
        );
        assert_eq!(bridge.stream_addr, Some("127.0.0.1:9001".parse().unwrap()));
        assert_eq!(bridge.datagram_addr, Some("127.0.0.1:9002".parse().unwrap()));

        let mut disabled = NodeConfig::default();
        disabled.bridge.enabled = false;
        let bridge = disabled.bridge_config(
            "0.0.0.0:9001".parse().unwrap(),
            "0.0.0.0:9002".parse().unwrap(),
        );
        assert!(bridge.stream_addr.is_none());
        assert!(bridge.datagram_addr.is_none());
    }
}
