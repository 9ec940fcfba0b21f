//! Runtime tunables for the registries, hubs and bridge.

use std::net::SocketAddr;
use std::time::Duration;

/// Default per-write deadline for stream and room peers.
pub const DEFAULT_WRITE_DEADLINE: Duration = Duration::from_secs(5);

/// Default heartbeat interval for datagram clients and SSE keepalives.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default size of every coordinator mailbox.
pub const DEFAULT_MAILBOX_SIZE: usize = 1024;

/// Configuration for the stream registry.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Deadline for a single write to a single peer.
    pub write_deadline: Duration,
    /// Size of the coordinator mailbox.
    pub mailbox_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            write_deadline: DEFAULT_WRITE_DEADLINE,
            mailbox_size: DEFAULT_MAILBOX_SIZE,
        }
    }
}

/// Configuration for the datagram registry.
#[derive(Debug, Clone)]
pub struct DatagramConfig {
    /// How often every registered client is sent a `PING`.
    pub heartbeat_interval: Duration,
    /// Heartbeat intervals a client may stay silent before eviction.
    pub missed_heartbeats: u32,
    /// Deadline for a single `send_to`.
    pub send_deadline: Duration,
    /// Size of the coordinator mailbox.
    pub mailbox_size: usize,
}

impl DatagramConfig {
    /// Silence after which a client is evicted.
    pub fn eviction_after(&self) -> Duration {
        self.heartbeat_interval * self.missed_heartbeats.max(1)
    }
}

impl Default for DatagramConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            missed_heartbeats: 2,
            send_deadline: Duration::from_secs(1),
            mailbox_size: DEFAULT_MAILBOX_SIZE,
        }
    }
}

/// Configuration for the chat room hub.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Deadline for a single write to a single member.
    pub write_deadline: Duration,
    /// Size of the hub mailbox and of every room mailbox.
    pub mailbox_size: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            write_deadline: DEFAULT_WRITE_DEADLINE,
            mailbox_size: DEFAULT_MAILBOX_SIZE,
        }
    }
}

/// Configuration for the SSE hub.
#[derive(Debug, Clone)]
pub struct SseConfig {
    /// Frames buffered per subscriber before the oldest is dropped.
    pub queue_size: usize,
    /// Interval between keepalive frames.
    pub keepalive_interval: Duration,
    /// Size of the coordinator mailbox.
    pub mailbox_size: usize,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            queue_size: 64,
            keepalive_interval: DEFAULT_HEARTBEAT_INTERVAL,
            mailbox_size: DEFAULT_MAILBOX_SIZE,
        }
    }
}

/// Configuration for the bridge client.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Stream registry to consume progress events from.
    pub stream_addr: Option<SocketAddr>,
    /// Datagram registry to consume notifications from.
    pub datagram_addr: Option<SocketAddr>,
    /// Connect attempts per cycle before the upstream is declared offline.
    pub max_attempts: u32,
    /// Fixed delay between connect attempts.
    pub retry_delay: Duration,
    /// Timeout of a single connect attempt.
    pub connect_timeout: Duration,
    /// Interval of the upstream liveness probe, and the expected datagram `PING` cadence.
    pub heartbeat_interval: Duration,
    /// Missed heartbeats after which a datagram upstream is considered dead.
    pub missed_heartbeats: u32,
}

impl BridgeConfig {
    /// Silence on the datagram upstream after which it is considered dead.
    pub fn liveness_window(&self) -> Duration {
        self.heartbeat_interval * self.missed_heartbeats.max(1)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            stream_addr: None,
            datagram_addr: None,
            max_attempts: 10,
            retry_delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(3),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            missed_heartbeats: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        assert_eq!(StreamConfig::default().write_deadline, Duration::from_secs(5));
        assert_eq!(
            DatagramConfig::default().eviction_after(),
            Duration::from_secs(60)
        );
        let bridge = BridgeConfig::default();
        assert_eq!(bridge.max_attempts, 10);
        assert_eq!(bridge.retry_delay, Duration::from_secs(5));
        assert!(bridge.connect_timeout <= Duration::from_secs(3));
    }
}
