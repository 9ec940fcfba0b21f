//! # Shelfcast Real-time
//!
//! Real-time fan-out core for the shelfcast reading platform.
//!
//! Reading progress and content notifications are pushed to connected
//! clients over four independent transports:
//!
//! - **Stream registry**: persistent TCP peers, newline-delimited JSON progress events
//! - **Datagram registry**: registered UDP clients, notifications, heartbeat eviction
//! - **Room hub**: topic-scoped chat rooms over a message-oriented socket
//! - **SSE hub**: browser event streams, fed by the bridge client
//!
//! ## Architecture
//!
//! ```text
//!  producers ──Broadcast──► StreamRegistry ──► TCP peers
//!      │                         │
//!      └──────Broadcast──► DatagramRegistry ─► UDP clients
//!                                │  │
//!                                ▼  ▼
//!                           BridgeClient ──Publish──► SseHub ──► browsers
//!
//!  chat sockets ──join/leave/message──► RoomHub ──► RoomActor per room
//! ```
//!
//! Every registry, hub and room is a single actor that exclusively owns its
//! connection set. The public types are cloneable mailboxes; an actor stops
//! once every mailbox clone has been dropped.
//!
//! ## Example
//!
//! ```rust,no_run
//! use shelfcast_realtime::{StreamConfig, StreamRegistry};
//! use shelfcast_types::ProgressEvent;
//!
//! # async fn demo() -> shelfcast_realtime::Result<()> {
//! let registry = StreamRegistry::spawn(StreamConfig::default());
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:9001").await?;
//! tokio::spawn(registry.clone().serve(listener));
//!
//! registry
//!     .broadcast(ProgressEvent::new("u1", "alice", "book-1", 0.42))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
mod codec;
pub mod config;
pub mod connection;
pub mod datagram;
pub mod error;
pub mod retry;
pub mod room;
pub mod sse;
pub mod stream;

// Re-export main types
pub use bridge::{BridgeClient, BridgeSnapshot, BridgeStatus, UpstreamState};
pub use config::{BridgeConfig, DatagramConfig, RoomConfig, SseConfig, StreamConfig};
pub use connection::{ChannelSink, Closed, ConnId, Connection, FrameSink, LineSink};
pub use datagram::{DatagramRegistry, DatagramStats};
pub use error::{RealtimeError, Result};
pub use retry::RetryPolicy;
pub use room::{ChatSession, RoomHub, RoomSnapshot};
pub use sse::{SseFrame, SseHub, SseStats, Subscription};
pub use stream::{StreamRegistry, StreamStats};

#[cfg(test)]
mod tests {
    use super::*;
    use shelfcast_types::{EventKind, ProgressEvent};
    use std::time::Duration;

    #[tokio::test]
    async fn test_full_flow() {
        let sse = SseHub::spawn(SseConfig::default());
        let stream = StreamRegistry::spawn(StreamConfig::default());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(stream.clone().serve(listener));

        let mut browser = sse.subscribe(EventKind::Progress, "tab-1").await.unwrap();
        let bridge = BridgeClient::start(
            BridgeConfig {
                stream_addr: Some(addr),
                retry_delay: Duration::from_millis(20),
                ..Default::default()
            },
            sse.clone(),
        );

        let mut state = bridge.status().watch(EventKind::Progress);
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == UpstreamState::Online),
        )
        .await
        .unwrap()
        .unwrap();

        // the bridge is an ordinary peer; wait until it is registered
        let mut delivered = 0;
        for _ in 0..100 {
            delivered = stream
                .broadcast_confirmed(ProgressEvent::new("u1", "alice", "book-1", 0.5))
                .await
                .unwrap();
            if delivered > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(delivered, 1);

        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), browser.recv())
                .await
                .unwrap()
                .unwrap();
            if let SseFrame::Event { kind, .. } = frame {
                assert_eq!(kind, EventKind::Progress);
                break;
            }
        }

        bridge.shutdown().await;
        assert_eq!(sse.stats().await.unwrap().progress, 1);
    }
}
