//! Error types for the real-time module.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in real-time operations.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// Connect refused or timed out; only the bridge retries these.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// A write to a single peer failed; the peer is dropped, never retried.
    #[error("peer write failed: {0}")]
    PeerWrite(String),

    /// A write to a single peer did not finish before its deadline.
    #[error("write deadline of {0:?} exceeded")]
    WriteTimeout(Duration),

    /// An undecodable frame; discarded, the connection stays up.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Missing or invalid identity on subscribe.
    #[error("authentication failed: {0}")]
    AuthFailure(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The owning coordinator has shut down.
    #[error("channel closed")]
    ChannelClosed,
}

impl RealtimeError {
    /// Whether the error describes a single peer failing (as opposed to the component).
    pub fn is_peer_failure(&self) -> bool {
        matches!(
            self,
            RealtimeError::PeerWrite(_) | RealtimeError::WriteTimeout(_)
        )
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for RealtimeError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        RealtimeError::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for RealtimeError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        RealtimeError::ChannelClosed
    }
}

/// A specialized Result type for real-time operations.
pub type Result<T> = std::result::Result<T, RealtimeError>;
