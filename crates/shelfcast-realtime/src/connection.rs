//! Connections and the write side of every transport.
//!
//! A [`Connection`] is the write half of a peer plus its identity. Whoever
//! holds the value owns the peer: registries and rooms take it by value, so a
//! connection can never sit in two of them at once. Dropping it fires the
//! [`Closed`] signal held by the connection's read task.

use crate::error::{RealtimeError, Result};
use async_trait::async_trait;
use futures::future::join_all;
use shelfcast_types::Identity;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

/// Unique identifier of an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(uuid::Uuid);

impl ConnId {
    /// Generates a fresh identifier.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let simple = self.0.simple().to_string();
        f.write_str(&simple[..8])
    }
}

/// Outbound half of a transport.
#[async_trait]
pub trait FrameSink: Send + 'static {
    /// Writes one complete frame.
    async fn send_frame(&mut self, frame: &str) -> std::io::Result<()>;

    /// Closes the transport. Errors are ignored.
    async fn close(&mut self) {}
}

/// Newline-delimited frames over any async writer (a TCP write half, usually).
pub struct LineSink<W> {
    writer: W,
}

impl<W> LineSink<W> {
    /// Wraps a writer.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl<W> FrameSink for LineSink<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn send_frame(&mut self, frame: &str) -> std::io::Result<()> {
        self.writer.write_all(frame.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }

    async fn close(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

/// Frames delivered into a bounded in-process channel.
///
/// A full channel makes `send_frame` wait, which is how a slow consumer looks
/// to a coordinator.
pub struct ChannelSink {
    sender: mpsc::Sender<String>,
}

impl ChannelSink {
    /// Creates a sink and the receiver that observes it.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send_frame(&mut self, frame: &str) -> std::io::Result<()> {
        self.sender
            .send(frame.to_owned())
            .await
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe))
    }
}

/// Resolves once the owning registry has dropped the connection.
pub type Closed = oneshot::Receiver<()>;

/// An accepted peer: identity plus exclusive write access.
pub struct Connection {
    /// Unique identifier.
    pub id: ConnId,
    /// Who is on the other end.
    pub identity: Identity,
    sink: Box<dyn FrameSink>,
    _closer: oneshot::Sender<()>,
}

impl Connection {
    /// Wraps a sink, returning the connection and its closed signal.
    pub fn new(identity: Identity, sink: impl FrameSink) -> (Self, Closed) {
        let (closer, closed) = oneshot::channel();
        let conn = Self {
            id: ConnId::new(),
            identity,
            sink: Box::new(sink),
            _closer: closer,
        };
        (conn, closed)
    }

    /// Writes one frame, giving up after `deadline`.
    pub async fn send(&mut self, frame: &str, deadline: Duration) -> Result<()> {
        match tokio::time::timeout(deadline, self.sink.send_frame(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(RealtimeError::PeerWrite(e.to_string())),
            Err(_) => Err(RealtimeError::WriteTimeout(deadline)),
        }
    }

    /// Closes the transport and consumes the connection.
    pub async fn close(mut self) {
        self.sink.close().await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .finish()
    }
}

/// Writes `frame` to every connection concurrently and returns the ids that failed.
///
/// Each write is bounded by `deadline`, so the whole call is too.
pub(crate) async fn fan_out<'a, I>(
    targets: I,
    frame: &str,
    deadline: Duration,
) -> Vec<(ConnId, RealtimeError)>
where
    I: IntoIterator<Item = &'a mut Connection>,
{
    let writes = targets.into_iter().map(|conn| async move {
        let id = conn.id;
        conn.send(frame, deadline).await.err().map(|e| (id, e))
    });
    join_all(writes).await.into_iter().flatten().collect()
}
