//! SSE hub: fan-out of events to browser subscribers.
//!
//! Every subscriber gets its own bounded `broadcast` queue. Publishing never
//! waits on a subscriber: once a queue is full the oldest frame is
//! overwritten and the subscriber observes a lag on its next read.

use crate::bridge::UpstreamState;
use crate::config::SseConfig;
use crate::error::Result;
use futures::Stream;
use shelfcast_types::{Event, EventKind};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One frame on a subscriber's event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SseFrame {
    /// An event, already JSON-encoded.
    Event { kind: EventKind, data: Arc<str> },
    /// Upstream state of the feed.
    Status {
        kind: EventKind,
        state: UpstreamState,
    },
    /// Liveness frame, rendered as an SSE comment.
    KeepAlive,
}

impl SseFrame {
    /// SSE event name, `None` for keepalives.
    pub fn event_name(&self) -> Option<&'static str> {
        match self {
            SseFrame::Event { kind, .. } => Some(kind.as_str()),
            SseFrame::Status { .. } => Some("status"),
            SseFrame::KeepAlive => None,
        }
    }

    /// The `data:` payload.
    pub fn data(&self) -> String {
        match self {
            SseFrame::Event { data, .. } => data.to_string(),
            SseFrame::Status { kind, state } => {
                serde_json::json!({ "feed": kind, "state": state }).to_string()
            }
            SseFrame::KeepAlive => String::new(),
        }
    }
}

/// Messages sent to the SSE hub actor.
enum Message {
    Subscribe {
        kind: EventKind,
        client_id: String,
        response: oneshot::Sender<Subscription>,
    },
    Unsubscribe {
        client_id: String,
    },
    /// Sent by a dropped [`Subscription`]; ignored if the client re-subscribed since.
    Release {
        client_id: String,
        key: Uuid,
    },
    Publish {
        event: Event,
    },
    SetStatus {
        kind: EventKind,
        state: UpstreamState,
    },
    Stats {
        response: oneshot::Sender<SseStats>,
    },
}

/// SSE hub statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SseStats {
    /// Current progress subscribers.
    pub progress: usize,
    /// Current notification subscribers.
    pub notification: usize,
    /// Subscriptions since start.
    pub total_subscribed: u64,
    /// Events published since start.
    pub total_published: u64,
    /// Subscribers removed because their stream was gone.
    pub pruned: u64,
}

/// Mailbox of the SSE hub actor.
#[derive(Clone)]
pub struct SseHub {
    sender: mpsc::Sender<Message>,
}

impl SseHub {
    /// Spawns the hub actor and returns its mailbox.
    pub fn spawn(config: SseConfig) -> Self {
        let (sender, mailbox) = mpsc::channel(config.mailbox_size);
        let actor = Actor {
            release: sender.downgrade(),
            config,
            mailbox,
            subscribers: HashMap::new(),
            status: EventKind::ALL
                .iter()
                .map(|kind| (*kind, UpstreamState::Offline))
                .collect(),
            stats: SseStats::default(),
        };
        tokio::spawn(actor.run());
        Self { sender }
    }

    /// Opens an event stream of `kind` for `client_id`.
    ///
    /// The first frame is the current upstream status of the feed. A second
    /// subscription with the same client id replaces the first, whose stream ends.
    pub async fn subscribe(
        &self,
        kind: EventKind,
        client_id: impl Into<String>,
    ) -> Result<Subscription> {
        let (response, receiver) = oneshot::channel();
        self.sender
            .send(Message::Subscribe {
                kind,
                client_id: client_id.into(),
                response,
            })
            .await?;
        Ok(receiver.await?)
    }

    /// Ends a client's stream. Unknown ids are ignored.
    pub async fn unsubscribe(&self, client_id: impl Into<String>) -> Result<()> {
        self.sender
            .send(Message::Unsubscribe {
                client_id: client_id.into(),
            })
            .await?;
        Ok(())
    }

    /// Pushes an event to every subscriber of its kind.
    pub async fn publish(&self, event: impl Into<Event>) -> Result<()> {
        self.sender
            .send(Message::Publish {
                event: event.into(),
            })
            .await?;
        Ok(())
    }

    /// Records the upstream state of a feed and announces it to its subscribers.
    pub async fn set_status(&self, kind: EventKind, state: UpstreamState) -> Result<()> {
        self.sender
            .send(Message::SetStatus { kind, state })
            .await?;
        Ok(())
    }

    /// Current statistics.
    pub async fn stats(&self) -> Result<SseStats> {
        let (response, receiver) = oneshot::channel();
        self.sender.send(Message::Stats { response }).await?;
        Ok(receiver.await?)
    }
}

/// A live event stream. Dropping it releases the subscriber.
pub struct Subscription {
    client_id: String,
    key: Uuid,
    receiver: broadcast::Receiver<SseFrame>,
    release: mpsc::Sender<Message>,
}

impl Subscription {
    /// Client id this stream belongs to.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Next frame, or `None` once the hub has ended the stream.
    pub async fn recv(&mut self) -> Option<SseFrame> {
        loop {
            match self.receiver.recv().await {
                Ok(frame) => return Some(frame),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(client_id = %self.client_id, skipped, "Slow SSE subscriber dropped frames");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Turns the subscription into a `Stream` of frames.
    pub fn into_stream(self) -> impl Stream<Item = SseFrame> + Send + 'static {
        futures::stream::unfold(self, |mut subscription| async move {
            let frame = subscription.recv().await?;
            Some((frame, subscription))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let message = Message::Release {
            client_id: std::mem::take(&mut self.client_id),
            key: self.key,
        };
        if let Err(mpsc::error::TrySendError::Full(message)) = self.release.try_send(message) {
            let release = self.release.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = release.send(message).await;
                });
            }
        }
    }
}

struct Subscriber {
    kind: EventKind,
    key: Uuid,
    queue: broadcast::Sender<SseFrame>,
}

struct Actor {
    config: SseConfig,
    mailbox: mpsc::Receiver<Message>,
    release: mpsc::WeakSender<Message>,
    subscribers: HashMap<String, Subscriber>,
    status: HashMap<EventKind, UpstreamState>,
    stats: SseStats,
}

impl Actor {
    async fn run(mut self) {
        let mut keepalive = interval(self.config.keepalive_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        keepalive.tick().await;

        loop {
            tokio::select! {
                message = self.mailbox.recv() => {
                    let Some(message) = message else { break };
                    self.handle(message);
                }
                _ = keepalive.tick() => {
                    self.deliver(None, SseFrame::KeepAlive);
                }
            }
        }
        debug!("SSE hub stopped");
    }

    fn handle(&mut self, message: Message) {
        match message {
            Message::Subscribe {
                kind,
                client_id,
                response,
            } => {
                // Subscriptions hold a strong sender for release; the actor only keeps a weak one.
                let Some(release) = self.release.upgrade() else {
                    return;
                };
                let (queue, receiver) = broadcast::channel(self.config.queue_size.max(1));
                let state = self.status.get(&kind).copied().unwrap_or(UpstreamState::Offline);
                let _ = queue.send(SseFrame::Status { kind, state });

                let key = Uuid::new_v4();
                if self
                    .subscribers
                    .insert(client_id.clone(), Subscriber { kind, key, queue })
                    .is_some()
                {
                    debug!(client_id = %client_id, "Replaced existing SSE subscription");
                }
                self.stats.total_subscribed += 1;
                info!(client_id = %client_id, kind = %kind, "SSE subscriber connected");

                let subscription = Subscription {
                    client_id: client_id.clone(),
                    key,
                    receiver,
                    release,
                };
                if response.send(subscription).is_err() {
                    self.subscribers.remove(&client_id);
                }
            }
            Message::Unsubscribe { client_id } => {
                if self.subscribers.remove(&client_id).is_some() {
                    info!(client_id = %client_id, "SSE subscriber removed");
                }
            }
            Message::Release { client_id, key } => {
                if self.subscribers.get(&client_id).map(|s| s.key) == Some(key) {
                    self.subscribers.remove(&client_id);
                    info!(client_id = %client_id, "SSE subscriber disconnected");
                }
            }
            Message::Publish { event } => {
                let kind = event.kind();
                match event.to_json() {
                    Ok(json) => {
                        self.stats.total_published += 1;
                        let data: Arc<str> = Arc::from(json);
                        self.deliver(Some(kind), SseFrame::Event { kind, data });
                    }
                    Err(e) => warn!(error = %e, "Failed to encode SSE event"),
                }
            }
            Message::SetStatus { kind, state } => {
                if self.status.insert(kind, state) != Some(state) {
                    info!(kind = %kind, state = ?state, "Feed status changed");
                    self.deliver(Some(kind), SseFrame::Status { kind, state });
                }
            }
            Message::Stats { response } => {
                let mut stats = self.stats.clone();
                stats.progress = self.count(EventKind::Progress);
                stats.notification = self.count(EventKind::Notification);
                let _ = response.send(stats);
            }
        }
    }

    fn count(&self, kind: EventKind) -> usize {
        self.subscribers.values().filter(|s| s.kind == kind).count()
    }

    /// Queues `frame` for every subscriber of `kind` (all when `None`),
    /// pruning subscribers whose stream is gone.
    fn deliver(&mut self, kind: Option<EventKind>, frame: SseFrame) {
        let mut gone = Vec::new();
        for (client_id, subscriber) in &self.subscribers {
            if kind.is_some_and(|k| k != subscriber.kind) {
                continue;
            }
            if subscriber.queue.send(frame.clone()).is_err() {
                gone.push(client_id.clone());
            }
        }
        for client_id in gone {
            self.subscribers.remove(&client_id);
            self.stats.pruned += 1;
            debug!(client_id = %client_id, "Pruned SSE subscriber");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use shelfcast_types::{NotificationEvent, ProgressEvent};
    use std::time::Duration;

    fn progress(value: f64) -> ProgressEvent {
        ProgressEvent::new("u1", "alice", "book-1", value)
    }

    async fn next(sub: &mut Subscription) -> SseFrame {
        tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("frame expected")
            .expect("stream open")
    }

    async fn skip_status(sub: &mut Subscription) {
        assert!(matches!(next(sub).await, SseFrame::Status { .. }));
    }

    #[tokio::test]
    async fn test_subscribe_starts_with_status() {
        let hub = SseHub::spawn(SseConfig::default());
        hub.set_status(EventKind::Progress, UpstreamState::Online)
            .await
            .unwrap();

        let mut sub = hub.subscribe(EventKind::Progress, "c1").await.unwrap();
        assert_eq!(
            next(&mut sub).await,
            SseFrame::Status {
                kind: EventKind::Progress,
                state: UpstreamState::Online,
            }
        );
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_kind_only() {
        let hub = SseHub::spawn(SseConfig::default());
        let mut p = hub.subscribe(EventKind::Progress, "p").await.unwrap();
        let mut n = hub.subscribe(EventKind::Notification, "n").await.unwrap();
        skip_status(&mut p).await;
        skip_status(&mut n).await;

        hub.publish(progress(0.5)).await.unwrap();
        hub.publish(NotificationEvent::new("new_review", "book-1", "hi"))
            .await
            .unwrap();

        match next(&mut p).await {
            SseFrame::Event { kind, data } => {
                assert_eq!(kind, EventKind::Progress);
                let json: serde_json::Value = serde_json::from_str(&data).unwrap();
                assert_eq!(json["item_id"], "book-1");
            }
            other => panic!("unexpected frame {other:?}"),
        }
        assert!(
            matches!(next(&mut n).await, SseFrame::Event { kind: EventKind::Notification, .. })
        );
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let hub = SseHub::spawn(SseConfig {
            queue_size: 4,
            ..Default::default()
        });
        let mut slow = hub.subscribe(EventKind::Progress, "slow").await.unwrap();
        let mut fast = hub.subscribe(EventKind::Progress, "fast").await.unwrap();
        skip_status(&mut fast).await;

        for i in 0..20 {
            hub.publish(progress(i as f64)).await.unwrap();
            // fast keeps up
            assert!(matches!(next(&mut fast).await, SseFrame::Event { .. }));
        }

        // slow only sees the newest frames
        let mut values = Vec::new();
        for _ in 0..4 {
            if let SseFrame::Event { data, .. } = next(&mut slow).await {
                let json: serde_json::Value = serde_json::from_str(&data).unwrap();
                values.push(json["value"].as_f64().unwrap());
            }
        }
        assert_eq!(values, vec![16.0, 17.0, 18.0, 19.0]);
    }

    #[tokio::test]
    async fn test_drop_releases_subscriber() {
        let hub = SseHub::spawn(SseConfig::default());
        let sub = hub.subscribe(EventKind::Progress, "c1").await.unwrap();
        assert_eq!(hub.stats().await.unwrap().progress, 1);

        drop(sub);
        for _ in 0..50 {
            if hub.stats().await.unwrap().progress == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(hub.stats().await.unwrap().progress, 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_ends_stream() {
        let hub = SseHub::spawn(SseConfig::default());
        let mut sub = hub.subscribe(EventKind::Notification, "c1").await.unwrap();
        skip_status(&mut sub).await;

        hub.unsubscribe("c1").await.unwrap();
        assert!(sub.recv().await.is_none());
        assert_eq!(hub.stats().await.unwrap().notification, 0);
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_previous() {
        let hub = SseHub::spawn(SseConfig::default());
        let mut first = hub.subscribe(EventKind::Progress, "c1").await.unwrap();
        skip_status(&mut first).await;
        let second = hub.subscribe(EventKind::Progress, "c1").await.unwrap();

        assert!(first.recv().await.is_none());
        drop(first);
        hub.publish(progress(1.0)).await.unwrap();

        // the stale release from `first` must not remove `second`
        assert_eq!(hub.stats().await.unwrap().progress, 1);
        let frames: Vec<_> = second.into_stream().take(2).collect().await;
        assert!(matches!(frames[1], SseFrame::Event { .. }));
    }

    #[tokio::test]
    async fn test_keepalive_sent() {
        let hub = SseHub::spawn(SseConfig {
            keepalive_interval: Duration::from_millis(30),
            ..Default::default()
        });
        let mut sub = hub.subscribe(EventKind::Progress, "c1").await.unwrap();
        skip_status(&mut sub).await;
        assert_eq!(next(&mut sub).await, SseFrame::KeepAlive);
        assert_eq!(SseFrame::KeepAlive.event_name(), None);
    }

    #[tokio::test]
    async fn test_status_change_announced_once() {
        let hub = SseHub::spawn(SseConfig::default());
        let mut sub = hub.subscribe(EventKind::Progress, "c1").await.unwrap();
        skip_status(&mut sub).await;

        hub.set_status(EventKind::Progress, UpstreamState::Connecting)
            .await
            .unwrap();
        hub.set_status(EventKind::Progress, UpstreamState::Connecting)
            .await
            .unwrap();
        hub.set_status(EventKind::Progress, UpstreamState::Online)
            .await
            .unwrap();

        let frame = next(&mut sub).await;
        assert_eq!(frame.event_name(), Some("status"));
        assert!(frame.data().contains("connecting"));
        assert!(next(&mut sub).await.data().contains("online"));
    }
}
