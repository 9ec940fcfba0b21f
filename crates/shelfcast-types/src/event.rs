//! Broadcast event types.
//!
//! Events are immutable once constructed. Producers build them after a
//! successful write and hand them to a registry; the registries only fan
//! them out.

use serde::{Deserialize, Serialize};

/// Returns the current Unix time in milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A reading-progress update, delivered over the stream transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// User whose progress changed.
    pub user_id: String,
    /// Display name of that user.
    #[serde(default)]
    pub username: String,
    /// Item (manga) the progress refers to.
    pub item_id: String,
    /// New progress value (chapter number; may be fractional).
    pub value: f64,
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
}

impl ProgressEvent {
    /// Creates a progress event stamped with the current time.
    pub fn new(
        user_id: impl Into<String>,
        username: impl Into<String>,
        item_id: impl Into<String>,
        value: f64,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            item_id: item_id.into(),
            value,
            timestamp: now_millis(),
        }
    }
}

/// A content notification, delivered over the datagram transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    /// Notification category, e.g. `chapter_release`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Subject (usually an item id) the notification is about.
    pub subject_id: String,
    /// Human readable message.
    pub message: String,
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
}

impl NotificationEvent {
    /// Creates a notification stamped with the current time.
    pub fn new(
        kind: impl Into<String>,
        subject_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            subject_id: subject_id.into(),
            message: message.into(),
            timestamp: now_millis(),
        }
    }
}

/// The two event kinds the system fans out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Reading-progress updates.
    Progress,
    /// Content notifications.
    Notification,
}

impl EventKind {
    /// All kinds, in a stable order.
    pub const ALL: [EventKind; 2] = [EventKind::Progress, EventKind::Notification];

    /// Wire name of the kind (also used as the SSE event name).
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Progress => "progress",
            EventKind::Notification => "notification",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "progress" => Ok(EventKind::Progress),
            "notification" | "notifications" => Ok(EventKind::Notification),
            other => Err(format!("unknown event kind: {other}")),
        }
    }
}

/// Either kind of event.
///
/// Serializes as the bare inner record, which is what every transport
/// puts on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Event {
    /// A progress update.
    Progress(ProgressEvent),
    /// A notification.
    Notification(NotificationEvent),
}

impl Event {
    /// The kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Progress(_) => EventKind::Progress,
            Event::Notification(_) => EventKind::Notification,
        }
    }

    /// Encodes the event as a single JSON line (without the trailing newline).
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<ProgressEvent> for Event {
    fn from(event: ProgressEvent) -> Self {
        Event::Progress(event)
    }
}

impl From<NotificationEvent> for Event {
    fn from(event: NotificationEvent) -> Self {
        Event::Notification(event)
    }
}
