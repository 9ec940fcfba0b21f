//! Framing and control literals for the stream and datagram transports.

use crate::event::{NotificationEvent, ProgressEvent};

/// Datagram: client asks to be added to the broadcast set.
pub const REGISTER: &str = "REGISTER";
/// Datagram: acknowledgment sent back for [`REGISTER`].
pub const REGISTERED: &str = "REGISTERED";
/// Datagram: client asks to be removed from the broadcast set.
pub const UNREGISTER: &str = "UNREGISTER";
/// Datagram: acknowledgment sent back for [`UNREGISTER`].
pub const UNREGISTERED: &str = "UNREGISTERED";
/// Liveness probe (both transports).
pub const PING: &str = "PING";
/// Liveness probe answer (both transports).
pub const PONG: &str = "PONG";

/// Largest datagram either side will read.
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Longest stream line either side will buffer, excluding the newline.
pub const MAX_LINE_SIZE: usize = 64 * 1024;

/// Control frames of the datagram protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// `REGISTER`
    Register,
    /// `REGISTERED`
    Registered,
    /// `UNREGISTER`
    Unregister,
    /// `UNREGISTERED`
    Unregistered,
    /// `PING`
    Ping,
    /// `PONG`
    Pong,
}

impl Control {
    /// Matches a trimmed payload against the reserved literals.
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim() {
            REGISTER => Some(Control::Register),
            REGISTERED => Some(Control::Registered),
            UNREGISTER => Some(Control::Unregister),
            UNREGISTERED => Some(Control::Unregistered),
            PING => Some(Control::Ping),
            PONG => Some(Control::Pong),
            _ => None,
        }
    }

    /// The literal sent on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Control::Register => REGISTER,
            Control::Registered => REGISTERED,
            Control::Unregister => UNREGISTER,
            Control::Unregistered => UNREGISTERED,
            Control::Ping => PING,
            Control::Pong => PONG,
        }
    }
}

/// A decoded line of the stream protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    /// Liveness probe.
    Ping,
    /// Probe answer.
    Pong,
    /// A progress record.
    Progress(ProgressEvent),
    /// Anything that could not be decoded.
    Malformed(String),
}

impl StreamFrame {
    /// Decodes one newline-delimited record. The newline may or may not be present.
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        match line {
            PING => StreamFrame::Ping,
            PONG => StreamFrame::Pong,
            _ => match serde_json::from_str::<ProgressEvent>(line) {
                Ok(event) => StreamFrame::Progress(event),
                Err(e) => StreamFrame::Malformed(e.to_string()),
            },
        }
    }

    /// Decodes one raw line; invalid UTF-8 is malformed.
    pub fn decode(line: &[u8]) -> Self {
        match std::str::from_utf8(line) {
            Ok(text) => Self::parse(text),
            Err(e) => StreamFrame::Malformed(e.to_string()),
        }
    }
}

/// A decoded datagram payload.
#[derive(Debug, Clone, PartialEq)]
pub enum DatagramFrame {
    /// One of the reserved control literals.
    Control(Control),
    /// A notification payload.
    Notification(NotificationEvent),
    /// Anything else.
    Malformed(String),
}

impl DatagramFrame {
    /// Decodes one datagram.
    pub fn parse(payload: &[u8]) -> Self {
        let text = match std::str::from_utf8(payload) {
            Ok(text) => text,
            Err(e) => return DatagramFrame::Malformed(e.to_string()),
        };
        if let Some(control) = Control::parse(text) {
            return DatagramFrame::Control(control);
        }
        match serde_json::from_str::<NotificationEvent>(text.trim()) {
            Ok(event) => DatagramFrame::Notification(event),
            Err(e) => DatagramFrame::Malformed(e.to_string()),
        }
    }
}
