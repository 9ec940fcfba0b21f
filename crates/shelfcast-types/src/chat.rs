//! Chat protocol frames.
//!
//! ```json
//! {"type": "join", "room": "m1"}
//! {"type": "message", "message": "hello"}
//! {"type": "get_users", "room": "m1"}
//! {"type": "leave"}
//! ```
//!
//! The server fills `user_id`/`username` from the authenticated connection;
//! whatever a client puts there is ignored.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest chat message accepted, in bytes.
pub const MAX_MESSAGE_LEN: usize = 4096;

/// A chat frame, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatFrame {
    /// A chat line.
    Message {
        #[serde(default)]
        user_id: String,
        #[serde(default)]
        username: String,
        message: String,
        #[serde(default)]
        room: String,
    },
    /// Someone joined a room.
    Join {
        #[serde(default)]
        user_id: String,
        #[serde(default)]
        username: String,
        room: String,
    },
    /// Someone left a room.
    Leave {
        #[serde(default)]
        user_id: String,
        #[serde(default)]
        username: String,
        #[serde(default)]
        room: String,
    },
    /// Request for the member list.
    GetUsers {
        #[serde(default)]
        room: String,
    },
    /// Snapshot of the member list (server to client only).
    UserList { room: String, users: Vec<String> },
    /// Error report (server to client only).
    Error { message: String },
}

/// Reasons an inbound chat frame is refused.
#[derive(Debug, Error)]
pub enum ChatFrameError {
    /// Not JSON, or an unknown `type`.
    #[error("undecodable chat frame: {0}")]
    Decode(#[from] serde_json::Error),

    /// A variant only the server may send.
    #[error("frame type `{0}` is server-only")]
    ServerOnly(&'static str),

    /// `join` without a room key.
    #[error("room must not be empty")]
    EmptyRoom,

    /// Message longer than [`MAX_MESSAGE_LEN`].
    #[error("message exceeds {MAX_MESSAGE_LEN} bytes")]
    TooLong,
}

impl ChatFrame {
    /// Decodes and validates a frame received from a client.
    pub fn decode_client(text: &str) -> Result<Self, ChatFrameError> {
        let frame: ChatFrame = serde_json::from_str(text)?;
        match &frame {
            ChatFrame::UserList { .. } => Err(ChatFrameError::ServerOnly("user_list")),
            ChatFrame::Error { .. } => Err(ChatFrameError::ServerOnly("error")),
            ChatFrame::Join { room, .. } if room.trim().is_empty() => {
                Err(ChatFrameError::EmptyRoom)
            }
            ChatFrame::Message { message, .. } if message.len() > MAX_MESSAGE_LEN => {
                Err(ChatFrameError::TooLong)
            }
            _ => Ok(frame),
        }
    }

    /// Encodes the frame as a JSON string.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Wire name of the frame's `type`.
    pub fn type_name(&self) -> &'static str {
        match self {
            ChatFrame::Message { .. } => "message",
            ChatFrame::Join { .. } => "join",
            ChatFrame::Leave { .. } => "leave",
            ChatFrame::GetUsers { .. } => "get_users",
            ChatFrame::UserList { .. } => "user_list",
            ChatFrame::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_decode_minimal_message() {
        let frame = ChatFrame::decode_client(r#"{"type":"message","message":"hello"}"#).unwrap();
        assert_eq!(
            frame,
            ChatFrame::Message {
                user_id: String::new(),
                username: String::new(),
                message: "hello".into(),
                room: String::new(),
            }
        );
    }

    #[test]
    fn test_decode_rejects_server_only() {
        let err =
            ChatFrame::decode_client(r#"{"type":"user_list","room":"r1","users":[]}"#).unwrap_err();
        assert!(matches!(err, ChatFrameError::ServerOnly("user_list")));
    }

    #[test]
    fn test_decode_rejects_empty_room() {
        let err = ChatFrame::decode_client(r#"{"type":"join","room":"  "}"#).unwrap_err();
        assert!(matches!(err, ChatFrameError::EmptyRoom));
    }

    #[test]
    fn test_decode_rejects_long_message() {
        let long = "x".repeat(MAX_MESSAGE_LEN + 1);
        let text = serde_json::json!({"type": "message", "message": long}).to_string();
        assert!(matches!(
            ChatFrame::decode_client(&text),
            Err(ChatFrameError::TooLong)
        ));
    }

    #[test]
    fn test_decode_unknown_type() {
        assert!(matches!(
            ChatFrame::decode_client(r#"{"type":"typing"}"#),
            Err(ChatFrameError::Decode(_))
        ));
    }

    #[test]
    fn test_user_list_encoding() {
        let frame = ChatFrame::UserList {
            room: "r1".into(),
            users: vec!["alice".into(), "bob".into()],
        };
        let json = frame.encode().unwrap();
        assert!(json.contains("\"type\":\"user_list\""));
        assert!(json.contains("\"users\":[\"alice\",\"bob\"]"));
        assert_eq!(frame.type_name(), "user_list");
    }

    proptest! {
        #[test]
        fn decode_client_never_panics(text in ".*") {
            let _ = ChatFrame::decode_client(&text);
        }
    }
}
