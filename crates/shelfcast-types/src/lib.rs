//! Common types used throughout `shelfcast`.
//!
//! This crate holds the wire and data model shared by the real-time
//! components: the two broadcast event kinds, the chat frames, the control
//! literals of the socket protocols and the authenticated identity.

mod chat;
mod event;
mod frame;
mod identity;

pub use chat::{ChatFrame, ChatFrameError, MAX_MESSAGE_LEN};
pub use event::{now_millis, Event, EventKind, NotificationEvent, ProgressEvent};
pub use frame::{
    Control, DatagramFrame, StreamFrame, MAX_DATAGRAM_SIZE, MAX_LINE_SIZE, PING, PONG, REGISTER,
    REGISTERED, UNREGISTER, UNREGISTERED,
};
pub use identity::Identity;
