//! Authenticated identity attached to every connection.

use serde::{Deserialize, Serialize};

/// A validated `(user_id, username)` pair.
///
/// Produced by the authentication layer; the real-time core trusts it as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// Stable user identifier.
    pub user_id: String,
    /// Display name shown to other users.
    pub username: String,
}

impl Identity {
    /// Creates a new identity.
    pub fn new(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
        }
    }

    /// Identity of a raw socket peer that connects without claims; named after its address.
    pub fn peer(addr: std::net::SocketAddr) -> Self {
        Self::new("", addr.to_string())
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.user_id.is_empty() {
            write!(f, "{}", self.username)
        } else {
            write!(f, "{}({})", self.username, self.user_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_display() {
        assert_eq!(Identity::new("u1", "alice").to_string(), "alice(u1)");
        let peer = Identity::peer("127.0.0.1:9001".parse().unwrap());
        assert_eq!(peer.to_string(), "127.0.0.1:9001");
        assert!(peer.user_id.is_empty());
    }
}
