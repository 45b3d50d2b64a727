//! Peer state module
//!
//! Identities and lifecycle states shared by the peer source, the sessions
//! and the swarm.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Where a peer candidate was discovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceTag {
    Tracker,
    Dht,
    Manual,
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceTag::Tracker => "tracker",
            SourceTag::Dht => "dht",
            SourceTag::Manual => "manual",
        };
        f.write_str(name)
    }
}

/// An address worth trying to connect to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerCandidate {
    pub addr: SocketAddr,
    pub source: SourceTag,
}

impl PeerCandidate {
    pub fn new(addr: SocketAddr, source: SourceTag) -> Self {
        Self { addr, source }
    }
}

/// Identity of one connection attempt within a swarm
///
/// Keys are never reused, so a late event from a closed session cannot be
/// confused with a new connection to the same address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerKey(pub u64);

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Wire session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Connecting,
    Handshaking,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    /// Whether the session can still carry messages
    pub fn is_open(&self) -> bool {
        matches!(self, SessionState::Handshaking | SessionState::Active)
    }

    /// Legal forward transitions; a failure from any state goes to `Closed`
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Handshaking)
                | (Handshaking, Active)
                | (Active, Closing)
                | (Closing, Closed)
                | (_, Closed)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_tag_display() {
        assert_eq!(SourceTag::Tracker.to_string(), "tracker");
        assert_eq!(SourceTag::Dht.to_string(), "dht");
        assert_eq!(SourceTag::Manual.to_string(), "manual");
    }

    #[test]
    fn test_session_transitions() {
        assert!(SessionState::Connecting.can_transition_to(SessionState::Handshaking));
        assert!(SessionState::Handshaking.can_transition_to(SessionState::Closed));
        assert!(!SessionState::Connecting.can_transition_to(SessionState::Active));
        assert!(!SessionState::Active.can_transition_to(SessionState::Handshaking));
        assert!(SessionState::Active.is_open());
        assert!(!SessionState::Closed.is_open());
    }

    #[test]
    fn test_peer_key_display() {
        assert_eq!(PeerKey(7).to_string(), "#7");
    }
}
