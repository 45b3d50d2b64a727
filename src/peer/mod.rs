//! Peer management module
//!
//! Peer discovery, per-peer wire sessions and the coordinator-side record of
//! each connection.

pub mod connection;
pub mod session;
pub mod source;
pub mod state;
pub mod tracker;

// Re-export main types
pub use connection::{PeerConnection, RequestMatch};
pub use session::{spawn_session, CloseReason, SessionCommand, SessionEvent, SessionHandle, SessionParams};
pub use source::{Discovery, PeerSource, SourceItem};
pub use state::{PeerCandidate, PeerKey, SessionState, SourceTag};
pub use tracker::TrackerDiscovery;
