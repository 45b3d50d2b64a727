//! DHT (Distributed Hash Table) module
//!
//! Peer discovery through BEP 5 `get_peers` lookups.

pub mod lookup;
pub mod message;
pub mod node;

// Re-exports for convenience
pub use lookup::{DhtDiscovery, DEFAULT_ROUTERS};
pub use message::{GetPeersQuery, GetPeersResponse};
pub use node::{parse_compact_nodes, parse_compact_peers, Node, NodeId};
