//! DHT node module
//!
//! Node identifiers, XOR distance and the compact address encodings shared by
//! DHT responses and tracker announces.

use std::net::{Ipv4Addr, SocketAddr};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::TorrentError;

/// Compact IPv4 peer: 4 bytes address + 2 bytes port
pub const COMPACT_PEER_LEN: usize = 6;
/// Compact node: 20 bytes id + compact peer
pub const COMPACT_NODE_LEN: usize = 26;

/// DHT node identifier (20 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    /// Generate a random NodeId
    pub fn random() -> Self {
        use rand::Rng;
        let mut id = [0u8; 20];
        rand::thread_rng().fill(&mut id);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// XOR distance to a target; compares lexicographically
    pub fn distance(&self, target: &[u8; 20]) -> [u8; 20] {
        let mut distance = [0u8; 20];
        for (d, (a, b)) in distance.iter_mut().zip(self.0.iter().zip(target)) {
            *d = a ^ b;
        }
        distance
    }
}

/// A node learned from a `nodes` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl Node {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }
}

fn compact_addr(chunk: &[u8]) -> SocketAddr {
    let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
    let port = u16::from_be_bytes([chunk[4], chunk[5]]);
    SocketAddr::new(ip.into(), port)
}

/// Parse nodes from compact node format
pub fn parse_compact_nodes(data: &[u8]) -> Result<Vec<Node>> {
    if data.len() % COMPACT_NODE_LEN != 0 {
        return Err(TorrentError::protocol_with_detail(
            "Invalid compact nodes length",
            data.len().to_string(),
        )
        .into());
    }
    Ok(data
        .chunks_exact(COMPACT_NODE_LEN)
        .map(|chunk| {
            let mut id = [0u8; 20];
            id.copy_from_slice(&chunk[..20]);
            Node::new(NodeId(id), compact_addr(&chunk[20..]))
        })
        .collect())
}

/// Parse peers from compact peer format; port 0 entries are dropped
pub fn parse_compact_peers(data: &[u8]) -> Result<Vec<SocketAddr>> {
    if data.len() % COMPACT_PEER_LEN != 0 {
        return Err(TorrentError::protocol_with_detail(
            "Invalid compact peers length",
            data.len().to_string(),
        )
        .into());
    }
    Ok(data
        .chunks_exact(COMPACT_PEER_LEN)
        .map(compact_addr)
        .filter(|addr| addr.port() != 0)
        .collect())
}

/// Encode an IPv4 address in compact form; IPv6 has no compact form here
pub fn compact_peer(addr: &SocketAddr) -> Option<[u8; COMPACT_PEER_LEN]> {
    match addr {
        SocketAddr::V4(v4) => {
            let mut out = [0u8; COMPACT_PEER_LEN];
            out[..4].copy_from_slice(&v4.ip().octets());
            out[4..].copy_from_slice(&v4.port().to_be_bytes());
            Some(out)
        }
        SocketAddr::V6(_) => None,
    }
}
