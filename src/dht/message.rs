//! DHT message module
//!
//! The KRPC subset needed for peer lookups: `get_peers` queries and their
//! responses, bencoded over UDP.

use std::net::SocketAddr;

use anyhow::Result;

use crate::dht::node::{parse_compact_nodes, parse_compact_peers, Node, NodeId};
use crate::error::TorrentError;
use crate::torrent::bencode::{self, Value};

/// Opaque two-byte transaction id
pub type TransactionId = [u8; 2];

/// Helper function to generate a random transaction ID
pub fn generate_transaction_id() -> TransactionId {
    rand::random()
}

/// Outgoing `get_peers` query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetPeersQuery {
    pub transaction: TransactionId,
    pub node_id: NodeId,
    pub info_hash: [u8; 20],
}

impl GetPeersQuery {
    pub fn encode(&self) -> Vec<u8> {
        Value::dict([
            (
                b"a".as_ref(),
                Value::dict([
                    (b"id".as_ref(), Value::bytes(self.node_id.as_bytes())),
                    (b"info_hash".as_ref(), Value::bytes(self.info_hash)),
                ]),
            ),
            (b"q".as_ref(), Value::bytes("get_peers")),
            (b"t".as_ref(), Value::bytes(self.transaction)),
            (b"y".as_ref(), Value::bytes("q")),
        ])
        .encode()
    }
}

/// Decoded `get_peers` response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetPeersResponse {
    pub transaction: Vec<u8>,
    pub node_id: Option<NodeId>,
    /// Closer nodes to continue the search with
    pub nodes: Vec<Node>,
    /// Peers for the info hash, if the node knows any
    pub peers: Vec<SocketAddr>,
}

impl GetPeersResponse {
    /// Decode a response datagram; KRPC errors and queries are rejected
    pub fn decode(data: &[u8]) -> Result<Self> {
        let root = bencode::decode(data)?;
        let transaction = root
            .get(b"t")
            .and_then(Value::as_bytes)
            .ok_or_else(|| TorrentError::protocol("KRPC message without transaction id"))?
            .to_vec();

        match root.get(b"y").and_then(Value::as_bytes) {
            Some(b"r") => {}
            Some(b"e") => {
                let reason = root
                    .get(b"e")
                    .and_then(Value::as_list)
                    .and_then(|e| e.get(1))
                    .and_then(Value::as_str)
                    .unwrap_or_else(|| "unknown".to_string());
                return Err(TorrentError::protocol_with_detail("KRPC error", reason).into());
            }
            _ => return Err(TorrentError::protocol("Unexpected KRPC message type").into()),
        }

        let body = root
            .get(b"r")
            .ok_or_else(|| TorrentError::protocol("KRPC response without body"))?;

        let node_id = body.get(b"id").and_then(Value::as_bytes).and_then(|id| {
            let id: [u8; 20] = id.try_into().ok()?;
            Some(NodeId(id))
        });

        let nodes = match body.get(b"nodes").and_then(Value::as_bytes) {
            Some(data) => parse_compact_nodes(data)?,
            None => Vec::new(),
        };

        let mut peers = Vec::new();
        if let Some(values) = body.get(b"values").and_then(Value::as_list) {
            for value in values {
                if let Some(data) = value.as_bytes() {
                    peers.extend(parse_compact_peers(data)?);
                }
            }
        }

        Ok(Self {
            transaction,
            node_id,
            nodes,
            peers,
        })
    }

    /// Encode a response; used by tests standing in for remote nodes
    pub fn encode(&self) -> Vec<u8> {
        let mut body = vec![(
            b"id".as_ref(),
            Value::bytes(self.node_id.unwrap_or(NodeId([0; 20])).as_bytes()),
        )];
        if !self.nodes.is_empty() {
            let mut compact = Vec::new();
            for node in &self.nodes {
                if let Some(addr) = crate::dht::node::compact_peer(&node.addr) {
                    compact.extend_from_slice(node.id.as_bytes());
                    compact.extend_from_slice(&addr);
                }
            }
            body.push((b"nodes".as_ref(), Value::Bytes(compact)));
        }
        if !self.peers.is_empty() {
            let values = self
                .peers
                .iter()
                .filter_map(crate::dht::node::compact_peer)
                .map(Value::bytes)
                .collect();
            body.push((b"values".as_ref(), Value::List(values)));
        }
        Value::dict([
            (b"r".as_ref(), Value::dict(body)),
            (b"t".as_ref(), Value::bytes(&self.transaction)),
            (b"y".as_ref(), Value::bytes("r")),
        ])
        .encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_layout() {
        let query = GetPeersQuery {
            transaction: *b"aa",
            node_id: NodeId([b'a'; 20]),
            info_hash: [b'b'; 20],
        };
        let expected = format!(
            "d1:ad2:id20:{}9:info_hash20:{}e1:q9:get_peers1:t2:aa1:y1:qe",
            "a".repeat(20),
            "b".repeat(20)
        );
        assert_eq!(query.encode(), expected.into_bytes());
    }

    #[test]
    fn test_response_with_values_and_nodes() {
        let response = GetPeersResponse {
            transaction: b"xy".to_vec(),
            node_id: Some(NodeId([1; 20])),
            nodes: vec![Node::new(NodeId([2; 20]), "10.0.0.1:6881".parse().unwrap())],
            peers: vec!["10.0.0.9:51413".parse().unwrap()],
        };
        let decoded = GetPeersResponse::decode(&response.encode()).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_error_message_rejected() {
        let data = b"d1:eli201e23:A Generic Error Ocurrede1:t2:aa1:y1:ee";
        let err = GetPeersResponse::decode(data).unwrap_err();
        assert!(err.to_string().contains("A Generic Error Ocurred"));
    }

    #[test]
    fn test_missing_transaction_rejected() {
        assert!(GetPeersResponse::decode(b"d1:y1:re").is_err());
    }
}
