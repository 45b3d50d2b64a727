//! BitTorrent handshake
//!
//! The fixed 68 byte greeting exchanged before any framed message.

use anyhow::Result;
use bytes::{BufMut, BytesMut};
use tracing::{debug, trace};

use crate::error::TorrentError;

/// BitTorrent protocol identifier string
pub const PROTOCOL_STRING: &[u8; 19] = b"BitTorrent protocol";

/// Length of the protocol string
pub const PROTOCOL_LENGTH: u8 = 19;

/// Total handshake size on the wire
pub const HANDSHAKE_LEN: usize = 68;

/// Reserved byte and bit announcing BEP 10 extension protocol support
const EXTENSION_BYTE: usize = 5;
const EXTENSION_BIT: u8 = 0x10;

/// Client prefix used in generated peer ids
const PEER_ID_PREFIX: &[u8; 8] = b"-TE0100-";

/// BitTorrent handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Reserved capability bits
    pub reserved: [u8; 8],
    /// Torrent info hash
    pub info_hash: [u8; 20],
    /// Sender's peer ID
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Create a handshake advertising extension protocol support
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut reserved = [0u8; 8];
        reserved[EXTENSION_BYTE] |= EXTENSION_BIT;
        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    /// Create a handshake without any capability bits
    pub fn plain(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Whether the sender supports the BEP 10 extension protocol
    pub fn supports_extensions(&self) -> bool {
        self.reserved[EXTENSION_BYTE] & EXTENSION_BIT != 0
    }

    /// Generate a random peer ID with the client prefix
    pub fn generate_peer_id() -> [u8; 20] {
        let mut peer_id = [0u8; 20];
        peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
        peer_id[8..].copy_from_slice(&rand::random::<[u8; 12]>());
        debug!("Generated peer ID: {}", hex::encode(peer_id));
        peer_id
    }

    /// Serialize the handshake to bytes
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_LENGTH);
        buf.put_slice(PROTOCOL_STRING);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.to_vec()
    }

    /// Deserialize a handshake, rejecting foreign protocols
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        trace!("Deserializing handshake from {} bytes", data.len());

        if data.len() < HANDSHAKE_LEN {
            return Err(TorrentError::protocol_with_detail(
                "Handshake data too short",
                format!("expected {} bytes, got {}", HANDSHAKE_LEN, data.len()),
            )
            .into());
        }

        if data[0] != PROTOCOL_LENGTH || &data[1..20] != PROTOCOL_STRING {
            return Err(TorrentError::protocol("Invalid protocol string").into());
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }

    /// Check the remote info hash against ours
    pub fn validate(&self, expected_info_hash: &[u8; 20]) -> Result<()> {
        if self.info_hash != *expected_info_hash {
            return Err(TorrentError::protocol_with_detail(
                "Info hash mismatch",
                format!(
                    "expected {}, got {}",
                    hex::encode(expected_info_hash),
                    hex::encode(self.info_hash)
                ),
            )
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_layout() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        let bytes = handshake.serialize();
        assert_eq!(bytes.len(), HANDSHAKE_LEN);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(bytes[25], 0x10);
        assert_eq!(Handshake::deserialize(&bytes).unwrap(), handshake);
    }

    #[test]
    fn test_extension_bit() {
        assert!(Handshake::new([0u8; 20], [0u8; 20]).supports_extensions());
        assert!(!Handshake::plain([0u8; 20], [0u8; 20]).supports_extensions());
    }

    #[test]
    fn test_generate_peer_id() {
        let peer_id = Handshake::generate_peer_id();
        assert_eq!(&peer_id[..8], b"-TE0100-");
        assert_ne!(peer_id, Handshake::generate_peer_id());
    }

    #[test]
    fn test_validate_info_hash() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        assert!(handshake.validate(&[1u8; 20]).is_ok());
        assert!(handshake.validate(&[3u8; 20]).is_err());
    }

    #[test]
    fn test_foreign_protocol_rejected() {
        let mut bytes = Handshake::new([1u8; 20], [2u8; 20]).serialize();
        bytes[1] = b'X';
        assert!(Handshake::deserialize(&bytes).is_err());
        assert!(Handshake::deserialize(&bytes[..40]).is_err());
    }
}
