//! Metadata assembly for magnet links
//!
//! Collects the info dictionary piece by piece from peers that support
//! `ut_metadata` and verifies it against the magnet info-hash.

use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, warn};

use crate::error::TorrentError;
use crate::protocol::extension::{MAX_METADATA_SIZE, METADATA_PIECE_SIZE};
use crate::torrent::info::{sha1_digest, HASH_LEN};

/// How long a requested metadata piece stays reserved for one peer
const METADATA_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone)]
enum Slot {
    Missing,
    Requested(Instant),
    Have(Vec<u8>),
}

/// Reassembles an info dictionary from `ut_metadata` data messages
#[derive(Debug)]
pub struct MetadataAssembler {
    info_hash: [u8; HASH_LEN],
    total_size: usize,
    slots: Vec<Slot>,
}

impl MetadataAssembler {
    pub fn new(info_hash: [u8; HASH_LEN], total_size: usize) -> Result<Self> {
        if total_size == 0 || total_size > MAX_METADATA_SIZE {
            return Err(TorrentError::protocol_with_detail(
                "Unacceptable metadata size",
                total_size.to_string(),
            )
            .into());
        }
        let count = total_size.div_ceil(METADATA_PIECE_SIZE);
        Ok(Self {
            info_hash,
            total_size,
            slots: vec![Slot::Missing; count],
        })
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn piece_count(&self) -> usize {
        self.slots.len()
    }

    fn piece_len(&self, piece: usize) -> usize {
        let start = piece * METADATA_PIECE_SIZE;
        (self.total_size - start).min(METADATA_PIECE_SIZE)
    }

    /// Reserve the next piece worth asking for
    pub fn next_request(&mut self, now: Instant) -> Option<usize> {
        let piece = self.slots.iter().position(|slot| match slot {
            Slot::Missing => true,
            Slot::Requested(at) => now.duration_since(*at) >= METADATA_REQUEST_TIMEOUT,
            Slot::Have(_) => false,
        })?;
        self.slots[piece] = Slot::Requested(now);
        Some(piece)
    }

    /// Return a piece to the pool after a reject or a disconnect
    pub fn release(&mut self, piece: usize) {
        if let Some(slot) = self.slots.get_mut(piece) {
            if matches!(slot, Slot::Requested(_)) {
                *slot = Slot::Missing;
            }
        }
    }

    /// Store a received piece. Returns the full, verified info dictionary
    /// once every piece is present.
    ///
    /// A digest mismatch discards everything and starts over.
    pub fn receive(&mut self, piece: usize, total_size: usize, data: &[u8]) -> Result<Option<Vec<u8>>> {
        if total_size != self.total_size || piece >= self.slots.len() {
            return Err(TorrentError::protocol_with_detail(
                "Metadata piece does not fit",
                format!("piece {} total_size {}", piece, total_size),
            )
            .into());
        }
        if data.len() != self.piece_len(piece) {
            return Err(TorrentError::protocol_with_detail(
                "Metadata piece has wrong length",
                format!("piece {}: {} bytes, expected {}", piece, data.len(), self.piece_len(piece)),
            )
            .into());
        }

        self.slots[piece] = Slot::Have(data.to_vec());
        debug!("Metadata piece {}/{} received", piece + 1, self.slots.len());

        if !self.slots.iter().all(|s| matches!(s, Slot::Have(_))) {
            return Ok(None);
        }

        let mut assembled = Vec::with_capacity(self.total_size);
        for slot in &self.slots {
            if let Slot::Have(bytes) = slot {
                assembled.extend_from_slice(bytes);
            }
        }

        if sha1_digest(&assembled) != self.info_hash {
            warn!("Assembled metadata failed hash check, discarding");
            self.slots.iter_mut().for_each(|s| *s = Slot::Missing);
            return Err(TorrentError::protocol("Assembled metadata does not match info hash").into());
        }

        Ok(Some(assembled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assembles_multi_piece_metadata() {
        let info = vec![7u8; METADATA_PIECE_SIZE + 100];
        let hash = sha1_digest(&info);
        let mut assembler = MetadataAssembler::new(hash, info.len()).unwrap();
        assert_eq!(assembler.piece_count(), 2);

        let now = Instant::now();
        assert_eq!(assembler.next_request(now), Some(0));
        assert_eq!(assembler.next_request(now), Some(1));
        assert_eq!(assembler.next_request(now), None);

        assert!(assembler
            .receive(1, info.len(), &info[METADATA_PIECE_SIZE..])
            .unwrap()
            .is_none());
        let done = assembler
            .receive(0, info.len(), &info[..METADATA_PIECE_SIZE])
            .unwrap();
        assert_eq!(done, Some(info));
    }

    #[test]
    fn test_release_makes_piece_requestable() {
        let mut assembler = MetadataAssembler::new([0u8; 20], 10).unwrap();
        let now = Instant::now();
        assert_eq!(assembler.next_request(now), Some(0));
        assert_eq!(assembler.next_request(now), None);
        assembler.release(0);
        assert_eq!(assembler.next_request(now), Some(0));
    }

    #[test]
    fn test_stale_request_reissued() {
        let mut assembler = MetadataAssembler::new([0u8; 20], 10).unwrap();
        let now = Instant::now();
        assembler.next_request(now);
        assert_eq!(assembler.next_request(now + METADATA_REQUEST_TIMEOUT), Some(0));
    }

    #[test]
    fn test_hash_mismatch_resets() {
        let mut assembler = MetadataAssembler::new([0u8; 20], 4).unwrap();
        assert!(assembler.receive(0, 4, b"abcd").is_err());
        assert_eq!(assembler.next_request(Instant::now()), Some(0));
    }

    #[test]
    fn test_wrong_length_rejected() {
        let mut assembler = MetadataAssembler::new([0u8; 20], 4).unwrap();
        assert!(assembler.receive(0, 4, b"abc").is_err());
        assert!(assembler.receive(0, 5, b"abcd").is_err());
        assert!(MetadataAssembler::new([0u8; 20], 0).is_err());
    }
}
