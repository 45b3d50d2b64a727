//! Piece buffering
//!
//! Holds the blocks of one piece until it can be hashed.

use anyhow::Result;
use bytes::{Bytes, BytesMut};

use crate::error::TorrentError;
use crate::scheduler::BLOCK_SIZE;
use crate::torrent::info::{sha1_digest, HASH_LEN};

/// Lifecycle of a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PieceStatus {
    #[default]
    Empty,
    Partial,
    /// Every block present, not yet hashed
    Complete,
    Verified,
}

/// Represents a piece of the torrent
#[derive(Debug, Clone)]
pub struct Piece {
    pub index: u32,
    pub size: u32,
    pub hash: [u8; HASH_LEN],
    blocks: Vec<Option<Bytes>>,
    verified: bool,
}

impl Piece {
    pub fn new(index: u32, size: u32, hash: [u8; HASH_LEN]) -> Self {
        Self {
            index,
            size,
            hash,
            blocks: vec![None; size.div_ceil(BLOCK_SIZE) as usize],
            verified: false,
        }
    }

    pub fn status(&self) -> PieceStatus {
        if self.verified {
            return PieceStatus::Verified;
        }
        let present = self.blocks.iter().filter(|b| b.is_some()).count();
        match present {
            0 => PieceStatus::Empty,
            n if n == self.blocks.len() => PieceStatus::Complete,
            _ => PieceStatus::Partial,
        }
    }

    pub fn is_verified(&self) -> bool {
        self.verified
    }

    fn expected_len(&self, block: usize) -> u32 {
        let offset = block as u32 * BLOCK_SIZE;
        (self.size - offset).min(BLOCK_SIZE)
    }

    /// Store a block. Returns false when the block was already present.
    pub fn add_block(&mut self, offset: u32, data: Bytes) -> Result<bool> {
        let block = (offset / BLOCK_SIZE) as usize;
        if offset % BLOCK_SIZE != 0 || block >= self.blocks.len() {
            return Err(TorrentError::protocol_with_detail(
                "Block offset out of range",
                format!("piece {} offset {}", self.index, offset),
            )
            .into());
        }
        if data.len() as u32 != self.expected_len(block) {
            return Err(TorrentError::protocol_with_detail(
                "Block has wrong length",
                format!(
                    "piece {} offset {}: {} bytes, expected {}",
                    self.index,
                    offset,
                    data.len(),
                    self.expected_len(block)
                ),
            )
            .into());
        }
        if self.blocks[block].is_some() {
            return Ok(false);
        }
        self.blocks[block] = Some(data);
        Ok(true)
    }

    /// Concatenate the buffered blocks
    pub fn assemble(&self) -> Bytes {
        let mut data = BytesMut::with_capacity(self.size as usize);
        for block in self.blocks.iter().flatten() {
            data.extend_from_slice(block);
        }
        data.freeze()
    }

    /// Whether `data` matches the expected digest
    pub fn matches(&self, data: &[u8]) -> bool {
        data.len() == self.size as usize && sha1_digest(data) == self.hash
    }

    /// Mark verified and release the buffered blocks
    pub fn set_verified(&mut self) {
        self.verified = true;
        self.blocks.iter_mut().for_each(|b| *b = None);
    }

    /// Discard every buffered block
    pub fn reset(&mut self) {
        self.blocks.iter_mut().for_each(|b| *b = None);
    }
}
