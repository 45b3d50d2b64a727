//! Verification store
//!
//! Buffers received blocks per piece, hashes complete pieces, persists the
//! good ones and publishes the outcome. The store is owned by the swarm
//! coordinator, so piece transitions are serialized with every other
//! mutation of download state.

use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Result;
use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::error::TorrentError;
use crate::events::{EngineEvent, EventBus};
use crate::storage::backend::PieceBackend;
use crate::storage::bitfield::Bitfield;
use crate::storage::piece::Piece;
use crate::torrent::TorrentMetadata;

/// Result of submitting a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceOutcome {
    /// The piece still lacks blocks
    Incomplete,
    /// The piece is verified (now or earlier)
    VerifiedOk,
    /// The piece hashed wrong and was reset
    VerifiedFailed,
}

/// Counters describing download progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DownloadState {
    pub finished_pieces: usize,
    pub total_pieces: usize,
    /// Sum of the sizes of verified pieces
    pub verified_bytes: u64,
}

impl DownloadState {
    pub fn is_complete(&self) -> bool {
        self.finished_pieces == self.total_pieces
    }
}

pub struct VerificationStore {
    pieces: Vec<Piece>,
    bitfield: Bitfield,
    backend: Arc<dyn PieceBackend>,
    events: Arc<EventBus>,
    state: DownloadState,
}

impl VerificationStore {
    pub fn new(metadata: &TorrentMetadata, backend: Arc<dyn PieceBackend>, events: Arc<EventBus>) -> Self {
        let pieces: Vec<Piece> = metadata
            .pieces
            .iter()
            .enumerate()
            .map(|(i, hash)| Piece::new(i as u32, metadata.piece_size(i) as u32, *hash))
            .collect();
        let total = pieces.len();
        Self {
            pieces,
            bitfield: Bitfield::new(total),
            backend,
            events,
            state: DownloadState {
                total_pieces: total,
                ..Default::default()
            },
        }
    }

    /// Hash-check whatever the backend already holds and count the pieces
    /// that match. No events are published for them.
    pub async fn verify_existing(&mut self) -> Result<usize> {
        let mut found = 0;
        for i in 0..self.pieces.len() {
            let Some(data) = self.backend.read_piece(i as u32).await? else {
                continue;
            };
            if self.pieces[i].matches(&data) && !self.pieces[i].is_verified() {
                self.record_verified(i);
                found += 1;
            }
        }
        if found > 0 {
            info!("Resuming download: {}/{} pieces already verified", found, self.pieces.len());
        }
        Ok(found)
    }

    /// Add a block to its piece; the piece is verified once complete
    ///
    /// Blocks for an already verified piece are a no-op.
    pub async fn submit_block(&mut self, index: u32, offset: u32, data: Bytes) -> Result<PieceOutcome> {
        let Some(piece) = self.pieces.get_mut(index as usize) else {
            return Err(TorrentError::protocol_with_detail(
                "Block for unknown piece",
                index.to_string(),
            )
            .into());
        };
        if piece.is_verified() {
            return Ok(PieceOutcome::VerifiedOk);
        }

        piece.add_block(offset, data)?;
        if piece.status() != crate::storage::PieceStatus::Complete {
            return Ok(PieceOutcome::Incomplete);
        }

        let assembled = piece.assemble();
        if !piece.matches(&assembled) {
            piece.reset();
            warn!("Piece {} failed hash verification", index);
            self.events.emit(EngineEvent::PieceCorrupt { index });
            return Ok(PieceOutcome::VerifiedFailed);
        }

        self.backend.write_piece(index, assembled).await?;
        self.record_verified(index as usize);
        debug!(
            "Piece {} verified ({}/{})",
            index, self.state.finished_pieces, self.state.total_pieces
        );
        self.events.emit(EngineEvent::PieceVerified {
            index,
            verified_at: SystemTime::now(),
        });
        Ok(PieceOutcome::VerifiedOk)
    }

    fn record_verified(&mut self, index: usize) {
        let piece = &mut self.pieces[index];
        piece.set_verified();
        self.bitfield.set(index);
        self.state.finished_pieces += 1;
        self.state.verified_bytes += piece.size as u64;
    }

    pub fn is_verified(&self, index: u32) -> bool {
        self.pieces.get(index as usize).is_some_and(Piece::is_verified)
    }

    /// Completed pieces
    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    pub fn state(&self) -> DownloadState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state.is_complete()
    }

    pub fn backend(&self) -> Arc<dyn PieceBackend> {
        Arc::clone(&self.backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::BLOCK_SIZE;
    use crate::storage::backend::MemoryBackend;
    use crate::torrent::MetadataParser;
    use crate::torrent::parser::tests::build_metainfo;

    fn setup(content: &[u8], piece_length: usize) -> (VerificationStore, Arc<EventBus>, Arc<MemoryBackend>) {
        let meta = MetadataParser::parse_bytes(&build_metainfo("f", content, piece_length)).unwrap();
        let bus = Arc::new(EventBus::new());
        let backend = Arc::new(MemoryBackend::new());
        let store = VerificationStore::new(&meta, backend.clone(), bus.clone());
        (store, bus, backend)
    }

    fn content() -> Vec<u8> {
        (0..BLOCK_SIZE as usize * 3).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_verify_piece_emits_event() {
        let data = content();
        let (mut store, bus, backend) = setup(&data, BLOCK_SIZE as usize * 2);
        let mut events = bus.subscribe();
        let bs = BLOCK_SIZE as usize;

        let first = store
            .submit_block(0, 0, Bytes::copy_from_slice(&data[..bs]))
            .await
            .unwrap();
        assert_eq!(first, PieceOutcome::Incomplete);
        let second = store
            .submit_block(0, BLOCK_SIZE, Bytes::copy_from_slice(&data[bs..2 * bs]))
            .await
            .unwrap();
        assert_eq!(second, PieceOutcome::VerifiedOk);

        assert_eq!(store.state().finished_pieces, 1);
        assert!(store.bitfield().has(0));
        assert_eq!(backend.read_piece(0).await.unwrap().unwrap().as_ref(), &data[..2 * bs]);
        assert!(matches!(events.try_recv(), Some(EngineEvent::PieceVerified { index: 0, .. })));
    }

    #[tokio::test]
    async fn test_resubmission_is_idempotent() {
        let data = content();
        let (mut store, bus, _) = setup(&data, BLOCK_SIZE as usize);
        let block = Bytes::copy_from_slice(&data[..BLOCK_SIZE as usize]);

        assert_eq!(store.submit_block(0, 0, block.clone()).await.unwrap(), PieceOutcome::VerifiedOk);
        let mut events = bus.subscribe();
        assert_eq!(store.submit_block(0, 0, block).await.unwrap(), PieceOutcome::VerifiedOk);
        assert_eq!(store.state().finished_pieces, 1);
        assert_eq!(events.try_recv(), None);
    }

    #[tokio::test]
    async fn test_corrupt_piece_resets() {
        let data = content();
        let (mut store, bus, backend) = setup(&data, BLOCK_SIZE as usize);
        let mut events = bus.subscribe();

        let bad = Bytes::from(vec![0xEEu8; BLOCK_SIZE as usize]);
        assert_eq!(store.submit_block(1, 0, bad).await.unwrap(), PieceOutcome::VerifiedFailed);
        assert_eq!(events.try_recv(), Some(EngineEvent::PieceCorrupt { index: 1 }));
        assert_eq!(store.state().finished_pieces, 0);
        assert_eq!(backend.read_piece(1).await.unwrap(), None);

        let good = Bytes::copy_from_slice(&data[BLOCK_SIZE as usize..2 * BLOCK_SIZE as usize]);
        assert_eq!(store.submit_block(1, 0, good).await.unwrap(), PieceOutcome::VerifiedOk);
    }

    #[tokio::test]
    async fn test_verify_existing_counts_silently() {
        let data = content();
        let (mut store, bus, backend) = setup(&data, BLOCK_SIZE as usize);
        backend
            .write_piece(2, Bytes::copy_from_slice(&data[2 * BLOCK_SIZE as usize..]))
            .await
            .unwrap();
        backend.write_piece(0, Bytes::from(vec![1u8; BLOCK_SIZE as usize])).await.unwrap();
        let mut events = bus.subscribe();

        assert_eq!(store.verify_existing().await.unwrap(), 1);
        assert!(store.is_verified(2));
        assert!(!store.is_verified(0));
        assert_eq!(store.state().verified_bytes, BLOCK_SIZE as u64);
        assert_eq!(events.try_recv(), None);
    }

    #[tokio::test]
    async fn test_unknown_piece_is_error() {
        let (mut store, _, _) = setup(&content(), BLOCK_SIZE as usize);
        assert!(store.submit_block(9, 0, Bytes::from_static(b"x")).await.is_err());
    }
}
