//! Piece scheduler
//!
//! Decides which blocks to request from which peer. Every block of every
//! piece is in exactly one of three states: unassigned, requested (by one or
//! more peers, each with a timestamp) or received. Verified pieces have all
//! their blocks received and are never handed out again.
//!
//! Selection prefers pieces with the fewest unassigned blocks (finish what
//! is already started), then the fewest holders among connected peers
//! (rarest first). A block that is already requested is only handed to a
//! second peer once its newest reservation is older than the endgame grace
//! period.

use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::peer::{PeerConnection, PeerKey};
use crate::storage::Bitfield;
use crate::torrent::TorrentMetadata;

/// Standard block size
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// One block of one piece
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockRequest {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

impl BlockRequest {
    fn block_index(&self) -> usize {
        (self.offset / BLOCK_SIZE) as usize
    }
}

#[derive(Debug, Clone)]
enum BlockState {
    Unassigned,
    Requested(Vec<(PeerKey, Instant)>),
    Received,
}

#[derive(Debug)]
struct PieceSlot {
    size: u32,
    blocks: Vec<BlockState>,
    availability: u32,
    wanted: bool,
    verified: bool,
}

impl PieceSlot {
    fn new(size: u32) -> Self {
        let count = size.div_ceil(BLOCK_SIZE) as usize;
        Self {
            size,
            blocks: vec![BlockState::Unassigned; count],
            availability: 0,
            wanted: true,
            verified: false,
        }
    }

    fn unassigned(&self) -> usize {
        self.blocks
            .iter()
            .filter(|b| matches!(b, BlockState::Unassigned))
            .count()
    }

    fn block(&self, piece: u32, index: usize) -> BlockRequest {
        let offset = index as u32 * BLOCK_SIZE;
        BlockRequest {
            piece,
            offset,
            length: (self.size - offset).min(BLOCK_SIZE),
        }
    }
}

/// Outcome of recording a received block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReceipt {
    /// First copy of this block; `cancel` lists other peers still holding a
    /// request for it
    Accepted { cancel: Vec<PeerKey> },
    /// The block was already received or its piece is verified
    Duplicate,
}

#[derive(Debug)]
pub struct PieceScheduler {
    pieces: Vec<PieceSlot>,
    endgame_grace: Duration,
}

impl PieceScheduler {
    pub fn new(metadata: &TorrentMetadata, endgame_grace: Duration) -> Self {
        let sizes = (0..metadata.piece_count()).map(|i| metadata.piece_size(i) as u32);
        Self::with_piece_sizes(sizes, endgame_grace)
    }

    pub fn with_piece_sizes(sizes: impl IntoIterator<Item = u32>, endgame_grace: Duration) -> Self {
        Self {
            pieces: sizes.into_iter().map(PieceSlot::new).collect(),
            endgame_grace,
        }
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Pick up to `capacity` blocks to request from `peer`
    pub fn next_requests(
        &mut self,
        peer: &PeerConnection,
        capacity: usize,
        now: Instant,
    ) -> Vec<BlockRequest> {
        let mut picked = Vec::new();
        if capacity == 0 {
            return picked;
        }

        let mut candidates: Vec<(usize, u32, usize)> = self
            .pieces
            .iter()
            .enumerate()
            .filter(|(i, p)| !p.verified && p.wanted && peer.has_piece(*i))
            .map(|(i, p)| (p.unassigned(), p.availability, i))
            .filter(|(unassigned, _, _)| *unassigned > 0)
            .collect();
        candidates.sort_unstable();

        'fresh: for (_, _, index) in candidates {
            let slot = &mut self.pieces[index];
            for b in 0..slot.blocks.len() {
                if matches!(slot.blocks[b], BlockState::Unassigned) {
                    slot.blocks[b] = BlockState::Requested(vec![(peer.key, now)]);
                    picked.push(slot.block(index as u32, b));
                    if picked.len() == capacity {
                        break 'fresh;
                    }
                }
            }
        }

        if picked.len() < capacity {
            self.endgame(peer, capacity - picked.len(), now, &mut picked);
        }

        if !picked.is_empty() {
            trace!("Scheduled {} blocks for peer {}", picked.len(), peer.key);
        }
        picked
    }

    /// Re-request stalled blocks that other peers were given
    fn endgame(&mut self, peer: &PeerConnection, room: usize, now: Instant, picked: &mut Vec<BlockRequest>) {
        let grace = self.endgame_grace;
        let mut added = 0;
        for (index, slot) in self.pieces.iter_mut().enumerate() {
            if added == room {
                break;
            }
            if slot.verified || !slot.wanted || !peer.has_piece(index) {
                continue;
            }
            for b in 0..slot.blocks.len() {
                let stalled = match &slot.blocks[b] {
                    BlockState::Requested(holders) => {
                        !holders.iter().any(|(k, _)| *k == peer.key)
                            && holders
                                .iter()
                                .all(|(_, at)| now.saturating_duration_since(*at) >= grace)
                    }
                    _ => false,
                };
                if stalled {
                    if let BlockState::Requested(holders) = &mut slot.blocks[b] {
                        holders.push((peer.key, now));
                    }
                    let block = slot.block(index as u32, b);
                    debug!(
                        "Endgame: re-requesting piece {} offset {} from peer {}",
                        block.piece, block.offset, peer.key
                    );
                    picked.push(block);
                    added += 1;
                    if added == room {
                        break;
                    }
                }
            }
        }
    }

    /// Validate a block that arrived in a piece message
    pub fn block_at(&self, piece: u32, offset: u32, length: u32) -> Option<BlockRequest> {
        let slot = self.pieces.get(piece as usize)?;
        if offset % BLOCK_SIZE != 0 {
            return None;
        }
        let index = (offset / BLOCK_SIZE) as usize;
        if index >= slot.blocks.len() {
            return None;
        }
        let block = slot.block(piece, index);
        (block.length == length).then_some(block)
    }

    /// Record the arrival of a requested block
    pub fn mark_received(&mut self, block: &BlockRequest, from: PeerKey) -> BlockReceipt {
        let Some(slot) = self.pieces.get_mut(block.piece as usize) else {
            return BlockReceipt::Duplicate;
        };
        if slot.verified {
            return BlockReceipt::Duplicate;
        }
        let Some(state) = slot.blocks.get_mut(block.block_index()) else {
            return BlockReceipt::Duplicate;
        };
        match std::mem::replace(state, BlockState::Received) {
            BlockState::Received => BlockReceipt::Duplicate,
            BlockState::Unassigned => BlockReceipt::Accepted { cancel: Vec::new() },
            BlockState::Requested(holders) => BlockReceipt::Accepted {
                cancel: holders
                    .into_iter()
                    .map(|(k, _)| k)
                    .filter(|k| *k != from)
                    .collect(),
            },
        }
    }

    /// Drop one peer's reservation of a block (timeout or cancel). Returns
    /// true when the block went back to the unassigned pool.
    pub fn abandon(&mut self, block: &BlockRequest, peer: PeerKey) -> bool {
        let Some(state) = self
            .pieces
            .get_mut(block.piece as usize)
            .and_then(|slot| slot.blocks.get_mut(block.block_index()))
        else {
            return false;
        };
        if let BlockState::Requested(holders) = state {
            holders.retain(|(k, _)| *k != peer);
            if holders.is_empty() {
                *state = BlockState::Unassigned;
                return true;
            }
        }
        false
    }

    /// Return every reservation held by a departing peer in one step.
    /// Returns how many blocks went back to the unassigned pool.
    pub fn release_peer(&mut self, peer: PeerKey) -> usize {
        let mut released = 0;
        for slot in &mut self.pieces {
            for state in &mut slot.blocks {
                if let BlockState::Requested(holders) = state {
                    holders.retain(|(k, _)| *k != peer);
                    if holders.is_empty() {
                        *state = BlockState::Unassigned;
                        released += 1;
                    }
                }
            }
        }
        if released > 0 {
            debug!("Released {} blocks held by peer {}", released, peer);
        }
        released
    }

    pub fn mark_verified(&mut self, piece: u32) {
        if let Some(slot) = self.pieces.get_mut(piece as usize) {
            slot.verified = true;
            slot.blocks.iter_mut().for_each(|b| *b = BlockState::Received);
        }
    }

    /// Forget everything received for a piece that failed verification
    pub fn reset_piece(&mut self, piece: u32) {
        if let Some(slot) = self.pieces.get_mut(piece as usize) {
            if slot.verified {
                return;
            }
            slot.blocks.iter_mut().for_each(|b| *b = BlockState::Unassigned);
        }
    }

    pub fn is_verified(&self, piece: u32) -> bool {
        self.pieces.get(piece as usize).is_some_and(|s| s.verified)
    }

    /// Count a connected peer's pieces towards availability
    pub fn add_availability(&mut self, bitfield: &Bitfield) {
        for index in bitfield.iter_set() {
            if let Some(slot) = self.pieces.get_mut(index) {
                slot.availability += 1;
            }
        }
    }

    pub fn remove_availability(&mut self, bitfield: &Bitfield) {
        for index in bitfield.iter_set() {
            if let Some(slot) = self.pieces.get_mut(index) {
                slot.availability = slot.availability.saturating_sub(1);
            }
        }
    }

    pub fn record_have(&mut self, piece: u32) {
        if let Some(slot) = self.pieces.get_mut(piece as usize) {
            slot.availability += 1;
        }
    }

    pub fn availability(&self, piece: u32) -> u32 {
        self.pieces.get(piece as usize).map_or(0, |s| s.availability)
    }

    pub fn set_wanted(&mut self, piece: usize, wanted: bool) {
        if let Some(slot) = self.pieces.get_mut(piece) {
            slot.wanted = wanted;
        }
    }

    /// Unverified pieces the selection still asks for
    pub fn wanted_remaining(&self) -> usize {
        self.pieces.iter().filter(|p| p.wanted && !p.verified).count()
    }

    /// Whether the peer has anything we still want
    pub fn is_interesting(&self, bitfield: &Bitfield) -> bool {
        bitfield.iter_set().any(|i| {
            self.pieces
                .get(i)
                .is_some_and(|p| p.wanted && !p.verified)
        })
    }

    /// Blocks of unverified pieces that nobody has requested
    pub fn unassigned_blocks(&self) -> usize {
        self.pieces
            .iter()
            .filter(|p| !p.verified)
            .map(PieceSlot::unassigned)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::SourceTag;

    fn peer(key: u64, pieces: &[usize], total: usize) -> PeerConnection {
        let addr = format!("10.0.0.{}:6881", key).parse().unwrap();
        let mut conn = PeerConnection::new(PeerKey(key), addr, SourceTag::Manual);
        let mut bitfield = Bitfield::new(total);
        pieces.iter().for_each(|&i| bitfield.set(i));
        conn.bitfield = bitfield;
        conn
    }

    fn scheduler(sizes: &[u32]) -> PieceScheduler {
        PieceScheduler::with_piece_sizes(sizes.iter().copied(), Duration::from_secs(10))
    }

    #[test]
    fn test_blocks_cover_piece_with_short_tail() {
        let mut sched = scheduler(&[BLOCK_SIZE * 2 + 100]);
        let a = peer(1, &[0], 1);
        let blocks = sched.next_requests(&a, 10, Instant::now());
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[2].offset, BLOCK_SIZE * 2);
        assert_eq!(blocks[2].length, 100);
    }

    #[test]
    fn test_capacity_respected() {
        let mut sched = scheduler(&[BLOCK_SIZE * 4]);
        let a = peer(1, &[0], 1);
        assert_eq!(sched.next_requests(&a, 3, Instant::now()).len(), 3);
        assert_eq!(sched.next_requests(&a, 0, Instant::now()).len(), 0);
    }

    #[test]
    fn test_only_pieces_peer_has() {
        let mut sched = scheduler(&[BLOCK_SIZE; 3]);
        let a = peer(1, &[1], 3);
        let blocks = sched.next_requests(&a, 10, Instant::now());
        assert!(blocks.iter().all(|b| b.piece == 1));
        assert_eq!(blocks.len(), 1);
    }

    #[test]
    fn test_rarest_first() {
        let mut sched = scheduler(&[BLOCK_SIZE; 3]);
        let a = peer(1, &[0, 1, 2], 3);
        let b = peer(2, &[0, 2], 3);
        let c = peer(3, &[0], 3);
        for p in [&a, &b, &c] {
            sched.add_availability(&p.bitfield);
        }
        let blocks = sched.next_requests(&a, 1, Instant::now());
        assert_eq!(blocks[0].piece, 1);
    }

    #[test]
    fn test_started_piece_preferred() {
        let mut sched = scheduler(&[BLOCK_SIZE * 2, BLOCK_SIZE * 2]);
        let a = peer(1, &[1], 2);
        let b = peer(2, &[0, 1], 2);
        let now = Instant::now();
        assert_eq!(sched.next_requests(&a, 1, now)[0].piece, 1);
        // piece 1 has one block left and wins over the untouched piece 0
        assert_eq!(sched.next_requests(&b, 1, now)[0].piece, 1);
    }

    #[test]
    fn test_shared_piece_assigned_to_one_peer() {
        let mut sched = scheduler(&[BLOCK_SIZE; 3]);
        sched.mark_verified(0);
        sched.mark_verified(1);
        let a = peer(1, &[0, 1, 2], 3);
        let b = peer(2, &[2], 3);
        let now = Instant::now();

        let first = sched.next_requests(&a, 8, now);
        assert_eq!(first, vec![BlockRequest { piece: 2, offset: 0, length: BLOCK_SIZE }]);
        assert!(sched.next_requests(&b, 8, now + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_endgame_after_grace() {
        let mut sched = scheduler(&[BLOCK_SIZE]);
        let a = peer(1, &[0], 1);
        let b = peer(2, &[0], 1);
        let now = Instant::now();
        sched.next_requests(&a, 4, now);

        assert!(sched.next_requests(&b, 4, now + Duration::from_secs(9)).is_empty());
        let dup = sched.next_requests(&b, 4, now + Duration::from_secs(10));
        assert_eq!(dup.len(), 1);
        // never handed twice to the same peer
        assert!(sched.next_requests(&a, 4, now + Duration::from_secs(60)).is_empty());

        match sched.mark_received(&dup[0], b.key) {
            BlockReceipt::Accepted { cancel } => assert_eq!(cancel, vec![a.key]),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(sched.mark_received(&dup[0], a.key), BlockReceipt::Duplicate);
    }

    #[test]
    fn test_release_peer_returns_exactly_n() {
        let mut sched = scheduler(&[BLOCK_SIZE * 4, BLOCK_SIZE * 4]);
        let a = peer(1, &[0, 1], 2);
        let b = peer(2, &[0, 1], 2);
        let now = Instant::now();
        let taken = sched.next_requests(&a, 5, now).len();
        sched.next_requests(&b, 2, now);

        let before = sched.unassigned_blocks();
        assert_eq!(sched.release_peer(a.key), taken);
        assert_eq!(sched.unassigned_blocks(), before + taken);
    }

    #[test]
    fn test_never_requests_verified_piece() {
        let mut sched = scheduler(&[BLOCK_SIZE, BLOCK_SIZE]);
        sched.mark_verified(0);
        let a = peer(1, &[0], 2);
        let later = Instant::now() + Duration::from_secs(3600);
        assert!(sched.next_requests(&a, 16, later).is_empty());
        assert!(!sched.is_interesting(&a.bitfield));
    }

    #[test]
    fn test_reset_piece_makes_blocks_requestable() {
        let mut sched = scheduler(&[BLOCK_SIZE * 2]);
        let a = peer(1, &[0], 1);
        let now = Instant::now();
        for block in sched.next_requests(&a, 2, now) {
            sched.mark_received(&block, a.key);
        }
        assert_eq!(sched.unassigned_blocks(), 0);
        sched.reset_piece(0);
        assert_eq!(sched.unassigned_blocks(), 2);
        assert_eq!(sched.next_requests(&a, 2, now).len(), 2);
    }

    #[test]
    fn test_abandon_single_holder() {
        let mut sched = scheduler(&[BLOCK_SIZE]);
        let a = peer(1, &[0], 1);
        let block = sched.next_requests(&a, 1, Instant::now())[0];
        assert!(sched.abandon(&block, a.key));
        assert!(!sched.abandon(&block, a.key));
        assert_eq!(sched.unassigned_blocks(), 1);
    }

    #[test]
    fn test_unwanted_pieces_skipped() {
        let mut sched = scheduler(&[BLOCK_SIZE, BLOCK_SIZE]);
        sched.set_wanted(0, false);
        let a = peer(1, &[0, 1], 2);
        let blocks = sched.next_requests(&a, 4, Instant::now());
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].piece, 1);
        assert_eq!(sched.wanted_remaining(), 1);
    }

    #[test]
    fn test_block_at_validates_geometry() {
        let sched = scheduler(&[BLOCK_SIZE + 10]);
        assert!(sched.block_at(0, 0, BLOCK_SIZE).is_some());
        assert!(sched.block_at(0, BLOCK_SIZE, 10).is_some());
        assert!(sched.block_at(0, BLOCK_SIZE, BLOCK_SIZE).is_none());
        assert!(sched.block_at(0, 5, 10).is_none());
        assert!(sched.block_at(1, 0, 10).is_none());
    }
}
