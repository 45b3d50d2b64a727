//! Peer connection state
//!
//! The coordinator's view of one live wire session: what the peer has, what
//! we asked it for, and how well it behaves. The socket itself lives in the
//! session task.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::peer::state::{PeerKey, SessionState, SourceTag};
use crate::scheduler::BlockRequest;
use crate::storage::Bitfield;

/// How a received block relates to our requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMatch {
    /// We asked for it and were still waiting
    Expected,
    /// We asked and later cancelled (timeout or endgame); harmless
    Cancelled,
    /// We never asked for it
    Unsolicited,
}

/// Represents a connected peer
#[derive(Debug)]
pub struct PeerConnection {
    pub key: PeerKey,
    pub addr: SocketAddr,
    pub source: SourceTag,
    pub state: SessionState,
    pub peer_id: Option<[u8; 20]>,
    /// Pieces the peer has
    pub bitfield: Bitfield,
    /// We are interested in the peer
    pub am_interested: bool,
    /// The peer is choking us
    pub peer_choking: bool,
    /// The peer is interested in us
    pub peer_interested: bool,
    /// Payload bytes received from this peer
    pub downloaded: u64,
    /// The peer set the extension protocol bit
    pub supports_extensions: bool,
    /// The peer's id for `ut_metadata`, from its extended handshake
    pub ut_metadata: Option<u8>,
    /// Info dictionary size advertised by the peer
    pub metadata_size: Option<usize>,
    /// Metadata piece we are waiting on from this peer
    pub metadata_request: Option<usize>,
    outstanding: HashMap<BlockRequest, Instant>,
    cancelled: HashSet<BlockRequest>,
    misbehavior: u32,
}

impl PeerConnection {
    pub fn new(key: PeerKey, addr: SocketAddr, source: SourceTag) -> Self {
        Self {
            key,
            addr,
            source,
            state: SessionState::Connecting,
            peer_id: None,
            bitfield: Bitfield::default(),
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            downloaded: 0,
            supports_extensions: false,
            ut_metadata: None,
            metadata_size: None,
            metadata_request: None,
            outstanding: HashMap::new(),
            cancelled: HashSet::new(),
            misbehavior: 0,
        }
    }

    /// Move along the session lifecycle, ignoring illegal transitions
    pub fn transition(&mut self, next: SessionState) {
        if self.state.can_transition_to(next) {
            self.state = next;
        } else {
            debug!(
                "Ignoring session transition {:?} -> {:?} for peer {}",
                self.state, next, self.addr
            );
        }
    }

    pub fn has_piece(&self, index: usize) -> bool {
        self.bitfield.has(index)
    }

    /// Check if we can request from peer
    pub fn can_request(&self) -> bool {
        self.state == SessionState::Active && !self.peer_choking && self.am_interested
    }

    /// Free slots in the request pipeline
    pub fn request_capacity(&self, depth: usize) -> usize {
        if !self.can_request() {
            return 0;
        }
        depth.saturating_sub(self.outstanding.len())
    }

    pub fn add_request(&mut self, block: BlockRequest, now: Instant) {
        self.cancelled.remove(&block);
        self.outstanding.insert(block, now);
    }

    /// Match an incoming block against our requests
    ///
    /// Unsolicited blocks raise the misbehavior score.
    pub fn complete_request(&mut self, block: &BlockRequest) -> RequestMatch {
        if self.outstanding.remove(block).is_some() {
            return RequestMatch::Expected;
        }
        if self.cancelled.remove(block) {
            return RequestMatch::Cancelled;
        }
        self.misbehavior += 1;
        warn!(
            "Unsolicited block piece={} offset={} from peer {} (score {})",
            block.piece, block.offset, self.addr, self.misbehavior
        );
        RequestMatch::Unsolicited
    }

    /// Record a block that could not be matched to any piece at all
    pub fn record_misbehavior(&mut self) -> u32 {
        self.misbehavior += 1;
        self.misbehavior
    }

    /// Withdraw a request we no longer need from this peer
    pub fn cancel_request(&mut self, block: &BlockRequest) -> bool {
        if self.outstanding.remove(block).is_some() {
            self.cancelled.insert(*block);
            return true;
        }
        false
    }

    /// Withdraw and return every request older than `timeout`
    pub fn expired_requests(&mut self, now: Instant, timeout: Duration) -> Vec<BlockRequest> {
        let expired: Vec<BlockRequest> = self
            .outstanding
            .iter()
            .filter(|(_, sent)| now.saturating_duration_since(**sent) >= timeout)
            .map(|(block, _)| *block)
            .collect();
        for block in &expired {
            self.outstanding.remove(block);
            self.cancelled.insert(*block);
        }
        expired
    }

    /// Drop cancelled requests for a piece that is now verified
    pub fn forget_piece(&mut self, piece: u32) {
        self.cancelled.retain(|block| block.piece != piece);
    }

    pub fn cancelled_len(&self) -> usize {
        self.cancelled.len()
    }

    /// Withdraw every outstanding request (choke or disconnect)
    pub fn take_outstanding(&mut self) -> Vec<BlockRequest> {
        let taken: Vec<BlockRequest> = self.outstanding.drain().map(|(b, _)| b).collect();
        self.cancelled.extend(taken.iter().copied());
        taken
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_outstanding(&self, block: &BlockRequest) -> bool {
        self.outstanding.contains_key(block)
    }

    pub fn misbehavior(&self) -> u32 {
        self.misbehavior
    }

    pub fn is_misbehaving(&self, threshold: u32) -> bool {
        self.misbehavior >= threshold
    }
}
