//! torrent-engine
//!
//! A BitTorrent download engine: descriptor parsing, peer discovery over
//! trackers and DHT, wire sessions, piece scheduling and hash verification.

pub mod cli;
pub mod config;
pub mod dht;
pub mod engine;
pub mod error;
pub mod events;
pub mod peer;
pub mod protocol;
pub mod scheduler;
pub mod storage;
pub mod swarm;
pub mod torrent;

pub use config::EngineConfig;
pub use engine::{Progress, TorrentEngine};
pub use error::TorrentError;
pub use events::{EngineEvent, EventBus, EventStream};

pub use dht::{DhtDiscovery, Node, NodeId};
pub use peer::{
    Discovery, PeerCandidate, PeerConnection, PeerKey, PeerSource, SessionState, SourceItem, SourceTag,
    TrackerDiscovery,
};
pub use protocol::{ExtendedHandshake, Handshake, Message, MessageId, MetadataMessage};
pub use scheduler::{BlockReceipt, BlockRequest, PieceScheduler, BLOCK_SIZE};
pub use storage::{
    Bitfield, CompletedFile, DownloadState, FileBackend, MemoryBackend, PieceBackend, PieceOutcome,
    VerificationStore,
};
pub use swarm::{SwarmController, SwarmState};
pub use torrent::{Descriptor, FileEntry, MagnetLink, MetadataParser, TorrentMetadata, TorrentSource};
pub use cli::{CliArgs, ProgressDisplay};
