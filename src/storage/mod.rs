//! Storage module
//!
//! Piece buffering, verification, persistence and completed-file access.

pub mod backend;
pub mod bitfield;
pub mod files;
pub mod piece;
pub mod store;

pub use backend::{BackendKind, FileBackend, MemoryBackend, PieceBackend};
pub use bitfield::Bitfield;
pub use files::CompletedFile;
pub use piece::{Piece, PieceStatus};
pub use store::{DownloadState, PieceOutcome, VerificationStore};
