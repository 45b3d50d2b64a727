//! Torrent descriptor handling
//!
//! Parsing of metainfo files and magnet links into immutable metadata.

pub mod bencode;
pub mod info;
pub mod magnet;
pub mod metadata;
pub mod parser;

pub use info::{FileEntry, TorrentMetadata};
pub use magnet::MagnetLink;
pub use metadata::MetadataAssembler;
pub use parser::{Descriptor, MetadataParser, TorrentSource};
