//! BitTorrent protocol module
//!
//! Implements the BitTorrent peer wire protocol and the extension messages
//! needed to fetch metadata for magnet links.

pub mod extension;
pub mod handshake;
pub mod message;
pub mod wire;

pub use extension::{ExtendedHandshake, MetadataMessage};
pub use handshake::{Handshake, PROTOCOL_LENGTH, PROTOCOL_STRING};
pub use message::{Message, MessageId};
pub use wire::{read_handshake, read_message, write_handshake, write_message};
