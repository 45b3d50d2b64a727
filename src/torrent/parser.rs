//! Torrent metadata parser
//!
//! Turns a descriptor source (metainfo bytes or a magnet URI) into validated
//! [`TorrentMetadata`]. Parsing has no side effects.

use std::path::{Component, Path, PathBuf};

use anyhow::Result;
use tracing::{debug, info, trace};

use crate::error::TorrentError;
use crate::torrent::bencode::{self, Value};
use crate::torrent::info::{sha1_digest, FileEntry, TorrentMetadata, HASH_LEN};
use crate::torrent::magnet::MagnetLink;

/// Where a torrent descriptor came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TorrentSource {
    /// Bencoded metainfo (a `.torrent` file or HTTP response body)
    Metainfo(Vec<u8>),
    /// A `magnet:` URI
    Magnet(String),
}

impl TorrentSource {
    /// Classify raw input: anything starting with `magnet:` is a magnet URI
    pub fn from_input(data: Vec<u8>) -> Self {
        match std::str::from_utf8(&data) {
            Ok(text) if MagnetLink::is_magnet_link(text) => {
                TorrentSource::Magnet(text.trim().to_string())
            }
            _ => TorrentSource::Metainfo(data),
        }
    }
}

/// Result of parsing a source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Descriptor {
    /// Full metadata is known
    Complete(TorrentMetadata),
    /// Only the info-hash is known; the info dictionary must be fetched from peers
    Magnet(MagnetLink),
}

impl Descriptor {
    pub fn info_hash(&self) -> [u8; HASH_LEN] {
        match self {
            Descriptor::Complete(meta) => meta.info_hash,
            Descriptor::Magnet(link) => link.info_hash,
        }
    }
}

/// Parser for torrent descriptors
pub struct MetadataParser;

impl MetadataParser {
    /// Parse any supported source
    pub fn parse(source: &TorrentSource) -> Result<Descriptor> {
        match source {
            TorrentSource::Metainfo(data) => Ok(Descriptor::Complete(Self::parse_bytes(data)?)),
            TorrentSource::Magnet(uri) => Ok(Descriptor::Magnet(MagnetLink::parse(uri)?)),
        }
    }

    /// Parse a bencoded metainfo file
    pub fn parse_bytes(data: &[u8]) -> Result<TorrentMetadata> {
        info!("Parsing torrent metainfo from {} bytes", data.len());
        trace!("Metainfo head: {:?}", &data[..data.len().min(64)]);

        let (root, spans) = bencode::decode_dict_spans(data)?;

        let info_span = spans
            .iter()
            .find(|(key, _)| key.as_slice() == b"info")
            .map(|(_, span)| span.clone())
            .ok_or_else(|| TorrentError::malformed("Missing info dictionary"))?;

        let trackers = Self::trackers(&root);
        Self::parse_info_dict(&data[info_span], None, trackers)
    }

    /// Parse a raw info dictionary
    ///
    /// The info-hash is the SHA-1 of `info_bytes`. When `expected` is given
    /// (magnet downloads) a mismatch is rejected.
    pub fn parse_info_dict(
        info_bytes: &[u8],
        expected: Option<[u8; HASH_LEN]>,
        trackers: Vec<String>,
    ) -> Result<TorrentMetadata> {
        let info_hash = sha1_digest(info_bytes);
        if let Some(expected) = expected {
            if expected != info_hash {
                return Err(TorrentError::malformed_with_detail(
                    "Info hash mismatch",
                    format!(
                        "expected {}, computed {}",
                        hex::encode(expected),
                        hex::encode(info_hash)
                    ),
                )
                .into());
            }
        }

        let info = bencode::decode(info_bytes)?;
        if info.as_dict().is_none() {
            return Err(TorrentError::malformed("Info must be a dictionary").into());
        }

        let name = info
            .get(b"name")
            .and_then(Value::as_str)
            .ok_or_else(|| TorrentError::malformed("Missing name field"))?;
        Self::check_component(&name)?;

        let piece_length = info
            .get(b"piece length")
            .and_then(Value::as_int)
            .ok_or_else(|| TorrentError::malformed("Missing piece length"))?;
        if piece_length <= 0 {
            return Err(TorrentError::malformed_with_detail(
                "Piece length must be positive",
                piece_length.to_string(),
            )
            .into());
        }
        if piece_length > u32::MAX as i64 {
            return Err(TorrentError::malformed_with_detail(
                "Piece length does not fit in 32 bits",
                piece_length.to_string(),
            )
            .into());
        }
        let piece_length = piece_length as u64;

        let pieces_bytes = info
            .get(b"pieces")
            .and_then(Value::as_bytes)
            .ok_or_else(|| TorrentError::malformed("Missing pieces field"))?;
        let pieces = Self::parse_piece_hashes(pieces_bytes)?;

        let files = Self::file_layout(&info, &name)?;
        let total: u64 = files.iter().map(|f| f.length).sum();
        if total == 0 {
            return Err(TorrentError::malformed("Torrent has no content").into());
        }

        let expected_pieces = total.div_ceil(piece_length);
        if pieces.len() as u64 != expected_pieces {
            return Err(TorrentError::malformed_with_detail(
                "Piece count does not match content length",
                format!(
                    "{} hashes for {} bytes at piece length {} (expected {})",
                    pieces.len(),
                    total,
                    piece_length,
                    expected_pieces
                ),
            )
            .into());
        }

        if let Some(file) = files.iter().find(|f| f.offset + f.length > total) {
            return Err(TorrentError::malformed_with_detail(
                "File range exceeds content length",
                file.path.display().to_string(),
            )
            .into());
        }

        debug!(
            "Info dict: name={}, {} pieces of {} bytes, {} files, {} bytes total",
            name,
            pieces.len(),
            piece_length,
            files.len(),
            total
        );

        Ok(TorrentMetadata {
            info_hash,
            name,
            piece_length,
            pieces,
            files,
            trackers,
            info_bytes: info_bytes.to_vec(),
        })
    }

    /// Split the concatenated `pieces` string into 20-byte digests
    pub fn parse_piece_hashes(pieces_bytes: &[u8]) -> Result<Vec<[u8; HASH_LEN]>> {
        if pieces_bytes.len() % HASH_LEN != 0 {
            return Err(TorrentError::malformed_with_detail(
                "Pieces field length must be a multiple of 20",
                pieces_bytes.len().to_string(),
            )
            .into());
        }

        Ok(pieces_bytes
            .chunks_exact(HASH_LEN)
            .map(|chunk| {
                let mut hash = [0u8; HASH_LEN];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect())
    }

    fn file_layout(info: &Value, name: &str) -> Result<Vec<FileEntry>> {
        if let Some(length) = info.get(b"length") {
            let length = length
                .as_int()
                .filter(|&l| l >= 0)
                .ok_or_else(|| TorrentError::malformed("Invalid length field"))?;
            return Ok(vec![FileEntry {
                path: PathBuf::from(name),
                length: length as u64,
                offset: 0,
            }]);
        }

        let list = info
            .get(b"files")
            .and_then(Value::as_list)
            .ok_or_else(|| TorrentError::malformed("Neither length nor files found in info dict"))?;
        if list.is_empty() {
            return Err(TorrentError::malformed("Files list is empty").into());
        }

        let mut files = Vec::with_capacity(list.len());
        let mut offset = 0u64;
        for entry in list {
            let length = entry
                .get(b"length")
                .and_then(Value::as_int)
                .filter(|&l| l >= 0)
                .ok_or_else(|| TorrentError::malformed("Missing or invalid file length"))?
                as u64;

            let components = entry
                .get(b"path")
                .and_then(Value::as_list)
                .filter(|p| !p.is_empty())
                .ok_or_else(|| TorrentError::malformed("Missing file path"))?;

            let mut path = PathBuf::from(name);
            for component in components {
                let part = component
                    .as_str()
                    .ok_or_else(|| TorrentError::malformed("File path component must be a string"))?;
                Self::check_component(&part)?;
                path.push(part);
            }

            files.push(FileEntry {
                path,
                length,
                offset,
            });
            offset = offset
                .checked_add(length)
                .ok_or_else(|| TorrentError::malformed("Content length overflows"))?;
        }

        Ok(files)
    }

    /// Path components must stay inside the download root
    fn check_component(part: &str) -> Result<()> {
        let mut components = Path::new(part).components();
        let valid = !part.is_empty()
            && matches!(components.next(), Some(Component::Normal(_)))
            && components.next().is_none();
        if !valid {
            return Err(TorrentError::malformed_with_detail(
                "Unsafe path component",
                part.to_string(),
            )
            .into());
        }
        Ok(())
    }

    fn trackers(root: &Value) -> Vec<String> {
        let mut trackers: Vec<String> = Vec::new();
        let mut push = |url: String| {
            if !url.is_empty() && !trackers.contains(&url) {
                trackers.push(url);
            }
        };

        if let Some(url) = root.get(b"announce").and_then(Value::as_str) {
            push(url);
        }
        for tier in root
            .get(b"announce-list")
            .and_then(Value::as_list)
            .unwrap_or_default()
        {
            for url in tier.as_list().unwrap_or_default() {
                if let Some(url) = url.as_str() {
                    push(url);
                }
            }
        }
        trackers
    }
}
