//! Torrent metadata structures
//!
//! The immutable description of a download produced by the metadata parser.

use std::ops::Range;
use std::path::PathBuf;

use sha1::{Digest, Sha1};

/// Length of a SHA-1 digest
pub const HASH_LEN: usize = 20;

/// A file inside the torrent's concatenated piece stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the download root (includes the torrent name for
    /// multi-file torrents)
    pub path: PathBuf,
    /// File size in bytes
    pub length: u64,
    /// Byte offset of the first byte of this file in the piece stream
    pub offset: u64,
}

impl FileEntry {
    /// Byte range of this file in the piece stream
    pub fn range(&self) -> Range<u64> {
        self.offset..self.offset + self.length
    }
}

/// Parsed, validated torrent metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentMetadata {
    /// SHA-1 digest of the bencoded info dictionary
    pub info_hash: [u8; HASH_LEN],
    /// Torrent name
    pub name: String,
    /// Nominal piece size in bytes
    pub piece_length: u64,
    /// Expected digest of every piece, in order
    pub pieces: Vec<[u8; HASH_LEN]>,
    /// Files in stream order
    pub files: Vec<FileEntry>,
    /// Tracker announce URLs, deduplicated, tier order preserved
    pub trackers: Vec<String>,
    /// Raw info dictionary bytes, served back for `ut_metadata`
    pub info_bytes: Vec<u8>,
}

impl TorrentMetadata {
    /// Total content length
    pub fn total_length(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Get info hash as a hex string
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    pub fn piece_hash(&self, index: usize) -> Option<&[u8; HASH_LEN]> {
        self.pieces.get(index)
    }

    /// Byte range of a piece in the stream; the last piece may be short
    pub fn piece_range(&self, index: usize) -> Option<Range<u64>> {
        if index >= self.pieces.len() {
            return None;
        }
        let start = index as u64 * self.piece_length;
        let end = (start + self.piece_length).min(self.total_length());
        Some(start..end)
    }

    /// Size of a piece in bytes (0 for out-of-range indices)
    pub fn piece_size(&self, index: usize) -> u64 {
        self.piece_range(index).map(|r| r.end - r.start).unwrap_or(0)
    }

    /// Indices of the pieces that overlap the given file
    pub fn pieces_for_file(&self, file_index: usize) -> Range<usize> {
        let Some(file) = self.files.get(file_index) else {
            return 0..0;
        };
        if file.length == 0 {
            return 0..0;
        }
        let first = (file.offset / self.piece_length) as usize;
        let last = ((file.offset + file.length - 1) / self.piece_length) as usize;
        first..last + 1
    }

    /// Files that overlap a piece, with the overlapping byte range of each
    /// file relative to the file start
    pub fn files_for_piece(&self, index: usize) -> Vec<(usize, Range<u64>)> {
        let Some(piece) = self.piece_range(index) else {
            return Vec::new();
        };
        self.files
            .iter()
            .enumerate()
            .filter_map(|(i, f)| {
                let start = piece.start.max(f.offset);
                let end = piece.end.min(f.offset + f.length);
                (start < end).then(|| (i, start - f.offset..end - f.offset))
            })
            .collect()
    }
}

/// SHA-1 of arbitrary bytes
pub fn sha1_digest(data: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(lengths: &[u64], piece_length: u64) -> TorrentMetadata {
        let mut offset = 0;
        let files = lengths
            .iter()
            .enumerate()
            .map(|(i, &length)| {
                let entry = FileEntry {
                    path: PathBuf::from(format!("file{}", i)),
                    length,
                    offset,
                };
                offset += length;
                entry
            })
            .collect();
        let count = offset.div_ceil(piece_length) as usize;
        TorrentMetadata {
            info_hash: [1u8; 20],
            name: "sample".to_string(),
            piece_length,
            pieces: vec![[0u8; 20]; count],
            files,
            trackers: Vec::new(),
            info_bytes: Vec::new(),
        }
    }

    #[test]
    fn test_piece_range_short_last_piece() {
        let meta = sample(&[54152], 16384);
        assert_eq!(meta.piece_count(), 4);
        assert_eq!(meta.piece_range(0), Some(0..16384));
        assert_eq!(meta.piece_range(3), Some(49152..54152));
        assert_eq!(meta.piece_size(3), 5000);
        assert_eq!(meta.piece_range(4), None);
    }

    #[test]
    fn test_pieces_for_file() {
        let meta = sample(&[100, 200, 50], 128);
        assert_eq!(meta.pieces_for_file(0), 0..1);
        assert_eq!(meta.pieces_for_file(1), 0..3);
        assert_eq!(meta.pieces_for_file(2), 2..3);
        assert_eq!(meta.pieces_for_file(9), 0..0);
    }

    #[test]
    fn test_files_for_piece() {
        let meta = sample(&[100, 200], 128);
        let overlaps = meta.files_for_piece(0);
        assert_eq!(overlaps, vec![(0, 0..100), (1, 0..28)]);
        assert_eq!(meta.files_for_piece(2), vec![(1, 156..200)]);
    }

    #[test]
    fn test_info_hash_hex() {
        let meta = sample(&[10], 16);
        assert_eq!(meta.info_hash_hex(), "01".repeat(20));
    }

    #[test]
    fn test_sha1_digest() {
        assert_eq!(
            hex::encode(sha1_digest(b"abc")),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }
}
