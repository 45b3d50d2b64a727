//! Completed files
//!
//! A finished file is exposed as a restartable stream of byte chunks read
//! from the piece backend. Writing them to disk is up to the caller.

use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};

use crate::error::TorrentError;
use crate::storage::backend::PieceBackend;
use crate::torrent::TorrentMetadata;

/// A file whose pieces are all verified
#[derive(Clone)]
pub struct CompletedFile {
    pub index: usize,
    /// Path relative to the download root
    pub path: PathBuf,
    pub length: u64,
    /// `(piece, byte range within that piece)` in stream order
    chunks: Vec<(u32, Range<usize>)>,
    backend: Arc<dyn PieceBackend>,
}

impl std::fmt::Debug for CompletedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletedFile")
            .field("index", &self.index)
            .field("path", &self.path)
            .field("length", &self.length)
            .finish()
    }
}

impl CompletedFile {
    pub fn new(metadata: &TorrentMetadata, index: usize, backend: Arc<dyn PieceBackend>) -> Option<Self> {
        let file = metadata.files.get(index)?;
        let chunks = metadata
            .pieces_for_file(index)
            .filter_map(|piece| {
                let range = metadata.piece_range(piece)?;
                let start = range.start.max(file.offset);
                let end = range.end.min(file.offset + file.length);
                (start < end).then(|| {
                    (
                        piece as u32,
                        (start - range.start) as usize..(end - range.start) as usize,
                    )
                })
            })
            .collect();
        Some(Self {
            index,
            path: file.path.clone(),
            length: file.length,
            chunks,
            backend,
        })
    }

    /// Stream the file's bytes; every call starts again from the beginning
    pub fn stream(&self) -> BoxStream<'static, Result<Bytes>> {
        let backend = Arc::clone(&self.backend);
        stream::iter(self.chunks.clone())
            .then(move |(piece, range)| {
                let backend = Arc::clone(&backend);
                async move {
                    let data = backend.read_piece(piece).await?.ok_or_else(|| {
                        TorrentError::storage(format!("Piece {} missing from backend", piece))
                    })?;
                    if range.end > data.len() {
                        return Err(anyhow::Error::from(TorrentError::storage(format!(
                            "Piece {} shorter than expected",
                            piece
                        ))));
                    }
                    Ok::<Bytes, anyhow::Error>(data.slice(range))
                }
            })
            .boxed()
    }
}
