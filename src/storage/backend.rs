//! Persistence backends for verified pieces
//!
//! The verification store writes every verified piece to a backend before
//! counting it; completed files are later streamed back out of the same
//! backend. Data is addressed by piece index.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::error::TorrentError;
use crate::torrent::TorrentMetadata;

/// Name of the buffer file inside a download's buffer directory
pub const BUFFER_FILE: &str = "pieces.dat";

/// Storage type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Memory,
    File,
}

/// Abstract storage for verified piece data
#[async_trait]
pub trait PieceBackend: Send + Sync {
    /// Persist a verified piece
    async fn write_piece(&self, index: u32, data: Bytes) -> Result<()>;

    /// Read a piece back; `None` when nothing was ever stored for it
    async fn read_piece(&self, index: u32) -> Result<Option<Bytes>>;

    /// Discard everything stored for this download
    async fn purge(&self) -> Result<()>;

    fn kind(&self) -> BackendKind;
}

/// Keeps pieces in memory; nothing survives the process
#[derive(Debug, Default)]
pub struct MemoryBackend {
    pieces: Mutex<HashMap<u32, Bytes>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PieceBackend for MemoryBackend {
    async fn write_piece(&self, index: u32, data: Bytes) -> Result<()> {
        self.pieces.lock().insert(index, data);
        Ok(())
    }

    async fn read_piece(&self, index: u32) -> Result<Option<Bytes>> {
        Ok(self.pieces.lock().get(&index).cloned())
    }

    async fn purge(&self) -> Result<()> {
        self.pieces.lock().clear();
        Ok(())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }
}

/// Stores the piece stream in a single sparse file
///
/// Piece `i` lives at byte `i * piece_length` of `<dir>/pieces.dat`.
#[derive(Debug)]
pub struct FileBackend {
    dir: PathBuf,
    path: PathBuf,
    piece_length: u64,
    total_length: u64,
    file: tokio::sync::Mutex<Option<File>>,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>, metadata: &TorrentMetadata) -> Self {
        let dir = dir.into();
        let path = dir.join(BUFFER_FILE);
        Self {
            dir,
            path,
            piece_length: metadata.piece_length,
            total_length: metadata.total_length(),
            file: tokio::sync::Mutex::new(None),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn storage_err(&self, message: &str, err: std::io::Error) -> anyhow::Error {
        TorrentError::storage_with_path(format!("{}: {}", message, err), self.path.display().to_string())
            .into()
    }

    fn piece_span(&self, index: u32) -> (u64, usize) {
        let start = index as u64 * self.piece_length;
        let end = (start + self.piece_length).min(self.total_length);
        (start, end.saturating_sub(start) as usize)
    }
}

#[async_trait]
impl PieceBackend for FileBackend {
    async fn write_piece(&self, index: u32, data: Bytes) -> Result<()> {
        let mut guard = self.file.lock().await;
        if guard.is_none() {
            tokio::fs::create_dir_all(&self.dir)
                .await
                .map_err(|e| self.storage_err("Failed to create buffer directory", e))?;
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&self.path)
                .await
                .map_err(|e| self.storage_err("Failed to open buffer file", e))?;
            *guard = Some(file);
        }
        let Some(file) = guard.as_mut() else {
            return Err(TorrentError::storage("Buffer file handle unavailable").into());
        };

        let (start, _) = self.piece_span(index);
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|e| self.storage_err("Failed to seek buffer file", e))?;
        file.write_all(&data)
            .await
            .map_err(|e| self.storage_err("Failed to write piece", e))?;
        file.flush()
            .await
            .map_err(|e| self.storage_err("Failed to flush buffer file", e))?;
        debug!("Wrote piece {} ({} bytes) at offset {}", index, data.len(), start);
        Ok(())
    }

    async fn read_piece(&self, index: u32) -> Result<Option<Bytes>> {
        let (start, len) = self.piece_span(index);
        if len == 0 {
            return Ok(None);
        }

        let mut guard = self.file.lock().await;
        let mut opened;
        let file = match guard.as_mut() {
            Some(file) => file,
            None => match File::open(&self.path).await {
                Ok(file) => {
                    opened = file;
                    &mut opened
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(self.storage_err("Failed to open buffer file", e)),
            },
        };

        let file_len = file
            .metadata()
            .await
            .map_err(|e| self.storage_err("Failed to stat buffer file", e))?
            .len();
        if file_len < start + len as u64 {
            return Ok(None);
        }

        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|e| self.storage_err("Failed to seek buffer file", e))?;
        let mut buf = BytesMut::zeroed(len);
        file.read_exact(&mut buf)
            .await
            .map_err(|e| self.storage_err("Failed to read piece", e))?;
        Ok(Some(buf.freeze()))
    }

    async fn purge(&self) -> Result<()> {
        self.file.lock().await.take();
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => {
                info!("Purged buffer directory {}", self.dir.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.storage_err("Failed to purge buffer directory", e)),
        }
    }

    fn kind(&self) -> BackendKind {
        BackendKind::File
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::info::FileEntry;

    fn metadata(total: u64, piece_length: u64) -> TorrentMetadata {
        TorrentMetadata {
            info_hash: [0u8; 20],
            name: "t".to_string(),
            piece_length,
            pieces: vec![[0u8; 20]; total.div_ceil(piece_length) as usize],
            files: vec![FileEntry {
                path: PathBuf::from("t"),
                length: total,
                offset: 0,
            }],
            trackers: Vec::new(),
            info_bytes: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_memory_backend() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.read_piece(0).await.unwrap(), None);
        backend.write_piece(0, Bytes::from_static(b"abc")).await.unwrap();
        assert_eq!(backend.read_piece(0).await.unwrap(), Some(Bytes::from_static(b"abc")));
        backend.purge().await.unwrap();
        assert_eq!(backend.read_piece(0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_backend_out_of_order_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(tmp.path().join("dl"), &metadata(10, 4));

        assert_eq!(backend.read_piece(1).await.unwrap(), None);
        backend.write_piece(2, Bytes::from_static(b"zz")).await.unwrap();
        backend.write_piece(0, Bytes::from_static(b"aaaa")).await.unwrap();

        assert_eq!(backend.read_piece(0).await.unwrap().unwrap().as_ref(), b"aaaa");
        assert_eq!(backend.read_piece(2).await.unwrap().unwrap().as_ref(), b"zz");
        // the gap reads back as zeros, which will never verify
        assert_eq!(backend.read_piece(1).await.unwrap().unwrap().as_ref(), &[0u8; 4]);
        assert_eq!(backend.kind(), BackendKind::File);
    }

    #[tokio::test]
    async fn test_file_backend_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let meta = metadata(8, 4);
        {
            let backend = FileBackend::new(tmp.path().join("dl"), &meta);
            backend.write_piece(1, Bytes::from_static(b"bbbb")).await.unwrap();
        }
        let backend = FileBackend::new(tmp.path().join("dl"), &meta);
        assert_eq!(backend.read_piece(1).await.unwrap().unwrap().as_ref(), b"bbbb");
    }

    #[tokio::test]
    async fn test_file_backend_purge() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("dl");
        let backend = FileBackend::new(&dir, &metadata(4, 4));
        backend.write_piece(0, Bytes::from_static(b"cccc")).await.unwrap();
        assert!(dir.join(BUFFER_FILE).exists());

        backend.purge().await.unwrap();
        assert!(!dir.exists());
        assert_eq!(backend.read_piece(0).await.unwrap(), None);
        // purging twice is fine
        backend.purge().await.unwrap();
    }
}
