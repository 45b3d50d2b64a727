//! Extension protocol messages
//!
//! The BEP 10 extended handshake and the BEP 9 `ut_metadata` messages carried
//! inside [`Message::Extended`](super::Message::Extended).

use anyhow::Result;
use bytes::Bytes;

use crate::error::TorrentError;
use crate::torrent::bencode::{self, Value};

/// Extended message id of the extended handshake
pub const EXTENDED_HANDSHAKE_ID: u8 = 0;

/// The id we ask peers to use when sending us `ut_metadata` messages
pub const LOCAL_UT_METADATA_ID: u8 = 1;

/// Metadata is exchanged in 16 KiB pieces
pub const METADATA_PIECE_SIZE: usize = 16 * 1024;

/// Upper bound on an advertised info dictionary
pub const MAX_METADATA_SIZE: usize = 16 * 1024 * 1024;

const UT_METADATA: &[u8] = b"ut_metadata";

/// Contents of an extended handshake
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtendedHandshake {
    /// The id the sender wants `ut_metadata` messages tagged with
    pub ut_metadata: Option<u8>,
    /// Size of the info dictionary, when the sender has it
    pub metadata_size: Option<usize>,
    /// Client name and version
    pub client: Option<String>,
}

impl ExtendedHandshake {
    /// Our handshake: we understand `ut_metadata` and may know the metadata size
    pub fn local(metadata_size: Option<usize>) -> Self {
        Self {
            ut_metadata: Some(LOCAL_UT_METADATA_ID),
            metadata_size,
            client: Some(format!("torrent-engine {}", env!("CARGO_PKG_VERSION"))),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut m = Vec::new();
        if let Some(id) = self.ut_metadata {
            m.push((UT_METADATA, Value::Int(id as i64)));
        }
        let mut entries = vec![(b"m".as_ref(), Value::dict(m))];
        if let Some(size) = self.metadata_size {
            entries.push((b"metadata_size".as_ref(), Value::Int(size as i64)));
        }
        if let Some(client) = &self.client {
            entries.push((b"v".as_ref(), Value::bytes(client)));
        }
        Bytes::from(Value::dict(entries).encode())
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let value = bencode::decode(payload)
            .map_err(|e| TorrentError::protocol_with_detail("Invalid extended handshake", e.to_string()))?;
        if value.as_dict().is_none() {
            return Err(TorrentError::protocol("Extended handshake must be a dictionary").into());
        }

        // id 0 in `m` means the sender disabled the extension
        let ut_metadata = value
            .get(b"m")
            .and_then(|m| m.get(UT_METADATA))
            .and_then(Value::as_int)
            .filter(|&id| id > 0 && id <= u8::MAX as i64)
            .map(|id| id as u8);

        let metadata_size = value
            .get(b"metadata_size")
            .and_then(Value::as_int)
            .filter(|&size| size > 0 && size as usize <= MAX_METADATA_SIZE)
            .map(|size| size as usize);

        Ok(Self {
            ut_metadata,
            metadata_size,
            client: value.get(b"v").and_then(Value::as_str),
        })
    }
}

/// A `ut_metadata` message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMessage {
    Request { piece: usize },
    Data { piece: usize, total_size: usize, data: Bytes },
    Reject { piece: usize },
}

impl MetadataMessage {
    pub fn piece(&self) -> usize {
        match self {
            MetadataMessage::Request { piece }
            | MetadataMessage::Data { piece, .. }
            | MetadataMessage::Reject { piece } => *piece,
        }
    }

    pub fn encode(&self) -> Bytes {
        let (msg_type, piece) = match self {
            MetadataMessage::Request { piece } => (0, *piece),
            MetadataMessage::Data { piece, .. } => (1, *piece),
            MetadataMessage::Reject { piece } => (2, *piece),
        };
        let mut entries = vec![
            (b"msg_type".as_ref(), Value::Int(msg_type)),
            (b"piece".as_ref(), Value::Int(piece as i64)),
        ];
        if let MetadataMessage::Data { total_size, .. } = self {
            entries.push((b"total_size".as_ref(), Value::Int(*total_size as i64)));
        }

        let mut out = Value::dict(entries).encode();
        if let MetadataMessage::Data { data, .. } = self {
            out.extend_from_slice(data);
        }
        Bytes::from(out)
    }

    /// Parse a message; data messages carry raw bytes after the dictionary
    pub fn decode(payload: &Bytes) -> Result<Self> {
        let (value, consumed) = bencode::decode_prefix(payload)
            .map_err(|e| TorrentError::protocol_with_detail("Invalid ut_metadata message", e.to_string()))?;

        let int = |key: &[u8]| value.get(key).and_then(Value::as_int).filter(|&v| v >= 0);
        let piece = int(b"piece")
            .ok_or_else(|| TorrentError::protocol("ut_metadata message missing piece"))?
            as usize;

        match int(b"msg_type") {
            Some(0) => Ok(MetadataMessage::Request { piece }),
            Some(1) => {
                let total_size = int(b"total_size")
                    .ok_or_else(|| TorrentError::protocol("ut_metadata data missing total_size"))?
                    as usize;
                Ok(MetadataMessage::Data {
                    piece,
                    total_size,
                    data: payload.slice(consumed..),
                })
            }
            Some(2) => Ok(MetadataMessage::Reject { piece }),
            other => Err(TorrentError::protocol_with_detail(
                "Unknown ut_metadata msg_type",
                format!("{:?}", other),
            )
            .into()),
        }
    }
}
