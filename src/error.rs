//! Error types for the torrent engine
//!
//! Every failure the engine can observe maps onto one of these variants.
//! Only `MalformedMetadata` and `Storage` are fatal to a download; everything
//! else is isolated to a single peer, request or discovery source.

use thiserror::Error;

/// Error taxonomy for torrent operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TorrentError {
    /// The descriptor (metainfo, info dictionary or magnet link) is invalid
    #[error("Malformed metadata: {message}{}", suffix("detail", .detail))]
    MalformedMetadata {
        message: String,
        detail: Option<String>,
    },

    /// Protocol or info-hash mismatch during the peer handshake
    #[error("Handshake failed with {peer}: {reason}")]
    HandshakeFailed { peer: String, reason: String },

    /// One discovery source (tracker, DHT) stopped producing candidates
    #[error("Peer source degraded ({origin}): {reason}")]
    PeerSourceDegraded { origin: String, reason: String },

    /// A completed piece did not match its expected digest
    #[error("Piece {index} failed hash verification")]
    PieceCorrupt { index: u32 },

    /// A block request was not answered in time
    #[error("Request for piece {piece} offset {offset} timed out (peer: {peer})")]
    RequestTimeout { peer: String, piece: u32, offset: u32 },

    /// The global connection ceiling is reached
    #[error("Connection limit of {limit} reached, dropping candidate {peer}")]
    ConnectionLimitExceeded { peer: String, limit: usize },

    /// Malformed or unexpected wire data
    #[error("Protocol error: {message}{}", suffix("detail", .detail))]
    Protocol {
        message: String,
        detail: Option<String>,
    },

    /// Socket level failures
    #[error("Network error: {message}{}", suffix("address", .address))]
    Network {
        message: String,
        address: Option<String>,
    },

    /// Persistence layer failures
    #[error("Storage error: {message}{}", suffix("path", .path))]
    Storage {
        message: String,
        path: Option<String>,
    },

    /// Invalid configuration values
    #[error("Config error: {message}{}", suffix("field", .field))]
    Config {
        message: String,
        field: Option<String>,
    },

    /// Misuse of the engine lifecycle
    #[error("Engine error: {message}")]
    Engine { message: String },
}

fn suffix(label: &str, value: &Option<String>) -> String {
    match value {
        Some(v) => format!(" ({}: {})", label, v),
        None => String::new(),
    }
}

impl TorrentError {
    /// Create a new MalformedMetadata error
    pub fn malformed(message: impl Into<String>) -> Self {
        TorrentError::MalformedMetadata {
            message: message.into(),
            detail: None,
        }
    }

    /// Create a new MalformedMetadata error with detail
    pub fn malformed_with_detail(message: impl Into<String>, detail: impl Into<String>) -> Self {
        TorrentError::MalformedMetadata {
            message: message.into(),
            detail: Some(detail.into()),
        }
    }

    pub fn handshake_failed(peer: impl Into<String>, reason: impl Into<String>) -> Self {
        TorrentError::HandshakeFailed {
            peer: peer.into(),
            reason: reason.into(),
        }
    }

    pub fn source_degraded(origin: impl Into<String>, reason: impl Into<String>) -> Self {
        TorrentError::PeerSourceDegraded {
            origin: origin.into(),
            reason: reason.into(),
        }
    }

    pub fn connection_limit(peer: impl Into<String>, limit: usize) -> Self {
        TorrentError::ConnectionLimitExceeded {
            peer: peer.into(),
            limit,
        }
    }

    /// Create a new Protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        TorrentError::Protocol {
            message: message.into(),
            detail: None,
        }
    }

    /// Create a new Protocol error with detail
    pub fn protocol_with_detail(message: impl Into<String>, detail: impl Into<String>) -> Self {
        TorrentError::Protocol {
            message: message.into(),
            detail: Some(detail.into()),
        }
    }

    /// Create a new Network error
    pub fn network(message: impl Into<String>) -> Self {
        TorrentError::Network {
            message: message.into(),
            address: None,
        }
    }

    /// Create a new Network error with address
    pub fn network_with_address(message: impl Into<String>, address: impl Into<String>) -> Self {
        TorrentError::Network {
            message: message.into(),
            address: Some(address.into()),
        }
    }

    /// Create a new Storage error
    pub fn storage(message: impl Into<String>) -> Self {
        TorrentError::Storage {
            message: message.into(),
            path: None,
        }
    }

    /// Create a new Storage error with path
    pub fn storage_with_path(message: impl Into<String>, path: impl Into<String>) -> Self {
        TorrentError::Storage {
            message: message.into(),
            path: Some(path.into()),
        }
    }

    /// Create a new Config error with field
    pub fn config(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::Config {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn engine(message: impl Into<String>) -> Self {
        TorrentError::Engine {
            message: message.into(),
        }
    }

    /// Whether this error aborts the whole download
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TorrentError::MalformedMetadata { .. } | TorrentError::Storage { .. }
        )
    }

    /// Append context to the error's detail field
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let ctx = context.into();
        let slot = match &mut self {
            TorrentError::MalformedMetadata { detail, .. } => detail,
            TorrentError::Protocol { detail, .. } => detail,
            TorrentError::Network { address, .. } => address,
            TorrentError::Storage { path, .. } => path,
            TorrentError::Config { field, .. } => field,
            _ => return self,
        };
        *slot = Some(match slot.take() {
            Some(existing) => format!("{}: {}", existing, ctx),
            None => ctx,
        });
        self
    }
}

impl From<std::io::Error> for TorrentError {
    fn from(err: std::io::Error) -> Self {
        TorrentError::Storage {
            message: err.to_string(),
            path: None,
        }
    }
}

impl From<serde_bencode::Error> for TorrentError {
    fn from(err: serde_bencode::Error) -> Self {
        TorrentError::malformed_with_detail("Failed to decode bencode data", err.to_string())
    }
}

impl From<serde_json::Error> for TorrentError {
    fn from(err: serde_json::Error) -> Self {
        TorrentError::Config {
            message: format!("Failed to parse JSON: {}", err),
            field: None,
        }
    }
}

impl From<std::net::AddrParseError> for TorrentError {
    fn from(err: std::net::AddrParseError) -> Self {
        TorrentError::network(format!("Failed to parse address: {}", err))
    }
}

impl From<tokio::time::error::Elapsed> for TorrentError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        TorrentError::network("Operation timed out")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_error() {
        let err = TorrentError::malformed("Invalid torrent file");
        assert_eq!(err.to_string(), "Malformed metadata: Invalid torrent file");
        assert!(err.is_fatal());
    }

    #[test]
    fn test_malformed_with_detail() {
        let err = TorrentError::malformed_with_detail("Invalid torrent file", "bencode error");
        assert_eq!(
            err.to_string(),
            "Malformed metadata: Invalid torrent file (detail: bencode error)"
        );
    }

    #[test]
    fn test_handshake_failed_is_not_fatal() {
        let err = TorrentError::handshake_failed("127.0.0.1:6881", "info hash mismatch");
        assert!(err.to_string().contains("127.0.0.1:6881"));
        assert!(err.to_string().contains("info hash mismatch"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_storage_error_is_fatal() {
        let err = TorrentError::storage_with_path("File not found", "/path/to/file");
        assert!(err.to_string().contains("/path/to/file"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_with_context() {
        let err = TorrentError::protocol("Invalid data").with_context("while reading bitfield");
        assert!(err.to_string().contains("while reading bitfield"));

        let err = err.with_context("peer 10.0.0.1:1");
        assert!(err.to_string().contains("while reading bitfield: peer 10.0.0.1:1"));
    }

    #[test]
    fn test_with_context_ignored_for_structured_variants() {
        let err = TorrentError::PieceCorrupt { index: 3 }.with_context("ignored");
        assert_eq!(err, TorrentError::PieceCorrupt { index: 3 });
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let err: TorrentError = io_err.into();
        assert!(matches!(err, TorrentError::Storage { .. }));
    }

    #[test]
    fn test_from_addr_parse_error() {
        let addr_err = "invalid:address".parse::<std::net::SocketAddr>().unwrap_err();
        let err: TorrentError = addr_err.into();
        assert!(matches!(err, TorrentError::Network { .. }));
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = TorrentError::connection_limit("1.2.3.4:5", 10).into();
        let typed = err.downcast_ref::<TorrentError>().unwrap();
        assert!(matches!(typed, TorrentError::ConnectionLimitExceeded { limit: 10, .. }));
    }
}
