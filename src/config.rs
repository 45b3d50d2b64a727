//! Engine configuration
//!
//! Options recognised by [`TorrentEngine`](crate::engine::TorrentEngine).
//! Durations are expressed in milliseconds when loaded from JSON.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::TorrentError;

/// Configuration for a single download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Global connection ceiling
    pub max_connections: usize,
    /// Parent of the per-download buffer directory (cwd when unset)
    pub download_directory: Option<PathBuf>,
    /// Hash-check data already present in the buffer on load
    pub verify_existing: bool,
    /// DHT lookup budget; `None` disables DHT discovery
    #[serde(with = "option_millis")]
    pub dht_bootstrap_timeout: Option<Duration>,
    /// Announce to HTTP trackers
    pub use_trackers: bool,
    /// Keep pieces in memory only
    pub ephemeral: bool,
    /// Start with no file selected
    pub wait_for_selection: bool,
    /// Addresses fed once into the peer source
    pub manual_peers: Vec<SocketAddr>,
    /// Per-session outstanding request window
    pub pipeline_depth: usize,
    /// Age after which an unanswered request is abandoned
    #[serde(with = "millis")]
    pub request_timeout: Duration,
    /// Age before a requested block may also be requested from another peer
    #[serde(with = "millis")]
    pub endgame_grace: Duration,
    /// Unsolicited-block score that closes a session
    pub misbehavior_threshold: u32,
    /// Rolling window for candidate deduplication
    #[serde(with = "millis")]
    pub dedup_window: Duration,
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    #[serde(with = "millis")]
    pub handshake_timeout: Duration,
    /// Port reported to trackers
    pub listen_port: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            download_directory: None,
            verify_existing: true,
            dht_bootstrap_timeout: Some(Duration::from_secs(10)),
            use_trackers: true,
            ephemeral: false,
            wait_for_selection: false,
            manual_peers: Vec::new(),
            pipeline_depth: 16,
            request_timeout: Duration::from_secs(30),
            endgame_grace: Duration::from_secs(10),
            misbehavior_threshold: 8,
            dedup_window: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            listen_port: 6881,
        }
    }
}

impl EngineConfig {
    /// Load a configuration from a JSON file; missing keys take defaults
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            TorrentError::config(format!("Failed to read config file: {}", e), path.display().to_string())
        })?;
        let config: Self = serde_json::from_str(&text).map_err(TorrentError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(TorrentError::config("must be at least 1", "max_connections").into());
        }
        if self.pipeline_depth == 0 {
            return Err(TorrentError::config("must be at least 1", "pipeline_depth").into());
        }
        if self.misbehavior_threshold == 0 {
            return Err(TorrentError::config("must be at least 1", "misbehavior_threshold").into());
        }

        let timeouts = [
            ("request_timeout", self.request_timeout),
            ("endgame_grace", self.endgame_grace),
            ("dedup_window", self.dedup_window),
            ("connect_timeout", self.connect_timeout),
            ("handshake_timeout", self.handshake_timeout),
        ];
        if let Some((field, _)) = timeouts.iter().find(|(_, d)| d.is_zero()) {
            return Err(TorrentError::config("must be greater than zero", *field).into());
        }
        if self.dht_bootstrap_timeout.is_some_and(|d| d.is_zero()) {
            return Err(TorrentError::config(
                "must be greater than zero (use null to disable)",
                "dht_bootstrap_timeout",
            )
            .into());
        }

        if let Some(dir) = &self.download_directory {
            if dir.as_os_str().is_empty() {
                return Err(TorrentError::config("cannot be empty", "download_directory").into());
            }
        }

        Ok(())
    }

    /// Directory that holds this download's buffered pieces
    pub fn buffer_directory(&self, id: &str) -> PathBuf {
        self.download_directory
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(id)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod option_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_connections, 100);
        assert!(config.verify_existing);
        assert_eq!(config.dht_bootstrap_timeout, Some(Duration::from_secs(10)));
        assert!(config.use_trackers);
        assert!(!config.ephemeral);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_connections() {
        let config = EngineConfig {
            max_connections: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_connections"));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = EngineConfig {
            request_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            dht_bootstrap_timeout: Some(Duration::ZERO),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_directory() {
        let config = EngineConfig {
            download_directory: Some(PathBuf::new()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_buffer_directory() {
        let config = EngineConfig {
            download_directory: Some(PathBuf::from("/tmp/buffers")),
            ..Default::default()
        };
        assert_eq!(config.buffer_directory("abc"), PathBuf::from("/tmp/buffers/abc"));
        assert_eq!(EngineConfig::default().buffer_directory("abc"), PathBuf::from("./abc"));
    }

    #[test]
    fn test_json_partial_config() {
        let json = r#"{ "max_connections": 5, "dht_bootstrap_timeout": null,
                        "request_timeout": 1500, "manual_peers": ["127.0.0.1:6881"] }"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.dht_bootstrap_timeout, None);
        assert_eq!(config.request_timeout, Duration::from_millis(1500));
        assert_eq!(config.manual_peers.len(), 1);
        assert_eq!(config.pipeline_depth, 16);
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "ephemeral": true }}"#).unwrap();
        let config = EngineConfig::from_json_file(file.path()).unwrap();
        assert!(config.ephemeral);

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        write!(bad, r#"{{ "max_connections": 0 }}"#).unwrap();
        assert!(EngineConfig::from_json_file(bad.path()).is_err());
    }
}
