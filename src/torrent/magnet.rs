//! Magnet link parser
//!
//! Extracts the info-hash, display name, trackers and direct peer hints
//! (`x.pe`) from `magnet:?` URIs.

use std::net::SocketAddr;

use anyhow::Result;
use data_encoding::BASE32;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::TorrentError;
use crate::torrent::info::HASH_LEN;

/// Parsed magnet link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {
    /// Info hash from the `xt=urn:btih:` parameter
    pub info_hash: [u8; HASH_LEN],
    /// Display name (dn parameter)
    pub display_name: Option<String>,
    /// Tracker URLs (tr parameters)
    pub trackers: Vec<String>,
    /// Peer addresses supplied by the link (x.pe parameters)
    pub peers: Vec<SocketAddr>,
}

impl MagnetLink {
    /// Parse a magnet link string
    ///
    /// # Example
    /// ```ignore
    /// let link = MagnetLink::parse("magnet:?xt=urn:btih:dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c&dn=Big+Buck+Bunny")?;
    /// ```
    pub fn parse(magnet_uri: &str) -> Result<MagnetLink> {
        let url = Url::parse(magnet_uri.trim()).map_err(|e| {
            TorrentError::malformed_with_detail("Invalid magnet URL format", e.to_string())
        })?;

        if url.scheme() != "magnet" {
            return Err(TorrentError::malformed_with_detail(
                "URL is not a magnet link",
                format!("scheme is '{}'", url.scheme()),
            )
            .into());
        }

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers: Vec<String> = Vec::new();
        let mut peers = Vec::new();

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    if let Some(hash) = Self::extract_info_hash(&value)? {
                        info_hash = Some(hash);
                    }
                }
                "dn" => display_name = Some(value.into_owned()),
                "tr" => {
                    if !trackers.iter().any(|t| t == value.as_ref()) {
                        trackers.push(value.into_owned());
                    }
                }
                "x.pe" => match value.parse::<SocketAddr>() {
                    Ok(addr) => peers.push(addr),
                    Err(_) => warn!("Ignoring unparsable x.pe peer: {}", value),
                },
                other => debug!("Ignoring magnet parameter: {}", other),
            }
        }

        let info_hash = info_hash.ok_or_else(|| {
            TorrentError::malformed("Magnet link must contain an info hash (xt=urn:btih:<hash>)")
        })?;

        info!(
            "Parsed magnet link: info_hash={}, name={}, trackers={}, peers={}",
            hex::encode(info_hash),
            display_name.as_deref().unwrap_or("(none)"),
            trackers.len(),
            peers.len()
        );

        Ok(MagnetLink {
            info_hash,
            display_name,
            trackers,
            peers,
        })
    }

    /// Extract info hash from an xt parameter value
    ///
    /// The hash is either 40 hex characters or 32 base32 characters.
    fn extract_info_hash(xt_value: &str) -> Result<Option<[u8; HASH_LEN]>> {
        let Some(hash_str) = xt_value.strip_prefix("urn:btih:") else {
            debug!("xt parameter is not a BitTorrent info hash: {}", xt_value);
            return Ok(None);
        };

        let bytes = match hash_str.len() {
            40 => hex::decode(hash_str).map_err(|e| {
                TorrentError::malformed_with_detail("Invalid hex info hash", e.to_string())
            })?,
            32 => BASE32
                .decode(hash_str.to_ascii_uppercase().as_bytes())
                .map_err(|e| {
                    TorrentError::malformed_with_detail("Invalid base32 info hash", e.to_string())
                })?,
            n => {
                return Err(TorrentError::malformed_with_detail(
                    "Info hash has invalid length",
                    format!("{} characters, expected 40 (hex) or 32 (base32)", n),
                )
                .into())
            }
        };

        let hash: [u8; HASH_LEN] = bytes
            .try_into()
            .map_err(|_| TorrentError::malformed("Info hash did not decode to 20 bytes"))?;
        Ok(Some(hash))
    }

    /// Check if a string looks like a magnet link
    pub fn is_magnet_link(input: &str) -> bool {
        input.trim_start().starts_with("magnet:")
    }
}
