//! HTTP tracker discovery
//!
//! Announces to one HTTP(S) tracker and turns the response into peer
//! addresses. Compact and dictionary peer lists are both accepted.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_bencode::value::Value;
use tracing::{debug, trace};
use url::Url;

use crate::dht::node::parse_compact_peers;
use crate::error::TorrentError;
use crate::peer::source::Discovery;
use crate::peer::state::SourceTag;

/// Announce interval used until the tracker tells us otherwise
const DEFAULT_INTERVAL: Duration = Duration::from_secs(1800);
/// Never re-announce faster than this, whatever the tracker says
const MIN_INTERVAL: Duration = Duration::from_secs(60);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
struct AnnounceResponse {
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
    #[serde(default)]
    interval: Option<i64>,
    #[serde(default)]
    peers: Option<Value>,
}

/// Parsed announce result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announce {
    pub peers: Vec<SocketAddr>,
    pub interval: Option<Duration>,
}

pub struct TrackerDiscovery {
    announce: String,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    port: u16,
    /// Bytes still missing, shared with the coordinator
    left: Arc<AtomicU64>,
    interval_secs: AtomicU64,
    started: AtomicBool,
    client: reqwest::Client,
}

impl TrackerDiscovery {
    pub fn new(
        announce: impl Into<String>,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        port: u16,
        left: Arc<AtomicU64>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TorrentError::network(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            announce: announce.into(),
            info_hash,
            peer_id,
            port,
            left,
            interval_secs: AtomicU64::new(DEFAULT_INTERVAL.as_secs()),
            started: AtomicBool::new(false),
            client,
        })
    }

    pub fn announce_url(&self) -> &str {
        &self.announce
    }

    /// Build the full announce request URL
    pub fn request_url(&self, event: Option<&str>) -> Result<String> {
        let url = Url::parse(&self.announce).map_err(|e| {
            TorrentError::network_with_address(format!("Invalid tracker URL: {}", e), self.announce.clone())
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(TorrentError::network_with_address(
                format!("Unsupported tracker scheme '{}'", url.scheme()),
                self.announce.clone(),
            )
            .into());
        }

        let mut request = self.announce.clone();
        request.push(if request.contains('?') { '&' } else { '?' });
        request.push_str("info_hash=");
        request.push_str(&urlencoding::encode_binary(&self.info_hash));
        request.push_str("&peer_id=");
        request.push_str(&urlencoding::encode_binary(&self.peer_id));
        request.push_str(&format!(
            "&port={}&uploaded=0&downloaded=0&left={}&compact=1",
            self.port,
            self.left.load(Ordering::Relaxed)
        ));
        if let Some(event) = event {
            request.push_str("&event=");
            request.push_str(event);
        }
        Ok(request)
    }

    /// Parse a bencoded announce response
    pub fn parse_response(data: &[u8]) -> Result<Announce> {
        let response: AnnounceResponse = serde_bencode::from_bytes(data)
            .map_err(|e| TorrentError::protocol_with_detail("Invalid tracker response", e.to_string()))?;

        if let Some(reason) = response.failure_reason {
            return Err(TorrentError::protocol_with_detail("Tracker refused announce", reason).into());
        }

        let peers = match response.peers {
            None => Vec::new(),
            Some(Value::Bytes(compact)) => parse_compact_peers(&compact)?,
            Some(Value::List(entries)) => entries.iter().filter_map(dict_peer).collect(),
            Some(_) => return Err(TorrentError::protocol("Tracker peers field has unexpected type").into()),
        };

        let interval = response
            .interval
            .filter(|secs| *secs > 0)
            .map(|secs| Duration::from_secs(secs as u64));

        Ok(Announce { peers, interval })
    }
}

fn dict_peer(entry: &Value) -> Option<SocketAddr> {
    let Value::Dict(dict) = entry else {
        return None;
    };
    let ip = match dict.get(b"ip".as_slice())? {
        Value::Bytes(ip) => std::str::from_utf8(ip).ok()?.parse::<IpAddr>().ok()?,
        _ => return None,
    };
    let port = match dict.get(b"port".as_slice())? {
        Value::Int(port) => u16::try_from(*port).ok()?,
        _ => return None,
    };
    (port != 0).then(|| SocketAddr::new(ip, port))
}

#[async_trait]
impl Discovery for TrackerDiscovery {
    fn tag(&self) -> SourceTag {
        SourceTag::Tracker
    }

    async fn discover(&self) -> Result<Vec<SocketAddr>> {
        let event = (!self.started.load(Ordering::Relaxed)).then_some("started");
        let url = self.request_url(event)?;
        trace!("Announcing to {}", self.announce);

        let response = self.client.get(&url).send().await.map_err(|e| {
            TorrentError::network_with_address(format!("Tracker request failed: {}", e), self.announce.clone())
        })?;
        if !response.status().is_success() {
            return Err(TorrentError::network_with_address(
                format!("Tracker returned status {}", response.status()),
                self.announce.clone(),
            )
            .into());
        }
        let body = response.bytes().await.map_err(|e| {
            TorrentError::network_with_address(
                format!("Failed to read tracker response: {}", e),
                self.announce.clone(),
            )
        })?;

        let announce = Self::parse_response(&body)?;
        self.started.store(true, Ordering::Relaxed);
        if let Some(interval) = announce.interval {
            self.interval_secs
                .store(interval.max(MIN_INTERVAL).as_secs(), Ordering::Relaxed);
        }
        debug!("Tracker {} returned {} peers", self.announce, announce.peers.len());
        Ok(announce.peers)
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(url: &str) -> TrackerDiscovery {
        TrackerDiscovery::new(url, [0xAB; 20], *b"-TE0100-abcdefghijkl", 6881, Arc::new(AtomicU64::new(1234)))
            .unwrap()
    }

    #[test]
    fn test_request_url() {
        let t = tracker("http://tracker.example/announce");
        let url = t.request_url(Some("started")).unwrap();
        assert!(url.starts_with("http://tracker.example/announce?info_hash="));
        assert!(url.to_uppercase().contains(&"%AB".repeat(20)));
        assert!(url.contains("&peer_id=-TE0100-abcdefghijkl"));
        assert!(url.contains("&port=6881"));
        assert!(url.contains("&left=1234"));
        assert!(url.contains("&compact=1"));
        assert!(url.ends_with("&event=started"));

        let t = tracker("http://tracker.example/announce?passkey=x");
        assert!(t.request_url(None).unwrap().starts_with("http://tracker.example/announce?passkey=x&info_hash="));
    }

    #[test]
    fn test_unsupported_scheme() {
        let t = tracker("udp://tracker.example:1337/announce");
        let err = t.request_url(None).unwrap_err();
        assert!(err.to_string().contains("Unsupported tracker scheme"));
    }

    #[test]
    fn test_parse_compact_response() {
        let mut body = b"d8:intervali900e5:peers12:".to_vec();
        body.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1, 10, 0, 0, 1, 0x1A, 0xE2]);
        body.push(b'e');
        let announce = TrackerDiscovery::parse_response(&body).unwrap();
        assert_eq!(announce.interval, Some(Duration::from_secs(900)));
        assert_eq!(
            announce.peers,
            vec![
                "127.0.0.1:6881".parse::<SocketAddr>().unwrap(),
                "10.0.0.1:6882".parse::<SocketAddr>().unwrap()
            ]
        );
    }

    #[test]
    fn test_parse_dictionary_response() {
        let body = b"d8:completei3e5:peersld2:ip9:127.0.0.17:peer id20:aaaaaaaaaaaaaaaaaaaa4:porti6881eed2:ip3:bad4:porti1eeee";
        let announce = TrackerDiscovery::parse_response(body).unwrap();
        assert_eq!(announce.peers, vec!["127.0.0.1:6881".parse::<SocketAddr>().unwrap()]);
        assert_eq!(announce.interval, None);
    }

    #[test]
    fn test_failure_reason() {
        let err = TrackerDiscovery::parse_response(b"d14:failure reason12:unregisterede").unwrap_err();
        assert!(err.to_string().contains("unregistered"));
    }
}
