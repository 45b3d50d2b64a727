//! DHT peer lookup
//!
//! A bounded iterative `get_peers` search. It does not join the DHT: there is
//! no routing table and no incoming query handling. Starting from the
//! bootstrap routers, it keeps querying the closest unqueried nodes until the
//! deadline passes, enough peers are known, or nobody closer is left.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

use crate::dht::message::{generate_transaction_id, GetPeersQuery, GetPeersResponse, TransactionId};
use crate::dht::node::NodeId;
use crate::error::TorrentError;
use crate::peer::source::Discovery;
use crate::peer::state::SourceTag;

/// Well-known bootstrap routers
pub const DEFAULT_ROUTERS: &[&str] = &[
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.utorrent.com:6881",
];

/// Queries in flight per round
const ALPHA: usize = 8;
/// How long one round waits for answers
const ROUND_TIMEOUT: Duration = Duration::from_secs(2);
/// Stop once this many peers are known
const WANTED_PEERS: usize = 50;
/// Re-run the lookup this often
const LOOKUP_INTERVAL: Duration = Duration::from_secs(300);

pub struct DhtDiscovery {
    info_hash: [u8; 20],
    node_id: NodeId,
    routers: Vec<String>,
    timeout: Duration,
}

impl DhtDiscovery {
    pub fn new(info_hash: [u8; 20], timeout: Duration) -> Self {
        Self {
            info_hash,
            node_id: NodeId::random(),
            routers: DEFAULT_ROUTERS.iter().map(|r| r.to_string()).collect(),
            timeout,
        }
    }

    /// Replace the bootstrap routers
    pub fn with_routers(mut self, routers: Vec<String>) -> Self {
        self.routers = routers;
        self
    }

    async fn resolve_routers(&self) -> Vec<SocketAddr> {
        let mut addrs = Vec::new();
        for router in &self.routers {
            match tokio::net::lookup_host(router.as_str()).await {
                Ok(resolved) => addrs.extend(resolved.filter(SocketAddr::is_ipv4)),
                Err(e) => debug!("Failed to resolve DHT router {}: {}", router, e),
            }
        }
        addrs
    }

    /// Run one lookup; errors only if no node answered at all
    pub async fn lookup(&self) -> Result<Vec<SocketAddr>> {
        let deadline = Instant::now() + self.timeout;
        let routers = timeout_at(deadline, self.resolve_routers())
            .await
            .unwrap_or_default();
        if routers.is_empty() {
            return Err(TorrentError::network("No DHT bootstrap router could be resolved").into());
        }

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        // Routers have no known id, so they go first
        let mut pending: Vec<SocketAddr> = routers;
        let mut closest: BTreeMap<[u8; 20], SocketAddr> = BTreeMap::new();
        let mut queried: HashSet<SocketAddr> = HashSet::new();
        let mut peers: Vec<SocketAddr> = Vec::new();
        let mut responded = 0usize;
        let mut buf = vec![0u8; 2048];

        while Instant::now() < deadline && peers.len() < WANTED_PEERS {
            let mut round: Vec<SocketAddr> = pending.drain(..).filter(|a| !queried.contains(a)).collect();
            while round.len() < ALPHA {
                let Some((&distance, &addr)) = closest.iter().next() else {
                    break;
                };
                closest.remove(&distance);
                if !queried.contains(&addr) && !round.contains(&addr) {
                    round.push(addr);
                }
            }
            if round.is_empty() {
                break;
            }

            let mut in_flight: HashMap<TransactionId, SocketAddr> = HashMap::new();
            for addr in round {
                let query = GetPeersQuery {
                    transaction: generate_transaction_id(),
                    node_id: self.node_id,
                    info_hash: self.info_hash,
                };
                queried.insert(addr);
                match socket.send_to(&query.encode(), addr).await {
                    Ok(_) => {
                        in_flight.insert(query.transaction, addr);
                    }
                    Err(e) => trace!("DHT query to {} failed: {}", addr, e),
                }
            }

            let round_deadline = (Instant::now() + ROUND_TIMEOUT).min(deadline);
            while !in_flight.is_empty() {
                let (len, from) = match timeout_at(round_deadline, socket.recv_from(&mut buf)).await {
                    Ok(Ok(received)) => received,
                    Ok(Err(e)) => {
                        trace!("DHT receive failed: {}", e);
                        continue;
                    }
                    Err(_) => break,
                };
                let response = match GetPeersResponse::decode(&buf[..len]) {
                    Ok(response) => response,
                    Err(e) => {
                        trace!("Ignoring DHT datagram from {}: {}", from, e);
                        continue;
                    }
                };
                let Ok(transaction) = TransactionId::try_from(response.transaction.as_slice()) else {
                    continue;
                };
                if in_flight.get(&transaction) != Some(&from) {
                    continue;
                }
                in_flight.remove(&transaction);
                responded += 1;

                for peer in response.peers {
                    if !peers.contains(&peer) {
                        peers.push(peer);
                    }
                }
                for node in response.nodes {
                    if !queried.contains(&node.addr) {
                        closest.insert(node.id.distance(&self.info_hash), node.addr);
                    }
                }
            }
        }

        if responded == 0 {
            return Err(TorrentError::network("No DHT node responded").into());
        }
        debug!(
            "DHT lookup for {} finished: {} peers from {} nodes",
            hex::encode(self.info_hash),
            peers.len(),
            responded
        );
        Ok(peers)
    }
}

#[async_trait]
impl Discovery for DhtDiscovery {
    fn tag(&self) -> SourceTag {
        SourceTag::Dht
    }

    async fn discover(&self) -> Result<Vec<SocketAddr>> {
        self.lookup().await
    }

    fn interval(&self) -> Duration {
        LOOKUP_INTERVAL
    }
}
