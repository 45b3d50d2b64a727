//! Peer source
//!
//! Merges every discovery mechanism into one feed of connection candidates.
//! Each [`Discovery`] runs on its own task; a failing one is reported as
//! degraded and retried later while the others keep producing.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::peer::state::{PeerCandidate, SourceTag};

/// First retry delay after a discovery round fails
const RETRY_MIN: Duration = Duration::from_secs(5);
/// Retry delays double up to this
const RETRY_MAX: Duration = Duration::from_secs(300);
/// Dedup entries are pruned once the table grows past this
const PRUNE_THRESHOLD: usize = 4096;

/// A periodic producer of peer addresses
#[async_trait]
pub trait Discovery: Send + Sync {
    fn tag(&self) -> SourceTag;

    /// Run one discovery round
    async fn discover(&self) -> Result<Vec<SocketAddr>>;

    /// Delay before the next round after a successful one
    fn interval(&self) -> Duration;
}

/// What the feed yields
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceItem {
    Candidate(PeerCandidate),
    Degraded { source: SourceTag, reason: String },
}

pub struct PeerSource {
    // Held so the feed stays open while no discovery is running
    tx: mpsc::UnboundedSender<SourceItem>,
    rx: mpsc::UnboundedReceiver<SourceItem>,
    seen: HashMap<SocketAddr, Instant>,
    dedup_window: Duration,
    tasks: Vec<JoinHandle<()>>,
    closed: bool,
}

impl PeerSource {
    /// Create a feed seeded once with manually supplied addresses
    pub fn new(manual: impl IntoIterator<Item = SocketAddr>, dedup_window: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let source = Self {
            tx,
            rx,
            seen: HashMap::new(),
            dedup_window,
            tasks: Vec::new(),
            closed: false,
        };
        source.add_manual(manual);
        source
    }

    /// Queue extra addresses as manual candidates
    pub fn add_manual(&self, addrs: impl IntoIterator<Item = SocketAddr>) {
        for addr in addrs {
            let _ = self
                .tx
                .send(SourceItem::Candidate(PeerCandidate::new(addr, SourceTag::Manual)));
        }
    }

    /// Start a discovery loop feeding this source
    pub fn add_discovery(&mut self, discovery: Box<dyn Discovery>) {
        if self.closed {
            return;
        }
        let tx = self.tx.clone();
        self.tasks.push(tokio::spawn(run_discovery(discovery, tx)));
    }

    /// Number of discovery loops started
    pub fn discovery_count(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for the next fresh candidate or degradation report
    ///
    /// Returns `None` only after [`close`](Self::close).
    pub async fn next(&mut self) -> Option<SourceItem> {
        if self.closed {
            return None;
        }
        loop {
            match self.rx.recv().await? {
                SourceItem::Candidate(candidate) => {
                    if self.is_fresh(candidate.addr, Instant::now()) {
                        return Some(SourceItem::Candidate(candidate));
                    }
                    trace!("Skipping recently seen peer {}", candidate.addr);
                }
                degraded => return Some(degraded),
            }
        }
    }

    fn is_fresh(&mut self, addr: SocketAddr, now: Instant) -> bool {
        if self.seen.len() > PRUNE_THRESHOLD {
            let window = self.dedup_window;
            self.seen.retain(|_, at| now.duration_since(*at) < window);
        }
        match self.seen.get(&addr) {
            Some(at) if now.duration_since(*at) < self.dedup_window => false,
            _ => {
                self.seen.insert(addr, now);
                true
            }
        }
    }

    /// Stop all discovery; the feed cannot be restarted
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.rx.close();
        debug!("Peer source closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for PeerSource {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn run_discovery(discovery: Box<dyn Discovery>, tx: mpsc::UnboundedSender<SourceItem>) {
    let tag = discovery.tag();
    let mut backoff = RETRY_MIN;
    loop {
        let delay = match discovery.discover().await {
            Ok(addrs) => {
                debug!("{} discovery found {} peers", tag, addrs.len());
                for addr in addrs {
                    if tx.send(SourceItem::Candidate(PeerCandidate::new(addr, tag))).is_err() {
                        return;
                    }
                }
                backoff = RETRY_MIN;
                discovery.interval()
            }
            Err(e) => {
                warn!("{} discovery failed: {}", tag, e);
                let item = SourceItem::Degraded {
                    source: tag,
                    reason: e.to_string(),
                };
                if tx.send(item).is_err() {
                    return;
                }
                let delay = backoff;
                backoff = (backoff * 2).min(RETRY_MAX);
                delay
            }
        };
        tokio::time::sleep(delay).await;
    }
}
