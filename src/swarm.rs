//! Swarm controller
//!
//! Owns every wire session of a download: their coordinator-side records,
//! their task handles and the channel they report on. Also keeps the
//! bandwidth counters and the Active/Paused switch that gates new requests.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::TorrentError;
use crate::peer::session::{spawn_session, SessionEvent, SessionHandle, SessionParams, IDLE_TIMEOUT, KEEPALIVE_INTERVAL};
use crate::peer::{PeerCandidate, PeerConnection, PeerKey, SessionState};
use crate::protocol::Message;

/// Capacity of the session → coordinator channel
const EVENT_QUEUE: usize = 1024;
/// Window of the download speed average
const SPEED_WINDOW: Duration = Duration::from_secs(5);
/// How long shutdown waits for session tasks before aborting them
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Whether new requests may be issued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SwarmState {
    #[default]
    Active,
    Paused,
}

/// Settings shared by every session of a swarm
#[derive(Debug, Clone)]
pub struct SessionTemplate {
    pub info_hash: [u8; 20],
    pub local_peer_id: [u8; 20],
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl SessionTemplate {
    fn params(&self, key: PeerKey, candidate: &PeerCandidate) -> SessionParams {
        SessionParams {
            key,
            addr: candidate.addr,
            info_hash: self.info_hash,
            local_peer_id: self.local_peer_id,
            connect_timeout: self.connect_timeout,
            handshake_timeout: self.handshake_timeout,
            keepalive_interval: KEEPALIVE_INTERVAL,
            idle_timeout: IDLE_TIMEOUT,
        }
    }
}

/// Sliding-window byte rate
#[derive(Debug, Default)]
pub struct SpeedMeter {
    samples: VecDeque<(Instant, u64)>,
    window_bytes: u64,
}

impl SpeedMeter {
    pub fn record(&mut self, bytes: u64, now: Instant) {
        self.samples.push_back((now, bytes));
        self.window_bytes += bytes;
        self.expire(now);
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&(at, bytes)) = self.samples.front() {
            if now.saturating_duration_since(at) <= SPEED_WINDOW {
                break;
            }
            self.samples.pop_front();
            self.window_bytes -= bytes;
        }
    }

    /// Bytes per second over the window
    pub fn rate(&mut self, now: Instant) -> u64 {
        self.expire(now);
        self.window_bytes / SPEED_WINDOW.as_secs()
    }
}

pub struct SwarmController {
    connections: HashMap<PeerKey, PeerConnection>,
    handles: HashMap<PeerKey, SessionHandle>,
    max_connections: usize,
    next_key: u64,
    state: SwarmState,
    template: SessionTemplate,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: mpsc::Receiver<SessionEvent>,
    total_downloaded: u64,
    snapshot: u64,
    meter: SpeedMeter,
}

impl SwarmController {
    pub fn new(max_connections: usize, template: SessionTemplate) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        Self {
            connections: HashMap::new(),
            handles: HashMap::new(),
            max_connections,
            next_key: 1,
            state: SwarmState::Active,
            template,
            events_tx,
            events_rx,
            total_downloaded: 0,
            snapshot: 0,
            meter: SpeedMeter::default(),
        }
    }

    /// Start a session for a candidate
    ///
    /// Fails with `ConnectionLimitExceeded` at the ceiling or when the address
    /// is already connected.
    pub fn connect(&mut self, candidate: PeerCandidate) -> Result<PeerKey> {
        if self.connections.len() >= self.max_connections {
            return Err(TorrentError::connection_limit(candidate.addr.to_string(), self.max_connections).into());
        }
        if self.connections.values().any(|c| c.addr == candidate.addr) {
            return Err(TorrentError::connection_limit(candidate.addr.to_string(), self.max_connections)
                .with_context("already connected")
                .into());
        }

        let key = PeerKey(self.next_key);
        self.next_key += 1;
        let handle = spawn_session(self.template.params(key, &candidate), self.events_tx.clone());
        self.connections
            .insert(key, PeerConnection::new(key, candidate.addr, candidate.source));
        self.handles.insert(key, handle);
        debug!(
            "Connecting to {} peer {} as {} ({}/{})",
            candidate.source,
            candidate.addr,
            key,
            self.connections.len(),
            self.max_connections
        );
        Ok(key)
    }

    /// Next report from any session
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events_rx.recv().await
    }

    /// Stop issuing new requests; returns false if already paused
    pub fn pause(&mut self) -> bool {
        if self.state == SwarmState::Paused {
            return false;
        }
        self.state = SwarmState::Paused;
        info!("Swarm paused");
        true
    }

    /// Allow new requests again; returns false if already active
    pub fn resume(&mut self) -> bool {
        if self.state == SwarmState::Active {
            return false;
        }
        self.state = SwarmState::Active;
        info!("Swarm resumed");
        true
    }

    pub fn state(&self) -> SwarmState {
        self.state
    }

    pub fn is_paused(&self) -> bool {
        self.state == SwarmState::Paused
    }

    pub fn peer(&self, key: PeerKey) -> Option<&PeerConnection> {
        self.connections.get(&key)
    }

    pub fn peer_mut(&mut self, key: PeerKey) -> Option<&mut PeerConnection> {
        self.connections.get_mut(&key)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerConnection> {
        self.connections.values()
    }

    pub fn peer_keys(&self) -> Vec<PeerKey> {
        let mut keys: Vec<PeerKey> = self.connections.keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    /// Sessions past the handshake
    pub fn active_count(&self) -> usize {
        self.connections
            .values()
            .filter(|c| c.state == SessionState::Active)
            .count()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Account payload bytes received from a peer
    pub fn record_download(&mut self, key: PeerKey, bytes: u64) {
        if let Some(peer) = self.connections.get_mut(&key) {
            peer.downloaded += bytes;
        }
        self.total_downloaded += bytes;
        self.meter.record(bytes, Instant::now());
    }

    pub fn total_downloaded(&self) -> u64 {
        self.total_downloaded
    }

    pub fn bytes_since_snapshot(&self) -> u64 {
        self.total_downloaded - self.snapshot
    }

    pub fn reset_snapshot(&mut self) {
        self.snapshot = self.total_downloaded;
    }

    /// Bytes per second over the last few seconds
    pub fn download_speed(&mut self) -> u64 {
        self.meter.rate(Instant::now())
    }

    /// Queue a message for a peer; false when the session is gone
    pub fn send(&self, key: PeerKey, message: Message) -> bool {
        self.handles.get(&key).is_some_and(|h| h.send(message))
    }

    /// Ask a session to close; its record stays until it reports `Closed`
    pub fn close(&mut self, key: PeerKey) {
        if let Some(peer) = self.connections.get_mut(&key) {
            peer.transition(SessionState::Closing);
        }
        if let Some(handle) = self.handles.get(&key) {
            handle.close();
        }
    }

    pub fn close_all(&mut self) {
        for key in self.peer_keys() {
            self.close(key);
        }
    }

    /// Forget a session that has closed
    pub fn remove(&mut self, key: PeerKey) -> Option<PeerConnection> {
        self.handles.remove(&key);
        let mut peer = self.connections.remove(&key)?;
        peer.transition(SessionState::Closed);
        Some(peer)
    }

    /// Close every session and wait for the tasks to finish
    ///
    /// Returns the records of every session that was still known.
    pub async fn shutdown(&mut self) -> Vec<PeerConnection> {
        for handle in self.handles.values() {
            handle.close();
        }
        let handles: Vec<(PeerKey, SessionHandle)> = self.handles.drain().collect();
        info!("Shutting down {} sessions", handles.len());

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        for (key, mut handle) in handles {
            // Keep draining so no session blocks on a full queue
            let finished = loop {
                tokio::select! {
                    result = &mut handle.task => break result.is_ok(),
                    _ = self.events_rx.recv() => {}
                    _ = tokio::time::sleep_until(deadline) => {
                        handle.task.abort();
                        let _ = (&mut handle.task).await;
                        break false;
                    }
                }
            };
            if !finished {
                warn!("Session {} did not shut down cleanly", key);
            }
        }
        self.events_rx.close();
        while self.events_rx.try_recv().is_ok() {}

        self.connections
            .drain()
            .map(|(_, mut peer)| {
                peer.transition(SessionState::Closed);
                peer
            })
            .collect()
    }
}
