//! Engine facade
//!
//! [`TorrentEngine`] is the public face of one download. `load` parses the
//! descriptor and spawns a coordinator task that owns every piece of mutable
//! download state: the peer source, the swarm, the scheduler and the
//! verification store. The coordinator handles one session event, command or
//! timer tick at a time, so piece transitions never race.
//!
//! The facade talks to the coordinator over a command channel and reads
//! progress from a watch snapshot the coordinator republishes.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::config::EngineConfig;
use crate::dht::DhtDiscovery;
use crate::error::TorrentError;
use crate::events::{EngineEvent, EventBus, EventStream};
use crate::peer::session::CloseReason;
use crate::peer::{
    PeerConnection, PeerKey, PeerSource, RequestMatch, SessionEvent, SessionState, SourceItem, TrackerDiscovery,
};
use crate::protocol::extension::{EXTENDED_HANDSHAKE_ID, LOCAL_UT_METADATA_ID, METADATA_PIECE_SIZE};
use crate::protocol::{ExtendedHandshake, Handshake, Message, MetadataMessage};
use crate::scheduler::{BlockReceipt, PieceScheduler};
use crate::storage::{
    Bitfield, CompletedFile, FileBackend, MemoryBackend, PieceBackend, PieceOutcome, VerificationStore,
};
use crate::swarm::{SessionTemplate, SwarmController};
use crate::torrent::{Descriptor, MagnetLink, MetadataAssembler, MetadataParser, TorrentMetadata, TorrentSource};

/// Coordinator timer period
const TICK: Duration = Duration::from_secs(1);
/// Highest `Have` index kept before the piece count is known
const MAX_UNSIZED_PIECES: usize = 1 << 20;

/// Point-in-time view of a download
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub ready: bool,
    pub done: bool,
    pub paused: bool,
    pub finished_pieces: usize,
    pub total_pieces: usize,
    pub verified_bytes: u64,
    pub total_bytes: u64,
    /// Payload received since the last verified piece
    pub bytes_since_snapshot: u64,
    pub total_downloaded: u64,
    /// Bytes per second
    pub download_speed: u64,
    /// Sessions past the handshake
    pub peers: usize,
}

impl Progress {
    /// Verified pieces as a floored percentage
    pub fn percent_complete(&self) -> u8 {
        if self.total_pieces == 0 {
            return 0;
        }
        (self.finished_pieces * 100 / self.total_pieces) as u8
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.verified_bytes + self.bytes_since_snapshot
    }
}

enum Command {
    Pause(oneshot::Sender<()>),
    Resume(oneshot::Sender<()>),
    Select {
        file: usize,
        selected: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    SelectAll(oneshot::Sender<Result<()>>),
    CompletedFiles(oneshot::Sender<Vec<CompletedFile>>),
    Shutdown {
        purge: bool,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// One download
pub struct TorrentEngine {
    config: EngineConfig,
    events: Arc<EventBus>,
    id: Option<String>,
    commands: Option<mpsc::UnboundedSender<Command>>,
    progress: watch::Receiver<Progress>,
    coordinator: Option<JoinHandle<()>>,
}

impl TorrentEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let (_, progress) = watch::channel(Progress::default());
        Ok(Self {
            config,
            events: Arc::new(EventBus::new()),
            id: None,
            commands: None,
            progress,
            coordinator: None,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Subscribe to lifecycle events
    ///
    /// Subscribe before [`load`](Self::load) to observe `Ready`.
    pub fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }

    /// Parse a descriptor and start downloading it
    ///
    /// Malformed metadata and storage failures while checking existing data
    /// are returned as errors and also published as `Fatal`.
    pub async fn load(&mut self, source: TorrentSource) -> Result<()> {
        if self.commands.is_some() {
            return Err(TorrentError::engine("A torrent is already loaded").into());
        }

        let descriptor = match MetadataParser::parse(&source) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                self.events.emit(EngineEvent::Fatal { message: e.to_string() });
                return Err(e);
            }
        };

        let info_hash = descriptor.info_hash();
        let id = hex::encode(info_hash);
        info!("Loading torrent {}", id);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (progress_tx, progress_rx) = watch::channel(Progress::default());
        let mut coordinator = Coordinator::new(
            self.config.clone(),
            Arc::clone(&self.events),
            &descriptor,
            id.clone(),
            command_rx,
            progress_tx,
        );

        match descriptor {
            Descriptor::Complete(metadata) => {
                if let Err(e) = coordinator.start_download(metadata).await {
                    self.events.emit(EngineEvent::Fatal { message: e.to_string() });
                    coordinator.source.close();
                    return Err(e);
                }
            }
            Descriptor::Magnet(link) => {
                info!(
                    "Fetching metadata for {} from peers",
                    link.display_name.as_deref().unwrap_or(&id)
                );
            }
        }

        self.id = Some(id);
        self.progress = progress_rx;
        self.commands = Some(command_tx);
        self.coordinator = Some(tokio::spawn(coordinator.run()));
        Ok(())
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let commands = self
            .commands
            .as_ref()
            .ok_or_else(|| TorrentError::engine("No torrent loaded"))?;
        let (tx, rx) = oneshot::channel();
        commands
            .send(make(tx))
            .map_err(|_| TorrentError::engine("Engine has stopped"))?;
        rx.await
            .map_err(|_| TorrentError::engine("Engine has stopped").into())
    }

    /// Stop issuing new requests; connections stay open
    pub async fn pause(&self) -> Result<()> {
        self.request(Command::Pause).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.request(Command::Resume).await
    }

    /// Add a file to the selection
    pub async fn select_file(&self, file: usize) -> Result<()> {
        self.request(|reply| Command::Select {
            file,
            selected: true,
            reply,
        })
        .await?
    }

    /// Remove a file from the selection
    pub async fn deselect_file(&self, file: usize) -> Result<()> {
        self.request(|reply| Command::Select {
            file,
            selected: false,
            reply,
        })
        .await?
    }

    pub async fn select_all(&self) -> Result<()> {
        self.request(Command::SelectAll).await?
    }

    /// Files whose pieces are all verified
    pub async fn completed_files(&self) -> Result<Vec<CompletedFile>> {
        self.request(Command::CompletedFiles).await
    }

    pub fn progress(&self) -> Progress {
        *self.progress.borrow()
    }

    pub fn percent_complete(&self) -> u8 {
        self.progress().percent_complete()
    }

    /// Bytes per second
    pub fn download_speed(&self) -> u64 {
        self.progress().download_speed
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.progress().downloaded_bytes()
    }

    pub fn is_ready(&self) -> bool {
        self.progress().ready
    }

    pub fn is_done(&self) -> bool {
        self.progress().done
    }

    /// Lowercase hex info-hash, once a descriptor is loaded
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Close every session and stop the coordinator
    ///
    /// With `purge`, everything persisted for this download is removed. No
    /// piece is written after this returns.
    pub async fn shutdown(&mut self, purge: bool) -> Result<()> {
        let Some(commands) = self.commands.take() else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        let result = match commands.send(Command::Shutdown { purge, reply: tx }) {
            Ok(()) => rx.await.unwrap_or(Ok(())),
            Err(_) => Ok(()),
        };
        drop(commands);
        if let Some(task) = self.coordinator.take() {
            if let Err(e) = task.await {
                error!("Coordinator task failed: {}", e);
            }
        }
        result
    }
}

/// State of a download whose metadata is known
struct Download {
    metadata: Arc<TorrentMetadata>,
    scheduler: PieceScheduler,
    store: VerificationStore,
    selected: Vec<bool>,
}

enum Phase {
    /// Magnet download waiting for the info dictionary
    Metadata {
        link: MagnetLink,
        assembler: Option<MetadataAssembler>,
    },
    Downloading(Download),
}

struct Coordinator {
    config: EngineConfig,
    events: Arc<EventBus>,
    info_hash: [u8; 20],
    id: String,
    peer_id: [u8; 20],
    commands: mpsc::UnboundedReceiver<Command>,
    progress: watch::Sender<Progress>,
    swarm: SwarmController,
    source: PeerSource,
    /// Bytes still missing, as reported to trackers
    left: Arc<AtomicU64>,
    phase: Phase,
    /// Set by `pause()` and cleared only by `resume()`
    user_paused: bool,
    done: bool,
    /// Set after a fatal error; only commands are served
    stopped: bool,
}

impl Coordinator {
    fn new(
        config: EngineConfig,
        events: Arc<EventBus>,
        descriptor: &Descriptor,
        id: String,
        commands: mpsc::UnboundedReceiver<Command>,
        progress: watch::Sender<Progress>,
    ) -> Self {
        let info_hash = descriptor.info_hash();
        let peer_id = Handshake::generate_peer_id();
        let template = SessionTemplate {
            info_hash,
            local_peer_id: peer_id,
            connect_timeout: config.connect_timeout,
            handshake_timeout: config.handshake_timeout,
        };
        let swarm = SwarmController::new(config.max_connections, template);

        let (trackers, link_peers, left, phase): (Vec<String>, Vec<SocketAddr>, u64, Phase) = match descriptor {
            Descriptor::Complete(meta) => (
                meta.trackers.clone(),
                Vec::new(),
                meta.total_length(),
                // replaced by start_download before the coordinator runs
                Phase::Metadata {
                    link: MagnetLink {
                        info_hash,
                        display_name: Some(meta.name.clone()),
                        trackers: Vec::new(),
                        peers: Vec::new(),
                    },
                    assembler: None,
                },
            ),
            Descriptor::Magnet(link) => (
                link.trackers.clone(),
                link.peers.clone(),
                0,
                Phase::Metadata {
                    link: link.clone(),
                    assembler: None,
                },
            ),
        };

        let left = Arc::new(AtomicU64::new(left));
        let mut source = PeerSource::new(
            config.manual_peers.iter().copied().chain(link_peers),
            config.dedup_window,
        );
        if config.use_trackers {
            for tracker in &trackers {
                match TrackerDiscovery::new(tracker.clone(), info_hash, peer_id, config.listen_port, Arc::clone(&left)) {
                    Ok(discovery) => source.add_discovery(Box::new(discovery)),
                    Err(e) => warn!("Skipping tracker {}: {}", tracker, e),
                }
            }
        }
        if let Some(timeout) = config.dht_bootstrap_timeout {
            source.add_discovery(Box::new(DhtDiscovery::new(info_hash, timeout)));
        }
        debug!("Peer source started with {} discovery loops", source.discovery_count());

        Self {
            config,
            events,
            info_hash,
            id,
            peer_id,
            commands,
            progress,
            swarm,
            source,
            left,
            phase,
            user_paused: false,
            done: false,
            stopped: false,
        }
    }

    async fn run(mut self) {
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        trace!("Coordinator for {} running as peer {}", self.id, hex::encode(self.peer_id));

        loop {
            if self.stopped {
                match self.commands.recv().await {
                    Some(Command::Shutdown { purge, reply }) => {
                        let _ = reply.send(self.shutdown(purge).await);
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => break,
                }
                continue;
            }

            let result = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { purge, reply }) => {
                        let _ = reply.send(self.shutdown(purge).await);
                        break;
                    }
                    Some(command) => {
                        self.handle_command(command);
                        Ok(())
                    }
                    None => {
                        // the facade was dropped
                        let _ = self.shutdown(false).await;
                        break;
                    }
                },
                Some(event) = self.swarm.next_event() => self.handle_session_event(event).await,
                item = self.source.next(), if !self.source.is_closed() => {
                    if let Some(item) = item {
                        self.handle_source_item(item);
                    }
                    Ok(())
                }
                _ = tick.tick() => {
                    self.on_tick();
                    Ok(())
                }
            };

            if let Err(e) = result {
                self.fail(e).await;
            }
        }
        debug!("Coordinator for {} stopped", self.id);
    }

    async fn fail(&mut self, err: anyhow::Error) {
        error!("Download {} failed: {}", self.id, err);
        self.events.emit(EngineEvent::Fatal {
            message: err.to_string(),
        });
        self.stopped = true;
        self.source.close();
        self.swarm.shutdown().await;
        self.publish_progress();
    }

    /// Switch to downloading once the metadata is known
    async fn start_download(&mut self, metadata: TorrentMetadata) -> Result<()> {
        let metadata = Arc::new(metadata);
        let backend: Arc<dyn PieceBackend> = if self.config.ephemeral {
            Arc::new(MemoryBackend::new())
        } else {
            Arc::new(FileBackend::new(self.config.buffer_directory(&self.id), &metadata))
        };

        let mut store = VerificationStore::new(&metadata, backend, Arc::clone(&self.events));
        if self.config.verify_existing && !self.config.ephemeral {
            store.verify_existing().await?;
        }

        let mut scheduler = PieceScheduler::new(&metadata, self.config.endgame_grace);
        for index in store.bitfield().iter_set() {
            scheduler.mark_verified(index as u32);
        }

        let piece_count = metadata.piece_count();
        for key in self.swarm.peer_keys() {
            if let Some(peer) = self.swarm.peer_mut(key) {
                peer.bitfield.resize(piece_count);
                scheduler.add_availability(&peer.bitfield);
                peer.metadata_request = None;
            }
        }

        let selected = vec![!self.config.wait_for_selection; metadata.files.len()];
        let state = store.state();
        self.left
            .store(metadata.total_length() - state.verified_bytes, Ordering::Relaxed);
        info!(
            "Torrent {} ready: {} pieces, {} files, {}/{} already verified",
            metadata.name,
            piece_count,
            metadata.files.len(),
            state.finished_pieces,
            state.total_pieces
        );

        self.phase = Phase::Downloading(Download {
            metadata,
            scheduler,
            store,
            selected,
        });
        self.events.emit(EngineEvent::Ready {
            info_hash: self.info_hash,
            total_pieces: state.total_pieces,
            finished_pieces: state.finished_pieces,
        });
        self.apply_selection();
        self.check_done();

        for key in self.swarm.peer_keys() {
            self.send_local_state(key);
            self.update_interest(key);
            self.fill_requests(key);
        }
        self.publish_progress();
        Ok(())
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Pause(reply) => {
                self.user_paused = true;
                if self.swarm.pause() {
                    self.events.emit(EngineEvent::Paused);
                }
                self.publish_progress();
                let _ = reply.send(());
            }
            Command::Resume(reply) => {
                self.user_paused = false;
                if self.swarm.resume() {
                    self.events.emit(EngineEvent::Resumed);
                }
                self.fill_all();
                self.publish_progress();
                let _ = reply.send(());
            }
            Command::Select { file, selected, reply } => {
                let result = self.select(Some(file), selected);
                let _ = reply.send(result);
            }
            Command::SelectAll(reply) => {
                let _ = reply.send(self.select(None, true));
            }
            Command::CompletedFiles(reply) => {
                let _ = reply.send(self.completed_files());
            }
            Command::Shutdown { reply, .. } => {
                // handled by the run loop
                let _ = reply.send(Err(TorrentError::engine("Shutdown already in progress").into()));
            }
        }
    }

    fn select(&mut self, file: Option<usize>, selected: bool) -> Result<()> {
        let Phase::Downloading(download) = &mut self.phase else {
            return Err(TorrentError::engine("Metadata is not available yet").into());
        };
        match file {
            Some(index) => {
                let slot = download
                    .selected
                    .get_mut(index)
                    .ok_or_else(|| TorrentError::engine(format!("No file with index {}", index)))?;
                *slot = selected;
            }
            None => download.selected.iter_mut().for_each(|s| *s = selected),
        }
        self.apply_selection();
        Ok(())
    }

    /// Recompute wanted pieces and pause or resume to match
    ///
    /// An explicit `pause()` holds until `resume()`.
    fn apply_selection(&mut self) {
        let Phase::Downloading(download) = &mut self.phase else {
            return;
        };
        let meta = &download.metadata;
        for piece in 0..meta.piece_count() {
            download.scheduler.set_wanted(piece, false);
        }
        for (file, _) in download.selected.iter().enumerate().filter(|(_, s)| **s) {
            for piece in meta.pieces_for_file(file) {
                download.scheduler.set_wanted(piece, true);
            }
        }

        let nothing_wanted = download.scheduler.wanted_remaining() == 0 && !download.store.is_complete();
        if nothing_wanted {
            if self.swarm.pause() {
                self.events.emit(EngineEvent::Paused);
            }
        } else if !self.user_paused && self.swarm.resume() {
            self.events.emit(EngineEvent::Resumed);
        }

        for key in self.swarm.peer_keys() {
            self.update_interest(key);
        }
        self.fill_all();
        self.publish_progress();
    }

    fn completed_files(&self) -> Vec<CompletedFile> {
        let Phase::Downloading(download) = &self.phase else {
            return Vec::new();
        };
        let meta = &download.metadata;
        (0..meta.files.len())
            .filter(|&file| {
                meta.pieces_for_file(file)
                    .all(|piece| download.store.is_verified(piece as u32))
            })
            .filter_map(|file| CompletedFile::new(meta, file, download.store.backend()))
            .collect()
    }

    fn handle_source_item(&mut self, item: SourceItem) {
        match item {
            SourceItem::Candidate(candidate) => {
                if self.done {
                    return;
                }
                if let Err(e) = self.swarm.connect(candidate) {
                    if let Some(TorrentError::ConnectionLimitExceeded { .. }) = e.downcast_ref::<TorrentError>() {
                        debug!("Dropping candidate {}: {}", candidate.addr, e);
                        self.events.emit(EngineEvent::ConnectionLimitExceeded { peer: candidate.addr });
                    } else {
                        warn!("Failed to connect to {}: {}", candidate.addr, e);
                    }
                }
            }
            SourceItem::Degraded { source, reason } => {
                self.events.emit(EngineEvent::PeerSourceDegraded { source, reason });
            }
        }
    }

    async fn handle_session_event(&mut self, event: SessionEvent) -> Result<()> {
        match event {
            SessionEvent::Connected {
                key,
                peer_id,
                supports_extensions,
            } => {
                let Some(peer) = self.swarm.peer_mut(key) else {
                    return Ok(());
                };
                peer.transition(SessionState::Handshaking);
                peer.transition(SessionState::Active);
                peer.peer_id = Some(peer_id);
                peer.supports_extensions = supports_extensions;
                debug!("Peer {} ({}) active", peer.addr, key);

                if supports_extensions {
                    let size = match &self.phase {
                        Phase::Downloading(d) => Some(d.metadata.info_bytes.len()),
                        Phase::Metadata { .. } => None,
                    };
                    self.swarm.send(
                        key,
                        Message::Extended {
                            id: EXTENDED_HANDSHAKE_ID,
                            payload: ExtendedHandshake::local(size).encode(),
                        },
                    );
                }
                self.send_local_state(key);
                Ok(())
            }
            SessionEvent::Message { key, message } => {
                self.handle_message(key, message).await?;
                self.fill_requests(key);
                Ok(())
            }
            SessionEvent::Closed { key, reason } => {
                self.handle_closed(key, reason);
                Ok(())
            }
        }
    }

    fn handle_closed(&mut self, key: PeerKey, reason: CloseReason) {
        let Some(peer) = self.swarm.remove(key) else {
            return;
        };
        match &reason {
            CloseReason::HandshakeFailed(why) | CloseReason::ConnectFailed(why) => {
                debug!("Peer {} dropped: {}", peer.addr, reason);
                self.events.emit(EngineEvent::HandshakeFailed {
                    peer: peer.addr,
                    reason: why.clone(),
                });
            }
            _ => debug!("Peer {} disconnected: {}", peer.addr, reason),
        }

        match &mut self.phase {
            Phase::Downloading(download) => {
                download.scheduler.remove_availability(&peer.bitfield);
                download.scheduler.release_peer(key);
            }
            Phase::Metadata { assembler, .. } => {
                if let (Some(assembler), Some(piece)) = (assembler.as_mut(), peer.metadata_request) {
                    assembler.release(piece);
                }
            }
        }
        self.fill_all();
    }

    async fn handle_message(&mut self, key: PeerKey, message: Message) -> Result<()> {
        let Some(peer) = self.swarm.peer_mut(key) else {
            return Ok(());
        };
        if peer.state != SessionState::Active {
            return Ok(());
        }

        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                peer.peer_choking = true;
                let dropped = peer.take_outstanding();
                if let Phase::Downloading(download) = &mut self.phase {
                    for block in &dropped {
                        download.scheduler.abandon(block, key);
                    }
                }
                trace!("Peer {} choked us, {} requests dropped", key, dropped.len());
            }
            Message::Unchoke => {
                peer.peer_choking = false;
                trace!("Peer {} unchoked us", key);
            }
            Message::Interested => peer.peer_interested = true,
            Message::NotInterested => peer.peer_interested = false,
            Message::Have { piece_index } => match &mut self.phase {
                Phase::Downloading(download) => {
                    if piece_index as usize >= download.metadata.piece_count() {
                        self.misbehaved(key);
                        return Ok(());
                    }
                    if !peer.has_piece(piece_index as usize) {
                        peer.bitfield.set(piece_index as usize);
                        download.scheduler.record_have(piece_index);
                    }
                    self.update_interest(key);
                }
                Phase::Metadata { .. } if (piece_index as usize) < MAX_UNSIZED_PIECES => {
                    peer.bitfield.set(piece_index as usize)
                }
                Phase::Metadata { .. } => self.misbehaved(key),
            },
            Message::Bitfield { bitfield } => match &mut self.phase {
                Phase::Downloading(download) => {
                    match Bitfield::from_bytes(&bitfield, download.metadata.piece_count()) {
                        Ok(remote) => {
                            download.scheduler.remove_availability(&peer.bitfield);
                            download.scheduler.add_availability(&remote);
                            debug!("Peer {} has {}/{} pieces", key, remote.count(), remote.len());
                            peer.bitfield = remote;
                            self.update_interest(key);
                        }
                        Err(e) => {
                            warn!("Closing peer {}: {}", peer.addr, e);
                            self.swarm.close(key);
                        }
                    }
                }
                Phase::Metadata { .. } => peer.bitfield = Bitfield::from_bytes_unsized(&bitfield),
            },
            Message::Request { index, .. } => {
                // we never unchoke, so requests are not served
                trace!("Ignoring request for piece {} from {}", index, key);
            }
            Message::Piece { index, begin, block } => {
                self.handle_block(key, index, begin, block).await?;
            }
            Message::Cancel { .. } | Message::Port { .. } => {}
            Message::Extended { id, payload } => {
                self.handle_extended(key, id, payload).await?;
            }
        }
        Ok(())
    }

    async fn handle_block(&mut self, key: PeerKey, index: u32, begin: u32, block: Bytes) -> Result<()> {
        self.swarm.record_download(key, block.len() as u64);

        let Phase::Downloading(download) = &mut self.phase else {
            self.misbehaved(key);
            return Ok(());
        };
        let Some(request) = download.scheduler.block_at(index, begin, block.len() as u32) else {
            self.misbehaved(key);
            return Ok(());
        };
        let Some(peer) = self.swarm.peer_mut(key) else {
            return Ok(());
        };
        if download.scheduler.is_verified(index) && !peer.is_outstanding(&request) {
            trace!("Late block for verified piece {} from {}", index, key);
            return Ok(());
        }
        match peer.complete_request(&request) {
            RequestMatch::Expected => {}
            RequestMatch::Cancelled => trace!("Late block piece={} offset={} from {}", index, begin, key),
            RequestMatch::Unsolicited => {
                self.check_misbehavior(key);
                return Ok(());
            }
        }

        match download.scheduler.mark_received(&request, key) {
            BlockReceipt::Duplicate => return Ok(()),
            BlockReceipt::Accepted { cancel } => {
                for other in cancel {
                    if let Some(peer) = self.swarm.peer_mut(other) {
                        if peer.cancel_request(&request) {
                            self.swarm.send(
                                other,
                                Message::Cancel {
                                    index: request.piece,
                                    begin: request.offset,
                                    length: request.length,
                                },
                            );
                        }
                    }
                }
            }
        }

        let outcome = match download.store.submit_block(index, begin, block).await {
            Ok(outcome) => outcome,
            Err(e) if is_fatal(&e) => return Err(e),
            Err(e) => {
                warn!("Discarding block piece={} offset={} from {}: {}", index, begin, key, e);
                download.scheduler.reset_piece(index);
                return Ok(());
            }
        };

        match outcome {
            PieceOutcome::Incomplete => {}
            PieceOutcome::VerifiedOk => {
                download.scheduler.mark_verified(index);
                let state = download.store.state();
                self.left.store(
                    download.metadata.total_length() - state.verified_bytes,
                    Ordering::Relaxed,
                );
                self.swarm.reset_snapshot();
                for peer in self.swarm.peer_keys() {
                    if let Some(conn) = self.swarm.peer_mut(peer) {
                        conn.forget_piece(index);
                    }
                    self.swarm.send(peer, Message::Have { piece_index: index });
                    self.update_interest(peer);
                }
                self.check_done();
                self.publish_progress();
            }
            PieceOutcome::VerifiedFailed => {
                download.scheduler.reset_piece(index);
            }
        }
        Ok(())
    }

    async fn handle_extended(&mut self, key: PeerKey, id: u8, payload: Bytes) -> Result<()> {
        match id {
            EXTENDED_HANDSHAKE_ID => {
                let handshake = match ExtendedHandshake::decode(&payload) {
                    Ok(handshake) => handshake,
                    Err(e) => {
                        debug!("Bad extended handshake from {}: {}", key, e);
                        return Ok(());
                    }
                };
                let Some(peer) = self.swarm.peer_mut(key) else {
                    return Ok(());
                };
                peer.ut_metadata = handshake.ut_metadata;
                peer.metadata_size = handshake.metadata_size;
                trace!(
                    "Peer {} runs {:?}, ut_metadata={:?}",
                    key,
                    handshake.client,
                    handshake.ut_metadata
                );

                if let Phase::Metadata { assembler, .. } = &mut self.phase {
                    if assembler.is_none() {
                        if let Some(size) = handshake.metadata_size {
                            match MetadataAssembler::new(self.info_hash, size) {
                                Ok(created) => *assembler = Some(created),
                                Err(e) => debug!("Ignoring metadata size from {}: {}", key, e),
                            }
                        }
                    }
                }
                self.request_metadata(key);
            }
            LOCAL_UT_METADATA_ID => {
                let message = match MetadataMessage::decode(&payload) {
                    Ok(message) => message,
                    Err(e) => {
                        debug!("Bad ut_metadata message from {}: {}", key, e);
                        return Ok(());
                    }
                };
                self.handle_metadata_message(key, message).await?;
            }
            other => trace!("Ignoring extended message {} from {}", other, key),
        }
        Ok(())
    }

    async fn handle_metadata_message(&mut self, key: PeerKey, message: MetadataMessage) -> Result<()> {
        let Some(peer) = self.swarm.peer_mut(key) else {
            return Ok(());
        };
        match message {
            MetadataMessage::Request { piece } => {
                let Some(remote_id) = peer.ut_metadata else {
                    return Ok(());
                };
                let reply = match &self.phase {
                    Phase::Downloading(download) => {
                        let info = &download.metadata.info_bytes;
                        if piece < info.len().div_ceil(METADATA_PIECE_SIZE) {
                            let start = piece * METADATA_PIECE_SIZE;
                            let end = (start + METADATA_PIECE_SIZE).min(info.len());
                            MetadataMessage::Data {
                                piece,
                                total_size: info.len(),
                                data: Bytes::copy_from_slice(&info[start..end]),
                            }
                        } else {
                            MetadataMessage::Reject { piece }
                        }
                    }
                    Phase::Metadata { .. } => MetadataMessage::Reject { piece },
                };
                self.swarm.send(
                    key,
                    Message::Extended {
                        id: remote_id,
                        payload: reply.encode(),
                    },
                );
            }
            MetadataMessage::Reject { piece } => {
                peer.metadata_request = None;
                // stop asking a peer that refuses
                peer.ut_metadata = None;
                if let Phase::Metadata {
                    assembler: Some(assembler),
                    ..
                } = &mut self.phase
                {
                    assembler.release(piece);
                }
            }
            MetadataMessage::Data {
                piece,
                total_size,
                data,
            } => {
                peer.metadata_request = None;
                let Phase::Metadata {
                    link,
                    assembler: Some(assembler),
                } = &mut self.phase
                else {
                    return Ok(());
                };
                match assembler.receive(piece, total_size, &data) {
                    Ok(Some(info)) => {
                        let trackers = link.trackers.clone();
                        let metadata = MetadataParser::parse_info_dict(&info, Some(self.info_hash), trackers)?;
                        info!("Metadata for {} received from peers", metadata.name);
                        self.start_download(metadata).await?;
                    }
                    Ok(None) => self.request_metadata(key),
                    Err(e) => {
                        warn!("Metadata piece {} from {} rejected: {}", piece, key, e);
                        self.request_metadata(key);
                    }
                }
            }
        }
        Ok(())
    }

    /// Ask an idle `ut_metadata` peer for the next missing metadata piece
    fn request_metadata(&mut self, key: PeerKey) {
        let Phase::Metadata {
            assembler: Some(assembler),
            ..
        } = &mut self.phase
        else {
            return;
        };
        let Some(peer) = self.swarm.peer_mut(key) else {
            return;
        };
        let Some(remote_id) = peer.ut_metadata else {
            return;
        };
        if peer.metadata_request.is_some() {
            return;
        }
        let Some(piece) = assembler.next_request(Instant::now()) else {
            return;
        };
        peer.metadata_request = Some(piece);
        trace!("Requesting metadata piece {} from {}", piece, key);
        self.swarm.send(
            key,
            Message::Extended {
                id: remote_id,
                payload: MetadataMessage::Request { piece }.encode(),
            },
        );
    }

    /// Tell a new peer which pieces we already have
    fn send_local_state(&mut self, key: PeerKey) {
        let Phase::Downloading(download) = &self.phase else {
            return;
        };
        let ours = download.store.bitfield();
        if ours.count() > 0 {
            self.swarm.send(key, Message::Bitfield { bitfield: ours.to_bytes() });
        }
    }

    fn update_interest(&mut self, key: PeerKey) {
        let Phase::Downloading(download) = &self.phase else {
            return;
        };
        let Some(peer) = self.swarm.peer_mut(key) else {
            return;
        };
        if peer.state != SessionState::Active {
            return;
        }
        let interesting = download.scheduler.is_interesting(&peer.bitfield);
        if interesting != peer.am_interested {
            peer.am_interested = interesting;
            let message = if interesting {
                Message::Interested
            } else {
                Message::NotInterested
            };
            self.swarm.send(key, message);
        }
    }

    fn fill_requests(&mut self, key: PeerKey) {
        if self.swarm.is_paused() || self.done || self.stopped {
            return;
        }
        let Phase::Downloading(download) = &mut self.phase else {
            return;
        };
        let Some(peer) = self.swarm.peer(key) else {
            return;
        };
        let capacity = peer.request_capacity(self.config.pipeline_depth);
        if capacity == 0 {
            return;
        }
        let now = Instant::now();
        let requests = download.scheduler.next_requests(peer, capacity, now);
        for block in requests {
            if let Some(peer) = self.swarm.peer_mut(key) {
                peer.add_request(block, now);
            }
            self.swarm.send(
                key,
                Message::Request {
                    index: block.piece,
                    begin: block.offset,
                    length: block.length,
                },
            );
        }
    }

    fn fill_all(&mut self) {
        for key in self.swarm.peer_keys() {
            self.fill_requests(key);
        }
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        match &mut self.phase {
            Phase::Downloading(download) => {
                for key in self.swarm.peer_keys() {
                    let Some(peer) = self.swarm.peer_mut(key) else {
                        continue;
                    };
                    let addr = peer.addr;
                    let expired = peer.expired_requests(now, self.config.request_timeout);
                    for block in expired {
                        download.scheduler.abandon(&block, key);
                        debug!(
                            "Request piece={} offset={} to {} timed out",
                            block.piece, block.offset, addr
                        );
                        self.events.emit(EngineEvent::RequestTimeout {
                            peer: addr,
                            piece: block.piece,
                            offset: block.offset,
                        });
                        self.swarm.send(
                            key,
                            Message::Cancel {
                                index: block.piece,
                                begin: block.offset,
                                length: block.length,
                            },
                        );
                    }
                }
                self.fill_all();
            }
            Phase::Metadata { .. } => {
                for key in self.swarm.peer_keys() {
                    self.request_metadata(key);
                }
            }
        }
        self.publish_progress();
    }

    fn misbehaved(&mut self, key: PeerKey) {
        if let Some(peer) = self.swarm.peer_mut(key) {
            peer.record_misbehavior();
        }
        self.check_misbehavior(key);
    }

    /// Close a peer whose score crossed the threshold
    fn check_misbehavior(&mut self, key: PeerKey) {
        let Some(peer) = self.swarm.peer(key) else {
            return;
        };
        if peer.state != SessionState::Active || !peer.is_misbehaving(self.config.misbehavior_threshold) {
            return;
        }
        let (addr, score) = (peer.addr, peer.misbehavior());
        warn!("Closing misbehaving peer {} (score {})", addr, score);
        self.events.emit(EngineEvent::PeerMisbehaved { peer: addr, score });
        self.swarm.close(key);
    }

    fn check_done(&mut self) {
        let Phase::Downloading(download) = &self.phase else {
            return;
        };
        if self.done || !download.store.is_complete() {
            return;
        }
        self.done = true;
        info!("Download of {} complete", download.metadata.name);
        self.events.emit(EngineEvent::Done);
        // nothing left to fetch and we do not seed
        self.source.close();
        self.swarm.close_all();
    }

    fn publish_progress(&mut self) {
        let mut progress = Progress {
            done: self.done,
            paused: self.swarm.is_paused(),
            bytes_since_snapshot: self.swarm.bytes_since_snapshot(),
            total_downloaded: self.swarm.total_downloaded(),
            download_speed: self.swarm.download_speed(),
            peers: self.swarm.active_count(),
            ..Default::default()
        };
        if let Phase::Downloading(download) = &self.phase {
            let state = download.store.state();
            progress.ready = true;
            progress.finished_pieces = state.finished_pieces;
            progress.total_pieces = state.total_pieces;
            progress.verified_bytes = state.verified_bytes;
            progress.total_bytes = download.metadata.total_length();
        }
        self.progress.send_replace(progress);
    }

    async fn shutdown(&mut self, purge: bool) -> Result<()> {
        info!("Shutting down download {}", self.id);
        self.source.close();
        let peers: Vec<PeerConnection> = self.swarm.shutdown().await;
        if let Phase::Downloading(download) = &mut self.phase {
            for peer in &peers {
                download.scheduler.release_peer(peer.key);
            }
        }

        let result = if purge {
            self.purge().await
        } else {
            Ok(())
        };
        self.publish_progress();
        self.events.close();
        result
    }

    async fn purge(&mut self) -> Result<()> {
        match &self.phase {
            Phase::Downloading(download) => download.store.backend().purge().await,
            Phase::Metadata { .. } if !self.config.ephemeral => {
                let dir = self.config.buffer_directory(&self.id);
                match tokio::fs::remove_dir_all(&dir).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(TorrentError::storage_with_path(
                        format!("Failed to purge buffer directory: {}", e),
                        dir.display().to_string(),
                    )
                    .into()),
                }
            }
            Phase::Metadata { .. } => Ok(()),
        }
    }
}

fn is_fatal(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<TorrentError>() {
        Some(e) => e.is_fatal(),
        // raw I/O errors only come from the backend
        None => err.downcast_ref::<std::io::Error>().is_some(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::parser::tests::build_metainfo;

    fn config() -> EngineConfig {
        EngineConfig {
            ephemeral: true,
            use_trackers: false,
            dht_bootstrap_timeout: None,
            ..Default::default()
        }
    }

    #[test]
    fn test_progress_formulas() {
        let progress = Progress {
            finished_pieces: 2,
            total_pieces: 3,
            verified_bytes: 32768,
            bytes_since_snapshot: 100,
            ..Default::default()
        };
        assert_eq!(progress.percent_complete(), 66);
        assert_eq!(progress.downloaded_bytes(), 32868);
        assert_eq!(Progress::default().percent_complete(), 0);
    }

    #[tokio::test]
    async fn test_malformed_metadata_is_fatal() {
        let mut engine = TorrentEngine::new(config()).unwrap();
        let mut events = engine.subscribe();
        let err = engine
            .load(TorrentSource::Metainfo(b"not bencode".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TorrentError>(),
            Some(TorrentError::MalformedMetadata { .. })
        ));
        assert!(matches!(events.try_recv(), Some(EngineEvent::Fatal { .. })));
        assert!(engine.id().is_none());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = EngineConfig {
            max_connections: 0,
            ..Default::default()
        };
        assert!(TorrentEngine::new(config).is_err());
    }

    #[tokio::test]
    async fn test_ready_without_peers() {
        let content = vec![7u8; 40_000];
        let mut engine = TorrentEngine::new(config()).unwrap();
        let mut events = engine.subscribe();
        engine
            .load(TorrentSource::Metainfo(build_metainfo("a.bin", &content, 16384)))
            .await
            .unwrap();

        match events.recv().await {
            Some(EngineEvent::Ready {
                total_pieces,
                finished_pieces,
                ..
            }) => {
                assert_eq!(total_pieces, 3);
                assert_eq!(finished_pieces, 0);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(engine.id().map(str::len), Some(40));
        assert!(engine.load(TorrentSource::Metainfo(Vec::new())).await.is_err());

        assert!(engine.select_file(3).await.is_err());
        engine.deselect_file(0).await.unwrap();
        assert_eq!(events.recv().await, Some(EngineEvent::Paused));
        engine.select_all().await.unwrap();
        assert_eq!(events.recv().await, Some(EngineEvent::Resumed));
        assert!(engine.completed_files().await.unwrap().is_empty());

        engine.shutdown(false).await.unwrap();
        // the bus is closed at shutdown
        assert_eq!(events.recv().await, None);
        assert!(engine.pause().await.is_err());
    }

    #[tokio::test]
    async fn test_commands_before_load_fail() {
        let mut engine = TorrentEngine::new(config()).unwrap();
        assert!(engine.pause().await.is_err());
        assert!(!engine.is_ready());
        assert_eq!(engine.percent_complete(), 0);
        engine.shutdown(true).await.unwrap();
    }
}
