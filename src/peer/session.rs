//! Wire session
//!
//! One task per peer connection. The task owns the socket, performs the
//! handshake, then pumps frames in both directions: decoded messages go to
//! the coordinator as [`SessionEvent`]s, and [`SessionCommand`]s from the
//! coordinator are written to the peer. Every session ends with exactly one
//! [`SessionEvent::Closed`].

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::peer::state::PeerKey;
use crate::protocol::{self, Handshake, Message};

/// Keep-alives are sent when we have been quiet this long
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(90);

/// A peer silent for this long is dropped
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(180);

/// Everything a session needs to start
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub key: PeerKey,
    pub addr: SocketAddr,
    pub info_hash: [u8; 20],
    pub local_peer_id: [u8; 20],
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub keepalive_interval: Duration,
    pub idle_timeout: Duration,
}

/// Instructions from the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Send(Message),
    Close,
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    ConnectFailed(String),
    HandshakeFailed(String),
    Io(String),
    Protocol(String),
    IdleTimeout,
    /// The coordinator asked the session to close
    Requested,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::ConnectFailed(e) => write!(f, "connect failed: {}", e),
            CloseReason::HandshakeFailed(e) => write!(f, "handshake failed: {}", e),
            CloseReason::Io(e) => write!(f, "i/o error: {}", e),
            CloseReason::Protocol(e) => write!(f, "protocol error: {}", e),
            CloseReason::IdleTimeout => f.write_str("idle timeout"),
            CloseReason::Requested => f.write_str("closed locally"),
        }
    }
}

/// Reports from a session to the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected {
        key: PeerKey,
        peer_id: [u8; 20],
        supports_extensions: bool,
    },
    Message {
        key: PeerKey,
        message: Message,
    },
    Closed {
        key: PeerKey,
        reason: CloseReason,
    },
}

/// Coordinator-side handle of a running session
#[derive(Debug)]
pub struct SessionHandle {
    pub commands: mpsc::UnboundedSender<SessionCommand>,
    pub task: JoinHandle<()>,
}

impl SessionHandle {
    /// Queue a message; false when the session is already gone
    pub fn send(&self, message: Message) -> bool {
        self.commands.send(SessionCommand::Send(message)).is_ok()
    }

    pub fn close(&self) {
        let _ = self.commands.send(SessionCommand::Close);
    }
}

/// Start a session task for an outbound connection
pub fn spawn_session(params: SessionParams, events: mpsc::Sender<SessionEvent>) -> SessionHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        let key = params.key;
        let reason = run(params, rx, &events).await;
        let _ = events.send(SessionEvent::Closed { key, reason }).await;
    });
    SessionHandle { commands: tx, task }
}

/// Resolves once the coordinator asks us to close or drops the handle
async fn close_requested(commands: &mut mpsc::UnboundedReceiver<SessionCommand>) {
    loop {
        match commands.recv().await {
            Some(SessionCommand::Close) | None => return,
            Some(SessionCommand::Send(message)) => {
                trace!("Dropping {:?} queued before the session is active", message.message_id());
            }
        }
    }
}

async fn run(
    params: SessionParams,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    events: &mpsc::Sender<SessionEvent>,
) -> CloseReason {
    let addr = params.addr;

    // Connecting
    let stream = tokio::select! {
        result = timeout(params.connect_timeout, TcpStream::connect(addr)) => match result {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!("Failed to connect to {}: {}", addr, e);
                return CloseReason::ConnectFailed(e.to_string());
            }
            Err(_) => {
                debug!("Connection timeout to {}", addr);
                return CloseReason::ConnectFailed("connect timed out".to_string());
            }
        },
        _ = close_requested(&mut commands) => return CloseReason::Requested,
    };
    let mut stream = stream;

    // Handshaking
    let remote = tokio::select! {
        result = timeout(params.handshake_timeout, handshake(&mut stream, &params)) => match result {
            Ok(Ok(remote)) => remote,
            Ok(Err(e)) => return CloseReason::HandshakeFailed(e.to_string()),
            Err(_) => return CloseReason::HandshakeFailed("handshake timed out".to_string()),
        },
        _ = close_requested(&mut commands) => return CloseReason::Requested,
    };

    info!("Handshake complete with peer {}", addr);
    let connected = SessionEvent::Connected {
        key: params.key,
        peer_id: remote.peer_id,
        supports_extensions: remote.supports_extensions(),
    };
    if events.send(connected).await.is_err() {
        return CloseReason::Requested;
    }

    // Active
    let _ = stream.set_nodelay(true);
    let (reader, mut writer) = stream.into_split();
    let mut reader_task = tokio::spawn(read_loop(params.key, reader, events.clone(), params.idle_timeout));
    let mut reader_done = false;

    let mut keepalive = tokio::time::interval(params.keepalive_interval);
    keepalive.tick().await;

    let reason = loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(SessionCommand::Send(message)) => {
                    trace!("Sending {:?} to {}", message.message_id(), addr);
                    match timeout(params.idle_timeout, protocol::write_message(&mut writer, &message)).await {
                        Ok(Ok(())) => keepalive.reset(),
                        Ok(Err(e)) => break CloseReason::Io(e.to_string()),
                        Err(_) => break CloseReason::Io("write timed out".to_string()),
                    }
                }
                Some(SessionCommand::Close) | None => break CloseReason::Requested,
            },
            finished = &mut reader_task => {
                reader_done = true;
                break finished.unwrap_or_else(|e| CloseReason::Io(format!("reader task failed: {}", e)));
            }
            _ = keepalive.tick() => {
                if let Err(e) = protocol::write_message(&mut writer, &Message::KeepAlive).await {
                    break CloseReason::Io(e.to_string());
                }
            }
        }
    };

    // Closing
    if !reader_done {
        reader_task.abort();
        let _ = reader_task.await;
    }
    debug!("Session with {} closing: {}", addr, reason);
    reason
}

async fn handshake(stream: &mut TcpStream, params: &SessionParams) -> Result<Handshake> {
    let ours = Handshake::new(params.info_hash, params.local_peer_id);
    protocol::write_handshake(stream, &ours).await?;
    let theirs = protocol::read_handshake(stream).await?;
    theirs.validate(&params.info_hash)?;
    Ok(theirs)
}

async fn read_loop(
    key: PeerKey,
    mut reader: OwnedReadHalf,
    events: mpsc::Sender<SessionEvent>,
    idle: Duration,
) -> CloseReason {
    loop {
        let message = match timeout(idle, protocol::read_message(&mut reader)).await {
            Ok(Ok(message)) => message,
            Ok(Err(e)) => {
                let is_io = e.downcast_ref::<std::io::Error>().is_some();
                warn!("Read from peer {} failed: {}", key, e);
                return if is_io {
                    CloseReason::Io(e.to_string())
                } else {
                    CloseReason::Protocol(e.to_string())
                };
            }
            Err(_) => return CloseReason::IdleTimeout,
        };
        if message == Message::KeepAlive {
            continue;
        }
        if events.send(SessionEvent::Message { key, message }).await.is_err() {
            return CloseReason::Requested;
        }
    }
}
