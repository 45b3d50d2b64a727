//! Engine lifecycle events
//!
//! Every observable condition, fatal or not, is published on an [`EventBus`].
//! Subscribers receive events in emission order over their own channel.

use std::net::SocketAddr;
use std::time::SystemTime;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use crate::peer::SourceTag;

/// Something that happened inside the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Metadata is loaded and the swarm is initialised
    Ready {
        info_hash: [u8; 20],
        total_pieces: usize,
        finished_pieces: usize,
    },
    /// A piece passed hash verification and is persisted
    PieceVerified { index: u32, verified_at: SystemTime },
    /// A piece failed hash verification and will be downloaded again
    PieceCorrupt { index: u32 },
    HandshakeFailed { peer: SocketAddr, reason: String },
    PeerSourceDegraded { source: SourceTag, reason: String },
    RequestTimeout { peer: SocketAddr, piece: u32, offset: u32 },
    ConnectionLimitExceeded { peer: SocketAddr },
    /// A peer sent data we never asked for
    PeerMisbehaved { peer: SocketAddr, score: u32 },
    Paused,
    Resumed,
    /// Every piece is verified; emitted once per engine
    Done,
    /// The download cannot continue
    Fatal { message: String },
}

/// Fan-out of engine events to any number of subscribers
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<EngineEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber
    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        EventStream { rx }
    }

    /// Deliver an event to every live subscriber, dropping closed ones
    pub fn emit(&self, event: EngineEvent) {
        trace!("Event: {:?}", event);
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// End every subscription; streams drain what they hold and then end
    pub fn close(&self) {
        self.subscribers.lock().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

/// Receiving end of a subscription
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<EngineEvent>,
}

impl EventStream {
    /// Next event, or `None` once the engine has shut down
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        self.rx.recv().await
    }

    /// Next event if one is already queued
    pub fn try_recv(&mut self) -> Option<EngineEvent> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe();
        bus.emit(EngineEvent::PieceCorrupt { index: 1 });
        bus.emit(EngineEvent::Done);

        assert_eq!(stream.recv().await, Some(EngineEvent::PieceCorrupt { index: 1 }));
        assert_eq!(stream.recv().await, Some(EngineEvent::Done));
    }

    #[tokio::test]
    async fn test_close_ends_streams() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe();
        bus.emit(EngineEvent::Paused);
        bus.close();

        assert_eq!(stream.recv().await, Some(EngineEvent::Paused));
        assert_eq!(stream.recv().await, None);
    }

    #[test]
    fn test_dropped_subscriber_pruned() {
        let bus = EventBus::new();
        let stream = bus.subscribe();
        let _kept = bus.subscribe();
        drop(stream);
        bus.emit(EngineEvent::Resumed);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn test_try_recv_empty() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe();
        assert_eq!(stream.try_recv(), None);
        bus.emit(EngineEvent::Done);
        assert_eq!(stream.try_recv(), Some(EngineEvent::Done));
    }
}
