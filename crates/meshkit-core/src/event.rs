use serde::{Deserialize, Serialize};

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::types::Peer;

/// Peer lifecycle events, in the order the transport raised them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "peer", rename_all = "snake_case")]
pub enum PeerEvent {
    /// A new peer was added to the available peers.
    Found(Peer),
    /// A peer stopped advertising and was removed from the available peers.
    Lost(Peer),
    /// A session with the peer was established.
    Connected(Peer),
    /// An established session with the peer ended.
    Disconnected(Peer),
}

impl PeerEvent {
    pub fn peer(&self) -> &Peer {
        match self {
            PeerEvent::Found(p)
            | PeerEvent::Lost(p)
            | PeerEvent::Connected(p)
            | PeerEvent::Disconnected(p) => p,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PeerEvent::Found(_) => "found",
            PeerEvent::Lost(_) => "lost",
            PeerEvent::Connected(_) => "connected",
            PeerEvent::Disconnected(_) => "disconnected",
        }
    }
}

/// A broadcast-based bus for peer lifecycle events.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<PeerEvent>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn publish(&self, event: PeerEvent) {
        // Ignore send errors (no subscribers).
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(4096)
    }
}
