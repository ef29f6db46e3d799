//! Canonical record of every peer the transceiver knows about.
//!
//! Discovery and session state are tracked independently: a peer can be
//! discovered without a session, discovered with a session, or (after its
//! advertisement disappears) session-connected only. Only the first two
//! states are "available" and show up in [`PeerRegistry::available_peers`].

use meshkit_core::{Peer, same_peer_list};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

/// Lifecycle state of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Advertising nearby, no session.
    Discovered,
    /// Advertising nearby with an established session.
    DiscoveredConnected,
    /// Session still up after the peer stopped advertising. Not available.
    ConnectedOnly,
}

impl PeerState {
    pub fn is_available(self) -> bool {
        !matches!(self, PeerState::ConnectedOnly)
    }

    pub fn is_connected(self) -> bool {
        !matches!(self, PeerState::Discovered)
    }
}

/// What `peer_found` did with the announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FoundOutcome {
    /// The peer became available.
    Added,
    /// Already available; name or discovery info may have been refreshed.
    Refreshed,
}

#[derive(Debug, Clone)]
struct Entry {
    peer: Peer,
    state: PeerState,
}

/// Insertion-ordered peer registry with change notification.
///
/// Written only from the transceiver's event loop; readers take snapshots or
/// subscribe to the `watch` channel, which only ticks when the available list
/// actually changes (full-state comparison, in order).
pub struct PeerRegistry {
    entries: Mutex<Vec<Entry>>,
    available_tx: watch::Sender<Vec<Peer>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        let (available_tx, _) = watch::channel(Vec::new());
        Self {
            entries: Mutex::new(Vec::new()),
            available_tx,
        }
    }

    /// Record a discovery announcement.
    ///
    /// Re-discovery refreshes the identity and discovery info but keeps the
    /// connection flag. A connected-only peer that reappears is moved to the
    /// end of the list.
    pub fn peer_found(&self, peer: Peer) -> (Peer, FoundOutcome) {
        let mut entries = self.entries.lock();
        let result = match entries.iter().position(|e| e.peer == peer) {
            Some(idx) if entries[idx].state.is_available() => {
                let connected = entries[idx].peer.is_connected();
                entries[idx].peer = peer.with_connected(connected);
                (entries[idx].peer.clone(), FoundOutcome::Refreshed)
            }
            Some(idx) => {
                let mut entry = entries.remove(idx);
                entry.peer = peer.with_connected(true);
                entry.state = PeerState::DiscoveredConnected;
                let stored = entry.peer.clone();
                entries.push(entry);
                (stored, FoundOutcome::Added)
            }
            None => {
                let stored = peer.with_connected(false);
                entries.push(Entry {
                    peer: stored.clone(),
                    state: PeerState::Discovered,
                });
                (stored, FoundOutcome::Added)
            }
        };
        self.notify(&entries);
        result
    }

    /// Record that a peer stopped advertising.
    ///
    /// Returns the peer if it was available. A peer with a live session is
    /// kept as connected-only; ending the session is the transport's call.
    pub fn peer_lost(&self, id: &str) -> Option<Peer> {
        let mut entries = self.entries.lock();
        let idx = entries.iter().position(|e| e.peer.id() == id)?;
        let removed = match entries[idx].state {
            PeerState::Discovered => Some(entries.remove(idx).peer),
            PeerState::DiscoveredConnected => {
                entries[idx].state = PeerState::ConnectedOnly;
                debug!(peer = %entries[idx].peer, "peer lost but session is still up");
                Some(entries[idx].peer.clone())
            }
            PeerState::ConnectedOnly => None,
        };
        self.notify(&entries);
        removed
    }

    /// Mark a session as established. Unknown peers become connected-only.
    pub fn peer_connected(&self, peer: Peer) -> Peer {
        let mut entries = self.entries.lock();
        let stored = match entries.iter_mut().find(|e| e.peer == peer) {
            Some(entry) => {
                entry.peer.set_connected(true);
                if entry.state == PeerState::Discovered {
                    entry.state = PeerState::DiscoveredConnected;
                }
                entry.peer.clone()
            }
            None => {
                let stored = peer.with_connected(true);
                entries.push(Entry {
                    peer: stored.clone(),
                    state: PeerState::ConnectedOnly,
                });
                stored
            }
        };
        self.notify(&entries);
        stored
    }

    /// Mark a session as ended. Connected-only peers are forgotten.
    pub fn peer_disconnected(&self, id: &str) -> Option<Peer> {
        let mut entries = self.entries.lock();
        let idx = entries.iter().position(|e| e.peer.id() == id)?;
        let peer = match entries[idx].state {
            PeerState::ConnectedOnly => entries.remove(idx).peer.with_connected(false),
            _ => {
                entries[idx].peer.set_connected(false);
                entries[idx].state = PeerState::Discovered;
                entries[idx].peer.clone()
            }
        };
        self.notify(&entries);
        Some(peer)
    }

    /// Snapshot of available peers, in discovery order.
    pub fn available_peers(&self) -> Vec<Peer> {
        self.available_tx.borrow().clone()
    }

    /// Every peer with a live session, available or not.
    pub fn connected_peers(&self) -> Vec<Peer> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.state.is_connected())
            .map(|e| e.peer.clone())
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Peer> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.peer.id() == id)
            .map(|e| e.peer.clone())
    }

    pub fn state(&self, id: &str) -> Option<PeerState> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.peer.id() == id)
            .map(|e| e.state)
    }

    /// Subscribe to changes of the available list.
    pub fn subscribe(&self) -> watch::Receiver<Vec<Peer>> {
        self.available_tx.subscribe()
    }

    fn notify(&self, entries: &[Entry]) {
        let available: Vec<Peer> = entries
            .iter()
            .filter(|e| e.state.is_available())
            .map(|e| e.peer.clone())
            .collect();
        self.available_tx.send_if_modified(|current| {
            if same_peer_list(current, &available) {
                false
            } else {
                *current = available;
                true
            }
        });
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshkit_core::{DiscoveryInfo, NodeIdentity};

    fn peer(name: &str) -> Peer {
        Peer::new(
            NodeIdentity {
                name: name.into(),
                uid: format!("uid-{name}"),
            },
            None,
        )
    }

    fn ids(peers: &[Peer]) -> Vec<String> {
        peers.iter().map(|p| p.name().to_string()).collect()
    }

    #[test]
    fn found_appends_in_order() {
        let registry = PeerRegistry::new();
        registry.peer_found(peer("a"));
        registry.peer_found(peer("b"));
        registry.peer_found(peer("c"));
        assert_eq!(ids(&registry.available_peers()), ["a", "b", "c"]);
    }

    #[test]
    fn duplicate_found_keeps_single_entry_and_position() {
        let registry = PeerRegistry::new();
        registry.peer_found(peer("a"));
        registry.peer_found(peer("b"));
        let (_, outcome) = registry.peer_found(peer("a"));
        assert_eq!(outcome, FoundOutcome::Refreshed);
        assert_eq!(ids(&registry.available_peers()), ["a", "b"]);
    }

    #[test]
    fn uniqueness_holds_under_found_lost_churn() {
        let registry = PeerRegistry::new();
        let names = ["a", "b", "c"];
        for round in 0..30 {
            let name = names[round % names.len()];
            if round % 4 == 3 {
                registry.peer_lost(peer(name).id());
            } else {
                registry.peer_found(peer(name));
            }
            if round % 5 == 0 {
                registry.peer_connected(peer(names[(round + 1) % 3]));
            }
            let available = registry.available_peers();
            let mut seen = std::collections::HashSet::new();
            assert!(available.iter().all(|p| seen.insert(p.id().to_string())));
        }
    }

    #[test]
    fn rediscovery_preserves_connection_and_refreshes_info() {
        let registry = PeerRegistry::new();
        registry.peer_found(peer("a"));
        registry.peer_connected(peer("a"));

        let mut info = DiscoveryInfo::new();
        info.insert("room".into(), "lab".into());
        let (stored, _) = registry.peer_found(peer("a").with_discovery_info(Some(info)));

        assert!(stored.is_connected());
        assert_eq!(stored.discovery_info().unwrap()["room"], "lab");
        assert_eq!(registry.state(stored.id()), Some(PeerState::DiscoveredConnected));
    }

    #[test]
    fn unchanged_rediscovery_does_not_notify() {
        let registry = PeerRegistry::new();
        let mut rx = registry.subscribe();
        registry.peer_found(peer("a"));
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        registry.peer_found(peer("a"));
        assert!(!rx.has_changed().unwrap());

        registry.peer_connected(peer("a"));
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        // Same connected peer announced again.
        registry.peer_found(peer("a"));
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn lost_while_connected_is_retained_as_connected_only() {
        let registry = PeerRegistry::new();
        registry.peer_found(peer("a"));
        registry.peer_connected(peer("a"));

        let lost = registry.peer_lost(peer("a").id());
        assert!(lost.is_some());
        assert!(registry.available_peers().is_empty());
        assert_eq!(registry.state(peer("a").id()), Some(PeerState::ConnectedOnly));
        assert_eq!(registry.connected_peers().len(), 1);

        // Disconnecting a connected-only peer drops it entirely.
        registry.peer_disconnected(peer("a").id());
        assert!(registry.get(peer("a").id()).is_none());
    }

    #[test]
    fn connected_only_peer_found_again_is_reappended() {
        let registry = PeerRegistry::new();
        registry.peer_found(peer("a"));
        registry.peer_found(peer("b"));
        registry.peer_connected(peer("a"));
        registry.peer_lost(peer("a").id());

        let (stored, outcome) = registry.peer_found(peer("a"));
        assert_eq!(outcome, FoundOutcome::Added);
        assert!(stored.is_connected());
        assert_eq!(ids(&registry.available_peers()), ["b", "a"]);
    }

    #[test]
    fn connect_for_unknown_peer_does_not_touch_available_list() {
        let registry = PeerRegistry::new();
        let mut rx = registry.subscribe();
        registry.peer_connected(peer("ghost"));
        assert!(!rx.has_changed().unwrap());
        assert_eq!(registry.state(peer("ghost").id()), Some(PeerState::ConnectedOnly));
        rx.borrow_and_update();
    }

    #[test]
    fn disconnect_flips_flag_in_place() {
        let registry = PeerRegistry::new();
        registry.peer_found(peer("a"));
        registry.peer_found(peer("b"));
        registry.peer_connected(peer("a"));
        assert!(registry.available_peers()[0].is_connected());

        registry.peer_disconnected(peer("a").id());
        let available = registry.available_peers();
        assert_eq!(ids(&available), ["a", "b"]);
        assert!(!available[0].is_connected());
        assert_eq!(registry.state(peer("a").id()), Some(PeerState::Discovered));
    }

    #[test]
    fn lost_unknown_peer_is_noop() {
        let registry = PeerRegistry::new();
        assert!(registry.peer_lost("nope").is_none());
        assert!(registry.peer_disconnected("nope").is_none());
    }
}
