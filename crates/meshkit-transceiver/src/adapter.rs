//! Turns raw transport events into registry updates and peer events.
//!
//! Owned by the transceiver's event loop. Per remote node it runs the session
//! state machine (not-connected → connecting → connected → not-connected),
//! applies the invitation policy on discovery, answers inbound invitations
//! through the security policy, and resolves invitations in flight.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use meshkit_core::{EventBus, MeshError, NodeIdentity, Peer, PeerEvent, Result};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::invitation::{
    InvitationPolicy, InvitationReply, InviteRequest, PendingInvitations, SecurityPolicy,
};
use crate::registry::{FoundOutcome, PeerRegistry};
use crate::transport::{SessionState, Transport, TransportEvent};

/// Transport events the adapter does not consume itself.
#[derive(Debug)]
pub enum Routed {
    Data {
        peer: Peer,
        data: Bytes,
    },
    ResourceStarted {
        peer: Peer,
        name: String,
        progress: watch::Receiver<f64>,
    },
    ResourceFinished {
        peer: Peer,
        name: String,
        result: Result<PathBuf>,
    },
}

/// Results of invitation tasks, reported back to the event loop.
#[derive(Debug)]
pub enum AdapterUpdate {
    InviteFailed {
        peer_id: String,
        seq: u64,
        error: MeshError,
    },
    InviteTimedOut {
        peer_id: String,
        seq: u64,
    },
}

pub struct TransportAdapter {
    transport: Arc<dyn Transport>,
    registry: Arc<PeerRegistry>,
    events: EventBus,
    policy: InvitationPolicy,
    security: SecurityPolicy,
    default_timeout: Duration,
    sessions: HashMap<String, SessionState>,
    invitations: PendingInvitations,
    updates: mpsc::WeakUnboundedSender<AdapterUpdate>,
}

impl TransportAdapter {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<PeerRegistry>,
        events: EventBus,
        policy: InvitationPolicy,
        security: SecurityPolicy,
        default_timeout: Duration,
        updates: mpsc::WeakUnboundedSender<AdapterUpdate>,
    ) -> Self {
        Self {
            transport,
            registry,
            events,
            policy,
            security,
            default_timeout,
            sessions: HashMap::new(),
            invitations: PendingInvitations::new(),
            updates,
        }
    }

    /// Current session state for a peer id.
    pub fn session_state(&self, peer_id: &str) -> SessionState {
        self.sessions
            .get(peer_id)
            .copied()
            .unwrap_or(SessionState::NotConnected)
    }

    pub fn pending_invitations(&self) -> usize {
        self.invitations.len()
    }

    /// Apply one transport event. Data and resource events are handed back.
    pub fn handle_event(&mut self, event: TransportEvent) -> Option<Routed> {
        match event {
            TransportEvent::PeerFound {
                identity,
                discovery_info,
            } => {
                self.on_peer_found(Peer::new(identity, discovery_info));
                None
            }
            TransportEvent::PeerLost { identity } => {
                if let Some(peer) = self.registry.peer_lost(&identity.peer_id()) {
                    info!(peer = %peer, "peer lost");
                    self.events.publish(PeerEvent::Lost(peer));
                }
                None
            }
            TransportEvent::SessionStateChanged { identity, state } => {
                self.on_session_state(&identity, state);
                None
            }
            TransportEvent::DataReceived { identity, data } => Some(Routed::Data {
                peer: self.peer_for(&identity),
                data,
            }),
            TransportEvent::InvitationReceived {
                identity,
                context,
                responder,
            } => {
                let Some(peer) = self.registry.get(&identity.peer_id()) else {
                    warn!(name = %identity.name, "declining invitation from undiscovered peer");
                    responder.respond(false);
                    return None;
                };
                debug!(peer = %peer, "invitation received");
                let decide = (self.security.invitation_handler)(peer.clone(), context);
                tokio::spawn(async move {
                    let accept = decide.await;
                    debug!(peer = %peer, accept, "answered invitation");
                    responder.respond(accept);
                });
                None
            }
            TransportEvent::ResourceStarted {
                identity,
                name,
                progress,
            } => Some(Routed::ResourceStarted {
                peer: self.peer_for(&identity),
                name,
                progress,
            }),
            TransportEvent::ResourceFinished {
                identity,
                name,
                result,
            } => Some(Routed::ResourceFinished {
                peer: self.peer_for(&identity),
                name,
                result,
            }),
            TransportEvent::AdvertisingFailed(reason) => {
                error!(reason = %reason, "failed to start advertising");
                None
            }
            TransportEvent::BrowsingFailed(reason) => {
                error!(reason = %reason, "failed to start browsing for peers");
                None
            }
        }
    }

    /// Resolve an invitation task's report.
    pub fn handle_update(&mut self, update: AdapterUpdate) {
        match update {
            AdapterUpdate::InviteFailed {
                peer_id,
                seq,
                error,
            } => {
                warn!(peer = %peer_id, error = %error, "invitation could not be sent");
                self.invitations.resolve_seq(&peer_id, seq, Err(error));
            }
            AdapterUpdate::InviteTimedOut { peer_id, seq } => {
                let err = MeshError::InvitationTimedOut(peer_id.clone());
                if self.invitations.resolve_seq(&peer_id, seq, Err(err)) {
                    warn!(peer = %peer_id, "invitation timed out");
                }
            }
        }
    }

    /// Invite a peer. `reply` receives the connected peer or the failure.
    pub fn invite(&mut self, peer: Peer, request: InviteRequest, reply: Option<InvitationReply>) {
        if self.session_state(peer.id()) == SessionState::Connected {
            if let Some(reply) = reply {
                let _ = reply.send(Ok(self.registry.get(peer.id()).unwrap_or(peer)));
            }
            return;
        }

        let seq = self.invitations.insert(peer.id(), reply);
        debug!(peer = %peer, timeout = ?request.timeout, "inviting peer");

        let transport = Arc::clone(&self.transport);
        let updates = self.updates.clone();
        let identity = peer.identity().clone();
        let peer_id = peer.id().to_string();
        tokio::spawn(async move {
            let report = |update| {
                if let Some(tx) = updates.upgrade() {
                    let _ = tx.send(update);
                }
            };
            let sent = transport
                .invite(&identity, request.context, request.timeout)
                .await;
            drop(transport);
            if let Err(error) = sent {
                report(AdapterUpdate::InviteFailed {
                    peer_id,
                    seq,
                    error,
                });
                return;
            }
            tokio::time::sleep(request.timeout).await;
            report(AdapterUpdate::InviteTimedOut { peer_id, seq });
        });
    }

    /// Fail every invitation still in flight.
    pub fn shutdown(&mut self) {
        self.invitations.fail_all();
    }

    fn on_peer_found(&mut self, peer: Peer) {
        let (stored, outcome) = self.registry.peer_found(peer);
        if outcome == FoundOutcome::Added {
            info!(peer = %stored, "peer found");
            self.events.publish(PeerEvent::Found(stored.clone()));
        }

        if self.session_state(stored.id()) != SessionState::NotConnected
            || self.invitations.contains(stored.id())
        {
            return;
        }
        match self.policy.request_for(&stored, self.default_timeout) {
            Some(request) => self.invite(stored, request, None),
            None => debug!(peer = %stored, policy = ?self.policy, "not inviting discovered peer"),
        }
    }

    fn on_session_state(&mut self, identity: &NodeIdentity, state: SessionState) {
        let id = identity.peer_id();
        let previous = self.session_state(&id);

        match state {
            SessionState::Connecting => {
                if previous == SessionState::Connected {
                    debug!(name = %identity.name, "ignoring connecting state for connected peer");
                    return;
                }
                debug!(name = %identity.name, "connecting");
                self.sessions.insert(id, SessionState::Connecting);
            }
            SessionState::Connected => {
                if previous == SessionState::Connected {
                    return;
                }
                self.sessions.insert(id.clone(), SessionState::Connected);
                let peer = self.registry.peer_connected(self.peer_for(identity));
                self.invitations.resolve(&id, Ok(peer.clone()));
                info!(peer = %peer, "peer connected");
                self.events.publish(PeerEvent::Connected(peer));
            }
            SessionState::NotConnected => {
                self.sessions.remove(&id);
                self.invitations.resolve(
                    &id,
                    Err(MeshError::InvitationFailed {
                        peer: identity.name.clone(),
                        reason: "failed to connect to peer".into(),
                    }),
                );
                if previous != SessionState::Connected {
                    debug!(name = %identity.name, "connect attempt failed");
                    return;
                }
                if let Some(peer) = self.registry.peer_disconnected(&id) {
                    info!(peer = %peer, "peer disconnected");
                    self.events.publish(PeerEvent::Disconnected(peer));
                }
            }
        }
    }

    fn peer_for(&self, identity: &NodeIdentity) -> Peer {
        self.registry
            .get(&identity.peer_id())
            .unwrap_or_else(|| Peer::new(identity.clone(), None))
    }
}
