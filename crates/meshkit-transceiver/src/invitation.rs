//! Invitation policies and the bookkeeping for invitations in flight.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use meshkit_core::{EncryptionPreference, MeshError, Peer, Result};
use tokio::sync::oneshot;

use crate::transport::SessionSecurity;

/// Default timeout for invitations sent on discovery.
pub const DEFAULT_INVITATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Parameters for one outgoing invitation.
#[derive(Debug, Clone)]
pub struct InviteRequest {
    pub context: Option<Bytes>,
    pub timeout: Duration,
}

impl InviteRequest {
    pub fn new(timeout: Duration) -> Self {
        Self {
            context: None,
            timeout,
        }
    }

    pub fn with_context(mut self, context: impl Into<Bytes>) -> Self {
        self.context = Some(context.into());
        self
    }
}

pub type CustomInviter = Arc<dyn Fn(&Peer) -> Option<InviteRequest> + Send + Sync>;

/// Whether (and how) discovered peers are invited.
#[derive(Clone, Default)]
pub enum InvitationPolicy {
    /// Invite every discovered peer with the default timeout.
    #[default]
    Automatic,
    /// Ask the callback; `None` means "don't invite this one".
    Custom(CustomInviter),
    /// Never invite on discovery.
    Manual,
}

impl InvitationPolicy {
    pub fn custom<F>(inviter: F) -> Self
    where
        F: Fn(&Peer) -> Option<InviteRequest> + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(inviter))
    }

    /// The invitation to send for a freshly discovered peer, if any.
    pub fn request_for(&self, peer: &Peer, default_timeout: Duration) -> Option<InviteRequest> {
        match self {
            Self::Automatic => Some(InviteRequest::new(default_timeout)),
            Self::Custom(inviter) => inviter(peer),
            Self::Manual => None,
        }
    }
}

impl std::fmt::Debug for InvitationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Automatic => write!(f, "Automatic"),
            Self::Custom(_) => write!(f, "Custom(..)"),
            Self::Manual => write!(f, "Manual"),
        }
    }
}

pub type InvitationDecision = Arc<dyn Fn(Peer, Option<Bytes>) -> BoxFuture<'static, bool> + Send + Sync>;

/// Session security settings handed to the platform, plus the decision
/// handler for inbound invitations.
#[derive(Clone)]
pub struct SecurityPolicy {
    pub encryption: EncryptionPreference,
    /// Identity material (certificate chain) for the platform, if any.
    pub identity_path: Option<PathBuf>,
    pub invitation_handler: InvitationDecision,
}

impl SecurityPolicy {
    /// The part of the policy the transport negotiates.
    pub fn session_security(&self) -> SessionSecurity {
        SessionSecurity {
            encryption: self.encryption,
            identity_path: self.identity_path.clone(),
        }
    }

    /// Replace the inbound invitation handler.
    pub fn with_invitation_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Peer, Option<Bytes>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.invitation_handler = Arc::new(move |peer, context| Box::pin(handler(peer, context)));
        self
    }
}

impl Default for SecurityPolicy {
    /// Accept every invitation.
    fn default() -> Self {
        Self {
            encryption: EncryptionPreference::default(),
            identity_path: None,
            invitation_handler: Arc::new(|_, _| Box::pin(async { true })),
        }
    }
}

impl std::fmt::Debug for SecurityPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityPolicy")
            .field("encryption", &self.encryption)
            .field("identity_path", &self.identity_path)
            .finish_non_exhaustive()
    }
}

pub type InvitationReply = oneshot::Sender<Result<Peer>>;

struct Pending {
    seq: u64,
    reply: Option<InvitationReply>,
}

/// At most one outstanding invitation per peer id.
///
/// Timeouts and transport failures are reported with the sequence number
/// they belong to, so a stale report never resolves a newer invitation.
#[derive(Default)]
pub struct PendingInvitations {
    next_seq: u64,
    pending: HashMap<String, Pending>,
}

impl PendingInvitations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new invitation. An older one for the same peer is failed.
    pub fn insert(&mut self, peer_id: &str, reply: Option<InvitationReply>) -> u64 {
        self.next_seq += 1;
        let seq = self.next_seq;
        if let Some(old) = self.pending.insert(peer_id.to_string(), Pending { seq, reply })
            && let Some(reply) = old.reply
        {
            let _ = reply.send(Err(MeshError::InvitationFailed {
                peer: peer_id.to_string(),
                reason: "superseded by a newer invitation".into(),
            }));
        }
        seq
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.pending.contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Resolve whatever invitation is pending for the peer.
    pub fn resolve(&mut self, peer_id: &str, result: Result<Peer>) -> bool {
        match self.pending.remove(peer_id) {
            Some(pending) => {
                if let Some(reply) = pending.reply {
                    let _ = reply.send(result);
                }
                true
            }
            None => false,
        }
    }

    /// Resolve only if the pending invitation is still the one numbered `seq`.
    pub fn resolve_seq(&mut self, peer_id: &str, seq: u64, result: Result<Peer>) -> bool {
        if self.pending.get(peer_id).is_some_and(|p| p.seq == seq) {
            self.resolve(peer_id, result)
        } else {
            false
        }
    }

    /// Fail everything, e.g. on shutdown.
    pub fn fail_all(&mut self) {
        for (peer_id, pending) in self.pending.drain() {
            if let Some(reply) = pending.reply {
                let _ = reply.send(Err(MeshError::InvitationFailed {
                    peer: peer_id,
                    reason: "transceiver shut down".into(),
                }));
            }
        }
    }
}
