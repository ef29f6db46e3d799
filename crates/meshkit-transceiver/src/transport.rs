//! The boundary to the platform discovery/session service.
//!
//! A [`Transport`] advertises the local node, browses for others, negotiates
//! sessions and moves bytes and files. It reports what happens through the
//! [`EventSink`] handed to it by the transceiver.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use meshkit_core::{DiscoveryInfo, EncryptionPreference, NodeIdentity, Result};
use tokio::sync::{mpsc, oneshot, watch};

/// Session state of one remote node, as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotConnected,
    Connecting,
    Connected,
}

/// Answer channel for an inbound invitation.
#[derive(Debug)]
pub struct InvitationResponder(oneshot::Sender<bool>);

impl InvitationResponder {
    pub fn new() -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    /// Accept or decline. The inviter sees a dropped responder as a decline.
    pub fn respond(self, accept: bool) {
        let _ = self.0.send(accept);
    }
}

/// Handles for an outbound resource upload.
#[derive(Debug)]
pub struct ResourceUpload {
    /// Fraction completed, in [0.0, 1.0].
    pub progress: watch::Receiver<f64>,
    /// Resolves once the upload succeeded or failed.
    pub completion: oneshot::Receiver<Result<()>>,
}

/// Raw platform callbacks, normalized into one enum.
#[derive(Debug)]
pub enum TransportEvent {
    PeerFound {
        identity: NodeIdentity,
        discovery_info: Option<DiscoveryInfo>,
    },
    PeerLost {
        identity: NodeIdentity,
    },
    SessionStateChanged {
        identity: NodeIdentity,
        state: SessionState,
    },
    DataReceived {
        identity: NodeIdentity,
        data: Bytes,
    },
    InvitationReceived {
        identity: NodeIdentity,
        context: Option<Bytes>,
        responder: InvitationResponder,
    },
    ResourceStarted {
        identity: NodeIdentity,
        name: String,
        progress: watch::Receiver<f64>,
    },
    ResourceFinished {
        identity: NodeIdentity,
        name: String,
        result: Result<PathBuf>,
    },
    AdvertisingFailed(String),
    BrowsingFailed(String),
}

/// Where a transport delivers its events.
///
/// Holds a weak sender: once the transceiver is gone, `emit` is a no-op and
/// returns `false`.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::WeakUnboundedSender<TransportEvent>,
}

impl EventSink {
    pub fn new(tx: &mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self { tx: tx.downgrade() }
    }

    pub fn emit(&self, event: TransportEvent) -> bool {
        match self.tx.upgrade() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.upgrade().is_none_or(|tx| tx.is_closed())
    }
}

/// Session security the platform is asked to negotiate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSecurity {
    pub encryption: EncryptionPreference,
    /// Identity material (certificate chain) presented to peers, if any.
    pub identity_path: Option<PathBuf>,
}

/// Platform discovery and session service.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Identity the platform advertises for the local node.
    fn local_identity(&self) -> NodeIdentity;

    /// Apply the session security settings. Called once, before `attach`.
    ///
    /// A platform that cannot honour [`EncryptionPreference::Required`] must
    /// refuse to advertise (fail `resume`) rather than open plain sessions.
    fn configure_security(&self, security: &SessionSecurity);

    /// Install the event sink. Called once, before `resume`.
    fn attach(&self, sink: EventSink);

    /// Start (or restart) advertising and browsing.
    async fn resume(&self, discovery_info: Option<DiscoveryInfo>) -> Result<()>;

    /// Stop advertising and browsing. Established sessions stay up.
    async fn stop(&self) -> Result<()>;

    /// Reliable delivery of one message to each listed peer.
    async fn send(&self, data: Bytes, peers: &[NodeIdentity]) -> Result<()>;

    /// Ask a discovered peer to join the session.
    ///
    /// Returns once the invitation is on its way; the outcome arrives as
    /// session state changes for that peer.
    async fn invite(&self, peer: &NodeIdentity, context: Option<Bytes>, timeout: Duration) -> Result<()>;

    /// Start uploading a local file under `name`.
    async fn send_resource(&self, path: &Path, name: &str, peer: &NodeIdentity) -> Result<ResourceUpload>;
}
