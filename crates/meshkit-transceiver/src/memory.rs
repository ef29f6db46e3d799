//! In-process transport: every node lives in one shared [`MemoryNetwork`].
//!
//! Nodes advertising the same service type discover each other on `resume`,
//! sessions are negotiated through real invitations, and resources are
//! written to the receiving node's download directory. Used for tests and
//! for running several transceivers in one process.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use meshkit_config::MeshConfig;
use meshkit_core::{DiscoveryInfo, EncryptionPreference, MeshError, NodeIdentity, Result};
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::identity::{FileIdentityStore, IdentityStore, fetch_or_create_local_identity};
use crate::transport::{
    EventSink, InvitationResponder, ResourceUpload, SessionSecurity, SessionState, Transport,
    TransportEvent,
};

/// Number of progress samples reported per in-memory resource transfer.
const RESOURCE_STEPS: u32 = 8;

struct Node {
    identity: NodeIdentity,
    service_type: String,
    download_dir: PathBuf,
    sink: Option<EventSink>,
    encryption: EncryptionPreference,
    advertising: bool,
    discovery_info: Option<DiscoveryInfo>,
    sessions: HashSet<String>,
}

impl Node {
    fn emit(&self, event: TransportEvent) {
        if let Some(sink) = &self.sink {
            sink.emit(event);
        }
    }

    fn sees(&self, other: &Node) -> bool {
        self.identity.uid != other.identity.uid
            && self.advertising
            && other.advertising
            && self.service_type == other.service_type
    }
}

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<String, Node>,
}

/// A shared in-process "radio". Cloning yields another handle to the same network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the network with downloads stored under the system temp directory.
    pub fn transport(&self, identity: NodeIdentity, service_type: impl Into<String>) -> Arc<MemoryTransport> {
        let download_dir = std::env::temp_dir()
            .join("meshkit-downloads")
            .join(&identity.uid);
        self.transport_with_download_dir(identity, service_type, download_dir)
    }

    pub fn transport_with_download_dir(
        &self,
        identity: NodeIdentity,
        service_type: impl Into<String>,
        download_dir: impl Into<PathBuf>,
    ) -> Arc<MemoryTransport> {
        let node = Node {
            identity: identity.clone(),
            service_type: service_type.into(),
            download_dir: download_dir.into(),
            sink: None,
            encryption: EncryptionPreference::default(),
            advertising: false,
            discovery_info: None,
            sessions: HashSet::new(),
        };
        if self
            .state
            .lock()
            .nodes
            .insert(identity.uid.clone(), node)
            .is_some()
        {
            warn!(name = %identity.name, "replaced an existing node with the same uid");
        }
        debug!(name = %identity.name, "node joined memory network");
        Arc::new(MemoryTransport {
            identity,
            state: Arc::clone(&self.state),
            bytes_sent: AtomicUsize::new(0),
        })
    }

    /// Join using the service, identity and download settings from a config.
    pub fn transport_from_config(&self, config: &MeshConfig) -> Result<Arc<MemoryTransport>> {
        let store = FileIdentityStore::new(&config.identity.store_path);
        self.transport_from_store(config, &store)
    }

    pub fn transport_from_store(
        &self,
        config: &MeshConfig,
        store: &dyn IdentityStore,
    ) -> Result<Arc<MemoryTransport>> {
        let identity = fetch_or_create_local_identity(&config.service.peer_name, store)?;
        Ok(self.transport_with_download_dir(
            identity,
            config.service.service_type.clone(),
            config.transfers.download_dir.clone(),
        ))
    }

    pub fn node_count(&self) -> usize {
        self.state.lock().nodes.len()
    }
}

/// One node's handle on a [`MemoryNetwork`]. Dropping it leaves the network.
pub struct MemoryTransport {
    identity: NodeIdentity,
    state: Arc<Mutex<NetworkState>>,
    bytes_sent: AtomicUsize,
}

impl MemoryTransport {
    /// Total message bytes handed to `send`, counted once per recipient.
    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Fail every session with `peer` as if the link dropped.
    pub fn disconnect(&self, peer: &NodeIdentity) {
        let mut state = self.state.lock();
        let mut linked = false;
        if let Some(me) = state.nodes.get_mut(&self.identity.uid) {
            linked = me.sessions.remove(&peer.uid);
        }
        if let Some(other) = state.nodes.get_mut(&peer.uid) {
            linked |= other.sessions.remove(&self.identity.uid);
        }
        if !linked {
            return;
        }
        if let Some(me) = state.nodes.get(&self.identity.uid) {
            me.emit(TransportEvent::SessionStateChanged {
                identity: peer.clone(),
                state: SessionState::NotConnected,
            });
        }
        if let Some(other) = state.nodes.get(&peer.uid) {
            other.emit(TransportEvent::SessionStateChanged {
                identity: self.identity.clone(),
                state: SessionState::NotConnected,
            });
        }
    }

    fn missing_self() -> MeshError {
        MeshError::Transport("node is no longer part of the memory network".into())
    }
}

/// Settle an invitation from `me` to `peer` once the invitee answered.
fn finish_invitation(state: &Mutex<NetworkState>, me: &NodeIdentity, peer: &NodeIdentity, accepted: bool) {
    let mut state = state.lock();
    let connected = state
        .nodes
        .get(&me.uid)
        .is_some_and(|n| n.sessions.contains(&peer.uid));
    if connected {
        return;
    }
    let both_present = state.nodes.contains_key(&me.uid) && state.nodes.contains_key(&peer.uid);

    if accepted && both_present {
        if let Some(inviter) = state.nodes.get_mut(&me.uid) {
            inviter.sessions.insert(peer.uid.clone());
        }
        if let Some(invitee) = state.nodes.get_mut(&peer.uid) {
            invitee.sessions.insert(me.uid.clone());
            invitee.emit(TransportEvent::SessionStateChanged {
                identity: me.clone(),
                state: SessionState::Connecting,
            });
            invitee.emit(TransportEvent::SessionStateChanged {
                identity: me.clone(),
                state: SessionState::Connected,
            });
        }
        if let Some(inviter) = state.nodes.get(&me.uid) {
            inviter.emit(TransportEvent::SessionStateChanged {
                identity: peer.clone(),
                state: SessionState::Connected,
            });
        }
        info!(from = %me.name, to = %peer.name, "memory session established");
    } else if let Some(inviter) = state.nodes.get(&me.uid) {
        debug!(from = %me.name, to = %peer.name, "invitation not accepted");
        inviter.emit(TransportEvent::SessionStateChanged {
            identity: peer.clone(),
            state: SessionState::NotConnected,
        });
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_identity(&self) -> NodeIdentity {
        self.identity.clone()
    }

    fn configure_security(&self, security: &SessionSecurity) {
        match security.encryption {
            EncryptionPreference::Required => {
                warn!(name = %self.identity.name, "memory transport cannot encrypt sessions, advertising will be refused")
            }
            EncryptionPreference::Optional => {
                debug!(name = %self.identity.name, "memory sessions are unencrypted")
            }
            EncryptionPreference::None => {}
        }
        if let Some(path) = &security.identity_path {
            warn!(path = %path.display(), "memory transport has no certificate identity, ignoring");
        }
        if let Some(me) = self.state.lock().nodes.get_mut(&self.identity.uid) {
            me.encryption = security.encryption;
        }
    }

    fn attach(&self, sink: EventSink) {
        if let Some(me) = self.state.lock().nodes.get_mut(&self.identity.uid) {
            me.sink = Some(sink);
        }
    }

    async fn resume(&self, discovery_info: Option<DiscoveryInfo>) -> Result<()> {
        let mut state = self.state.lock();
        let me = state
            .nodes
            .get_mut(&self.identity.uid)
            .ok_or_else(Self::missing_self)?;
        if me.encryption == EncryptionPreference::Required {
            error!(name = %self.identity.name, "refusing to advertise: encryption required");
            return Err(MeshError::AdvertisingFailed(
                "encryption is required but the memory transport has none".into(),
            ));
        }
        me.advertising = true;
        me.discovery_info = discovery_info;

        let state = &*state;
        let Some(me) = state.nodes.get(&self.identity.uid) else {
            return Err(Self::missing_self());
        };
        for other in state.nodes.values().filter(|n| me.sees(n)) {
            me.emit(TransportEvent::PeerFound {
                identity: other.identity.clone(),
                discovery_info: other.discovery_info.clone(),
            });
            other.emit(TransportEvent::PeerFound {
                identity: me.identity.clone(),
                discovery_info: me.discovery_info.clone(),
            });
        }
        debug!(name = %self.identity.name, "advertising and browsing");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut state = self.state.lock();
        let Some(me) = state.nodes.get(&self.identity.uid) else {
            return Err(Self::missing_self());
        };
        for other in state.nodes.values().filter(|n| me.sees(n)) {
            me.emit(TransportEvent::PeerLost {
                identity: other.identity.clone(),
            });
            other.emit(TransportEvent::PeerLost {
                identity: me.identity.clone(),
            });
        }
        if let Some(me) = state.nodes.get_mut(&self.identity.uid) {
            me.advertising = false;
        }
        debug!(name = %self.identity.name, "stopped advertising and browsing");
        Ok(())
    }

    async fn send(&self, data: Bytes, peers: &[NodeIdentity]) -> Result<()> {
        let state = self.state.lock();
        let me = state
            .nodes
            .get(&self.identity.uid)
            .ok_or_else(Self::missing_self)?;

        let unreachable: Vec<&str> = peers
            .iter()
            .filter(|p| !me.sessions.contains(&p.uid) || !state.nodes.contains_key(&p.uid))
            .map(|p| p.name.as_str())
            .collect();
        if !unreachable.is_empty() {
            return Err(MeshError::SendFailed(format!(
                "not connected to {}",
                unreachable.join(", ")
            )));
        }

        for peer in peers {
            if let Some(target) = state.nodes.get(&peer.uid) {
                target.emit(TransportEvent::DataReceived {
                    identity: self.identity.clone(),
                    data: data.clone(),
                });
                self.bytes_sent.fetch_add(data.len(), Ordering::Relaxed);
            }
        }
        Ok(())
    }

    async fn invite(&self, peer: &NodeIdentity, context: Option<Bytes>, timeout: Duration) -> Result<()> {
        let (responder, answer) = InvitationResponder::new();
        {
            let state = self.state.lock();
            let me = state
                .nodes
                .get(&self.identity.uid)
                .ok_or_else(Self::missing_self)?;
            if me.sessions.contains(&peer.uid) {
                return Ok(());
            }
            let target = state
                .nodes
                .get(&peer.uid)
                .filter(|n| n.advertising && n.service_type == me.service_type)
                .ok_or_else(|| MeshError::PeerNotFound(peer.name.clone()))?;

            me.emit(TransportEvent::SessionStateChanged {
                identity: peer.clone(),
                state: SessionState::Connecting,
            });
            target.emit(TransportEvent::InvitationReceived {
                identity: self.identity.clone(),
                context,
                responder,
            });
        }

        let state = Arc::clone(&self.state);
        let me = self.identity.clone();
        let peer = peer.clone();
        tokio::spawn(async move {
            let accepted = matches!(tokio::time::timeout(timeout, answer).await, Ok(Ok(true)));
            finish_invitation(&state, &me, &peer, accepted);
        });
        Ok(())
    }

    async fn send_resource(&self, path: &Path, name: &str, peer: &NodeIdentity) -> Result<ResourceUpload> {
        let connected = self
            .state
            .lock()
            .nodes
            .get(&self.identity.uid)
            .is_some_and(|me| me.sessions.contains(&peer.uid));
        if !connected {
            return Err(MeshError::SendFailed(format!("not connected to {}", peer.name)));
        }

        let contents = tokio::fs::read(path).await?;
        let (up_tx, up_rx) = watch::channel(0.0);
        let (down_tx, down_rx) = watch::channel(0.0);
        let (done_tx, done_rx) = oneshot::channel();

        let download_dir = {
            let state = self.state.lock();
            let target = state
                .nodes
                .get(&peer.uid)
                .ok_or_else(|| MeshError::PeerNotFound(peer.name.clone()))?;
            target.emit(TransportEvent::ResourceStarted {
                identity: self.identity.clone(),
                name: name.to_string(),
                progress: down_rx,
            });
            target.download_dir.clone()
        };

        let state = Arc::clone(&self.state);
        let me = self.identity.clone();
        let peer = peer.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            let linked = || {
                state
                    .lock()
                    .nodes
                    .get(&me.uid)
                    .is_some_and(|n| n.sessions.contains(&peer.uid))
            };
            let finish = |result: Result<PathBuf>| {
                if let Some(target) = state.lock().nodes.get(&peer.uid) {
                    target.emit(TransportEvent::ResourceFinished {
                        identity: me.clone(),
                        name: name.clone(),
                        result,
                    });
                }
            };

            for step in 1..=RESOURCE_STEPS {
                tokio::task::yield_now().await;
                if !linked() {
                    let reason = "session ended during transfer";
                    finish(Err(MeshError::Resource {
                        resource: name.clone(),
                        reason: reason.into(),
                    }));
                    let _ = done_tx.send(Err(MeshError::Resource {
                        resource: name.clone(),
                        reason: reason.into(),
                    }));
                    return;
                }
                let fraction = f64::from(step) / f64::from(RESOURCE_STEPS);
                up_tx.send_replace(fraction);
                down_tx.send_replace(fraction);
            }

            let target = download_dir.join(&name);
            let written = async {
                tokio::fs::create_dir_all(&download_dir).await?;
                tokio::fs::write(&target, &contents).await
            }
            .await;

            match written {
                Ok(()) => {
                    debug!(resource = %name, path = %target.display(), "resource delivered");
                    finish(Ok(target));
                    let _ = done_tx.send(Ok(()));
                }
                Err(e) => {
                    let reason = e.to_string();
                    finish(Err(MeshError::Io(e)));
                    let _ = done_tx.send(Err(MeshError::Resource {
                        resource: name.clone(),
                        reason,
                    }));
                }
            }
        });

        Ok(ResourceUpload {
            progress: up_rx,
            completion: done_rx,
        })
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        let Some(me) = state.nodes.remove(&self.identity.uid) else {
            return;
        };
        for other in state.nodes.values_mut() {
            if other.sessions.remove(&me.identity.uid) {
                other.emit(TransportEvent::SessionStateChanged {
                    identity: me.identity.clone(),
                    state: SessionState::NotConnected,
                });
            }
            if me.advertising && other.advertising && other.service_type == me.service_type {
                other.emit(TransportEvent::PeerLost {
                    identity: me.identity.clone(),
                });
            }
        }
        debug!(name = %me.identity.name, "node left memory network");
    }
}
