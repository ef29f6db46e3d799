//! The application-facing transceiver.
//!
//! A [`Transceiver`] owns one transport and a background event loop. The
//! loop is the only place that mutates peer and session state: transport
//! events, invitation results and application commands are all funnelled
//! into it, so peer events are published in exactly the order the
//! transport reported them. Dropping the transceiver ends the loop.

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use meshkit_config::{InvitationMode, MeshConfig};
use meshkit_core::{DiscoveryInfo, EventBus, MeshError, Peer, PeerEvent, Result};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::adapter::{AdapterUpdate, Routed, TransportAdapter};
use crate::codec::{DispatchTable, Message};
use crate::invitation::{
    DEFAULT_INVITATION_TIMEOUT, InvitationPolicy, InvitationReply, InviteRequest, SecurityPolicy,
};
use crate::registry::{PeerRegistry, PeerState};
use crate::resource::{
    IncomingResources, ProgressStream, ResourceCoordinator, ResourceLocation, TransferInfo,
    resource_name, run_upload,
};
use crate::transport::{EventSink, Transport, TransportEvent};

/// Capacity of the peer event broadcast channel.
const PEER_EVENT_CAPACITY: usize = 4096;

/// Behaviour knobs for a [`Transceiver`].
#[derive(Debug, Clone)]
pub struct TransceiverConfig {
    /// Advertised alongside the local peer.
    pub discovery_info: Option<DiscoveryInfo>,
    pub invitation: InvitationPolicy,
    /// Timeout for invitations sent on discovery.
    pub invitation_timeout: Duration,
    pub security: SecurityPolicy,
}

impl Default for TransceiverConfig {
    fn default() -> Self {
        Self {
            discovery_info: None,
            invitation: InvitationPolicy::Automatic,
            invitation_timeout: DEFAULT_INVITATION_TIMEOUT,
            security: SecurityPolicy::default(),
        }
    }
}

impl TransceiverConfig {
    /// Build from a loaded [`MeshConfig`].
    ///
    /// `custom` mode needs a callback, which a config file cannot carry; it
    /// maps to [`InvitationPolicy::Manual`] until one is set with
    /// [`TransceiverConfig::with_invitation`].
    pub fn from_config(config: &MeshConfig) -> Self {
        let invitation = match config.invitation.mode {
            InvitationMode::Automatic => InvitationPolicy::Automatic,
            InvitationMode::Manual => InvitationPolicy::Manual,
            InvitationMode::Custom => {
                debug!("custom invitation mode selected, waiting for an inviter callback");
                InvitationPolicy::Manual
            }
        };
        let discovery_info =
            (!config.service.discovery_info.is_empty()).then(|| config.service.discovery_info.clone());
        let security = SecurityPolicy {
            encryption: config.security.encryption,
            identity_path: config.security.identity_path.clone(),
            ..SecurityPolicy::default()
        };

        Self {
            discovery_info,
            invitation,
            invitation_timeout: Duration::from_secs(config.invitation.timeout_secs),
            security,
        }
    }

    pub fn with_invitation(mut self, policy: InvitationPolicy) -> Self {
        self.invitation = policy;
        self
    }

    pub fn with_security(mut self, security: SecurityPolicy) -> Self {
        self.security = security;
        self
    }

    pub fn with_discovery_info(mut self, info: DiscoveryInfo) -> Self {
        self.discovery_info = Some(info);
        self
    }

    pub fn with_invitation_timeout(mut self, timeout: Duration) -> Self {
        self.invitation_timeout = timeout;
        self
    }
}

/// Work the facade hands to the event loop.
enum Command {
    Invite {
        peer: Peer,
        request: InviteRequest,
        reply: InvitationReply,
    },
    SendResource {
        path: PathBuf,
        name: String,
        peer: Peer,
        progress: mpsc::UnboundedSender<Result<f64>>,
    },
    ReleaseTransfer {
        name: String,
        id: u64,
    },
}

/// State shared between the facade and the event loop.
struct Shared {
    transport: Arc<dyn Transport>,
    registry: Arc<PeerRegistry>,
    dispatch: DispatchTable,
    resources: ResourceCoordinator,
    events: EventBus,
}

/// Typed messages of one type, with the peer that sent each.
pub struct MessageStream<T> {
    rx: mpsc::UnboundedReceiver<(T, Peer)>,
}

impl<T> Stream for MessageStream<T> {
    type Item = (T, Peer);

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Discovers peers, manages sessions and moves typed messages and files.
pub struct Transceiver {
    shared: Arc<Shared>,
    discovery_info: Option<DiscoveryInfo>,
    local_peer: Peer,
    commands: mpsc::UnboundedSender<Command>,
    // Keeps the transport's event sink alive.
    _events: mpsc::UnboundedSender<TransportEvent>,
}

impl Transceiver {
    /// Attach to `transport` and start the event loop.
    ///
    /// # Panics
    ///
    /// Outside a Tokio runtime.
    pub fn new(config: TransceiverConfig, transport: Arc<dyn Transport>) -> Self {
        let local_peer = Peer::new(transport.local_identity(), config.discovery_info.clone());
        let shared = Arc::new(Shared {
            transport: Arc::clone(&transport),
            registry: Arc::new(PeerRegistry::new()),
            dispatch: DispatchTable::new(),
            resources: ResourceCoordinator::new(),
            events: EventBus::new(PEER_EVENT_CAPACITY),
        });

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();

        transport.configure_security(&config.security.session_security());
        let adapter = TransportAdapter::new(
            Arc::clone(&transport),
            Arc::clone(&shared.registry),
            shared.events.clone(),
            config.invitation,
            config.security,
            config.invitation_timeout,
            updates_tx.downgrade(),
        );
        transport.attach(EventSink::new(&events_tx));

        tokio::spawn(run_event_loop(EventLoop {
            shared: Arc::clone(&shared),
            adapter,
            events: events_rx,
            commands: commands_rx,
            commands_handle: commands_tx.downgrade(),
            updates: updates_rx,
            _updates_tx: updates_tx,
        }));
        info!(peer = %local_peer, "transceiver started");

        Self {
            shared,
            discovery_info: config.discovery_info,
            local_peer,
            commands: commands_tx,
            _events: events_tx,
        }
    }

    /// The local node, as other peers see it.
    pub fn local_peer(&self) -> &Peer {
        &self.local_peer
    }

    pub fn local_peer_id(&self) -> &str {
        self.local_peer.id()
    }

    // ── Lifecycle ──────────────────────────────────────────────

    /// Start advertising and browsing. Safe to call repeatedly.
    pub async fn resume(&self) -> Result<()> {
        self.shared
            .transport
            .resume(self.discovery_info.clone())
            .await
            .inspect_err(|e| error!(error = %e, "failed to resume transceiver"))?;
        info!("advertising and browsing for peers");
        Ok(())
    }

    /// Stop advertising and browsing. Established sessions stay up.
    pub async fn stop(&self) -> Result<()> {
        self.shared
            .transport
            .stop()
            .await
            .inspect_err(|e| error!(error = %e, "failed to stop transceiver"))?;
        info!("stopped advertising and browsing");
        Ok(())
    }

    // ── Messaging ──────────────────────────────────────────────

    /// Handle every inbound message of type `T`. Replaces an earlier handler.
    pub fn receive<T, F>(&self, handler: F) -> Result<()>
    where
        T: Message,
        F: Fn(T, Peer) + Send + Sync + 'static,
    {
        self.shared.dispatch.register::<T, F>(handler)
    }

    /// Inbound messages of type `T` as a stream. Replaces an earlier handler.
    pub fn messages<T: Message>(&self) -> Result<MessageStream<T>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.dispatch.register::<T, _>(move |message, peer| {
            let _ = tx.send((message, peer));
        })?;
        Ok(MessageStream { rx })
    }

    /// Send to every connected peer. With no connected peers this does nothing.
    pub async fn broadcast<T: Message>(&self, payload: &T) -> Result<()> {
        let peers = self.shared.registry.connected_peers();
        if peers.is_empty() {
            debug!(type_tag = %T::type_tag(), "not broadcasting, no connected peers");
            return Ok(());
        }
        self.send(payload, &peers).await
    }

    /// Send to the listed peers.
    pub async fn send<T: Message>(&self, payload: &T, peers: &[Peer]) -> Result<()> {
        if peers.is_empty() {
            return Ok(());
        }
        let data = self.shared.dispatch.encode(payload)?;
        let identities: Vec<_> = peers.iter().map(|p| p.identity().clone()).collect();
        self.shared
            .transport
            .send(Bytes::from(data), &identities)
            .await
            .inspect_err(|e| warn!(type_tag = %T::type_tag(), error = %e, "send failed"))?;
        debug!(type_tag = %T::type_tag(), peers = peers.len(), "sent message");
        Ok(())
    }

    // ── Sessions ───────────────────────────────────────────────

    /// Invite a peer into the session and wait for the outcome.
    ///
    /// Resolves with the connected peer, or with `InvitationFailed` /
    /// `InvitationTimedOut`. A peer that is already connected resolves at once.
    pub async fn invite(&self, peer: &Peer, context: Option<Bytes>, timeout: Duration) -> Result<Peer> {
        let (reply, outcome) = oneshot::channel();
        let request = InviteRequest { context, timeout };
        self.commands
            .send(Command::Invite {
                peer: peer.clone(),
                request,
                reply,
            })
            .map_err(|_| MeshError::Shutdown)?;
        outcome.await.map_err(|_| MeshError::Shutdown)?
    }

    // ── Resources ──────────────────────────────────────────────

    /// Upload a local file to one connected peer.
    ///
    /// Fails immediately with `NotALocalFile` for anything but a regular
    /// local file; nothing touches the network in that case.
    pub fn send_resource(&self, location: impl Into<ResourceLocation>, peer: &Peer) -> Result<ProgressStream> {
        let location = location.into();
        let path = location
            .to_local_file()
            .inspect_err(|e| error!(error = %e, "refusing to send resource"))?;
        let name = resource_name(&path);
        let (progress, stream) = ProgressStream::channel(name.clone());

        self.commands
            .send(Command::SendResource {
                path,
                name,
                peer: peer.clone(),
                progress,
            })
            .map_err(|_| MeshError::Shutdown)?;
        Ok(stream)
    }

    /// Register the single consumer for inbound resources.
    pub fn receive_resources(&self) -> Result<IncomingResources> {
        self.shared.resources.register_consumer()
    }

    pub fn active_transfers(&self) -> Vec<TransferInfo> {
        self.shared.resources.active_transfers()
    }

    // ── Peers ──────────────────────────────────────────────────

    /// Snapshot of the available (discovered) peers, in discovery order.
    pub fn available_peers(&self) -> Vec<Peer> {
        self.shared.registry.available_peers()
    }

    pub fn connected_peers(&self) -> Vec<Peer> {
        self.shared.registry.connected_peers()
    }

    pub fn peer_state(&self, peer_id: &str) -> Option<PeerState> {
        self.shared.registry.state(peer_id)
    }

    /// Watch the available peer list. Updates only when it actually changes.
    pub fn peers_watch(&self) -> watch::Receiver<Vec<Peer>> {
        self.shared.registry.subscribe()
    }

    /// Raw subscription to peer events.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.shared.events.subscribe()
    }

    /// Peer events from now on, as a stream. Skips (and logs) events missed
    /// by a slow consumer.
    pub fn peer_events(&self) -> BoxStream<'static, PeerEvent> {
        stream::unfold(self.shared.events.subscribe(), |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "peer event consumer lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

impl Drop for Transceiver {
    fn drop(&mut self) {
        debug!(peer = %self.local_peer, "transceiver dropped");
    }
}

// ── Event loop ─────────────────────────────────────────────────

struct EventLoop {
    shared: Arc<Shared>,
    adapter: TransportAdapter,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    commands_handle: mpsc::WeakUnboundedSender<Command>,
    updates: mpsc::UnboundedReceiver<AdapterUpdate>,
    _updates_tx: mpsc::UnboundedSender<AdapterUpdate>,
}

impl EventLoop {
    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Invite {
                peer,
                request,
                reply,
            } => self.adapter.invite(peer, request, Some(reply)),
            Command::SendResource {
                path,
                name,
                peer,
                progress,
            } => {
                let id = self.shared.resources.track_outbound(&name, peer.clone());
                debug!(resource = %name, peer = %peer, "starting resource upload");
                tokio::spawn(run_upload(
                    Arc::clone(&self.shared.transport),
                    path,
                    name,
                    peer,
                    id,
                    progress,
                    Box::new(self.release_handle()),
                ));
            }
            Command::ReleaseTransfer { name, id } => {
                self.shared.resources.release(&name, id);
            }
        }
    }

    fn handle_routed(&mut self, routed: Routed) {
        match routed {
            Routed::Data { peer, data } => match self.shared.dispatch.decode_envelope(&data) {
                Ok(decoded) => {
                    debug!(peer = %peer, type_tag = %decoded.type_tag, "received message");
                    self.shared.dispatch.dispatch(decoded, peer);
                }
                Err(e) => warn!(peer = %peer, error = %e, "dropping undecodable message"),
            },
            Routed::ResourceStarted {
                peer,
                name,
                progress,
            } => {
                info!(resource = %name, peer = %peer, "receiving resource");
                let _ = self
                    .shared
                    .resources
                    .start_inbound(&name, peer, progress, self.release_handle());
            }
            Routed::ResourceFinished { peer, name, result } => {
                match &result {
                    Ok(path) => info!(resource = %name, peer = %peer, path = %path.display(), "resource received"),
                    Err(e) => warn!(resource = %name, peer = %peer, error = %e, "resource transfer failed"),
                }
                self.shared.resources.finish_inbound(&name, result);
            }
        }
    }

    /// Callback for a transfer task to drop its bookkeeping entry.
    fn release_handle(&self) -> impl FnOnce(String, u64) + Send + 'static {
        let commands = self.commands_handle.clone();
        move |name, id| {
            if let Some(tx) = commands.upgrade() {
                let _ = tx.send(Command::ReleaseTransfer { name, id });
            }
        }
    }
}

async fn run_event_loop(mut state: EventLoop) {
    loop {
        tokio::select! {
            command = state.commands.recv() => match command {
                Some(command) => state.handle_command(command),
                None => break,
            },
            Some(event) = state.events.recv() => {
                if let Some(routed) = state.adapter.handle_event(event) {
                    state.handle_routed(routed);
                }
            }
            Some(update) = state.updates.recv() => state.adapter.handle_update(update),
        }
    }

    let pending = state.adapter.pending_invitations();
    state.adapter.shutdown();
    info!(pending_invitations = pending, "transceiver event loop stopped");
}
