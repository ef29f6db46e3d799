//! libp2p transport for meshkit.
//!
//! This module is only compiled when the `p2p` feature is enabled.
//! mDNS finds nodes on the LAN, TCP with Noise encryption and Yamux
//! multiplexing carries the traffic, Identify exchanges agent metadata, and
//! one JSON request-response protocol carries announcements, invitations,
//! messages and resource chunks.
//!
//! A node is reported as found once it has announced the same service type
//! over a live connection. A session exists once an invitation was accepted;
//! it ends when the last connection to that node closes.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use libp2p::{
    Multiaddr, PeerId, StreamProtocol, Swarm, identify, identity::Keypair, mdns, noise,
    request_response::{self, OutboundRequestId, ProtocolSupport, ResponseChannel},
    swarm::{NetworkBehaviour, SwarmEvent},
    tcp, yamux,
};
use meshkit_config::MeshConfig;
use meshkit_core::{DiscoveryInfo, EncryptionPreference, MeshError, NodeIdentity, Result};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::identity::{FileIdentityStore, fetch_or_create_local_identity};
use crate::transport::{
    EventSink, InvitationResponder, ResourceUpload, SessionSecurity, SessionState, Transport,
    TransportEvent,
};

/// Request-response protocol for all meshkit traffic.
pub const MESH_PROTOCOL: &str = "/meshkit/1.0.0";

const CHUNK_SIZE: usize = 64 * 1024;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// Identify exchanges run this often, which keeps session connections busy.
const IDENTIFY_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Connections with no traffic for this long are closed, ending the session.
const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10 * 60);
/// Inbound files one node may have open at a time.
const MAX_INBOUND_PER_PEER: usize = 4;

// ── Wire format ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireRequest {
    /// "I am advertising this service."
    Announce {
        identity: NodeIdentity,
        service_type: String,
        discovery_info: Option<DiscoveryInfo>,
    },
    /// "I stopped advertising."
    Withdraw,
    Invite {
        context: Option<Vec<u8>>,
    },
    Data {
        payload: Vec<u8>,
    },
    Chunk {
        name: String,
        offset: u64,
        total: u64,
        data: Vec<u8>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireResponse {
    Announce {
        identity: NodeIdentity,
        service_type: String,
        discovery_info: Option<DiscoveryInfo>,
    },
    Invitation {
        accepted: bool,
    },
    Ack,
    Rejected {
        reason: String,
    },
}

/// Combined network behaviour for a meshkit node.
#[derive(NetworkBehaviour)]
pub struct MeshBehaviour {
    pub mdns: mdns::tokio::Behaviour,
    pub identify: identify::Behaviour,
    pub wire: request_response::json::Behaviour<WireRequest, WireResponse>,
}

/// Commands sent from [`P2pTransport`] to the background swarm event loop.
enum SwarmCommand {
    Attach(EventSink),
    Resume {
        discovery_info: Option<DiscoveryInfo>,
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<Result<()>>,
    },
    Send {
        data: Vec<u8>,
        peers: Vec<NodeIdentity>,
        reply: oneshot::Sender<Result<()>>,
    },
    Invite {
        peer: NodeIdentity,
        context: Option<Vec<u8>>,
        reply: oneshot::Sender<Result<()>>,
    },
    AnswerInvite {
        peer: PeerId,
        channel: ResponseChannel<WireResponse>,
        accept: bool,
    },
    Chunk {
        peer: NodeIdentity,
        request: WireRequest,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// A node reached over at least one live connection.
struct RemoteNode {
    identity: Option<NodeIdentity>,
    discovery_info: Option<DiscoveryInfo>,
    /// The remote's last announcement is still in force.
    advertised: bool,
    /// We reported it as found and not yet as lost.
    reported: bool,
    session: bool,
}

impl RemoteNode {
    fn new() -> Self {
        Self {
            identity: None,
            discovery_info: None,
            advertised: false,
            reported: false,
            session: false,
        }
    }
}

enum PendingRequest {
    Announce,
    Invite(PeerId),
    Ack(Option<oneshot::Sender<Result<()>>>),
}

struct InboundFile {
    path: PathBuf,
    file: tokio::fs::File,
    received: u64,
    total: u64,
    progress: watch::Sender<f64>,
}

/// What one inbound chunk did to its transfer.
#[derive(Default)]
struct ChunkReport {
    /// A transfer began with this chunk.
    started: Option<watch::Receiver<f64>>,
    /// The transfer ended, with the written file or the failure.
    finished: Option<Result<PathBuf>>,
    /// The chunk was refused; answered to the sender.
    rejected: Option<String>,
}

impl ChunkReport {
    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            rejected: Some(reason.into()),
            ..Self::default()
        }
    }
}

/// The file name a remote may write under, or `None` if `name` could
/// resolve anywhere but directly inside the download directory.
fn inbound_file_name(name: &str) -> Option<&str> {
    if name.contains(['/', '\\']) {
        return None;
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(part)), None) if part == OsStr::new(name) => Some(name),
        _ => None,
    }
}

async fn create_inbound_file(dir: &Path, path: &Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
}

async fn discard(transfer: InboundFile) {
    let InboundFile { path, file, .. } = transfer;
    drop(file);
    if let Err(e) = tokio::fs::remove_file(&path).await {
        debug!(path = %path.display(), error = %e, "could not remove partial download");
    }
}

/// Files being received, keyed by sending node and resource name.
struct InboundTransfers {
    download_dir: PathBuf,
    files: HashMap<(PeerId, String), InboundFile>,
}

impl InboundTransfers {
    fn new(download_dir: PathBuf) -> Self {
        Self {
            download_dir,
            files: HashMap::new(),
        }
    }

    fn open_for(&self, peer: PeerId) -> usize {
        self.files.keys().filter(|(p, _)| *p == peer).count()
    }

    /// Write one chunk. The first chunk (offset 0) opens a new file named
    /// after the resource; sizes beyond the announced total fail the transfer.
    async fn accept(&mut self, peer: PeerId, name: String, offset: u64, total: u64, data: Vec<u8>) -> ChunkReport {
        let key = (peer, name);
        let mut report = ChunkReport::default();

        if !self.files.contains_key(&key) {
            if offset != 0 {
                return ChunkReport::rejected(format!("unknown transfer {}", key.1));
            }
            if self.open_for(peer) >= MAX_INBOUND_PER_PEER {
                warn!(peer = %peer, resource = %key.1, "too many inbound transfers from one node");
                return ChunkReport::rejected("too many transfers in progress");
            }
            let Some(file_name) = inbound_file_name(&key.1) else {
                warn!(peer = %peer, resource = %key.1, "refusing resource with an unsafe name");
                return ChunkReport::rejected("invalid resource name");
            };
            let path = self.download_dir.join(file_name);
            let file = match create_inbound_file(&self.download_dir, &path).await {
                Ok(file) => file,
                Err(e) => return ChunkReport::rejected(e.to_string()),
            };
            let (progress, progress_rx) = watch::channel(0.0);
            report.started = Some(progress_rx);
            self.files.insert(
                key.clone(),
                InboundFile {
                    path,
                    file,
                    received: 0,
                    total,
                    progress,
                },
            );
        }

        let Some(transfer) = self.files.get_mut(&key) else {
            return ChunkReport::rejected(format!("unknown transfer {}", key.1));
        };
        let end = transfer.received.saturating_add(data.len() as u64);
        let problem = if offset != transfer.received {
            Some(format!("expected offset {}, got {offset}", transfer.received))
        } else if total != transfer.total {
            Some(format!("announced size changed from {} to {total}", transfer.total))
        } else if end > transfer.total {
            Some(format!("{end} bytes exceeds the announced {}", transfer.total))
        } else {
            None
        };
        if let Some(reason) = problem {
            return self.abort(&key, report, reason).await;
        }
        let written = transfer.file.write_all(&data).await;
        if let Err(e) = written {
            return self.abort(&key, report, e.to_string()).await;
        }

        transfer.received = end;
        let fraction = if transfer.total == 0 {
            1.0
        } else {
            transfer.received as f64 / transfer.total as f64
        };
        transfer.progress.send_replace(fraction);

        if transfer.received == transfer.total
            && let Some(mut done) = self.files.remove(&key)
        {
            let flushed = done.file.flush().await;
            report.finished = Some(flushed.map(|()| done.path.clone()).map_err(MeshError::Io));
        }
        report
    }

    async fn abort(&mut self, key: &(PeerId, String), mut report: ChunkReport, reason: String) -> ChunkReport {
        if let Some(transfer) = self.files.remove(key) {
            discard(transfer).await;
            report.finished = Some(Err(MeshError::Resource {
                resource: key.1.clone(),
                reason: reason.clone(),
            }));
        }
        report.rejected = Some(reason);
        report
    }

    /// Drop every unfinished file from `peer`. Returns their resource names.
    async fn drop_peer(&mut self, peer: PeerId) -> Vec<String> {
        let keys: Vec<(PeerId, String)> = self
            .files
            .keys()
            .filter(|(p, _)| *p == peer)
            .cloned()
            .collect();
        let mut names = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(transfer) = self.files.remove(&key) {
                discard(transfer).await;
                names.push(key.1);
            }
        }
        names
    }
}

/// Derive the libp2p keypair from the stable meshkit identity.
pub fn keypair_for(identity: &NodeIdentity) -> Result<Keypair> {
    let seed = blake3::derive_key("meshkit p2p node key v1", identity.uid.as_bytes());
    Keypair::ed25519_from_bytes(seed).map_err(|e| MeshError::Identity(e.to_string()))
}

/// Transport backed by a libp2p swarm running on a background task.
pub struct P2pTransport {
    identity: NodeIdentity,
    peer_id: PeerId,
    commands: mpsc::UnboundedSender<SwarmCommand>,
}

impl P2pTransport {
    /// Build the swarm, start listening and spawn the event loop.
    pub fn start(
        identity: NodeIdentity,
        service_type: &str,
        listen_addr: &str,
        download_dir: PathBuf,
    ) -> Result<Arc<Self>> {
        let keypair = keypair_for(&identity)?;
        let mut swarm = build_swarm(keypair)?;
        let peer_id = *swarm.local_peer_id();
        info!(peer_id = %peer_id, name = %identity.name, "libp2p swarm identity created");

        let addr: Multiaddr = listen_addr.parse().map_err(|e| {
            MeshError::Config(format!("invalid p2p listen address '{listen_addr}': {e}"))
        })?;
        swarm
            .listen_on(addr)
            .map_err(|e| MeshError::AdvertisingFailed(format!("failed to listen: {e}")))?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let swarm_loop = SwarmLoop {
            swarm,
            local: identity.clone(),
            service_type: service_type.to_string(),
            sink: None,
            advertising: false,
            discovery_info: None,
            remotes: HashMap::new(),
            by_uid: HashMap::new(),
            pending: HashMap::new(),
            inbound: InboundTransfers::new(download_dir),
            commands_handle: commands.downgrade(),
        };
        tokio::spawn(run_swarm_loop(swarm_loop, command_rx));

        Ok(Arc::new(Self {
            identity,
            peer_id,
            commands,
        }))
    }

    /// Start from a loaded config, reusing the persisted identity.
    pub fn from_config(config: &MeshConfig) -> Result<Arc<Self>> {
        let store = FileIdentityStore::new(&config.identity.store_path);
        let identity = fetch_or_create_local_identity(&config.service.peer_name, &store)?;
        Self::start(
            identity,
            &config.service.service_type,
            &config.p2p.listen,
            config.transfers.download_dir.clone(),
        )
    }

    pub fn libp2p_peer_id(&self) -> PeerId {
        self.peer_id
    }

    async fn request(&self, build: impl FnOnce(oneshot::Sender<Result<()>>) -> SwarmCommand) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| MeshError::Transport("swarm task not running".into()))?;
        rx.await
            .map_err(|_| MeshError::Transport("swarm task not running".into()))?
    }
}

#[async_trait]
impl Transport for P2pTransport {
    fn local_identity(&self) -> NodeIdentity {
        self.identity.clone()
    }

    fn configure_security(&self, security: &SessionSecurity) {
        if security.encryption == EncryptionPreference::None {
            debug!("libp2p sessions are always Noise-encrypted");
        }
        if let Some(path) = &security.identity_path {
            warn!(path = %path.display(), "libp2p keys derive from the node identity, ignoring identity path");
        }
    }

    fn attach(&self, sink: EventSink) {
        if self.commands.send(SwarmCommand::Attach(sink)).is_err() {
            warn!("cannot attach event sink: swarm task not running");
        }
    }

    async fn resume(&self, discovery_info: Option<DiscoveryInfo>) -> Result<()> {
        self.request(|reply| SwarmCommand::Resume {
            discovery_info,
            reply,
        })
        .await
    }

    async fn stop(&self) -> Result<()> {
        self.request(|reply| SwarmCommand::Stop { reply }).await
    }

    async fn send(&self, data: Bytes, peers: &[NodeIdentity]) -> Result<()> {
        let peers = peers.to_vec();
        self.request(|reply| SwarmCommand::Send {
            data: data.to_vec(),
            peers,
            reply,
        })
        .await
    }

    async fn invite(&self, peer: &NodeIdentity, context: Option<Bytes>, _timeout: Duration) -> Result<()> {
        let peer = peer.clone();
        self.request(|reply| SwarmCommand::Invite {
            peer,
            context: context.map(|c| c.to_vec()),
            reply,
        })
        .await
    }

    async fn send_resource(&self, path: &Path, name: &str, peer: &NodeIdentity) -> Result<ResourceUpload> {
        let contents = tokio::fs::read(path).await?;
        let (progress_tx, progress) = watch::channel(0.0);
        let (done_tx, completion) = oneshot::channel();

        let commands = self.commands.clone();
        let peer = peer.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            let total = contents.len() as u64;
            let mut offset = 0u64;
            let chunks: Vec<&[u8]> = if contents.is_empty() {
                vec![&[][..]]
            } else {
                contents.chunks(CHUNK_SIZE).collect()
            };

            for chunk in chunks {
                let (reply, rx) = oneshot::channel();
                let request = WireRequest::Chunk {
                    name: name.clone(),
                    offset,
                    total,
                    data: chunk.to_vec(),
                };
                let sent = commands
                    .send(SwarmCommand::Chunk {
                        peer: peer.clone(),
                        request,
                        reply,
                    })
                    .is_ok();
                let outcome = match rx.await {
                    Ok(outcome) if sent => outcome,
                    _ => Err(MeshError::Transport("swarm task not running".into())),
                };
                if let Err(e) = outcome {
                    let _ = done_tx.send(Err(MeshError::Resource {
                        resource: name,
                        reason: e.to_string(),
                    }));
                    return;
                }
                offset += chunk.len() as u64;
                let fraction = if total == 0 { 1.0 } else { offset as f64 / total as f64 };
                progress_tx.send_replace(fraction);
            }
            let _ = done_tx.send(Ok(()));
        });

        Ok(ResourceUpload {
            progress,
            completion,
        })
    }
}

// ── Swarm construction ─────────────────────────────────────────

fn build_swarm(keypair: Keypair) -> Result<Swarm<MeshBehaviour>> {
    build_swarm_inner(keypair)
        .map_err(|e| MeshError::Transport(format!("failed to build libp2p swarm: {e}")))
}

/// Inner builder that uses `Box<dyn Error>` for ergonomic `?` propagation
/// across the various libp2p builder error types.
fn build_swarm_inner(
    keypair: Keypair,
) -> std::result::Result<Swarm<MeshBehaviour>, Box<dyn std::error::Error + Send + Sync>> {
    let swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default(),
            noise::Config::new,
            yamux::Config::default,
        )?
        .with_behaviour(|key| {
            let mdns =
                mdns::tokio::Behaviour::new(mdns::Config::default(), key.public().to_peer_id())?;

            let identify = identify::Behaviour::new(
                identify::Config::new("/meshkit/id/1.0.0".to_string(), key.public())
                    .with_agent_version(format!("meshkit/{}", env!("CARGO_PKG_VERSION")))
                    .with_interval(IDENTIFY_INTERVAL),
            );

            let wire = request_response::json::Behaviour::new(
                [(StreamProtocol::new(MESH_PROTOCOL), ProtocolSupport::Full)],
                request_response::Config::default().with_request_timeout(REQUEST_TIMEOUT),
            );

            Ok(MeshBehaviour {
                mdns,
                identify,
                wire,
            })
        })?
        .with_swarm_config(|c| c.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
        .build();

    Ok(swarm)
}

// ── Event loop ─────────────────────────────────────────────────

struct SwarmLoop {
    swarm: Swarm<MeshBehaviour>,
    local: NodeIdentity,
    service_type: String,
    sink: Option<EventSink>,
    advertising: bool,
    discovery_info: Option<DiscoveryInfo>,
    remotes: HashMap<PeerId, RemoteNode>,
    by_uid: HashMap<String, PeerId>,
    pending: HashMap<OutboundRequestId, PendingRequest>,
    inbound: InboundTransfers,
    commands_handle: mpsc::WeakUnboundedSender<SwarmCommand>,
}

/// The main swarm event loop. Runs until the [`P2pTransport`] and every
/// upload task are gone.
async fn run_swarm_loop(mut state: SwarmLoop, mut command_rx: mpsc::UnboundedReceiver<SwarmCommand>) {
    loop {
        tokio::select! {
            event = state.swarm.select_next_some() => state.handle_swarm_event(event).await,
            command = command_rx.recv() => match command {
                Some(command) => state.handle_command(command),
                None => {
                    info!("meshkit swarm shutting down");
                    break;
                }
            },
        }
    }
}

impl SwarmLoop {
    fn emit(&self, event: TransportEvent) {
        if let Some(sink) = &self.sink {
            sink.emit(event);
        }
    }

    fn announcement(&self) -> WireRequest {
        WireRequest::Announce {
            identity: self.local.clone(),
            service_type: self.service_type.clone(),
            discovery_info: self.discovery_info.clone(),
        }
    }

    /// Libp2p peer for a meshkit identity, if it is currently reachable.
    fn route(&self, identity: &NodeIdentity) -> Option<PeerId> {
        self.by_uid
            .get(&identity.uid)
            .copied()
            .filter(|p| self.remotes.contains_key(p))
    }

    fn in_session(&self, identity: &NodeIdentity) -> Option<PeerId> {
        self.route(identity)
            .filter(|p| self.remotes.get(p).is_some_and(|r| r.session))
    }

    fn handle_command(&mut self, command: SwarmCommand) {
        match command {
            SwarmCommand::Attach(sink) => self.sink = Some(sink),
            SwarmCommand::Resume {
                discovery_info,
                reply,
            } => {
                self.advertising = true;
                self.discovery_info = discovery_info;
                let connected: Vec<PeerId> = self.remotes.keys().copied().collect();
                for peer in connected {
                    let announcement = self.announcement();
                    let id = self.swarm.behaviour_mut().wire.send_request(&peer, announcement);
                    self.pending.insert(id, PendingRequest::Announce);
                }
                let ready: Vec<PeerId> = self
                    .remotes
                    .iter()
                    .filter(|(_, r)| r.advertised && !r.reported)
                    .map(|(p, _)| *p)
                    .collect();
                for peer in ready {
                    self.report_found(peer);
                }
                info!(service = %self.service_type, "advertising and browsing");
                let _ = reply.send(Ok(()));
            }
            SwarmCommand::Stop { reply } => {
                self.advertising = false;
                let connected: Vec<PeerId> = self.remotes.keys().copied().collect();
                for peer in connected {
                    let id = self.swarm.behaviour_mut().wire.send_request(&peer, WireRequest::Withdraw);
                    self.pending.insert(id, PendingRequest::Ack(None));
                    self.report_lost(peer);
                }
                info!("stopped advertising and browsing");
                let _ = reply.send(Ok(()));
            }
            SwarmCommand::Send { data, peers, reply } => {
                let mut routes = Vec::with_capacity(peers.len());
                let mut unreachable = Vec::new();
                for identity in &peers {
                    match self.in_session(identity) {
                        Some(peer) => routes.push(peer),
                        None => unreachable.push(identity.name.clone()),
                    }
                }
                if !unreachable.is_empty() {
                    let _ = reply.send(Err(MeshError::SendFailed(format!(
                        "not connected to {}",
                        unreachable.join(", ")
                    ))));
                    return;
                }
                for peer in routes {
                    let id = self.swarm.behaviour_mut().wire.send_request(
                        &peer,
                        WireRequest::Data {
                            payload: data.clone(),
                        },
                    );
                    self.pending.insert(id, PendingRequest::Ack(None));
                }
                let _ = reply.send(Ok(()));
            }
            SwarmCommand::Invite {
                peer,
                context,
                reply,
            } => {
                let Some(route) = self.route(&peer) else {
                    let _ = reply.send(Err(MeshError::PeerNotFound(peer.name)));
                    return;
                };
                if self.in_session(&peer).is_none() {
                    self.emit(TransportEvent::SessionStateChanged {
                        identity: peer,
                        state: SessionState::Connecting,
                    });
                    let id = self
                        .swarm
                        .behaviour_mut()
                        .wire
                        .send_request(&route, WireRequest::Invite { context });
                    self.pending.insert(id, PendingRequest::Invite(route));
                }
                let _ = reply.send(Ok(()));
            }
            SwarmCommand::AnswerInvite {
                peer,
                channel,
                accept,
            } => {
                let accepted = accept && self.remotes.contains_key(&peer);
                if accepted {
                    self.open_session(peer, true);
                }
                if self
                    .swarm
                    .behaviour_mut()
                    .wire
                    .send_response(channel, WireResponse::Invitation { accepted })
                    .is_err()
                {
                    debug!(peer = %peer, "invitation answer could not be delivered");
                }
            }
            SwarmCommand::Chunk {
                peer,
                request,
                reply,
            } => match self.in_session(&peer) {
                Some(route) => {
                    let id = self.swarm.behaviour_mut().wire.send_request(&route, request);
                    self.pending.insert(id, PendingRequest::Ack(Some(reply)));
                }
                None => {
                    let _ = reply.send(Err(MeshError::SendFailed(format!(
                        "not connected to {}",
                        peer.name
                    ))));
                }
            },
        }
    }

    fn report_found(&mut self, peer: PeerId) {
        if !self.advertising {
            return;
        }
        let Some(remote) = self.remotes.get_mut(&peer) else {
            return;
        };
        let Some(identity) = remote.identity.clone() else {
            return;
        };
        remote.reported = true;
        let discovery_info = remote.discovery_info.clone();
        self.emit(TransportEvent::PeerFound {
            identity,
            discovery_info,
        });
    }

    fn report_lost(&mut self, peer: PeerId) {
        let Some(remote) = self.remotes.get_mut(&peer) else {
            return;
        };
        if !remote.reported {
            return;
        }
        remote.reported = false;
        if let Some(identity) = remote.identity.clone() {
            self.emit(TransportEvent::PeerLost { identity });
        }
    }

    fn open_session(&mut self, peer: PeerId, invitee: bool) {
        let Some(remote) = self.remotes.get_mut(&peer) else {
            return;
        };
        if remote.session {
            return;
        }
        remote.session = true;
        let Some(identity) = remote.identity.clone() else {
            return;
        };
        if invitee {
            self.emit(TransportEvent::SessionStateChanged {
                identity: identity.clone(),
                state: SessionState::Connecting,
            });
        }
        info!(peer = %peer, name = %identity.name, "session established");
        self.emit(TransportEvent::SessionStateChanged {
            identity,
            state: SessionState::Connected,
        });
    }

    fn connect_failed(&mut self, peer: PeerId) {
        let Some(remote) = self.remotes.get(&peer) else {
            return;
        };
        if remote.session {
            return;
        }
        if let Some(identity) = remote.identity.clone() {
            self.emit(TransportEvent::SessionStateChanged {
                identity,
                state: SessionState::NotConnected,
            });
        }
    }

    /// Record an announcement from `peer` and report it if it matches our service.
    fn on_announce(
        &mut self,
        peer: PeerId,
        identity: NodeIdentity,
        service_type: String,
        discovery_info: Option<DiscoveryInfo>,
    ) {
        let matches = service_type == self.service_type;
        self.by_uid.insert(identity.uid.clone(), peer);
        let remote = self.remotes.entry(peer).or_insert_with(RemoteNode::new);
        let changed = remote.discovery_info != discovery_info;
        remote.identity = Some(identity);
        remote.discovery_info = discovery_info;
        remote.advertised = matches;
        let reported = remote.reported;

        if !matches {
            debug!(peer = %peer, "ignoring node advertising a different service");
            return;
        }
        if !reported || changed {
            self.report_found(peer);
        }
    }

    async fn on_request(&mut self, peer: PeerId, request: WireRequest, channel: ResponseChannel<WireResponse>) {
        let response = match request {
            WireRequest::Announce {
                identity,
                service_type,
                discovery_info,
            } => {
                self.on_announce(peer, identity, service_type, discovery_info);
                if self.advertising {
                    WireResponse::Announce {
                        identity: self.local.clone(),
                        service_type: self.service_type.clone(),
                        discovery_info: self.discovery_info.clone(),
                    }
                } else {
                    WireResponse::Ack
                }
            }
            WireRequest::Withdraw => {
                if let Some(remote) = self.remotes.get_mut(&peer) {
                    remote.advertised = false;
                }
                self.report_lost(peer);
                WireResponse::Ack
            }
            WireRequest::Invite { context } => {
                let identity = self
                    .remotes
                    .get(&peer)
                    .filter(|r| r.advertised)
                    .and_then(|r| r.identity.clone());
                match (identity, self.commands_handle.upgrade()) {
                    (Some(identity), Some(commands)) => {
                        let (responder, answer) = InvitationResponder::new();
                        self.emit(TransportEvent::InvitationReceived {
                            identity,
                            context: context.map(Bytes::from),
                            responder,
                        });
                        tokio::spawn(async move {
                            let accept =
                                matches!(tokio::time::timeout(REQUEST_TIMEOUT, answer).await, Ok(Ok(true)));
                            let _ = commands.send(SwarmCommand::AnswerInvite {
                                peer,
                                channel,
                                accept,
                            });
                        });
                        return;
                    }
                    _ => {
                        debug!(peer = %peer, "declining invitation from unannounced node");
                        WireResponse::Invitation { accepted: false }
                    }
                }
            }
            WireRequest::Data { payload } => match self.remotes.get(&peer) {
                Some(RemoteNode {
                    identity: Some(identity),
                    session: true,
                    ..
                }) => {
                    self.emit(TransportEvent::DataReceived {
                        identity: identity.clone(),
                        data: Bytes::from(payload),
                    });
                    WireResponse::Ack
                }
                _ => WireResponse::Rejected {
                    reason: "no session".into(),
                },
            },
            WireRequest::Chunk {
                name,
                offset,
                total,
                data,
            } => self.on_chunk(peer, name, offset, total, data).await,
        };

        if self
            .swarm
            .behaviour_mut()
            .wire
            .send_response(channel, response)
            .is_err()
        {
            debug!(peer = %peer, "response could not be delivered");
        }
    }

    async fn on_chunk(&mut self, peer: PeerId, name: String, offset: u64, total: u64, data: Vec<u8>) -> WireResponse {
        let identity = match self.remotes.get(&peer) {
            Some(RemoteNode {
                identity: Some(identity),
                session: true,
                ..
            }) => identity.clone(),
            _ => {
                return WireResponse::Rejected {
                    reason: "no session".into(),
                };
            }
        };

        let report = self.inbound.accept(peer, name.clone(), offset, total, data).await;
        if let Some(progress) = report.started {
            self.emit(TransportEvent::ResourceStarted {
                identity: identity.clone(),
                name: name.clone(),
                progress,
            });
        }
        if let Some(result) = report.finished {
            self.emit(TransportEvent::ResourceFinished {
                identity,
                name,
                result,
            });
        }
        match report.rejected {
            Some(reason) => WireResponse::Rejected { reason },
            None => WireResponse::Ack,
        }
    }

    fn on_response(&mut self, peer: PeerId, request_id: OutboundRequestId, response: WireResponse) {
        match (self.pending.remove(&request_id), response) {
            (
                _,
                WireResponse::Announce {
                    identity,
                    service_type,
                    discovery_info,
                },
            ) => self.on_announce(peer, identity, service_type, discovery_info),
            (Some(PendingRequest::Invite(route)), WireResponse::Invitation { accepted }) => {
                if accepted {
                    self.open_session(route, false);
                } else {
                    debug!(peer = %peer, "invitation declined");
                    self.connect_failed(route);
                }
            }
            (Some(PendingRequest::Ack(Some(reply))), WireResponse::Ack) => {
                let _ = reply.send(Ok(()));
            }
            (Some(PendingRequest::Ack(Some(reply))), WireResponse::Rejected { reason }) => {
                let _ = reply.send(Err(MeshError::SendFailed(reason)));
            }
            (_, WireResponse::Rejected { reason }) => {
                debug!(peer = %peer, reason = %reason, "request rejected");
            }
            _ => {}
        }
    }

    fn on_outbound_failure(&mut self, peer: PeerId, request_id: OutboundRequestId, error: String) {
        warn!(peer = %peer, error = %error, "request failed");
        match self.pending.remove(&request_id) {
            Some(PendingRequest::Invite(route)) => self.connect_failed(route),
            Some(PendingRequest::Ack(Some(reply))) => {
                let _ = reply.send(Err(MeshError::SendFailed(error)));
            }
            _ => {}
        }
    }

    async fn on_connection_lost(&mut self, peer: PeerId) {
        let Some(remote) = self.remotes.remove(&peer) else {
            return;
        };
        let Some(identity) = remote.identity else {
            return;
        };
        self.by_uid.remove(&identity.uid);

        for name in self.inbound.drop_peer(peer).await {
            self.emit(TransportEvent::ResourceFinished {
                identity: identity.clone(),
                result: Err(MeshError::Resource {
                    resource: name.clone(),
                    reason: "connection closed".into(),
                }),
                name,
            });
        }
        if remote.session {
            self.emit(TransportEvent::SessionStateChanged {
                identity: identity.clone(),
                state: SessionState::NotConnected,
            });
        }
        if remote.reported {
            self.emit(TransportEvent::PeerLost { identity });
        }
    }

    /// Handle a single swarm event.
    async fn handle_swarm_event(&mut self, event: SwarmEvent<MeshBehaviourEvent>) {
        match event {
            // ── mDNS: discovered nodes on the LAN ──────────────────
            SwarmEvent::Behaviour(MeshBehaviourEvent::Mdns(mdns::Event::Discovered(list))) => {
                for (peer_id, addr) in list {
                    if self.swarm.is_connected(&peer_id) {
                        continue;
                    }
                    debug!(peer = %peer_id, addr = %addr, "mDNS discovered node");
                    if let Err(e) = self.swarm.dial(addr) {
                        debug!(peer = %peer_id, error = %e, "dial after mDNS discovery failed");
                    }
                }
            }
            SwarmEvent::Behaviour(MeshBehaviourEvent::Mdns(mdns::Event::Expired(list))) => {
                for (peer_id, _addr) in list {
                    debug!(peer = %peer_id, "mDNS record expired");
                }
            }

            // ── Identify ───────────────────────────────────────────
            SwarmEvent::Behaviour(MeshBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                if !info.agent_version.starts_with("meshkit/") {
                    debug!(peer = %peer_id, agent = %info.agent_version, "connected to a non-meshkit node");
                }
                for addr in info.listen_addrs {
                    self.swarm.add_peer_address(peer_id, addr);
                }
            }

            // ── Wire protocol ──────────────────────────────────────
            SwarmEvent::Behaviour(MeshBehaviourEvent::Wire(request_response::Event::Message {
                peer,
                message,
                ..
            })) => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => self.on_request(peer, request, channel).await,
                request_response::Message::Response {
                    request_id,
                    response,
                } => self.on_response(peer, request_id, response),
            },
            SwarmEvent::Behaviour(MeshBehaviourEvent::Wire(request_response::Event::OutboundFailure {
                peer,
                request_id,
                error,
                ..
            })) => self.on_outbound_failure(peer, request_id, error.to_string()),
            SwarmEvent::Behaviour(MeshBehaviourEvent::Wire(request_response::Event::InboundFailure {
                peer,
                error,
                ..
            })) => {
                debug!(peer = %peer, error = %error, "inbound request failed");
            }

            // ── Connection lifecycle ───────────────────────────────
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(addr = %address, "meshkit node listening");
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                num_established,
                ..
            } => {
                if num_established.get() > 1 {
                    return;
                }
                debug!(peer = %peer_id, "connection established");
                self.remotes.entry(peer_id).or_insert_with(RemoteNode::new);
                if self.advertising {
                    let announcement = self.announcement();
                    let id = self
                        .swarm
                        .behaviour_mut()
                        .wire
                        .send_request(&peer_id, announcement);
                    self.pending.insert(id, PendingRequest::Announce);
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                cause,
                ..
            } => {
                if num_established > 0 {
                    return;
                }
                info!(peer = %peer_id, cause = ?cause, "connection closed");
                self.on_connection_lost(peer_id).await;
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                warn!(peer = ?peer_id, error = %error, "outgoing connection error");
            }
            SwarmEvent::IncomingConnectionError {
                local_addr,
                send_back_addr,
                error,
                ..
            } => {
                warn!(local = %local_addr, remote = %send_back_addr, error = %error, "incoming connection error");
            }
            SwarmEvent::ListenerError { error, .. } => {
                warn!(error = %error, "listener error");
                self.emit(TransportEvent::AdvertisingFailed(error.to_string()));
            }

            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_is_derived_from_uid() {
        let identity = NodeIdentity::generate("a");
        let first = keypair_for(&identity).unwrap().public().to_peer_id();
        let second = keypair_for(&identity).unwrap().public().to_peer_id();
        assert_eq!(first, second);

        let other = keypair_for(&NodeIdentity::generate("a")).unwrap().public().to_peer_id();
        assert_ne!(first, other);
    }

    fn node_peer_id(name: &str) -> PeerId {
        keypair_for(&NodeIdentity::generate(name)).unwrap().public().to_peer_id()
    }

    fn is_empty_dir(dir: &Path) -> bool {
        std::fs::read_dir(dir).map(|entries| entries.count() == 0).unwrap_or(true)
    }

    #[test]
    fn idle_connections_outlive_identify_but_not_forever() {
        assert!(IDLE_CONNECTION_TIMEOUT > IDENTIFY_INTERVAL);
        assert!(IDLE_CONNECTION_TIMEOUT <= Duration::from_secs(60 * 60));
    }

    #[test]
    fn inbound_names_must_be_plain_file_names() {
        assert_eq!(inbound_file_name("1f2e-notes.txt"), Some("1f2e-notes.txt"));
        assert_eq!(inbound_file_name("..dots..txt"), Some("..dots..txt"));
        for name in ["", ".", "..", "../x", "/etc/cron.d/x", "a/b", "a\\b", "dir/"] {
            assert_eq!(inbound_file_name(name), None, "{name:?} should be refused");
        }
    }

    #[tokio::test]
    async fn traversal_names_write_nothing() {
        let root = tempfile::tempdir().unwrap();
        let downloads = root.path().join("downloads");
        let absolute = root.path().join("absolute.txt");
        let mut inbound = InboundTransfers::new(downloads.clone());
        let peer = node_peer_id("mallory");

        let names = [
            "../escape.txt".to_string(),
            "../../escape.txt".to_string(),
            absolute.to_string_lossy().into_owned(),
            "nested/inner.txt".to_string(),
            "..".to_string(),
        ];
        for name in names {
            let report = inbound.accept(peer, name.clone(), 0, 3, b"abc".to_vec()).await;
            assert!(report.rejected.is_some(), "{name} was accepted");
            assert!(report.started.is_none());
            assert!(report.finished.is_none());
        }

        assert!(!root.path().join("escape.txt").exists());
        assert!(!absolute.exists());
        assert!(is_empty_dir(&downloads));
        assert_eq!(inbound.open_for(peer), 0);
    }

    #[tokio::test]
    async fn chunks_are_written_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut inbound = InboundTransfers::new(dir.path().to_path_buf());
        let peer = node_peer_id("alice");

        let first = inbound.accept(peer, "r-notes.txt".into(), 0, 6, b"abc".to_vec()).await;
        let progress = first.started.expect("first chunk starts the transfer");
        assert!(first.finished.is_none() && first.rejected.is_none());
        assert_eq!(*progress.borrow(), 0.5);

        let last = inbound.accept(peer, "r-notes.txt".into(), 3, 6, b"def".to_vec()).await;
        assert!(last.started.is_none() && last.rejected.is_none());
        let path = last.finished.unwrap().unwrap();
        assert_eq!(path, dir.path().join("r-notes.txt"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "abcdef");
        assert_eq!(inbound.open_for(peer), 0);
    }

    #[tokio::test]
    async fn bytes_beyond_the_announced_size_fail_the_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let mut inbound = InboundTransfers::new(dir.path().to_path_buf());
        let peer = node_peer_id("alice");

        inbound.accept(peer, "big".into(), 0, 4, b"abc".to_vec()).await;
        let report = inbound.accept(peer, "big".into(), 3, 4, b"defg".to_vec()).await;
        assert!(report.rejected.is_some());
        assert!(matches!(report.finished, Some(Err(MeshError::Resource { .. }))));
        assert!(!dir.path().join("big").exists());

        let late = inbound.accept(peer, "big".into(), 7, 4, b"h".to_vec()).await;
        assert!(late.rejected.is_some() && late.finished.is_none());
    }

    #[tokio::test]
    async fn open_transfers_are_capped_per_node() {
        let dir = tempfile::tempdir().unwrap();
        let mut inbound = InboundTransfers::new(dir.path().to_path_buf());
        let greedy = node_peer_id("greedy");
        let polite = node_peer_id("polite");

        for i in 0..MAX_INBOUND_PER_PEER {
            let report = inbound.accept(greedy, format!("part-{i}"), 0, 10, b"x".to_vec()).await;
            assert!(report.started.is_some());
        }
        let refused = inbound.accept(greedy, "one-more".into(), 0, 10, b"x".to_vec()).await;
        assert!(refused.rejected.is_some() && refused.started.is_none());
        assert!(!dir.path().join("one-more").exists());

        let other = inbound.accept(polite, "hello".into(), 0, 10, b"x".to_vec()).await;
        assert!(other.started.is_some());

        let mut dropped = inbound.drop_peer(greedy).await;
        dropped.sort();
        assert_eq!(dropped.len(), MAX_INBOUND_PER_PEER);
        assert_eq!(dropped[0], "part-0");
        assert_eq!(inbound.open_for(greedy), 0);
        assert_eq!(inbound.open_for(polite), 1);
        assert!(!dir.path().join("part-0").exists());
    }

    #[tokio::test]
    async fn existing_files_are_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keep.txt"), "original").unwrap();
        let mut inbound = InboundTransfers::new(dir.path().to_path_buf());

        let report = inbound.accept(node_peer_id("alice"), "keep.txt".into(), 0, 3, b"new".to_vec()).await;
        assert!(report.rejected.is_some() && report.started.is_none());
        assert_eq!(std::fs::read_to_string(dir.path().join("keep.txt")).unwrap(), "original");
    }

    #[test]
    fn wire_requests_are_tagged() {
        let json = serde_json::to_value(WireRequest::Invite { context: None }).unwrap();
        assert_eq!(json["kind"], "invite");
        let json = serde_json::to_value(WireResponse::Invitation { accepted: true }).unwrap();
        assert_eq!(json["kind"], "invitation");
        assert_eq!(json["accepted"], true);
    }
}
