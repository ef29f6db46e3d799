//! Resource (file) transfers: progress streams and per-transfer bookkeeping.
//!
//! Outbound uploads yield a [`ProgressStream`]. Inbound downloads are handed
//! to the single consumer registered with `receive_resources`, one
//! [`ResourceEventStream`] per transfer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures::Stream;
use meshkit_core::{MeshError, Peer, Result};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, warn};
use url::Url;

use crate::transport::{ResourceUpload, Transport};

// ── Locations ──────────────────────────────────────────────────

/// What the application asked to send: a path or a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceLocation {
    Path(PathBuf),
    Url(Url),
}

impl ResourceLocation {
    /// Interpret a string as a URL when it has a scheme, otherwise as a path.
    pub fn parse(s: &str) -> Self {
        match Url::parse(s) {
            // One-letter schemes are Windows drive letters.
            Ok(url) if url.scheme().len() > 1 => Self::Url(url),
            _ => Self::Path(PathBuf::from(s)),
        }
    }

    /// Resolve to an existing regular file on the local filesystem.
    pub fn to_local_file(&self) -> Result<PathBuf> {
        let path = match self {
            Self::Path(path) => path.clone(),
            Self::Url(url) if url.scheme() == "file" => url
                .to_file_path()
                .map_err(|_| MeshError::NotALocalFile(url.to_string()))?,
            Self::Url(url) => return Err(MeshError::NotALocalFile(url.to_string())),
        };
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(path),
            _ => Err(MeshError::NotALocalFile(path.display().to_string())),
        }
    }
}

impl From<PathBuf> for ResourceLocation {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<&Path> for ResourceLocation {
    fn from(path: &Path) -> Self {
        Self::Path(path.to_path_buf())
    }
}

impl From<Url> for ResourceLocation {
    fn from(url: Url) -> Self {
        Self::Url(url)
    }
}

impl From<&str> for ResourceLocation {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

/// Transfer-unique resource name: a fresh UUID plus the file name.
pub fn resource_name(path: &Path) -> String {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "resource".into());
    format!("{}-{}", uuid::Uuid::new_v4(), file_name)
}

// ── Streams ────────────────────────────────────────────────────

/// One event of an inbound transfer.
#[derive(Debug)]
pub enum ResourceEvent {
    Progress { name: String, fraction: f64 },
    /// Always the last event of a transfer.
    Completion { name: String, result: Result<PathBuf> },
}

impl ResourceEvent {
    pub fn name(&self) -> &str {
        match self {
            Self::Progress { name, .. } | Self::Completion { name, .. } => name,
        }
    }
}

/// Events of a single inbound transfer. Dropping it cancels observation.
pub struct ResourceEventStream {
    name: String,
    peer: Peer,
    rx: mpsc::UnboundedReceiver<ResourceEvent>,
}

impl ResourceEventStream {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The sending peer.
    pub fn peer(&self) -> &Peer {
        &self.peer
    }
}

impl Stream for ResourceEventStream {
    type Item = ResourceEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl std::fmt::Debug for ResourceEventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceEventStream")
            .field("name", &self.name)
            .field("peer", &self.peer.id())
            .finish()
    }
}

/// Every inbound transfer for the lifetime of the transceiver.
pub struct IncomingResources {
    rx: mpsc::UnboundedReceiver<ResourceEventStream>,
}

impl Stream for IncomingResources {
    type Item = ResourceEventStream;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Upload progress. Ends after the last sample on success; yields one
/// `Err` and ends on failure. Dropping it stops observing the upload.
pub struct ProgressStream {
    name: String,
    rx: mpsc::UnboundedReceiver<Result<f64>>,
}

impl ProgressStream {
    pub(crate) fn channel(name: String) -> (mpsc::UnboundedSender<Result<f64>>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { name, rx })
    }

    /// The transfer-unique name the resource is sent under.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Stream for ProgressStream {
    type Item = Result<f64>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

// ── Progress forwarding ────────────────────────────────────────

/// Clamps samples to [0, 1] and drops anything that would go backwards.
#[derive(Debug, Default)]
struct Monotonic {
    last: Option<f64>,
}

impl Monotonic {
    fn starting_at(value: f64) -> Self {
        Self { last: Some(value) }
    }

    fn accept(&mut self, sample: f64) -> Option<f64> {
        if !sample.is_finite() {
            return None;
        }
        let sample = sample.clamp(0.0, 1.0);
        match self.last {
            Some(last) if sample <= last => None,
            _ => {
                self.last = Some(sample);
                Some(sample)
            }
        }
    }

    fn take_latest(&mut self, progress: &mut watch::Receiver<f64>) -> Option<f64> {
        let sample = *progress.borrow_and_update();
        self.accept(sample)
    }
}

type ReleaseFn = Box<dyn FnOnce(String, u64) + Send>;

async fn forward_inbound(
    name: String,
    id: u64,
    mut progress: watch::Receiver<f64>,
    tx: mpsc::UnboundedSender<ResourceEvent>,
    mut finish: oneshot::Receiver<Result<PathBuf>>,
    on_release: ReleaseFn,
) {
    let mut monotonic = Monotonic::starting_at(0.0);
    let mut progress_open = true;

    // Samples reported before we subscribed.
    if let Some(fraction) = monotonic.take_latest(&mut progress) {
        let _ = tx.send(ResourceEvent::Progress { name: name.clone(), fraction });
    }

    loop {
        tokio::select! {
            biased;
            _ = tx.closed() => {
                debug!(resource = %name, "resource consumer stopped listening");
                break;
            }
            result = &mut finish => {
                if let Some(fraction) = monotonic.take_latest(&mut progress) {
                    let _ = tx.send(ResourceEvent::Progress { name: name.clone(), fraction });
                }
                if let Ok(result) = result {
                    let _ = tx.send(ResourceEvent::Completion { name, result });
                }
                return;
            }
            changed = progress.changed(), if progress_open => match changed {
                Ok(()) => {
                    if let Some(fraction) = monotonic.take_latest(&mut progress) {
                        let _ = tx.send(ResourceEvent::Progress { name: name.clone(), fraction });
                    }
                }
                Err(_) => progress_open = false,
            },
        }
    }
    on_release(name, id);
}

/// Drive one upload: start it on the transport, then forward its progress
/// into `tx` until it completes, fails or nobody is listening.
pub(crate) async fn run_upload(
    transport: Arc<dyn Transport>,
    path: PathBuf,
    name: String,
    peer: Peer,
    id: u64,
    tx: mpsc::UnboundedSender<Result<f64>>,
    on_release: ReleaseFn,
) {
    let ResourceUpload {
        mut progress,
        mut completion,
    } = match transport.send_resource(&path, &name, peer.identity()).await {
        Ok(upload) => upload,
        Err(e) => {
            error!(resource = %name, peer = %peer, error = %e, "failed to start resource upload");
            let _ = tx.send(Err(e));
            on_release(name, id);
            return;
        }
    };

    let mut monotonic = Monotonic::default();
    let mut progress_open = true;
    if let Some(fraction) = monotonic.take_latest(&mut progress) {
        let _ = tx.send(Ok(fraction));
    }

    loop {
        tokio::select! {
            biased;
            _ = tx.closed() => {
                debug!(resource = %name, "upload progress no longer observed");
                break;
            }
            result = &mut completion => {
                if let Some(fraction) = monotonic.take_latest(&mut progress) {
                    let _ = tx.send(Ok(fraction));
                }
                match result {
                    Ok(Ok(())) => debug!(resource = %name, peer = %peer, "resource upload finished"),
                    Ok(Err(e)) => {
                        warn!(resource = %name, peer = %peer, error = %e, "resource upload failed");
                        let _ = tx.send(Err(e));
                    }
                    Err(_) => {
                        let _ = tx.send(Err(MeshError::Resource {
                            resource: name.clone(),
                            reason: "transport abandoned the upload".into(),
                        }));
                    }
                }
                break;
            }
            changed = progress.changed(), if progress_open => match changed {
                Ok(()) => {
                    if let Some(fraction) = monotonic.take_latest(&mut progress) {
                        let _ = tx.send(Ok(fraction));
                    }
                }
                Err(_) => progress_open = false,
            },
        }
    }
    on_release(name, id);
}

// ── Coordinator ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// A live transfer, as reported by `active_transfers`.
#[derive(Debug, Clone)]
pub struct TransferInfo {
    pub name: String,
    pub direction: Direction,
    pub peer: Peer,
    pub started_at: DateTime<Utc>,
}

struct Transfer {
    id: u64,
    direction: Direction,
    peer: Peer,
    started_at: DateTime<Utc>,
    finish: Option<oneshot::Sender<Result<PathBuf>>>,
}

#[derive(Default)]
struct CoordinatorState {
    registered: bool,
    consumer: Option<mpsc::UnboundedSender<ResourceEventStream>>,
    transfers: HashMap<String, Transfer>,
    next_id: u64,
}

/// Bookkeeping for every live transfer, keyed by resource name.
#[derive(Default)]
pub struct ResourceCoordinator {
    state: Mutex<CoordinatorState>,
}

impl ResourceCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the one inbound consumer this coordinator will ever have.
    pub fn register_consumer(&self) -> Result<IncomingResources> {
        let mut state = self.state.lock();
        if state.registered {
            return Err(MeshError::ResourceConsumerAlreadyRegistered);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.registered = true;
        state.consumer = Some(tx);
        Ok(IncomingResources { rx })
    }

    pub fn has_consumer(&self) -> bool {
        self.state.lock().consumer.is_some()
    }

    /// Begin an inbound transfer and hand its stream to the consumer.
    ///
    /// Receiving a resource without a registered consumer is a usage error:
    /// it panics in debug builds and is logged and ignored otherwise.
    pub fn start_inbound<F>(
        &self,
        name: &str,
        peer: Peer,
        progress: watch::Receiver<f64>,
        on_release: F,
    ) -> Result<()>
    where
        F: FnOnce(String, u64) + Send + 'static,
    {
        let mut state = self.state.lock();
        debug_assert!(
            state.registered,
            "received resource {name} but no resource consumer is registered; call receive_resources() first"
        );
        let Some(consumer) = state.consumer.clone() else {
            error!(resource = %name, peer = %peer, "received a resource but no resource consumer is registered");
            return Err(MeshError::ResourceConsumerMissing(name.to_string()));
        };
        if state.transfers.contains_key(name) {
            warn!(resource = %name, "ignoring duplicate start for a live transfer");
            return Err(MeshError::Resource {
                resource: name.to_string(),
                reason: "a transfer with this name is already in progress".into(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(ResourceEvent::Progress {
            name: name.to_string(),
            fraction: 0.0,
        });
        let stream = ResourceEventStream {
            name: name.to_string(),
            peer: peer.clone(),
            rx,
        };
        if consumer.send(stream).is_err() {
            warn!(resource = %name, "resource consumer was dropped, ignoring transfer");
            state.consumer = None;
            return Err(MeshError::ResourceConsumerMissing(name.to_string()));
        }

        state.next_id += 1;
        let id = state.next_id;
        let (finish_tx, finish_rx) = oneshot::channel();
        state.transfers.insert(
            name.to_string(),
            Transfer {
                id,
                direction: Direction::Inbound,
                peer,
                started_at: Utc::now(),
                finish: Some(finish_tx),
            },
        );
        drop(state);

        debug!(resource = %name, "inbound transfer started");
        tokio::spawn(forward_inbound(
            name.to_string(),
            id,
            progress,
            tx,
            finish_rx,
            Box::new(on_release),
        ));
        Ok(())
    }

    /// Deliver the terminal result of an inbound transfer.
    pub fn finish_inbound(&self, name: &str, result: Result<PathBuf>) -> bool {
        let transfer = self.state.lock().transfers.remove(name);
        match transfer {
            Some(Transfer {
                finish: Some(finish),
                ..
            }) => {
                let _ = finish.send(result);
                true
            }
            _ => {
                warn!(resource = %name, "finished a transfer nobody is tracking");
                false
            }
        }
    }

    /// Record an outbound upload. Returns its bookkeeping id.
    pub fn track_outbound(&self, name: &str, peer: Peer) -> u64 {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.transfers.insert(
            name.to_string(),
            Transfer {
                id,
                direction: Direction::Outbound,
                peer,
                started_at: Utc::now(),
                finish: None,
            },
        );
        id
    }

    /// Forget a transfer that ended or was cancelled.
    pub fn release(&self, name: &str, id: u64) -> bool {
        let mut state = self.state.lock();
        if state.transfers.get(name).is_some_and(|t| t.id == id) {
            state.transfers.remove(name);
            debug!(resource = %name, "released transfer");
            true
        } else {
            false
        }
    }

    pub fn active_transfers(&self) -> Vec<TransferInfo> {
        self.state
            .lock()
            .transfers
            .iter()
            .map(|(name, t)| TransferInfo {
                name: name.clone(),
                direction: t.direction,
                peer: t.peer.clone(),
                started_at: t.started_at,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use meshkit_core::NodeIdentity;
    use std::time::Duration;

    fn peer() -> Peer {
        Peer::new(NodeIdentity::generate("sender"), None)
    }

    fn progress(ev: &ResourceEvent) -> Option<f64> {
        match ev {
            ResourceEvent::Progress { fraction, .. } => Some(*fraction),
            _ => None,
        }
    }

    // ── Location tests ─────────────────────────────────────────

    #[test]
    fn parse_distinguishes_urls_and_paths() {
        assert!(matches!(ResourceLocation::parse("/tmp/a.txt"), ResourceLocation::Path(_)));
        assert!(matches!(ResourceLocation::parse("file:///tmp/a.txt"), ResourceLocation::Url(_)));
        assert!(matches!(ResourceLocation::parse("https://x.org/a"), ResourceLocation::Url(_)));
        assert!(matches!(ResourceLocation::parse("relative/a.txt"), ResourceLocation::Path(_)));
    }

    #[test]
    fn remote_urls_are_not_local_files() {
        let result = ResourceLocation::parse("https://example.com/a.png").to_local_file();
        assert!(matches!(result, Err(MeshError::NotALocalFile(_))));
    }

    #[test]
    fn directories_and_missing_files_are_not_local_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ResourceLocation::from(dir.path()).to_local_file().is_err());
        assert!(ResourceLocation::from(dir.path().join("missing")).to_local_file().is_err());
    }

    #[test]
    fn file_url_resolves_to_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.jpg");
        std::fs::write(&path, b"jpeg").unwrap();
        let url = Url::from_file_path(&path).unwrap();
        assert_eq!(ResourceLocation::from(url).to_local_file().unwrap(), path);
    }

    #[test]
    fn resource_names_are_unique_and_keep_file_name() {
        let a = resource_name(Path::new("/tmp/photo.jpg"));
        let b = resource_name(Path::new("/tmp/photo.jpg"));
        assert_ne!(a, b);
        assert!(a.ends_with("-photo.jpg"));
    }

    // ── Monotonic tests ────────────────────────────────────────

    #[test]
    fn monotonic_clamps_and_drops_regressions() {
        let mut m = Monotonic::starting_at(0.0);
        assert_eq!(m.accept(0.0), None);
        assert_eq!(m.accept(0.4), Some(0.4));
        assert_eq!(m.accept(0.2), None);
        assert_eq!(m.accept(f64::NAN), None);
        assert_eq!(m.accept(7.0), Some(1.0));
        assert_eq!(m.accept(1.0), None);
    }

    // ── Coordinator tests ──────────────────────────────────────

    #[test]
    fn consumer_can_only_be_registered_once() {
        let coordinator = ResourceCoordinator::new();
        let first = coordinator.register_consumer();
        assert!(first.is_ok());
        assert!(matches!(
            coordinator.register_consumer(),
            Err(MeshError::ResourceConsumerAlreadyRegistered)
        ));
        drop(first);
        assert!(coordinator.register_consumer().is_err());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "no resource consumer is registered")]
    fn start_without_consumer_asserts_in_debug() {
        let coordinator = ResourceCoordinator::new();
        let (_tx, rx) = watch::channel(0.0);
        let _ = coordinator.start_inbound("x", peer(), rx, |_, _| {});
    }

    #[tokio::test]
    async fn inbound_yields_zero_first_even_when_already_complete() {
        let coordinator = ResourceCoordinator::new();
        let mut incoming = coordinator.register_consumer().unwrap();
        let (progress_tx, progress_rx) = watch::channel(1.0);

        coordinator
            .start_inbound("X", peer(), progress_rx, |_, _| {})
            .unwrap();
        let mut stream = incoming.next().await.unwrap();
        assert_eq!(stream.name(), "X");

        let first = stream.next().await.unwrap();
        assert_eq!(progress(&first), Some(0.0));
        let second = stream.next().await.unwrap();
        assert_eq!(progress(&second), Some(1.0));

        assert!(coordinator.finish_inbound("X", Ok(PathBuf::from("/tmp/X"))));
        match stream.next().await.unwrap() {
            ResourceEvent::Completion { name, result } => {
                assert_eq!(name, "X");
                assert_eq!(result.unwrap(), PathBuf::from("/tmp/X"));
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert!(stream.next().await.is_none());
        drop(progress_tx);
    }

    #[tokio::test]
    async fn inbound_failure_is_terminal_event() {
        let coordinator = ResourceCoordinator::new();
        let mut incoming = coordinator.register_consumer().unwrap();
        let (progress_tx, progress_rx) = watch::channel(0.0);
        coordinator
            .start_inbound("Y", peer(), progress_rx, |_, _| {})
            .unwrap();
        let mut stream = incoming.next().await.unwrap();
        assert_eq!(progress(&stream.next().await.unwrap()), Some(0.0));

        progress_tx.send(0.5).unwrap();
        assert_eq!(progress(&stream.next().await.unwrap()), Some(0.5));

        coordinator.finish_inbound(
            "Y",
            Err(MeshError::Resource {
                resource: "Y".into(),
                reason: "peer went away".into(),
            }),
        );
        let last = stream.next().await.unwrap();
        assert!(matches!(last, ResourceEvent::Completion { result: Err(_), .. }));
        assert!(stream.next().await.is_none());
        assert!(coordinator.active_transfers().is_empty());
    }

    #[tokio::test]
    async fn dropping_stream_releases_transfer() {
        let coordinator = Arc::new(ResourceCoordinator::new());
        let mut incoming = coordinator.register_consumer().unwrap();
        let (_progress_tx, progress_rx) = watch::channel(0.0);
        let (released_tx, released_rx) = oneshot::channel();

        let weak = Arc::downgrade(&coordinator);
        coordinator
            .start_inbound("Z", peer(), progress_rx, move |name, id| {
                if let Some(c) = weak.upgrade() {
                    c.release(&name, id);
                }
                let _ = released_tx.send(name);
            })
            .unwrap();
        assert_eq!(coordinator.active_transfers().len(), 1);

        let stream = incoming.next().await.unwrap();
        drop(stream);

        let name = tokio::time::timeout(Duration::from_secs(2), released_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(name, "Z");
        assert!(coordinator.active_transfers().is_empty());
    }

    #[test]
    fn outbound_transfers_are_listed_until_released() {
        let coordinator = ResourceCoordinator::new();
        let before = Utc::now();
        let id = coordinator.track_outbound("report.pdf", peer());

        let active = coordinator.active_transfers();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].direction, Direction::Outbound);
        assert!(active[0].started_at >= before);

        assert!(!coordinator.release("report.pdf", id + 1));
        assert!(coordinator.release("report.pdf", id));
        assert!(coordinator.active_transfers().is_empty());
    }

    #[tokio::test]
    async fn duplicate_live_name_is_rejected() {
        let coordinator = ResourceCoordinator::new();
        let _incoming = coordinator.register_consumer().unwrap();
        let (_a, rx_a) = watch::channel(0.0);
        let (_b, rx_b) = watch::channel(0.0);
        coordinator.start_inbound("dup", peer(), rx_a, |_, _| {}).unwrap();
        assert!(coordinator.start_inbound("dup", peer(), rx_b, |_, _| {}).is_err());
    }

    #[test]
    fn release_ignores_stale_ids() {
        let coordinator = ResourceCoordinator::new();
        let id = coordinator.track_outbound("up", peer());
        assert!(!coordinator.release("up", id + 1));
        assert!(coordinator.release("up", id));
        assert!(!coordinator.release("up", id));
    }
}
