use thiserror::Error;

/// Unified error type for the meshkit transport layer.
#[derive(Error, Debug)]
pub enum MeshError {
    // ── Transport errors ───────────────────────────────────────
    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to start advertising: {0}")]
    AdvertisingFailed(String),

    #[error("failed to start browsing for peers: {0}")]
    BrowsingFailed(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("peer not found: {0}")]
    PeerNotFound(String),

    // ── Codec errors ───────────────────────────────────────────
    #[error("cannot encode message of type '{type_tag}': {reason}")]
    Encoding { type_tag: String, reason: String },

    #[error("cannot decode message of type '{type_tag}': {reason}")]
    Decoding { type_tag: String, reason: String },

    // ── Invitation errors ──────────────────────────────────────
    #[error("failed to connect to peer {peer}: {reason}")]
    InvitationFailed { peer: String, reason: String },

    #[error("invitation to peer {0} timed out")]
    InvitationTimedOut(String),

    // ── Resource errors ────────────────────────────────────────
    #[error("resource transfer failed: {resource}: {reason}")]
    Resource { resource: String, reason: String },

    #[error("resource must be a local file, remote locations are not supported: {0}")]
    NotALocalFile(String),

    #[error("a resource consumer is already registered for this transceiver")]
    ResourceConsumerAlreadyRegistered,

    #[error("received resource {0} but no resource consumer is registered")]
    ResourceConsumerMissing(String),

    // ── Identity errors ────────────────────────────────────────
    #[error("identity error: {0}")]
    Identity(String),

    // ── Config errors ──────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    #[error("config validation failed: {field}: {reason}")]
    ConfigValidation { field: String, reason: String },

    // ── Lifecycle ──────────────────────────────────────────────
    #[error("transceiver has shut down")]
    Shutdown,

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl MeshError {
    /// Whether this error means the caller broke an API precondition,
    /// as opposed to a runtime failure of the network or the remote peer.
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            MeshError::NotALocalFile(_)
                | MeshError::ResourceConsumerAlreadyRegistered
                | MeshError::ResourceConsumerMissing(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;
