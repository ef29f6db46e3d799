use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

/// Key/value pairs a node advertises alongside its presence.
pub type DiscoveryInfo = BTreeMap<String, String>;

/// Maximum length of a display name, in UTF-8 bytes.
pub const MAX_PEER_NAME_BYTES: usize = 63;

/// The platform-level identity of a node.
///
/// `uid` is whatever the platform uses to tell nodes apart (a random token for
/// the in-memory network, a libp2p `PeerId` for the p2p binding). It never
/// changes for the lifetime of the identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub name: String,
    pub uid: String,
}

impl NodeIdentity {
    /// Create a fresh identity with a random uid.
    pub fn generate(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uid: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Stable peer id: BLAKE3 over the length-prefixed canonical fields.
    pub fn peer_id(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for field in [self.name.as_bytes(), self.uid.as_bytes()] {
            hasher.update(&(field.len() as u64).to_le_bytes());
            hasher.update(field);
        }
        hasher.finalize().to_hex().to_string()
    }
}

/// A remote node as seen by the local transceiver.
///
/// Two `Peer` values are equal when their ids are equal, even if the name,
/// discovery info or connection flag differ (e.g. after re-discovery). Use
/// [`Peer::same_state`] to compare every field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    id: String,
    identity: NodeIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    discovery_info: Option<DiscoveryInfo>,
    #[serde(default)]
    is_connected: bool,
}

impl Peer {
    pub fn new(identity: NodeIdentity, discovery_info: Option<DiscoveryInfo>) -> Self {
        Self {
            id: identity.peer_id(),
            identity,
            discovery_info,
            is_connected: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Display name. Not unique.
    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn discovery_info(&self) -> Option<&DiscoveryInfo> {
        self.discovery_info.as_ref()
    }

    /// Whether a session with this peer is currently established.
    pub fn is_connected(&self) -> bool {
        self.is_connected
    }

    /// The underlying platform identity, used by transports for routing.
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.is_connected = connected;
    }

    pub fn with_connected(mut self, connected: bool) -> Self {
        self.is_connected = connected;
        self
    }

    pub fn with_discovery_info(mut self, discovery_info: Option<DiscoveryInfo>) -> Self {
        self.discovery_info = discovery_info;
        self
    }

    /// Full-state comparison, including the fields ignored by `==`.
    pub fn same_state(&self, other: &Peer) -> bool {
        self.id == other.id
            && self.identity == other.identity
            && self.discovery_info == other.discovery_info
            && self.is_connected == other.is_connected
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.identity.name, &self.id[..12.min(self.id.len())])
    }
}

/// Compare two peer lists field by field, in order.
pub fn same_peer_list(a: &[Peer], b: &[Peer]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_state(y))
}

/// Encryption level requested from the platform when negotiating sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionPreference {
    #[default]
    None,
    Optional,
    Required,
}
