//! # meshkit-transceiver
//!
//! Peer discovery, sessions and typed messaging between nearby devices.
//!
//! A [`Transceiver`] sits on top of a [`Transport`], the platform service
//! that advertises the local node, browses for others and carries bytes.
//! It keeps the registry of available peers, invites them into a session
//! according to an [`InvitationPolicy`], routes inbound messages to handlers
//! by type, and tracks file transfers with progress.
//!
//! Two transports ship with the crate: [`MemoryNetwork`] for in-process use
//! and tests, and (with the `p2p` feature) a libp2p binding using mDNS
//! discovery over Noise-encrypted TCP.
//!
pub mod adapter;
pub mod codec;
pub mod identity;
pub mod invitation;
pub mod memory;
#[cfg(feature = "p2p")]
pub mod p2p;
pub mod registry;
pub mod resource;
pub mod transceiver;
pub mod transport;

pub use codec::{DispatchTable, Message};
pub use identity::{
    FileIdentityStore, IdentityStore, LOCAL_IDENTITY_KEY, MemoryIdentityStore,
    fetch_or_create_local_identity,
};
pub use invitation::{
    DEFAULT_INVITATION_TIMEOUT, InvitationPolicy, InviteRequest, SecurityPolicy,
};
pub use memory::{MemoryNetwork, MemoryTransport};
#[cfg(feature = "p2p")]
pub use p2p::P2pTransport;
pub use registry::{PeerRegistry, PeerState};
pub use resource::{
    Direction, IncomingResources, ProgressStream, ResourceEvent, ResourceEventStream,
    ResourceLocation, TransferInfo,
};
pub use transceiver::{MessageStream, Transceiver, TransceiverConfig};
pub use transport::{EventSink, SessionSecurity, SessionState, Transport, TransportEvent};
