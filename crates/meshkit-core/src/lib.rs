//! # meshkit-core
//!
//! Core types and primitives for the meshkit peer transport layer.
//! This crate defines the shared vocabulary used by every other crate in the workspace:
//! peers and identities, lifecycle events, the wire envelope, and the error type.

pub mod error;
pub mod event;
pub mod message;
pub mod types;

pub use error::{MeshError, Result};
pub use event::{EventBus, PeerEvent};
pub use message::Envelope;
pub use types::*;
