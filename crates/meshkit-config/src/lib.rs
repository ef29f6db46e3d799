//! # meshkit-config
//!
//! Configuration system for meshkit. Reads from `meshkit.toml` and
//! `MESHKIT_*` environment variables, in that precedence order, and
//! installs the tracing subscriber described by the `[logging]` section.

pub mod loader;
pub mod logging;
pub mod schema;

pub use loader::ConfigLoader;
pub use logging::init_tracing;
pub use schema::MeshConfig;
pub use schema::{
    ConfigWarning, IdentityConfig, InvitationConfig, InvitationMode, LoggingConfig, P2pConfig,
    SecurityConfig, ServiceConfig, TransferConfig, WarningSeverity, default_peer_name,
};
