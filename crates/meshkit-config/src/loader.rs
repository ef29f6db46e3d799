use meshkit_core::MeshError;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::schema::{InvitationMode, MeshConfig};

/// Loads and reloads the meshkit configuration.
pub struct ConfigLoader {
    config: Arc<RwLock<MeshConfig>>,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > MESHKIT_CONFIG env > ~/.meshkit/meshkit.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("MESHKIT_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".meshkit")
            .join("meshkit.toml")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> meshkit_core::Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            Self::read_file(&config_path)?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            MeshConfig::default()
        };

        let config = Self::apply_env_overrides(config)?;
        Self::check(&config)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Get a read snapshot of the current config.
    pub fn get(&self) -> MeshConfig {
        self.config.read().clone()
    }

    /// Get a shared reference for subscription.
    pub fn shared(&self) -> Arc<RwLock<MeshConfig>> {
        Arc::clone(&self.config)
    }

    /// Path the config was resolved to.
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Reload the config from disk. The current config is kept on any error.
    pub fn reload(&self) -> meshkit_core::Result<()> {
        if !self.config_path.exists() {
            return Err(MeshError::Config(format!(
                "config file not found: {}",
                self.config_path.display()
            )));
        }
        let new_config = Self::read_file(&self.config_path)?;
        let new_config = Self::apply_env_overrides(new_config)?;
        Self::check(&new_config)?;
        *self.config.write() = new_config;
        info!("configuration reloaded");
        Ok(())
    }

    fn read_file(path: &Path) -> meshkit_core::Result<MeshConfig> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str::<MeshConfig>(&raw)
            .map_err(|e| MeshError::Config(format!("failed to parse {}: {}", path.display(), e)))
    }

    /// Log warnings, fail on errors.
    fn check(config: &MeshConfig) -> meshkit_core::Result<()> {
        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
                Ok(())
            }
            Err(e) => Err(MeshError::Config(e)),
        }
    }

    /// Apply env var overrides (MESHKIT_PEER_NAME, MESHKIT_LOG_LEVEL, etc.)
    pub fn apply_env_overrides(mut config: MeshConfig) -> meshkit_core::Result<MeshConfig> {
        if let Ok(v) = std::env::var("MESHKIT_SERVICE_TYPE") {
            config.service.service_type = v;
        }
        if let Ok(v) = std::env::var("MESHKIT_PEER_NAME") {
            config.service.peer_name = v;
        }
        if let Ok(v) = std::env::var("MESHKIT_INVITATION") {
            config.invitation.mode =
                v.parse::<InvitationMode>()
                    .map_err(|reason| MeshError::ConfigValidation {
                        field: "MESHKIT_INVITATION".into(),
                        reason,
                    })?;
        }
        if let Ok(v) = std::env::var("MESHKIT_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Ok(v) = std::env::var("MESHKIT_DOWNLOAD_DIR") {
            config.transfers.download_dir = PathBuf::from(v);
        }
        Ok(config)
    }
}
