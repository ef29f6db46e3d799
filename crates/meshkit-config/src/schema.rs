use meshkit_core::{DiscoveryInfo, EncryptionPreference, MAX_PEER_NAME_BYTES};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration, read from `meshkit.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub service: ServiceConfig,
    pub invitation: InvitationConfig,
    pub security: SecurityConfig,
    pub identity: IdentityConfig,
    pub transfers: TransferConfig,
    pub p2p: P2pConfig,
    pub logging: LoggingConfig,
}

// ── Service ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Service type shared by every instance that should discover each other.
    /// Short, ASCII lowercase letters, digits and hyphens.
    pub service_type: String,
    /// Display name shown to nearby peers (at most 63 UTF-8 bytes).
    pub peer_name: String,
    /// Extra key/value pairs advertised alongside this peer.
    pub discovery_info: DiscoveryInfo,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_type: "meshkit".into(),
            peer_name: default_peer_name(),
            discovery_info: DiscoveryInfo::new(),
        }
    }
}

// ── Invitation ─────────────────────────────────────────────────

/// How newly discovered peers are invited into a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvitationMode {
    /// Invite every discovered peer immediately.
    #[default]
    Automatic,
    /// Ask an application callback whether (and how) to invite each peer.
    Custom,
    /// Never invite on discovery; the application calls `invite` itself.
    Manual,
}

impl std::str::FromStr for InvitationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "automatic" | "auto" => Ok(Self::Automatic),
            "custom" => Ok(Self::Custom),
            "manual" | "none" => Ok(Self::Manual),
            other => Err(format!(
                "unknown invitation mode '{other}' (expected automatic, custom or manual)"
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InvitationConfig {
    pub mode: InvitationMode,
    /// How long an automatic invitation waits for the remote peer.
    pub timeout_secs: u64,
}

impl Default for InvitationConfig {
    fn default() -> Self {
        Self {
            mode: InvitationMode::Automatic,
            timeout_secs: 10,
        }
    }
}

// ── Security ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Encryption level requested from the platform.
    pub encryption: EncryptionPreference,
    /// Optional identity material (certificate chain) handed to the platform.
    pub identity_path: Option<PathBuf>,
}

// ── Identity ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Where the local identity is persisted between runs.
    pub store_path: PathBuf,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            store_path: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("meshkit")
                .join("identity.json"),
        }
    }
}

// ── Transfers ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Directory where received resources are written.
    pub download_dir: PathBuf,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_dir: std::env::temp_dir().join("meshkit-downloads"),
        }
    }
}

// ── P2P binding ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
    /// Listen multiaddr for the libp2p binding.
    pub listen: String,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            listen: "/ip4/0.0.0.0/tcp/0".into(),
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Output format: "pretty", "json", "compact".
    pub format: String,
    /// Log file path (None = stderr only).
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
            file: None,
        }
    }
}

/// The machine's host name, trimmed to a valid peer name.
pub fn default_peer_name() -> String {
    let hostname = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| {
            std::process::Command::new("hostname")
                .output()
                .ok()
                .and_then(|o| String::from_utf8(o.stdout).ok())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "meshkit-peer".into())
        });
    truncate_to_bytes(&hostname, MAX_PEER_NAME_BYTES)
}

/// Truncate on a char boundary so the result fits in `max` bytes.
pub fn truncate_to_bytes(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

// ── Validation ─────────────────────────────────────────────────

/// A single config validation issue.
#[derive(Debug)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self.severity {
            WarningSeverity::Error => "error",
            WarningSeverity::Warning => "warning",
            WarningSeverity::Info => "info",
        };
        write!(f, "{}: {}: {}", label, self.field, self.message)?;
        if let Some(ref h) = self.hint {
            write!(f, "\n   ↳ {}", h)?;
        }
        Ok(())
    }
}

impl MeshConfig {
    /// Validate the config and return a list of warnings/errors.
    /// Returns `Err` with all messages joined if any severity is Error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();

        // ── Service type ───
        let service_type = &self.service.service_type;
        if service_type.is_empty() {
            warnings.push(ConfigWarning {
                field: "service.service_type".into(),
                message: "service type is empty".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to a short identifier shared by all peers, e.g. 'chat-demo'".into()),
            });
        } else if !service_type.is_ascii() {
            warnings.push(ConfigWarning {
                field: "service.service_type".into(),
                message: format!("service type '{}' is not ASCII", service_type),
                severity: WarningSeverity::Error,
                hint: Some("Use lowercase ASCII letters, digits and hyphens".into()),
            });
        } else {
            if !service_type
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            {
                warnings.push(ConfigWarning {
                    field: "service.service_type".into(),
                    message: format!("service type '{}' contains unsupported characters", service_type),
                    severity: WarningSeverity::Warning,
                    hint: Some("Some platforms only accept [a-z0-9-]".into()),
                });
            }
            if service_type.len() > 15 {
                warnings.push(ConfigWarning {
                    field: "service.service_type".into(),
                    message: format!("service type is {} characters long", service_type.len()),
                    severity: WarningSeverity::Warning,
                    hint: Some("Keep it at 15 characters or fewer".into()),
                });
            }
        }

        // ── Peer name ───
        let peer_name = &self.service.peer_name;
        if peer_name.is_empty() {
            warnings.push(ConfigWarning {
                field: "service.peer_name".into(),
                message: "peer name is empty".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set a display name, or remove the key to use the host name".into()),
            });
        } else if peer_name.len() > MAX_PEER_NAME_BYTES {
            warnings.push(ConfigWarning {
                field: "service.peer_name".into(),
                message: format!(
                    "peer name is {} bytes, the limit is {}",
                    peer_name.len(),
                    MAX_PEER_NAME_BYTES
                ),
                severity: WarningSeverity::Error,
                hint: None,
            });
        }

        // ── Invitation timeout ───
        if self.invitation.timeout_secs == 0 {
            warnings.push(ConfigWarning {
                field: "invitation.timeout_secs".into(),
                message: "timeout is 0, invitations would expire immediately".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 10".into()),
            });
        } else if self.invitation.timeout_secs > 300 {
            warnings.push(ConfigWarning {
                field: "invitation.timeout_secs".into(),
                message: format!("timeout of {}s is very long", self.invitation.timeout_secs),
                severity: WarningSeverity::Info,
                hint: None,
            });
        }

        if self.invitation.mode == InvitationMode::Custom {
            warnings.push(ConfigWarning {
                field: "invitation.mode".into(),
                message: "custom mode needs an invite callback installed by the application".into(),
                severity: WarningSeverity::Info,
                hint: Some("Without one, discovered peers are not invited".into()),
            });
        }

        // ── Security ───
        if let Some(ref path) = self.security.identity_path
            && !path.exists()
        {
            warnings.push(ConfigWarning {
                field: "security.identity_path".into(),
                message: format!("identity file {} does not exist", path.display()),
                severity: WarningSeverity::Warning,
                hint: None,
            });
        }

        // ── Logging format ───
        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.format".into(),
                message: format!("unknown log format '{}'", self.logging.format),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_formats.join(", "))),
            });
        }

        // ── Logging level ───
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.level".into(),
                message: format!("unknown log level '{}'", self.logging.level),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_levels.join(", "))),
            });
        }

        // Check for hard errors
        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| format!("{}: {}", w.field, w.message))
            .collect();

        if !errors.is_empty() {
            return Err(format!("Configuration errors:\n  • {}", errors.join("\n  • ")));
        }

        Ok(warnings)
    }
}
