#[cfg(test)]
mod tests {
    use meshkit_config::ConfigLoader;
    use meshkit_config::schema::*;
    use meshkit_core::{EncryptionPreference, MeshError};
    use std::io::Write;

    // ── Default tests ──────────────────────────────────────────

    #[test]
    fn test_mesh_config_defaults() {
        let config = MeshConfig::default();
        assert_eq!(config.service.service_type, "meshkit");
        assert!(!config.service.peer_name.is_empty());
        assert!(config.service.peer_name.len() <= 63);
        assert!(config.service.discovery_info.is_empty());
        assert_eq!(config.security.encryption, EncryptionPreference::None);
        assert!(config.security.identity_path.is_none());
    }

    #[test]
    fn test_invitation_config_defaults() {
        let config = InvitationConfig::default();
        assert_eq!(config.mode, InvitationMode::Automatic);
        assert_eq!(config.timeout_secs, 10);
    }

    #[test]
    fn test_identity_config_defaults() {
        let config = IdentityConfig::default();
        assert!(config.store_path.ends_with("meshkit/identity.json"));
    }

    #[test]
    fn test_p2p_config_defaults() {
        let config = P2pConfig::default();
        assert_eq!(config.listen, "/ip4/0.0.0.0/tcp/0");
    }

    #[test]
    fn test_logging_config_defaults() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, "pretty");
        assert!(config.file.is_none());
    }

    #[test]
    fn test_default_config_is_valid() {
        let warnings = MeshConfig::default().validate().unwrap();
        assert!(warnings.iter().all(|w| w.severity != WarningSeverity::Error));
    }

    // ── TOML roundtrip tests ───────────────────────────────────

    #[test]
    fn test_config_toml_roundtrip() {
        let mut config = MeshConfig::default();
        config
            .service
            .discovery_info
            .insert("room".into(), "kitchen".into());
        config.invitation.mode = InvitationMode::Manual;
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let restored: MeshConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(restored.service.service_type, config.service.service_type);
        assert_eq!(restored.service.peer_name, config.service.peer_name);
        assert_eq!(restored.service.discovery_info["room"], "kitchen");
        assert_eq!(restored.invitation.mode, InvitationMode::Manual);
        assert_eq!(restored.transfers.download_dir, config.transfers.download_dir);
    }

    #[test]
    fn test_partial_toml_applies_defaults() {
        let toml_str = r#"
[service]
service_type = "chat-demo"
peer_name = "kitchen-ipad"

[invitation]
mode = "custom"
"#;
        let config: MeshConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.service.service_type, "chat-demo");
        assert_eq!(config.service.peer_name, "kitchen-ipad");
        assert_eq!(config.invitation.mode, InvitationMode::Custom);
        // Defaults should fill in
        assert_eq!(config.invitation.timeout_secs, 10);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.p2p.listen, "/ip4/0.0.0.0/tcp/0");
    }

    #[test]
    fn test_security_section_parses() {
        let toml_str = r#"
[security]
encryption = "required"
"#;
        let config: MeshConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.security.encryption, EncryptionPreference::Required);
    }

    #[test]
    fn test_unknown_invitation_mode_fails_to_parse() {
        let toml_str = r#"
[invitation]
mode = "sometimes"
"#;
        assert!(toml::from_str::<MeshConfig>(toml_str).is_err());
    }

    #[test]
    fn test_invitation_mode_from_str() {
        assert_eq!("automatic".parse::<InvitationMode>().unwrap(), InvitationMode::Automatic);
        assert_eq!("Manual".parse::<InvitationMode>().unwrap(), InvitationMode::Manual);
        assert_eq!(" custom ".parse::<InvitationMode>().unwrap(), InvitationMode::Custom);
        assert!("sometimes".parse::<InvitationMode>().is_err());
    }

    // ── Validation tests ───────────────────────────────────────

    #[test]
    fn test_validation_rejects_long_peer_name() {
        let mut config = MeshConfig::default();
        config.service.peer_name = "x".repeat(64);
        let err = config.validate().unwrap_err();
        assert!(err.contains("service.peer_name"));

        config.service.peer_name = "x".repeat(63);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_counts_bytes_not_chars() {
        let mut config = MeshConfig::default();
        // 32 two-byte characters = 64 bytes.
        config.service.peer_name = "é".repeat(32);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_empty_peer_name() {
        let mut config = MeshConfig::default();
        config.service.peer_name = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_non_ascii_service_type() {
        let mut config = MeshConfig::default();
        config.service.service_type = "kaffeé".into();
        let err = config.validate().unwrap_err();
        assert!(err.contains("service.service_type"));
    }

    #[test]
    fn test_validation_rejects_empty_service_type() {
        let mut config = MeshConfig::default();
        config.service.service_type = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_warns_on_long_service_type() {
        let mut config = MeshConfig::default();
        config.service.service_type = "a-very-long-service-type".into();
        let warnings = config.validate().unwrap();
        assert!(warnings.iter().any(|w| w.field == "service.service_type"
            && w.severity == WarningSeverity::Warning));
    }

    #[test]
    fn test_validation_warns_on_uppercase_service_type() {
        let mut config = MeshConfig::default();
        config.service.service_type = "Chat".into();
        let warnings = config.validate().unwrap();
        assert!(warnings.iter().any(|w| w.field == "service.service_type"));
    }

    #[test]
    fn test_validation_rejects_zero_timeout() {
        let mut config = MeshConfig::default();
        config.invitation.timeout_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.contains("invitation.timeout_secs"));
    }

    #[test]
    fn test_validation_warns_on_unknown_log_settings() {
        let mut config = MeshConfig::default();
        config.logging.level = "loud".into();
        config.logging.format = "xml".into();
        let warnings = config.validate().unwrap();
        assert!(warnings.iter().any(|w| w.field == "logging.level"));
        assert!(warnings.iter().any(|w| w.field == "logging.format"));
    }

    #[test]
    fn test_warning_display_includes_hint() {
        let warning = ConfigWarning {
            field: "logging.format".into(),
            message: "unknown log format 'xml'".into(),
            severity: WarningSeverity::Warning,
            hint: Some("Valid values: pretty, json, compact".into()),
        };
        let shown = warning.to_string();
        assert!(shown.starts_with("warning: logging.format"));
        assert!(shown.contains("Valid values"));
    }

    #[test]
    fn test_truncate_to_bytes_respects_char_boundaries() {
        assert_eq!(truncate_to_bytes("short", 63), "short");
        let truncated = truncate_to_bytes(&"é".repeat(40), 63);
        assert_eq!(truncated.len(), 62);
        assert!(truncated.chars().all(|c| c == 'é'));
    }

    // ── Loader tests ───────────────────────────────────────────

    #[test]
    fn test_loader_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nonexistent.toml");
        let loader = ConfigLoader::load(Some(&path)).unwrap();
        assert_eq!(loader.path(), path.as_path());
        assert_eq!(loader.get().invitation.timeout_secs, 10);
    }

    #[test]
    fn test_loader_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meshkit.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
[service]
service_type = "files"
peer_name = "desk"

[service.discovery_info]
os = "linux"

[transfers]
download_dir = "/tmp/meshkit-test-downloads"
"#
        )
        .unwrap();

        let loader = ConfigLoader::load(Some(&path)).unwrap();
        let config = loader.get();
        assert_eq!(config.service.service_type, "files");
        assert_eq!(config.service.discovery_info["os"], "linux");
        assert_eq!(
            config.transfers.download_dir,
            std::path::PathBuf::from("/tmp/meshkit-test-downloads")
        );
    }

    #[test]
    fn test_loader_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meshkit.toml");
        std::fs::write(&path, "[service]\npeer_name = \"\"\n").unwrap();
        assert!(matches!(
            ConfigLoader::load(Some(&path)),
            Err(MeshError::Config(_))
        ));
    }

    #[test]
    fn test_loader_rejects_malformed_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meshkit.toml");
        std::fs::write(&path, "[service\n").unwrap();
        let err = ConfigLoader::load(Some(&path)).err().unwrap();
        assert!(err.to_string().contains("failed to parse"));
    }

    #[test]
    fn test_loader_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meshkit.toml");
        std::fs::write(&path, "[invitation]\ntimeout_secs = 5\n").unwrap();

        let loader = ConfigLoader::load(Some(&path)).unwrap();
        assert_eq!(loader.get().invitation.timeout_secs, 5);

        std::fs::write(&path, "[invitation]\ntimeout_secs = 30\n").unwrap();
        loader.reload().unwrap();
        assert_eq!(loader.get().invitation.timeout_secs, 30);
        assert_eq!(loader.shared().read().invitation.timeout_secs, 30);
    }

    #[test]
    fn test_loader_reload_keeps_config_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meshkit.toml");
        std::fs::write(&path, "[invitation]\ntimeout_secs = 5\n").unwrap();
        let loader = ConfigLoader::load(Some(&path)).unwrap();

        std::fs::write(&path, "[invitation]\ntimeout_secs = 0\n").unwrap();
        assert!(loader.reload().is_err());
        assert_eq!(loader.get().invitation.timeout_secs, 5);
    }

    #[test]
    fn test_resolve_path_prefers_explicit() {
        let explicit = std::path::Path::new("/etc/meshkit/custom.toml");
        assert_eq!(ConfigLoader::resolve_path(Some(explicit)), explicit);
    }

    // ── JSON roundtrip ─────────────────────────────────────────

    #[test]
    fn test_config_json_roundtrip() {
        let config = MeshConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let restored: MeshConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.logging.format, config.logging.format);
        assert_eq!(restored.identity.store_path, config.identity.store_path);
    }

    // ── Logging ────────────────────────────────────────────────

    #[test]
    fn test_init_tracing_writes_to_file_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("meshkit.log");
        let config = LoggingConfig {
            level: "debug".into(),
            format: "json".into(),
            file: Some(path.clone()),
        };

        meshkit_config::init_tracing(&config, Some("info")).unwrap();
        assert!(path.exists());

        let again = meshkit_config::init_tracing(&config, None);
        assert!(matches!(again, Err(MeshError::Config(_))));
    }
}
