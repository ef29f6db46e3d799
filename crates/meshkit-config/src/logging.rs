use meshkit_core::MeshError;
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use crate::schema::LoggingConfig;

/// Output layout of the fmt subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Pretty,
    Json,
    Compact,
    /// The fmt default, for names `validate()` would have flagged.
    Full,
}

impl LogFormat {
    fn from_name(name: &str) -> Self {
        match name {
            "pretty" => Self::Pretty,
            "json" => Self::Json,
            "compact" => Self::Compact,
            _ => Self::Full,
        }
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `level_override`, which wins over `config.level`.
/// Fails if a global subscriber is already installed or the log file
/// cannot be opened.
pub fn init_tracing(
    config: &LoggingConfig,
    level_override: Option<&str>,
) -> meshkit_core::Result<()> {
    let level = level_override.unwrap_or(&config.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let writer = match &config.file {
        Some(path) => {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(config.file.is_none());

    let result = match LogFormat::from_name(&config.format) {
        LogFormat::Json => builder.json().with_target(true).try_init(),
        LogFormat::Compact => builder.compact().with_target(false).try_init(),
        LogFormat::Pretty => builder.pretty().with_target(false).try_init(),
        LogFormat::Full => builder.with_target(false).try_init(),
    };

    result.map_err(|e| MeshError::Config(format!("failed to install tracing subscriber: {e}")))
}
