//! Configuration for the kite debug/reload bridge.
//!
//! Every section is optional in the TOML file; missing keys fall back to the
//! defaults documented on each field. Timing values are stored in
//! milliseconds and exposed as [`Duration`]s through accessors.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;

/// Environment variable consulted by [`KiteConfig::load_or_default`] when no
/// explicit path is given.
pub const KITE_CONFIG_ENV_VAR: &str = "KITE_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KiteConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub connect: ConnectConfig,

    #[serde(default)]
    pub reload: ReloadConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Either a simple level (`info`, `debug`, ...) or a full `EnvFilter`
    /// directive string.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Emit logs as JSON lines.
    #[serde(default)]
    pub json: bool,

    /// Mirror logs to stderr.
    #[serde(default = "LoggingConfig::default_stderr")]
    pub stderr: bool,

    /// Append logs to the given file. If the file cannot be opened, file
    /// logging is disabled and the other sinks stay active.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    fn default_stderr() -> bool {
        true
    }

    pub(crate) fn normalize_level_directives(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Self::default_level();
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "trace" => "trace".to_owned(),
            "debug" => "debug".to_owned(),
            "info" => "info".to_owned(),
            "warn" | "warning" => "warn".to_owned(),
            "error" => "error".to_owned(),
            _ => trimmed.to_owned(),
        }
    }

    fn config_env_filter(&self) -> tracing_subscriber::EnvFilter {
        let directives = Self::normalize_level_directives(&self.level);
        tracing_subscriber::EnvFilter::try_new(directives).unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::default()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        })
    }

    /// Effective filter: the configured level merged with `RUST_LOG` when set.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let env_directives = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        let config_directives = Self::normalize_level_directives(&self.level);

        match env_directives {
            Some(env_directives) => {
                let combined = format!("{config_directives},{env_directives}");
                tracing_subscriber::EnvFilter::try_new(combined)
                    .or_else(|_| tracing_subscriber::EnvFilter::try_new(env_directives))
                    .unwrap_or_else(|_| self.config_env_filter())
            }
            None => self.config_env_filter(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            stderr: Self::default_stderr(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectConfig {
    /// How often the endpoint provider is polled while waiting for the
    /// runtime service to publish its address.
    #[serde(default = "ConnectConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl ConnectConfig {
    fn default_poll_interval_ms() -> u64 {
        100
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: Self::default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReloadConfig {
    /// Trigger a hot reload when documents are saved.
    #[serde(default = "ReloadConfig::default_reload_on_save")]
    pub reload_on_save: bool,

    /// Minimum time the "Reloading…" notification stays visible after a
    /// successful reload.
    #[serde(default = "ReloadConfig::default_min_visibility_ms")]
    pub min_visibility_ms: u64,

    /// A save only triggers a reload if the document was written this
    /// recently.
    #[serde(default = "ReloadConfig::default_recently_saved_ms")]
    pub recently_saved_ms: u64,

    /// Upper bound on the external sync script.
    #[serde(default = "ReloadConfig::default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,
}

impl ReloadConfig {
    fn default_reload_on_save() -> bool {
        true
    }

    fn default_min_visibility_ms() -> u64 {
        2_000
    }

    fn default_recently_saved_ms() -> u64 {
        500
    }

    fn default_sync_timeout_ms() -> u64 {
        10_000
    }

    pub fn min_visibility(&self) -> Duration {
        Duration::from_millis(self.min_visibility_ms)
    }

    pub fn recently_saved(&self) -> Duration {
        Duration::from_millis(self.recently_saved_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            reload_on_save: Self::default_reload_on_save(),
            min_visibility_ms: Self::default_min_visibility_ms(),
            recently_saved_ms: Self::default_recently_saved_ms(),
            sync_timeout_ms: Self::default_sync_timeout_ms(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(#[from] toml::de::Error),
}

impl KiteConfig {
    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str(&text)
    }

    /// Load from `path`, else from `$KITE_CONFIG`, else defaults.
    ///
    /// A file that fails to load is logged and replaced by defaults; a broken
    /// config never prevents a session from starting.
    pub fn load_or_default(path: Option<PathBuf>) -> Self {
        let path = path.or_else(|| std::env::var_os(KITE_CONFIG_ENV_VAR).map(PathBuf::from));
        let Some(path) = path else {
            return Self::default();
        };

        match Self::load_from_path(&path) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(
                    target: "kite.config",
                    path = %path.display(),
                    error = %err,
                    "failed to load config; continuing with defaults"
                );
                Self::default()
            }
        }
    }
}

struct FileMakeWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl<'a> MakeWriter<'a> for FileMakeWriter {
    type Writer = FileWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        FileWriter {
            guard: self.file.lock(),
        }
    }
}

struct FileWriter<'a> {
    guard: parking_lot::MutexGuard<'a, std::fs::File>,
}

impl Write for FileWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.guard.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.guard.flush()
    }
}

static TRACING_INIT: Once = Once::new();

/// Installs the global `tracing` subscriber.
///
/// Safe to call multiple times; only the first call has an effect.
pub fn init_tracing_with_config(config: &KiteConfig) {
    init_tracing(&config.logging);
}

pub fn init_tracing(logging: &LoggingConfig) {
    TRACING_INIT.call_once(|| {
        let filter = logging.env_filter();

        let file = logging.file.as_ref().and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });
        let file_open_failed = logging.file.is_some() && file.is_none();

        let mut make_writer = if logging.stderr {
            // `TestWriter` keeps `cargo test` output capture working in debug builds.
            if cfg!(debug_assertions) {
                BoxMakeWriter::new(tracing_subscriber::fmt::writer::TestWriter::with_stderr)
            } else {
                BoxMakeWriter::new(io::stderr)
            }
        } else {
            BoxMakeWriter::new(io::sink)
        };
        if let Some(file) = file {
            make_writer = BoxMakeWriter::new(make_writer.and(FileMakeWriter {
                file: Arc::new(Mutex::new(file)),
            }));
        }

        let layer: Box<dyn tracing_subscriber::Layer<_> + Send + Sync> = if logging.json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(make_writer)
                .with_ansi(false)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_writer(make_writer)
                .with_ansi(false)
                .boxed()
        };

        let subscriber = tracing_subscriber::registry().with(filter).with(layer);
        if tracing::subscriber::set_global_default(subscriber).is_ok() && file_open_failed {
            if let Some(path) = logging.file.as_ref() {
                tracing::warn!(
                    target: "kite.config",
                    path = %path.display(),
                    "failed to open log file; file logging disabled"
                );
            }
        }
    });
}
