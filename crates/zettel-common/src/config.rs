use miette::{Diagnostic, Result};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use std::future::Future;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use crate::transport::{Backoff, SessionConfig};

/// Error type for configuration loading and saving
#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to load configuration")]
    #[diagnostic(code(zettel::config::load))]
    Load(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    #[error("failed to save configuration")]
    #[diagnostic(code(zettel::config::save))]
    Save(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    #[error("unsupported config file format: {0}")]
    #[diagnostic(
        code(zettel::config::format),
        help("use a .json or .toml file extension")
    )]
    UnsupportedFormat(String),

    #[error("invalid value for {var}: {value}")]
    #[diagnostic(code(zettel::config::env))]
    InvalidEnv { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket URL of the collaboration relay.
    pub server_url: String,
    /// Display name shown to collaborators.
    pub display_name: SmolStr,
    /// Cursor colour (RGBA). `None` derives one from the replica id.
    pub color: Option<u32>,
    /// Max time from connect to auth acknowledgement, in milliseconds.
    pub connect_timeout_ms: u64,
    pub backoff: Backoff,
}

impl ClientConfig {
    /// Loads the configuration from the provided loader.
    pub async fn load(loader: &impl Loader) -> Result<Self> {
        Ok(loader.load().await.map_err(ConfigError::Load)?)
    }

    /// Saves the configuration using the provided saver.
    pub async fn save(&self, saver: &impl Saver) -> Result<()> {
        Ok(saver.save(self).await.map_err(ConfigError::Save)?)
    }

    /// Apply `ZETTEL_*` environment overrides.
    ///
    /// - `ZETTEL_SERVER_URL`
    /// - `ZETTEL_DISPLAY_NAME`
    /// - `ZETTEL_CONNECT_TIMEOUT_MS`
    pub fn with_env_overrides(self) -> std::result::Result<Self, ConfigError> {
        self.with_overrides(|var| std::env::var(var).ok())
    }

    fn with_overrides(
        mut self,
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> std::result::Result<Self, ConfigError> {
        if let Some(url) = lookup("ZETTEL_SERVER_URL") {
            self.server_url = url;
        }
        if let Some(name) = lookup("ZETTEL_DISPLAY_NAME") {
            self.display_name = name.into();
        }
        if let Some(value) = lookup("ZETTEL_CONNECT_TIMEOUT_MS") {
            self.connect_timeout_ms = value.parse().map_err(|_| ConfigError::InvalidEnv {
                var: "ZETTEL_CONNECT_TIMEOUT_MS",
                value,
            })?;
        }
        Ok(self)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Session driver settings derived from this configuration.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            connect_timeout: self.connect_timeout(),
            backoff: self.backoff.clone(),
        }
    }
}

impl Default for ClientConfig {
    /// Creates a new default configuration.
    ///
    /// The default configuration points at a relay on `ws://localhost:4455`.
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:4455/collab".to_owned(),
            display_name: SmolStr::new_static("anonymous"),
            color: None,
            connect_timeout_ms: 10_000,
            backoff: Backoff::default(),
        }
    }
}

/// The trait for loading configuration data.
pub trait Loader {
    /// Loads the configuration data.
    fn load(
        &self,
    ) -> impl Future<
        Output = core::result::Result<
            ClientConfig,
            Box<dyn std::error::Error + Send + Sync + 'static>,
        >,
    > + Send;
}

/// The trait for saving configuration data.
pub trait Saver {
    /// Saves the configuration data.
    fn save(
        &self,
        config: &ClientConfig,
    ) -> impl Future<
        Output = core::result::Result<(), Box<dyn std::error::Error + Send + Sync + 'static>>,
    > + Send;
}

/// An implementation of [`Loader`] and [`Saver`] that reads and writes a configuration file.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Create a new [`FileStore`] with the given path.
    ///
    /// [`ClientConfig`] data will be serialized and deserialized using the file extension.
    /// Supports `.json` and `.toml` files.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn format(&self) -> core::result::Result<&str, ConfigError> {
        match self.path.extension().and_then(|ext| ext.to_str()) {
            Some(ext @ ("json" | "toml")) => Ok(ext),
            other => Err(ConfigError::UnsupportedFormat(
                other.unwrap_or_default().to_string(),
            )),
        }
    }
}

impl Loader for FileStore {
    async fn load(
        &self,
    ) -> core::result::Result<ClientConfig, Box<dyn std::error::Error + Send + Sync + 'static>>
    {
        let format = self.format()?;
        let contents = tokio::fs::read_to_string(&self.path).await?;
        match format {
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => Ok(toml::from_str(&contents)?),
        }
    }
}

impl Saver for FileStore {
    async fn save(
        &self,
        config: &ClientConfig,
    ) -> core::result::Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
        let contents = match self.format()? {
            "json" => serde_json::to_string_pretty(config)?,
            _ => toml::to_string_pretty(config)?,
        };
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(tokio::fs::write(&self.path, contents).await?)
    }
}
