//! Configuration loading from TOML files and environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::llm::DEFAULT_MODEL;
use crate::relay::ValidationRules;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub relay: RelayConfig,
    pub upstream: UpstreamConfig,
    pub client: ClientConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the relay listens on.
    pub listen_addr: String,

    /// How long to wait for in-flight connections on shutdown (seconds).
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:3000".to_string(),
            shutdown_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Path the relay endpoint is mounted on.
    pub route: String,

    /// Longest accepted prompt, in characters.
    pub max_prompt_chars: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            route: "/api/ask".to_string(),
            max_prompt_chars: ValidationRules::default().max_prompt_chars,
        }
    }
}

impl RelayConfig {
    pub fn rules(&self) -> ValidationRules {
        ValidationRules {
            max_prompt_chars: self.max_prompt_chars,
        }
    }
}

/// The OpenAI-compatible completion service behind the relay.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// API base URL; `/chat/completions` is appended.
    pub base_url: String,

    pub model: String,

    /// Name of the environment variable holding the API key. The key itself
    /// is read on every request and never stored here.
    pub api_key_env: String,

    pub connect_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.thesys.dev/v1/embed".to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key_env: "THESYS_API_KEY".to_string(),
            connect_timeout_secs: 10,
        }
    }
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Settings for the `ask` command.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Full URL of the relay endpoint.
    pub endpoint: String,

    /// Upper bound on one exchange (seconds).
    pub stream_timeout_secs: u64,

    pub connect_timeout_secs: u64,

    /// Fail on invalid UTF-8 in the answer instead of printing U+FFFD.
    pub fatal_decode: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:3000/api/ask".to_string(),
            stream_timeout_secs: 30,
            connect_timeout_secs: 10,
            fatal_decode: false,
        }
    }
}

impl ClientConfig {
    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level filter, e.g. "info" or "promptrelay=debug". `RUST_LOG` wins.
    pub level: String,

    /// "pretty" or "json".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Loads the file when given (defaults otherwise), then applies
    /// environment overrides.
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Applies `PROMPTRELAY_*` overrides from `lookup`. Values that fail to
    /// parse are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("PROMPTRELAY_LISTEN_ADDR") {
            self.server.listen_addr = v;
        }
        if let Some(n) = lookup("PROMPTRELAY_MAX_PROMPT_CHARS").and_then(|v| v.parse().ok()) {
            self.relay.max_prompt_chars = n;
        }

        if let Some(v) = lookup("PROMPTRELAY_UPSTREAM_URL") {
            self.upstream.base_url = v;
        }
        if let Some(v) = lookup("PROMPTRELAY_MODEL") {
            self.upstream.model = v;
        }

        if let Some(v) = lookup("PROMPTRELAY_ENDPOINT") {
            self.client.endpoint = v;
        }

        if let Some(v) = lookup("PROMPTRELAY_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = lookup("PROMPTRELAY_LOG_FORMAT") {
            self.logging.format = v;
        }
    }
}
