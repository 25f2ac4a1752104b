//! Configuration types and loading
//!
//! Config precedence: env vars > config file > defaults. The file path
//! itself comes from `--config`, then `CONFIG_PATH`, then the working
//! directory. A missing file is not an error; every field has a default.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default memory API base URL.
pub const DEFAULT_API_URL: &str = "https://api.penfield.app";

/// Root configuration
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub auth: AuthConfig,
    pub api: ApiConfig,
    pub refresh: RefreshConfig,
    pub health: HealthConfig,
}

/// Authorization server settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub url: String,
    /// Pre-registered client id; when absent the client registers itself
    pub client_id: Option<String>,
    pub credential_path: Option<PathBuf>,
    /// Try to open the verification URL in a browser during login
    pub open_browser: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            url: device_auth::DEFAULT_AUTH_URL.to_string(),
            client_id: None,
            credential_path: None,
            open_browser: true,
        }
    }
}

/// Memory API settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub url: String,
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_API_URL.to_string(),
            timeout_secs: 30,
        }
    }
}

/// Background refresh timing
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub interval_secs: u64,
    pub buffer_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60 * 60,
            buffer_secs: 4 * 60 * 60,
        }
    }
}

/// Health and metrics listener for `run`. Disabled when unset.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub listen_addr: Option<SocketAddr>,
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(e) => return Err(e.into()),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(url) = non_empty_env("MEMORY_AGENT_AUTH_URL") {
            self.auth.url = url;
        }
        if let Some(url) = non_empty_env("MEMORY_AGENT_API_URL") {
            self.api.url = url;
        }
        if let Some(client_id) = non_empty_env("MEMORY_AGENT_CLIENT_ID") {
            self.auth.client_id = Some(client_id);
        }
    }

    pub fn validate(&self) -> common::Result<()> {
        for (name, url) in [("auth.url", &self.auth.url), ("api.url", &self.api.url)] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(common::Error::Config(format!(
                    "{name} must start with http:// or https://, got: {url}"
                )));
            }
        }

        if self.api.timeout_secs == 0 {
            return Err(common::Error::Config(
                "api.timeout_secs must be greater than 0".into(),
            ));
        }

        if self.refresh.interval_secs == 0 || self.refresh.buffer_secs == 0 {
            return Err(common::Error::Config(
                "refresh.interval_secs and refresh.buffer_secs must be greater than 0".into(),
            ));
        }

        // Otherwise a token could expire between two ticks
        if self.refresh.buffer_secs <= self.refresh.interval_secs {
            return Err(common::Error::Config(format!(
                "refresh.buffer_secs ({}) must exceed refresh.interval_secs ({})",
                self.refresh.buffer_secs, self.refresh.interval_secs
            )));
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&Path>) -> PathBuf {
        if let Some(p) = cli_path {
            return p.to_path_buf();
        }
        if let Some(p) = non_empty_env("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("memory-agent.toml")
    }

    /// Configured credential file, or `~/.memory-agent/credentials.json`.
    pub fn credential_path(&self) -> common::Result<PathBuf> {
        if let Some(path) = &self.auth.credential_path {
            return Ok(path.clone());
        }
        dirs::home_dir()
            .map(|home| home.join(".memory-agent").join("credentials.json"))
            .ok_or_else(|| {
                common::Error::Config(
                    "cannot determine home directory, set auth.credential_path".into(),
                )
            })
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh.interval_secs)
    }

    pub fn refresh_buffer(&self) -> Duration {
        Duration::from_secs(self.refresh.buffer_secs)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api.timeout_secs)
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
