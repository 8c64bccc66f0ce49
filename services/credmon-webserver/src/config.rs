//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The credential directory may be overridden with `CREDMON_CRED_DIR` so
//! the same file can be shared with the refresher's deployment.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Where key files are read and credential files written
#[derive(Debug, Deserialize)]
pub struct CredentialsConfig {
    pub directory: PathBuf,
}

/// Outbound call and session limits
#[derive(Debug, Deserialize)]
pub struct OAuthConfig {
    #[serde(default = "default_exchange_timeout")]
    pub exchange_timeout_secs: u64,
    #[serde(default = "default_identity_timeout")]
    pub identity_timeout_secs: u64,
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            exchange_timeout_secs: default_exchange_timeout(),
            identity_timeout_secs: default_identity_timeout(),
            session_ttl_secs: default_session_ttl(),
        }
    }
}

impl OAuthConfig {
    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_secs(self.exchange_timeout_secs)
    }

    pub fn identity_timeout(&self) -> Duration {
        Duration::from_secs(self.identity_timeout_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

fn default_max_connections() -> usize {
    1000
}

fn default_exchange_timeout() -> u64 {
    10
}

fn default_identity_timeout() -> u64 {
    5
}

fn default_session_ttl() -> u64 {
    3600
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(dir) = std::env::var("CREDMON_CRED_DIR") {
            if !dir.trim().is_empty() {
                config.credentials.directory = PathBuf::from(dir.trim());
            }
        }

        if config.credentials.directory.as_os_str().is_empty() {
            return Err(common::Error::Config(
                "credentials.directory must not be empty".into(),
            ));
        }

        if config.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        for (name, value) in [
            ("exchange_timeout_secs", config.oauth.exchange_timeout_secs),
            ("identity_timeout_secs", config.oauth.identity_timeout_secs),
            ("session_ttl_secs", config.oauth.session_ttl_secs),
        ] {
            if value == 0 {
                return Err(common::Error::Config(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("credmon-webserver.toml")
    }
}
