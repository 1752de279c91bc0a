//! Configuration loading and endpoint resolution
//!
//! Endpoint resolution priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable (`COSTLINK_WS_URL`)
//! 3. TOML config file (`[sync] endpoint_url`)
//! 4. Compiled default (`ws://localhost:8000/ws`)
//!
//! The TOML file also carries the timing tunables. A missing or malformed
//! file is never fatal: a warning is logged and defaults are used.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::time::millis_to_duration;
use crate::{Error, Result};

/// Environment variable selecting the backend endpoint
pub const ENDPOINT_ENV_VAR: &str = "COSTLINK_WS_URL";

/// Endpoint used when nothing else is configured
pub const DEFAULT_ENDPOINT: &str = "ws://localhost:8000/ws";

/// Reconnect schedule parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay unit of the exponential schedule
    pub base_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Reconnect attempts scheduled before giving up
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: 5,
        }
    }
}

/// Runtime configuration of the sync client
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub endpoint_url: String,
    pub heartbeat_interval: Duration,
    /// Default per-request timeout
    pub request_timeout: Duration,
    /// Bound on a single transport open
    pub connect_timeout: Duration,
    pub reconnect: ReconnectConfig,
    pub status_channel_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoint_url: DEFAULT_ENDPOINT.to_string(),
            heartbeat_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
            status_channel_capacity: 64,
        }
    }
}

/// On-disk configuration file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub sync: SyncSection,
}

/// `[sync]` table of the configuration file; every key is optional
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    pub endpoint_url: Option<String>,
    pub heartbeat_interval_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub reconnect_base_delay_ms: Option<u64>,
    pub reconnect_max_delay_ms: Option<u64>,
    pub max_reconnect_attempts: Option<u32>,
    pub status_channel_capacity: Option<usize>,
}

impl TomlConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Invalid TOML: {}", e)))
    }

    /// Read and parse a configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}

impl SyncConfig {
    /// Build the effective configuration
    ///
    /// # Arguments
    /// * `cli_endpoint` - Endpoint given on the command line, if any
    /// * `config_path` - Explicit config file; falls back to the platform path
    ///
    /// # Errors
    /// Only when the resolved endpoint is not a `ws://` or `wss://` URL.
    pub fn load(cli_endpoint: Option<&str>, config_path: Option<&Path>) -> Result<Self> {
        let path = config_path.map(Path::to_path_buf).or_else(default_config_path);

        let file = match path {
            Some(path) if path.exists() => match TomlConfig::from_file(&path) {
                Ok(config) => {
                    debug!(path = %path.display(), "Loaded config file");
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring unreadable config file, using defaults");
                    TomlConfig::default()
                }
            },
            Some(path) => {
                if config_path.is_some() {
                    warn!(path = %path.display(), "Config file not found, using defaults");
                }
                TomlConfig::default()
            }
            None => TomlConfig::default(),
        };

        let mut config = SyncConfig::default();
        config.apply(&file.sync);
        config.endpoint_url = resolve_endpoint(
            cli_endpoint,
            ENDPOINT_ENV_VAR,
            file.sync.endpoint_url.as_deref(),
        );
        config.validate()?;
        Ok(config)
    }

    /// Overlay the tunables present in a `[sync]` table
    pub fn apply(&mut self, section: &SyncSection) {
        if let Some(ms) = section.heartbeat_interval_ms {
            self.heartbeat_interval = millis_to_duration(ms);
        }
        if let Some(ms) = section.request_timeout_ms {
            self.request_timeout = millis_to_duration(ms);
        }
        if let Some(ms) = section.connect_timeout_ms {
            self.connect_timeout = millis_to_duration(ms);
        }
        if let Some(ms) = section.reconnect_base_delay_ms {
            self.reconnect.base_delay = millis_to_duration(ms);
        }
        if let Some(ms) = section.reconnect_max_delay_ms {
            self.reconnect.max_delay = millis_to_duration(ms);
        }
        if let Some(attempts) = section.max_reconnect_attempts {
            self.reconnect.max_attempts = attempts;
        }
        if let Some(capacity) = section.status_channel_capacity {
            self.status_channel_capacity = capacity;
        }
    }

    /// Reject configurations the connection layer cannot run with
    pub fn validate(&self) -> Result<()> {
        if !(self.endpoint_url.starts_with("ws://") || self.endpoint_url.starts_with("wss://")) {
            return Err(Error::Config(format!(
                "Endpoint must be a ws:// or wss:// URL, got {:?}",
                self.endpoint_url
            )));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(Error::Config("heartbeat_interval_ms must be greater than zero".to_string()));
        }
        if self.reconnect.base_delay > self.reconnect.max_delay {
            return Err(Error::Config(
                "reconnect_base_delay_ms must not exceed reconnect_max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Resolve the backend endpoint following the documented priority order
///
/// Empty values at any level are treated as absent.
pub fn resolve_endpoint(
    cli_arg: Option<&str>,
    env_var_name: &str,
    config_file_value: Option<&str>,
) -> String {
    // Priority 1: Command-line argument
    if let Some(url) = cli_arg.filter(|url| !url.trim().is_empty()) {
        return url.trim().to_string();
    }

    // Priority 2: Environment variable
    if let Ok(url) = std::env::var(env_var_name) {
        if !url.trim().is_empty() {
            return url.trim().to_string();
        }
    }

    // Priority 3: TOML config file
    if let Some(url) = config_file_value.filter(|url| !url.trim().is_empty()) {
        return url.trim().to_string();
    }

    // Priority 4: Compiled default
    DEFAULT_ENDPOINT.to_string()
}

/// Platform config file location: `<config dir>/costlink/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("costlink").join("config.toml"))
}
