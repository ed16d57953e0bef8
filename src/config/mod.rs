// ABOUTME: Configuration for the proxy: addresses, pool sizing and timeouts
//
// Loaded from TOML, overridden by command-line flags, then validated before
// anything is started. Durations are stored in the file as milliseconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::proxy::error::{ProxyError, ProxyResult};

/// Most concurrent connections a single backend node supports
pub const MAX_BACKEND_CONNECTIONS: usize = 20_000;

/// Dispatcher timeout used when none is configured
pub const DEFAULT_DISPATCHER_TIMEOUT: Duration = Duration::from_secs(10);

/// Listener timeout used when none is configured
pub const DEFAULT_LISTENER_TIMEOUT: Duration = Duration::from_secs(5);

/// Proxy configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Address clients connect to, e.g. "0.0.0.0:6666"
    pub listen_addr: String,

    /// Backend to proxy
    pub backend_addr: String,

    /// Backend connections to open, one per worker. 0 means the maximum.
    pub max_backend_connections: usize,

    /// Requests buffered between client read loops and workers. Client
    /// reads block when the queue is full.
    pub dispatch_queue_len: usize,

    // === Timeouts ===
    /// Queue admission wait and per-operation backend read/write deadline
    #[serde(with = "duration_millis")]
    pub dispatcher_timeout: Duration,

    /// Per-request completion wait and graceful shutdown drain
    #[serde(with = "duration_millis")]
    pub listener_timeout: Duration,

    // === Backend reconnect ===
    /// Dial retries before a worker gives up its slot
    pub backend_connect_retries: u32,

    /// Base interval of the exponential dial backoff
    #[serde(with = "duration_millis")]
    pub backend_connect_backoff: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:6666".to_string(),
            backend_addr: "127.0.0.1:27017".to_string(),
            max_backend_connections: 100,
            dispatch_queue_len: 1000,
            dispatcher_timeout: DEFAULT_DISPATCHER_TIMEOUT,
            listener_timeout: DEFAULT_LISTENER_TIMEOUT,
            backend_connect_retries: 5,
            backend_connect_backoff: Duration::from_millis(100),
        }
    }
}

impl ProxyConfig {
    /// Load configuration from a TOML file. Missing keys take defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Save configuration as TOML
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;
        Ok(())
    }

    /// `~/.config/mongoproxy/config.toml` (platform equivalent)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("mongoproxy").join("config.toml"))
    }

    /// Normalize zero values and reject settings the proxy cannot run with.
    pub fn validate(mut self) -> ProxyResult<Self> {
        if self.listen_addr.trim().is_empty() {
            return Err(ProxyError::InvalidConfig(
                "listen_addr cannot be empty".to_string(),
            ));
        }
        if self.backend_addr.trim().is_empty() {
            return Err(ProxyError::InvalidConfig(
                "backend_addr cannot be empty".to_string(),
            ));
        }

        if self.max_backend_connections == 0 {
            tracing::info!(
                max = MAX_BACKEND_CONNECTIONS,
                "max_backend_connections unset, using maximum"
            );
            self.max_backend_connections = MAX_BACKEND_CONNECTIONS;
        }
        if self.max_backend_connections > MAX_BACKEND_CONNECTIONS {
            return Err(ProxyError::InvalidConfig(format!(
                "max_backend_connections cannot be greater than {MAX_BACKEND_CONNECTIONS}"
            )));
        }

        if self.dispatch_queue_len == 0 {
            return Err(ProxyError::InvalidConfig(
                "dispatch_queue_len must be at least 1".to_string(),
            ));
        }

        if self.dispatcher_timeout.is_zero() {
            self.dispatcher_timeout = DEFAULT_DISPATCHER_TIMEOUT;
        }
        if self.listener_timeout.is_zero() {
            self.listener_timeout = DEFAULT_LISTENER_TIMEOUT;
        }

        Ok(self)
    }
}

/// Serde helper for Duration as milliseconds (u64)
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
