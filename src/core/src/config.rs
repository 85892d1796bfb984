use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::paths::deskchat_config_path;

/// Server configuration for the hosted backend.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1:9810).
    pub bind: SocketAddr,
    /// Interval between server→client pings.
    pub heartbeat_interval: Duration,
    /// Close the connection after this duration without any message.
    pub idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9810),
            heartbeat_interval: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(120),
        }
    }
}

/// Tunables for the messaging core, read from `config.toml`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Messages fetched on room entry.
    pub history_limit: usize,
    /// Upper bound on a message body, in characters.
    pub max_body_len: usize,
    pub identity_cache_ttl_secs: u64,
    /// Per-attempt timeout for opening a push channel.
    pub subscribe_timeout_ms: u64,
    /// Attempts before the channel is reported as failed.
    pub subscribe_max_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Buffer of the in-process push hub.
    pub channel_capacity: usize,
    pub broadcast_room_name: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_limit: 50,
            max_body_len: 1000,
            identity_cache_ttl_secs: 300,
            subscribe_timeout_ms: 5_000,
            subscribe_max_attempts: 5,
            reconnect_base_delay_ms: 250,
            reconnect_max_delay_ms: 8_000,
            channel_capacity: 256,
            broadcast_room_name: "Team Chat".to_string(),
        }
    }
}

impl ChatConfig {
    /// Load from `$DESKCHAT_HOME/config.toml`; a missing file yields defaults.
    pub fn load() -> Result<Self, String> {
        Self::load_from(&deskchat_config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self, String> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|e| format!("read config.toml: {e}"))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        toml::from_str(raw).map_err(|e| format!("parse config.toml: {e}"))
    }

    pub fn config_path() -> Result<PathBuf, String> {
        deskchat_config_path()
    }

    /// Load, falling back to defaults with a warning.
    pub fn load_or_default() -> Self {
        match Self::load() {
            Ok(config) => config,
            Err(err) => {
                let path = Self::config_path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|_| "~/.deskchat/config.toml".to_string());
                tracing::warn!(%path, error = %err, "failed to load chat config; using defaults");
                Self::default()
            }
        }
    }

    pub fn identity_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.identity_cache_ttl_secs)
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    /// Exponential backoff before retry number `attempt` (1-based), capped
    /// at `reconnect_max_delay_ms`.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.reconnect_base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.reconnect_max_delay_ms))
    }
}
