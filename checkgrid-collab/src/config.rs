//! Client configuration.
//!
//! Recognized JSON options use camelCase (`gridSize`, `reconnectDelayMs`,
//! ...); anything omitted falls back to the reference defaults.
//!
//! Environment variables (see [`ClientConfig::from_env`]):
//! - `CHECKGRID_URL`: server URL; `http(s)://` origins are upgraded to
//!   `ws(s)://.../ws`
//! - `CHECKGRID_GRID_SIZE`: total cell count
//! - `CHECKGRID_RECONNECT_DELAY_MS`: delay before a reconnect attempt
//! - `CHECKGRID_CONNECT_TIMEOUT_MS`: give up on a connect attempt after this

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::MAX_FRAME_INDEX;

/// WebSocket endpoint path on the server.
pub const WS_PATH: &str = "/ws";

pub const DEFAULT_GRID_SIZE: usize = 100;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 3000;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Sync client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    /// Full WebSocket URL, e.g. `ws://127.0.0.1:8080/ws`
    pub server_url: String,
    /// Total cell count
    pub grid_size: usize,
    /// Fixed delay before each reconnect attempt
    pub reconnect_delay_ms: u64,
    /// A connect attempt taking longer than this counts as failed
    pub connect_timeout_ms: u64,
    /// Outbound frames buffered per connection
    pub outbound_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: format!("ws://127.0.0.1:8080{WS_PATH}"),
            grid_size: DEFAULT_GRID_SIZE,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            connect_timeout_ms: 5000,
            outbound_capacity: 256,
        }
    }
}

impl ClientConfig {
    /// Parse from a JSON document.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_json::from_str(text)?;
        config.server_url = ws_url_for_origin(&config.server_url)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Load from `CHECKGRID_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup. Unset or unparsable numbers
    /// keep their defaults.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let server_url = match lookup("CHECKGRID_URL") {
            Some(url) => ws_url_for_origin(&url)?,
            None => defaults.server_url,
        };

        let config = Self {
            server_url,
            grid_size: parse_var(&lookup, "CHECKGRID_GRID_SIZE").unwrap_or(defaults.grid_size),
            reconnect_delay_ms: parse_var(&lookup, "CHECKGRID_RECONNECT_DELAY_MS")
                .unwrap_or(defaults.reconnect_delay_ms),
            connect_timeout_ms: parse_var(&lookup, "CHECKGRID_CONNECT_TIMEOUT_MS")
                .unwrap_or(defaults.connect_timeout_ms),
            outbound_capacity: defaults.outbound_capacity,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_grid_size(self.grid_size)?;
        if self.reconnect_delay_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "reconnectDelayMs",
                reason: "must be greater than zero".into(),
            });
        }
        if self.outbound_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "outboundCapacity",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Grid sizes must be non-empty and addressable by a binary frame.
pub fn validate_grid_size(grid_size: usize) -> Result<(), ConfigError> {
    if grid_size == 0 || grid_size > MAX_FRAME_INDEX as usize + 1 {
        return Err(ConfigError::Invalid {
            field: "gridSize",
            reason: format!("{grid_size} is not in 1..={}", MAX_FRAME_INDEX as usize + 1),
        });
    }
    Ok(())
}

pub(crate) fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

/// Derive the WebSocket endpoint from a page or server origin.
///
/// `http://` becomes `ws://` and `https://` becomes `wss://`, with
/// [`WS_PATH`] appended when the origin has no path. URLs that already use
/// a WebSocket scheme pass through unchanged.
pub fn ws_url_for_origin(origin: &str) -> Result<String, ConfigError> {
    let origin = origin.trim();
    if origin.starts_with("ws://") || origin.starts_with("wss://") {
        return Ok(origin.to_string());
    }

    let (scheme, rest) = if let Some(rest) = origin.strip_prefix("https://") {
        ("wss", rest)
    } else if let Some(rest) = origin.strip_prefix("http://") {
        ("ws", rest)
    } else {
        return Err(ConfigError::UnsupportedScheme(origin.to_string()));
    };

    let host = rest.trim_end_matches('/');
    if host.is_empty() {
        return Err(ConfigError::Invalid {
            field: "serverUrl",
            reason: format!("no host in {origin}"),
        });
    }
    if host.contains('/') {
        return Ok(format!("{scheme}://{host}"));
    }
    Ok(format!("{scheme}://{host}{WS_PATH}"))
}
