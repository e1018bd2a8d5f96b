//! P2P Configuration Module
//!
//! Handles loading and validation of the protocol timing configuration:
//! request stall/abandon timeouts and the heartbeat schedule.

use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// Protocol timing and limit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2pConfig {
    /// A reroutable request with no response within this window is
    /// treated as stalled and moved to another peer
    #[serde(default = "default_stalled_timeout_ms")]
    pub stalled_timeout_ms: u64,
    /// A non-reroutable request is abandoned after this window
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// How often the heartbeat loop wakes up
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// A connection idle longer than this receives a ping
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    /// A peer silent this long after a ping is disconnected
    #[serde(default = "default_heartbeat_response_timeout_ms")]
    pub heartbeat_response_timeout_ms: u64,
    /// Maximum number of inbound connections accepted into the registry
    #[serde(default = "default_max_inbound_connections")]
    pub max_inbound_connections: usize,
    /// Answer heartbeat pings with `sleep = true`: keep the link open but
    /// opt out of further pings (light or battery-constrained nodes)
    #[serde(default)]
    pub sleep_when_idle: bool,
}

fn default_stalled_timeout_ms() -> u64 {
    5_000
}

fn default_response_timeout_ms() -> u64 {
    300_000
}

fn default_heartbeat_interval_ms() -> u64 {
    3_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    10_000
}

fn default_heartbeat_response_timeout_ms() -> u64 {
    60_000
}

fn default_max_inbound_connections() -> usize {
    100
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            stalled_timeout_ms: default_stalled_timeout_ms(),
            response_timeout_ms: default_response_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            heartbeat_response_timeout_ms: default_heartbeat_response_timeout_ms(),
            max_inbound_connections: default_max_inbound_connections(),
            sleep_when_idle: false,
        }
    }
}

impl P2pConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.stalled_timeout_ms == 0 {
            return Err("stalled_timeout_ms must be greater than zero".to_string());
        }
        if self.response_timeout_ms <= self.stalled_timeout_ms {
            return Err(
                "response_timeout_ms must be greater than stalled_timeout_ms".to_string(),
            );
        }
        if self.heartbeat_interval_ms == 0 {
            return Err("heartbeat_interval_ms must be greater than zero".to_string());
        }
        if self.heartbeat_response_timeout_ms <= self.heartbeat_timeout_ms {
            return Err(
                "heartbeat_response_timeout_ms must be greater than heartbeat_timeout_ms"
                    .to_string(),
            );
        }
        if self.max_inbound_connections == 0 {
            return Err("max_inbound_connections must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn stalled_timeout(&self) -> Duration {
        Duration::from_millis(self.stalled_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn heartbeat_response_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_response_timeout_ms)
    }
}

/// Load protocol configuration from a TOML file
pub fn load_p2p_config(path: &str) -> Result<P2pConfig, String> {
    let content = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config file {}: {}", path, e))?;

    let mut config: P2pConfig =
        toml::from_str(&content).map_err(|e| format!("Failed to parse TOML config: {}", e))?;

    // Override from environment variables if present
    if let Ok(val) = std::env::var("P2P_SLEEP_WHEN_IDLE") {
        config.sleep_when_idle = val.to_lowercase() == "true" || val == "1";
    }
    if let Ok(val) = std::env::var("P2P_MAX_INBOUND") {
        if let Ok(parsed) = val.parse::<usize>() {
            config.max_inbound_connections = parsed;
        }
    }

    config.validate()?;

    tracing::info!(
        stalled_timeout_ms = config.stalled_timeout_ms,
        response_timeout_ms = config.response_timeout_ms,
        heartbeat_interval_ms = config.heartbeat_interval_ms,
        "Loaded p2p configuration"
    );

    Ok(config)
}
