use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;
use crate::paths::Paths;

/// Relay server + discovery endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    /// Port for the relay WebSocket listener. 0 = OS-assigned.
    #[serde(default)]
    pub port: u16,
    /// Candidate ports for the discovery HTTP server, tried in order.
    #[serde(default = "default_discovery_ports")]
    pub discovery_ports: Vec<u16>,
    /// Keep-alive ping interval while a peer is active.
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// URL hint served to a self-discovering peer (which tab to attach to).
    #[serde(default)]
    pub tab_url: Option<String>,
    /// Tab id hint served to a self-discovering peer.
    #[serde(default)]
    pub tab_id: Option<i64>,
    /// Whether the peer should open a fresh tab instead of attaching.
    #[serde(default)]
    pub new_tab: bool,
}

fn default_discovery_ports() -> Vec<u16> {
    vec![8765, 8766, 8767]
}

fn default_keepalive_secs() -> u64 {
    30
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 0,
            discovery_ports: default_discovery_ports(),
            keepalive_secs: default_keepalive_secs(),
            tab_url: None,
            tab_id: None,
            new_tab: false,
        }
    }
}

/// Reconnection policy for a managed browser peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Overall bound on one reconnection sequence, independent of
    /// per-attempt delays.
    #[serde(default = "default_overall_timeout_ms")]
    pub overall_timeout_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_overall_timeout_ms() -> u64 {
    30_000
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            overall_timeout_ms: default_overall_timeout_ms(),
        }
    }
}

/// Host-process pipe RPC settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipeConfig {
    /// Socket name: `/tmp/<name>.sock` on POSIX, `\\.\pipe\<name>` on Windows.
    #[serde(default = "default_socket_name")]
    pub socket_name: String,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Timeout for the no-op liveness probe used by recovery.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

fn default_socket_name() -> String {
    "webcell-host".to_string()
}

fn default_call_timeout_ms() -> u64 {
    10_000
}

fn default_probe_timeout_ms() -> u64 {
    1000
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            socket_name: default_socket_name(),
            call_timeout_ms: default_call_timeout_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub pipe: PipeConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}
