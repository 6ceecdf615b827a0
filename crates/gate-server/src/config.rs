//! Server configuration: TOML file + CLI overrides.

use gate_core::{GateError, GateResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub gate: GateSection,
    #[serde(default)]
    pub bus: BusSection,
    #[serde(default)]
    pub auth: AuthSection,
}

/// `[gate]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct GateSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
}

impl Default for GateSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            ping_interval_secs: default_ping_interval(),
        }
    }
}

/// `[bus]` section: where the RPC bus lives and how backends are named.
#[derive(Debug, Clone, Deserialize)]
pub struct BusSection {
    #[serde(default = "default_bus_url")]
    pub url: String,
    #[serde(default = "default_auth_service")]
    pub auth_service: String,
    #[serde(default = "default_facade_service")]
    pub facade_service: String,
    #[serde(default = "default_gate_prefix")]
    pub gate_prefix: String,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            url: default_bus_url(),
            auth_service: default_auth_service(),
            facade_service: default_facade_service(),
            gate_prefix: default_gate_prefix(),
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_ping_interval() -> u64 {
    30
}
fn default_bus_url() -> String {
    "nats://127.0.0.1:4222".to_string()
}
fn default_auth_service() -> String {
    "auth".to_string()
}
fn default_facade_service() -> String {
    "facade".to_string()
}
fn default_gate_prefix() -> String {
    "gate".to_string()
}
fn default_true() -> bool {
    true
}

/// Resolved server configuration (file values with CLI overrides applied).
#[derive(Debug, Clone)]
pub struct GateConfig {
    pub host: String,
    pub port: u16,
    pub ping_interval_secs: u64,
    pub auth_enabled: bool,
    pub bus_url: String,
    pub auth_service: String,
    pub facade_service: String,
    pub gate_prefix: String,
}

impl GateConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_host: Option<String>,
        cli_port: Option<u16>,
        cli_ping_interval: Option<u64>,
        cli_bus_url: Option<String>,
        cli_disable_auth: bool,
    ) -> GateResult<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| GateError::Config(format!("config parse error: {e}")))?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        Ok(Self {
            host: cli_host.unwrap_or(file_config.gate.host),
            port: cli_port.unwrap_or(file_config.gate.port),
            ping_interval_secs: cli_ping_interval.unwrap_or(file_config.gate.ping_interval_secs),
            auth_enabled: !cli_disable_auth && file_config.auth.enabled,
            bus_url: cli_bus_url.unwrap_or(file_config.bus.url),
            auth_service: file_config.bus.auth_service,
            facade_service: file_config.bus.facade_service,
            gate_prefix: file_config.bus.gate_prefix,
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s.as_ref())
}
