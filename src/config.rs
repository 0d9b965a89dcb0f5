//! Configuration loading.
//!
//! Loads `config.toml` with per-section defaults. Every section uses
//! `#[serde(default)]` so a minimal or empty file is valid.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::dispatch::DEFAULT_RECEIPT_TTL_SECS;
use crate::token::TokenScheme;
use crate::transport::http::DEFAULT_BRIDGE_URL;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    /// Dispatch cycle behaviour and feature flags.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Message store location.
    #[serde(default)]
    pub store: StoreConfig,

    /// SMS bridge connection.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Log output.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Dispatch cycle settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Maximum messages pulled per cycle.
    #[serde(default = "default_batch_limit")]
    pub batch_limit: u32,

    /// Split messages locally with `i/N` indicators instead of using the
    /// transport's multipart support.
    #[serde(default)]
    pub compatibility_segmentation: bool,

    /// Walk messages straight to delivered without transmitting them.
    #[serde(default)]
    pub dummy_send_mode: bool,

    /// Seconds between cycles in `run` mode.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Correlation token scheme.
    #[serde(default)]
    pub token_source: TokenScheme,

    /// Seconds a message's acknowledgement tracking stays open before it is
    /// dropped unacknowledged.
    #[serde(default = "default_receipt_ttl_secs")]
    pub receipt_ttl_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_limit: default_batch_limit(),
            compatibility_segmentation: false,
            dummy_send_mode: false,
            interval_secs: default_interval_secs(),
            token_source: TokenScheme::default(),
            receipt_ttl_secs: default_receipt_ttl_secs(),
        }
    }
}

/// Message store settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// SQLite database file.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// SMS bridge settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    /// Bridge base URL.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Service centre override. `None` uses the bridge default.
    #[serde(default)]
    pub smsc: Option<String>,

    /// TCP connect timeout.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Whole-request timeout.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            smsc: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    /// Directory for rotated JSON logs. Console only when unset.
    #[serde(default)]
    pub logs_dir: Option<PathBuf>,
}

// Default value functions for serde

fn default_batch_limit() -> u32 {
    10
}
fn default_interval_secs() -> u64 {
    60
}
fn default_receipt_ttl_secs() -> u64 {
    DEFAULT_RECEIPT_TTL_SECS
}
fn default_store_path() -> PathBuf {
    PathBuf::from("smsgate.db")
}
fn default_base_url() -> String {
    DEFAULT_BRIDGE_URL.to_owned()
}
fn default_connect_timeout_secs() -> u64 {
    5
}
fn default_request_timeout_secs() -> u64 {
    30
}

/// Load the gateway config from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_config(path: &Path) -> anyhow::Result<GatewayConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config at {}", path.display()))?;
    let config: GatewayConfig = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config at {}", path.display()))?;
    Ok(config)
}

/// Resolve the default config directory (`~/.smsgate/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".smsgate"))
}
