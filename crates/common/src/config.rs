//! Registry configuration loaded from TOML.
//!
//! Every field has a default, so a config file only needs to list the
//! values it overrides.

use serde::Deserialize;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Staleness thresholds and policy switches for the node registry.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct RegistryConfig {
    /// Per-record re-check cache window.
    pub check_interval_secs: u64,
    /// Minimum spacing between two accepted broadcasts of one node.
    pub min_broadcast_interval_secs: u64,
    /// Minimum spacing between pings; also the PRE_ENABLED → ENABLED gap.
    pub min_ping_interval_secs: u64,
    pub expiration_secs: u64,
    pub watchdog_max_secs: u64,
    pub new_start_required_secs: u64,
    /// No ping within this window removes the node.
    pub removal_secs: u64,
    pub pose_ban_max_score: i32,
    /// Protocol floor. Nodes below it need a new start.
    pub min_payments_protocol: u32,
    pub max_sig_time_drift_secs: u64,
    /// A ping must reference one of the last N blocks.
    pub max_ping_block_age: u64,
    /// When set, WATCHDOG_EXPIRED nodes are not payable.
    pub require_watchdog: bool,
    /// Blocks scanned on the first last-paid update.
    pub payments_storage_limit: u64,
    pub payment_cycle_secs_per_node: u64,
    pub fulfilled_request_expire_secs: u64,
    /// Accept private and loopback node addresses (regtest).
    pub allow_local_addresses: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            check_interval_secs: 5,
            min_broadcast_interval_secs: 5 * 60,
            min_ping_interval_secs: 10 * 60,
            expiration_secs: 65 * 60,
            watchdog_max_secs: 120 * 60,
            new_start_required_secs: 180 * 60,
            removal_secs: 24 * 60 * 60,
            pose_ban_max_score: 5,
            min_payments_protocol: 70206,
            max_sig_time_drift_secs: 60 * 60,
            max_ping_block_age: 24,
            require_watchdog: true,
            payments_storage_limit: 5000,
            payment_cycle_secs_per_node: 156,
            fulfilled_request_expire_secs: 60 * 60,
            allow_local_addresses: false,
        }
    }
}

/// Load config from a TOML file path.
pub fn load_from_file(path: impl AsRef<Path>) -> Result<RegistryConfig, ConfigError> {
    let s = fs::read_to_string(path.as_ref())?;
    let cfg: RegistryConfig = toml::from_str(&s)?;
    Ok(cfg)
}
