use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::chain::{ChainError, ConnectionConfig, DEFAULT_MAX_RECONNECT_ATTEMPTS};
use crate::executor::ExecutorConfig;
use crate::sync::HistoricalSyncConfig;

/// Pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Turns the whole pipeline on or off
    pub enabled: bool,
    pub rpc_url: String,
    /// WebSocket endpoint for live subscriptions; derived from `rpc_url` when unset
    pub ws_url: Option<String>,
    pub contract_address: Address,
    /// Checkpoint floor: nothing before this block is ever replayed
    pub deployment_block: u64,
    /// Run the live subscriber next to the scheduled gap repair
    pub live_enabled: bool,

    pub batch_size: u64,
    pub max_range_multiplier: u64,
    pub window_delay_ms: u64,
    pub rate_limit_wait_ms: u64,
    /// Blocks behind head a fresh process starts from
    pub cold_start_lookback: u64,
    pub sync_interval_secs: u64,
    pub poll_interval_secs: u64,

    pub reconnect_base_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub pong_timeout_secs: u64,

    /// Symbol recorded for vaults holding the native asset
    pub native_symbol: String,
    pub checkpoint_path: Option<String>,
    pub executor: ExecutorConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rpc_url: "http://localhost:8545".to_string(),
            ws_url: None,
            contract_address: Address::ZERO,
            deployment_block: 0,
            live_enabled: true,
            batch_size: 1_000,
            max_range_multiplier: 10,
            window_delay_ms: 200,
            rate_limit_wait_ms: 5_000,
            cold_start_lookback: 10_000,
            sync_interval_secs: 300,
            poll_interval_secs: 12,
            reconnect_base_delay_ms: 5_000,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            pong_timeout_secs: 60,
            native_symbol: "ETH".to_string(),
            checkpoint_path: None,
            executor: ExecutorConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Override connection settings from `VAULT_SYNC_*` environment variables.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("VAULT_SYNC_RPC_URL") {
            self.rpc_url = url;
        }
        if let Ok(url) = std::env::var("VAULT_SYNC_WS_URL") {
            self.ws_url = Some(url);
        }
        if let Some(address) = std::env::var("VAULT_SYNC_CONTRACT_ADDRESS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.contract_address = address;
        }
        if let Some(block) = std::env::var("VAULT_SYNC_DEPLOYMENT_BLOCK")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.deployment_block = block;
        }
        if let Some(enabled) = std::env::var("VAULT_SYNC_ENABLED")
            .ok()
            .and_then(|v| parse_flag(&v))
        {
            self.enabled = enabled;
        }
        if let Ok(path) = std::env::var("VAULT_SYNC_CHECKPOINT_PATH") {
            self.checkpoint_path = Some(path);
        }
        self
    }

    pub fn validate(&self) -> Result<(), ChainError> {
        if self.contract_address == Address::ZERO {
            return Err(ChainError::InvalidConfig(
                "contract_address is not set".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ChainError::InvalidConfig("batch_size must be > 0".to_string()));
        }
        if self.max_range_multiplier == 0 {
            return Err(ChainError::InvalidConfig(
                "max_range_multiplier must be > 0".to_string(),
            ));
        }
        if self.sync_interval_secs == 0 {
            return Err(ChainError::InvalidConfig(
                "sync_interval_secs must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn historical(&self) -> HistoricalSyncConfig {
        HistoricalSyncConfig {
            batch_size: self.batch_size,
            max_range_multiplier: self.max_range_multiplier,
            window_delay: Duration::from_millis(self.window_delay_ms),
            rate_limit_wait: Duration::from_millis(self.rate_limit_wait_ms),
            ..HistoricalSyncConfig::default()
        }
    }

    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            contract_address: self.contract_address,
            reconnect_base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_reconnect_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SyncConfig = serde_json::from_str(
            r#"{
                "rpc_url": "https://rpc.example.org",
                "contract_address": "0x00000000000000000000000000000000000000cc",
                "deployment_block": 1200,
                "batch_size": 500
            }"#,
        )
        .unwrap();

        assert_eq!(config.rpc_url, "https://rpc.example.org");
        assert_eq!(config.deployment_block, 1200);
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.max_range_multiplier, 10);
        assert!(config.enabled);
        assert_eq!(config.historical().range_ceiling(), 5_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unset_contract_is_invalid() {
        let err = SyncConfig::default().validate().unwrap_err();
        assert!(matches!(err, ChainError::InvalidConfig(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag(" off "), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn test_connection_settings() {
        let config = SyncConfig {
            reconnect_base_delay_ms: 250,
            max_reconnect_attempts: 3,
            ..SyncConfig::default()
        };
        let connection = config.connection();
        assert_eq!(connection.reconnect_base_delay, Duration::from_millis(250));
        assert_eq!(connection.max_reconnect_attempts, 3);
    }
}
