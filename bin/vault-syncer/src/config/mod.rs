use serde::{Deserialize, Serialize};
use std::path::Path;
use vault_sync::store::User;
use vault_sync::SyncConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub sync: SyncConfig,
    /// Accounts seeded into the in-memory store so notifications have
    /// recipients
    #[serde(default)]
    pub users: Vec<User>,
}

impl ServiceConfig {
    pub async fn load_from_file(path: &Path) -> eyre::Result<Self> {
        let contents = tokio::fs::read_to_string(path).await?;
        let config: Self = serde_json::from_str(&contents)?;
        Ok(config)
    }

    pub fn with_env_overrides(mut self) -> Self {
        self.sync = self.sync.with_env_overrides();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vault_sync::store::UserRole;

    #[test]
    fn test_parse_service_config() {
        let config: ServiceConfig = serde_json::from_str(
            r#"{
                "sync": {
                    "rpc_url": "https://rpc.example.org",
                    "contract_address": "0x00000000000000000000000000000000000000cc",
                    "deployment_block": 5000000,
                    "executor": {
                        "endpoints": {
                            "eth_getLogs": { "requests_per_second": 1.0, "burst_capacity": 2.0 }
                        }
                    }
                },
                "users": [
                    { "id": "admin-1", "address": "0x01", "role": "admin" }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.sync.deployment_block, 5_000_000);
        assert_eq!(config.users[0].role, UserRole::Admin);
        let logs = config.sync.executor.endpoint("eth_getLogs");
        assert_eq!(logs.burst_capacity, 2.0);
        assert_eq!(logs.max_retries, 3);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: ServiceConfig = serde_json::from_str("{}").unwrap();
        assert!(config.sync.enabled);
        assert!(config.users.is_empty());
    }
}
