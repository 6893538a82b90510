//! Typed configuration: the JSON schema, range validation, the environment
//! overlay, and the safe/unsafe classification for hot reloads.
//!
//! The loaded [`Config`] is an immutable value handed to the supervisor.
//! Reloads never mutate it in place: a new value is validated, classified,
//! and only its safe subset is published to the running services.

use std::path::Path;

use relayer_types::{ConfigIssue, RelayerError};
use serde::{Deserialize, Serialize};

use crate::policies::Policies;

fn config_err(key: &str, reason: impl Into<String>) -> RelayerError {
    RelayerError::Configuration {
        key: key.to_string(),
        issue: ConfigIssue::Invalid(reason.into()),
    }
}

fn unsafe_reload(key: &str) -> RelayerError {
    RelayerError::Configuration {
        key: key.to_string(),
        issue: ConfigIssue::UnsafeHotReload,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStoreKind {
    File,
    Memory,
    Browser,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyStoreConfig {
    #[serde(rename = "type")]
    pub kind: KeyStoreKind,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NearConfig {
    pub network_id: String,
    pub node_url: String,
    #[serde(default)]
    pub wallet_url: Option<String>,
    #[serde(default)]
    pub helper_url: Option<String>,
    #[serde(default)]
    pub explorer_url: Option<String>,
    pub account_id: String,
    pub private_key: String,
    pub escrow_contract_id: String,
    #[serde(default)]
    pub key_store: Option<KeyStoreConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EthNetworkConfig {
    pub name: String,
    pub rpc_url: String,
    pub chain_id: u64,
    #[serde(default = "default_block_confirmations")]
    pub block_confirmations: u64,
    #[serde(default)]
    pub gas_limit: Option<u64>,
    #[serde(default)]
    pub gas_price: Option<u64>,
}

fn default_block_confirmations() -> u64 {
    12
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EthereumConfig {
    pub network: EthNetworkConfig,
    pub private_key: String,
    pub escrow_contract_address: String,
    pub bridge_contract_address: String,
    #[serde(default)]
    pub escrow_factory_address: Option<String>,
    #[serde(default)]
    pub max_gas_price: Option<u64>,
    #[serde(default)]
    pub priority_fee: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayerSection {
    #[serde(default = "default_polling_interval")]
    pub polling_interval: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    #[serde(default = "default_storage_dir")]
    pub storage_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub enable_metrics: bool,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default = "default_true")]
    pub auto_start: bool,
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    #[serde(default = "default_safety_margin")]
    pub safety_margin_secs: u64,
    #[serde(default = "default_min_headroom")]
    pub min_timelock_headroom_secs: u64,
    #[serde(default = "default_refund_grace")]
    pub refund_grace_secs: u64,
}

fn default_polling_interval() -> u64 {
    5000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay() -> u64 {
    1000
}
fn default_batch_size() -> u64 {
    10
}
fn default_storage_dir() -> String {
    "storage".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_metrics_port() -> u16 {
    3001
}
fn default_true() -> bool {
    true
}
fn default_concurrency_limit() -> usize {
    4
}
fn default_safety_margin() -> u64 {
    86_400
}
fn default_min_headroom() -> u64 {
    3_600
}
fn default_refund_grace() -> u64 {
    60
}

impl Default for RelayerSection {
    fn default() -> Self {
        serde_json::from_str("{}").expect("all fields have defaults")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitingConfig {
    pub enabled: bool,
    pub max_requests_per_minute: u32,
    pub max_requests_per_hour: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityConfig {
    #[serde(default)]
    pub enable_tee_validation: bool,
    #[serde(default)]
    pub allowed_tee_types: Vec<String>,
    #[serde(default)]
    pub signature_validation: bool,
    #[serde(default)]
    pub encrypt_secrets: bool,
    #[serde(default)]
    pub secret_encryption_key: Option<String>,
    #[serde(default)]
    pub rate_limiting: Option<RateLimitingConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_health_interval")]
    pub interval: u64,
    #[serde(default = "default_health_timeout")]
    pub timeout: u64,
}

fn default_health_interval() -> u64 {
    30_000
}
fn default_health_timeout() -> u64 {
    5_000
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: default_health_interval(),
            timeout: default_health_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertsConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub slack_token: Option<String>,
    #[serde(default)]
    pub email_config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringConfig {
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub alerts: Option<AlertsConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub environment: Environment,
    pub near: NearConfig,
    pub ethereum: EthereumConfig,
    #[serde(default)]
    pub relayer: RelayerSection,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// The subset of configuration that may change while the process runs.
/// Published through a watch channel on a successful reload.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveParams {
    pub polling_interval_ms: u64,
    pub log_level: String,
    pub concurrency_limit: usize,
    pub batch_size: u64,
    pub policies: Policies,
    pub health_check: HealthCheckConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, RelayerError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| config_err("configFile", format!("{}: {e}", path.display())))?;
        let mut config = Self::from_json(&raw)?;
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self, RelayerError> {
        serde_json::from_str(raw).map_err(|e| config_err("configFile", e.to_string()))
    }

    /// Environment variables overlay the file. `get` is injected so tests
    /// do not touch the process environment.
    pub fn apply_env(
        &mut self,
        get: impl Fn(&str) -> Option<String>,
    ) -> Result<(), RelayerError> {
        if let Some(value) = get("NEAR_NETWORK_ID") {
            self.near.network_id = value;
        }
        if let Some(value) = get("NEAR_NODE_URL") {
            self.near.node_url = value;
        }
        if let Some(value) = get("NEAR_ACCOUNT_ID") {
            self.near.account_id = value;
        }
        if let Some(value) = get("NEAR_PRIVATE_KEY") {
            self.near.private_key = value;
        }
        if let Some(value) = get("NEAR_ESCROW_CONTRACT_ID") {
            self.near.escrow_contract_id = value;
        }
        if let Some(value) = get("ETHEREUM_RPC_URL") {
            self.ethereum.network.rpc_url = value;
        }
        if let Some(value) = get("ETHEREUM_CHAIN_ID") {
            self.ethereum.network.chain_id = value
                .parse()
                .map_err(|_| config_err("ETHEREUM_CHAIN_ID", "not an integer"))?;
        }
        if let Some(value) = get("ETHEREUM_PRIVATE_KEY") {
            self.ethereum.private_key = value;
        }
        if let Some(value) = get("ETHEREUM_ESCROW_CONTRACT") {
            self.ethereum.escrow_contract_address = value;
        }
        if let Some(value) = get("ETHEREUM_BRIDGE_CONTRACT") {
            self.ethereum.bridge_contract_address = value;
        }
        if let Some(value) = get("ETHEREUM_ESCROW_FACTORY_ADDRESS") {
            self.ethereum.escrow_factory_address = Some(value);
        }
        if let Some(value) = get("POLLING_INTERVAL").or_else(|| get("RELAYER_POLL_INTERVAL")) {
            self.relayer.polling_interval = value
                .parse()
                .map_err(|_| config_err("POLLING_INTERVAL", "not an integer"))?;
        }
        if let Some(value) = get("STORAGE_DIR") {
            self.relayer.storage_dir = value;
        }
        if let Some(value) = get("LOG_LEVEL") {
            self.relayer.log_level = value;
        }
        if let Some(value) = get("RELAYER_AUTO_START") {
            self.relayer.auto_start = value
                .parse()
                .map_err(|_| config_err("RELAYER_AUTO_START", "not a boolean"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), RelayerError> {
        let relayer = &self.relayer;
        check_range("relayer.pollingInterval", relayer.polling_interval, 1000, 60_000)?;
        check_range("relayer.maxRetries", u64::from(relayer.max_retries), 1, 10)?;
        check_range("relayer.retryDelay", relayer.retry_delay, 100, 10_000)?;
        check_range("relayer.batchSize", relayer.batch_size, 1, 100)?;
        check_range("relayer.metricsPort", u64::from(relayer.metrics_port), 1000, 65_535)?;
        check_range("relayer.concurrencyLimit", relayer.concurrency_limit as u64, 1, 64)?;
        if relayer.enable_metrics {
            return Err(config_err(
                "relayer.enableMetrics",
                "must be false; no metrics endpoint is served",
            ));
        }
        if relayer.storage_dir.is_empty() {
            return Err(config_err("relayer.storageDir", "must not be empty"));
        }
        if !matches!(relayer.log_level.as_str(), "error" | "warn" | "info" | "debug") {
            return Err(config_err(
                "relayer.logLevel",
                "must be one of error, warn, info, debug",
            ));
        }
        if relayer.safety_margin_secs == 0 {
            return Err(config_err("relayer.safetyMarginSecs", "must be positive"));
        }

        let eth = &self.ethereum;
        if eth.network.chain_id == 0 {
            return Err(config_err("ethereum.network.chainId", "must be positive"));
        }
        if eth.network.block_confirmations == 0 {
            return Err(config_err(
                "ethereum.network.blockConfirmations",
                "must be at least 1",
            ));
        }
        if eth.network.rpc_url.is_empty() {
            return Err(config_err("ethereum.network.rpcUrl", "must not be empty"));
        }
        check_eth_key("ethereum.privateKey", &eth.private_key)?;
        check_eth_address("ethereum.escrowContractAddress", &eth.escrow_contract_address)?;
        check_eth_address("ethereum.bridgeContractAddress", &eth.bridge_contract_address)?;
        if let Some(factory) = &eth.escrow_factory_address {
            check_eth_address("ethereum.escrowFactoryAddress", factory)?;
        }

        let near = &self.near;
        if near.node_url.is_empty() {
            return Err(config_err("near.nodeUrl", "must not be empty"));
        }
        if near.account_id.is_empty() {
            return Err(config_err("near.accountId", "must not be empty"));
        }
        if near.escrow_contract_id.is_empty() {
            return Err(config_err("near.escrowContractId", "must not be empty"));
        }
        if !near.private_key.starts_with("ed25519:") {
            return Err(config_err("near.privateKey", "must be an ed25519: key"));
        }

        let security = &self.security;
        if security.encrypt_secrets {
            match &security.secret_encryption_key {
                Some(key) if key.len() >= 32 => {}
                _ => {
                    return Err(config_err(
                        "security.secretEncryptionKey",
                        "must be at least 32 characters when encryptSecrets is on",
                    ))
                }
            }
        }
        if let Some(limits) = &security.rate_limiting {
            check_range(
                "security.rateLimiting.maxRequestsPerMinute",
                u64::from(limits.max_requests_per_minute),
                1,
                1000,
            )?;
            check_range(
                "security.rateLimiting.maxRequestsPerHour",
                u64::from(limits.max_requests_per_hour),
                1,
                10_000,
            )?;
        }

        let health = &self.monitoring.health_check;
        if health.enabled {
            check_range("monitoring.healthCheck.interval", health.interval, 5_000, 300_000)?;
            check_range("monitoring.healthCheck.timeout", health.timeout, 1_000, 30_000)?;
        }

        Ok(())
    }

    pub fn live_params(&self) -> LiveParams {
        LiveParams {
            polling_interval_ms: self.relayer.polling_interval,
            log_level: self.relayer.log_level.clone(),
            concurrency_limit: self.relayer.concurrency_limit,
            batch_size: self.relayer.batch_size,
            policies: Policies::from_config(self.relayer.max_retries, self.relayer.retry_delay),
            health_check: self.monitoring.health_check.clone(),
        }
    }

    /// Classify a reloaded configuration against the running one. Safe
    /// changes come back as new [`LiveParams`]; any change to endpoints,
    /// contracts, keys or the storage layout is rejected.
    pub fn classify_reload(&self, new: &Config) -> Result<LiveParams, RelayerError> {
        if new.environment != self.environment {
            return Err(unsafe_reload("environment"));
        }
        if new.near != self.near {
            return Err(unsafe_reload("near"));
        }
        if new.ethereum != self.ethereum {
            return Err(unsafe_reload("ethereum"));
        }
        if new.security != self.security {
            return Err(unsafe_reload("security"));
        }
        if new.relayer.storage_dir != self.relayer.storage_dir {
            return Err(unsafe_reload("relayer.storageDir"));
        }
        if new.relayer.enable_metrics != self.relayer.enable_metrics
            || new.relayer.metrics_port != self.relayer.metrics_port
        {
            return Err(unsafe_reload("relayer.metrics"));
        }
        new.validate()?;
        Ok(new.live_params())
    }
}

fn check_range(key: &str, value: u64, min: u64, max: u64) -> Result<(), RelayerError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(config_err(key, format!("must be within {min}..={max}, got {value}")))
    }
}

fn check_eth_address(key: &str, value: &str) -> Result<(), RelayerError> {
    let ok = value.len() == 42
        && value.starts_with("0x")
        && value[2..].bytes().all(|b| b.is_ascii_hexdigit());
    if ok {
        Ok(())
    } else {
        Err(config_err(key, "must be 0x followed by 40 hex characters"))
    }
}

fn check_eth_key(key: &str, value: &str) -> Result<(), RelayerError> {
    let ok = value.len() == 66
        && value.starts_with("0x")
        && value[2..].bytes().all(|b| b.is_ascii_hexdigit());
    if ok {
        Ok(())
    } else {
        Err(config_err(key, "must be 0x followed by 64 hex characters"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> String {
        format!(
            r#"{{
                "near": {{
                    "networkId": "testnet",
                    "nodeUrl": "https://rpc.testnet.near.org",
                    "accountId": "relayer.testnet",
                    "privateKey": "ed25519:{}",
                    "escrowContractId": "escrow.testnet"
                }},
                "ethereum": {{
                    "network": {{
                        "name": "sepolia",
                        "rpcUrl": "https://sepolia.example",
                        "chainId": 11155111,
                        "blockConfirmations": 1
                    }},
                    "privateKey": "0x{}",
                    "escrowContractAddress": "0x{}",
                    "bridgeContractAddress": "0x{}"
                }}
            }}"#,
            "A".repeat(44),
            "1".repeat(64),
            "a".repeat(40),
            "b".repeat(40),
        )
    }

    fn minimal() -> Config {
        Config::from_json(&minimal_json()).unwrap()
    }

    #[test]
    fn defaults_are_filled_in() {
        let config = minimal();
        config.validate().unwrap();
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.relayer.polling_interval, 5000);
        assert_eq!(config.relayer.max_retries, 3);
        assert_eq!(config.relayer.batch_size, 10);
        assert_eq!(config.relayer.concurrency_limit, 4);
        assert!(!config.relayer.enable_metrics);
        assert!(!config.monitoring.health_check.enabled);
    }

    #[test]
    fn range_violations_are_rejected() {
        let mut config = minimal();
        config.relayer.polling_interval = 500;
        assert!(config.validate().is_err());

        let mut config = minimal();
        config.relayer.max_retries = 11;
        assert!(config.validate().is_err());

        let mut config = minimal();
        config.ethereum.network.block_confirmations = 0;
        assert!(config.validate().is_err());

        let mut config = minimal();
        config.ethereum.private_key = "0xshort".into();
        assert!(config.validate().is_err());

        let mut config = minimal();
        config.near.private_key = "not-a-key".into();
        assert!(config.validate().is_err());

        let mut config = minimal();
        config.security.encrypt_secrets = true;
        config.security.secret_encryption_key = Some("short".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn metrics_cannot_be_enabled() {
        let mut config = minimal();
        config.relayer.enable_metrics = true;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            RelayerError::Configuration { ref key, .. } if key == "relayer.enableMetrics"
        ));
    }

    #[test]
    fn env_overlay_wins_over_the_file() {
        let mut config = minimal();
        config
            .apply_env(|name| match name {
                "ETHEREUM_CHAIN_ID" => Some("1".into()),
                "STORAGE_DIR" => Some("var/relayer".into()),
                "LOG_LEVEL" => Some("debug".into()),
                "NEAR_ACCOUNT_ID" => Some("other.testnet".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.ethereum.network.chain_id, 1);
        assert_eq!(config.relayer.storage_dir, "var/relayer");
        assert_eq!(config.relayer.log_level, "debug");
        assert_eq!(config.near.account_id, "other.testnet");

        let mut config = minimal();
        let err = config
            .apply_env(|name| (name == "ETHEREUM_CHAIN_ID").then(|| "not-a-number".into()))
            .unwrap_err();
        assert!(matches!(err, RelayerError::Configuration { .. }));
    }

    #[test]
    fn safe_reload_produces_new_live_params() {
        let config = minimal();
        let mut newer = config.clone();
        newer.relayer.polling_interval = 2000;
        newer.relayer.log_level = "debug".into();
        newer.relayer.max_retries = 5;

        let live = config.classify_reload(&newer).unwrap();
        assert_eq!(live.polling_interval_ms, 2000);
        assert_eq!(live.log_level, "debug");
        assert_eq!(live.policies.withdraw_tx.retries, 5);
    }

    #[test]
    fn unsafe_reload_is_rejected_per_field() {
        let config = minimal();

        let mut newer = config.clone();
        newer.ethereum.network.rpc_url = "https://other.example".into();
        let err = config.classify_reload(&newer).unwrap_err();
        assert!(matches!(
            err,
            RelayerError::Configuration {
                issue: ConfigIssue::UnsafeHotReload,
                ..
            }
        ));

        let mut newer = config.clone();
        newer.relayer.storage_dir = "elsewhere".into();
        assert!(config.classify_reload(&newer).is_err());

        let mut newer = config.clone();
        newer.near.private_key = format!("ed25519:{}", "B".repeat(44));
        assert!(config.classify_reload(&newer).is_err());
    }

    #[test]
    fn reloaded_values_are_still_validated() {
        let config = minimal();
        let mut newer = config.clone();
        newer.relayer.polling_interval = 999_999;
        assert!(config.classify_reload(&newer).is_err());
    }
}
