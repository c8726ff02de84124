//! Configuration management for the transfer orchestrator
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub fees: FeeConfig,
    #[serde(default)]
    pub nonce: NonceConfig,
    #[serde(default)]
    pub receipts: ReceiptConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub chains: HashMap<String, ChainConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub request_timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
        }
    }
}

impl RpcConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TxType {
    Legacy,
    Eip1559,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeeConfig {
    pub tx_type: TxType,
    /// Headroom added on top of simulated gas, in percent
    pub gas_limit_buffer_percent: u64,
    /// Base-fee multiplier absorbing a few full blocks between estimate and inclusion
    pub base_fee_multiplier: u64,
    pub default_priority_fee_wei: u64,
    pub max_fee_per_gas_wei: Option<u128>,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            tx_type: TxType::Eip1559,
            gas_limit_buffer_percent: 20,
            base_fee_multiplier: 2,
            default_priority_fee_wei: 2_000_000_000,
            max_fee_per_gas_wei: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NonceConfig {
    pub lease_timeout_secs: u64,
}

impl Default for NonceConfig {
    fn default() -> Self {
        Self {
            lease_timeout_secs: 60,
        }
    }
}

impl NonceConfig {
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReceiptConfig {
    pub poll_interval_ms: u64,
    pub timeout_secs: u64,
}

impl Default for ReceiptConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            timeout_secs: 120,
        }
    }
}

impl ReceiptConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    pub address_scan_limit: u32,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            address_scan_limit: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub json: bool,
}

#[derive(Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub rpc_url: String,
    /// Hex private key of the account this service signs with
    pub private_key: Option<String>,
    /// HD wallet phrase, used when no private key is given
    pub mnemonic: Option<String>,
    pub passphrase: Option<String>,
    /// Derivation index of the signing account (default 0)
    pub account_index: Option<u32>,
    /// Resolve the signing account by address instead of index
    pub account_address: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

// Keeps the private key out of logs
impl std::fmt::Debug for ChainConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainConfig")
            .field("chain_id", &self.chain_id)
            .field("rpc_url", &self.rpc_url)
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("mnemonic", &self.mnemonic.as_ref().map(|_| "<redacted>"))
            .field("account_index", &self.account_index)
            .field("account_address", &self.account_address)
            .field("enabled", &self.enabled)
            .finish()
    }
}

fn default_enabled() -> bool {
    true
}

impl Settings {
    /// Load settings from the file named by `TRANSFER_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("TRANSFER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    /// Parse settings from TOML text
    pub fn parse(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        // At least one chain must be enabled
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        for (name, chain) in self.enabled_chains() {
            if chain.rpc_url.trim().is_empty() {
                anyhow::bail!(
                    "Chain {} has an empty rpc_url; set the environment variable it references or disable the chain",
                    name
                );
            }
            url::Url::parse(&chain.rpc_url)
                .with_context(|| format!("Chain {} has an invalid rpc_url", name))?;
            if chain.private_key.as_deref().map_or(false, str::is_empty) {
                tracing::warn!("Chain {} has an empty private key - will run read-only", name);
            }
            if chain.account_index.is_some() && chain.account_address.is_some() {
                anyhow::bail!("Chain {} sets both account_index and account_address", name);
            }
        }

        if self.rpc.request_timeout_ms == 0 {
            anyhow::bail!("rpc.request_timeout_ms must be positive");
        }
        if self.receipts.poll_interval_ms == 0 || self.receipts.timeout_secs == 0 {
            anyhow::bail!("receipts.poll_interval_ms and receipts.timeout_secs must be positive");
        }
        if self.nonce.lease_timeout_secs == 0 {
            anyhow::bail!("nonce.lease_timeout_secs must be positive");
        }
        if self.fees.base_fee_multiplier == 0 {
            anyhow::bail!("fees.base_fee_multiplier must be at least 1");
        }
        if self.fees.gas_limit_buffer_percent > 200 {
            anyhow::bail!("fees.gas_limit_buffer_percent must not exceed 200");
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }

    /// Get chain config by chain ID
    pub fn get_chain_by_id(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.values().find(|c| c.chain_id == chain_id)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static pattern");
    }

    ENV_VAR
        .replace_all(input, |cap: &regex::Captures| {
            env::var(&cap[1]).unwrap_or_default()
        })
        .into_owned()
}
