//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the wallet
//! service. All types derive Serde traits for deserialization from config
//! files. Key material never appears here: only the names of the environment
//! variables that hold it.

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::chain::types::Token;
use crate::limits::WindowMode;
use crate::wallet::handle::ProviderKind;

/// Root configuration for the wallet service.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Chains the service can reach.
    pub chains: Vec<ChainConfig>,

    /// Wallets loaded into the registry at startup.
    pub wallets: Vec<WalletConfig>,

    /// Operator-configured spending caps.
    pub spending_limits: Vec<SpendingLimitConfig>,

    /// Spending window semantics.
    pub limits: LimitsConfig,

    /// Retry policy of the transaction submitter.
    pub submitter: SubmitterConfig,

    /// Confirmation tracking.
    pub tracker: TrackerConfig,

    /// Remote-signer approval waits.
    pub custody: CustodyConfig,

    /// Multisig approval waits.
    pub multisig: MultisigConfig,

    /// Transaction journal.
    pub storage: StorageConfig,

    /// HTTP API exposed to the agent layer.
    pub api: ApiConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Look up the configuration of `chain_id`.
    pub fn chain(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.chain_id == chain_id)
    }
}

/// Blockchain RPC configuration for a single chain.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChainConfig {
    /// JSON-RPC endpoint URL.
    pub rpc_url: String,

    /// Failover JSON-RPC endpoint URLs.
    pub failover_urls: Vec<String>,

    /// Chain ID (e.g., 1 for Ethereum mainnet, 8453 for Base, 31337 for Anvil).
    pub chain_id: u64,

    /// RPC request timeout in seconds.
    pub rpc_timeout_secs: u64,

    /// Number of block confirmations required for finality.
    pub confirmation_blocks: u32,

    /// Gas price multiplier (1.0 = estimated, 1.2 = 20% buffer).
    pub gas_price_multiplier: f64,

    /// Maximum gas price in gwei (protection against spikes).
    pub max_gas_price_gwei: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://localhost:8545".to_string(),
            failover_urls: Vec::new(),
            chain_id: 1,
            rpc_timeout_secs: 10,
            confirmation_blocks: 3,
            gas_price_multiplier: 1.2,
            max_gas_price_gwei: 500,
        }
    }
}

/// A wallet the service may move funds from.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WalletConfig {
    /// Unique wallet identifier used by callers.
    pub id: String,

    /// Signing backend.
    pub kind: ProviderKind,

    /// Chain the wallet lives on.
    pub chain_id: u64,

    /// On-chain address. Derived from the key for native wallets; required
    /// for custodial and multisig wallets.
    #[serde(default)]
    pub address: Option<Address>,

    /// Environment variable holding the hex private key (native wallets).
    #[serde(default)]
    pub key_env: Option<String>,

    /// Remote custody settings (custodial wallets).
    #[serde(default)]
    pub custody: Option<CustodialWalletConfig>,

    /// Multisig settings (multisig wallets).
    #[serde(default)]
    pub multisig: Option<MultisigWalletConfig>,
}

/// Remote custody service coordinates for one wallet.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CustodialWalletConfig {
    /// Base URL of the custody API.
    pub endpoint: String,

    /// The custody service's identifier for this wallet.
    pub remote_wallet_id: String,

    /// Environment variable holding the custody API key.
    pub api_key_env: String,
}

/// Multisig wallet settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MultisigWalletConfig {
    /// Environment variable holding the private key of the owner this
    /// service proposes, confirms and executes with.
    pub owner_key_env: String,
}

/// A spending cap for one (wallet, token) pair.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SpendingLimitConfig {
    /// Wallet identifier.
    pub wallet: String,

    /// `"native"` or an ERC20 contract address.
    pub token: Token,

    /// Cap in human units, e.g. `"100"` or `"0.5"`.
    pub cap: String,

    /// Token decimals used to convert `cap` to base units (18 if omitted).
    #[serde(default)]
    pub decimals: Option<u8>,

    /// Window length in seconds.
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,
}

fn default_period_secs() -> u64 {
    86_400
}

/// Spending window settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// `fixed` resets the whole window on expiry; `rolling` slides it.
    pub window_mode: WindowMode,
}

/// Retry configuration for submissions.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SubmitterConfig {
    /// Maximum provider attempts per transfer.
    pub max_attempts: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,

    /// Nonce resynchronisations tolerated per transfer before giving up.
    pub max_nonce_resyncs: u32,
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 250,
            max_delay_ms: 5_000,
            max_nonce_resyncs: 5,
        }
    }
}

/// Confirmation tracker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Receipt polling interval in milliseconds.
    pub poll_interval_ms: u64,

    /// Time a submitted transaction may take to reach finality before it is
    /// declared dropped.
    pub finality_timeout_secs: u64,

    /// Consecutive polls in which the node does not know the transaction at
    /// all before it is considered evicted.
    pub eviction_grace_polls: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            finality_timeout_secs: 300,
            eviction_grace_polls: 5,
        }
    }
}

/// Custodial signer timing.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CustodyConfig {
    /// Maximum wait for an asynchronous approval.
    pub approval_timeout_secs: u64,

    /// Approval polling interval in milliseconds.
    pub poll_interval_ms: u64,

    /// Timeout of a single HTTP round trip.
    pub request_timeout_secs: u64,
}

impl Default for CustodyConfig {
    fn default() -> Self {
        Self {
            approval_timeout_secs: 600,
            poll_interval_ms: 3_000,
            request_timeout_secs: 15,
        }
    }
}

/// Multisig approval timing.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MultisigConfig {
    /// Maximum wait for a proposal to reach its threshold.
    pub confirmation_timeout_secs: u64,

    /// Approval polling interval in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for MultisigConfig {
    fn default() -> Self {
        Self {
            confirmation_timeout_secs: 3_600,
            poll_interval_ms: 5_000,
        }
    }
}

/// Transaction journal settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Append-only JSON-lines journal. `None` keeps records in memory only.
    pub journal_path: Option<PathBuf>,
}

/// HTTP API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Serve the API.
    pub enabled: bool,

    /// Bind address.
    pub bind_address: String,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1:8080".to_string(),
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            request_timeout_secs: 30,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log filter (e.g. `info` or `agent_wallet=debug,info`).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
