//! JSON-RPC client for one chain, with per-call timeouts and failover.
//!
//! # Responsibilities
//! - Connect to a chain's JSON-RPC endpoint plus ordered failovers
//! - Query chain state (nonces, balances, receipts, gas price)
//! - Broadcast signed transactions
//! - Map transport failures onto `ChainError` so callers can classify them

use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, Bytes, TxHash, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

use crate::chain::erc20::IERC20;
use crate::chain::types::{ChainError, ChainId, ChainResult, ReceiptStatus, Token};
use crate::config::schema::ChainConfig;
use crate::observability::metrics;

/// RPC client for one chain, with failover support.
#[derive(Clone)]
pub struct ChainClient {
    /// Providers in priority order (primary first).
    providers: Vec<DynProvider>,
    config: ChainConfig,
    timeout_duration: Duration,
}

impl ChainClient {
    /// Create a new client for `config`.
    ///
    /// Fails only on an unparsable primary URL; an unreachable endpoint is
    /// logged and tolerated so the service can start while a node is down.
    pub async fn new(config: ChainConfig) -> ChainResult<Self> {
        let timeout_duration = Duration::from_secs(config.rpc_timeout_secs);
        let mut providers = Vec::new();

        let primary_url: url::Url = config.rpc_url.parse().map_err(|e| {
            ChainError::Rpc(format!("Invalid RPC URL '{}': {}", config.rpc_url, e))
        })?;
        providers.push(ProviderBuilder::new().connect_http(primary_url).erased());

        for url_str in &config.failover_urls {
            match url_str.parse::<url::Url>() {
                Ok(url) => providers.push(ProviderBuilder::new().connect_http(url).erased()),
                Err(_) => tracing::warn!(url = %url_str, "Ignoring invalid failover RPC URL"),
            }
        }

        let client = Self {
            providers,
            config,
            timeout_duration,
        };

        match client.verify_chain_id().await {
            Ok(()) => tracing::info!(
                rpc_url = %client.config.rpc_url,
                chain_id = client.config.chain_id,
                "Chain client connected"
            ),
            Err(e) => tracing::warn!(
                chain_id = client.config.chain_id,
                error = %e,
                "Chain client up but chain id could not be verified"
            ),
        }

        Ok(client)
    }

    /// Run `op` against each provider in order until one answers.
    async fn with_failover<T, E, F, Fut>(&self, what: &str, op: F) -> ChainResult<T>
    where
        F: Fn(DynProvider) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut last_error = None;
        for (i, provider) in self.providers.iter().enumerate() {
            match timeout(self.timeout_duration, op(provider.clone())).await {
                Ok(Ok(result)) => return Ok(result),
                Ok(Err(e)) => {
                    tracing::warn!(provider_idx = i, chain_id = self.config.chain_id, error = %e, "RPC error");
                    last_error = Some(ChainError::from_rpc_message(e.to_string()));
                }
                Err(_) => {
                    tracing::warn!(provider_idx = i, chain_id = self.config.chain_id, "RPC timeout");
                    last_error = Some(ChainError::Timeout(self.config.rpc_timeout_secs));
                }
            }
        }
        Err(match last_error {
            Some(ChainError::Timeout(secs)) => ChainError::Timeout(secs),
            Some(e) => ChainError::Rpc(format!("All providers failed to {}: {}", what, e)),
            None => ChainError::Rpc(format!("No providers configured to {}", what)),
        })
    }

    /// Verify the connected chain ID matches configuration.
    pub async fn verify_chain_id(&self) -> ChainResult<()> {
        let actual = self
            .with_failover("get chain id", |p| async move { p.get_chain_id().await })
            .await?;
        if actual != self.config.chain_id {
            return Err(ChainError::ChainMismatch {
                expected: self.config.chain_id,
                actual,
            });
        }
        Ok(())
    }

    /// Get the latest block number.
    pub async fn get_block_number(&self) -> ChainResult<u64> {
        self.with_failover("get block number", |p| async move { p.get_block_number().await })
            .await
    }

    /// Get the pending transaction count (nonce) for an address.
    pub async fn get_transaction_count(&self, address: Address) -> ChainResult<u64> {
        self.with_failover("get transaction count", |p| async move {
            p.get_transaction_count(address).pending().await
        })
        .await
    }

    /// Get the balance of `address` in `token`.
    pub async fn get_token_balance(&self, address: Address, token: Token) -> ChainResult<U256> {
        match token {
            Token::Native => {
                self.with_failover("get balance", |p| async move { p.get_balance(address).await })
                    .await
            }
            Token::Erc20(contract) => {
                self.with_failover("get token balance", |p| async move {
                    IERC20::new(contract, p).balanceOf(address).call().await
                })
                .await
            }
        }
    }

    /// Get the decimals of `token`.
    pub async fn get_token_decimals(&self, token: Token) -> ChainResult<u8> {
        match token {
            Token::Native => Ok(Token::NATIVE_DECIMALS),
            Token::Erc20(contract) => {
                self.with_failover("get token decimals", |p| async move {
                    IERC20::new(contract, p).decimals().call().await
                })
                .await
            }
        }
    }

    /// Broadcast a signed transaction.
    ///
    /// Node rejections that say something about the transaction itself
    /// (nonce, funds, price) are returned immediately; only transport-level
    /// failures move on to the next provider.
    pub async fn send_raw_transaction(&self, raw: Bytes) -> ChainResult<TxHash> {
        let mut last_error = ChainError::Rpc("No providers configured".to_string());
        for (i, provider) in self.providers.iter().enumerate() {
            match timeout(self.timeout_duration, provider.send_raw_transaction(&raw)).await {
                Ok(Ok(pending)) => return Ok(*pending.tx_hash()),
                Ok(Err(e)) => {
                    let classified = ChainError::from_rpc_message(e.to_string());
                    if !matches!(classified, ChainError::Rpc(_)) {
                        return Err(classified);
                    }
                    tracing::warn!(provider_idx = i, error = %e, "Broadcast failed, trying next provider");
                    last_error = classified;
                }
                Err(_) => {
                    tracing::warn!(provider_idx = i, "Broadcast timeout, trying next provider");
                    last_error = ChainError::Timeout(self.config.rpc_timeout_secs);
                }
            }
        }
        Err(last_error)
    }

    /// Resolve the inclusion state of `tx_hash`.
    pub async fn get_receipt_status(&self, tx_hash: TxHash) -> ChainResult<ReceiptStatus> {
        let receipt = self
            .with_failover("get receipt", |p| async move {
                p.get_transaction_receipt(tx_hash).await
            })
            .await?;

        match receipt {
            Some(receipt) => {
                let current_block = self.get_block_number().await?;
                let block_number = receipt.block_number.unwrap_or(current_block);
                if !receipt.status() {
                    return Ok(ReceiptStatus::Reverted { block_number });
                }
                // The inclusion block itself counts as the first confirmation.
                let confirmations = current_block.saturating_sub(block_number) as u32 + 1;
                Ok(ReceiptStatus::Included {
                    block_number,
                    confirmations,
                })
            }
            None => {
                let known = self
                    .with_failover("get transaction", |p| async move {
                        p.get_transaction_by_hash(tx_hash).await
                    })
                    .await?;
                Ok(if known.is_some() {
                    ReceiptStatus::Pending
                } else {
                    ReceiptStatus::Unknown
                })
            }
        }
    }

    /// Current gas price in wei, with the safety multiplier applied.
    pub async fn get_gas_price(&self) -> ChainResult<u128> {
        let gas_price = self
            .with_failover("get gas price", |p| async move { p.get_gas_price().await })
            .await?;
        let gas_price_gwei = gas_price / 1_000_000_000;

        if gas_price_gwei > self.config.max_gas_price_gwei as u128 {
            return Err(ChainError::GasPriceTooHigh {
                current_gwei: gas_price_gwei as u64,
                max_gwei: self.config.max_gas_price_gwei,
            });
        }

        Ok((gas_price as f64 * self.config.gas_price_multiplier) as u128)
    }

    /// Estimate the gas limit of a call.
    pub async fn estimate_gas(
        &self,
        from: Address,
        to: Address,
        value: U256,
        data: Bytes,
    ) -> ChainResult<u64> {
        let request = TransactionRequest::default()
            .with_from(from)
            .with_to(to)
            .with_value(value)
            .with_input(data);
        self.with_failover("estimate gas", |p| {
            let request = request.clone();
            async move { p.estimate_gas(request).await }
        })
        .await
    }

    /// Check if the chain is reachable.
    pub async fn is_healthy(&self) -> bool {
        let healthy = self.get_block_number().await.is_ok();
        metrics::record_rpc_health(ChainId(self.config.chain_id), healthy);
        healthy
    }

    /// Get the configuration.
    pub fn config(&self) -> &ChainConfig {
        &self.config
    }
}

impl std::fmt::Debug for ChainClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainClient")
            .field("rpc_url", &self.config.rpc_url)
            .field("chain_id", &self.config.chain_id)
            .field("providers", &self.providers.len())
            .field("timeout_secs", &self.config.rpc_timeout_secs)
            .finish()
    }
}
