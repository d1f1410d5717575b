//! Locally held private key.
//!
//! # Security
//! - Private keys are loaded ONLY from environment variables
//! - Keys are never logged or serialized

use alloy::eips::eip2718::Encodable2718;
use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, Bytes, U256};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use std::fmt;
use std::sync::Arc;

use crate::chain::erc20::transfer_call;
use crate::chain::rpc::ChainRpc;
use crate::chain::types::ChainId;
use crate::nonce::Reservation;
use crate::wallet::provider::{broadcast_checked, ensure_funds, ProviderError, ProviderResult, Submission, UnsignedTransfer};

/// Parse a hex private key, with or without `0x` prefix.
pub fn parse_private_key(private_key_hex: &str) -> ProviderResult<PrivateKeySigner> {
    let key_hex = private_key_hex.trim();
    let key_hex = key_hex.strip_prefix("0x").unwrap_or(key_hex);
    key_hex
        .parse()
        .map_err(|e| ProviderError::Rejected(format!("Invalid private key format: {}", e)))
}

/// Load a signer from the environment variable `var`.
pub fn signer_from_env(var: &str) -> ProviderResult<PrivateKeySigner> {
    let private_key = std::env::var(var)
        .map_err(|_| ProviderError::Rejected(format!("Environment variable {} not set", var)))?;
    parse_private_key(&private_key)
}

/// Gas-priced on-chain call that moves a transfer's funds.
#[derive(Debug, Clone)]
pub(crate) struct PreparedCall {
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub gas_limit: u64,
    pub gas_price: u128,
}

impl PreparedCall {
    /// Estimate gas and price for `transfer`.
    pub async fn prepare(rpc: &Arc<dyn ChainRpc>, transfer: &UnsignedTransfer) -> ProviderResult<Self> {
        let (to, value, data) = transfer_call(transfer.token, transfer.to, transfer.amount);
        let gas_price = rpc.get_gas_price(transfer.chain_id).await?;
        let gas_limit = rpc
            .estimate_gas(transfer.chain_id, transfer.from, to, value, data.clone())
            .await?;
        Ok(Self {
            to,
            value,
            data,
            gas_limit,
            gas_price,
        })
    }

    /// Worst-case fee in wei.
    pub fn gas_cost(&self) -> U256 {
        U256::from(self.gas_limit).saturating_mul(U256::from(self.gas_price))
    }

    /// Legacy-priced request carrying `nonce`.
    pub fn request(&self, transfer: &UnsignedTransfer) -> TransactionRequest {
        TransactionRequest::default()
            .with_from(transfer.from)
            .with_to(self.to)
            .with_value(self.value)
            .with_input(self.data.clone())
            .with_nonce(transfer.nonce)
            .with_chain_id(transfer.chain_id.0)
            .with_gas_limit(self.gas_limit)
            .with_gas_price(self.gas_price)
    }
}

/// Single-phase build, sign, broadcast.
pub struct NativeProvider {
    wallet: EthereumWallet,
    address: Address,
    chain_id: ChainId,
    rpc: Arc<dyn ChainRpc>,
}

impl NativeProvider {
    pub fn new(signer: PrivateKeySigner, chain_id: ChainId, rpc: Arc<dyn ChainRpc>) -> Self {
        let address = signer.address();
        tracing::info!(address = %address, chain_id = %chain_id, "Native signer initialized");
        Self {
            wallet: EthereumWallet::from(signer),
            address,
            chain_id,
            rpc,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub async fn account_nonce(&self) -> ProviderResult<u64> {
        Ok(self.rpc.get_account_nonce(self.chain_id, self.address).await?)
    }

    pub async fn sign_and_send(
        &self,
        transfer: &UnsignedTransfer,
        reservation: &Reservation,
    ) -> ProviderResult<Submission> {
        let call = PreparedCall::prepare(&self.rpc, transfer).await?;
        ensure_funds(
            &self.rpc,
            self.chain_id,
            self.address,
            transfer.token,
            transfer.amount,
            call.gas_cost(),
        )
        .await?;

        let envelope = call
            .request(transfer)
            .build(&self.wallet)
            .await
            .map_err(|e| ProviderError::Rejected(format!("Signing failed: {}", e)))?;
        let local_hash = *envelope.tx_hash();
        let raw = Bytes::from(envelope.encoded_2718());

        reservation.wait_turn().await;
        let tx_hash = broadcast_checked(&self.rpc, self.chain_id, raw, local_hash).await?;
        reservation.finish_turn().await;

        if tx_hash != local_hash {
            tracing::warn!(local = %local_hash, node = %tx_hash, "Node reported a different transaction hash");
        }
        tracing::info!(
            tx_hash = %tx_hash,
            nonce = transfer.nonce,
            from = %self.address,
            "Native transaction broadcast"
        );
        Ok(Submission {
            backend_tx_id: tx_hash,
            approvals: None,
        })
    }
}

impl fmt::Debug for NativeProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeProvider")
            .field("address", &self.address)
            .field("chain_id", &self.chain_id)
            .finish_non_exhaustive()
    }
}
