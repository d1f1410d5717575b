//! The narrow interface through which the wallet layer talks to chains.

use alloy::primitives::{Address, Bytes, TxHash, U256};
use async_trait::async_trait;

use crate::chain::types::{ChainId, ChainResult, ReceiptStatus, Token};

/// Blockchain RPC collaborator.
///
/// Implementations are shared read-only across every wallet; they must be
/// safe to call concurrently.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Next account nonce as seen by the node, including pending transactions.
    async fn get_account_nonce(&self, chain: ChainId, address: Address) -> ChainResult<u64>;

    /// Submit a signed, EIP-2718 encoded transaction.
    async fn broadcast_raw_transaction(&self, chain: ChainId, signed_tx: Bytes)
        -> ChainResult<TxHash>;

    /// Inclusion state of a previously broadcast transaction.
    async fn get_transaction_receipt(
        &self,
        chain: ChainId,
        tx_hash: TxHash,
    ) -> ChainResult<ReceiptStatus>;

    /// Balance of `address` in base units of `token`.
    async fn get_token_balance(
        &self,
        chain: ChainId,
        address: Address,
        token: Token,
    ) -> ChainResult<U256>;

    /// Decimals of `token` (18 for the native coin).
    async fn get_token_decimals(&self, chain: ChainId, token: Token) -> ChainResult<u8>;

    /// Latest block number.
    async fn get_block_number(&self, chain: ChainId) -> ChainResult<u64>;

    /// Gas price in wei, already adjusted by the configured safety multiplier.
    async fn get_gas_price(&self, chain: ChainId) -> ChainResult<u128>;

    /// Gas limit estimate for a call.
    async fn estimate_gas(
        &self,
        chain: ChainId,
        from: Address,
        to: Address,
        value: U256,
        data: Bytes,
    ) -> ChainResult<u64>;

    /// Block depth required before an inclusion counts as final.
    fn confirmation_blocks(&self, chain: ChainId) -> u32;
}
