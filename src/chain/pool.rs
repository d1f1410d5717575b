//! Multi-chain RPC pool: the production [`ChainRpc`] implementation.

use alloy::primitives::{Address, Bytes, TxHash, U256};
use async_trait::async_trait;
use std::collections::HashMap;

use crate::chain::client::ChainClient;
use crate::chain::rpc::ChainRpc;
use crate::chain::types::{ChainError, ChainId, ChainResult, ReceiptStatus, Token};
use crate::config::schema::ChainConfig;

/// One [`ChainClient`] per configured chain.
#[derive(Debug, Clone, Default)]
pub struct RpcPool {
    clients: HashMap<ChainId, ChainClient>,
}

impl RpcPool {
    /// Connect to every configured chain.
    pub async fn connect<'a, I>(chains: I) -> ChainResult<Self>
    where
        I: IntoIterator<Item = &'a ChainConfig>,
    {
        let mut clients = HashMap::new();
        for config in chains {
            let client = ChainClient::new(config.clone()).await?;
            clients.insert(ChainId(config.chain_id), client);
        }
        Ok(Self { clients })
    }

    /// Client for `chain`.
    pub fn client(&self, chain: ChainId) -> ChainResult<&ChainClient> {
        self.clients.get(&chain).ok_or(ChainError::UnknownChain(chain))
    }

    pub fn chains(&self) -> impl Iterator<Item = ChainId> + '_ {
        self.clients.keys().copied()
    }

    /// Probe every chain and report how many are reachable.
    pub async fn check_health(&self) -> usize {
        let mut healthy = 0;
        for client in self.clients.values() {
            if client.is_healthy().await {
                healthy += 1;
            }
        }
        healthy
    }
}

#[async_trait]
impl ChainRpc for RpcPool {
    async fn get_account_nonce(&self, chain: ChainId, address: Address) -> ChainResult<u64> {
        self.client(chain)?.get_transaction_count(address).await
    }

    async fn broadcast_raw_transaction(
        &self,
        chain: ChainId,
        signed_tx: Bytes,
    ) -> ChainResult<TxHash> {
        self.client(chain)?.send_raw_transaction(signed_tx).await
    }

    async fn get_transaction_receipt(
        &self,
        chain: ChainId,
        tx_hash: TxHash,
    ) -> ChainResult<ReceiptStatus> {
        self.client(chain)?.get_receipt_status(tx_hash).await
    }

    async fn get_token_balance(
        &self,
        chain: ChainId,
        address: Address,
        token: Token,
    ) -> ChainResult<U256> {
        self.client(chain)?.get_token_balance(address, token).await
    }

    async fn get_token_decimals(&self, chain: ChainId, token: Token) -> ChainResult<u8> {
        self.client(chain)?.get_token_decimals(token).await
    }

    async fn get_block_number(&self, chain: ChainId) -> ChainResult<u64> {
        self.client(chain)?.get_block_number().await
    }

    async fn get_gas_price(&self, chain: ChainId) -> ChainResult<u128> {
        self.client(chain)?.get_gas_price().await
    }

    async fn estimate_gas(
        &self,
        chain: ChainId,
        from: Address,
        to: Address,
        value: U256,
        data: Bytes,
    ) -> ChainResult<u64> {
        self.client(chain)?.estimate_gas(from, to, value, data).await
    }

    fn confirmation_blocks(&self, chain: ChainId) -> u32 {
        self.clients
            .get(&chain)
            .map(|c| c.config().confirmation_blocks)
            .unwrap_or(1)
    }
}
