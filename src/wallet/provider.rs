//! The signing backends behind a wallet.
//!
//! # Responsibilities
//! - Give the submitter one `sign_and_send` contract over three backends
//! - Check balances before anything irrevocable happens
//! - Map backend failures onto the retry taxonomy
//!
//! # Design Decisions
//! - A closed enum, not a trait object: the set of backends is fixed and
//!   each variant owns its own state machine
//! - Providers receive the nonce reservation and decide themselves where
//!   the broadcast point lies (`wait_turn` / `finish_turn`)

use alloy::primitives::{Address, Bytes, TxHash, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::chain::rpc::ChainRpc;
use crate::chain::types::{ChainError, ChainId, ReceiptStatus, Token};
use crate::nonce::{NonceSource, Reservation};
use crate::wallet::custodial::CustodialProvider;
use crate::wallet::handle::ProviderKind;
use crate::wallet::multisig::MultisigProvider;
use crate::wallet::native::NativeProvider;

/// Failures of a wallet backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// A signer declined, or approvals did not reach threshold in time.
    #[error("Signature rejected: {0}")]
    SignatureRejected(String),

    /// Network or remote-service failure; worth retrying.
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    /// The balance check failed before broadcast.
    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    /// The chain or contract disagrees with the reserved nonce.
    #[error("Nonce conflict: {0}")]
    NonceConflict(String),

    /// The backend refused the transaction for any other reason.
    #[error("Transaction rejected: {0}")]
    Rejected(String),
}

impl From<ChainError> for ProviderError {
    fn from(err: ChainError) -> Self {
        match err {
            ChainError::NonceTooLow(msg) | ChainError::Underpriced(msg) => {
                ProviderError::NonceConflict(msg)
            }
            ChainError::InsufficientFunds(msg) => ProviderError::InsufficientFunds(msg),
            ChainError::Reverted(msg) => ProviderError::Rejected(msg),
            other => ProviderError::Unavailable(other.to_string()),
        }
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// A transfer ready to be signed with a reserved nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTransfer {
    /// Stable reference (the transaction id), used as idempotency key.
    pub reference: String,
    pub chain_id: ChainId,
    pub from: Address,
    pub to: Address,
    pub token: Token,
    pub amount: U256,
    pub nonce: u64,
}

/// Approval progress of a multisig proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approvals {
    pub count: u32,
    pub threshold: u32,
}

impl Approvals {
    pub fn is_met(&self) -> bool {
        self.count >= self.threshold
    }
}

/// Outcome of a successful `sign_and_send`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    /// Hash of the transaction whose inclusion finalizes the transfer.
    pub backend_tx_id: TxHash,
    pub approvals: Option<Approvals>,
}

/// Callback receiving approval progress while a provider waits on signers.
pub type ApprovalSink<'a> = &'a (dyn Fn(Approvals) + Send + Sync);

/// One of the three supported signing backends.
pub enum WalletProvider {
    Native(NativeProvider),
    Custodial(CustodialProvider),
    Multisig(MultisigProvider),
}

impl WalletProvider {
    pub fn kind(&self) -> ProviderKind {
        match self {
            WalletProvider::Native(_) => ProviderKind::Native,
            WalletProvider::Custodial(_) => ProviderKind::Custodial,
            WalletProvider::Multisig(_) => ProviderKind::Multisig,
        }
    }

    pub fn address(&self) -> Address {
        match self {
            WalletProvider::Native(p) => p.address(),
            WalletProvider::Custodial(p) => p.address(),
            WalletProvider::Multisig(p) => p.address(),
        }
    }

    /// Sign `transfer` and get it onto the chain.
    ///
    /// Returns once the transaction that settles the transfer has been
    /// broadcast; inclusion is the confirmation tracker's job.
    pub async fn sign_and_send(
        &self,
        transfer: &UnsignedTransfer,
        reservation: &Reservation,
        on_approval: ApprovalSink<'_>,
    ) -> ProviderResult<Submission> {
        match self {
            WalletProvider::Native(p) => p.sign_and_send(transfer, reservation).await,
            WalletProvider::Custodial(p) => p.sign_and_send(transfer, reservation).await,
            WalletProvider::Multisig(p) => p.sign_and_send(transfer, reservation, on_approval).await,
        }
    }

    /// The sequence this backend's nonces must follow.
    pub async fn account_nonce(&self) -> ProviderResult<u64> {
        match self {
            WalletProvider::Native(p) => p.account_nonce().await,
            WalletProvider::Custodial(p) => p.account_nonce().await,
            WalletProvider::Multisig(p) => p.account_nonce().await,
        }
    }
}

#[async_trait]
impl NonceSource for WalletProvider {
    async fn authoritative_nonce(&self) -> Result<u64, ChainError> {
        self.account_nonce()
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))
    }
}

/// Fail with `InsufficientFunds` unless `from` can cover `amount` of
/// `token` plus `gas_cost` wei of native coin.
pub async fn ensure_funds(
    rpc: &Arc<dyn ChainRpc>,
    chain: ChainId,
    from: Address,
    token: Token,
    amount: U256,
    gas_cost: U256,
) -> ProviderResult<()> {
    let native = rpc.get_token_balance(chain, from, Token::Native).await?;
    match token {
        Token::Native => {
            let needed = amount.saturating_add(gas_cost);
            if native < needed {
                return Err(ProviderError::InsufficientFunds(format!(
                    "balance {} wei, need {} wei",
                    native, needed
                )));
            }
        }
        Token::Erc20(_) => {
            let balance = rpc.get_token_balance(chain, from, token).await?;
            if balance < amount {
                return Err(ProviderError::InsufficientFunds(format!(
                    "token balance {}, need {}",
                    balance, amount
                )));
            }
            if native < gas_cost {
                return Err(ProviderError::InsufficientFunds(format!(
                    "balance {} wei cannot cover gas {} wei",
                    native, gas_cost
                )));
            }
        }
    }
    Ok(())
}

/// Broadcast `raw` and, if the node reports an error, ask whether it knows
/// `local_hash` anyway before giving up. A lost response must not lead to
/// the same nonce being spent twice.
pub async fn broadcast_checked(
    rpc: &Arc<dyn ChainRpc>,
    chain: ChainId,
    raw: Bytes,
    local_hash: TxHash,
) -> ProviderResult<TxHash> {
    match rpc.broadcast_raw_transaction(chain, raw).await {
        Ok(hash) => Ok(hash),
        Err(err @ ChainError::InsufficientFunds(_)) => Err(err.into()),
        Err(err) => match rpc.get_transaction_receipt(chain, local_hash).await {
            Ok(ReceiptStatus::Unknown) | Err(_) => Err(err.into()),
            Ok(_) => {
                tracing::warn!(
                    tx_hash = %local_hash,
                    error = %err,
                    "Broadcast reported an error but the node knows the transaction"
                );
                Ok(local_hash)
            }
        },
    }
}
