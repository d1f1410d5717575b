//! On-chain multisig wallet.
//!
//! # Data Flow
//! ```text
//! transfer
//!     → balance check (funds sit in the multisig contract)
//!     → wait for broadcast turn
//!     → propose (our owner's approval included)
//!     → poll approvals until threshold | timeout (abandoned, not retried)
//!     → execute
//! ```
//!
//! # Design Decisions
//! - The contract's proposal counter is the nonce sequence; it is
//!   independent of the owner's account nonce
//! - Proposals are broadcast in reservation order but may execute in any
//!   order once they reach threshold
//! - A proposal whose submission errored may still land; the contract is
//!   checked for it before anything is proposed again for the same transfer

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, Bytes, TxHash, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::sol;
use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

use crate::chain::erc20::transfer_call;
use crate::chain::rpc::ChainRpc;
use crate::chain::types::{ChainError, ChainId};
use crate::config::schema::MultisigConfig;
use crate::nonce::Reservation;
use crate::wallet::provider::{
    ensure_funds, ApprovalSink, Approvals, ProviderError, ProviderResult, Submission, UnsignedTransfer,
};

sol! {
    #[sol(rpc)]
    interface IMultiSigWallet {
        event Submission(uint256 indexed transactionId);
        event Execution(uint256 indexed transactionId);
        event ExecutionFailure(uint256 indexed transactionId);

        function submitTransaction(address destination, uint256 value, bytes data) external returns (uint256 transactionId);
        function confirmTransaction(uint256 transactionId) external;
        function executeTransaction(uint256 transactionId) external;
        function getConfirmationCount(uint256 transactionId) external view returns (uint256 count);
        function required() external view returns (uint256);
        function transactionCount() external view returns (uint256);
        function confirmations(uint256 transactionId, address owner) external view returns (bool);
        function transactions(uint256 transactionId) external view returns (address destination, uint256 value, bytes data, bool executed);
    }
}

/// A proposal recorded by the multisig contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proposal {
    pub id: u64,
    /// Hash of the proposing transaction; unknown for a proposal found on
    /// the contract after its submission errored.
    pub tx_hash: Option<TxHash>,
}

/// The call a proposal will make when executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposedCall {
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub executed: bool,
}

impl ProposedCall {
    fn is_call(&self, to: Address, value: U256, data: &Bytes) -> bool {
        self.to == to && self.value == value && &self.data == data
    }
}

/// The multisig contract collaborator.
#[async_trait]
pub trait MultisigBackend: Send + Sync {
    /// Number of proposals ever made; the id the next proposal will get.
    async fn proposal_count(&self) -> ProviderResult<u64>;

    /// Submit a proposal. The proposing owner's approval is included.
    async fn propose(&self, to: Address, value: U256, data: Bytes) -> ProviderResult<Proposal>;

    /// The proposal with this id, or `None` if the contract has not recorded it.
    async fn proposal(&self, proposal_id: u64) -> ProviderResult<Option<ProposedCall>>;

    /// Add this service's owner approval, if not already given.
    async fn confirm(&self, proposal_id: u64) -> ProviderResult<()>;

    /// Current approvals against the threshold.
    async fn approvals(&self, proposal_id: u64) -> ProviderResult<Approvals>;

    /// Execute a proposal that reached threshold.
    ///
    /// Returns `None` when the contract already executed it, e.g. as part of
    /// the final confirmation.
    async fn execute(&self, proposal_id: u64) -> ProviderResult<Option<TxHash>>;
}

fn contract_error(err: impl fmt::Display) -> ProviderError {
    ChainError::from_rpc_message(err.to_string()).into()
}

/// `MultisigBackend` over the classic multi-signature wallet contract.
pub struct AlloyMultisig {
    contract: IMultiSigWallet::IMultiSigWalletInstance<DynProvider>,
    owner: Address,
}

impl AlloyMultisig {
    /// Connect to `contract` on `rpc_url`, sending as the owner `signer`.
    pub fn connect(
        rpc_url: &str,
        contract: Address,
        signer: alloy::signers::local::PrivateKeySigner,
    ) -> ProviderResult<Self> {
        let url: Url = rpc_url
            .parse()
            .map_err(|e| ProviderError::Rejected(format!("Invalid RPC URL '{}': {}", rpc_url, e)))?;
        let owner = signer.address();
        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .connect_http(url)
            .erased();
        Ok(Self {
            contract: IMultiSigWallet::new(contract, provider),
            owner,
        })
    }

    pub fn owner(&self) -> Address {
        self.owner
    }
}

#[async_trait]
impl MultisigBackend for AlloyMultisig {
    async fn proposal_count(&self) -> ProviderResult<u64> {
        let count = self
            .contract
            .transactionCount()
            .call()
            .await
            .map_err(contract_error)?;
        Ok(count.saturating_to::<u64>())
    }

    async fn propose(&self, to: Address, value: U256, data: Bytes) -> ProviderResult<Proposal> {
        let receipt = self
            .contract
            .submitTransaction(to, value, data)
            .send()
            .await
            .map_err(contract_error)?
            .get_receipt()
            .await
            .map_err(contract_error)?;
        if !receipt.status() {
            return Err(ProviderError::Rejected(format!(
                "proposal transaction {} reverted",
                receipt.transaction_hash
            )));
        }
        let id = receipt
            .inner
            .logs()
            .iter()
            .find_map(|log| log.log_decode::<IMultiSigWallet::Submission>().ok())
            .map(|event| event.inner.data.transactionId.saturating_to::<u64>())
            .ok_or_else(|| ProviderError::Rejected("proposal emitted no Submission event".to_string()))?;
        Ok(Proposal {
            id,
            tx_hash: Some(receipt.transaction_hash),
        })
    }

    async fn proposal(&self, proposal_id: u64) -> ProviderResult<Option<ProposedCall>> {
        if proposal_id >= self.proposal_count().await? {
            return Ok(None);
        }
        let proposal = self
            .contract
            .transactions(U256::from(proposal_id))
            .call()
            .await
            .map_err(contract_error)?;
        Ok(Some(ProposedCall {
            to: proposal.destination,
            value: proposal.value,
            data: proposal.data,
            executed: proposal.executed,
        }))
    }

    async fn confirm(&self, proposal_id: u64) -> ProviderResult<()> {
        let id = U256::from(proposal_id);
        let already = self
            .contract
            .confirmations(id, self.owner)
            .call()
            .await
            .map_err(contract_error)?;
        if already {
            return Ok(());
        }
        self.contract
            .confirmTransaction(id)
            .send()
            .await
            .map_err(contract_error)?
            .get_receipt()
            .await
            .map_err(contract_error)?;
        Ok(())
    }

    async fn approvals(&self, proposal_id: u64) -> ProviderResult<Approvals> {
        let count = self
            .contract
            .getConfirmationCount(U256::from(proposal_id))
            .call()
            .await
            .map_err(contract_error)?;
        let threshold = self.contract.required().call().await.map_err(contract_error)?;
        Ok(Approvals {
            count: count.saturating_to::<u32>(),
            threshold: threshold.saturating_to::<u32>(),
        })
    }

    async fn execute(&self, proposal_id: u64) -> ProviderResult<Option<TxHash>> {
        let id = U256::from(proposal_id);
        let proposal = self.contract.transactions(id).call().await.map_err(contract_error)?;
        if proposal.executed {
            return Ok(None);
        }
        let receipt = self
            .contract
            .executeTransaction(id)
            .send()
            .await
            .map_err(contract_error)?
            .get_receipt()
            .await
            .map_err(contract_error)?;
        let failed = receipt
            .inner
            .logs()
            .iter()
            .any(|log| log.log_decode::<IMultiSigWallet::ExecutionFailure>().is_ok());
        if failed || !receipt.status() {
            return Err(ProviderError::Rejected(format!(
                "multisig execution of proposal {} failed",
                proposal_id
            )));
        }
        Ok(Some(receipt.transaction_hash))
    }
}

impl fmt::Debug for AlloyMultisig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlloyMultisig")
            .field("contract", self.contract.address())
            .field("owner", &self.owner)
            .finish()
    }
}

/// Propose, collect approvals, execute.
pub struct MultisigProvider {
    backend: Arc<dyn MultisigBackend>,
    address: Address,
    chain_id: ChainId,
    rpc: Arc<dyn ChainRpc>,
    confirmation_timeout: Duration,
    poll_interval: Duration,
    /// Transfer reference to the proposal id a failed submission may have taken.
    unsettled: DashMap<String, u64>,
}

impl MultisigProvider {
    pub fn new(
        backend: Arc<dyn MultisigBackend>,
        address: Address,
        chain_id: ChainId,
        rpc: Arc<dyn ChainRpc>,
        config: &MultisigConfig,
    ) -> Self {
        Self {
            backend,
            address,
            chain_id,
            rpc,
            confirmation_timeout: Duration::from_secs(config.confirmation_timeout_secs),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            unsettled: DashMap::new(),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub async fn account_nonce(&self) -> ProviderResult<u64> {
        self.backend.proposal_count().await
    }

    pub async fn sign_and_send(
        &self,
        transfer: &UnsignedTransfer,
        reservation: &Reservation,
        on_approval: ApprovalSink<'_>,
    ) -> ProviderResult<Submission> {
        // Gas is paid by the proposing owner, not by the contract.
        ensure_funds(
            &self.rpc,
            self.chain_id,
            self.address,
            transfer.token,
            transfer.amount,
            U256::ZERO,
        )
        .await?;
        let (to, value, data) = transfer_call(transfer.token, transfer.to, transfer.amount);

        reservation.wait_turn().await;
        let expected = self.backend.proposal_count().await?;
        let proposal = match self.find_unsettled(&transfer.reference, to, value, &data).await? {
            Some(proposal) => proposal,
            None => {
                if expected != transfer.nonce {
                    return Err(ProviderError::NonceConflict(format!(
                        "contract expects proposal {}, reserved {}",
                        expected, transfer.nonce
                    )));
                }
                match self.backend.propose(to, value, data.clone()).await {
                    Ok(proposal) => proposal,
                    Err(e) => {
                        self.unsettled.insert(transfer.reference.clone(), expected);
                        match self.find_unsettled(&transfer.reference, to, value, &data).await {
                            Ok(Some(proposal)) => proposal,
                            _ => return Err(e),
                        }
                    }
                }
            }
        };
        if proposal.id != transfer.nonce {
            tracing::warn!(
                reserved = transfer.nonce,
                proposal = proposal.id,
                "Proposal id differs from reserved nonce"
            );
        }
        // A proposal adopted from a lower slot leaves the reserved nonce unused.
        if proposal.id < transfer.nonce {
            reservation.yield_turn().await;
        } else {
            reservation.finish_turn().await;
        }
        tracing::info!(
            proposal = proposal.id,
            tx_hash = ?proposal.tx_hash,
            multisig = %self.address,
            "Multisig proposal submitted"
        );

        // Past this point the proposal exists on chain; a retry would
        // create a second one, so nothing below may fail as retryable.
        if let Err(e) = self.backend.confirm(proposal.id).await {
            tracing::warn!(proposal = proposal.id, error = %e, "Own confirmation failed; waiting for other owners");
        }
        let approvals = self.await_threshold(proposal.id, on_approval).await?;

        let tx_hash = match self.backend.execute(proposal.id).await {
            Ok(Some(hash)) => hash,
            Ok(None) => match proposal.tx_hash {
                Some(hash) => hash,
                None => {
                    tracing::error!(
                        proposal = proposal.id,
                        multisig = %self.address,
                        "Proposal executed by another owner; settling transaction unknown"
                    );
                    return Err(ProviderError::Rejected(format!(
                        "proposal {} was executed outside this service",
                        proposal.id
                    )));
                }
            },
            Err(e) => {
                return Err(ProviderError::Rejected(format!(
                    "proposal {} approved but execution failed: {}",
                    proposal.id, e
                )))
            }
        };
        tracing::info!(
            proposal = proposal.id,
            tx_hash = %tx_hash,
            approvals = approvals.count,
            threshold = approvals.threshold,
            "Multisig proposal executed"
        );
        Ok(Submission {
            backend_tx_id: tx_hash,
            approvals: Some(approvals),
        })
    }

    /// Look on the contract for a proposal an earlier, errored submission
    /// of this transfer may have created.
    async fn find_unsettled(
        &self,
        reference: &str,
        to: Address,
        value: U256,
        data: &Bytes,
    ) -> ProviderResult<Option<Proposal>> {
        let Some(id) = self.unsettled.get(reference).map(|id| *id) else {
            return Ok(None);
        };
        match self.backend.proposal(id).await? {
            Some(call) if call.is_call(to, value, data) => {
                self.unsettled.remove(reference);
                tracing::warn!(proposal = id, executed = call.executed, "Adopting proposal left by a failed submission");
                Ok(Some(Proposal { id, tx_hash: None }))
            }
            Some(_) => {
                self.unsettled.remove(reference);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn await_threshold(&self, proposal_id: u64, on_approval: ApprovalSink<'_>) -> ProviderResult<Approvals> {
        let deadline = Instant::now() + self.confirmation_timeout;
        let mut last: Option<Approvals> = None;
        loop {
            let approvals = match self.backend.approvals(proposal_id).await {
                Ok(approvals) => approvals,
                Err(e) => {
                    tracing::warn!(proposal = proposal_id, error = %e, "Approval poll failed");
                    last.unwrap_or(Approvals { count: 0, threshold: 0 })
                }
            };
            if last != Some(approvals) && approvals.threshold > 0 {
                on_approval(approvals);
                last = Some(approvals);
            }
            if approvals.threshold > 0 && approvals.is_met() {
                return Ok(approvals);
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    proposal = proposal_id,
                    approvals = approvals.count,
                    threshold = approvals.threshold,
                    "Multisig proposal abandoned"
                );
                return Err(ProviderError::SignatureRejected(format!(
                    "proposal {} reached {}/{} approvals within {}s",
                    proposal_id,
                    approvals.count,
                    approvals.threshold,
                    self.confirmation_timeout.as_secs()
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

impl fmt::Debug for MultisigProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultisigProvider")
            .field("address", &self.address)
            .field("chain_id", &self.chain_id)
            .finish_non_exhaustive()
    }
}
