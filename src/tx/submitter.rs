//! Transaction submission.
//!
//! # Data Flow
//! ```text
//! submit (synchronous part)
//!     → validate request, reject duplicates
//!     → SpendingLimitGuard::check_and_reserve   (exceeded → error, nothing recorded)
//!     → record inserted as Building
//!     → background task spawned, id returned
//!
//! background task
//!     → NonceSequencer::reserve                 → Reserved
//!     → WalletProvider::sign_and_send
//!         ok          → commit nonce            → Submitted → tracker
//!         unavailable → release nonce, back off, retry
//!         conflict    → release nonce, resync, retry
//!         fatal       → release nonce + allowance → Failed
//! ```
//!
//! # Design Decisions
//! - The spending allowance is held across retries; it is only given back
//!   when the transfer fails for good
//! - A reservation whose broadcast point has passed is committed, never
//!   released, even if the provider fails afterwards
//! - Retry settings live in an `ArcSwap` so config reloads apply to the
//!   next attempt of every in-flight transfer

use alloy::primitives::{Address, U256};
use arc_swap::ArcSwap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::chain::types::Token;
use crate::config::schema::SubmitterConfig;
use crate::error::{WalletError, WalletResult};
use crate::limits::{Allowance, SpendingLimitGuard};
use crate::nonce::{NonceKey, NonceSequencer, Reservation};
use crate::observability::metrics;
use crate::resilience::backoff::submit_backoff;
use crate::resilience::retries::{classify, RetryBudget, RetryClass};
use crate::tx::log::TransactionLog;
use crate::tx::record::{FailureKind, TransactionRecord, TxId, TxStatus};
use crate::tx::tracker::ConfirmationTracker;
use crate::wallet::provider::{Approvals, ProviderError, UnsignedTransfer};
use crate::wallet::registry::{RegisteredWallet, WalletRegistry};
use crate::wallet::WalletId;

/// A caller's request to move funds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub wallet_id: WalletId,
    pub to: Address,
    pub token: Token,
    /// Base units of `token`.
    pub amount: U256,
    /// Caller-chosen idempotency id; generated when absent.
    pub transaction_id: Option<TxId>,
    /// Set by `resubmit` only.
    pub replaces: Option<TxId>,
}

impl TransferRequest {
    pub fn new(wallet_id: WalletId, to: Address, token: Token, amount: U256) -> Self {
        Self {
            wallet_id,
            to,
            token,
            amount,
            transaction_id: None,
            replaces: None,
        }
    }

    pub fn with_id(mut self, id: TxId) -> Self {
        self.transaction_id = Some(id);
        self
    }
}

/// Shared state of the submitter and its background tasks.
struct Inner {
    sequencer: Arc<NonceSequencer>,
    limits: Arc<SpendingLimitGuard>,
    log: Arc<TransactionLog>,
    tracker: Arc<ConfirmationTracker>,
    policy: ArcSwap<SubmitterConfig>,
    cancel: CancellationToken,
}

/// Turns transfer requests into broadcast transactions.
pub struct TransactionSubmitter {
    registry: Arc<WalletRegistry>,
    inner: Arc<Inner>,
    tasks: TaskTracker,
}

impl TransactionSubmitter {
    pub fn new(
        registry: Arc<WalletRegistry>,
        sequencer: Arc<NonceSequencer>,
        limits: Arc<SpendingLimitGuard>,
        log: Arc<TransactionLog>,
        tracker: Arc<ConfirmationTracker>,
        policy: SubmitterConfig,
    ) -> Self {
        Self {
            registry,
            inner: Arc::new(Inner {
                sequencer,
                limits,
                log,
                tracker,
                policy: ArcSwap::from_pointee(policy),
                cancel: CancellationToken::new(),
            }),
            tasks: TaskTracker::new(),
        }
    }

    /// Swap the retry policy used from the next attempt on.
    pub fn set_policy(&self, policy: SubmitterConfig) {
        if **self.inner.policy.load() != policy {
            tracing::info!(
                max_attempts = policy.max_attempts,
                max_nonce_resyncs = policy.max_nonce_resyncs,
                "Submitter retry policy updated"
            );
            self.inner.policy.store(Arc::new(policy));
        }
    }

    pub fn policy(&self) -> SubmitterConfig {
        (**self.inner.policy.load()).clone()
    }

    /// Accept a transfer and start driving it in the background.
    ///
    /// Fails synchronously only for validation errors, unknown wallets,
    /// duplicate ids and exceeded spending limits.
    pub fn submit(&self, request: TransferRequest) -> WalletResult<TxId> {
        if self.inner.cancel.is_cancelled() {
            return Err(WalletError::ShuttingDown);
        }
        let wallet = self
            .registry
            .get(&request.wallet_id)
            .ok_or_else(|| WalletError::UnknownWallet(request.wallet_id.clone()))?;
        validate(&request, &wallet)?;

        let id = request.transaction_id.unwrap_or_default();
        if self.inner.log.contains(&id) {
            return Err(WalletError::DuplicateTransaction(id));
        }

        let allowance = self
            .inner
            .limits
            .check_and_reserve(&request.wallet_id, request.token, request.amount)?;

        let record = TransactionRecord::new(
            id,
            request.wallet_id.clone(),
            wallet.handle.kind,
            wallet.handle.chain_id,
            request.to,
            request.token,
            request.amount,
            request.replaces,
        );
        if let Err(e) = self.inner.log.insert(record) {
            self.inner.limits.release(allowance);
            return Err(e.into());
        }

        tracing::info!(
            tx = %id,
            wallet = %request.wallet_id,
            to = %request.to,
            token = %request.token,
            amount = %request.amount,
            "Transfer accepted"
        );

        let inner = self.inner.clone();
        self.tasks.spawn(async move {
            inner.drive(id, wallet, request, allowance).await;
        });
        Ok(id)
    }

    /// Stop retrying, then wait for every submission task to finish.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        tracing::info!("Submitter stopped");
    }
}

fn validate(request: &TransferRequest, wallet: &RegisteredWallet) -> WalletResult<()> {
    if request.amount.is_zero() {
        return Err(WalletError::Validation("amount must be greater than zero".to_string()));
    }
    if request.to.is_zero() {
        return Err(WalletError::Validation("recipient must not be the zero address".to_string()));
    }
    if request.to == wallet.handle.address {
        return Err(WalletError::Validation("recipient must differ from the sending wallet".to_string()));
    }
    Ok(())
}

impl Inner {
    async fn drive(&self, id: TxId, wallet: Arc<RegisteredWallet>, request: TransferRequest, allowance: Allowance) {
        let key = NonceKey::new(wallet.handle.id.clone(), wallet.handle.chain_id);
        let kind = wallet.handle.kind.as_str();
        let mut budget = RetryBudget::default();

        loop {
            let policy = self.policy.load_full();
            let error = match self.attempt(id, &key, &wallet, &request).await {
                Ok(()) => {
                    self.limits.commit(allowance);
                    metrics::record_submission(kind, "submitted");
                    return;
                }
                Err(e) => e,
            };

            let class = classify(&error);
            if class == RetryClass::Resync {
                if let Err(e) = self.sequencer.resync(&key, &wallet.provider).await {
                    tracing::warn!(tx = %id, error = %e, "Nonce resync failed");
                }
            }
            if !budget.spend(class, policy.max_attempts, policy.max_nonce_resyncs) {
                self.fail(id, allowance, &error);
                metrics::record_submission(kind, "failed");
                return;
            }

            metrics::record_retry(class.as_str());
            let _ = self.log.update(&id, |r| r.last_error = Some(error.to_string()));
            let delay = submit_backoff(budget.attempts + budget.resyncs, &policy);
            tracing::warn!(
                tx = %id,
                error = %error,
                attempts = budget.attempts,
                resyncs = budget.resyncs,
                delay_ms = delay.as_millis() as u64,
                "Submission attempt failed, retrying"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.fail(id, allowance, &ProviderError::Unavailable("service shutting down".to_string()));
                    metrics::record_submission(kind, "failed");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One reservation, one provider call.
    async fn attempt(
        &self,
        id: TxId,
        key: &NonceKey,
        wallet: &RegisteredWallet,
        request: &TransferRequest,
    ) -> Result<(), ProviderError> {
        let reservation = self
            .sequencer
            .reserve(key, &wallet.provider)
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;
        let nonce = reservation.nonce();

        if let Err(e) = self.log.update(&id, |r| {
            r.status = TxStatus::Reserved;
            r.nonce = Some(nonce);
            r.attempt_count += 1;
        }) {
            self.settle(reservation).await;
            return Err(ProviderError::Rejected(e.to_string()));
        }

        let transfer = UnsignedTransfer {
            reference: id.to_string(),
            chain_id: wallet.handle.chain_id,
            from: wallet.handle.address,
            to: request.to,
            token: request.token,
            amount: request.amount,
            nonce,
        };
        let log = self.log.clone();
        let on_approval = move |approvals: Approvals| {
            let _ = log.update(&id, |r| r.approvals = Some(approvals));
        };

        match wallet.provider.sign_and_send(&transfer, &reservation, &on_approval).await {
            Ok(submission) => {
                // A multisig proposal adopted from a lower slot leaves the
                // reserved nonce unbroadcast.
                self.settle(reservation).await;
                let stored = self.log.update(&id, |r| {
                    r.status = TxStatus::Submitted;
                    r.backend_tx_id = Some(submission.backend_tx_id);
                    if submission.approvals.is_some() {
                        r.approvals = submission.approvals;
                    }
                    r.last_error = None;
                });
                match stored {
                    Ok(_) => {
                        self.tracker
                            .watch(id, wallet.handle.chain_id, submission.backend_tx_id);
                    }
                    Err(e) => tracing::error!(tx = %id, error = %e, "Failed to record submission"),
                }
                Ok(())
            }
            Err(e) => {
                self.settle(reservation).await;
                Err(e)
            }
        }
    }

    /// Give back a reservation that did not lead to a successful submission.
    async fn settle(&self, reservation: Reservation) {
        let nonce = reservation.nonce();
        let result = if reservation.has_broadcast() {
            self.sequencer.commit(reservation).await
        } else {
            self.sequencer.release(reservation).await
        };
        if let Err(e) = result {
            tracing::warn!(nonce, error = %e, "Failed to settle nonce reservation");
        }
    }

    fn fail(&self, id: TxId, allowance: Allowance, error: &ProviderError) {
        self.limits.release(allowance);
        let kind = failure_kind(error);
        let result = self.log.update(&id, |r| r.fail(TxStatus::Failed, kind, error.to_string()));
        if let Err(e) = result {
            tracing::error!(tx = %id, error = %e, "Failed to record failure");
        }
        tracing::warn!(tx = %id, error = %error, "Transfer failed");
    }
}

fn failure_kind(error: &ProviderError) -> FailureKind {
    match error {
        ProviderError::InsufficientFunds(_) => FailureKind::InsufficientFunds,
        ProviderError::SignatureRejected(_) => FailureKind::SignatureRejected,
        ProviderError::Unavailable(_) => FailureKind::ProviderUnavailable,
        ProviderError::NonceConflict(_) => FailureKind::NonceConflict,
        ProviderError::Rejected(_) => FailureKind::BackendRejected,
    }
}
