//! The wallet service: the one object the agent layer talks to.
//!
//! # Responsibilities
//! - Assemble sequencer, guard, log, tracker and submitter over a registry
//! - Recover state on start (journal replay, spending seeds, nonce reconcile,
//!   resumed watchers)
//! - Expose `submit_transfer`, `configure_spending_limit`, `get_status` and
//!   the operator extras built on them
//!
//! # Data Flow
//! ```text
//! start
//!     → TransactionLog::open        (Building → Failed, Reserved → Dropped)
//!     → apply [[spending_limits]]   (decimals from config or chain)
//!     → seed consumption            (non-failed records of the current window)
//!     → reconcile every wallet's nonce
//!     → re-watch Submitted records
//! ```
//!
//! # Design Decisions
//! - Shutdown is ordered: submitter first (no new broadcasts), then
//!   watchers, then the registry
//! - A failed nonce reconcile on start is not fatal; the sequencer
//!   reconciles again on the first reservation

use alloy::primitives::{Address, U256};
use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::chain::rpc::ChainRpc;
use crate::chain::types::Token;
use crate::config::schema::{AppConfig, SpendingLimitConfig, SubmitterConfig};
use crate::error::{WalletError, WalletResult};
use crate::limits::{parse_amount, LimitStatus, SpendingLimitGuard};
use crate::nonce::{NonceKey, NonceSequencer, NonceSnapshot};
use crate::tx::log::TransactionLog;
use crate::tx::record::{now_unix, TransactionRecord, TxId, TxStatus};
use crate::tx::submitter::{TransactionSubmitter, TransferRequest};
use crate::tx::tracker::ConfirmationTracker;
use crate::wallet::registry::WalletRegistry;
use crate::wallet::{WalletHandle, WalletId};

/// Agent wallet transaction layer.
pub struct WalletService {
    registry: Arc<WalletRegistry>,
    rpc: Arc<dyn ChainRpc>,
    sequencer: Arc<NonceSequencer>,
    limits: Arc<SpendingLimitGuard>,
    log: Arc<TransactionLog>,
    tracker: Arc<ConfirmationTracker>,
    submitter: TransactionSubmitter,
    /// Records with a resubmission under way.
    resubmitting: DashSet<TxId>,
}

impl WalletService {
    /// Build the service and recover whatever the journal holds.
    pub async fn start(
        config: &AppConfig,
        registry: Arc<WalletRegistry>,
        rpc: Arc<dyn ChainRpc>,
    ) -> WalletResult<Self> {
        let log = match &config.storage.journal_path {
            Some(path) => {
                let (log, report) = TransactionLog::open(path)?;
                tracing::info!(
                    path = %path.display(),
                    loaded = report.loaded,
                    resumed = report.resumed.len(),
                    dropped = report.dropped.len(),
                    failed = report.failed.len(),
                    skipped_lines = report.skipped_lines,
                    "Transaction journal replayed"
                );
                log
            }
            None => TransactionLog::in_memory(),
        };
        let log = Arc::new(log);

        let sequencer = Arc::new(NonceSequencer::new());
        let limits = Arc::new(SpendingLimitGuard::new(config.limits.window_mode));
        let tracker = Arc::new(ConfirmationTracker::new(
            rpc.clone(),
            log.clone(),
            config.tracker.clone(),
        ));
        let submitter = TransactionSubmitter::new(
            registry.clone(),
            sequencer.clone(),
            limits.clone(),
            log.clone(),
            tracker.clone(),
            config.submitter.clone(),
        );

        let service = Self {
            registry,
            rpc,
            sequencer,
            limits,
            log,
            tracker,
            submitter,
            resubmitting: DashSet::new(),
        };

        service.apply_limits(&config.spending_limits).await?;
        service.seed_spending();
        service.reconcile_nonces().await;
        service.resume_watchers();

        tracing::info!(
            wallets = service.registry.len(),
            records = service.log.len(),
            "Wallet service started"
        );
        Ok(service)
    }

    /// Accept a transfer. Returns as soon as the transfer is recorded;
    /// the outcome is observed through [`get_status`](Self::get_status) or
    /// [`subscribe`](Self::subscribe).
    pub fn submit_transfer(
        &self,
        wallet_id: &WalletId,
        to: Address,
        token: Token,
        amount: U256,
    ) -> WalletResult<TxId> {
        self.submit(TransferRequest::new(wallet_id.clone(), to, token, amount))
    }

    /// Like [`submit_transfer`](Self::submit_transfer) with full control
    /// over the request, including a caller-chosen transaction id.
    pub fn submit(&self, request: TransferRequest) -> WalletResult<TxId> {
        self.submitter.submit(request)
    }

    /// Create or replace the cap of a (wallet, token) pair.
    pub fn configure_spending_limit(
        &self,
        wallet_id: &WalletId,
        token: Token,
        cap: U256,
        period: Duration,
    ) -> WalletResult<()> {
        if self.registry.get(wallet_id).is_none() {
            return Err(WalletError::UnknownWallet(wallet_id.clone()));
        }
        self.limits.configure(wallet_id, token, cap, period)?;
        Ok(())
    }

    /// Remove the cap of a (wallet, token) pair, making it unconstrained.
    pub fn remove_spending_limit(&self, wallet_id: &WalletId, token: Token) -> bool {
        self.limits.remove(wallet_id, token)
    }

    pub fn get_status(&self, id: &TxId) -> WalletResult<TransactionRecord> {
        self.log.get(id).ok_or(WalletError::NotFound(*id))
    }

    /// Every record, oldest first.
    pub fn transactions(&self) -> Vec<TransactionRecord> {
        let mut records = self.log.records();
        records.sort_by_key(|r| (r.created_at, r.id));
        records
    }

    /// Snapshots of `id` as it moves through its lifecycle.
    pub fn subscribe(&self, id: &TxId) -> WalletResult<watch::Receiver<TransactionRecord>> {
        self.log.subscribe(id).ok_or(WalletError::NotFound(*id))
    }

    /// Resolve once `id` reaches a terminal status.
    pub async fn wait_for_terminal(&self, id: &TxId) -> WalletResult<TransactionRecord> {
        let mut rx = self.subscribe(id)?;
        let record = rx
            .wait_for(|r| r.is_terminal())
            .await
            .map_err(|_| WalletError::ShuttingDown)?;
        Ok(record.clone())
    }

    /// Send a `Dropped` or `Failed` transfer again as a new transaction.
    ///
    /// This is the explicit caller decision a dropped transfer needs; the
    /// service never makes it on its own.
    pub fn resubmit(&self, id: &TxId) -> WalletResult<TxId> {
        let record = self.get_status(id)?;
        if !matches!(record.status, TxStatus::Dropped | TxStatus::Failed) {
            return Err(WalletError::NotResubmittable {
                id: *id,
                status: record.status,
            });
        }
        if !self.resubmitting.insert(*id) {
            return Err(WalletError::Validation(format!(
                "transaction {} is already being resubmitted",
                id
            )));
        }
        let result = self.resubmit_claimed(record);
        self.resubmitting.remove(id);
        result
    }

    /// Runs while `record` is claimed in `resubmitting`, so the replacement
    /// check and the new record cannot interleave with another resubmit.
    fn resubmit_claimed(&self, record: TransactionRecord) -> WalletResult<TxId> {
        let id = record.id;
        if let Some(existing) = self
            .log
            .records()
            .into_iter()
            .find(|r| r.replaces == Some(id) && r.status != TxStatus::Failed)
        {
            return Err(WalletError::Validation(format!(
                "transaction {} was already resubmitted as {}",
                id, existing.id
            )));
        }

        let request = TransferRequest {
            wallet_id: record.wallet_id,
            to: record.to,
            token: record.token,
            amount: record.amount,
            transaction_id: None,
            replaces: Some(id),
        };
        let new_id = self.submit(request)?;
        tracing::info!(tx = %new_id, replaces = %id, "Transfer resubmitted");
        Ok(new_id)
    }

    /// Stop watching `id`. The record keeps its status.
    pub fn cancel_watch(&self, id: &TxId) -> WalletResult<bool> {
        if !self.log.contains(id) {
            return Err(WalletError::NotFound(*id));
        }
        Ok(self.tracker.cancel(id))
    }

    pub fn is_watching(&self, id: &TxId) -> bool {
        self.tracker.is_watching(id)
    }

    pub fn wallets(&self) -> Vec<WalletHandle> {
        self.registry.list()
    }

    pub fn limit_status(&self, wallet_id: &WalletId, token: Token) -> Option<LimitStatus> {
        self.limits.status(wallet_id, token)
    }

    pub fn limit_statuses(&self, wallet_id: &WalletId) -> Vec<LimitStatus> {
        self.limits.statuses(wallet_id)
    }

    pub async fn nonce_snapshot(&self, wallet_id: &WalletId) -> Option<NonceSnapshot> {
        let wallet = self.registry.get(wallet_id)?;
        let key = NonceKey::new(wallet.handle.id.clone(), wallet.handle.chain_id);
        self.sequencer.snapshot(&key).await
    }

    /// Decimals of `token` on the chain of `wallet_id`.
    pub async fn token_decimals(&self, wallet_id: &WalletId, token: Token) -> WalletResult<u8> {
        if token.is_native() {
            return Ok(Token::NATIVE_DECIMALS);
        }
        let wallet = self
            .registry
            .get(wallet_id)
            .ok_or_else(|| WalletError::UnknownWallet(wallet_id.clone()))?;
        self.rpc
            .get_token_decimals(wallet.handle.chain_id, token)
            .await
            .map_err(|e| WalletError::ProviderUnavailable(e.to_string()))
    }

    /// Apply `[[spending_limits]]` entries. Returns how many were applied.
    pub async fn apply_limits(&self, entries: &[SpendingLimitConfig]) -> WalletResult<usize> {
        let mut applied = 0;
        for entry in entries {
            let wallet_id = WalletId::new(&entry.wallet);
            let decimals = match entry.decimals {
                Some(d) => d,
                None => self.token_decimals(&wallet_id, entry.token).await?,
            };
            let cap = parse_amount(&entry.cap, decimals)?;
            self.configure_spending_limit(
                &wallet_id,
                entry.token,
                cap,
                Duration::from_secs(entry.period_secs),
            )?;
            applied += 1;
        }
        Ok(applied)
    }

    /// Apply the runtime-adjustable parts of a reloaded config.
    pub async fn reload(&self, config: &AppConfig) -> WalletResult<()> {
        let applied = self.apply_limits(&config.spending_limits).await?;
        self.submitter.set_policy(config.submitter.clone());
        tracing::info!(limits = applied, "Configuration reloaded");
        Ok(())
    }

    pub fn retry_policy(&self) -> SubmitterConfig {
        self.submitter.policy()
    }

    /// Stop accepting transfers, wait for in-flight work, release wallets.
    pub async fn shutdown(&self) {
        self.submitter.shutdown().await;
        self.tracker.shutdown().await;
        self.registry.shutdown();
        tracing::info!("Wallet service stopped");
    }

    /// Count journaled spends of the current window against their caps.
    fn seed_spending(&self) {
        let now = now_unix();
        let mut seeded = 0usize;
        for record in self.log.records() {
            if record.status == TxStatus::Failed {
                continue;
            }
            let age = Duration::from_secs(now.saturating_sub(record.created_at));
            self.limits.seed(&record.wallet_id, record.token, record.amount, age);
            seeded += 1;
        }
        if seeded > 0 {
            tracing::debug!(records = seeded, "Spending consumption rebuilt from journal");
        }
    }

    async fn reconcile_nonces(&self) {
        for handle in self.registry.list() {
            let Some(wallet) = self.registry.get(&handle.id) else {
                continue;
            };
            let key = NonceKey::new(handle.id.clone(), handle.chain_id);
            if let Err(e) = self.sequencer.reconcile(&key, &wallet.provider).await {
                tracing::warn!(
                    wallet = %handle.id,
                    chain_id = %handle.chain_id,
                    error = %e,
                    "Nonce reconcile failed; will retry on first reservation"
                );
            }
        }
    }

    fn resume_watchers(&self) {
        for record in self.log.records() {
            if record.status != TxStatus::Submitted {
                continue;
            }
            match record.backend_tx_id {
                Some(hash) => {
                    self.tracker.watch(record.id, record.chain_id, hash);
                }
                None => tracing::warn!(tx = %record.id, "Submitted record has no transaction hash"),
            }
        }
    }
}
