//! Confirmation watching.
//!
//! # Responsibilities
//! - Run one watcher task per `Submitted` record
//! - Drive the record to `Confirmed`, `Failed` or `Dropped`
//! - Let callers cancel a watcher without touching the record
//!
//! # Design Decisions
//! - Each watcher owns a child of the tracker's root `CancellationToken`;
//!   cancelling the root stops them all
//! - Watchers are spawned on a `TaskTracker`, so shutdown can wait for
//!   every one of them to exit
//! - An RPC error is not evidence of anything; only receipts move a record

use alloy::primitives::TxHash;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::chain::rpc::ChainRpc;
use crate::chain::types::{ChainId, ReceiptStatus};
use crate::config::schema::TrackerConfig;
use crate::observability::metrics;
use crate::tx::log::TransactionLog;
use crate::tx::record::{FailureKind, TxId, TxStatus};

/// What a watcher decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    Confirmed,
    Reverted,
    Evicted,
    TimedOut,
    Cancelled,
}

/// Runs confirmation watchers.
pub struct ConfirmationTracker {
    rpc: Arc<dyn ChainRpc>,
    log: Arc<TransactionLog>,
    config: TrackerConfig,
    watchers: Arc<DashMap<TxId, CancellationToken>>,
    root: CancellationToken,
    tasks: TaskTracker,
}

impl ConfirmationTracker {
    pub fn new(rpc: Arc<dyn ChainRpc>, log: Arc<TransactionLog>, config: TrackerConfig) -> Self {
        Self {
            rpc,
            log,
            config,
            watchers: Arc::new(DashMap::new()),
            root: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Start watching `tx_hash` for record `id`.
    ///
    /// Returns false if the record is already watched or the tracker is
    /// shutting down.
    pub fn watch(&self, id: TxId, chain: ChainId, tx_hash: TxHash) -> bool {
        if self.root.is_cancelled() {
            return false;
        }
        let token = self.root.child_token();
        {
            use dashmap::mapref::entry::Entry;
            match self.watchers.entry(id) {
                Entry::Occupied(_) => return false,
                Entry::Vacant(slot) => {
                    slot.insert(token.clone());
                }
            }
        }
        metrics::record_active_watchers(self.watchers.len());

        let watcher = Watcher {
            id,
            chain,
            tx_hash,
            rpc: self.rpc.clone(),
            log: self.log.clone(),
            poll_interval: Duration::from_millis(self.config.poll_interval_ms),
            finality_timeout: Duration::from_secs(self.config.finality_timeout_secs),
            eviction_grace_polls: self.config.eviction_grace_polls.max(1),
            required_confirmations: self.rpc.confirmation_blocks(chain).max(1),
        };
        let watchers = self.watchers.clone();
        self.tasks.spawn(async move {
            let outcome = watcher.run(token).await;
            watchers.remove(&id);
            metrics::record_active_watchers(watchers.len());
            tracing::debug!(tx = %id, outcome = ?outcome, "Watcher finished");
            outcome
        });
        tracing::info!(tx = %id, tx_hash = %tx_hash, chain_id = %chain, "Watching for confirmation");
        true
    }

    /// Stop watching `id`. The record keeps its current status.
    pub fn cancel(&self, id: &TxId) -> bool {
        match self.watchers.remove(id) {
            Some((_, token)) => {
                token.cancel();
                metrics::record_active_watchers(self.watchers.len());
                tracing::info!(tx = %id, "Watcher cancelled");
                true
            }
            None => false,
        }
    }

    pub fn is_watching(&self, id: &TxId) -> bool {
        self.watchers.contains_key(id)
    }

    pub fn active(&self) -> usize {
        self.watchers.len()
    }

    /// Cancel every watcher and wait for all of them to exit.
    pub async fn shutdown(&self) {
        self.root.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        tracing::info!("Confirmation tracker stopped");
    }
}

struct Watcher {
    id: TxId,
    chain: ChainId,
    tx_hash: TxHash,
    rpc: Arc<dyn ChainRpc>,
    log: Arc<TransactionLog>,
    poll_interval: Duration,
    finality_timeout: Duration,
    eviction_grace_polls: u32,
    required_confirmations: u32,
}

impl Watcher {
    async fn run(self, token: CancellationToken) -> WatchOutcome {
        let started = Instant::now();
        let deadline = tokio::time::sleep(self.finality_timeout);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut unknown_polls = 0u32;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return WatchOutcome::Cancelled,
                _ = &mut deadline => {
                    self.finish(TxStatus::Dropped, Some((
                        FailureKind::ConfirmationTimeout,
                        format!("not final within {}s", self.finality_timeout.as_secs()),
                    )), started);
                    return WatchOutcome::TimedOut;
                }
                _ = ticker.tick() => {
                    match self.rpc.get_transaction_receipt(self.chain, self.tx_hash).await {
                        Ok(ReceiptStatus::Included { confirmations, block_number }) => {
                            unknown_polls = 0;
                            if confirmations >= self.required_confirmations {
                                tracing::debug!(tx = %self.id, block_number, confirmations, "Transaction final");
                                self.finish(TxStatus::Confirmed, None, started);
                                return WatchOutcome::Confirmed;
                            }
                        }
                        Ok(ReceiptStatus::Pending) => unknown_polls = 0,
                        Ok(ReceiptStatus::Reverted { block_number }) => {
                            self.finish(TxStatus::Failed, Some((
                                FailureKind::Reverted,
                                format!("reverted in block {}", block_number),
                            )), started);
                            return WatchOutcome::Reverted;
                        }
                        Ok(ReceiptStatus::Unknown) => {
                            unknown_polls += 1;
                            if unknown_polls >= self.eviction_grace_polls {
                                self.finish(TxStatus::Failed, Some((
                                    FailureKind::Evicted,
                                    "evicted from the pending pool".to_string(),
                                )), started);
                                return WatchOutcome::Evicted;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(tx = %self.id, error = %e, "Receipt poll failed");
                        }
                    }
                }
            }
        }
    }

    fn finish(&self, status: TxStatus, failure: Option<(FailureKind, String)>, started: Instant) {
        let result = self.log.update(&self.id, |record| match failure {
            Some((kind, message)) => record.fail(status, kind, message),
            None => record.status = status,
        });
        match result {
            Ok(_) => metrics::record_confirmation_latency(status.as_str(), started.into_std()),
            Err(e) => tracing::error!(tx = %self.id, error = %e, "Failed to record watcher outcome"),
        }
    }
}
