//! Transaction log with an append-only journal.
//!
//! # Responsibilities
//! - Own every `TransactionRecord` for the life of the process
//! - Enforce forward-only status transitions
//! - Publish each change to subscribers
//! - Append each change to a JSON-lines journal and replay it on start
//!
//! # Design Decisions
//! - One `watch` channel per record: subscribers always see the latest
//!   snapshot, and the channel's lock serializes writers of that record
//! - The journal is rewritten compactly on open (one line per record) and
//!   appended to afterwards
//! - Appends are synchronous: a status change is on disk before `update`
//!   returns, at the cost of a short blocking write on the calling task
//! - Records whose fate was unknown at the crash are resolved on open, see
//!   [`TransactionLog::open`]

use dashmap::DashMap;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::watch;

use crate::observability::metrics;
use crate::tx::record::{now_unix, FailureKind, TransactionRecord, TxId, TxStatus};
use crate::wallet::handle::ProviderKind;

/// Errors raised by the transaction log.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("Transaction {0} already exists")]
    Duplicate(TxId),

    #[error("Transaction {0} not found")]
    NotFound(TxId),

    #[error("Transaction {id} cannot move from {from} to {to}")]
    Regression { id: TxId, from: TxStatus, to: TxStatus },

    #[error("Transaction {0} cannot be confirmed before its approval threshold is met")]
    ApprovalsNotMet(TxId),

    #[error("Journal I/O error: {0}")]
    Journal(#[from] std::io::Error),

    #[error("Journal encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

pub type LogResult<T> = Result<T, LogError>;

/// What [`TransactionLog::open`] found in the journal.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub loaded: usize,
    /// `Submitted` records that need a confirmation watcher again.
    pub resumed: Vec<TxId>,
    /// `Reserved` records whose broadcast may or may not have happened.
    pub dropped: Vec<TxId>,
    /// `Building` records that never reached a provider.
    pub failed: Vec<TxId>,
    pub skipped_lines: usize,
}

struct Journal {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl Journal {
    fn append(&self, record: &TransactionRecord) -> LogResult<()> {
        let line = serde_json::to_string(record)?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| std::io::Error::other("journal writer poisoned"))?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

/// Durable store of every transaction record.
pub struct TransactionLog {
    records: DashMap<TxId, watch::Sender<TransactionRecord>>,
    journal: Option<Journal>,
}

impl TransactionLog {
    /// A log that keeps records in memory only.
    pub fn in_memory() -> Self {
        Self {
            records: DashMap::new(),
            journal: None,
        }
    }

    /// Open (or create) the journal at `path` and replay it.
    ///
    /// Interrupted records are resolved before anything else can see them:
    /// `Building` becomes `Failed`, `Reserved` becomes `Dropped` (the
    /// broadcast may have happened, so the caller decides), `Submitted` is
    /// reported for re-watching.
    pub fn open(path: &Path) -> LogResult<(Self, RecoveryReport)> {
        let mut report = RecoveryReport::default();
        let mut latest: Vec<TransactionRecord> = Vec::new();
        let mut index: HashMap<TxId, usize> = HashMap::new();

        if path.exists() {
            let reader = BufReader::new(File::open(path)?);
            for (line_no, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<TransactionRecord>(&line) {
                    Ok(record) => match index.get(&record.id) {
                        Some(&i) => latest[i] = record,
                        None => {
                            index.insert(record.id, latest.len());
                            latest.push(record);
                        }
                    },
                    Err(e) => {
                        report.skipped_lines += 1;
                        tracing::warn!(line = line_no + 1, error = %e, "Skipping unreadable journal line");
                    }
                }
            }
        }

        let now = now_unix();
        for record in latest.iter_mut() {
            match record.status {
                TxStatus::Building => {
                    record.fail(TxStatus::Failed, FailureKind::Interrupted, "interrupted before reaching a provider");
                    record.updated_at = now;
                    report.failed.push(record.id);
                }
                TxStatus::Reserved => {
                    record.fail(
                        TxStatus::Dropped,
                        FailureKind::Interrupted,
                        "interrupted while signing; broadcast outcome unknown",
                    );
                    record.updated_at = now;
                    report.dropped.push(record.id);
                }
                TxStatus::Submitted => report.resumed.push(record.id),
                _ => {}
            }
        }
        report.loaded = latest.len();

        // Compact: one line per record, then continue appending.
        let tmp = path.with_extension("compact");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            for record in &latest {
                serde_json::to_writer(&mut writer, record)?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
        }
        fs::rename(&tmp, path)?;

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let log = Self {
            records: DashMap::new(),
            journal: Some(Journal {
                path: path.to_path_buf(),
                writer: Mutex::new(BufWriter::new(file)),
            }),
        };
        for record in latest {
            let (tx, _) = watch::channel(record.clone());
            log.records.insert(record.id, tx);
        }

        tracing::info!(
            path = %path.display(),
            loaded = report.loaded,
            resumed = report.resumed.len(),
            dropped = report.dropped.len(),
            failed = report.failed.len(),
            "Transaction journal replayed"
        );
        Ok((log, report))
    }

    pub fn journal_path(&self) -> Option<&Path> {
        self.journal.as_ref().map(|j| j.path.as_path())
    }

    /// Add a new record. Ids are never reused.
    pub fn insert(&self, record: TransactionRecord) -> LogResult<()> {
        use dashmap::mapref::entry::Entry;
        match self.records.entry(record.id) {
            Entry::Occupied(_) => Err(LogError::Duplicate(record.id)),
            Entry::Vacant(slot) => {
                if let Some(journal) = &self.journal {
                    journal.append(&record)?;
                }
                metrics::record_status_transition(record.status.as_str());
                tracing::debug!(tx = %record.id, wallet = %record.wallet_id, "Transaction recorded");
                let (tx, _) = watch::channel(record);
                slot.insert(tx);
                Ok(())
            }
        }
    }

    pub fn contains(&self, id: &TxId) -> bool {
        self.records.contains_key(id)
    }

    pub fn get(&self, id: &TxId) -> Option<TransactionRecord> {
        self.records.get(id).map(|tx| tx.borrow().clone())
    }

    /// Snapshot of every record.
    pub fn records(&self) -> Vec<TransactionRecord> {
        self.records.iter().map(|e| e.value().borrow().clone()).collect()
    }

    pub fn subscribe(&self, id: &TxId) -> Option<watch::Receiver<TransactionRecord>> {
        self.records.get(id).map(|tx| tx.subscribe())
    }

    /// Apply `f` to a copy of the record and store it if the result is a
    /// legal transition. Returns the stored record.
    pub fn update<F>(&self, id: &TxId, f: F) -> LogResult<TransactionRecord>
    where
        F: FnOnce(&mut TransactionRecord),
    {
        let sender = self.records.get(id).ok_or(LogError::NotFound(*id))?;

        let mut outcome: LogResult<TransactionRecord> = Err(LogError::NotFound(*id));
        sender.send_if_modified(|current| {
            let mut next = current.clone();
            f(&mut next);
            if !current.status.can_advance_to(next.status) {
                outcome = Err(LogError::Regression {
                    id: *id,
                    from: current.status,
                    to: next.status,
                });
                return false;
            }
            let approved = match (next.kind, next.approvals) {
                (ProviderKind::Multisig, approvals) => approvals.is_some_and(|a| a.is_met()),
                (_, approvals) => approvals.map_or(true, |a| a.is_met()),
            };
            if next.status == TxStatus::Confirmed && current.status != TxStatus::Confirmed && !approved {
                outcome = Err(LogError::ApprovalsNotMet(*id));
                return false;
            }
            if next == *current {
                outcome = Ok(next);
                return false;
            }
            next.updated_at = now_unix();
            if let Some(journal) = &self.journal {
                if let Err(e) = journal.append(&next) {
                    outcome = Err(e);
                    return false;
                }
            }
            if next.status != current.status {
                metrics::record_status_transition(next.status.as_str());
                tracing::info!(
                    tx = %id,
                    wallet = %next.wallet_id,
                    from = %current.status,
                    to = %next.status,
                    nonce = ?next.nonce,
                    "Transaction status changed"
                );
            }
            *current = next.clone();
            outcome = Ok(next);
            true
        });
        outcome
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
