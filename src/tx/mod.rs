//! Transaction lifecycle.
//!
//! # Data Flow
//! ```text
//! submitter.rs  Building → Reserved → Submitted   (or Failed)
//!     → tracker.rs  Submitted → Confirmed | Failed | Dropped
//!         → log.rs  every transition validated, journaled, broadcast to subscribers
//! ```

pub mod log;
pub mod record;
pub mod submitter;
pub mod tracker;

pub use log::{LogError, LogResult, RecoveryReport, TransactionLog};
pub use record::{FailureKind, TransactionRecord, TxId, TxStatus};
pub use submitter::{TransactionSubmitter, TransferRequest};
pub use tracker::{ConfirmationTracker, WatchOutcome};
