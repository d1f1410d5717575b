//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Provider attempt fails:
//!     → retries.rs (classify: retry | resync | fatal, charge the budget)
//!     → backoff.rs (jittered exponential delay before the next attempt)
//! ```

pub mod backoff;
pub mod retries;
