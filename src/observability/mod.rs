//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via `tracing`)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → Log aggregation (stdout, pretty or JSON)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured fields (wallet, chain, nonce, tx id) on every lifecycle event
//! - Key material is never a field
//! - Metrics are cheap (atomic increments) and safe to call before the
//!   exporter is installed

pub mod logging;
pub mod metrics;
