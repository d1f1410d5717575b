//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → AppConfig (validated, immutable)
//!     → consumed once at startup to build chains, wallets and limits
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → spending limits re-applied, retry policy swapped
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Secrets are referenced by environment variable name only

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    ApiConfig, AppConfig, ChainConfig, CustodyConfig, LogFormat, MultisigConfig,
    ObservabilityConfig, SpendingLimitConfig, SubmitterConfig, TrackerConfig, WalletConfig,
};
