//! Agent wallet transaction layer.
//!
//! Lets autonomous agents move native coin and ERC20 tokens through native,
//! custodial or multisig wallets without reusing nonces, without exceeding
//! operator spending caps, and without losing track of any submission.

pub mod api;
pub mod chain;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod limits;
pub mod nonce;
pub mod observability;
pub mod resilience;
pub mod service;
pub mod tx;
pub mod wallet;

pub use config::schema::AppConfig;
pub use error::{WalletError, WalletResult};
pub use lifecycle::Shutdown;
pub use service::WalletService;
