//! Blockchain integration subsystem.
//!
//! # Data Flow
//! ```text
//! config [chains.<id>] (RPC URLs, timeouts, gas ceilings)
//!     → client.rs (one chain, primary + failover endpoints)
//!     → pool.rs (all chains, implements ChainRpc)
//!     → rpc.rs (ChainRpc: the only interface wallets and the tracker see)
//! ```
//!
//! # Security Constraints
//! - Nothing in this module holds key material
//! - All RPC calls have configurable timeouts
//! - Graceful degradation when a chain is unreachable

pub mod client;
pub mod erc20;
pub mod pool;
pub mod rpc;
pub mod types;

pub use client::ChainClient;
pub use pool::RpcPool;
pub use rpc::ChainRpc;
pub use types::{ChainError, ChainId, ChainResult, ReceiptStatus, Token};
