//! HTTP API for the agent layer.
//!
//! # Data Flow
//! ```text
//! request
//!     → TraceLayer, TimeoutLayer
//!     → auth.rs (bearer key; /health is open)
//!     → handlers.rs (human amounts → base units)
//!     → WalletService
//!     → error.rs (WalletError → status code + JSON body)
//! ```

pub mod auth;
pub mod error;
pub mod handlers;
pub mod server;

pub use server::{build_router, serve, ApiState};
