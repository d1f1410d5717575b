//! Wallet subsystem.
//!
//! # Data Flow
//! ```text
//! [[wallets]] config
//!     → registry.rs (build one provider per wallet, once)
//!     → provider.rs (Native | Custodial | Multisig)
//!         → native.rs     sign locally, broadcast
//!         → custodial.rs  remote sign (maybe await approval), broadcast
//!         → multisig.rs   propose, collect approvals, execute
//! ```

pub mod custodial;
pub mod handle;
pub mod multisig;
pub mod native;
pub mod provider;
pub mod registry;

pub use handle::{ProviderKind, WalletHandle, WalletId};
pub use provider::{Approvals, ProviderError, ProviderResult, Submission, UnsignedTransfer, WalletProvider};
pub use registry::{RegisteredWallet, RegistryError, WalletRegistry};
