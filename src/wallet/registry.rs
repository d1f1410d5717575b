//! Process-wide wallet registry.
//!
//! # Responsibilities
//! - Build every configured wallet's provider at startup
//! - Serve immutable handles and providers by id
//! - Tear everything down explicitly at shutdown
//!
//! # Design Decisions
//! - A wallet's handle never changes after registration; registering an id
//!   twice is an error, not a replacement
//! - Key material stays inside the provider; the registry only sees handles

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;

use crate::chain::rpc::ChainRpc;
use crate::chain::types::ChainId;
use crate::config::schema::{AppConfig, WalletConfig};
use crate::wallet::custodial::{CustodialProvider, HttpCustodySigner};
use crate::wallet::handle::{ProviderKind, WalletHandle, WalletId};
use crate::wallet::multisig::{AlloyMultisig, MultisigProvider};
use crate::wallet::native::{signer_from_env, NativeProvider};
use crate::wallet::provider::{ProviderError, WalletProvider};

/// Errors raised while building or using the registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Wallet '{0}' is already registered")]
    Duplicate(WalletId),

    #[error("Wallet '{id}' is misconfigured: {reason}")]
    Misconfigured { id: WalletId, reason: String },

    #[error("Wallet '{id}' failed to initialize: {source}")]
    Provider {
        id: WalletId,
        #[source]
        source: ProviderError,
    },

    #[error("Wallet registry is shut down")]
    Closed,
}

/// A wallet and the backend that signs for it.
pub struct RegisteredWallet {
    pub handle: WalletHandle,
    pub provider: WalletProvider,
}

/// Owns every wallet for the life of the process.
#[derive(Default)]
pub struct WalletRegistry {
    wallets: RwLock<HashMap<WalletId, Arc<RegisteredWallet>>>,
    closed: AtomicBool,
}

impl WalletRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from the `[[wallets]]` section.
    pub fn from_config(config: &AppConfig, rpc: Arc<dyn ChainRpc>) -> Result<Self, RegistryError> {
        let registry = Self::new();
        for wallet in &config.wallets {
            let provider = build_provider(wallet, config, rpc.clone())?;
            registry.register(WalletId::new(&wallet.id), ChainId(wallet.chain_id), provider)?;
        }
        Ok(registry)
    }

    /// Add a wallet. The handle is derived from the provider and is final.
    pub fn register(
        &self,
        id: WalletId,
        chain_id: ChainId,
        provider: WalletProvider,
    ) -> Result<WalletHandle, RegistryError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RegistryError::Closed);
        }
        let mut wallets = self.wallets.write().map_err(|_| RegistryError::Closed)?;
        if wallets.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        let handle = WalletHandle {
            id: id.clone(),
            kind: provider.kind(),
            chain_id,
            address: provider.address(),
        };
        tracing::info!(
            wallet = %handle.id,
            kind = %handle.kind,
            chain_id = %handle.chain_id,
            address = %handle.address,
            "Wallet registered"
        );
        wallets.insert(id, Arc::new(RegisteredWallet {
            handle: handle.clone(),
            provider,
        }));
        Ok(handle)
    }

    pub fn get(&self, id: &WalletId) -> Option<Arc<RegisteredWallet>> {
        self.wallets.read().ok()?.get(id).cloned()
    }

    /// Handles of every registered wallet, ordered by id.
    pub fn list(&self) -> Vec<WalletHandle> {
        let Ok(wallets) = self.wallets.read() else {
            return Vec::new();
        };
        let mut handles: Vec<WalletHandle> = wallets.values().map(|w| w.handle.clone()).collect();
        handles.sort_by(|a, b| a.id.cmp(&b.id));
        handles
    }

    pub fn len(&self) -> usize {
        self.wallets.read().map(|w| w.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every provider. In-flight work keeps its own `Arc` and finishes.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        if let Ok(mut wallets) = self.wallets.write() {
            let count = wallets.len();
            wallets.clear();
            tracing::info!(wallets = count, "Wallet registry torn down");
        }
    }
}

fn build_provider(
    wallet: &WalletConfig,
    config: &AppConfig,
    rpc: Arc<dyn ChainRpc>,
) -> Result<WalletProvider, RegistryError> {
    let id = WalletId::new(&wallet.id);
    let chain_id = ChainId(wallet.chain_id);
    let misconfigured = |reason: &str| RegistryError::Misconfigured {
        id: id.clone(),
        reason: reason.to_string(),
    };
    let provider_err = |source: ProviderError| RegistryError::Provider {
        id: id.clone(),
        source,
    };

    match wallet.kind {
        ProviderKind::Native => {
            let key_env = wallet
                .key_env
                .as_deref()
                .ok_or_else(|| misconfigured("native wallets require key_env"))?;
            let signer = signer_from_env(key_env).map_err(provider_err)?;
            if let Some(address) = wallet.address {
                if address != signer.address() {
                    return Err(misconfigured("configured address does not match the key"));
                }
            }
            Ok(WalletProvider::Native(NativeProvider::new(signer, chain_id, rpc)))
        }
        ProviderKind::Custodial => {
            let address = wallet
                .address
                .ok_or_else(|| misconfigured("custodial wallets require an address"))?;
            let custody = wallet
                .custody
                .as_ref()
                .ok_or_else(|| misconfigured("custodial wallets require a custody section"))?;
            let signer = HttpCustodySigner::from_config(custody, &config.custody).map_err(provider_err)?;
            Ok(WalletProvider::Custodial(CustodialProvider::new(
                Arc::new(signer),
                address,
                chain_id,
                rpc,
                &config.custody,
            )))
        }
        ProviderKind::Multisig => {
            let address = wallet
                .address
                .ok_or_else(|| misconfigured("multisig wallets require the contract address"))?;
            let multisig = wallet
                .multisig
                .as_ref()
                .ok_or_else(|| misconfigured("multisig wallets require a multisig section"))?;
            let chain = config
                .chain(wallet.chain_id)
                .ok_or_else(|| misconfigured("chain is not configured"))?;
            let owner = signer_from_env(&multisig.owner_key_env).map_err(provider_err)?;
            let backend = AlloyMultisig::connect(&chain.rpc_url, address, owner).map_err(provider_err)?;
            tracing::info!(wallet = %id, owner = %backend.owner(), "Multisig owner loaded");
            Ok(WalletProvider::Multisig(MultisigProvider::new(
                Arc::new(backend),
                address,
                chain_id,
                rpc,
                &config.multisig,
            )))
        }
    }
}
