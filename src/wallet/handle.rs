//! Wallet identity.

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::chain::types::ChainId;

/// Caller-facing wallet identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WalletId(String);

impl WalletId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WalletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WalletId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Signing backend of a wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Local private key, single-phase build/sign/broadcast.
    Native,
    /// Remote managed custody signs on our behalf.
    Custodial,
    /// On-chain multisig: propose, collect approvals, execute.
    Multisig,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Native => "native",
            ProviderKind::Custodial => "custodial",
            ProviderKind::Multisig => "multisig",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable description of a registered wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletHandle {
    pub id: WalletId,
    pub kind: ProviderKind,
    pub chain_id: ChainId,
    pub address: Address,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_kind_serde() {
        let kind: ProviderKind = serde_json::from_str("\"multisig\"").unwrap();
        assert_eq!(kind, ProviderKind::Multisig);
        assert_eq!(serde_json::to_string(&ProviderKind::Native).unwrap(), "\"native\"");
        assert_eq!(ProviderKind::Custodial.to_string(), "custodial");
    }

    #[test]
    fn test_wallet_id() {
        let id = WalletId::from("treasury");
        assert_eq!(id.as_str(), "treasury");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"treasury\"");
    }
}
