//! Transaction records and their status machine.

use alloy::primitives::{Address, TxHash, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::chain::types::{ChainId, Token};
use crate::wallet::handle::{ProviderKind, WalletId};
use crate::wallet::provider::Approvals;

/// Unix timestamp in seconds.
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Caller-visible transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(Uuid);

impl TxId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TxId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle of a transfer.
///
/// `Building → Reserved → Submitted → Confirmed | Failed | Dropped`, with
/// `Failed` also reachable from the two earlier states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Building,
    Reserved,
    Submitted,
    Confirmed,
    Failed,
    Dropped,
}

impl TxStatus {
    fn rank(&self) -> u8 {
        match self {
            TxStatus::Building => 0,
            TxStatus::Reserved => 1,
            TxStatus::Submitted => 2,
            TxStatus::Confirmed | TxStatus::Failed | TxStatus::Dropped => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 3
    }

    /// Whether a record in this status may move to `next`.
    pub fn can_advance_to(&self, next: TxStatus) -> bool {
        if self.is_terminal() {
            return *self == next;
        }
        if next == TxStatus::Dropped {
            // Only an observed broadcast can time out.
            return *self == TxStatus::Submitted;
        }
        next.rank() >= self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Building => "building",
            TxStatus::Reserved => "reserved",
            TxStatus::Submitted => "submitted",
            TxStatus::Confirmed => "confirmed",
            TxStatus::Failed => "failed",
            TxStatus::Dropped => "dropped",
        }
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a record ended in `Failed` or `Dropped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InsufficientFunds,
    SignatureRejected,
    ProviderUnavailable,
    NonceConflict,
    BackendRejected,
    Reverted,
    Evicted,
    ConfirmationTimeout,
    Interrupted,
}

/// Audit record of one transfer. Never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: TxId,
    pub wallet_id: WalletId,
    pub kind: ProviderKind,
    pub chain_id: ChainId,
    pub nonce: Option<u64>,
    pub to: Address,
    pub token: Token,
    pub amount: U256,
    pub status: TxStatus,
    pub attempt_count: u32,
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_tx_id: Option<TxHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approvals: Option<Approvals>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// The record this one was explicitly resubmitted from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaces: Option<TxId>,
}

impl TransactionRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: TxId,
        wallet_id: WalletId,
        kind: ProviderKind,
        chain_id: ChainId,
        to: Address,
        token: Token,
        amount: U256,
        replaces: Option<TxId>,
    ) -> Self {
        let now = now_unix();
        Self {
            id,
            wallet_id,
            kind,
            chain_id,
            nonce: None,
            to,
            token,
            amount,
            status: TxStatus::Building,
            attempt_count: 0,
            created_at: now,
            updated_at: now,
            backend_tx_id: None,
            approvals: None,
            failure: None,
            last_error: None,
            replaces,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move the record to a terminal failure state.
    pub fn fail(&mut self, status: TxStatus, kind: FailureKind, message: impl Into<String>) {
        self.status = status;
        self.failure = Some(kind);
        self.last_error = Some(message.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_only() {
        use TxStatus::*;
        assert!(Building.can_advance_to(Reserved));
        assert!(Reserved.can_advance_to(Reserved));
        assert!(Reserved.can_advance_to(Submitted));
        assert!(Submitted.can_advance_to(Confirmed));
        assert!(Reserved.can_advance_to(Failed));
        assert!(Building.can_advance_to(Failed));

        assert!(!Submitted.can_advance_to(Reserved));
        assert!(!Confirmed.can_advance_to(Failed));
        assert!(!Dropped.can_advance_to(Confirmed));
        assert!(!Reserved.can_advance_to(Dropped));
        assert!(Confirmed.can_advance_to(Confirmed));
    }

    #[test]
    fn test_record_serde() {
        let record = TransactionRecord::new(
            TxId::new(),
            WalletId::from("w"),
            ProviderKind::Native,
            ChainId(1),
            Address::ZERO,
            Token::Native,
            U256::from(5),
            None,
        );
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"status\":\"building\""));
        assert!(!json.contains("backend_tx_id"));
        let back: TransactionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_tx_id_parse() {
        let id = TxId::new();
        assert_eq!(id.to_string().parse::<TxId>().unwrap(), id);
        assert!("nope".parse::<TxId>().is_err());
    }
}
