//! Caller-facing errors.

use alloy::primitives::U256;
use thiserror::Error;

use crate::chain::types::Token;
use crate::limits::LimitError;
use crate::tx::log::LogError;
use crate::tx::record::{FailureKind, TransactionRecord, TxId, TxStatus};
use crate::wallet::provider::ProviderError;
use crate::wallet::WalletId;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("Nonce conflict: {0}")]
    NonceConflict(String),

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Spending limit exceeded for {wallet}/{token}: requested {requested}, remaining {remaining}")]
    SpendingLimitExceeded {
        wallet: WalletId,
        token: Token,
        requested: U256,
        remaining: U256,
    },

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Signature rejected: {0}")]
    SignatureRejected(String),

    #[error("Transaction {0} was not final in time; outcome unknown")]
    ConfirmationTimeout(TxId),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Unknown wallet '{0}'")]
    UnknownWallet(WalletId),

    #[error("Transaction {0} already exists")]
    DuplicateTransaction(TxId),

    #[error("Transaction {0} not found")]
    NotFound(TxId),

    #[error("Transaction {id} cannot move from {from} to {to}")]
    StatusRegression { id: TxId, from: TxStatus, to: TxStatus },

    #[error("Transaction {id} is {status} and cannot be resubmitted")]
    NotResubmittable { id: TxId, status: TxStatus },

    #[error("Transaction rejected: {0}")]
    Rejected(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Wallet service is shutting down")]
    ShuttingDown,
}

pub type WalletResult<T> = Result<T, WalletError>;

impl From<LimitError> for WalletError {
    fn from(err: LimitError) -> Self {
        match err {
            LimitError::Exceeded {
                wallet,
                token,
                requested,
                remaining,
            } => WalletError::SpendingLimitExceeded {
                wallet,
                token,
                requested,
                remaining,
            },
            other => WalletError::Validation(other.to_string()),
        }
    }
}

impl From<ProviderError> for WalletError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::SignatureRejected(msg) => WalletError::SignatureRejected(msg),
            ProviderError::Unavailable(msg) => WalletError::ProviderUnavailable(msg),
            ProviderError::InsufficientFunds(msg) => WalletError::InsufficientFunds(msg),
            ProviderError::NonceConflict(msg) => WalletError::NonceConflict(msg),
            ProviderError::Rejected(msg) => WalletError::Rejected(msg),
        }
    }
}

impl From<LogError> for WalletError {
    fn from(err: LogError) -> Self {
        match err {
            LogError::Duplicate(id) => WalletError::DuplicateTransaction(id),
            LogError::NotFound(id) => WalletError::NotFound(id),
            LogError::Regression { id, from, to } => WalletError::StatusRegression { id, from, to },
            other => WalletError::Storage(other.to_string()),
        }
    }
}

impl TransactionRecord {
    /// The caller-facing error a terminal record stands for, if any.
    pub fn outcome_error(&self) -> Option<WalletError> {
        if !self.is_terminal() || self.status == TxStatus::Confirmed {
            return None;
        }
        let message = self.last_error.clone().unwrap_or_default();
        let err = match self.failure? {
            FailureKind::ConfirmationTimeout => WalletError::ConfirmationTimeout(self.id),
            FailureKind::InsufficientFunds => WalletError::InsufficientFunds(message),
            FailureKind::SignatureRejected => WalletError::SignatureRejected(message),
            FailureKind::ProviderUnavailable => WalletError::ProviderUnavailable(message),
            FailureKind::NonceConflict => WalletError::NonceConflict(message),
            FailureKind::BackendRejected
            | FailureKind::Reverted
            | FailureKind::Evicted
            | FailureKind::Interrupted => WalletError::Rejected(message),
        };
        Some(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::types::ChainId;
    use crate::wallet::ProviderKind;
    use alloy::primitives::Address;

    fn record() -> TransactionRecord {
        TransactionRecord::new(
            TxId::new(),
            WalletId::from("w"),
            ProviderKind::Native,
            ChainId(1),
            Address::repeat_byte(1),
            Token::Native,
            U256::from(1),
            None,
        )
    }

    #[test]
    fn test_limit_error_mapping() {
        let err: WalletError = LimitError::Exceeded {
            wallet: WalletId::from("w"),
            token: Token::Native,
            requested: U256::from(50),
            remaining: U256::from(40),
        }
        .into();
        assert!(matches!(err, WalletError::SpendingLimitExceeded { remaining, .. } if remaining == U256::from(40)));

        let err: WalletError = LimitError::InvalidPeriod.into();
        assert!(matches!(err, WalletError::Validation(_)));
    }

    #[test]
    fn test_outcome_error() {
        let mut r = record();
        assert!(r.outcome_error().is_none());

        r.fail(TxStatus::Dropped, FailureKind::ConfirmationTimeout, "late");
        assert!(matches!(r.outcome_error(), Some(WalletError::ConfirmationTimeout(id)) if id == r.id));

        let mut r = record();
        r.fail(TxStatus::Failed, FailureKind::InsufficientFunds, "broke");
        assert!(matches!(r.outcome_error(), Some(WalletError::InsufficientFunds(m)) if m == "broke"));

        let mut r = record();
        r.status = TxStatus::Confirmed;
        assert!(r.outcome_error().is_none());
    }
}
