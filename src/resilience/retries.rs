//! Retry classification for submissions.
//!
//! # Design Decisions
//! - Transient conditions (nonce races, network failures) are recovered
//!   inside the submitter; monetary-safety violations and backend
//!   rejections are never retried
//! - Nonce conflicts get their own budget so a wallet fought over by an
//!   external sender cannot spin forever

use crate::wallet::provider::ProviderError;

/// What the submitter does after a failed provider attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Back off and try again with a fresh reservation.
    Retry,
    /// Resync the nonce sequence against the chain, then try again.
    Resync,
    /// Give up; the record fails.
    Fatal,
}

impl RetryClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryClass::Retry => "unavailable",
            RetryClass::Resync => "nonce_conflict",
            RetryClass::Fatal => "fatal",
        }
    }
}

pub fn classify(err: &ProviderError) -> RetryClass {
    match err {
        ProviderError::Unavailable(_) => RetryClass::Retry,
        ProviderError::NonceConflict(_) => RetryClass::Resync,
        ProviderError::InsufficientFunds(_)
        | ProviderError::SignatureRejected(_)
        | ProviderError::Rejected(_) => RetryClass::Fatal,
    }
}

/// Per-transfer retry accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryBudget {
    pub attempts: u32,
    pub resyncs: u32,
}

impl RetryBudget {
    /// Count a failed attempt; returns false once the budget is spent.
    pub fn spend(&mut self, class: RetryClass, max_attempts: u32, max_resyncs: u32) -> bool {
        match class {
            RetryClass::Retry => {
                self.attempts += 1;
                self.attempts < max_attempts
            }
            RetryClass::Resync => {
                self.resyncs += 1;
                self.resyncs <= max_resyncs
            }
            RetryClass::Fatal => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(classify(&ProviderError::Unavailable("x".into())), RetryClass::Retry);
        assert_eq!(classify(&ProviderError::NonceConflict("x".into())), RetryClass::Resync);
        assert_eq!(classify(&ProviderError::InsufficientFunds("x".into())), RetryClass::Fatal);
        assert_eq!(classify(&ProviderError::SignatureRejected("x".into())), RetryClass::Fatal);
    }

    #[test]
    fn test_budget_exhaustion() {
        let mut budget = RetryBudget::default();
        assert!(budget.spend(RetryClass::Retry, 3, 1));
        assert!(budget.spend(RetryClass::Retry, 3, 1));
        assert!(!budget.spend(RetryClass::Retry, 3, 1));

        let mut budget = RetryBudget::default();
        assert!(budget.spend(RetryClass::Resync, 3, 1));
        assert!(!budget.spend(RetryClass::Resync, 3, 1));
        assert!(!budget.spend(RetryClass::Fatal, 3, 1));
    }
}
