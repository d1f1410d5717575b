//! Per-(wallet, token) spending caps.
//!
//! # Responsibilities
//! - Atomically test and reserve an amount against a configured cap
//! - Roll windows over lazily, on the first check after expiry
//! - Undo a reservation whose transfer never reached the chain
//! - Rebuild consumption from the transaction journal after a restart
//!
//! # Design Decisions
//! - Each pair lives in its own `DashMap` entry; the entry guard is the
//!   per-pair lock, so different tokens of one wallet never contend
//! - Every reservation is kept as an individual spend, which makes
//!   `release` exact in both window modes
//! - A pair without a limit is unconstrained and is not tracked

use alloy::primitives::utils::parse_units;
use alloy::primitives::U256;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::chain::types::Token;
use crate::observability::metrics;
use crate::wallet::handle::WalletId;

/// How a spending window advances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowMode {
    /// The window restarts entirely at the first check after it expires.
    #[default]
    Fixed,
    /// Only spends younger than one period count.
    Rolling,
}

/// Errors raised by the spending guard.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LimitError {
    #[error("Spending limit exceeded for {wallet}/{token}: requested {requested}, remaining {remaining}")]
    Exceeded {
        wallet: WalletId,
        token: Token,
        requested: U256,
        remaining: U256,
    },

    #[error("Invalid amount '{0}': {1}")]
    InvalidAmount(String, String),

    #[error("Spending period must be greater than zero")]
    InvalidPeriod,
}

pub type LimitResult<T> = Result<T, LimitError>;

/// Convert a human-readable amount (e.g. `"0.5"`) into base units.
pub fn parse_amount(amount: &str, decimals: u8) -> LimitResult<U256> {
    let trimmed = amount.trim();
    if trimmed.starts_with('-') {
        return Err(LimitError::InvalidAmount(
            trimmed.to_string(),
            "must not be negative".to_string(),
        ));
    }
    parse_units(trimmed, decimals)
        .map(|units| units.get_absolute())
        .map_err(|e| LimitError::InvalidAmount(trimmed.to_string(), e.to_string()))
}

/// Provisional consumption handed out by [`SpendingLimitGuard::check_and_reserve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allowance {
    pub wallet: WalletId,
    pub token: Token,
    pub amount: U256,
    /// Window the reservation was made in; `None` for unconstrained pairs.
    pub window: Option<u64>,
    spend: Option<u64>,
}

impl Allowance {
    fn unconstrained(wallet: WalletId, token: Token, amount: U256) -> Self {
        Self {
            wallet,
            token,
            amount,
            window: None,
            spend: None,
        }
    }

    pub fn is_constrained(&self) -> bool {
        self.spend.is_some()
    }
}

#[derive(Debug, Clone)]
struct Spend {
    id: u64,
    at: Instant,
    amount: U256,
}

#[derive(Debug)]
struct SpendingLimit {
    cap: U256,
    period: Duration,
    window: u64,
    window_start: Instant,
    spends: VecDeque<Spend>,
}

impl SpendingLimit {
    fn new(cap: U256, period: Duration, now: Instant) -> Self {
        Self {
            cap,
            period,
            window: 0,
            window_start: now,
            spends: VecDeque::new(),
        }
    }

    fn consumed(&self) -> U256 {
        self.spends
            .iter()
            .fold(U256::ZERO, |acc, s| acc.saturating_add(s.amount))
    }

    fn roll(&mut self, mode: WindowMode, now: Instant) {
        match mode {
            WindowMode::Fixed => {
                if now.saturating_duration_since(self.window_start) >= self.period {
                    self.spends.clear();
                    self.window_start = now;
                    self.window += 1;
                }
            }
            WindowMode::Rolling => {
                while let Some(oldest) = self.spends.front() {
                    if now.saturating_duration_since(oldest.at) >= self.period {
                        self.spends.pop_front();
                    } else {
                        break;
                    }
                }
                self.window_start = self.spends.front().map_or(now, |s| s.at);
            }
        }
    }

    fn resets_in(&self, now: Instant) -> Duration {
        (self.window_start + self.period).saturating_duration_since(now)
    }
}

/// Snapshot of one configured limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimitStatus {
    pub wallet: WalletId,
    pub token: Token,
    pub cap: U256,
    pub consumed: U256,
    pub remaining: U256,
    pub period_secs: u64,
    pub resets_in_secs: u64,
}

/// Enforces spending caps per (wallet, token).
pub struct SpendingLimitGuard {
    limits: DashMap<(WalletId, Token), SpendingLimit>,
    mode: WindowMode,
    next_spend: AtomicU64,
}

impl SpendingLimitGuard {
    pub fn new(mode: WindowMode) -> Self {
        Self {
            limits: DashMap::new(),
            mode,
            next_spend: AtomicU64::new(1),
        }
    }

    pub fn mode(&self) -> WindowMode {
        self.mode
    }

    /// Create or replace the cap of a pair.
    ///
    /// Consumption inside the current window is carried over, so lowering a
    /// cap below what was already spent blocks further transfers until the
    /// window rolls over.
    pub fn configure(&self, wallet: &WalletId, token: Token, cap: U256, period: Duration) -> LimitResult<()> {
        if period.is_zero() {
            return Err(LimitError::InvalidPeriod);
        }
        let now = Instant::now();
        self.limits
            .entry((wallet.clone(), token))
            .and_modify(|limit| {
                limit.cap = cap;
                limit.period = period;
            })
            .or_insert_with(|| SpendingLimit::new(cap, period, now));
        tracing::info!(
            wallet = %wallet,
            token = %token,
            cap = %cap,
            period_secs = period.as_secs(),
            "Spending limit configured"
        );
        Ok(())
    }

    /// Remove the cap of a pair, making it unconstrained.
    pub fn remove(&self, wallet: &WalletId, token: Token) -> bool {
        self.limits.remove(&(wallet.clone(), token)).is_some()
    }

    /// Test `consumed + amount <= cap` and, if it holds, consume `amount`.
    pub fn check_and_reserve(&self, wallet: &WalletId, token: Token, amount: U256) -> LimitResult<Allowance> {
        self.check_and_reserve_at(wallet, token, amount, Instant::now())
    }

    pub fn check_and_reserve_at(
        &self,
        wallet: &WalletId,
        token: Token,
        amount: U256,
        now: Instant,
    ) -> LimitResult<Allowance> {
        let Some(mut limit) = self.limits.get_mut(&(wallet.clone(), token)) else {
            return Ok(Allowance::unconstrained(wallet.clone(), token, amount));
        };

        limit.roll(self.mode, now);
        let consumed = limit.consumed();
        let remaining = limit.cap.saturating_sub(consumed);
        if amount > remaining {
            metrics::record_spending_rejected(wallet.as_str(), &token.to_string());
            tracing::warn!(
                wallet = %wallet,
                token = %token,
                requested = %amount,
                consumed = %consumed,
                cap = %limit.cap,
                "Spending limit exceeded"
            );
            return Err(LimitError::Exceeded {
                wallet: wallet.clone(),
                token,
                requested: amount,
                remaining,
            });
        }

        let id = self.next_spend.fetch_add(1, Ordering::Relaxed);
        limit.spends.push_back(Spend { id, at: now, amount });
        tracing::debug!(
            wallet = %wallet,
            token = %token,
            amount = %amount,
            consumed = %consumed.saturating_add(amount),
            "Spending allowance reserved"
        );
        Ok(Allowance {
            wallet: wallet.clone(),
            token,
            amount,
            window: Some(limit.window),
            spend: Some(id),
        })
    }

    /// Nothing to do: consumption was applied at reservation time.
    pub fn commit(&self, _allowance: Allowance) {}

    /// Give an allowance back. A no-op once its window has rolled over.
    pub fn release(&self, allowance: Allowance) {
        let Some(spend) = allowance.spend else {
            return;
        };
        let Some(mut limit) = self.limits.get_mut(&(allowance.wallet.clone(), allowance.token)) else {
            return;
        };
        if self.mode == WindowMode::Fixed && allowance.window != Some(limit.window) {
            return;
        }
        if let Some(pos) = limit.spends.iter().position(|s| s.id == spend) {
            limit.spends.remove(pos);
            tracing::debug!(
                wallet = %allowance.wallet,
                token = %allowance.token,
                amount = %allowance.amount,
                "Spending allowance released"
            );
        }
    }

    /// Count a spend made `age` ago (rebuilt from the journal).
    ///
    /// Spends older than one period and pairs without a limit are ignored.
    pub fn seed(&self, wallet: &WalletId, token: Token, amount: U256, age: Duration) {
        let now = Instant::now();
        let Some(mut limit) = self.limits.get_mut(&(wallet.clone(), token)) else {
            return;
        };
        if age >= limit.period {
            return;
        }
        let at = now.checked_sub(age).unwrap_or(now);
        if at < limit.window_start {
            limit.window_start = at;
        }
        let id = self.next_spend.fetch_add(1, Ordering::Relaxed);
        let pos = limit.spends.iter().position(|s| s.at > at).unwrap_or(limit.spends.len());
        limit.spends.insert(pos, Spend { id, at, amount });
    }

    /// Current state of a pair, `None` if it is unconstrained.
    pub fn status(&self, wallet: &WalletId, token: Token) -> Option<LimitStatus> {
        let now = Instant::now();
        let mut limit = self.limits.get_mut(&(wallet.clone(), token))?;
        limit.roll(self.mode, now);
        let consumed = limit.consumed();
        Some(LimitStatus {
            wallet: wallet.clone(),
            token,
            cap: limit.cap,
            consumed,
            remaining: limit.cap.saturating_sub(consumed),
            period_secs: limit.period.as_secs(),
            resets_in_secs: limit.resets_in(now).as_secs(),
        })
    }

    /// Status of every configured limit of `wallet`.
    pub fn statuses(&self, wallet: &WalletId) -> Vec<LimitStatus> {
        let tokens: Vec<Token> = self
            .limits
            .iter()
            .filter(|e| &e.key().0 == wallet)
            .map(|e| e.key().1)
            .collect();
        tokens
            .into_iter()
            .filter_map(|token| self.status(wallet, token))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    const DAY: Duration = Duration::from_secs(86_400);

    fn usdc() -> Token {
        Token::Erc20(address!("0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"))
    }

    fn units(n: u64) -> U256 {
        U256::from(n) * U256::from(1_000_000u64)
    }

    fn guard_with_cap(mode: WindowMode, cap: U256) -> (SpendingLimitGuard, WalletId) {
        let guard = SpendingLimitGuard::new(mode);
        let wallet = WalletId::from("agent");
        guard.configure(&wallet, usdc(), cap, DAY).unwrap();
        (guard, wallet)
    }

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount("100", 6).unwrap(), U256::from(100_000_000u64));
        assert_eq!(parse_amount("0.5", 18).unwrap(), U256::from(500_000_000_000_000_000u64));
        assert!(parse_amount("-1", 6).is_err());
        assert!(parse_amount("abc", 6).is_err());
    }

    #[test]
    fn test_exceeding_request_leaves_consumption_untouched() {
        let (guard, wallet) = guard_with_cap(WindowMode::Fixed, units(100));

        guard.check_and_reserve(&wallet, usdc(), units(60)).unwrap();
        let err = guard.check_and_reserve(&wallet, usdc(), units(50)).unwrap_err();
        assert!(matches!(err, LimitError::Exceeded { remaining, .. } if remaining == units(40)));

        let status = guard.status(&wallet, usdc()).unwrap();
        assert_eq!(status.consumed, units(60));
    }

    #[test]
    fn test_exact_cap_allowed() {
        let (guard, wallet) = guard_with_cap(WindowMode::Fixed, units(100));
        guard.check_and_reserve(&wallet, usdc(), units(100)).unwrap();
        assert!(guard.check_and_reserve(&wallet, usdc(), U256::from(1)).is_err());
    }

    #[test]
    fn test_concurrent_reservations_never_pass_cap() {
        let (guard, wallet) = guard_with_cap(WindowMode::Rolling, units(100));

        let accepted: Vec<U256> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        let mut granted = Vec::new();
                        for _ in 0..10 {
                            if let Ok(allowance) = guard.check_and_reserve(&wallet, usdc(), units(3)) {
                                granted.push(allowance.amount);
                            }
                            let consumed = guard.status(&wallet, usdc()).unwrap().consumed;
                            assert!(consumed <= units(100));
                        }
                        granted
                    })
                })
                .collect();
            workers.into_iter().flat_map(|w| w.join().unwrap()).collect()
        });

        let total = accepted.iter().fold(U256::ZERO, |sum, a| sum + a);
        assert_eq!(accepted.len(), 33);
        assert_eq!(total, guard.status(&wallet, usdc()).unwrap().consumed);
    }

    #[test]
    fn test_unconfigured_pair_is_unlimited() {
        let guard = SpendingLimitGuard::new(WindowMode::Fixed);
        let allowance = guard
            .check_and_reserve(&WalletId::from("free"), Token::Native, U256::MAX)
            .unwrap();
        assert!(!allowance.is_constrained());
        guard.release(allowance);
    }

    #[test]
    fn test_release_restores_capacity() {
        let (guard, wallet) = guard_with_cap(WindowMode::Fixed, units(100));
        let a = guard.check_and_reserve(&wallet, usdc(), units(70)).unwrap();
        guard.release(a);
        guard.check_and_reserve(&wallet, usdc(), units(100)).unwrap();
    }

    #[test]
    fn test_fixed_window_rollover() {
        let (guard, wallet) = guard_with_cap(WindowMode::Fixed, units(100));
        let start = Instant::now();
        let old = guard.check_and_reserve_at(&wallet, usdc(), units(90), start).unwrap();

        let later = start + DAY + Duration::from_secs(1);
        let fresh = guard.check_and_reserve_at(&wallet, usdc(), units(90), later).unwrap();
        assert_ne!(old.window, fresh.window);

        // Releasing from the expired window must not touch the new one.
        guard.release(old);
        assert!(guard.check_and_reserve_at(&wallet, usdc(), units(20), later).is_err());
    }

    #[test]
    fn test_rolling_window_slides() {
        let (guard, wallet) = guard_with_cap(WindowMode::Rolling, units(100));
        let start = Instant::now();
        guard.check_and_reserve_at(&wallet, usdc(), units(60), start).unwrap();
        let half = start + DAY / 2;
        guard.check_and_reserve_at(&wallet, usdc(), units(40), half).unwrap();

        // The first spend has aged out, the second has not.
        let after_first = start + DAY + Duration::from_secs(1);
        guard.check_and_reserve_at(&wallet, usdc(), units(60), after_first).unwrap();
        assert!(guard.check_and_reserve_at(&wallet, usdc(), units(1), after_first).is_err());
    }

    #[test]
    fn test_configure_carries_consumption() {
        let (guard, wallet) = guard_with_cap(WindowMode::Fixed, units(100));
        guard.check_and_reserve(&wallet, usdc(), units(80)).unwrap();

        guard.configure(&wallet, usdc(), units(50), DAY).unwrap();
        let status = guard.status(&wallet, usdc()).unwrap();
        assert_eq!(status.consumed, units(80));
        assert_eq!(status.remaining, U256::ZERO);
        assert!(guard.check_and_reserve(&wallet, usdc(), U256::from(1)).is_err());
    }

    #[test]
    fn test_zero_period_rejected() {
        let guard = SpendingLimitGuard::new(WindowMode::Fixed);
        let err = guard
            .configure(&WalletId::from("w"), Token::Native, U256::from(1), Duration::ZERO)
            .unwrap_err();
        assert_eq!(err, LimitError::InvalidPeriod);
    }

    #[test]
    fn test_seed_counts_recent_spends_only() {
        let (guard, wallet) = guard_with_cap(WindowMode::Fixed, units(100));
        guard.seed(&wallet, usdc(), units(30), Duration::from_secs(60));
        guard.seed(&wallet, usdc(), units(50), DAY * 2);

        let status = guard.status(&wallet, usdc()).unwrap();
        assert_eq!(status.consumed, units(30));
    }

    #[test]
    fn test_tokens_are_independent() {
        let (guard, wallet) = guard_with_cap(WindowMode::Fixed, units(100));
        guard.configure(&wallet, Token::Native, U256::from(10), DAY).unwrap();
        guard.check_and_reserve(&wallet, usdc(), units(100)).unwrap();
        guard.check_and_reserve(&wallet, Token::Native, U256::from(10)).unwrap();
        assert_eq!(guard.statuses(&wallet).len(), 2);
    }
}
