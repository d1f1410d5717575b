//! Per-(wallet, chain) nonce allocation.
//!
//! # Responsibilities
//! - Hand out nonces, one reservation at a time per (wallet, chain)
//! - Return released reservations to a free pool, lowest first
//! - Reconcile against the chain before the first reservation of a run
//! - Gate broadcasts so they happen in nonce order
//!
//! # Design Decisions
//! - One `tokio::sync::Mutex` per key; it is fair, so waiting reservations
//!   are granted FIFO and independent wallets never contend
//! - The lowest nonce that has not yet passed its broadcast point is
//!   published on a `watch` channel; a reservation may broadcast once no
//!   lower reservation is still waiting to
//! - A dropped, unsettled reservation releases itself

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};

use crate::chain::types::{ChainError, ChainId};
use crate::observability::metrics;
use crate::wallet::handle::WalletId;

/// Identifies one independent nonce sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NonceKey {
    pub wallet: WalletId,
    pub chain: ChainId,
}

impl NonceKey {
    pub fn new(wallet: WalletId, chain: ChainId) -> Self {
        Self { wallet, chain }
    }
}

impl fmt::Display for NonceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.wallet, self.chain)
    }
}

/// Where the authoritative next nonce of a sequence comes from.
#[async_trait]
pub trait NonceSource: Send + Sync {
    async fn authoritative_nonce(&self) -> Result<u64, ChainError>;
}

/// Errors raised by the sequencer.
#[derive(Debug, Error)]
pub enum NonceError {
    #[error("Failed to read authoritative nonce for {key}: {source}")]
    Reconcile {
        key: NonceKey,
        #[source]
        source: ChainError,
    },

    #[error("Nonce {nonce} is not reserved for {key}")]
    NotReserved { key: NonceKey, nonce: u64 },
}

#[derive(Debug, Default)]
struct NonceState {
    next_free: u64,
    in_flight: BTreeSet<u64>,
    awaiting_turn: BTreeSet<u64>,
    free: BTreeSet<u64>,
    reconciled: bool,
}

impl NonceState {
    fn reset(&mut self, authoritative: u64) {
        self.next_free = authoritative;
        self.in_flight.clear();
        self.awaiting_turn.clear();
        self.free.clear();
        self.reconciled = true;
    }

    fn take_next(&mut self) -> u64 {
        match self.free.pop_first() {
            Some(nonce) => nonce,
            None => {
                let nonce = self.next_free;
                self.next_free += 1;
                nonce
            }
        }
    }

    fn give_back(&mut self, nonce: u64) {
        self.free.insert(nonce);
        // Shrink the pool from the top so next_free stays tight.
        while self.next_free > 0 && self.free.remove(&(self.next_free - 1)) {
            self.next_free -= 1;
        }
    }

    fn settle(&mut self, nonce: u64) -> bool {
        self.awaiting_turn.remove(&nonce);
        self.in_flight.remove(&nonce)
    }
}

struct NonceSlot {
    state: Mutex<NonceState>,
    turn: watch::Sender<Option<u64>>,
}

impl NonceSlot {
    fn new() -> Self {
        let (turn, _) = watch::channel(None);
        Self {
            state: Mutex::new(NonceState::default()),
            turn,
        }
    }

    fn publish(&self, key: &NonceKey, state: &NonceState) {
        self.turn.send_replace(state.awaiting_turn.first().copied());
        metrics::record_nonces_in_flight(key.wallet.as_str(), key.chain, state.in_flight.len());
    }
}

/// Point-in-time view of one sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonceSnapshot {
    pub next_free: u64,
    pub in_flight: Vec<u64>,
    pub free: Vec<u64>,
    pub reconciled: bool,
}

/// Serializes nonce allocation per (wallet, chain).
#[derive(Default)]
pub struct NonceSequencer {
    slots: DashMap<NonceKey, Arc<NonceSlot>>,
}

impl NonceSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &NonceKey) -> Arc<NonceSlot> {
        self.slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(NonceSlot::new()))
            .clone()
    }

    /// Discard any local state for `key` and restart from the chain's view.
    ///
    /// Called at startup, before any reservation is served.
    pub async fn reconcile(&self, key: &NonceKey, source: &dyn NonceSource) -> Result<u64, NonceError> {
        let slot = self.slot(key);
        let mut state = slot.state.lock().await;
        let authoritative = source
            .authoritative_nonce()
            .await
            .map_err(|source| NonceError::Reconcile {
                key: key.clone(),
                source,
            })?;
        if !state.in_flight.is_empty() {
            tracing::warn!(
                key = %key,
                stale = state.in_flight.len(),
                "Discarding stale in-flight nonces"
            );
        }
        state.reset(authoritative);
        slot.publish(key, &state);
        tracing::info!(key = %key, next_free = authoritative, "Nonce sequence reconciled");
        Ok(authoritative)
    }

    /// Reserve the next nonce for `key`.
    ///
    /// Waits behind earlier reservations for the same key. A sequence that
    /// was never reconciled is reconciled first, under the same lock.
    pub async fn reserve(&self, key: &NonceKey, source: &dyn NonceSource) -> Result<Reservation, NonceError> {
        let slot = self.slot(key);
        let mut state = slot.state.lock().await;
        if !state.reconciled {
            let authoritative = source
                .authoritative_nonce()
                .await
                .map_err(|source| NonceError::Reconcile {
                    key: key.clone(),
                    source,
                })?;
            state.reset(authoritative);
            tracing::info!(key = %key, next_free = authoritative, "Nonce sequence reconciled");
        }

        let nonce = state.take_next();
        state.in_flight.insert(nonce);
        state.awaiting_turn.insert(nonce);
        slot.publish(key, &state);
        drop(state);

        tracing::debug!(key = %key, nonce, "Nonce reserved");
        Ok(Reservation {
            key: key.clone(),
            nonce,
            slot,
            broadcast: AtomicBool::new(false),
            settled: false,
        })
    }

    /// Return an unused reservation to the free pool.
    pub async fn release(&self, reservation: Reservation) -> Result<(), NonceError> {
        let mut reservation = reservation;
        reservation.settled = true;
        release_in(&reservation.slot, &reservation.key, reservation.nonce).await
    }

    /// Mark a reservation as permanently consumed after a successful broadcast.
    pub async fn commit(&self, reservation: Reservation) -> Result<(), NonceError> {
        let mut reservation = reservation;
        reservation.settled = true;
        let mut state = reservation.slot.state.lock().await;
        if !state.settle(reservation.nonce) {
            return Err(NonceError::NotReserved {
                key: reservation.key.clone(),
                nonce: reservation.nonce,
            });
        }
        reservation.slot.publish(&reservation.key, &state);
        tracing::debug!(key = %reservation.key, nonce = reservation.nonce, "Nonce committed");
        Ok(())
    }

    /// Raise `next_free` to the chain's view after a nonce conflict.
    ///
    /// Free-pool entries the chain has already consumed are dropped; live
    /// reservations are left alone.
    pub async fn resync(&self, key: &NonceKey, source: &dyn NonceSource) -> Result<u64, NonceError> {
        let slot = self.slot(key);
        let mut state = slot.state.lock().await;
        let authoritative = source
            .authoritative_nonce()
            .await
            .map_err(|source| NonceError::Reconcile {
                key: key.clone(),
                source,
            })?;
        state.free.retain(|n| *n >= authoritative);
        if authoritative > state.next_free {
            state.next_free = authoritative;
        }
        state.reconciled = true;
        slot.publish(key, &state);
        tracing::info!(key = %key, next_free = state.next_free, "Nonce sequence resynced");
        Ok(state.next_free)
    }

    /// Current state of `key`, if it has ever been used.
    pub async fn snapshot(&self, key: &NonceKey) -> Option<NonceSnapshot> {
        let slot = self.slots.get(key)?.clone();
        let state = slot.state.lock().await;
        Some(NonceSnapshot {
            next_free: state.next_free,
            in_flight: state.in_flight.iter().copied().collect(),
            free: state.free.iter().copied().collect(),
            reconciled: state.reconciled,
        })
    }
}

async fn release_in(slot: &NonceSlot, key: &NonceKey, nonce: u64) -> Result<(), NonceError> {
    let mut state = slot.state.lock().await;
    if !state.settle(nonce) {
        return Err(NonceError::NotReserved {
            key: key.clone(),
            nonce,
        });
    }
    state.give_back(nonce);
    slot.publish(key, &state);
    tracing::debug!(key = %key, nonce, "Nonce released");
    Ok(())
}

/// A reserved, not yet settled nonce.
///
/// Settle it with [`NonceSequencer::commit`] or [`NonceSequencer::release`].
/// Dropping it unsettled releases it in the background.
pub struct Reservation {
    key: NonceKey,
    nonce: u64,
    slot: Arc<NonceSlot>,
    broadcast: AtomicBool,
    settled: bool,
}

impl Reservation {
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn key(&self) -> &NonceKey {
        &self.key
    }

    /// Wait until every lower reservation of this sequence has passed its
    /// broadcast point or been released, so broadcasts leave in grant order.
    pub async fn wait_turn(&self) {
        let nonce = self.nonce;
        let mut rx = self.slot.turn.subscribe();
        // The sender lives as long as `self.slot`, so this cannot fail.
        let _ = rx
            .wait_for(|lowest| lowest.map_or(true, |low| low >= nonce))
            .await;
    }

    /// Signal that this reservation has broadcast, opening the turn for the
    /// next one before the reservation itself is settled.
    pub async fn finish_turn(&self) {
        self.broadcast.store(true, Ordering::Release);
        self.yield_turn().await;
    }

    /// Open the turn for the next reservation without consuming this
    /// nonce; it is released when the reservation settles.
    pub async fn yield_turn(&self) {
        let mut state = self.slot.state.lock().await;
        if state.awaiting_turn.remove(&self.nonce) {
            self.slot.publish(&self.key, &state);
        }
    }

    /// Whether [`finish_turn`](Self::finish_turn) was called, i.e. the nonce
    /// may already be consumed on chain.
    pub fn has_broadcast(&self) -> bool {
        self.broadcast.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("key", &self.key)
            .field("nonce", &self.nonce)
            .field("broadcast", &self.has_broadcast())
            .field("settled", &self.settled)
            .finish()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let slot = self.slot.clone();
        let key = self.key.clone();
        let nonce = self.nonce;
        tracing::warn!(key = %key, nonce, "Reservation dropped without settlement, releasing");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = release_in(&slot, &key, nonce).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    struct FixedSource(AtomicU64);

    impl FixedSource {
        fn new(n: u64) -> Self {
            Self(AtomicU64::new(n))
        }
    }

    #[async_trait]
    impl NonceSource for FixedSource {
        async fn authoritative_nonce(&self) -> Result<u64, ChainError> {
            Ok(self.0.load(Ordering::SeqCst))
        }
    }

    struct FailingSource;

    #[async_trait]
    impl NonceSource for FailingSource {
        async fn authoritative_nonce(&self) -> Result<u64, ChainError> {
            Err(ChainError::Rpc("down".into()))
        }
    }

    fn key() -> NonceKey {
        NonceKey::new(WalletId::from("w1"), ChainId(8453))
    }

    #[tokio::test]
    async fn test_reserve_reconciles_lazily() {
        let seq = NonceSequencer::new();
        let source = FixedSource::new(7);

        let r1 = seq.reserve(&key(), &source).await.unwrap();
        let r2 = seq.reserve(&key(), &source).await.unwrap();
        assert_eq!(r1.nonce(), 7);
        assert_eq!(r2.nonce(), 8);

        seq.commit(r1).await.unwrap();
        seq.commit(r2).await.unwrap();
        let snap = seq.snapshot(&key()).await.unwrap();
        assert_eq!(snap.next_free, 9);
        assert!(snap.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_release_returns_same_value() {
        let seq = NonceSequencer::new();
        let source = FixedSource::new(3);

        let r = seq.reserve(&key(), &source).await.unwrap();
        assert_eq!(r.nonce(), 3);
        seq.release(r).await.unwrap();

        let again = seq.reserve(&key(), &source).await.unwrap();
        assert_eq!(again.nonce(), 3);
        seq.commit(again).await.unwrap();
    }

    #[tokio::test]
    async fn test_released_gap_is_reused_first() {
        let seq = NonceSequencer::new();
        let source = FixedSource::new(0);

        let r0 = seq.reserve(&key(), &source).await.unwrap();
        let r1 = seq.reserve(&key(), &source).await.unwrap();
        seq.release(r0).await.unwrap();
        seq.commit(r1).await.unwrap();

        let snap = seq.snapshot(&key()).await.unwrap();
        assert_eq!(snap.free, vec![0]);
        assert_eq!(snap.next_free, 2);

        let r = seq.reserve(&key(), &source).await.unwrap();
        assert_eq!(r.nonce(), 0);
        seq.commit(r).await.unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_discards_stale_state() {
        let seq = NonceSequencer::new();
        let source = FixedSource::new(10);
        let r = seq.reserve(&key(), &source).await.unwrap();
        assert_eq!(r.nonce(), 10);

        source.0.store(12, Ordering::SeqCst);
        seq.reconcile(&key(), &source).await.unwrap();
        let snap = seq.snapshot(&key()).await.unwrap();
        assert_eq!(snap.next_free, 12);
        assert!(snap.in_flight.is_empty());

        // The stale reservation can no longer be committed.
        assert!(matches!(seq.commit(r).await, Err(NonceError::NotReserved { .. })));
    }

    #[tokio::test]
    async fn test_resync_skips_consumed_nonces() {
        let seq = NonceSequencer::new();
        let source = FixedSource::new(0);
        let r0 = seq.reserve(&key(), &source).await.unwrap();
        let r1 = seq.reserve(&key(), &source).await.unwrap();
        seq.release(r0).await.unwrap();

        source.0.store(5, Ordering::SeqCst);
        assert_eq!(seq.resync(&key(), &source).await.unwrap(), 5);

        let next = seq.reserve(&key(), &source).await.unwrap();
        assert_eq!(next.nonce(), 5);
        seq.commit(next).await.unwrap();
        seq.release(r1).await.unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_failure_surfaces() {
        let seq = NonceSequencer::new();
        let result = seq.reserve(&key(), &FailingSource).await;
        assert!(matches!(result, Err(NonceError::Reconcile { .. })));
    }

    #[tokio::test]
    async fn test_concurrent_reservations_unique() {
        let seq = Arc::new(NonceSequencer::new());
        let source = Arc::new(FixedSource::new(100));
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let seq = seq.clone();
            let source = source.clone();
            tasks.push(tokio::spawn(async move {
                let r = seq.reserve(&key(), source.as_ref()).await.unwrap();
                let n = r.nonce();
                seq.commit(r).await.unwrap();
                n
            }));
        }
        let mut nonces = Vec::new();
        for t in tasks {
            nonces.push(t.await.unwrap());
        }
        nonces.sort_unstable();
        assert_eq!(nonces, (100..132).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_wait_turn_orders_broadcasts() {
        let seq = NonceSequencer::new();
        let source = FixedSource::new(0);
        let low = seq.reserve(&key(), &source).await.unwrap();
        let high = seq.reserve(&key(), &source).await.unwrap();

        // The higher nonce must wait while the lower one is in flight.
        let blocked = tokio::time::timeout(Duration::from_millis(50), high.wait_turn()).await;
        assert!(blocked.is_err());

        low.wait_turn().await;
        seq.commit(low).await.unwrap();

        tokio::time::timeout(Duration::from_millis(50), high.wait_turn())
            .await
            .expect("turn should open once the lower nonce settles");
        seq.commit(high).await.unwrap();
    }

    #[tokio::test]
    async fn test_finish_turn_opens_next_broadcast() {
        let seq = NonceSequencer::new();
        let source = FixedSource::new(0);
        let low = seq.reserve(&key(), &source).await.unwrap();
        let high = seq.reserve(&key(), &source).await.unwrap();

        low.finish_turn().await;
        assert!(low.has_broadcast());
        assert!(!high.has_broadcast());
        tokio::time::timeout(Duration::from_millis(50), high.wait_turn())
            .await
            .expect("turn should open once the lower nonce has broadcast");

        let snap = seq.snapshot(&key()).await.unwrap();
        assert_eq!(snap.in_flight, vec![0, 1]);
        seq.commit(low).await.unwrap();
        seq.commit(high).await.unwrap();
    }

    #[tokio::test]
    async fn test_yield_turn_keeps_nonce_reusable() {
        let seq = NonceSequencer::new();
        let source = FixedSource::new(0);
        let low = seq.reserve(&key(), &source).await.unwrap();
        let high = seq.reserve(&key(), &source).await.unwrap();

        low.yield_turn().await;
        assert!(!low.has_broadcast());
        tokio::time::timeout(Duration::from_millis(50), high.wait_turn())
            .await
            .expect("turn should open once the lower nonce yields");

        seq.release(low).await.unwrap();
        seq.commit(high).await.unwrap();
        let again = seq.reserve(&key(), &source).await.unwrap();
        assert_eq!(again.nonce(), 0);
        seq.commit(again).await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_reservation_is_released() {
        let seq = NonceSequencer::new();
        let source = FixedSource::new(4);
        {
            let _r = seq.reserve(&key(), &source).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let r = seq.reserve(&key(), &source).await.unwrap();
        assert_eq!(r.nonce(), 4);
        seq.commit(r).await.unwrap();
    }

    #[tokio::test]
    async fn test_independent_keys() {
        let seq = NonceSequencer::new();
        let a = NonceKey::new(WalletId::from("a"), ChainId(1));
        let b = NonceKey::new(WalletId::from("b"), ChainId(1));

        let ra = seq.reserve(&a, &FixedSource::new(0)).await.unwrap();
        // `b` is served while `a` still holds an in-flight reservation.
        let rb = seq.reserve(&b, &FixedSource::new(50)).await.unwrap();
        rb.wait_turn().await;
        assert_eq!(rb.nonce(), 50);
        seq.commit(rb).await.unwrap();
        seq.commit(ra).await.unwrap();
    }
}
