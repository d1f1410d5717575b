//! Nonce allocation subsystem.
//!
//! The sequencer is the only point of mutual exclusion on the submission
//! path: one lock per (wallet, chain), nothing global.

pub mod sequencer;

pub use sequencer::{NonceError, NonceKey, NonceSequencer, NonceSnapshot, NonceSource, Reservation};
