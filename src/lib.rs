//! Trustless inscription and rune swaps over partially-signed Taproot
//! transactions.
//!
//! A seller signs their asset input once with an `ANYONECANPAY` hash type; a
//! buyer later completes that template with their own funding and outputs.
//! The crate covers the pieces a marketplace needs between those two
//! signatures: offers and their lifecycle, purchase locks, the UTXO
//! protection filter, the Taproot signature engine, the Runestone codec and
//! multi-relay broadcast.

pub mod bitcoin_utils;
pub mod broadcast;
pub mod clock;
pub mod commands;
pub mod config;
pub mod error;
pub mod filter;
pub mod locks;
pub mod offer;
pub mod oracle;
pub mod runestone;
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{Error, Result};
