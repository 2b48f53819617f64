//! Offer entity and its lifecycle
//!
//! ```text
//! Draft ──activate──▶ Active ──lock──▶ Locked ──complete──▶ Completed
//!   │                  │  ▲              │
//!   │                  │  └──release─────┤
//!   ├──cancel──────────┴──▶ Cancelled    │
//!   └──────── expiry (Draft/Active/Locked) ──▶ Expired
//! ```

pub mod book;
pub mod store;

pub use book::*;
pub use store::*;

use std::time::Duration;

use bitcoin::psbt::Psbt;
use bitcoin::{ScriptBuf, XOnlyPublicKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::bitcoin_utils::keys::p2tr_output_key;
use crate::bitcoin_utils::sighash::SighashType;
use crate::clock::deadline;
use crate::error::{Error, Result};
use crate::types::{AssetRef, OfferId, Utxo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferState {
    Draft,
    Active,
    Locked,
    Completed,
    Cancelled,
    Expired,
}

impl OfferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OfferState::Completed | OfferState::Cancelled | OfferState::Expired
        )
    }

    pub fn can_transition_to(self, next: OfferState) -> bool {
        use OfferState::*;
        matches!(
            (self, next),
            (Draft, Active)
                | (Draft, Cancelled)
                | (Draft, Expired)
                | (Active, Locked)
                | (Active, Cancelled)
                | (Active, Expired)
                | (Locked, Active)
                | (Locked, Completed)
                | (Locked, Expired)
        )
    }
}

/// The hash type the seller must sign with for a given asset shape.
///
/// An inscription sale binds the seller's input to the seller's payment
/// output only; a rune sale binds the seller's input alone, since the buyer
/// has to build the runestone and receive outputs around it.
pub fn required_sighash(asset: &AssetRef) -> SighashType {
    match asset {
        AssetRef::Inscription { .. } => SighashType::SinglePlusAnyoneCanPay,
        AssetRef::Rune { .. } => SighashType::NonePlusAnyoneCanPay,
    }
}

/// Everything the seller declares when creating an offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferTerms {
    pub asset_ref: AssetRef,
    /// The resolved UTXO carrying the asset.
    pub asset_utxo: Utxo,
    pub price_sats: u64,
    pub seller_address: String,
    pub seller_script: ScriptBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,
    pub asset_ref: AssetRef,
    pub asset_utxo: Utxo,
    pub price_sats: u64,
    pub seller_address: String,
    pub seller_script: ScriptBuf,
    pub seller_pubkey_xonly: XOnlyPublicKey,
    pub state: OfferState,
    pub sighash_mode: SighashType,
    pub seller_psbt: Option<Psbt>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Set once the purchase is broadcast.
    pub txid: Option<String>,
}

impl Offer {
    pub fn new(id: OfferId, terms: OfferTerms, now: DateTime<Utc>, ttl: Duration) -> Result<Self> {
        if terms.price_sats == 0 {
            return Err(Error::InvalidPrice);
        }
        if terms.asset_utxo.outpoint != terms.asset_ref.outpoint() {
            return Err(Error::AssetNotOwned(format!(
                "utxo {} does not hold the offered asset",
                terms.asset_utxo.outpoint
            )));
        }
        let seller_pubkey_xonly = p2tr_output_key(&terms.asset_utxo.script_pubkey)
            .ok_or_else(|| {
                Error::AssetNotOwned(format!(
                    "asset utxo {} is not a taproot output",
                    terms.asset_utxo.outpoint
                ))
            })?;

        Ok(Self {
            id,
            sighash_mode: required_sighash(&terms.asset_ref),
            asset_ref: terms.asset_ref,
            asset_utxo: terms.asset_utxo,
            price_sats: terms.price_sats,
            seller_address: terms.seller_address,
            seller_script: terms.seller_script,
            seller_pubkey_xonly,
            state: OfferState::Draft,
            seller_psbt: None,
            created_at: now,
            expires_at: deadline(now, ttl),
            txid: None,
        })
    }

    /// Move to `next`, or fail with the operation that was refused.
    pub fn transition(&mut self, operation: &'static str, next: OfferState) -> Result<()> {
        if self.state == next && next == OfferState::Locked {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(Error::OfferStateConflict {
                operation,
                state: self.state,
            });
        }
        info!(offer = %self.id, from = ?self.state, to = ?next, operation, "offer transition");
        self.state = next;
        Ok(())
    }

    /// Store the signed seller template. Only drafts accept one.
    pub fn attach_seller_psbt(&mut self, psbt: Psbt) -> Result<()> {
        if self.state != OfferState::Draft {
            return Err(Error::OfferStateConflict {
                operation: "attach_seller_psbt",
                state: self.state,
            });
        }
        self.seller_psbt = Some(psbt);
        Ok(())
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.state.is_terminal() && self.expires_at <= now
    }
}
