//! Deterministic parties, offers and PSBTs for unit tests.

use std::cell::Cell;
use std::time::Duration;

use bitcoin::hashes::Hash;
use bitcoin::psbt::Psbt;
use bitcoin::{Address, Amount, Network, OutPoint, ScriptBuf, TxOut, Txid};
use chrono::{DateTime, Utc};
use secp256k1::Keypair;

use crate::bitcoin_utils::keys::KeyDeriver;
use crate::bitcoin_utils::psbt::{build_seller_psbt, BuyerLayout, BuyerPlan};
use crate::bitcoin_utils::sighash::SighashType;
use crate::bitcoin_utils::signer::Signer;
use crate::offer::{Offer, OfferTerms};
use crate::oracle::MemoryOracle;
use crate::types::{AssetRef, OfferId, RuneId, Utxo, RUNE_POSTAGE_SATS};

pub(crate) const INSCRIPTION_POSTAGE: u64 = 10_000;

pub(crate) struct Party {
    pub keypair: Keypair,
    pub script: ScriptBuf,
    pub address: String,
}

impl Party {
    fn derive(deriver: &KeyDeriver, account: u32) -> Self {
        let keypair = deriver.derive(account, 0).unwrap();
        let script = deriver.p2tr_script(account, 0).unwrap();
        let address = Address::from_script(&script, Network::Regtest)
            .unwrap()
            .to_string();
        Self {
            keypair,
            script,
            address,
        }
    }

    pub fn txout(&self, value: u64) -> TxOut {
        TxOut {
            value: Amount::from_sat(value),
            script_pubkey: self.script.clone(),
        }
    }

    pub fn utxo(&self, outpoint: OutPoint, value: u64) -> Utxo {
        Utxo::new(outpoint, value, self.script.clone())
    }
}

pub(crate) struct Fixture {
    pub seller: Party,
    pub buyer: Party,
    next_outpoint: Cell<u8>,
}

pub(crate) fn t0() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
}

pub(crate) fn outpoint(tag: u8, vout: u32) -> OutPoint {
    OutPoint::new(Txid::from_byte_array([tag; 32]), vout)
}

impl Fixture {
    pub fn new() -> Self {
        let deriver = KeyDeriver::from_seed(&[7u8; 32], Network::Regtest).unwrap();
        Self {
            seller: Party::derive(&deriver, 0),
            buyer: Party::derive(&deriver, 1),
            next_outpoint: Cell::new(0x10),
        }
    }

    /// A fresh outpoint, distinct from every other one this fixture hands out.
    pub fn fresh_outpoint(&self) -> OutPoint {
        let tag = self.next_outpoint.get();
        self.next_outpoint.set(tag + 1);
        outpoint(tag, 0)
    }

    fn offer(&self, asset_ref: AssetRef, value: u64, price_sats: u64) -> Offer {
        let terms = OfferTerms {
            asset_utxo: self.seller.utxo(asset_ref.outpoint(), value),
            asset_ref,
            price_sats,
            seller_address: self.seller.address.clone(),
            seller_script: self.seller.script.clone(),
        };
        Offer::new(
            OfferId::from("offer-1"),
            terms,
            t0(),
            Duration::from_secs(86_400),
        )
        .unwrap()
    }

    pub fn inscription_offer(&self, price_sats: u64) -> Offer {
        let asset = AssetRef::Inscription {
            outpoint: outpoint(0xa1, 0),
        };
        self.offer(asset, INSCRIPTION_POSTAGE, price_sats)
    }

    pub fn rune_offer(&self, price_sats: u64, amount: u128) -> Offer {
        let asset = AssetRef::Rune {
            rune_id: RuneId::new(840_000, 3),
            amount,
            outpoint: outpoint(0xb2, 1),
        };
        self.offer(asset, RUNE_POSTAGE_SATS, price_sats)
    }

    /// Seller template signed with `mode` and zero aux randomness.
    pub fn sign_seller(&self, offer: &Offer, mode: SighashType) -> Psbt {
        let mut psbt = build_seller_psbt(offer).unwrap();
        Signer::new()
            .sign_psbt_input(&mut psbt, 0, &self.seller.keypair, mode, &[0u8; 32])
            .unwrap();
        psbt
    }

    /// Buyer funding plan. Every padding and candidate UTXO is registered as
    /// asset-free in `oracle`.
    pub fn buyer_plan(
        &self,
        oracle: &MemoryOracle,
        padding: &[u64],
        candidates: &[u64],
        fee_rate: u64,
    ) -> BuyerPlan {
        let register = |value: u64| {
            let op = self.fresh_outpoint();
            oracle.insert_pure(op);
            self.buyer.utxo(op, value)
        };
        let padding = padding.iter().map(|v| register(*v)).next();
        let candidates = candidates.iter().map(|v| register(*v)).collect();
        BuyerPlan {
            receive_script: self.buyer.script.clone(),
            change_script: self.buyer.script.clone(),
            padding,
            candidates,
            fee_rate,
        }
    }

    pub fn sign_buyer(&self, psbt: &mut Psbt, layout: &BuyerLayout) {
        let signer = Signer::new();
        for &index in &layout.buyer_inputs {
            signer
                .sign_psbt_input(psbt, index, &self.buyer.keypair, SighashType::All, &[0u8; 32])
                .unwrap();
        }
    }
}
