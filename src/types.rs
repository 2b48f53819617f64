//! Shared data structures and types

use std::fmt;
use std::str::FromStr;

use bitcoin::{Amount, OutPoint, ScriptBuf, TxOut};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ── Constants ────────────────────────────────────────────────────────────────

/// Smallest output any relay policy accepts regardless of script type.
pub const DUST_LIMIT_SATS: u64 = 546;

/// Value attached to the output that receives a rune transfer.
pub const RUNE_POSTAGE_SATS: u64 = 546;

// Virtual sizes used for fee estimation (P2TR key-path spends, rounded up).
// Outputs are sized from their script, see `output_vbytes`.
pub const TX_OVERHEAD_VBYTES: u64 = 11;
pub const P2TR_INPUT_VBYTES: u64 = 58;

// ── Identifiers ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OfferId(pub String);

impl OfferId {
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        OfferId(hex::encode(bytes))
    }
}

impl fmt::Display for OfferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OfferId {
    fn from(s: &str) -> Self {
        OfferId(s.to_string())
    }
}

/// Rune identifier: the block height and transaction index of its etching.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct RuneId {
    pub block: u64,
    pub tx: u32,
}

impl RuneId {
    pub fn new(block: u64, tx: u32) -> Self {
        Self { block, tx }
    }
}

impl fmt::Display for RuneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block, self.tx)
    }
}

impl FromStr for RuneId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (block, tx) = s
            .split_once(':')
            .ok_or_else(|| Error::MalformedRunestone(format!("bad rune id `{s}` (block:tx)")))?;
        Ok(RuneId {
            block: block
                .parse()
                .map_err(|_| Error::MalformedRunestone(format!("bad rune block `{block}`")))?,
            tx: tx
                .parse()
                .map_err(|_| Error::MalformedRunestone(format!("bad rune tx `{tx}`")))?,
        })
    }
}

// ── Assets ───────────────────────────────────────────────────────────────────

/// What an offer sells. Payloads that match neither shape are rejected at
/// deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum AssetRef {
    Inscription {
        outpoint: OutPoint,
    },
    Rune {
        rune_id: RuneId,
        amount: u128,
        /// Seller UTXO holding the rune balance.
        outpoint: OutPoint,
    },
}

impl AssetRef {
    /// The seller UTXO this asset lives on.
    pub fn outpoint(&self) -> OutPoint {
        match self {
            AssetRef::Inscription { outpoint } => *outpoint,
            AssetRef::Rune { outpoint, .. } => *outpoint,
        }
    }
}

// ── UTXO Types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub value_sats: u64,
    pub script_pubkey: ScriptBuf, // Prevout script for witness_utxo
}

impl Utxo {
    pub fn new(outpoint: OutPoint, value_sats: u64, script_pubkey: ScriptBuf) -> Self {
        Self {
            outpoint,
            value_sats,
            script_pubkey,
        }
    }

    pub fn txout(&self) -> TxOut {
        TxOut {
            value: Amount::from_sat(self.value_sats),
            script_pubkey: self.script_pubkey.clone(),
        }
    }
}

/// Parse `txid:vout:value_sat` entries separated by commas.
pub fn parse_utxos(csv: &str, script_pubkey: &ScriptBuf) -> Result<Vec<Utxo>> {
    let mut v = vec![];
    for (i, s) in csv.split(',').enumerate() {
        let p: Vec<_> = s.trim().split(':').collect();
        if p.len() != 3 {
            return Err(Error::Config(format!(
                "bad utxo[{i}] `{s}` (txid:vout:value_sat)"
            )));
        }
        let bad = |what: &str| Error::Config(format!("bad {what} in utxo[{i}] `{s}`"));
        v.push(Utxo {
            outpoint: OutPoint {
                txid: p[0].parse().map_err(|_| bad("txid"))?,
                vout: p[1].parse().map_err(|_| bad("vout"))?,
            },
            value_sats: p[2].parse().map_err(|_| bad("value"))?,
            script_pubkey: script_pubkey.clone(),
        });
    }
    Ok(v)
}
