//! UTXO protection filter
//!
//! Every spend decision re-queries the oracle: asset placement changes from
//! block to block, so classifications are never cached across decisions.

use std::collections::BTreeMap;
use std::fmt;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::oracle::AssetOracle;
use crate::types::Utxo;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ProtectionReason {
    Inscriptions(Vec<String>),
    Runes(BTreeMap<String, u128>),
    /// The oracle could not vouch for the output.
    Unknown(String),
}

impl fmt::Display for ProtectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtectionReason::Inscriptions(ids) => {
                write!(f, "{} inscription(s): {}", ids.len(), ids.join(", "))
            }
            ProtectionReason::Runes(balances) => {
                let list: Vec<_> = balances.iter().map(|(id, a)| format!("{id}={a}")).collect();
                write!(f, "rune balance(s): {}", list.join(", "))
            }
            ProtectionReason::Unknown(detail) => write!(f, "unverified ({detail})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Pure,
    Protected(ProtectionReason),
}

impl Classification {
    pub fn is_pure(&self) -> bool {
        matches!(self, Classification::Pure)
    }
}

/// Outcome of coin selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub utxos: Vec<Utxo>,
    pub total: u64,
    pub change: u64,
}

/// Classify one output. Oracle failures fail closed.
pub fn classify(oracle: &dyn AssetOracle, utxo: &Utxo) -> Classification {
    let assets = match oracle.output(&utxo.outpoint) {
        Ok(assets) => assets,
        Err(e) => {
            warn!(outpoint = %utxo.outpoint, "oracle unavailable, treating utxo as protected: {e}");
            return Classification::Protected(ProtectionReason::Unknown(e.to_string()));
        }
    };

    if assets.spent {
        return Classification::Protected(ProtectionReason::Unknown("already spent".into()));
    }
    if !assets.inscriptions.is_empty() {
        return Classification::Protected(ProtectionReason::Inscriptions(assets.inscriptions));
    }
    let runes: BTreeMap<_, _> = assets.runes.into_iter().filter(|(_, a)| *a > 0).collect();
    if !runes.is_empty() {
        return Classification::Protected(ProtectionReason::Runes(runes));
    }
    Classification::Pure
}

/// Classify a candidate set concurrently, preserving order.
pub fn classify_all(oracle: &dyn AssetOracle, candidates: &[Utxo]) -> Vec<(Utxo, Classification)> {
    candidates
        .par_iter()
        .map(|u| (u.clone(), classify(oracle, u)))
        .collect()
}

/// Smallest-first selection over already-classified candidates.
pub fn select_classified(classified: &[(Utxo, Classification)], target_sats: u64) -> Result<Selection> {
    let mut pure: Vec<&Utxo> = classified
        .iter()
        .filter(|(_, c)| c.is_pure())
        .map(|(u, _)| u)
        .collect();
    pure.sort_by_key(|u| u.value_sats);

    let mut selection = Selection {
        utxos: Vec::new(),
        total: 0,
        change: 0,
    };
    for utxo in pure {
        if selection.total >= target_sats {
            break;
        }
        selection.total = selection.total.saturating_add(utxo.value_sats);
        selection.utxos.push(utxo.clone());
    }

    if selection.total < target_sats {
        return Err(Error::InsufficientPureFunds {
            needed: target_sats,
            available: selection.total,
        });
    }
    selection.change = selection.total - target_sats;
    debug!(
        inputs = selection.utxos.len(),
        total = selection.total,
        change = selection.change,
        "selected pure utxos"
    );
    Ok(selection)
}

/// Classify `candidates` and pick pure ones until `target_sats` is covered.
pub fn select_pure(oracle: &dyn AssetOracle, candidates: &[Utxo], target_sats: u64) -> Result<Selection> {
    select_classified(&classify_all(oracle, candidates), target_sats)
}

/// Reject the first caller-chosen input that carries (or may carry) assets.
pub fn ensure_pure(oracle: &dyn AssetOracle, utxos: &[Utxo]) -> Result<()> {
    for (utxo, class) in classify_all(oracle, utxos) {
        if let Classification::Protected(reason) = class {
            return Err(Error::ProtectedUtxoSelected {
                outpoint: utxo.outpoint,
                reason,
            });
        }
    }
    Ok(())
}
