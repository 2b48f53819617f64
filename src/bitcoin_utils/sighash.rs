//! BIP341 key-path signature hash, computed from scratch.
//!
//! The digest is assembled field by field so that every output script,
//! including bare `OP_RETURN` payloads, is committed exactly as serialized on
//! the wire. Field order (BIP341 `SigMsg`):
//!
//! ```text
//! epoch(0x00) | hash_type | nVersion | nLockTime
//! [sha_prevouts | sha_amounts | sha_scriptpubkeys | sha_sequences]   unless ANYONECANPAY
//! [sha_outputs]                                                      DEFAULT / ALL only
//! spend_type(0x00)
//! outpoint | amount | scriptPubKey | nSequence                       if ANYONECANPAY
//! input_index                                                        otherwise
//! [sha_single_output]                                                SINGLE only
//! ```

use std::fmt;

use bitcoin::hashes::Hash;
use bitcoin::sighash::TapSighashType;
use bitcoin::{OutPoint, Script, Transaction, TxOut};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::tagged::{sha256, tap_sighash, write_compact_size};
use crate::error::{Error, Result};

/// Taproot hash type. `0x80` on its own (DEFAULT|ANYONECANPAY) is not a valid
/// combination and is rejected by [`SighashType::from_byte`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SighashType {
    Default,
    All,
    None,
    Single,
    AllPlusAnyoneCanPay,
    NonePlusAnyoneCanPay,
    SinglePlusAnyoneCanPay,
}

/// Which outputs a hash type commits to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputCommitment {
    All,
    None,
    Single,
}

impl SighashType {
    pub const ALL_TYPES: [SighashType; 7] = [
        SighashType::Default,
        SighashType::All,
        SighashType::None,
        SighashType::Single,
        SighashType::AllPlusAnyoneCanPay,
        SighashType::NonePlusAnyoneCanPay,
        SighashType::SinglePlusAnyoneCanPay,
    ];

    pub fn from_byte(b: u8) -> Result<Self> {
        Ok(match b {
            0x00 => SighashType::Default,
            0x01 => SighashType::All,
            0x02 => SighashType::None,
            0x03 => SighashType::Single,
            0x81 => SighashType::AllPlusAnyoneCanPay,
            0x82 => SighashType::NonePlusAnyoneCanPay,
            0x83 => SighashType::SinglePlusAnyoneCanPay,
            other => return Err(Error::InvalidSighashType(other)),
        })
    }

    pub fn to_byte(self) -> u8 {
        match self {
            SighashType::Default => 0x00,
            SighashType::All => 0x01,
            SighashType::None => 0x02,
            SighashType::Single => 0x03,
            SighashType::AllPlusAnyoneCanPay => 0x81,
            SighashType::NonePlusAnyoneCanPay => 0x82,
            SighashType::SinglePlusAnyoneCanPay => 0x83,
        }
    }

    pub fn anyone_can_pay(self) -> bool {
        self.to_byte() & 0x80 != 0
    }

    pub fn outputs(self) -> OutputCommitment {
        match self.to_byte() & 0x03 {
            0x02 => OutputCommitment::None,
            0x03 => OutputCommitment::Single,
            _ => OutputCommitment::All,
        }
    }
}

impl fmt::Display for SighashType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SighashType::Default => "SIGHASH_DEFAULT",
            SighashType::All => "SIGHASH_ALL",
            SighashType::None => "SIGHASH_NONE",
            SighashType::Single => "SIGHASH_SINGLE",
            SighashType::AllPlusAnyoneCanPay => "SIGHASH_ALL|ANYONECANPAY",
            SighashType::NonePlusAnyoneCanPay => "SIGHASH_NONE|ANYONECANPAY",
            SighashType::SinglePlusAnyoneCanPay => "SIGHASH_SINGLE|ANYONECANPAY",
        };
        f.write_str(s)
    }
}

impl From<SighashType> for TapSighashType {
    fn from(t: SighashType) -> Self {
        match t {
            SighashType::Default => TapSighashType::Default,
            SighashType::All => TapSighashType::All,
            SighashType::None => TapSighashType::None,
            SighashType::Single => TapSighashType::Single,
            SighashType::AllPlusAnyoneCanPay => TapSighashType::AllPlusAnyoneCanPay,
            SighashType::NonePlusAnyoneCanPay => TapSighashType::NonePlusAnyoneCanPay,
            SighashType::SinglePlusAnyoneCanPay => TapSighashType::SinglePlusAnyoneCanPay,
        }
    }
}

impl From<TapSighashType> for SighashType {
    fn from(t: TapSighashType) -> Self {
        match t {
            TapSighashType::Default => SighashType::Default,
            TapSighashType::All => SighashType::All,
            TapSighashType::None => SighashType::None,
            TapSighashType::Single => SighashType::Single,
            TapSighashType::AllPlusAnyoneCanPay => SighashType::AllPlusAnyoneCanPay,
            TapSighashType::NonePlusAnyoneCanPay => SighashType::NonePlusAnyoneCanPay,
            TapSighashType::SinglePlusAnyoneCanPay => SighashType::SinglePlusAnyoneCanPay,
        }
    }
}

/// Everything needed to hash one input, built fresh for every signature.
#[derive(Debug, Clone)]
pub struct SighashContext {
    /// Prevout of every input, in input order. `None` where unknown.
    pub prevouts: Vec<Option<TxOut>>,
    pub sighash_type: SighashType,
    pub input_index: usize,
}

impl SighashContext {
    pub fn new(prevouts: Vec<Option<TxOut>>, sighash_type: SighashType, input_index: usize) -> Self {
        Self {
            prevouts,
            sighash_type,
            input_index,
        }
    }

    pub fn sighash(&self, tx: &Transaction) -> Result<[u8; 32]> {
        compute_sighash(tx, self.input_index, &self.prevouts, self.sighash_type)
    }
}

/// `TaggedHash("TapSighash", SigMsg)` for a key-path spend without annex.
pub fn compute_sighash(
    tx: &Transaction,
    input_index: usize,
    prevouts: &[Option<TxOut>],
    sighash_type: SighashType,
) -> Result<[u8; 32]> {
    let msg = sig_msg(tx, input_index, prevouts, sighash_type)?;
    Ok(tap_sighash(&msg))
}

/// The raw BIP341 `SigMsg` (epoch byte included).
pub fn sig_msg(
    tx: &Transaction,
    input_index: usize,
    prevouts: &[Option<TxOut>],
    sighash_type: SighashType,
) -> Result<Vec<u8>> {
    let inputs = tx.input.len();
    if input_index >= inputs {
        return Err(Error::InputIndexOutOfRange {
            index: input_index,
            inputs,
        });
    }
    let anyone_can_pay = sighash_type.anyone_can_pay();

    let mut m = Vec::with_capacity(1 + 174 + 32);
    m.push(0x00); // epoch
    m.push(sighash_type.to_byte());
    m.extend_from_slice(&tx.version.0.to_le_bytes());
    m.extend_from_slice(&tx.lock_time.to_consensus_u32().to_le_bytes());

    if !anyone_can_pay {
        let spent = all_prevouts(prevouts, inputs)?;

        let mut outpoints = Vec::with_capacity(36 * inputs);
        let mut amounts = Vec::with_capacity(8 * inputs);
        let mut scripts = Vec::new();
        let mut sequences = Vec::with_capacity(4 * inputs);
        for (txin, prevout) in tx.input.iter().zip(&spent) {
            write_outpoint(&mut outpoints, &txin.previous_output);
            amounts.extend_from_slice(&prevout.value.to_sat().to_le_bytes());
            write_script(&mut scripts, &prevout.script_pubkey);
            sequences.extend_from_slice(&txin.sequence.0.to_le_bytes());
        }
        m.extend_from_slice(&sha256(&outpoints));
        m.extend_from_slice(&sha256(&amounts));
        m.extend_from_slice(&sha256(&scripts));
        m.extend_from_slice(&sha256(&sequences));
    }

    if sighash_type.outputs() == OutputCommitment::All {
        let mut outputs = Vec::new();
        for out in &tx.output {
            write_txout(&mut outputs, out);
        }
        m.extend_from_slice(&sha256(&outputs));
    }

    m.push(0x00); // spend_type: key path, no annex

    if anyone_can_pay {
        let txin = &tx.input[input_index];
        let prevout = prevouts
            .get(input_index)
            .and_then(Option::as_ref)
            .ok_or(Error::MissingPrevoutData { input: input_index })?;
        write_outpoint(&mut m, &txin.previous_output);
        m.extend_from_slice(&prevout.value.to_sat().to_le_bytes());
        write_script(&mut m, &prevout.script_pubkey);
        m.extend_from_slice(&txin.sequence.0.to_le_bytes());
    } else {
        m.extend_from_slice(&(input_index as u32).to_le_bytes());
    }

    if sighash_type.outputs() == OutputCommitment::Single {
        match tx.output.get(input_index) {
            Some(out) => {
                let mut single = Vec::new();
                write_txout(&mut single, out);
                m.extend_from_slice(&sha256(&single));
            }
            None => {
                debug!(
                    input_index,
                    outputs = tx.output.len(),
                    "SIGHASH_SINGLE without corresponding output, committing zero digest"
                );
                m.extend_from_slice(&[0u8; 32]);
            }
        }
    }

    Ok(m)
}

fn all_prevouts(prevouts: &[Option<TxOut>], inputs: usize) -> Result<Vec<&TxOut>> {
    (0..inputs)
        .map(|i| {
            prevouts
                .get(i)
                .and_then(Option::as_ref)
                .ok_or(Error::MissingPrevoutData { input: i })
        })
        .collect()
}

fn write_outpoint(out: &mut Vec<u8>, outpoint: &OutPoint) {
    out.extend_from_slice(outpoint.txid.as_byte_array());
    out.extend_from_slice(&outpoint.vout.to_le_bytes());
}

fn write_script(out: &mut Vec<u8>, script: &Script) {
    write_compact_size(out, script.len() as u64);
    out.extend_from_slice(script.as_bytes());
}

fn write_txout(out: &mut Vec<u8>, txout: &TxOut) {
    out.extend_from_slice(&txout.value.to_sat().to_le_bytes());
    write_script(out, &txout.script_pubkey);
}
