//! Runestone: the rune-transfer message carried in an `OP_RETURN OP_13` output.
//!
//! The payload is a flat sequence of LEB128 integers: optional tag/value
//! fields, then the `Body` tag followed by edicts of four integers each
//! (rune-block delta, rune-tx delta, amount, output index).

pub mod varint;

use bitcoin::opcodes::all::{OP_PUSHNUM_13, OP_RETURN};
use bitcoin::script::{Builder, Instruction, PushBytesBuf};
use bitcoin::{Script, ScriptBuf, Transaction};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::{Error, Result};
use crate::types::RuneId;

/// Largest single data push accepted by standardness rules.
const MAX_PUSH: usize = 520;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tag {
    Body,
    Divisibility,
    Flags,
    Spacers,
    Rune,
    Symbol,
    Premine,
    Cap,
    Amount,
    HeightStart,
    HeightEnd,
    OffsetStart,
    OffsetEnd,
    Mint,
    Pointer,
    Cenotaph,
    Nop,
    /// Unrecognised odd tag; odd tags may be ignored by readers.
    Unknown(u128),
}

impl Tag {
    pub fn to_u128(self) -> u128 {
        match self {
            Tag::Body => 0,
            Tag::Divisibility => 1,
            Tag::Flags => 2,
            Tag::Spacers => 3,
            Tag::Rune => 4,
            Tag::Symbol => 5,
            Tag::Premine => 6,
            Tag::Cap => 8,
            Tag::Amount => 10,
            Tag::HeightStart => 12,
            Tag::HeightEnd => 14,
            Tag::OffsetStart => 16,
            Tag::OffsetEnd => 18,
            Tag::Mint => 20,
            Tag::Pointer => 22,
            Tag::Cenotaph => 126,
            Tag::Nop => 127,
            Tag::Unknown(n) => n,
        }
    }

    /// Unknown even tags are rejected: readers may not skip them.
    pub fn from_u128(n: u128) -> Result<Self> {
        Ok(match n {
            0 => Tag::Body,
            1 => Tag::Divisibility,
            2 => Tag::Flags,
            3 => Tag::Spacers,
            4 => Tag::Rune,
            5 => Tag::Symbol,
            6 => Tag::Premine,
            8 => Tag::Cap,
            10 => Tag::Amount,
            12 => Tag::HeightStart,
            14 => Tag::HeightEnd,
            16 => Tag::OffsetStart,
            18 => Tag::OffsetEnd,
            20 => Tag::Mint,
            22 => Tag::Pointer,
            126 => Tag::Cenotaph,
            127 => Tag::Nop,
            n if n % 2 == 1 => Tag::Unknown(n),
            n => {
                return Err(Error::MalformedRunestone(format!(
                    "unrecognised even tag {n}"
                )))
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edict {
    pub rune_block: u64,
    pub rune_tx: u32,
    pub amount: u128,
    pub output_index: u32,
}

impl Edict {
    pub fn new(rune_id: RuneId, amount: u128, output_index: u32) -> Self {
        Self {
            rune_block: rune_id.block,
            rune_tx: rune_id.tx,
            amount,
            output_index,
        }
    }

    pub fn rune_id(&self) -> RuneId {
        RuneId::new(self.rune_block, self.rune_tx)
    }
}

/// A decoded runestone.
///
/// Canonical messages list their edicts in ascending rune-id order and keep
/// `Body` out of `fields`; encoding then decoding a canonical message yields
/// the same message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunestoneMessage {
    pub fields: Vec<(Tag, u128)>,
    pub edicts: Vec<Edict>,
}

impl RunestoneMessage {
    /// A message moving `amount` of one rune to `output_index`. Any balance
    /// left on the inputs goes to the first non-`OP_RETURN` output.
    pub fn transfer(rune_id: RuneId, amount: u128, output_index: u32) -> Self {
        Self {
            fields: Vec::new(),
            edicts: vec![Edict::new(rune_id, amount, output_index)],
        }
    }
}

/// Serialize a message into its LEB128 payload.
///
/// Edicts are written in ascending rune-id order whatever order the message
/// holds them in, so only canonical messages decode back unchanged. Field
/// tags must survive `Tag::from_u128`: `Body`, unknown even tags and
/// `Unknown` values that alias a known tag are refused.
pub fn encode(message: &RunestoneMessage) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    for (tag, value) in &message.fields {
        let n = tag.to_u128();
        if *tag == Tag::Body || Tag::from_u128(n)? != *tag {
            return Err(Error::MalformedRunestone(format!(
                "field tag {tag:?} cannot be encoded"
            )));
        }
        varint::encode_to_vec(n, &mut payload);
        varint::encode_to_vec(*value, &mut payload);
    }
    varint::encode_to_vec(Tag::Body.to_u128(), &mut payload);

    let mut edicts = message.edicts.clone();
    edicts.sort_by_key(Edict::rune_id);

    let mut previous = RuneId::default();
    for edict in &edicts {
        let id = edict.rune_id();
        let block_delta = id.block - previous.block;
        let tx_delta = if block_delta == 0 {
            id.tx - previous.tx
        } else {
            id.tx
        };
        varint::encode_to_vec(block_delta.into(), &mut payload);
        varint::encode_to_vec(tx_delta.into(), &mut payload);
        varint::encode_to_vec(edict.amount, &mut payload);
        varint::encode_to_vec(edict.output_index.into(), &mut payload);
        previous = id;
    }
    Ok(payload)
}

/// Parse a LEB128 payload back into a message.
pub fn decode(payload: &[u8]) -> Result<RunestoneMessage> {
    let integers = varint::decode_all(payload)?;
    if integers.is_empty() {
        return Err(Error::MalformedRunestone("empty payload".into()));
    }

    let mut message = RunestoneMessage::default();
    let mut i = 0;
    while i < integers.len() {
        let tag = Tag::from_u128(integers[i])?;
        i += 1;
        if tag == Tag::Body {
            message.edicts = decode_edicts(&integers[i..])?;
            return Ok(message);
        }
        let value = integers
            .get(i)
            .ok_or_else(|| Error::MalformedRunestone(format!("tag {tag:?} without value")))?;
        message.fields.push((tag, *value));
        i += 1;
    }
    Ok(message)
}

fn decode_edicts(integers: &[u128]) -> Result<Vec<Edict>> {
    if integers.len() % 4 != 0 {
        return Err(Error::MalformedRunestone(format!(
            "{} edict integers is not a multiple of 4",
            integers.len()
        )));
    }
    let narrow = |what: &str| Error::MalformedRunestone(format!("edict {what} out of range"));

    let mut previous = RuneId::default();
    let mut edicts = Vec::with_capacity(integers.len() / 4);
    for chunk in integers.chunks_exact(4) {
        let block_delta = u64::try_from(chunk[0]).map_err(|_| narrow("block"))?;
        let tx_delta = u32::try_from(chunk[1]).map_err(|_| narrow("tx"))?;
        let block = previous
            .block
            .checked_add(block_delta)
            .ok_or_else(|| narrow("block"))?;
        let tx = if block_delta == 0 {
            previous.tx.checked_add(tx_delta).ok_or_else(|| narrow("tx"))?
        } else {
            tx_delta
        };
        let id = RuneId::new(block, tx);
        edicts.push(Edict::new(
            id,
            chunk[2],
            u32::try_from(chunk[3]).map_err(|_| narrow("output"))?,
        ));
        previous = id;
    }
    Ok(edicts)
}

/// Build the `OP_RETURN OP_13 <payload>` output script.
pub fn encipher(message: &RunestoneMessage) -> Result<ScriptBuf> {
    let payload = encode(message)?;
    let mut builder = Builder::new()
        .push_opcode(OP_RETURN)
        .push_opcode(OP_PUSHNUM_13);
    for chunk in payload.chunks(MAX_PUSH) {
        let push = PushBytesBuf::try_from(chunk.to_vec())
            .map_err(|e| Error::MalformedRunestone(format!("payload push: {e}")))?;
        builder = builder.push_slice(push);
    }
    Ok(builder.into_script())
}

/// Whether a script is shaped like a runestone (`OP_RETURN OP_13 ...`).
pub fn is_runestone(script: &Script) -> bool {
    let b = script.as_bytes();
    b.len() >= 2 && b[0] == OP_RETURN.to_u8() && b[1] == OP_PUSHNUM_13.to_u8()
}

/// Parse a runestone output script.
pub fn decipher(script: &Script) -> Result<RunestoneMessage> {
    let mut instructions = script.instructions();
    match instructions.next() {
        Some(Ok(Instruction::Op(op))) if op == OP_RETURN => {}
        _ => return Err(Error::MalformedRunestone("missing OP_RETURN".into())),
    }
    match instructions.next() {
        Some(Ok(Instruction::Op(op))) if op == OP_PUSHNUM_13 => {}
        _ => return Err(Error::MalformedRunestone("missing OP_13 magic".into())),
    }

    let mut payload = Vec::new();
    for instruction in instructions {
        match instruction {
            Ok(Instruction::PushBytes(push)) => payload.extend_from_slice(push.as_bytes()),
            Ok(Instruction::Op(op)) => {
                return Err(Error::MalformedRunestone(format!(
                    "non-push opcode {op} in payload"
                )))
            }
            Err(e) => return Err(Error::MalformedRunestone(format!("script: {e}"))),
        }
    }
    decode(&payload).inspect_err(|e| {
        error!(script = %hex::encode(script.as_bytes()), "runestone decode failed: {e}");
    })
}

/// The first runestone output of a transaction, with its index.
pub fn find_in_tx(tx: &Transaction) -> Option<Result<(usize, RunestoneMessage)>> {
    let (vout, out) = tx
        .output
        .iter()
        .enumerate()
        .find(|(_, out)| is_runestone(&out.script_pubkey))?;
    Some(decipher(&out.script_pubkey).map(|m| (vout, m)))
}
