//! PSBT templates for asset sales
//!
//! The seller template spends the asset UTXO alone and declares one payment
//! output. The buyer completes it around the seller's signed pair:
//!
//! - Inscription: inputs `[padding, seller, funding...]`, outputs
//!   `[buyer receive, seller payment, change?]`. The seller pair shares index
//!   1, which is what SIGHASH_SINGLE|ANYONECANPAY binds together.
//! - Rune: inputs `[seller, funding...]`, outputs `[seller payment, runestone,
//!   buyer receive, change?]`. Leftover rune balance follows implicit change
//!   to output 0, the seller's payment output.

use std::collections::HashSet;

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use bitcoin::{
    psbt::{self, Psbt},
    Amount, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};
use tracing::{debug, error};

use super::sighash::SighashType;
use super::signer::{input_signature, verify_psbt_input};
use crate::error::{Error, Result};
use crate::filter::{classify_all, ensure_pure, select_classified};
use crate::offer::{required_sighash, Offer};
use crate::oracle::AssetOracle;
use crate::runestone::{self, RunestoneMessage};
use crate::types::{
    AssetRef, RuneId, Utxo, DUST_LIMIT_SATS, P2TR_INPUT_VBYTES, RUNE_POSTAGE_SATS,
    TX_OVERHEAD_VBYTES,
};

// ── Fee estimation ───────────────────────────────────────────────────────────

fn compact_size_len(n: u64) -> u64 {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

pub fn output_vbytes(out: &TxOut) -> u64 {
    let len = out.script_pubkey.len() as u64;
    8 + compact_size_len(len) + len
}

/// Virtual size of a transaction spending `inputs` P2TR key-path inputs.
pub fn estimate_vsize(inputs: usize, outputs: &[TxOut]) -> u64 {
    TX_OVERHEAD_VBYTES
        + inputs as u64 * P2TR_INPUT_VBYTES
        + outputs.iter().map(output_vbytes).sum::<u64>()
}

fn unsigned_txin(utxo: &Utxo) -> TxIn {
    TxIn {
        previous_output: utxo.outpoint,
        script_sig: ScriptBuf::new(),
        sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
        witness: Witness::default(),
    }
}

fn input_map(utxo: &Utxo) -> psbt::Input {
    psbt::Input {
        witness_utxo: Some(utxo.txout()),
        ..Default::default()
    }
}

// ── Seller ───────────────────────────────────────────────────────────────────

/// One input (the asset UTXO), one output (the asking price to the seller).
pub fn build_seller_psbt(offer: &Offer) -> Result<Psbt> {
    let tx = Transaction {
        version: bitcoin::transaction::Version::TWO,
        lock_time: bitcoin::absolute::LockTime::ZERO,
        input: vec![unsigned_txin(&offer.asset_utxo)],
        output: vec![TxOut {
            value: Amount::from_sat(offer.price_sats),
            script_pubkey: offer.seller_script.clone(),
        }],
    };
    let mut psbt = Psbt::from_unsigned_tx(tx)?;
    psbt.inputs[0] = input_map(&offer.asset_utxo);
    Ok(psbt)
}

/// Check a signed seller template against the offer it claims to fund.
pub fn validate_seller_psbt(offer: &Offer, psbt: &Psbt) -> Result<()> {
    let tx = &psbt.unsigned_tx;
    if tx.input.len() != 1 || tx.output.len() != 1 {
        return Err(Error::Psbt(format!(
            "seller psbt must have one input and one output, found {}/{}",
            tx.input.len(),
            tx.output.len()
        )));
    }
    if tx.input[0].previous_output != offer.asset_ref.outpoint() {
        return Err(Error::Psbt(format!(
            "seller input spends {} instead of the offered {}",
            tx.input[0].previous_output,
            offer.asset_ref.outpoint()
        )));
    }
    if psbt.inputs[0].witness_utxo.as_ref() != Some(&offer.asset_utxo.txout()) {
        return Err(Error::Psbt("seller input prevout does not match the asset utxo".into()));
    }
    let out = &tx.output[0];
    if out.script_pubkey != offer.seller_script || out.value.to_sat() != offer.price_sats {
        return Err(Error::SellerPaymentMissing {
            price_sats: offer.price_sats,
        });
    }

    let sig = input_signature(psbt, 0).ok_or(Error::InvalidSignature { input: 0 })?;
    let found = SighashType::from(sig.sighash_type);
    let expected = required_sighash(&offer.asset_ref);
    if found != expected {
        return Err(Error::InvalidSighashMode {
            expected: expected.to_string(),
            found: found.to_string(),
        });
    }
    verify_psbt_input(psbt, 0)?;
    Ok(())
}

// ── Buyer ────────────────────────────────────────────────────────────────────

/// What the buyer brings to a purchase.
#[derive(Debug, Clone)]
pub struct BuyerPlan {
    /// Receives the inscription or rune balance.
    pub receive_script: ScriptBuf,
    pub change_script: ScriptBuf,
    /// Leading input for inscription purchases; ignored for runes.
    pub padding: Option<Utxo>,
    /// Funding candidates; only pure ones are spent.
    pub candidates: Vec<Utxo>,
    /// sat/vB
    pub fee_rate: u64,
}

/// Where everything landed in a completed purchase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuyerLayout {
    pub seller_input: usize,
    pub seller_output: usize,
    pub receive_output: usize,
    pub runestone_output: Option<usize>,
    pub change_output: Option<usize>,
    /// Inputs the buyer has to sign.
    pub buyer_inputs: Vec<usize>,
    pub fee_sats: u64,
}

#[derive(Debug, Clone)]
pub struct BuyerPsbt {
    pub psbt: Psbt,
    pub layout: BuyerLayout,
}

/// Complete the offer's signed seller template with the buyer's inputs and
/// outputs. The seller's input map, signature and output are copied verbatim.
pub fn build_buyer_psbt(
    oracle: &dyn AssetOracle,
    offer: &Offer,
    plan: &BuyerPlan,
) -> Result<BuyerPsbt> {
    let seller = offer
        .seller_psbt
        .as_ref()
        .ok_or_else(|| Error::Psbt("offer has no signed seller psbt".into()))?;
    if seller.unsigned_tx.input.len() != 1 || seller.unsigned_tx.output.len() != 1 {
        return Err(Error::Psbt("seller psbt is not a one-in one-out template".into()));
    }
    let seller_txin = seller.unsigned_tx.input[0].clone();
    let seller_out = seller.unsigned_tx.output[0].clone();

    let mut inputs: Vec<TxIn> = Vec::new();
    let mut input_maps: Vec<psbt::Input> = Vec::new();
    let mut outputs: Vec<TxOut> = Vec::new();
    let mut output_maps: Vec<psbt::Output> = Vec::new();
    let mut buyer_inputs = Vec::new();
    let mut value_in = offer.asset_utxo.value_sats;
    let mut excluded = vec![offer.asset_utxo.outpoint];

    let (seller_input, seller_output, receive_output, runestone_output) = match &offer.asset_ref {
        AssetRef::Inscription { .. } => {
            let padding = plan.padding.as_ref().ok_or_else(|| {
                Error::Psbt("inscription purchase needs a padding utxo".into())
            })?;
            ensure_pure(oracle, std::slice::from_ref(padding))?;
            excluded.push(padding.outpoint);
            value_in += padding.value_sats;

            inputs.extend([unsigned_txin(padding), seller_txin]);
            input_maps.extend([input_map(padding), seller.inputs[0].clone()]);
            buyer_inputs.push(0);

            // Padding sats come first, so the inscribed sat lands past them
            // but inside this output.
            outputs.extend([
                TxOut {
                    value: Amount::from_sat(padding.value_sats + offer.asset_utxo.value_sats),
                    script_pubkey: plan.receive_script.clone(),
                },
                seller_out,
            ]);
            output_maps.extend([psbt::Output::default(), seller.outputs[0].clone()]);
            (1, 1, 0, None)
        }
        AssetRef::Rune {
            rune_id, amount, ..
        } => {
            let message = RunestoneMessage::transfer(*rune_id, *amount, 2);
            ensure_single_transfer_edict(&message)?;

            inputs.push(seller_txin);
            input_maps.push(seller.inputs[0].clone());
            outputs.extend([
                seller_out,
                TxOut {
                    value: Amount::ZERO,
                    script_pubkey: runestone::encipher(&message)?,
                },
                TxOut {
                    value: Amount::from_sat(RUNE_POSTAGE_SATS),
                    script_pubkey: plan.receive_script.clone(),
                },
            ]);
            output_maps.extend([
                seller.outputs[0].clone(),
                psbt::Output::default(),
                psbt::Output::default(),
            ]);
            (0, 0, 2, Some(1))
        }
    };

    // Funding must cover every output not already paid for by fixed inputs.
    let value_out: u64 = outputs.iter().map(|o| o.value.to_sat()).sum();
    let required = value_out.saturating_sub(value_in);

    let candidates: Vec<Utxo> = plan
        .candidates
        .iter()
        .filter(|u| !excluded.contains(&u.outpoint))
        .cloned()
        .collect();
    let classified = classify_all(oracle, &candidates);

    let change_template = TxOut {
        value: Amount::ZERO,
        script_pubkey: plan.change_script.clone(),
    };
    let mut with_change = outputs.clone();
    with_change.push(change_template);

    // Fee depends on how many inputs get selected; grow until stable.
    let mut funding_inputs = 1;
    let (selection, mut fee_sats) = loop {
        let fee = plan.fee_rate * estimate_vsize(inputs.len() + funding_inputs, &with_change);
        let selection = select_classified(&classified, required + fee)?;
        if selection.utxos.len() <= funding_inputs {
            break (selection, fee);
        }
        funding_inputs = selection.utxos.len();
    };

    for utxo in &selection.utxos {
        buyer_inputs.push(inputs.len());
        inputs.push(unsigned_txin(utxo));
        input_maps.push(input_map(utxo));
    }

    let mut change_output = None;
    if selection.change >= DUST_LIMIT_SATS {
        change_output = Some(outputs.len());
        outputs.push(TxOut {
            value: Amount::from_sat(selection.change),
            script_pubkey: plan.change_script.clone(),
        });
        output_maps.push(psbt::Output::default());
    } else {
        fee_sats += selection.change;
    }

    let tx = Transaction {
        version: seller.unsigned_tx.version,
        lock_time: seller.unsigned_tx.lock_time,
        input: inputs,
        output: outputs,
    };
    let mut psbt = Psbt::from_unsigned_tx(tx)?;
    psbt.inputs = input_maps;
    psbt.outputs = output_maps;
    psbt.xpub = seller.xpub.clone();
    psbt.proprietary = seller.proprietary.clone();
    psbt.unknown = seller.unknown.clone();

    let layout = BuyerLayout {
        seller_input,
        seller_output,
        receive_output,
        runestone_output,
        change_output,
        buyer_inputs,
        fee_sats,
    };
    debug!(offer = %offer.id, ?layout, "built buyer psbt");
    Ok(BuyerPsbt { psbt, layout })
}

/// Check a buyer-completed PSBT before finalizing it. Returns the index of
/// the seller's input.
pub fn validate_buyer_psbt(offer: &Offer, psbt: &Psbt) -> Result<usize> {
    let seller = offer
        .seller_psbt
        .as_ref()
        .ok_or_else(|| Error::Psbt("offer has no signed seller psbt".into()))?;
    let tx = &psbt.unsigned_tx;
    if psbt.inputs.len() != tx.input.len() {
        return Err(Error::Psbt("input map count does not match transaction".into()));
    }

    let asset = offer.asset_ref.outpoint();
    let positions: Vec<usize> = tx
        .input
        .iter()
        .enumerate()
        .filter(|(_, i)| i.previous_output == asset)
        .map(|(i, _)| i)
        .collect();
    let &[seller_index] = positions.as_slice() else {
        return Err(Error::SellerInputTampered);
    };

    let original = &seller.unsigned_tx.input[0];
    let theirs = input_signature(seller, 0);
    if tx.input[seller_index].sequence != original.sequence
        || theirs.is_none()
        || input_signature(psbt, seller_index) != theirs
        || psbt.inputs[seller_index].witness_utxo != seller.inputs[0].witness_utxo
    {
        return Err(Error::SellerInputTampered);
    }
    verify_psbt_input(psbt, seller_index).map_err(|_| Error::SellerInputTampered)?;

    let paid = tx
        .output
        .iter()
        .any(|o| o.script_pubkey == offer.seller_script && o.value.to_sat() >= offer.price_sats);
    if !paid {
        return Err(Error::SellerPaymentMissing {
            price_sats: offer.price_sats,
        });
    }

    if let AssetRef::Rune {
        rune_id, amount, ..
    } = &offer.asset_ref
    {
        validate_rune_transfer(tx, *rune_id, *amount, &offer.seller_script)?;
    }

    for index in (0..tx.input.len()).filter(|i| *i != seller_index) {
        verify_psbt_input(psbt, index)?;
    }
    Ok(seller_index)
}

fn validate_rune_transfer(
    tx: &Transaction,
    rune_id: RuneId,
    amount: u128,
    seller_script: &ScriptBuf,
) -> Result<()> {
    let (_, message) = runestone::find_in_tx(tx)
        .ok_or_else(|| Error::MalformedRunestone("rune purchase carries no runestone".into()))??;
    ensure_single_transfer_edict(&message)?;
    if message
        .fields
        .iter()
        .any(|(tag, _)| *tag == runestone::Tag::Pointer)
    {
        return Err(Error::MalformedRunestone(
            "pointer field would redirect the seller's leftover balance".into(),
        ));
    }

    let edict = message
        .edicts
        .iter()
        .find(|e| e.rune_id() == rune_id)
        .ok_or_else(|| Error::MalformedRunestone(format!("no edict moves rune {rune_id}")))?;
    if edict.amount != amount {
        return Err(Error::MalformedRunestone(format!(
            "edict moves {} of {rune_id}, offer is for {amount}",
            edict.amount
        )));
    }
    match tx.output.get(edict.output_index as usize) {
        Some(out) if !out.script_pubkey.is_op_return() => {}
        _ => {
            return Err(Error::MalformedRunestone(format!(
                "edict output {} is missing or unspendable",
                edict.output_index
            )))
        }
    }

    // Implicit change goes to the first non-OP_RETURN output.
    let change_target = tx.output.iter().find(|o| !o.script_pubkey.is_op_return());
    if change_target.map(|o| &o.script_pubkey) != Some(seller_script) {
        return Err(Error::MalformedRunestone(
            "leftover rune balance would not return to the seller".into(),
        ));
    }
    Ok(())
}

/// Reject more than one edict per rune. Leftover balance is returned by the
/// protocol's implicit change, never by a second edict.
pub fn ensure_single_transfer_edict(message: &RunestoneMessage) -> Result<()> {
    let mut seen = HashSet::new();
    for edict in &message.edicts {
        if !seen.insert(edict.rune_id()) {
            error!(rune = %edict.rune_id(), edicts = message.edicts.len(), "redundant change edict");
            return Err(Error::RedundantChangeEdict(edict.rune_id().to_string()));
        }
    }
    Ok(())
}

// ── Finalization ─────────────────────────────────────────────────────────────

/// Move every key-path signature into its final witness and return the
/// network transaction.
pub fn finalize_psbt(psbt: &mut Psbt) -> Result<Transaction> {
    let mut tx = psbt.unsigned_tx.clone();
    if psbt.inputs.len() != tx.input.len() {
        return Err(Error::Psbt("input map count does not match transaction".into()));
    }
    for (index, (input, txin)) in psbt.inputs.iter_mut().zip(tx.input.iter_mut()).enumerate() {
        let witness = match &input.final_script_witness {
            Some(w) => w.clone(),
            None => {
                let sig = input
                    .tap_key_sig
                    .as_ref()
                    .ok_or(Error::InvalidSignature { input: index })?;
                let w = Witness::p2tr_key_spend(sig);
                input.final_script_witness = Some(w.clone());
                input.tap_key_sig = None;
                input.tap_internal_key = None;
                input.tap_key_origins.clear();
                input.sighash_type = None;
                w
            }
        };
        txin.witness = witness;
    }
    Ok(tx)
}

// ── Transport codec ──────────────────────────────────────────────────────────

pub fn psbt_from_base64(s: &str) -> Result<Psbt> {
    let bytes = B64
        .decode(s.trim())
        .map_err(|e| Error::Psbt(format!("base64: {e}")))?;
    Ok(Psbt::deserialize(&bytes)?)
}

pub fn psbt_to_base64(psbt: &Psbt) -> String {
    B64.encode(psbt.serialize())
}

pub fn psbt_from_hex(s: &str) -> Result<Psbt> {
    let bytes = hex::decode(s.trim()).map_err(|e| Error::Psbt(format!("hex: {e}")))?;
    Ok(Psbt::deserialize(&bytes)?)
}

pub fn psbt_to_hex(psbt: &Psbt) -> String {
    hex::encode(psbt.serialize())
}

/// Accept either transport encoding.
pub fn decode_psbt(s: &str) -> Result<Psbt> {
    let s = s.trim();
    if !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit()) {
        psbt_from_hex(s)
    } else {
        psbt_from_base64(s)
    }
}
