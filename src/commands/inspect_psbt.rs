//! Inspect command: summarise a PSBT's inputs, signatures and outputs

use anyhow::*;
use bitcoin::psbt::Psbt;
use serde::Serialize;

use super::read_arg;
use crate::bitcoin_utils::psbt::decode_psbt;
use crate::bitcoin_utils::sighash::SighashType;
use crate::bitcoin_utils::signer::{input_signature, psbt_prevouts, verify_psbt_input};
use crate::runestone::{self, RunestoneMessage};

#[derive(clap::Parser, Debug)]
pub struct InspectPsbtOpts {
    /// PSBT as base64 or hex, or a file holding it
    #[arg(long)]
    pub psbt: String,
}

#[derive(Debug, Serialize)]
pub struct InputReport {
    pub index: usize,
    pub outpoint: String,
    pub value_sats: Option<u64>,
    pub sighash_type: Option<String>,
    /// `None` when the input carries no signature yet.
    pub signature_valid: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct OutputReport {
    pub index: usize,
    pub value_sats: u64,
    pub script_hex: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runestone: Option<RunestoneMessage>,
}

#[derive(Debug, Serialize)]
pub struct PsbtReport {
    pub txid: String,
    pub inputs: Vec<InputReport>,
    pub outputs: Vec<OutputReport>,
    /// Absent if any prevout is unknown.
    pub fee_sats: Option<u64>,
}

pub fn inspect(psbt: &Psbt) -> PsbtReport {
    let prevouts = psbt_prevouts(psbt);
    let inputs = psbt
        .unsigned_tx
        .input
        .iter()
        .enumerate()
        .map(|(index, txin)| {
            let sig = input_signature(psbt, index);
            InputReport {
                index,
                outpoint: txin.previous_output.to_string(),
                value_sats: prevouts
                    .get(index)
                    .and_then(Option::as_ref)
                    .map(|o| o.value.to_sat()),
                sighash_type: sig
                    .as_ref()
                    .map(|s| SighashType::from(s.sighash_type).to_string()),
                signature_valid: sig.map(|_| verify_psbt_input(psbt, index).is_ok()),
            }
        })
        .collect();

    let outputs = psbt
        .unsigned_tx
        .output
        .iter()
        .enumerate()
        .map(|(index, out)| OutputReport {
            index,
            value_sats: out.value.to_sat(),
            script_hex: out.script_pubkey.to_hex_string(),
            runestone: runestone::is_runestone(&out.script_pubkey)
                .then(|| runestone::decipher(&out.script_pubkey).ok())
                .flatten(),
        })
        .collect();

    let value_in: Option<u64> = prevouts
        .iter()
        .map(|p| p.as_ref().map(|o| o.value.to_sat()))
        .sum();
    let value_out: u64 = psbt
        .unsigned_tx
        .output
        .iter()
        .map(|o| o.value.to_sat())
        .sum();

    PsbtReport {
        txid: psbt.unsigned_tx.compute_txid().to_string(),
        inputs,
        outputs,
        fee_sats: value_in.and_then(|v| v.checked_sub(value_out)),
    }
}

pub fn run_inspect_psbt(o: InspectPsbtOpts) -> Result<()> {
    let psbt = decode_psbt(&read_arg(&o.psbt)?)?;
    let report = inspect(&psbt);
    for input in &report.inputs {
        if input.signature_valid == Some(false) {
            tracing::warn!(input = input.index, "signature does not verify");
        }
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
