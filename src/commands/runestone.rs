//! Runestone encode/decode commands

use anyhow::*;
use bitcoin::consensus::encode::deserialize_hex;
use bitcoin::{ScriptBuf, Transaction};

use super::read_arg;
use crate::runestone::{self, RunestoneMessage};
use crate::types::RuneId;

#[derive(clap::Parser, Debug)]
pub struct DecodeRunestoneOpts {
    /// Output script hex (`6a5d...`)
    #[arg(long, conflicts_with = "tx")]
    pub script: Option<String>,
    /// Raw transaction hex, or a file holding it; the first runestone output is decoded
    #[arg(long)]
    pub tx: Option<String>,
}

#[derive(clap::Parser, Debug)]
pub struct EncodeRunestoneOpts {
    /// Rune id as `block:tx`
    #[arg(long)]
    pub rune_id: RuneId,
    /// Amount in the rune's base units
    #[arg(long)]
    pub amount: u128,
    /// Output receiving the amount
    #[arg(long)]
    pub output: u32,
}

pub fn run_decode_runestone(o: DecodeRunestoneOpts) -> Result<()> {
    let (vout, message) = match (o.script, o.tx) {
        (Some(script), None) => {
            let script = ScriptBuf::from_hex(script.trim()).context("invalid script hex")?;
            (None, runestone::decipher(&script)?)
        }
        (None, Some(tx)) => {
            let tx: Transaction = deserialize_hex(&read_arg(&tx)?).context("invalid tx hex")?;
            let (vout, message) =
                runestone::find_in_tx(&tx).ok_or_else(|| anyhow!("no runestone output"))??;
            (Some(vout), message)
        }
        _ => bail!("pass exactly one of --script or --tx"),
    };
    if let Some(vout) = vout {
        eprintln!("runestone at output {vout}");
    }
    println!("{}", serde_json::to_string_pretty(&message)?);
    Ok(())
}

pub fn run_encode_runestone(o: EncodeRunestoneOpts) -> Result<()> {
    ensure!(o.amount > 0, "amount 0 would transfer the whole balance");
    let message = RunestoneMessage::transfer(o.rune_id, o.amount, o.output);
    let script = runestone::encipher(&message)?;
    println!("{}", script.to_hex_string());
    Ok(())
}
