//! PSBT verification tool
//!
//! Verifies every signed key-path input of a PSBT:
//! - Prevout is present and P2TR
//! - Our BIP341 sighash matches the `bitcoin` crate's `SighashCache`
//! - Schnorr signature verifies against the output key
//! - Optionally: the whole purchase satisfies an offer (`--offer offer.json`)

use anyhow::*;
use bitcoin::hashes::Hash;
use bitcoin::sighash::{Prevouts, SighashCache};
use bitcoin::TxOut;
use std::fs;

use ordswap::bitcoin_utils::psbt::{decode_psbt, validate_buyer_psbt, validate_seller_psbt};
use ordswap::bitcoin_utils::sighash::{compute_sighash, SighashType};
use ordswap::bitcoin_utils::signer::{input_signature, psbt_prevouts, verify_psbt_input};
use ordswap::offer::Offer;

/// CLI: `cargo run --bin verify_psbt -- --psbt purchase.psbt [--offer offer.json]`
#[derive(clap::Parser, Debug)]
struct Opts {
    /// PSBT file (base64 or hex)
    #[arg(long)]
    psbt: String,

    /// Offer JSON; a one-input PSBT is checked as the seller template, anything else as a purchase
    #[arg(long)]
    offer: Option<String>,
}

fn main() -> Result<()> {
    let opts = <Opts as clap::Parser>::parse();

    let raw = fs::read_to_string(&opts.psbt)?;
    let psbt = decode_psbt(raw.trim())?;
    let tx = &psbt.unsigned_tx;

    eprintln!("=== PSBT Verification ===\n");
    eprintln!("PSBT: {}", opts.psbt);
    eprintln!("Txid: {}", tx.compute_txid());
    eprintln!("Inputs: {}, outputs: {}\n", tx.input.len(), tx.output.len());

    let prevouts = psbt_prevouts(&psbt);
    let all_known: Option<Vec<TxOut>> = prevouts.iter().cloned().collect();
    let mut cache = SighashCache::new(tx);
    let mut signed = 0usize;

    for index in 0..tx.input.len() {
        eprint!("  [{index}] {} ... ", tx.input[index].previous_output);
        let Some(sig) = input_signature(&psbt, index) else {
            eprintln!("unsigned");
            continue;
        };
        let ty = SighashType::from(sig.sighash_type);
        let ours = compute_sighash(tx, index, &prevouts, ty)?;

        // ANYONECANPAY only needs this input's prevout; everything else needs all of them
        let theirs = if ty.anyone_can_pay() {
            let prevout = prevouts[index]
                .as_ref()
                .with_context(|| format!("input {index}: missing prevout"))?;
            cache.taproot_key_spend_signature_hash(
                index,
                &Prevouts::One(index, prevout),
                sig.sighash_type,
            )?
        } else {
            let all = all_known
                .as_ref()
                .with_context(|| format!("input {index}: {ty} needs every prevout"))?;
            cache.taproot_key_spend_signature_hash(
                index,
                &Prevouts::All(all.as_slice()),
                sig.sighash_type,
            )?
        };
        ensure!(
            ours == theirs.to_byte_array(),
            "input {index}: sighash mismatch (ours {}, bitcoin {})",
            hex::encode(ours),
            theirs
        );

        verify_psbt_input(&psbt, index)
            .with_context(|| format!("input {index}: signature check"))?;
        signed += 1;
        eprintln!("OK ({ty})");
    }

    if let Some(path) = &opts.offer {
        let offer: Offer = serde_json::from_str(&fs::read_to_string(path)?)?;
        if tx.input.len() == 1 {
            validate_seller_psbt(&offer, &psbt)?;
            eprintln!("\nSeller template satisfies offer {}", offer.id);
        } else {
            let seller_index = validate_buyer_psbt(&offer, &psbt)?;
            eprintln!("\nPurchase satisfies offer {} (seller input {seller_index})", offer.id);
        }
    }

    eprintln!("\n{signed}/{} input(s) signed and verified", tx.input.len());
    Ok(())
}
