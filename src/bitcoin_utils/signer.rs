//! Schnorr signing behind an explicit signing policy.

use std::sync::RwLock;

use bitcoin::psbt::{Psbt, PsbtSighashType};
use bitcoin::secp256k1::schnorr;
use bitcoin::{taproot, TxOut};
use rand::RngCore;
use secp256k1::{Keypair, Message, Secp256k1, SecretKey, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::keys::{p2tr_output_key, tweak_key};
use super::sighash::{compute_sighash, SighashType};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SigningPolicy {
    Enabled,
    Suspended { reason: String },
}

/// Produces every signature in the system; each call checks the policy first.
#[derive(Debug)]
pub struct Signer {
    policy: RwLock<SigningPolicy>,
}

impl Default for Signer {
    fn default() -> Self {
        Self::new()
    }
}

impl Signer {
    pub fn new() -> Self {
        Self {
            policy: RwLock::new(SigningPolicy::Enabled),
        }
    }

    pub fn policy(&self) -> SigningPolicy {
        match self.policy.read() {
            Ok(p) => p.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Admin operation: switch signing on or off. Every change is logged with
    /// the acting principal.
    pub fn set_policy(&self, actor: &str, policy: SigningPolicy) {
        let mut guard = match self.policy.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let previous = std::mem::replace(&mut *guard, policy.clone());
        match &policy {
            SigningPolicy::Enabled => {
                info!(actor, ?previous, "signing policy set to enabled")
            }
            SigningPolicy::Suspended { reason } => {
                warn!(actor, ?previous, reason = %reason, "signing policy set to suspended")
            }
        }
    }

    pub fn ensure_enabled(&self) -> Result<()> {
        match self.policy() {
            SigningPolicy::Enabled => Ok(()),
            SigningPolicy::Suspended { reason } => Err(Error::SigningSuspended { reason }),
        }
    }

    /// BIP340 Schnorr signature over a 32-byte sighash with a tweaked key.
    pub fn sign_schnorr(
        &self,
        sighash: &[u8; 32],
        tweaked_privkey: &SecretKey,
        aux_rand: &[u8; 32],
    ) -> Result<[u8; 64]> {
        self.ensure_enabled()?;
        let secp = Secp256k1::new();
        let keypair = Keypair::from_secret_key(&secp, tweaked_privkey);
        let msg = Message::from_digest(*sighash);
        let sig = secp.sign_schnorr_with_aux_rand(&msg, &keypair, aux_rand);
        Ok(sig.serialize())
    }

    /// Sign one P2TR key-path input of a PSBT with an untweaked internal key.
    ///
    /// Prevouts are taken from the PSBT's `witness_utxo`/`non_witness_utxo`
    /// fields. The resulting signature is stored as `tap_key_sig`.
    pub fn sign_psbt_input(
        &self,
        psbt: &mut Psbt,
        index: usize,
        internal: &Keypair,
        sighash_type: SighashType,
        aux_rand: &[u8; 32],
    ) -> Result<()> {
        self.ensure_enabled()?;
        if index >= psbt.inputs.len() {
            return Err(Error::InputIndexOutOfRange {
                index,
                inputs: psbt.inputs.len(),
            });
        }

        let prevouts = psbt_prevouts(psbt);
        let (internal_xonly, _) = internal.x_only_public_key();
        let (tweaked_sk, output_key) = tweak_key(&internal_xonly, &internal.secret_key())?;

        let spent = prevouts
            .get(index)
            .and_then(Option::as_ref)
            .ok_or(Error::MissingPrevoutData { input: index })?;
        if p2tr_output_key(&spent.script_pubkey) != Some(output_key) {
            return Err(Error::KeyMismatch);
        }

        let sighash = compute_sighash(&psbt.unsigned_tx, index, &prevouts, sighash_type)?;
        let sig = self.sign_schnorr(&sighash, &tweaked_sk, aux_rand)?;
        debug!(index, %sighash_type, sighash = %hex::encode(sighash), "signed input");

        let input = &mut psbt.inputs[index];
        input.tap_key_sig = Some(taproot::Signature {
            signature: schnorr::Signature::from_slice(&sig)
                .map_err(|e| Error::Psbt(format!("signature encoding: {e}")))?,
            sighash_type: sighash_type.into(),
        });
        input.tap_internal_key = Some(internal_xonly);
        input.sighash_type = Some(PsbtSighashType::from(
            bitcoin::sighash::TapSighashType::from(sighash_type),
        ));
        Ok(())
    }
}

/// Fresh auxiliary randomness for production signatures.
pub fn random_aux() -> [u8; 32] {
    let mut aux = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut aux);
    aux
}

pub fn verify(sighash: &[u8; 32], signature: &[u8; 64], xonly_pubkey: &XOnlyPublicKey) -> bool {
    let secp = Secp256k1::verification_only();
    let Ok(sig) = schnorr::Signature::from_slice(signature) else {
        return false;
    };
    secp.verify_schnorr(&sig, &Message::from_digest(*sighash), xonly_pubkey)
        .is_ok()
}

/// Prevout of every input as recorded in the PSBT.
pub fn psbt_prevouts(psbt: &Psbt) -> Vec<Option<TxOut>> {
    psbt.inputs
        .iter()
        .zip(&psbt.unsigned_tx.input)
        .map(|(input, txin)| {
            input.witness_utxo.clone().or_else(|| {
                input.non_witness_utxo.as_ref().and_then(|prev| {
                    prev.output
                        .get(txin.previous_output.vout as usize)
                        .cloned()
                })
            })
        })
        .collect()
}

/// Signature carried by an input, either pending or already finalized.
pub fn input_signature(psbt: &Psbt, index: usize) -> Option<taproot::Signature> {
    let input = psbt.inputs.get(index)?;
    if let Some(sig) = &input.tap_key_sig {
        return Some(sig.clone());
    }
    let witness = input.final_script_witness.as_ref()?;
    if witness.len() != 1 {
        return None;
    }
    taproot::Signature::from_slice(witness.nth(0)?).ok()
}

/// Check the key-path signature on one input against its P2TR prevout.
/// Returns the hash type the input was signed with.
pub fn verify_psbt_input(psbt: &Psbt, index: usize) -> Result<SighashType> {
    let sig = input_signature(psbt, index).ok_or(Error::InvalidSignature { input: index })?;
    let prevouts = psbt_prevouts(psbt);
    let spent = prevouts
        .get(index)
        .and_then(Option::as_ref)
        .ok_or(Error::MissingPrevoutData { input: index })?;
    let output_key =
        p2tr_output_key(&spent.script_pubkey).ok_or(Error::InvalidSignature { input: index })?;

    let sighash_type = SighashType::from(sig.sighash_type);
    let sighash = compute_sighash(&psbt.unsigned_tx, index, &prevouts, sighash_type)?;
    if !verify(&sighash, &sig.signature.serialize(), &output_key) {
        return Err(Error::InvalidSignature { input: index });
    }
    Ok(sighash_type)
}
