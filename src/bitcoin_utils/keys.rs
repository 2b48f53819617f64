//! Key management: seed-based derivation and the Taproot key-path tweak

use std::fmt;

use bitcoin::bip32::{ChildNumber, Xpriv};
use bitcoin::{Network, Script, ScriptBuf, XOnlyPublicKey};
use secp256k1::{All, Keypair, Parity, Scalar, Secp256k1, SecretKey};
use tracing::error;

use super::tagged::tap_tweak;
use crate::error::{Error, Result};

/// Derives signing keys from a master seed provisioned out-of-band.
///
/// Constructed once at startup and passed by reference to whichever component
/// needs a key. Keys follow the BIP86 layout `m/86'/coin'/account'/0/index`.
pub struct KeyDeriver {
    master: Xpriv,
    coin_type: u32,
    secp: Secp256k1<All>,
}

impl fmt::Debug for KeyDeriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyDeriver")
            .field("coin_type", &self.coin_type)
            .finish_non_exhaustive()
    }
}

impl KeyDeriver {
    pub fn from_seed(seed: &[u8], network: Network) -> Result<Self> {
        let master = Xpriv::new_master(network, seed)
            .map_err(|e| Error::Config(format!("invalid master seed: {e}")))?;
        let coin_type = match network {
            Network::Bitcoin => 0,
            _ => 1,
        };
        Ok(Self {
            master,
            coin_type,
            secp: Secp256k1::new(),
        })
    }

    /// Untweaked internal key pair at `m/86'/coin'/account'/0/index`.
    pub fn derive(&self, account: u32, index: u32) -> Result<Keypair> {
        let bip32 = |e: bitcoin::bip32::Error| Error::Config(format!("bip32 derivation: {e}"));
        let path = [
            ChildNumber::from_hardened_idx(86).map_err(bip32)?,
            ChildNumber::from_hardened_idx(self.coin_type).map_err(bip32)?,
            ChildNumber::from_hardened_idx(account).map_err(bip32)?,
            ChildNumber::from_normal_idx(0).map_err(bip32)?,
            ChildNumber::from_normal_idx(index).map_err(bip32)?,
        ];
        let child = self.master.derive_priv(&self.secp, &path).map_err(bip32)?;
        Ok(child.to_keypair(&self.secp))
    }

    /// Key-path-only P2TR script for a derived key.
    pub fn p2tr_script(&self, account: u32, index: u32) -> Result<ScriptBuf> {
        let (internal, _) = self.derive(account, index)?.x_only_public_key();
        Ok(ScriptBuf::new_p2tr(&self.secp, internal, None))
    }
}

/// Tweak an internal key for a key-path-only Taproot output.
///
/// Returns the tweaked private key and the x-only output key. The private key
/// is normalised so that its public point has even Y both before and after
/// the tweak.
pub fn tweak_key(
    internal_xonly: &XOnlyPublicKey,
    internal_privkey: &SecretKey,
) -> Result<(SecretKey, XOnlyPublicKey)> {
    let secp = Secp256k1::new();

    let (xonly, parity) = internal_privkey.x_only_public_key(&secp);
    if xonly != *internal_xonly {
        return Err(Error::KeyMismatch);
    }
    let d = match parity {
        Parity::Odd => internal_privkey.negate(),
        Parity::Even => *internal_privkey,
    };

    let t = tap_tweak(&xonly.serialize(), None);
    let scalar = Scalar::from_be_bytes(t).map_err(|_| {
        error!(internal = %xonly, tweak = %hex::encode(t), "taptweak exceeds curve order");
        Error::InvalidTweak("tweak exceeds curve order".into())
    })?;
    let tweaked = d.add_tweak(&scalar).map_err(|_| {
        error!(internal = %xonly, "tweaked key is the point at infinity");
        Error::InvalidTweak("tweaked key is the point at infinity".into())
    })?;

    let (tweaked_xonly, parity) = tweaked.x_only_public_key(&secp);
    let tweaked = match parity {
        Parity::Odd => tweaked.negate(),
        Parity::Even => tweaked,
    };
    Ok((tweaked, tweaked_xonly))
}

/// Tweak a key pair, returning a key pair whose x-only key is the output key.
pub fn tweak_keypair(keypair: &Keypair) -> Result<Keypair> {
    let secp = Secp256k1::new();
    let (internal, _) = keypair.x_only_public_key();
    let (sk, _) = tweak_key(&internal, &keypair.secret_key())?;
    Ok(Keypair::from_secret_key(&secp, &sk))
}

/// Output key of a P2TR script (`OP_1 <32 bytes>`), if it is one.
pub fn p2tr_output_key(script: &Script) -> Option<XOnlyPublicKey> {
    if !script.is_p2tr() {
        return None;
    }
    XOnlyPublicKey::from_slice(&script.as_bytes()[2..34]).ok()
}
