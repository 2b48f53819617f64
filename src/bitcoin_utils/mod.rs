//! Bitcoin utilities: tagged hashes, key tweaking, BIP341 sighash, Schnorr signing, PSBT assembly

pub mod keys;
pub mod psbt;
pub mod sighash;
pub mod signer;
pub mod tagged;

pub use keys::*;
pub use psbt::*;
pub use sighash::*;
pub use signer::*;
pub use tagged::*;
