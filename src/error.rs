//! Error taxonomy shared by every component.

use bitcoin::OutPoint;
use thiserror::Error;

use crate::filter::ProtectionReason;
use crate::offer::OfferState;

#[derive(Debug, Error)]
pub enum Error {
    // ── Business rejections (offer state machine) ──────────────────────────
    #[error("offer requires {expected} but the seller input was signed with {found}")]
    InvalidSighashMode { expected: String, found: String },

    #[error("operation `{operation}` not allowed while offer is {state:?}")]
    OfferStateConflict {
        operation: &'static str,
        state: OfferState,
    },

    #[error("offer {0} not found")]
    OfferNotFound(String),

    #[error("price must be greater than zero")]
    InvalidPrice,

    #[error("asset is not held by the seller: {0}")]
    AssetNotOwned(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("only {expected} may perform this operation")]
    Unauthorized { expected: String },

    #[error("someone else is buying this offer ({holder}, {remaining_secs}s left on their lock)")]
    LockConflict { holder: String, remaining_secs: u64 },

    // ── Funding ────────────────────────────────────────────────────────────
    #[error("insufficient pure funds: need {needed} sats, {available} sats spendable (short by {})", shortfall(.needed, .available))]
    InsufficientPureFunds { needed: u64, available: u64 },

    #[error("utxo {outpoint} carries assets and cannot fund this transaction: {reason}")]
    ProtectedUtxoSelected {
        outpoint: OutPoint,
        reason: ProtectionReason,
    },

    // ── Signing ────────────────────────────────────────────────────────────
    #[error("invalid taproot tweak: {0}")]
    InvalidTweak(String),

    #[error("private key does not match internal key")]
    KeyMismatch,

    #[error("missing prevout data for input {input}")]
    MissingPrevoutData { input: usize },

    #[error("input index {index} out of range ({inputs} inputs)")]
    InputIndexOutOfRange { index: usize, inputs: usize },

    #[error("invalid taproot sighash type 0x{0:02x}")]
    InvalidSighashType(u8),

    #[error("signing suspended: {reason}")]
    SigningSuspended { reason: String },

    #[error("signature on input {input} is missing or invalid")]
    InvalidSignature { input: usize },

    // ── PSBT shape ─────────────────────────────────────────────────────────
    #[error("seller input or signature was modified")]
    SellerInputTampered,

    #[error("transaction does not pay the seller {price_sats} sats")]
    SellerPaymentMissing { price_sats: u64 },

    #[error("PSBT error: {0}")]
    Psbt(String),

    // ── Runestone ──────────────────────────────────────────────────────────
    #[error("malformed runestone: {0}")]
    MalformedRunestone(String),

    #[error("runestone carries more than one edict for rune {0}; leftover balance must use implicit change")]
    RedundantChangeEdict(String),

    // ── External collaborators ─────────────────────────────────────────────
    #[error("asset oracle error: {0}")]
    Oracle(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("all broadcast services failed: {}", format_service_errors(.0))]
    AllBroadcastServicesFailed(Vec<(String, String)>),

    #[error("config error: {0}")]
    Config(String),
}

fn shortfall(needed: &u64, available: &u64) -> u64 {
    needed.saturating_sub(*available)
}

fn format_service_errors(errors: &[(String, String)]) -> String {
    errors
        .iter()
        .map(|(service, err)| format!("{service}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Expected, recoverable conditions that are reported to the user as-is.
    pub fn is_user_recoverable(&self) -> bool {
        matches!(
            self,
            Error::LockConflict { .. } | Error::InsufficientPureFunds { .. }
        )
    }
}

impl From<bitcoin::psbt::Error> for Error {
    fn from(e: bitcoin::psbt::Error) -> Self {
        Error::Psbt(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
