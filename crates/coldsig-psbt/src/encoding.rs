//! Text encodings of PSBTs and transactions.

use base64::prelude::*;
use bitcoin::consensus::encode;
use bitcoin::psbt::Psbt;
use bitcoin::Transaction;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const MAX_ECHO: usize = 32;

#[derive(Debug, Error)]
pub enum EncodingError {
    #[error("invalid hex '{value}': {reason}")]
    Hex { value: String, reason: String },

    #[error("invalid base64 '{value}': {reason}")]
    Base64 { value: String, reason: String },

    #[error("invalid psbt: {0}")]
    Psbt(#[from] bitcoin::psbt::Error),

    #[error("invalid transaction: {0}")]
    Transaction(String),
}

/// Truncated copy of an offending input for error messages.
fn echo(value: &str) -> String {
    if value.len() <= MAX_ECHO {
        value.to_string()
    } else {
        let cut = (0..=MAX_ECHO)
            .rev()
            .find(|i| value.is_char_boundary(*i))
            .unwrap_or(0);
        format!("{}...", &value[..cut])
    }
}

fn decode_hex(value: &str) -> Result<Vec<u8>, EncodingError> {
    hex::decode(value.trim()).map_err(|e| EncodingError::Hex {
        value: echo(value),
        reason: e.to_string(),
    })
}

/// Serialized form of a signed or half-signed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxFormat {
    #[default]
    Psbt,
    /// Bare transaction with the signature slots in the input scripts.
    Legacy,
}

impl std::str::FromStr for TxFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "psbt" => Ok(TxFormat::Psbt),
            "legacy" => Ok(TxFormat::Legacy),
            other => Err(format!("unknown tx format '{}'", other)),
        }
    }
}

// ─── PSBT ───────────────────────────────────────────────────────────────────

pub fn psbt_to_hex(psbt: &Psbt) -> String {
    hex::encode(psbt.serialize())
}

pub fn psbt_from_hex(value: &str) -> Result<Psbt, EncodingError> {
    Ok(Psbt::deserialize(&decode_hex(value)?)?)
}

pub fn psbt_to_base64(psbt: &Psbt) -> String {
    BASE64_STANDARD.encode(psbt.serialize())
}

pub fn psbt_from_base64(value: &str) -> Result<Psbt, EncodingError> {
    let bytes = BASE64_STANDARD
        .decode(value.trim())
        .map_err(|e| EncodingError::Base64 {
            value: echo(value),
            reason: e.to_string(),
        })?;
    Ok(Psbt::deserialize(&bytes)?)
}

/// Accept either encoding. Hex is tried first since every hex string that is
/// a valid PSBT starts with the magic `70736274ff`.
pub fn psbt_from_str(value: &str) -> Result<Psbt, EncodingError> {
    let trimmed = value.trim();
    if trimmed.starts_with("70736274") {
        psbt_from_hex(trimmed)
    } else {
        psbt_from_base64(trimmed)
    }
}

// ─── Transactions ───────────────────────────────────────────────────────────

pub fn tx_to_hex(tx: &Transaction) -> String {
    encode::serialize_hex(tx)
}

pub fn tx_from_hex(value: &str) -> Result<Transaction, EncodingError> {
    let bytes = decode_hex(value)?;
    encode::deserialize(&bytes).map_err(|e| EncodingError::Transaction(e.to_string()))
}
