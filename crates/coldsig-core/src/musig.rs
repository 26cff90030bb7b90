//! MuSig2 (BIP-327) key aggregation and signing for taproot wallet outputs.
//!
//! Bridges between bitcoin's secp256k1 types and the musig2 crate's types
//! via byte serialization. Both use libsecp256k1 underneath.
//!
//! Taproot wallet outputs use the user/bitgo aggregate as their internal key.
//! A key-path spend runs the usual two rounds:
//!   Round 1: both signers generate and exchange PubNonces
//!   Round 2: partial signing, then aggregation into one Schnorr signature

use bitcoin::key::XOnlyPublicKey;
use bitcoin::secp256k1::{schnorr, PublicKey, SecretKey};
use bitcoin::taproot::TapNodeHash;
use bitcoin::hashes::Hash;
use musig2::{AggNonce, KeyAggContext, LiftedSignature, PartialSignature, PubNonce, SecNonce};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MusigError {
    #[error("key conversion failed: {0}")]
    Conversion(String),

    #[error("key aggregation failed: {0}")]
    KeyAggregation(String),

    #[error("taproot tweak failed: {0}")]
    Tweak(String),

    #[error("partial signing failed: {0}")]
    Signing(String),

    #[error("signature aggregation failed: {0}")]
    Aggregation(String),
}

// ─── Type conversion helpers ────────────────────────────────────────────────

fn pubkey_to_musig(pk: &PublicKey) -> Result<musig2::secp256k1::PublicKey, MusigError> {
    musig2::secp256k1::PublicKey::from_slice(&pk.serialize())
        .map_err(|e| MusigError::Conversion(format!("pubkey: {}", e)))
}

fn seckey_to_musig(sk: &SecretKey) -> Result<musig2::secp256k1::SecretKey, MusigError> {
    #[allow(deprecated)]
    musig2::secp256k1::SecretKey::from_slice(&sk.secret_bytes())
        .map_err(|e| MusigError::Conversion(format!("seckey: {}", e)))
}

fn pubkey_from_musig(pk: &musig2::secp256k1::PublicKey) -> Result<PublicKey, MusigError> {
    PublicKey::from_slice(&pk.serialize())
        .map_err(|e| MusigError::Conversion(format!("aggregate pubkey: {}", e)))
}

// ─── Key Aggregation ────────────────────────────────────────────────────────

/// KeyAgg context for `keys` in the given order. Order changes the result.
pub fn key_agg(keys: &[PublicKey]) -> Result<KeyAggContext, MusigError> {
    let converted = keys
        .iter()
        .map(pubkey_to_musig)
        .collect::<Result<Vec<_>, _>>()?;
    KeyAggContext::new(converted).map_err(|e| MusigError::KeyAggregation(e.to_string()))
}

/// Untweaked aggregate public key of `keys`.
pub fn aggregate_pubkey(keys: &[PublicKey]) -> Result<PublicKey, MusigError> {
    let ctx = key_agg(keys)?;
    let agg: musig2::secp256k1::PublicKey = ctx.aggregated_pubkey();
    pubkey_from_musig(&agg)
}

/// Untweaked aggregate as an x-only key, ready for use as a taproot internal key.
pub fn aggregate_xonly(keys: &[PublicKey]) -> Result<XOnlyPublicKey, MusigError> {
    Ok(aggregate_pubkey(keys)?.x_only_public_key().0)
}

/// Apply the BIP-341 output tweak for a script tree (or none) to a context.
///
/// Partial signatures made with the returned context aggregate to a valid
/// key-path signature for the tweaked output key Q.
pub fn with_taproot_tweak(
    ctx: KeyAggContext,
    merkle_root: Option<TapNodeHash>,
) -> Result<KeyAggContext, MusigError> {
    let tweaked = match merkle_root {
        Some(root) => ctx.with_taproot_tweak(&root.to_byte_array()),
        None => ctx.with_unspendable_taproot_tweak(),
    };
    tweaked.map_err(|e| MusigError::Tweak(e.to_string()))
}

/// Output key the tweaked context signs for.
pub fn tweaked_output_key(ctx: &KeyAggContext) -> Result<XOnlyPublicKey, MusigError> {
    let agg: musig2::secp256k1::PublicKey = ctx.aggregated_pubkey();
    Ok(pubkey_from_musig(&agg)?.x_only_public_key().0)
}

// ─── Nonce Generation ───────────────────────────────────────────────────────

/// Generate a nonce pair for one signing session.
///
/// The SecNonce must be used exactly once. Reusing it across messages
/// reveals the private key.
pub fn generate_nonce(
    seckey: &SecretKey,
    ctx: &KeyAggContext,
    message: &[u8; 32],
) -> Result<(SecNonce, PubNonce), MusigError> {
    let sk_m = seckey_to_musig(seckey)?;
    let agg_pk: musig2::secp256k1::PublicKey = ctx.aggregated_pubkey();

    let mut nonce_seed = [0u8; 32];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut nonce_seed);

    let secnonce = SecNonce::build(nonce_seed)
        .with_seckey(sk_m)
        .with_aggregated_pubkey(agg_pk)
        .with_message(message)
        .build();
    let pubnonce = secnonce.public_nonce();

    Ok((secnonce, pubnonce))
}

pub fn aggregate_nonces(nonces: &[PubNonce]) -> AggNonce {
    AggNonce::sum(nonces)
}

// ─── Partial Signing ────────────────────────────────────────────────────────

/// The SecNonce is consumed to prevent reuse.
pub fn partial_sign(
    seckey: &SecretKey,
    secnonce: SecNonce,
    ctx: &KeyAggContext,
    agg_nonce: &AggNonce,
    message: &[u8; 32],
) -> Result<PartialSignature, MusigError> {
    let sk_m = seckey_to_musig(seckey)?;
    musig2::sign_partial(ctx, sk_m, secnonce, agg_nonce, message)
        .map_err(|e| MusigError::Signing(e.to_string()))
}

pub fn verify_partial_signature(
    ctx: &KeyAggContext,
    partial_sig: &PartialSignature,
    agg_nonce: &AggNonce,
    signer_pubkey: &PublicKey,
    signer_pubnonce: &PubNonce,
    message: &[u8; 32],
) -> bool {
    let pk_m = match pubkey_to_musig(signer_pubkey) {
        Ok(pk) => pk,
        Err(_) => return false,
    };
    musig2::verify_partial(ctx, *partial_sig, agg_nonce, pk_m, signer_pubnonce, message).is_ok()
}

// ─── Signature Aggregation ──────────────────────────────────────────────────

pub fn aggregate_signatures(
    ctx: &KeyAggContext,
    agg_nonce: &AggNonce,
    partial_sigs: &[PartialSignature],
    message: &[u8; 32],
) -> Result<schnorr::Signature, MusigError> {
    let sig: LiftedSignature = musig2::aggregate_partial_signatures(
        ctx,
        agg_nonce,
        partial_sigs.iter().copied(),
        message,
    )
    .map_err(|e| MusigError::Aggregation(e.to_string()))?;

    schnorr::Signature::from_slice(&sig.serialize())
        .map_err(|e| MusigError::Aggregation(e.to_string()))
}
