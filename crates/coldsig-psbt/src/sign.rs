//! Signing and signature checks for wallet PSBTs.
//!
//! Keys are located through the key-origin maps of each input: an entry whose
//! fingerprint matches the signer's root key is derived at its path, checked
//! against the recorded public key, and only then used to sign.

use bitcoin::bip32::DerivationPath;
use bitcoin::ecdsa;
use bitcoin::hashes::Hash;
use bitcoin::key::XOnlyPublicKey;
use bitcoin::psbt::{self, Psbt};
use bitcoin::script::Instruction;
use bitcoin::secp256k1::{Keypair, Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, Prevouts, SighashCache, TapSighashType};
use bitcoin::taproot::{self, TapLeafHash};
use bitcoin::{Script, Transaction, TxOut};
use coldsig_core::classify::{classify_psbt_input, ClassifyError, InputScriptType};
use coldsig_core::musig::{self, MusigError};
use coldsig_core::{KeyError, KeyRole, RootWalletKeys, Triple, WalletSigner};
use thiserror::Error;

use crate::builder::prevout;

#[derive(Debug, Error)]
pub enum SignError {
    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("input {index}: {source}")]
    Classify {
        index: usize,
        #[source]
        source: ClassifyError,
    },

    #[error("input {0} does not exist")]
    InputOutOfRange(usize),

    #[error("input {0} has no previous output")]
    MissingPrevout(usize),

    #[error("input {0} is missing its spend script")]
    MissingScript(usize),

    #[error("input {index}: sighash computation failed: {reason}")]
    Sighash { index: usize, reason: String },

    #[error("input {index}: key at {path} does not match the recorded public key")]
    KeyMismatch { index: usize, path: DerivationPath },

    #[error("input {index} already carries a signature from {role}")]
    AlreadySigned { index: usize, role: KeyRole },

    #[error("input {index} cannot be signed: {reason}")]
    NotSignable { index: usize, reason: String },

    #[error(transparent)]
    Musig(#[from] MusigError),
}

/// Inputs signed and inputs left alone by one signing pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SigningReport {
    pub signed: Vec<usize>,
    pub skipped: Vec<usize>,
}

/// Signatures needed to spend an input of this type.
pub fn required_signatures(input_type: InputScriptType) -> usize {
    match input_type {
        InputScriptType::P2shP2pk | InputScriptType::P2trKeypath => 1,
        _ => 2,
    }
}

/// Signatures present on a PSBT input. An aggregated key-path signature counts once.
pub fn signature_count(input: &psbt::Input) -> usize {
    input.partial_sigs.len() + input.tap_script_sigs.len() + usize::from(input.tap_key_sig.is_some())
}

pub fn is_finalized(input: &psbt::Input) -> bool {
    input.final_script_sig.is_some() || input.final_script_witness.is_some()
}

/// Finalized, or carrying all the signatures its spend path needs.
pub fn is_input_complete(input: &psbt::Input) -> bool {
    if is_finalized(input) {
        return true;
    }
    let required = classify_psbt_input(input)
        .map(required_signatures)
        .unwrap_or(2);
    signature_count(input) >= required
}

fn sighash_error(index: usize) -> impl Fn(String) -> SignError {
    move |reason| SignError::Sighash { index, reason }
}

/// ECDSA sighash (SIGHASH_ALL) of a p2sh, p2shP2wsh, p2wsh or p2shP2pk input.
pub(crate) fn ecdsa_message(
    cache: &mut SighashCache<&Transaction>,
    input: &psbt::Input,
    index: usize,
    input_type: InputScriptType,
    prevout: Option<&TxOut>,
) -> Result<Message, SignError> {
    let err = sighash_error(index);
    let digest = match input_type {
        InputScriptType::P2sh | InputScriptType::P2shP2pk => {
            let script = input
                .redeem_script
                .as_ref()
                .ok_or(SignError::MissingScript(index))?;
            cache
                .legacy_signature_hash(index, script, EcdsaSighashType::All.to_u32())
                .map_err(|e| err(e.to_string()))?
                .to_byte_array()
        }
        InputScriptType::P2shP2wsh | InputScriptType::P2wsh => {
            let script = input
                .witness_script
                .as_ref()
                .ok_or(SignError::MissingScript(index))?;
            let value = prevout.ok_or(SignError::MissingPrevout(index))?.value;
            cache
                .p2wsh_signature_hash(index, script, value, EcdsaSighashType::All)
                .map_err(|e| err(e.to_string()))?
                .to_byte_array()
        }
        other => {
            return Err(SignError::NotSignable {
                index,
                reason: format!("{:?} is not an ECDSA input", other),
            })
        }
    };
    Ok(Message::from_digest(digest))
}

fn tap_script_message(
    cache: &mut SighashCache<&Transaction>,
    prevouts: &[TxOut],
    index: usize,
    leaf_hash: TapLeafHash,
) -> Result<Message, SignError> {
    let sighash = cache
        .taproot_script_spend_signature_hash(
            index,
            &Prevouts::All(prevouts),
            leaf_hash,
            TapSighashType::Default,
        )
        .map_err(|e| sighash_error(index)(e.to_string()))?;
    Ok(Message::from_digest(sighash.to_byte_array()))
}

fn tap_key_message(
    cache: &mut SighashCache<&Transaction>,
    prevouts: &[TxOut],
    index: usize,
) -> Result<Message, SignError> {
    let sighash = cache
        .taproot_key_spend_signature_hash(index, &Prevouts::All(prevouts), TapSighashType::Default)
        .map_err(|e| sighash_error(index)(e.to_string()))?;
    Ok(Message::from_digest(sighash.to_byte_array()))
}

fn all_prevouts(psbt: &Psbt) -> Result<Vec<TxOut>, SignError> {
    (0..psbt.inputs.len())
        .map(|i| prevout(psbt, i).ok_or(SignError::MissingPrevout(i)))
        .collect()
}

// ─── Signing ────────────────────────────────────────────────────────────────

/// Add `signer`'s signature to input `index`. Returns `false` when the input
/// has no key of this signer on its spend path.
pub fn sign_input(
    psbt: &mut Psbt,
    index: usize,
    signer: &WalletSigner,
) -> Result<bool, SignError> {
    let input = psbt.inputs.get(index).ok_or(SignError::InputOutOfRange(index))?;
    if is_finalized(input) {
        return Ok(false);
    }
    let input_type =
        classify_psbt_input(input).map_err(|source| SignError::Classify { index, source })?;
    let fingerprint = signer.fingerprint();
    let secp = Secp256k1::new();
    let tx = psbt.unsigned_tx.clone();
    let mut cache = SighashCache::new(&tx);

    match input_type {
        InputScriptType::P2trKeypath => Ok(false),
        InputScriptType::P2trScriptPathLevel1 | InputScriptType::P2trScriptPathLevel2 => {
            let origins: Vec<(XOnlyPublicKey, Vec<TapLeafHash>, DerivationPath)> = input
                .tap_key_origins
                .iter()
                .filter(|(_, (leaves, (fp, _)))| *fp == fingerprint && !leaves.is_empty())
                .map(|(key, (leaves, (_, path)))| (*key, leaves.clone(), path.clone()))
                .collect();
            if origins.is_empty() {
                return Ok(false);
            }
            let prevouts = all_prevouts(psbt)?;
            let mut signatures = Vec::new();
            for (xonly, leaves, path) in origins {
                let (sk, pk) = signer.derive_at(&path)?;
                if pk.x_only_public_key().0 != xonly {
                    return Err(SignError::KeyMismatch { index, path });
                }
                let keypair = Keypair::from_secret_key(&secp, &sk);
                for leaf_hash in leaves {
                    if psbt.inputs[index].tap_script_sigs.contains_key(&(xonly, leaf_hash)) {
                        return Err(SignError::AlreadySigned {
                            index,
                            role: signer.role(),
                        });
                    }
                    let msg = tap_script_message(&mut cache, &prevouts, index, leaf_hash)?;
                    let signature = taproot::Signature {
                        signature: secp.sign_schnorr(&msg, &keypair),
                        sighash_type: TapSighashType::Default,
                    };
                    signatures.push(((xonly, leaf_hash), signature));
                }
            }
            psbt.inputs[index].tap_script_sigs.extend(signatures);
            Ok(true)
        }
        _ => {
            let origins: Vec<(PublicKey, DerivationPath)> = input
                .bip32_derivation
                .iter()
                .filter(|(_, (fp, _))| *fp == fingerprint)
                .map(|(pk, (_, path))| (*pk, path.clone()))
                .collect();
            if origins.is_empty() {
                return Ok(false);
            }
            let utxo = prevout(psbt, index);
            let msg = ecdsa_message(&mut cache, input, index, input_type, utxo.as_ref())?;
            let mut signatures = Vec::new();
            for (expected, path) in origins {
                let (sk, pk) = signer.derive_at(&path)?;
                if pk != expected {
                    return Err(SignError::KeyMismatch { index, path });
                }
                let key = bitcoin::PublicKey::new(pk);
                if psbt.inputs[index].partial_sigs.contains_key(&key) {
                    return Err(SignError::AlreadySigned {
                        index,
                        role: signer.role(),
                    });
                }
                let signature = ecdsa::Signature {
                    signature: secp.sign_ecdsa(&msg, &sk),
                    sighash_type: EcdsaSighashType::All,
                };
                signatures.push((key, signature));
            }
            psbt.inputs[index].partial_sigs.extend(signatures);
            Ok(true)
        }
    }
}

fn pushes_key(script: &Script, key: &[u8]) -> bool {
    script
        .instructions()
        .any(|i| matches!(i, Ok(Instruction::PushBytes(bytes)) if bytes.as_bytes() == key))
}

/// Sign input `index` with each of `keys` wherever the key appears in the
/// input's tap leaves, witness script or redeem script. Key origins on the
/// input are not consulted. Returns the number of signatures added.
pub fn sign_input_with_keys(
    psbt: &mut Psbt,
    index: usize,
    role: KeyRole,
    keys: &[SecretKey],
) -> Result<usize, SignError> {
    let input = psbt.inputs.get(index).ok_or(SignError::InputOutOfRange(index))?;
    if is_finalized(input) {
        return Ok(0);
    }
    let secp = Secp256k1::new();
    let tx = psbt.unsigned_tx.clone();
    let mut cache = SighashCache::new(&tx);

    if !input.tap_scripts.is_empty() {
        let leaves: Vec<_> = input.tap_scripts.values().cloned().collect();
        let prevouts = all_prevouts(psbt)?;
        let mut signatures = Vec::new();
        for sk in keys {
            let keypair = Keypair::from_secret_key(&secp, sk);
            let (xonly, _) = keypair.x_only_public_key();
            for (script, version) in &leaves {
                if !pushes_key(script, &xonly.serialize()) {
                    continue;
                }
                let leaf_hash = TapLeafHash::from_script(script, *version);
                if psbt.inputs[index].tap_script_sigs.contains_key(&(xonly, leaf_hash)) {
                    return Err(SignError::AlreadySigned { index, role });
                }
                if signatures.iter().any(|(k, _)| *k == (xonly, leaf_hash)) {
                    continue;
                }
                let msg = tap_script_message(&mut cache, &prevouts, index, leaf_hash)?;
                let signature = taproot::Signature {
                    signature: secp.sign_schnorr(&msg, &keypair),
                    sighash_type: TapSighashType::Default,
                };
                signatures.push(((xonly, leaf_hash), signature));
            }
        }
        let added = signatures.len();
        psbt.inputs[index].tap_script_sigs.extend(signatures);
        return Ok(added);
    }

    let (script, input_type) = match (&input.witness_script, &input.redeem_script) {
        (Some(ws), Some(_)) => (ws.clone(), InputScriptType::P2shP2wsh),
        (Some(ws), None) => (ws.clone(), InputScriptType::P2wsh),
        (None, Some(rs)) => (rs.clone(), InputScriptType::P2sh),
        (None, None) => return Err(SignError::MissingScript(index)),
    };
    let utxo = prevout(psbt, index);
    let msg = ecdsa_message(&mut cache, input, index, input_type, utxo.as_ref())?;
    let mut signatures: Vec<(bitcoin::PublicKey, ecdsa::Signature)> = Vec::new();
    for sk in keys {
        let key = bitcoin::PublicKey::new(sk.public_key(&secp));
        if !pushes_key(&script, &key.to_bytes()) || signatures.iter().any(|(k, _)| *k == key) {
            continue;
        }
        if psbt.inputs[index].partial_sigs.contains_key(&key) {
            return Err(SignError::AlreadySigned { index, role });
        }
        let signature = ecdsa::Signature {
            signature: secp.sign_ecdsa(&msg, sk),
            sighash_type: EcdsaSighashType::All,
        };
        signatures.push((key, signature));
    }
    let added = signatures.len();
    psbt.inputs[index].partial_sigs.extend(signatures);
    Ok(added)
}

/// Sign every input `signer` can sign. Existing signatures are kept.
pub fn sign_wallet_psbt(
    psbt: &mut Psbt,
    signer: &WalletSigner,
    root_keys: &RootWalletKeys,
) -> Result<SigningReport, SignError> {
    if !signer.belongs_to(root_keys) {
        return Err(KeyError::SignerMismatch(signer.role()).into());
    }
    let mut report = SigningReport::default();
    for index in 0..psbt.inputs.len() {
        if sign_input(psbt, index, signer)? {
            report.signed.push(index);
        } else {
            report.skipped.push(index);
        }
    }
    log::info!(
        "{} signed {} inputs, skipped {}",
        signer.role(),
        report.signed.len(),
        report.skipped.len()
    );
    Ok(report)
}

/// Key-origin entry of `signer` on a key-path input, derived and checked.
fn key_path_key(
    input: &psbt::Input,
    index: usize,
    signer: &WalletSigner,
) -> Result<(bitcoin::secp256k1::SecretKey, PublicKey), SignError> {
    let fingerprint = signer.fingerprint();
    let (xonly, path) = input
        .tap_key_origins
        .iter()
        .find(|(_, (_, (fp, _)))| *fp == fingerprint)
        .map(|(key, (_, (_, path)))| (*key, path.clone()))
        .ok_or_else(|| SignError::NotSignable {
            index,
            reason: format!("no {} key on the key path", signer.role()),
        })?;
    let (sk, pk) = signer.derive_at(&path)?;
    if pk.x_only_public_key().0 != xonly {
        return Err(SignError::KeyMismatch { index, path });
    }
    Ok((sk, pk))
}

/// Run both MuSig2 rounds locally for a p2trMusig2 key-path input and store
/// the aggregate signature in `tap_key_sig`.
pub fn sign_musig2_key_path(
    psbt: &mut Psbt,
    index: usize,
    user: &WalletSigner,
    bitgo: &WalletSigner,
    root_keys: &RootWalletKeys,
) -> Result<(), SignError> {
    for signer in [user, bitgo] {
        if !signer.belongs_to(root_keys) {
            return Err(KeyError::SignerMismatch(signer.role()).into());
        }
    }
    let input = psbt.inputs.get(index).ok_or(SignError::InputOutOfRange(index))?;
    let input_type =
        classify_psbt_input(input).map_err(|source| SignError::Classify { index, source })?;
    if input_type != InputScriptType::P2trKeypath {
        return Err(SignError::NotSignable {
            index,
            reason: format!("{:?} is not a key-path spend", input_type),
        });
    }
    if input.tap_key_sig.is_some() {
        return Err(SignError::AlreadySigned {
            index,
            role: KeyRole::User,
        });
    }

    let (user_sk, user_pk) = key_path_key(input, index, user)?;
    let (bitgo_sk, bitgo_pk) = key_path_key(input, index, bitgo)?;
    let ctx = musig::with_taproot_tweak(musig::key_agg(&[user_pk, bitgo_pk])?, input.tap_merkle_root)?;

    let prevouts = all_prevouts(psbt)?;
    let output_key = musig::tweaked_output_key(&ctx)?;
    if prevouts[index].script_pubkey.as_bytes().get(2..) != Some(&output_key.serialize()[..]) {
        return Err(SignError::NotSignable {
            index,
            reason: "aggregate key does not match the spent output".into(),
        });
    }

    let tx = psbt.unsigned_tx.clone();
    let mut cache = SighashCache::new(&tx);
    let message = cache
        .taproot_key_spend_signature_hash(index, &Prevouts::All(&prevouts), TapSighashType::Default)
        .map_err(|e| sighash_error(index)(e.to_string()))?
        .to_byte_array();

    let (user_secnonce, user_pubnonce) = musig::generate_nonce(&user_sk, &ctx, &message)?;
    let (bitgo_secnonce, bitgo_pubnonce) = musig::generate_nonce(&bitgo_sk, &ctx, &message)?;
    let agg_nonce = musig::aggregate_nonces(&[user_pubnonce, bitgo_pubnonce]);
    let user_partial = musig::partial_sign(&user_sk, user_secnonce, &ctx, &agg_nonce, &message)?;
    let bitgo_partial = musig::partial_sign(&bitgo_sk, bitgo_secnonce, &ctx, &agg_nonce, &message)?;
    let signature =
        musig::aggregate_signatures(&ctx, &agg_nonce, &[user_partial, bitgo_partial], &message)?;

    psbt.inputs[index].tap_key_sig = Some(taproot::Signature {
        signature,
        sighash_type: TapSighashType::Default,
    });
    log::debug!("input {}: musig2 key path signed", index);
    Ok(())
}

// ─── Validation ─────────────────────────────────────────────────────────────

/// Role whose root key derives to `key` at `path`, if any.
fn origin_role(
    root_keys: &RootWalletKeys,
    fingerprint: bitcoin::bip32::Fingerprint,
    path: &DerivationPath,
) -> Option<(KeyRole, PublicKey)> {
    let role = root_keys.role_of_fingerprint(fingerprint)?;
    let secp = Secp256k1::verification_only();
    let derived = root_keys.get(role).derive_pub(&secp, path).ok()?;
    Some((role, derived.public_key))
}

/// For each input, which of (user, backup, bitgo) contributed a valid signature.
pub fn signature_validation(
    psbt: &Psbt,
    root_keys: &RootWalletKeys,
) -> Result<Vec<Triple<bool>>, SignError> {
    let secp = Secp256k1::verification_only();
    let tx = psbt.unsigned_tx.clone();
    let mut cache = SighashCache::new(&tx);
    let prevouts = all_prevouts(psbt).ok();
    let mut results = Vec::with_capacity(psbt.inputs.len());

    for (index, input) in psbt.inputs.iter().enumerate() {
        let mut valid = [false; 3];
        let input_type =
            classify_psbt_input(input).map_err(|source| SignError::Classify { index, source })?;
        match input_type {
            InputScriptType::P2trKeypath => {
                if let (Some(sig), Some(prevouts)) = (&input.tap_key_sig, &prevouts) {
                    let msg = tap_key_message(&mut cache, prevouts, index)?;
                    let key = prevouts[index]
                        .script_pubkey
                        .as_bytes()
                        .get(2..)
                        .and_then(|b| XOnlyPublicKey::from_slice(b).ok());
                    if key.is_some_and(|k| secp.verify_schnorr(&sig.signature, &msg, &k).is_ok()) {
                        valid[KeyRole::User.index()] = true;
                        valid[KeyRole::Bitgo.index()] = true;
                    }
                }
            }
            InputScriptType::P2trScriptPathLevel1 | InputScriptType::P2trScriptPathLevel2 => {
                let Some(prevouts) = &prevouts else {
                    return Err(SignError::MissingPrevout(index));
                };
                for ((xonly, leaf_hash), sig) in &input.tap_script_sigs {
                    let Some((_, (fp, path))) = input.tap_key_origins.get(xonly) else {
                        continue;
                    };
                    let Some((role, derived)) = origin_role(root_keys, *fp, path) else {
                        continue;
                    };
                    if derived.x_only_public_key().0 != *xonly {
                        continue;
                    }
                    let msg = tap_script_message(&mut cache, prevouts, index, *leaf_hash)?;
                    if secp.verify_schnorr(&sig.signature, &msg, xonly).is_ok() {
                        valid[role.index()] = true;
                    }
                }
            }
            InputScriptType::P2shP2pk => {}
            _ => {
                let utxo = prevout(psbt, index);
                let msg = ecdsa_message(&mut cache, input, index, input_type, utxo.as_ref())?;
                for (key, sig) in &input.partial_sigs {
                    let Some((fp, path)) = input.bip32_derivation.get(&key.inner) else {
                        continue;
                    };
                    let Some((role, derived)) = origin_role(root_keys, *fp, path) else {
                        continue;
                    };
                    if derived == key.inner && secp.verify_ecdsa(&msg, &sig.signature, &key.inner).is_ok() {
                        valid[role.index()] = true;
                    }
                }
            }
        }
        results.push(valid);
    }
    Ok(results)
}
