//! Verify a prebuild against the vault's own root key, then add the user
//! signature to every input.
//!
//! The prebuild comes from an online service that may be compromised. Before
//! any private key is used:
//!
//! 1. each claimed xpub must be the root key derived at its role's seed, and
//!    the user seed must be the vault's derivation id
//! 2. every wallet input and change output is re-derived from its key origin
//!    path and compared byte for byte with the script in the PSBT
//! 3. inputs without a wallet path must match one of the prebuild's
//!    descriptors, whose keys must in turn be the verified xpubs
//!
//! Any failure rejects the whole prebuild. Signing keys are then derived from
//! the verified chain and index, or from the matched descriptor, never from
//! the key origin paths the prebuild carries.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bitcoin::bip32::{KeySource, Xpriv, Xpub};
use bitcoin::key::XOnlyPublicKey;
use bitcoin::psbt::{self, Psbt};
use bitcoin::secp256k1::{PublicKey, Secp256k1};
use bitcoin::taproot::TapLeafHash;
use bitcoin::{Script, ScriptBuf, TxOut};
use coldsig_core::classify::{classify_psbt_input, ClassifyError, InputScriptType};
use coldsig_core::keys::{derive_key_with_seed, derive_xpub_with_seed};
use coldsig_core::scripts::{create_output_script_for_network, parse_p2pk_script};
use coldsig_core::{
    ChainCode, Coin, DerivedWalletKeys, KeyError, KeyRole, NetworkParams, RootWalletKeys,
    ScriptError, ScriptType2Of3, SpendableScript, WalletSigner,
};
use coldsig_psbt::encoding::{psbt_to_hex, tx_to_hex, EncodingError, TxFormat};
use coldsig_psbt::{
    extract_half_signed_legacy_tx, prevout, sign_input_with_keys, signature_count, LegacyError,
    SignError,
};
use miniscript::descriptor::DefiniteDescriptorKey;
use miniscript::Descriptor;
use thiserror::Error;

use crate::descriptor::{
    assert_descriptor_keys, descriptor_psbt_input, find_matching_descriptor, key_paths,
    key_sources, same_xpub, DescriptorError, WalletDescriptor,
};
use crate::prebuild::{SignedPrebuild, TransactionPrebuild, XpubsWithDerivationPath};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPart {
    Input,
    Output,
}

impl fmt::Display for TxPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TxPart::Input => "input",
            TxPart::Output => "output",
        })
    }
}

#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("prebuild carries no xpubs_with_derivation_path")]
    MissingXpubs,

    #[error("prebuild gives no derivation seed for the {0} key")]
    MissingSeed(KeyRole),

    #[error("derivation id mismatch: vault uses '{expected}', prebuild says '{actual}'")]
    DerivationIdMismatch { expected: String, actual: String },

    #[error("invalid {role} xpub '{value}': {reason}")]
    InvalidXpub {
        role: KeyRole,
        value: String,
        reason: String,
    },

    #[error("{role} xpub is not derived from the vault root key")]
    KeyMismatch { role: KeyRole },

    #[error("{first} and {second} xpubs are the same key")]
    DuplicateXpub { first: KeyRole, second: KeyRole },

    #[error("psbt embeds xpub {0} which is not a wallet key")]
    UnknownGlobalXpub(String),

    #[error("descriptor '{name}' is not built from the wallet keys: {source}")]
    DescriptorKeyMismatch {
        name: String,
        #[source]
        source: DescriptorError,
    },

    #[error("input {0} is not a wallet path and the prebuild carries no descriptors")]
    MissingDescriptors(usize),

    #[error("input {0} matches none of the prebuild's descriptors")]
    NoMatchingDescriptor(usize),

    #[error("{part} {index}: key origins disagree on chain and index")]
    IndexMismatch { part: TxPart, index: usize },

    #[error("{part} {index}: key origin {origin} is not the verified wallet key")]
    UnexpectedKeyOrigin {
        part: TxPart,
        index: usize,
        origin: String,
    },

    #[error("{part} {index}: script {actual} does not match derived {expected}")]
    ScriptMismatch {
        part: TxPart,
        index: usize,
        expected: String,
        actual: String,
    },

    #[error("input {0}: previous transaction does not match the outpoint")]
    PrevTxMismatch(usize),

    #[error("input {0} has no previous output")]
    MissingPrevout(usize),

    #[error("input {index} cannot be verified: {reason}")]
    UnverifiableInput { index: usize, reason: String },

    #[error("input {0} is a MuSig2 key-path spend, which the vault cannot half-sign")]
    KeyPathSpend(usize),

    #[error("input {index}: expected exactly one new signature, got {added}")]
    SignatureCount { index: usize, added: usize },

    #[error("input {index}: {source}")]
    Classify {
        index: usize,
        #[source]
        source: ClassifyError,
    },

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error(transparent)]
    Sign(#[from] SignError),

    #[error(transparent)]
    Legacy(#[from] LegacyError),
}

/// How a verified input is spent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifiedInput {
    Wallet {
        chain: ChainCode,
        index: u32,
        script_type: ScriptType2Of3,
    },
    Descriptor {
        name: String,
        index: Option<u32>,
        descriptor: Descriptor<DefiniteDescriptorKey>,
    },
    /// Left unsigned.
    ReplayProtection,
}

#[derive(Debug, Clone)]
pub struct VerifiedPrebuild {
    pub psbt: Psbt,
    pub root_keys: RootWalletKeys,
    pub inputs: Vec<VerifiedInput>,
    /// Outputs paying back to the wallet.
    pub wallet_outputs: Vec<usize>,
}

// ─── Keys ───────────────────────────────────────────────────────────────────

fn expected_root_keys(
    root: &Xpriv,
    derivation_id: &str,
    claimed: &XpubsWithDerivationPath,
) -> Result<RootWalletKeys, VerificationError> {
    let root_xpub = Xpub::from_priv(&Secp256k1::new(), root);
    let mut triple = Vec::with_capacity(3);
    for role in KeyRole::ALL {
        let entry = claimed.get(role);
        let seed = entry
            .derived_from_parent_with_seed
            .as_deref()
            .ok_or(VerificationError::MissingSeed(role))?;
        if role == KeyRole::User && seed != derivation_id {
            return Err(VerificationError::DerivationIdMismatch {
                expected: derivation_id.to_string(),
                actual: seed.to_string(),
            });
        }
        let xpub = Xpub::from_str(entry.xpub.trim()).map_err(|e| VerificationError::InvalidXpub {
            role,
            value: entry.xpub.clone(),
            reason: e.to_string(),
        })?;
        let expected = derive_xpub_with_seed(&root_xpub, seed)?;
        if !same_xpub(&xpub, &expected) {
            return Err(VerificationError::KeyMismatch { role });
        }
        triple.push(expected);
    }
    for (i, j) in [(0, 1), (0, 2), (1, 2)] {
        if same_xpub(&triple[i], &triple[j]) {
            return Err(VerificationError::DuplicateXpub {
                first: KeyRole::ALL[i],
                second: KeyRole::ALL[j],
            });
        }
    }
    Ok(RootWalletKeys::new([triple[0], triple[1], triple[2]]))
}

fn trusted_descriptors(
    prebuild: &TransactionPrebuild,
    root_keys: &RootWalletKeys,
) -> Result<Option<Vec<(String, WalletDescriptor)>>, VerificationError> {
    let Some(named) = &prebuild.descriptors else {
        return Ok(None);
    };
    let mut descriptors = Vec::with_capacity(named.len());
    for d in named {
        let parsed = WalletDescriptor::parse(&d.value)?;
        assert_descriptor_keys(&parsed, root_keys.triple()).map_err(|source| {
            VerificationError::DescriptorKeyMismatch {
                name: d.name.clone(),
                source,
            }
        })?;
        descriptors.push((d.name.clone(), parsed));
    }
    Ok(Some(descriptors))
}

// ─── Scripts ────────────────────────────────────────────────────────────────

/// The single `(chain, index)` claimed by the wallet-key origins, if any.
/// Once one origin names a wallet path, every origin under a wallet
/// fingerprint must name that same path.
fn wallet_claim<'a>(
    root_keys: &RootWalletKeys,
    sources: impl Iterator<Item = &'a KeySource>,
    part: TxPart,
    index: usize,
) -> Result<Option<(ChainCode, u32)>, VerificationError> {
    let mut claim = None;
    let mut stray = None;
    for (fingerprint, path) in sources {
        let Some(role) = root_keys.role_of_fingerprint(*fingerprint) else {
            continue;
        };
        match root_keys.parse_derivation_path(role, path) {
            None => {
                stray.get_or_insert(path);
            }
            Some(parsed) => match claim {
                None => claim = Some(parsed),
                Some(first) if first != parsed => {
                    return Err(VerificationError::IndexMismatch { part, index })
                }
                Some(_) => {}
            },
        }
    }
    match (claim, stray) {
        (Some(_), Some(path)) => Err(VerificationError::UnexpectedKeyOrigin {
            part,
            index,
            origin: path.to_string(),
        }),
        _ => Ok(claim),
    }
}

/// Keys recorded under a wallet fingerprint must be the derived ones.
fn check_wallet_origins(
    bip32: &BTreeMap<PublicKey, KeySource>,
    tap: &BTreeMap<XOnlyPublicKey, (Vec<TapLeafHash>, KeySource)>,
    root_keys: &RootWalletKeys,
    keys: &DerivedWalletKeys,
    part: TxPart,
    index: usize,
) -> Result<(), VerificationError> {
    let unexpected = |origin: &KeySource| VerificationError::UnexpectedKeyOrigin {
        part,
        index,
        origin: format!("[{}]{}", origin.0, origin.1),
    };
    for (key, origin) in bip32 {
        if let Some(role) = root_keys.role_of_fingerprint(origin.0) {
            if *key != keys.public_key(role) {
                return Err(unexpected(origin));
            }
        }
    }
    for (key, (_, origin)) in tap {
        if let Some(role) = root_keys.role_of_fingerprint(origin.0) {
            if *key != keys.public_key(role).x_only_public_key().0 {
                return Err(unexpected(origin));
            }
        }
    }
    Ok(())
}

fn hex_or_none(script: Option<&ScriptBuf>) -> String {
    script.map_or_else(|| "none".to_string(), |s| s.to_hex_string())
}

/// Re-derive the wallet script at the keys' `chain/index` that `actual`
/// claims to be. Taproot chains carry both p2tr and p2trMusig2 outputs.
fn derive_wallet_script(
    keys: &DerivedWalletKeys,
    network: &NetworkParams,
    actual: &Script,
    part: TxPart,
    index: usize,
) -> Result<SpendableScript, VerificationError> {
    let chain_type = keys.chain.script_type();
    let candidates: &[ScriptType2Of3] = if chain_type == ScriptType2Of3::P2tr {
        &[ScriptType2Of3::P2tr, ScriptType2Of3::P2trMusig2]
    } else {
        std::slice::from_ref(&chain_type)
    };
    let mut first = None;
    for script_type in candidates {
        let spendable =
            create_output_script_for_network(&keys.public_keys(), *script_type, network)?;
        if spendable.script_pubkey.as_script() == actual {
            return Ok(spendable);
        }
        first.get_or_insert(spendable.script_pubkey);
    }
    Err(VerificationError::ScriptMismatch {
        part,
        index,
        expected: hex_or_none(first.as_ref()),
        actual: actual.to_hex_string(),
    })
}

/// Redeem and witness scripts, when given, must be the derived ones.
fn check_script_fields(
    redeem_script: Option<&ScriptBuf>,
    witness_script: Option<&ScriptBuf>,
    spendable: &SpendableScript,
    part: TxPart,
    index: usize,
) -> Result<(), VerificationError> {
    let pairs = [
        (redeem_script, spendable.redeem_script.as_ref()),
        (witness_script, spendable.witness_script.as_ref()),
    ];
    for (given, derived) in pairs {
        if let Some(given) = given {
            if Some(given) != derived {
                return Err(VerificationError::ScriptMismatch {
                    part,
                    index,
                    expected: hex_or_none(derived),
                    actual: given.to_hex_string(),
                });
            }
        }
    }
    Ok(())
}

fn check_tap_leaves(
    input: &psbt::Input,
    spendable: &SpendableScript,
    index: usize,
) -> Result<(), VerificationError> {
    let leaves = spendable
        .taproot
        .as_ref()
        .map(|t| t.leaves.as_slice())
        .unwrap_or_default();
    for (script, _) in input.tap_scripts.values() {
        if !leaves.iter().any(|leaf| &leaf.script == script) {
            return Err(VerificationError::ScriptMismatch {
                part: TxPart::Input,
                index,
                expected: "a wallet tap leaf".to_string(),
                actual: script.to_hex_string(),
            });
        }
    }
    Ok(())
}

fn verify_replay_protection(
    input: &psbt::Input,
    utxo: &TxOut,
    network: &NetworkParams,
    index: usize,
) -> Result<(), VerificationError> {
    let unverifiable = |reason: &str| VerificationError::UnverifiableInput {
        index,
        reason: reason.to_string(),
    };
    let redeem = input
        .redeem_script
        .as_ref()
        .ok_or_else(|| unverifiable("p2shP2pk input without redeem script"))?;
    let key = parse_p2pk_script(redeem).ok_or_else(|| unverifiable("malformed p2pk script"))?;
    if !network
        .replay_protection_pubkeys()
        .iter()
        .any(|k| k.inner == key)
    {
        return Err(unverifiable("p2shP2pk key is not a replay protection key"));
    }
    if redeem.to_p2sh() != utxo.script_pubkey {
        return Err(VerificationError::ScriptMismatch {
            part: TxPart::Input,
            index,
            expected: redeem.to_p2sh().to_hex_string(),
            actual: utxo.script_pubkey.to_hex_string(),
        });
    }
    Ok(())
}

fn verify_input(
    psbt: &Psbt,
    index: usize,
    network: &NetworkParams,
    root_keys: &RootWalletKeys,
    descriptors: Option<&[(String, WalletDescriptor)]>,
) -> Result<VerifiedInput, VerificationError> {
    let input = &psbt.inputs[index];
    let utxo = prevout(psbt, index).ok_or(VerificationError::MissingPrevout(index))?;
    if let Some(tx) = &input.non_witness_utxo {
        let outpoint = psbt.unsigned_tx.input[index].previous_output;
        if tx.compute_txid() != outpoint.txid {
            return Err(VerificationError::PrevTxMismatch(index));
        }
        // witness_utxo must agree with the full previous transaction
        let spent = tx.output.get(outpoint.vout as usize);
        if spent.is_none() || input.witness_utxo.as_ref().is_some_and(|w| Some(w) != spent) {
            return Err(VerificationError::PrevTxMismatch(index));
        }
    }
    let sources: Vec<&KeySource> =
        key_sources(&input.bip32_derivation, &input.tap_key_origins).collect();
    if sources.is_empty() {
        return match classify(input, index)? {
            InputScriptType::P2shP2pk => {
                verify_replay_protection(input, &utxo, network, index)?;
                Ok(VerifiedInput::ReplayProtection)
            }
            InputScriptType::P2trKeypath => Err(VerificationError::KeyPathSpend(index)),
            _ => Err(VerificationError::UnverifiableInput {
                index,
                reason: "no key origins".to_string(),
            }),
        };
    }

    if let Some((chain, key_index)) =
        wallet_claim(root_keys, sources.into_iter(), TxPart::Input, index)?
    {
        if classify(input, index)? == InputScriptType::P2trKeypath {
            return Err(VerificationError::KeyPathSpend(index));
        }
        let keys = root_keys.derive(chain, key_index)?;
        let spendable =
            derive_wallet_script(&keys, network, &utxo.script_pubkey, TxPart::Input, index)?;
        check_wallet_origins(
            &input.bip32_derivation,
            &input.tap_key_origins,
            root_keys,
            &keys,
            TxPart::Input,
            index,
        )?;
        check_script_fields(
            input.redeem_script.as_ref(),
            input.witness_script.as_ref(),
            &spendable,
            TxPart::Input,
            index,
        )?;
        check_tap_leaves(input, &spendable, index)?;
        log::debug!("input {} is wallet {}/{}", index, chain, key_index);
        return Ok(VerifiedInput::Wallet {
            chain,
            index: key_index,
            script_type: spendable.script_type,
        });
    }

    // Descriptor inputs are checked against the descriptor alone; their
    // scripts need not be wallet multisig.
    let descriptors = descriptors.ok_or(VerificationError::MissingDescriptors(index))?;
    let found = find_matching_descriptor(input, &utxo.script_pubkey, descriptors)?
        .ok_or(VerificationError::NoMatchingDescriptor(index))?;
    let expected = descriptor_psbt_input(&found.descriptor, utxo)?;
    check_descriptor_input(input, &expected, index)?;
    Ok(VerifiedInput::Descriptor {
        name: found.name,
        index: found.index,
        descriptor: found.descriptor,
    })
}

fn classify(input: &psbt::Input, index: usize) -> Result<InputScriptType, VerificationError> {
    classify_psbt_input(input).map_err(|source| VerificationError::Classify { index, source })
}

/// Script fields present on a descriptor input must be the ones its matched
/// descriptor produces.
fn check_descriptor_input(
    input: &psbt::Input,
    expected: &psbt::Input,
    index: usize,
) -> Result<(), VerificationError> {
    let mismatch = |expected: String, actual: String| VerificationError::ScriptMismatch {
        part: TxPart::Input,
        index,
        expected,
        actual,
    };
    let pairs = [
        (&input.redeem_script, &expected.redeem_script),
        (&input.witness_script, &expected.witness_script),
    ];
    for (given, derived) in pairs {
        if let Some(given) = given {
            if Some(given) != derived.as_ref() {
                return Err(mismatch(hex_or_none(derived.as_ref()), given.to_hex_string()));
            }
        }
    }
    for (control_block, leaf) in &input.tap_scripts {
        if expected.tap_scripts.get(control_block) != Some(leaf) {
            return Err(mismatch(
                "a descriptor tap leaf".to_string(),
                leaf.0.to_hex_string(),
            ));
        }
    }
    if input.tap_internal_key.is_some() && input.tap_internal_key != expected.tap_internal_key {
        return Err(mismatch(
            "the descriptor internal key".to_string(),
            format!("{:?}", input.tap_internal_key),
        ));
    }
    Ok(())
}

/// Fill in script fields and key origins the prebuild left out.
fn complete_descriptor_input(input: &mut psbt::Input, expected: psbt::Input) {
    if input.redeem_script.is_none() {
        input.redeem_script = expected.redeem_script;
    }
    if input.witness_script.is_none() {
        input.witness_script = expected.witness_script;
    }
    if input.tap_scripts.is_empty() {
        input.tap_scripts = expected.tap_scripts;
    }
    if input.tap_internal_key.is_none() {
        input.tap_internal_key = expected.tap_internal_key;
        input.tap_merkle_root = expected.tap_merkle_root;
    }
    for (key, origin) in expected.bip32_derivation {
        input.bip32_derivation.entry(key).or_insert(origin);
    }
    for (key, origin) in expected.tap_key_origins {
        input.tap_key_origins.entry(key).or_insert(origin);
    }
}

/// Returns whether output `index` claims to pay back to the wallet. Outputs
/// without wallet key origins are external and taken as given.
fn verify_output(
    psbt: &Psbt,
    index: usize,
    network: &NetworkParams,
    root_keys: &RootWalletKeys,
) -> Result<bool, VerificationError> {
    let output = &psbt.outputs[index];
    let sources = key_sources(&output.bip32_derivation, &output.tap_key_origins);
    let Some((chain, key_index)) = wallet_claim(root_keys, sources, TxPart::Output, index)? else {
        return Ok(false);
    };
    let keys = root_keys.derive(chain, key_index)?;
    let spendable = derive_wallet_script(
        &keys,
        network,
        &psbt.unsigned_tx.output[index].script_pubkey,
        TxPart::Output,
        index,
    )?;
    check_wallet_origins(
        &output.bip32_derivation,
        &output.tap_key_origins,
        root_keys,
        &keys,
        TxPart::Output,
        index,
    )?;
    check_script_fields(
        output.redeem_script.as_ref(),
        output.witness_script.as_ref(),
        &spendable,
        TxPart::Output,
        index,
    )?;
    Ok(true)
}

// ─── Entry points ───────────────────────────────────────────────────────────

/// Check every key, input and wallet output of `prebuild` against `root`.
pub fn verify_prebuild(
    network: &NetworkParams,
    root: &Xpriv,
    derivation_id: &str,
    prebuild: &TransactionPrebuild,
) -> Result<VerifiedPrebuild, VerificationError> {
    let claimed = prebuild
        .xpubs_with_derivation_path
        .as_ref()
        .ok_or(VerificationError::MissingXpubs)?;
    let root_keys = expected_root_keys(root, derivation_id, claimed)?;
    let psbt = prebuild.psbt()?;

    for xpub in psbt.xpub.keys() {
        if !root_keys.triple().iter().any(|k| same_xpub(k, xpub)) {
            return Err(VerificationError::UnknownGlobalXpub(xpub.to_string()));
        }
    }
    let descriptors = trusted_descriptors(prebuild, &root_keys)?;

    let inputs = (0..psbt.inputs.len())
        .map(|index| verify_input(&psbt, index, network, &root_keys, descriptors.as_deref()))
        .collect::<Result<Vec<_>, _>>()?;
    let mut wallet_outputs = Vec::new();
    for index in 0..psbt.outputs.len() {
        if verify_output(&psbt, index, network, &root_keys)? {
            wallet_outputs.push(index);
        }
    }
    log::info!(
        "verified prebuild: {} inputs, {} of {} outputs to the wallet",
        inputs.len(),
        wallet_outputs.len(),
        psbt.outputs.len()
    );
    Ok(VerifiedPrebuild {
        psbt,
        root_keys,
        inputs,
        wallet_outputs,
    })
}

/// Verify `prebuild` and sign each of its inputs with the user key at
/// `derivation_id`. Replay-protection inputs are left unsigned.
///
/// Wallet inputs get exactly one signature, from the user key at the verified
/// `chain/index`. Descriptor inputs get one signature per place the user key
/// appears in the spend scripts.
pub fn create_half_signed(
    coin: Coin,
    root: &Xpriv,
    derivation_id: &str,
    prebuild: &TransactionPrebuild,
    format: TxFormat,
) -> Result<SignedPrebuild, VerificationError> {
    let verified = verify_prebuild(coin.params(), root, derivation_id, prebuild)
        .inspect_err(|e| log::warn!("rejected prebuild: {}", e))?;
    let user = WalletSigner::new(KeyRole::User, derive_key_with_seed(root, derivation_id)?);
    let root_keys = &verified.root_keys;

    let mut psbt = verified.psbt;
    let mut signatures_added = 0;
    for (index, input) in verified.inputs.iter().enumerate() {
        let keys = match input {
            VerifiedInput::ReplayProtection => continue,
            VerifiedInput::Wallet {
                chain,
                index: key_index,
                ..
            } => vec![user.derive_signing_key(root_keys, *chain, *key_index)?],
            VerifiedInput::Descriptor { descriptor, .. } => {
                let utxo = prevout(&psbt, index).ok_or(VerificationError::MissingPrevout(index))?;
                let expected = descriptor_psbt_input(descriptor, utxo)?;
                complete_descriptor_input(&mut psbt.inputs[index], expected);
                key_paths(descriptor, root_keys.user())
                    .iter()
                    .map(|path| user.derive_at(path).map(|(sk, _)| sk))
                    .collect::<Result<Vec<_>, _>>()?
            }
        };
        let before = signature_count(&psbt.inputs[index]);
        let added = sign_input_with_keys(&mut psbt, index, KeyRole::User, &keys)?;
        if added == 0 {
            return Err(VerificationError::UnverifiableInput {
                index,
                reason: "user key is not on the spend path".to_string(),
            });
        }
        let counted = signature_count(&psbt.inputs[index]).saturating_sub(before);
        let wallet = matches!(input, VerifiedInput::Wallet { .. });
        if counted != added || (wallet && added != 1) {
            return Err(VerificationError::SignatureCount {
                index,
                added: counted,
            });
        }
        signatures_added += added;
    }

    let tx_hex = match format {
        TxFormat::Psbt => psbt_to_hex(&psbt),
        TxFormat::Legacy => tx_to_hex(&extract_half_signed_legacy_tx(&psbt)?),
    };
    log::info!(
        "half-signed {} inputs for wallet {}",
        signatures_added,
        prebuild.wallet_id.as_deref().unwrap_or("-")
    );
    Ok(SignedPrebuild {
        wallet_id: prebuild.wallet_id.clone(),
        tx_hex,
        signatures_added,
    })
}
