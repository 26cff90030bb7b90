//! Output descriptors of descriptor-based wallets.
//!
//! A wallet descriptor is either *derivable* (it has a `*` wildcard and needs
//! an index to produce a script) or *definite* (it already names one script).
//! Resolving a descriptor never guesses: a derivable descriptor without an
//! index and a definite descriptor with one are both errors.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use bitcoin::bip32::{ChildNumber, DerivationPath, KeySource, Xpub};
use bitcoin::key::XOnlyPublicKey;
use bitcoin::psbt;
use bitcoin::secp256k1::PublicKey;
use bitcoin::taproot::TapLeafHash;
use bitcoin::{Script, TxOut};
use miniscript::descriptor::{DefiniteDescriptorKey, DescriptorPublicKey};
use miniscript::psbt::PsbtInputExt;
use miniscript::{Descriptor, ForEachKey};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("invalid descriptor '{value}': {reason}")]
    Parse { value: String, reason: String },

    #[error("multipath descriptors are not supported: {0}")]
    Multipath(String),

    #[error("descriptor {0} has a wildcard and needs a derivation index")]
    IndexRequired(String),

    #[error("descriptor {descriptor} is definite and takes no derivation index (got {index})")]
    IndexNotAllowed { descriptor: String, index: u32 },

    #[error("cannot derive descriptor at index {index}: {reason}")]
    Derivation { index: u32, reason: String },

    #[error("descriptor uses untrusted key {0}")]
    UntrustedKey(String),

    #[error("cannot populate psbt input from descriptor: {0}")]
    PsbtInput(String),
}

// ─── Parsing ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletDescriptor {
    /// Has a wildcard; resolve with [`get_descriptor_at_index`].
    Derivable(Descriptor<DescriptorPublicKey>),
    Definite(Descriptor<DefiniteDescriptorKey>),
}

impl WalletDescriptor {
    pub fn parse(value: &str) -> Result<Self, DescriptorError> {
        let descriptor = Descriptor::<DescriptorPublicKey>::from_str(value.trim()).map_err(|e| {
            DescriptorError::Parse {
                value: value.chars().take(64).collect(),
                reason: e.to_string(),
            }
        })?;
        if descriptor.is_multipath() {
            return Err(DescriptorError::Multipath(descriptor.to_string()));
        }
        if descriptor.has_wildcard() {
            return Ok(WalletDescriptor::Derivable(descriptor));
        }
        // The index is ignored for keys without a wildcard.
        descriptor
            .at_derivation_index(0)
            .map(WalletDescriptor::Definite)
            .map_err(|e| DescriptorError::Derivation {
                index: 0,
                reason: e.to_string(),
            })
    }

    pub fn is_derivable(&self) -> bool {
        matches!(self, WalletDescriptor::Derivable(_))
    }
}

impl FromStr for WalletDescriptor {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for WalletDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalletDescriptor::Derivable(d) => d.fmt(f),
            WalletDescriptor::Definite(d) => d.fmt(f),
        }
    }
}

/// Resolve `descriptor` to a concrete script template.
///
/// Derivable descriptors require `index`; definite descriptors reject it.
pub fn get_descriptor_at_index(
    descriptor: &WalletDescriptor,
    index: Option<u32>,
) -> Result<Descriptor<DefiniteDescriptorKey>, DescriptorError> {
    match (descriptor, index) {
        (WalletDescriptor::Derivable(d), Some(index)) => {
            d.at_derivation_index(index)
                .map_err(|e| DescriptorError::Derivation {
                    index,
                    reason: e.to_string(),
                })
        }
        (WalletDescriptor::Derivable(d), None) => Err(DescriptorError::IndexRequired(d.to_string())),
        (WalletDescriptor::Definite(d), Some(index)) => Err(DescriptorError::IndexNotAllowed {
            descriptor: d.to_string(),
            index,
        }),
        (WalletDescriptor::Definite(d), None) => Ok(d.clone()),
    }
}

// ─── Keys ───────────────────────────────────────────────────────────────────

/// Same key material, ignoring the version bytes and parent metadata.
pub(crate) fn same_xpub(a: &Xpub, b: &Xpub) -> bool {
    a.public_key == b.public_key && a.chain_code == b.chain_code
}

fn is_trusted(key: &DescriptorPublicKey, trusted: &[Xpub]) -> bool {
    match key {
        DescriptorPublicKey::XPub(x) => trusted.iter().any(|t| same_xpub(t, &x.xkey)),
        DescriptorPublicKey::MultiXPub(x) => trusted.iter().any(|t| same_xpub(t, &x.xkey)),
        DescriptorPublicKey::Single(_) => false,
    }
}

/// Require every key of `descriptor` to be one of `trusted`.
pub fn assert_descriptor_keys(
    descriptor: &WalletDescriptor,
    trusted: &[Xpub],
) -> Result<(), DescriptorError> {
    let mut untrusted = None;
    let mut check = |key: &DescriptorPublicKey| {
        if is_trusted(key, trusted) {
            true
        } else {
            untrusted = Some(key.to_string());
            false
        }
    };
    let all_trusted = match descriptor {
        WalletDescriptor::Derivable(d) => d.for_each_key(|k| check(k)),
        WalletDescriptor::Definite(d) => d.for_each_key(|k| check(k.as_descriptor_public_key())),
    };
    match untrusted {
        Some(key) if !all_trusted => Err(DescriptorError::UntrustedKey(key)),
        _ => Ok(()),
    }
}

/// Paths below `xpub` at which the resolved `descriptor` uses that key.
pub fn key_paths(descriptor: &Descriptor<DefiniteDescriptorKey>, xpub: &Xpub) -> Vec<DerivationPath> {
    let mut paths: Vec<DerivationPath> = Vec::new();
    descriptor.for_each_key(|key| {
        if let DescriptorPublicKey::XPub(x) = key.as_descriptor_public_key() {
            if same_xpub(&x.xkey, xpub) && !paths.contains(&x.derivation_path) {
                paths.push(x.derivation_path.clone());
            }
        }
        true
    });
    paths
}

// ─── PSBT inputs ────────────────────────────────────────────────────────────

/// PSBT input spending `prevout`, which must pay to `descriptor`. Fills in
/// the redeem, witness or tap scripts and the key origins of every key.
pub fn descriptor_psbt_input(
    descriptor: &Descriptor<DefiniteDescriptorKey>,
    prevout: TxOut,
) -> Result<psbt::Input, DescriptorError> {
    if descriptor.script_pubkey() != prevout.script_pubkey {
        return Err(DescriptorError::PsbtInput(format!(
            "prevout script {} is not paid to by {}",
            prevout.script_pubkey.to_hex_string(),
            descriptor
        )));
    }
    let mut input = psbt::Input {
        witness_utxo: Some(prevout),
        ..Default::default()
    };
    input
        .update_with_descriptor_unchecked(descriptor)
        .map_err(|e| DescriptorError::PsbtInput(e.to_string()))?;
    Ok(input)
}

/// A descriptor that produces the script an input spends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorMatch {
    pub name: String,
    /// `None` for definite descriptors.
    pub index: Option<u32>,
    pub descriptor: Descriptor<DefiniteDescriptorKey>,
}

/// Origins of every key listed in an input or output's BIP-32 and taproot maps.
pub(crate) fn key_sources<'a>(
    bip32: &'a BTreeMap<PublicKey, KeySource>,
    tap: &'a BTreeMap<XOnlyPublicKey, (Vec<TapLeafHash>, KeySource)>,
) -> impl Iterator<Item = &'a KeySource> + 'a {
    bip32.values().chain(tap.values().map(|(_, source)| source))
}

/// Find the named descriptor producing `script_pubkey`. Derivable descriptors
/// are tried at the last index of each key origin path on the input.
pub fn find_matching_descriptor(
    input: &psbt::Input,
    script_pubkey: &Script,
    descriptors: &[(String, WalletDescriptor)],
) -> Result<Option<DescriptorMatch>, DescriptorError> {
    let candidates: BTreeSet<u32> = key_sources(&input.bip32_derivation, &input.tap_key_origins)
        .filter_map(|(_, path)| match path.as_ref().last() {
            Some(ChildNumber::Normal { index }) => Some(*index),
            _ => None,
        })
        .collect();
    for (name, descriptor) in descriptors {
        let indexes: Vec<Option<u32>> = if descriptor.is_derivable() {
            candidates.iter().copied().map(Some).collect()
        } else {
            vec![None]
        };
        for index in indexes {
            let resolved = get_descriptor_at_index(descriptor, index)?;
            if resolved.script_pubkey().as_script() == script_pubkey {
                log::debug!("input matches descriptor '{}' at {:?}", name, index);
                return Ok(Some(DescriptorMatch {
                    name: name.clone(),
                    index,
                    descriptor: resolved,
                }));
            }
        }
    }
    Ok(None)
}
