//! Half-signed legacy transactions.
//!
//! Before PSBTs, half-signed multisig spends travelled as plain transactions
//! whose input scripts hold all three signature slots, with an empty push in
//! place of each missing signature:
//!
//! ```text
//! p2sh       scriptSig  OP_0 <slot user> <slot backup> <slot bitgo> <redeemScript>
//! p2shP2wsh  scriptSig  <redeemScript>
//!            witness    [] <slot user> <slot backup> <slot bitgo> <witnessScript>
//! p2wsh      witness    [] <slot user> <slot backup> <slot bitgo> <witnessScript>
//! ```
//!
//! Only 2-of-3 multisig inputs have a legacy form.

use bitcoin::ecdsa;
use bitcoin::opcodes::OP_0;
use bitcoin::psbt::Psbt;
use bitcoin::script::{Builder, Instruction, PushBytes};
use bitcoin::secp256k1::Secp256k1;
use bitcoin::sighash::SighashCache;
use bitcoin::{Script, Transaction, Witness};
use coldsig_core::classify::{classify_psbt_input, ClassifyError, InputScriptType};
use coldsig_core::scripts::parse_multisig_script;
use coldsig_core::{KeyRole, NetworkParams, RootWalletKeys};
use thiserror::Error;

use crate::builder::{prevout, BuildError, InputOptions, WalletPsbt};
use crate::sign::{ecdsa_message, SignError};
use crate::unspent::{format_id, WalletUnspent};

#[derive(Debug, Error)]
pub enum LegacyError {
    #[error("input {index}: {source}")]
    Classify {
        index: usize,
        #[source]
        source: ClassifyError,
    },

    #[error("input {index}: {input_type:?} has no legacy half-signed form")]
    UnsupportedInput {
        index: usize,
        input_type: InputScriptType,
    },

    #[error("input {index}: expected exactly one signature, found {found}")]
    NotHalfSigned { index: usize, found: usize },

    #[error("input {0}: malformed signature slots")]
    MalformedSlots(usize),

    #[error("input {index}: bad signature in the {role} slot: {reason}")]
    InvalidSignature {
        index: usize,
        role: KeyRole,
        reason: String,
    },

    #[error("transaction has {inputs} inputs but {unspents} unspents were given")]
    UnspentCount { inputs: usize, unspents: usize },

    #[error("input {index} spends {actual}, expected {expected}")]
    OutpointMismatch {
        index: usize,
        expected: String,
        actual: String,
    },

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Sign(#[from] SignError),
}

fn push(index: usize, bytes: &[u8]) -> Result<&PushBytes, LegacyError> {
    <&PushBytes>::try_from(bytes).map_err(|_| LegacyError::MalformedSlots(index))
}

/// Convert a PSBT with one signature per input into a half-signed legacy transaction.
pub fn extract_half_signed_legacy_tx(psbt: &Psbt) -> Result<Transaction, LegacyError> {
    let mut tx = psbt.unsigned_tx.clone();
    for (index, input) in psbt.inputs.iter().enumerate() {
        let input_type =
            classify_psbt_input(input).map_err(|source| LegacyError::Classify { index, source })?;
        let script = match input_type {
            InputScriptType::P2sh => input.redeem_script.as_ref(),
            InputScriptType::P2shP2wsh | InputScriptType::P2wsh => input.witness_script.as_ref(),
            other => {
                return Err(LegacyError::UnsupportedInput {
                    index,
                    input_type: other,
                })
            }
        }
        .ok_or(LegacyError::MalformedSlots(index))?;

        if input.partial_sigs.len() != 1 {
            return Err(LegacyError::NotHalfSigned {
                index,
                found: input.partial_sigs.len(),
            });
        }
        let keys = parse_multisig_script(script).ok_or(LegacyError::MalformedSlots(index))?;
        let slots: Vec<Vec<u8>> = keys
            .iter()
            .map(|k| {
                input
                    .partial_sigs
                    .get(&bitcoin::PublicKey::new(*k))
                    .map(|s| s.to_vec())
                    .unwrap_or_default()
            })
            .collect();

        match input_type {
            InputScriptType::P2sh => {
                let mut builder = Builder::new().push_opcode(OP_0);
                for slot in &slots {
                    builder = builder.push_slice(push(index, slot)?);
                }
                tx.input[index].script_sig =
                    builder.push_slice(push(index, script.as_bytes())?).into_script();
            }
            _ => {
                let mut items = vec![Vec::new()];
                items.extend(slots);
                items.push(script.to_bytes());
                tx.input[index].witness = Witness::from_slice(&items);
                if input_type == InputScriptType::P2shP2wsh {
                    let redeem = input
                        .redeem_script
                        .as_ref()
                        .ok_or(LegacyError::MalformedSlots(index))?;
                    tx.input[index].script_sig = Builder::new()
                        .push_slice(push(index, redeem.as_bytes())?)
                        .into_script();
                }
            }
        }
    }
    Ok(tx)
}

/// The three signature slots of a legacy input, in key order.
fn read_slots(tx: &Transaction, index: usize) -> Result<[Vec<u8>; 3], LegacyError> {
    let txin = &tx.input[index];
    let items: Vec<Vec<u8>> = if txin.witness.is_empty() {
        txin.script_sig
            .instructions()
            .map(|ins| match ins {
                Ok(Instruction::PushBytes(data)) => Ok(data.as_bytes().to_vec()),
                _ => Err(LegacyError::MalformedSlots(index)),
            })
            .collect::<Result<_, _>>()?
    } else {
        txin.witness.iter().map(<[u8]>::to_vec).collect()
    };
    match items.as_slice() {
        [first, user, backup, bitgo, _script] if first.is_empty() => {
            Ok([user.clone(), backup.clone(), bitgo.clone()])
        }
        _ => Err(LegacyError::MalformedSlots(index)),
    }
}

/// Rebuild a PSBT from a half-signed legacy transaction and the unspents it
/// spends. Every restored signature is checked against the wallet key of its slot.
pub fn psbt_from_half_signed_legacy_tx(
    tx: &Transaction,
    unspents: &[WalletUnspent],
    root_keys: &RootWalletKeys,
    network: &NetworkParams,
) -> Result<Psbt, LegacyError> {
    if tx.input.len() != unspents.len() {
        return Err(LegacyError::UnspentCount {
            inputs: tx.input.len(),
            unspents: unspents.len(),
        });
    }

    let mut wallet_psbt = WalletPsbt::new(root_keys, network)?;
    for (index, (txin, unspent)) in tx.input.iter().zip(unspents).enumerate() {
        if txin.previous_output != unspent.outpoint {
            return Err(LegacyError::OutpointMismatch {
                index,
                expected: unspent.id(),
                actual: format_id(&txin.previous_output),
            });
        }
        let options = InputOptions {
            skip_non_witness_utxo: unspent.prev_tx.is_none(),
            ..InputOptions::default()
        };
        wallet_psbt.add_wallet_input(unspent, root_keys, &options)?;
    }
    for output in &tx.output {
        wallet_psbt.add_output(output.script_pubkey.clone(), output.value);
    }

    let mut psbt = wallet_psbt.into_psbt();
    psbt.unsigned_tx.version = tx.version;
    psbt.unsigned_tx.lock_time = tx.lock_time;
    for (unsigned, txin) in psbt.unsigned_tx.input.iter_mut().zip(&tx.input) {
        unsigned.sequence = txin.sequence;
    }

    let secp = Secp256k1::verification_only();
    let unsigned = psbt.unsigned_tx.clone();
    let mut cache = SighashCache::new(&unsigned);
    for (index, unspent) in unspents.iter().enumerate() {
        let input_type = classify_psbt_input(&psbt.inputs[index])
            .map_err(|source| LegacyError::Classify { index, source })?;
        if !matches!(
            input_type,
            InputScriptType::P2sh | InputScriptType::P2shP2wsh | InputScriptType::P2wsh
        ) {
            return Err(LegacyError::UnsupportedInput { index, input_type });
        }
        let derived = root_keys
            .derive(unspent.chain, unspent.index)
            .map_err(BuildError::from)?;
        let utxo = prevout(&psbt, index);
        let msg = ecdsa_message(&mut cache, &psbt.inputs[index], index, input_type, utxo.as_ref())?;

        for (role, slot) in KeyRole::ALL.into_iter().zip(read_slots(tx, index)?) {
            if slot.is_empty() {
                continue;
            }
            let invalid = |reason: String| LegacyError::InvalidSignature { index, role, reason };
            let sig = ecdsa::Signature::from_slice(&slot).map_err(|e| invalid(e.to_string()))?;
            let pubkey = derived.public_key(role);
            secp.verify_ecdsa(&msg, &sig.signature, &pubkey)
                .map_err(|e| invalid(e.to_string()))?;
            psbt.inputs[index]
                .partial_sigs
                .insert(bitcoin::PublicKey::new(pubkey), sig);
        }
    }
    Ok(psbt)
}

/// Whether `script` is a legacy half-signed input script for a 2-of-3 wallet.
pub fn is_half_signed_script_sig(script: &Script) -> bool {
    let pushes: Vec<Vec<u8>> = script
        .instructions()
        .filter_map(|ins| match ins {
            Ok(Instruction::PushBytes(data)) => Some(data.as_bytes().to_vec()),
            _ => None,
        })
        .collect();
    matches!(pushes.as_slice(), [first, _, _, _, last]
        if first.is_empty() && parse_multisig_script(Script::from_bytes(last)).is_some())
}
