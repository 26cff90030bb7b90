//! Turning fully signed PSBT inputs into final scripts and witnesses.

use std::collections::BTreeMap;

use bitcoin::opcodes::OP_0;
use bitcoin::psbt::{self, Psbt};
use bitcoin::script::{Builder, PushBytes};
use bitcoin::taproot::LeafVersion;
use bitcoin::{Script, TapLeafHash, Transaction, Witness};
use coldsig_core::classify::{classify_psbt_input, ClassifyError, InputScriptType};
use coldsig_core::scripts::{parse_multisig_script, parse_p2pk_script, parse_taproot_leaf_script};
use thiserror::Error;

use crate::encoding::tx_to_hex;
use crate::sign::{is_finalized, required_signatures};

#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("input {index}: {source}")]
    Classify {
        index: usize,
        #[source]
        source: ClassifyError,
    },

    #[error("input {index}: {have} of {need} signatures")]
    NotEnoughSignatures { index: usize, have: usize, need: usize },

    #[error("input {0}: spend script is missing or malformed")]
    BadScript(usize),

    #[error("input {0} is not finalized")]
    NotFinalized(usize),

    #[error("input {0} does not exist")]
    InputOutOfRange(usize),
}

fn push<'a>(index: usize, bytes: &'a [u8]) -> Result<&'a PushBytes, FinalizeError> {
    <&PushBytes>::try_from(bytes).map_err(|_| FinalizeError::BadScript(index))
}

/// Signatures of the multisig keys in script order, stopping at `need`.
fn ordered_ecdsa_signatures(
    input: &psbt::Input,
    index: usize,
    script: &Script,
    need: usize,
) -> Result<Vec<Vec<u8>>, FinalizeError> {
    let keys = parse_multisig_script(script).ok_or(FinalizeError::BadScript(index))?;
    let sigs: Vec<Vec<u8>> = keys
        .iter()
        .filter_map(|k| input.partial_sigs.get(&bitcoin::PublicKey::new(*k)))
        .map(|s| s.to_vec())
        .take(need)
        .collect();
    if sigs.len() < need {
        return Err(FinalizeError::NotEnoughSignatures {
            index,
            have: sigs.len(),
            need,
        });
    }
    Ok(sigs)
}

fn multisig_witness(sigs: Vec<Vec<u8>>, witness_script: &Script) -> Witness {
    let mut items = Vec::with_capacity(sigs.len() + 2);
    items.push(Vec::new());
    items.extend(sigs);
    items.push(witness_script.to_bytes());
    Witness::from_slice(&items)
}

fn tap_script_witness(input: &psbt::Input, index: usize) -> Result<Witness, FinalizeError> {
    let (control_block, (script, _)) = input
        .tap_scripts
        .iter()
        .next()
        .ok_or(FinalizeError::BadScript(index))?;
    let [a, b] = parse_taproot_leaf_script(script).ok_or(FinalizeError::BadScript(index))?;
    let leaf_hash = TapLeafHash::from_script(script, LeafVersion::TapScript);
    let sig = |key| input.tap_script_sigs.get(&(key, leaf_hash));
    match (sig(a), sig(b)) {
        // the stack is consumed top first, so b's signature goes deepest
        (Some(sig_a), Some(sig_b)) => Ok(Witness::from_slice(&[
            sig_b.to_vec(),
            sig_a.to_vec(),
            script.to_bytes(),
            control_block.serialize(),
        ])),
        (a, b) => Err(FinalizeError::NotEnoughSignatures {
            index,
            have: usize::from(a.is_some()) + usize::from(b.is_some()),
            need: 2,
        }),
    }
}

/// Drop everything but the UTXO data and final fields.
fn clear_signing_data(input: &mut psbt::Input) {
    input.partial_sigs = BTreeMap::new();
    input.sighash_type = None;
    input.redeem_script = None;
    input.witness_script = None;
    input.bip32_derivation = BTreeMap::new();
    input.tap_key_sig = None;
    input.tap_script_sigs = BTreeMap::new();
    input.tap_scripts = BTreeMap::new();
    input.tap_key_origins = BTreeMap::new();
    input.tap_internal_key = None;
    input.tap_merkle_root = None;
}

pub fn finalize_input(psbt: &mut Psbt, index: usize) -> Result<(), FinalizeError> {
    let input = psbt
        .inputs
        .get(index)
        .ok_or(FinalizeError::InputOutOfRange(index))?;
    if is_finalized(input) {
        return Ok(());
    }
    let input_type =
        classify_psbt_input(input).map_err(|source| FinalizeError::Classify { index, source })?;
    let need = required_signatures(input_type);

    let mut script_sig = None;
    let mut witness = None;
    match input_type {
        InputScriptType::P2sh => {
            let redeem = input.redeem_script.as_ref().ok_or(FinalizeError::BadScript(index))?;
            let sigs = ordered_ecdsa_signatures(input, index, redeem, need)?;
            let mut builder = Builder::new().push_opcode(OP_0);
            for sig in &sigs {
                builder = builder.push_slice(push(index, sig)?);
            }
            script_sig = Some(builder.push_slice(push(index, redeem.as_bytes())?).into_script());
        }
        InputScriptType::P2shP2wsh | InputScriptType::P2wsh => {
            let witness_script =
                input.witness_script.as_ref().ok_or(FinalizeError::BadScript(index))?;
            let sigs = ordered_ecdsa_signatures(input, index, witness_script, need)?;
            witness = Some(multisig_witness(sigs, witness_script));
            if input_type == InputScriptType::P2shP2wsh {
                let redeem = input.redeem_script.as_ref().ok_or(FinalizeError::BadScript(index))?;
                script_sig = Some(
                    Builder::new()
                        .push_slice(push(index, redeem.as_bytes())?)
                        .into_script(),
                );
            }
        }
        InputScriptType::P2shP2pk => {
            let redeem = input.redeem_script.as_ref().ok_or(FinalizeError::BadScript(index))?;
            let key = parse_p2pk_script(redeem).ok_or(FinalizeError::BadScript(index))?;
            let sig = input
                .partial_sigs
                .get(&bitcoin::PublicKey::new(key))
                .ok_or(FinalizeError::NotEnoughSignatures { index, have: 0, need })?
                .to_vec();
            script_sig = Some(
                Builder::new()
                    .push_slice(push(index, &sig)?)
                    .push_slice(push(index, redeem.as_bytes())?)
                    .into_script(),
            );
        }
        InputScriptType::P2trKeypath => {
            let sig = input
                .tap_key_sig
                .ok_or(FinalizeError::NotEnoughSignatures { index, have: 0, need })?;
            witness = Some(Witness::from_slice(&[sig.to_vec()]));
        }
        InputScriptType::P2trScriptPathLevel1 | InputScriptType::P2trScriptPathLevel2 => {
            witness = Some(tap_script_witness(input, index)?);
        }
    }

    let input = &mut psbt.inputs[index];
    clear_signing_data(input);
    input.final_script_sig = script_sig;
    input.final_script_witness = witness;
    log::debug!("input {}: finalized {:?}", index, input_type);
    Ok(())
}

pub fn finalize_wallet_psbt(psbt: &mut Psbt) -> Result<(), FinalizeError> {
    for index in 0..psbt.inputs.len() {
        finalize_input(psbt, index)?;
    }
    Ok(())
}

/// Network transaction from a finalized PSBT.
pub fn extract_transaction(psbt: &Psbt) -> Result<Transaction, FinalizeError> {
    if let Some(index) = psbt.inputs.iter().position(|i| !is_finalized(i)) {
        return Err(FinalizeError::NotFinalized(index));
    }
    Ok(psbt.clone().extract_tx_unchecked_fee_rate())
}

/// Consensus-encoded hex ready for broadcast.
pub fn to_broadcast_format(psbt: &Psbt) -> Result<String, FinalizeError> {
    Ok(tx_to_hex(&extract_transaction(psbt)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{build_wallet_psbt, PsbtState, WalletPsbt};
    use crate::policy::FeePolicy;
    use crate::sign::{sign_musig2_key_path, sign_wallet_psbt};
    use crate::test_support::{simple_request, unspent_of_type, unspent_on_chain};
    use coldsig_core::classify::classify_tx_input;
    use coldsig_core::test_utils::{test_root_keys, test_signer};
    use coldsig_core::{Coin, KeyRole, ScriptType2Of3};
    use coldsig_dimensions::{Dimensions, VirtualSizes};

    fn signed(unspents: Vec<crate::unspent::Unspent>, cosigner: KeyRole) -> Psbt {
        let mut psbt = build_wallet_psbt(&simple_request(unspents), &FeePolicy::default())
            .unwrap()
            .psbt
            .into_psbt();
        let keys = test_root_keys();
        sign_wallet_psbt(&mut psbt, &test_signer(KeyRole::User), &keys).unwrap();
        sign_wallet_psbt(&mut psbt, &test_signer(cosigner), &keys).unwrap();
        psbt
    }

    #[test]
    fn test_finalize_and_extract_all_types() {
        let mut psbt = signed(
            vec![
                unspent_on_chain(1, 0, 0, 100_000),
                unspent_on_chain(10, 1, 1, 100_000),
                unspent_on_chain(20, 2, 2, 100_000),
                unspent_on_chain(30, 3, 3, 100_000),
            ],
            KeyRole::Bitgo,
        );
        finalize_wallet_psbt(&mut psbt).unwrap();
        for input in &psbt.inputs {
            assert!(input.partial_sigs.is_empty());
            assert!(input.tap_script_sigs.is_empty());
            assert!(input.bip32_derivation.is_empty());
        }
        let tx = extract_transaction(&psbt).unwrap();
        let types: Vec<_> = tx.input.iter().map(|i| classify_tx_input(i).unwrap()).collect();
        assert_eq!(
            types,
            vec![
                InputScriptType::P2sh,
                InputScriptType::P2shP2wsh,
                InputScriptType::P2wsh,
                InputScriptType::P2trScriptPathLevel1,
            ]
        );
        // the size model never undercounts the real transaction
        let estimated = Dimensions::from_transaction(&tx).unwrap().get_vsize();
        assert!(estimated >= tx.vsize());
        assert!(to_broadcast_format(&psbt).unwrap().starts_with("02000000"));
    }

    #[test]
    fn test_state_reaches_exported_once_every_input_is_final() {
        let mut psbt = signed(
            vec![unspent_on_chain(20, 0, 0, 100_000), unspent_on_chain(30, 1, 1, 100_000)],
            KeyRole::Bitgo,
        );
        let state = |psbt: &Psbt| WalletPsbt::from_psbt(psbt.clone(), Coin::Tbtc.params()).state();
        assert_eq!(state(&psbt), PsbtState::FullySigned);

        finalize_input(&mut psbt, 0).unwrap();
        assert_eq!(state(&psbt), PsbtState::FullySigned);
        assert!(matches!(to_broadcast_format(&psbt), Err(FinalizeError::NotFinalized(1))));

        finalize_input(&mut psbt, 1).unwrap();
        assert_eq!(state(&psbt), PsbtState::Exported);
        assert!(to_broadcast_format(&psbt).is_ok());
    }

    #[test]
    fn test_witness_layout() {
        let mut psbt = signed(vec![unspent_on_chain(21, 0, 0, 100_000)], KeyRole::Backup);
        finalize_wallet_psbt(&mut psbt).unwrap();
        let witness = psbt.inputs[0].final_script_witness.as_ref().unwrap();
        assert_eq!(witness.len(), 4);
        assert!(witness.nth(0).unwrap().is_empty());
        assert!(parse_multisig_script(Script::from_bytes(witness.nth(3).unwrap())).is_some());

        let mut psbt = signed(vec![unspent_on_chain(30, 0, 0, 100_000)], KeyRole::Bitgo);
        finalize_wallet_psbt(&mut psbt).unwrap();
        let witness = psbt.inputs[0].final_script_witness.as_ref().unwrap();
        assert_eq!(witness.len(), 4);
        assert_eq!(witness.nth(0).unwrap().len(), 64);
        assert_eq!(witness.nth(3).unwrap().len(), 65);
    }

    #[test]
    fn test_musig2_key_path_witness() {
        let mut psbt = build_wallet_psbt(
            &simple_request(vec![unspent_of_type(30, 1, 0, 100_000, ScriptType2Of3::P2trMusig2)]),
            &FeePolicy::default(),
        )
        .unwrap()
        .psbt
        .into_psbt();
        let keys = test_root_keys();
        sign_musig2_key_path(
            &mut psbt,
            0,
            &test_signer(KeyRole::User),
            &test_signer(KeyRole::Bitgo),
            &keys,
        )
        .unwrap();
        finalize_wallet_psbt(&mut psbt).unwrap();
        let tx = extract_transaction(&psbt).unwrap();
        assert_eq!(tx.input[0].witness.len(), 1);
        let estimated = Dimensions::from_transaction(&tx).unwrap();
        assert_eq!(estimated.get_inputs_vsize(), VirtualSizes::TX_P2TR_KEYPATH_INPUT_SIZE);
        assert!(estimated.get_vsize() >= tx.vsize());
    }

    #[test]
    fn test_half_signed_cannot_finalize() {
        let mut psbt = build_wallet_psbt(
            &simple_request(vec![unspent_on_chain(20, 0, 0, 100_000)]),
            &FeePolicy::default(),
        )
        .unwrap()
        .psbt
        .into_psbt();
        sign_wallet_psbt(&mut psbt, &test_signer(KeyRole::User), &test_root_keys()).unwrap();
        assert!(matches!(
            finalize_wallet_psbt(&mut psbt),
            Err(FinalizeError::NotEnoughSignatures { index: 0, have: 1, need: 2 })
        ));
        assert!(matches!(extract_transaction(&psbt), Err(FinalizeError::NotFinalized(0))));
    }
}
