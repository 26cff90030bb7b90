//! Spend-type detection for PSBT inputs and signed transaction inputs.
//!
//! Size estimation and signing both need to know how an input will be (or
//! was) spent. PSBT inputs are classified from their metadata; signed inputs
//! from the shape of their scriptSig and witness.

use bitcoin::psbt;
use bitcoin::script::Instruction;
use bitcoin::taproot::ControlBlock;
use bitcoin::{Script, TxIn, Witness};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scripts::{parse_multisig_script, parse_p2pk_script, TaprootSpend};

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("cannot determine spend type: {0}")]
    Unclassifiable(String),

    #[error("expected a single taproot leaf, found {0}")]
    MultipleLeaves(usize),

    #[error("control block of {0} bytes is not a level 1 or level 2 script path")]
    UnsupportedControlBlock(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InputScriptType {
    P2sh,
    P2shP2wsh,
    P2wsh,
    P2trKeypath,
    P2trScriptPathLevel1,
    P2trScriptPathLevel2,
    P2shP2pk,
}

impl InputScriptType {
    pub fn is_taproot(self) -> bool {
        matches!(
            self,
            InputScriptType::P2trKeypath
                | InputScriptType::P2trScriptPathLevel1
                | InputScriptType::P2trScriptPathLevel2
        )
    }

    /// ECDSA 2-of-3 multisig (p2sh, p2shP2wsh, p2wsh).
    pub fn is_multisig(self) -> bool {
        matches!(
            self,
            InputScriptType::P2sh | InputScriptType::P2shP2wsh | InputScriptType::P2wsh
        )
    }

    pub fn is_segwit(self) -> bool {
        !matches!(self, InputScriptType::P2sh | InputScriptType::P2shP2pk)
    }

    pub fn from_taproot_spend(spend: TaprootSpend) -> Self {
        match spend {
            TaprootSpend::KeyPath => InputScriptType::P2trKeypath,
            TaprootSpend::ScriptPathLevel1 => InputScriptType::P2trScriptPathLevel1,
            TaprootSpend::ScriptPathLevel2 => InputScriptType::P2trScriptPathLevel2,
        }
    }
}

fn script_path_from_control_block(len: usize) -> Result<InputScriptType, ClassifyError> {
    TaprootSpend::from_control_block_len(len)
        .map(InputScriptType::from_taproot_spend)
        .ok_or(ClassifyError::UnsupportedControlBlock(len))
}

/// Classify an unsigned or partially signed PSBT input.
pub fn classify_psbt_input(input: &psbt::Input) -> Result<InputScriptType, ClassifyError> {
    if !input.tap_scripts.is_empty() {
        if input.tap_scripts.len() > 1 {
            return Err(ClassifyError::MultipleLeaves(input.tap_scripts.len()));
        }
        if let Some(control_block) = input.tap_scripts.keys().next() {
            return script_path_from_control_block(control_block.serialize().len());
        }
    }
    if input.tap_internal_key.is_some() || input.tap_key_sig.is_some() {
        return Ok(InputScriptType::P2trKeypath);
    }
    if let Some(witness_script) = &input.witness_script {
        if parse_multisig_script(witness_script).is_none() {
            return Err(ClassifyError::Unclassifiable(
                "witness script is not 2-of-3 multisig".into(),
            ));
        }
        return Ok(if input.redeem_script.is_some() {
            InputScriptType::P2shP2wsh
        } else {
            InputScriptType::P2wsh
        });
    }
    if let Some(redeem_script) = &input.redeem_script {
        return classify_redeem_script(redeem_script);
    }

    let script_sig = input.final_script_sig.clone().unwrap_or_default();
    let witness = input.final_script_witness.clone().unwrap_or_default();
    if !script_sig.is_empty() || !witness.is_empty() {
        return classify_spend(&script_sig, &witness);
    }
    Err(ClassifyError::Unclassifiable(
        "input has no script metadata".into(),
    ))
}

fn classify_redeem_script(redeem_script: &Script) -> Result<InputScriptType, ClassifyError> {
    if parse_multisig_script(redeem_script).is_some() {
        Ok(InputScriptType::P2sh)
    } else if parse_p2pk_script(redeem_script).is_some() {
        Ok(InputScriptType::P2shP2pk)
    } else {
        Err(ClassifyError::Unclassifiable(format!(
            "unrecognized redeem script {}",
            redeem_script.to_hex_string()
        )))
    }
}

/// Classify a signed transaction input.
pub fn classify_tx_input(txin: &TxIn) -> Result<InputScriptType, ClassifyError> {
    classify_spend(&txin.script_sig, &txin.witness)
}

fn classify_spend(script_sig: &Script, witness: &Witness) -> Result<InputScriptType, ClassifyError> {
    if let Some(last) = witness.last() {
        if witness.len() == 1 && script_sig.is_empty() {
            return Ok(InputScriptType::P2trKeypath);
        }
        if ControlBlock::decode(last).is_ok() {
            return script_path_from_control_block(last.len());
        }
        if parse_multisig_script(Script::from_bytes(last)).is_some() {
            return Ok(if script_sig.is_empty() {
                InputScriptType::P2wsh
            } else {
                InputScriptType::P2shP2wsh
            });
        }
        return Err(ClassifyError::Unclassifiable(
            "unrecognized witness".into(),
        ));
    }

    let last_push = script_sig
        .instructions()
        .filter_map(|ins| match ins {
            Ok(Instruction::PushBytes(data)) => Some(data.as_bytes().to_vec()),
            _ => None,
        })
        .last()
        .ok_or_else(|| ClassifyError::Unclassifiable("empty scriptSig".into()))?;
    classify_redeem_script(Script::from_bytes(&last_push))
}
