//! # coldsig dimensions
//!
//! Worst-case virtual size accounting for wallet transactions.
//!
//! A [`Dimensions`] value counts inputs by spend type and sums output sizes.
//! Values are additive: the dimensions of a transaction are the sum of the
//! dimensions of its inputs and outputs, in any order. Input sizes are derived
//! from [`InputComponents`] using maximum-length signatures, so a signed
//! transaction is never larger than its estimate.

use std::iter::Sum;
use std::ops::{Add, AddAssign};

use bitcoin::psbt::{self, Psbt};
use bitcoin::{Amount, Script, Transaction, TxOut};
use coldsig_core::classify::{classify_psbt_input, classify_tx_input, ClassifyError, InputScriptType};
use coldsig_core::{ChainCode, ScriptType2Of3, TaprootSpend};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DimensionsError {
    #[error("input {index}: {source}")]
    Input {
        index: usize,
        #[source]
        source: ClassifyError,
    },

    #[error("{spend:?} is not a valid spend of a {script_type} output")]
    InvalidSpend {
        script_type: ScriptType2Of3,
        spend: TaprootSpend,
    },
}

// ─── Byte components ────────────────────────────────────────────────────────

/// DER ECDSA signature with low S (71 bytes max) plus the sighash byte.
pub const ECDSA_SIGNATURE_SIZE: usize = 72;
/// BIP-340 signature with the default sighash (no sighash byte).
pub const SCHNORR_SIGNATURE_SIZE: usize = 64;
/// `2 <33> <33> <33> 3 CHECKMULTISIG`
pub const P2MS_SCRIPT_SIZE: usize = 105;
/// `0 <32>`
pub const P2WSH_PROGRAM_SIZE: usize = 34;
/// `<33> CHECKSIG`
pub const P2PK_SCRIPT_SIZE: usize = 35;
/// `<32> CHECKSIGVERIFY <32> CHECKSIG`
pub const TAP_LEAF_SCRIPT_SIZE: usize = 68;
pub const CONTROL_BLOCK_LEVEL1_SIZE: usize = 33 + 32;
pub const CONTROL_BLOCK_LEVEL2_SIZE: usize = 33 + 32 * 2;

const fn compact_size(n: usize) -> usize {
    if n < 0xfd {
        1
    } else if n <= 0xffff {
        3
    } else if n <= 0xffff_ffff {
        5
    } else {
        9
    }
}

/// Serialized size of pushing `n` bytes with the minimal push opcode.
const fn push_size(n: usize) -> usize {
    let opcode = if n <= 75 {
        1
    } else if n <= 0xff {
        2
    } else if n <= 0xffff {
        3
    } else {
        5
    };
    opcode + n
}

/// Element sizes of an input's scriptSig pushes and witness stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputComponents {
    pub script: &'static [usize],
    pub witness: &'static [usize],
}

impl InputComponents {
    pub const fn script_sig_size(&self) -> usize {
        let mut size = 0;
        let mut i = 0;
        while i < self.script.len() {
            size += push_size(self.script[i]);
            i += 1;
        }
        size
    }

    pub const fn witness_size(&self) -> usize {
        if self.witness.is_empty() {
            return 0;
        }
        let mut size = compact_size(self.witness.len());
        let mut i = 0;
        while i < self.witness.len() {
            size += compact_size(self.witness[i]) + self.witness[i];
            i += 1;
        }
        size
    }

    /// Weight units: outpoint (36) + sequence (4) + scriptSig at 4x, witness at 1x.
    pub const fn weight(&self) -> usize {
        let script = self.script_sig_size();
        (36 + 4 + compact_size(script) + script) * 4 + self.witness_size()
    }

    pub const fn vsize(&self) -> usize {
        (self.weight() + 3) / 4
    }
}

pub const INPUT_COMPONENTS_P2SH: InputComponents = InputComponents {
    script: &[0, ECDSA_SIGNATURE_SIZE, ECDSA_SIGNATURE_SIZE, P2MS_SCRIPT_SIZE],
    witness: &[],
};

pub const INPUT_COMPONENTS_P2SH_P2WSH: InputComponents = InputComponents {
    script: &[P2WSH_PROGRAM_SIZE],
    witness: &[0, ECDSA_SIGNATURE_SIZE, ECDSA_SIGNATURE_SIZE, P2MS_SCRIPT_SIZE],
};

pub const INPUT_COMPONENTS_P2WSH: InputComponents = InputComponents {
    script: &[],
    witness: &[0, ECDSA_SIGNATURE_SIZE, ECDSA_SIGNATURE_SIZE, P2MS_SCRIPT_SIZE],
};

pub const INPUT_COMPONENTS_P2TR_KEYPATH: InputComponents = InputComponents {
    script: &[],
    witness: &[SCHNORR_SIGNATURE_SIZE],
};

pub const INPUT_COMPONENTS_P2TR_SCRIPT_PATH_LEVEL1: InputComponents = InputComponents {
    script: &[],
    witness: &[
        SCHNORR_SIGNATURE_SIZE,
        SCHNORR_SIGNATURE_SIZE,
        TAP_LEAF_SCRIPT_SIZE,
        CONTROL_BLOCK_LEVEL1_SIZE,
    ],
};

pub const INPUT_COMPONENTS_P2TR_SCRIPT_PATH_LEVEL2: InputComponents = InputComponents {
    script: &[],
    witness: &[
        SCHNORR_SIGNATURE_SIZE,
        SCHNORR_SIGNATURE_SIZE,
        TAP_LEAF_SCRIPT_SIZE,
        CONTROL_BLOCK_LEVEL2_SIZE,
    ],
};

pub const INPUT_COMPONENTS_P2SH_P2PK: InputComponents = InputComponents {
    script: &[ECDSA_SIGNATURE_SIZE, P2PK_SCRIPT_SIZE],
    witness: &[],
};

/// Virtual sizes in vbytes.
pub struct VirtualSizes;

impl VirtualSizes {
    pub const TX_P2SH_INPUT_SIZE: usize = INPUT_COMPONENTS_P2SH.vsize();
    pub const TX_P2SH_P2WSH_INPUT_SIZE: usize = INPUT_COMPONENTS_P2SH_P2WSH.vsize();
    pub const TX_P2WSH_INPUT_SIZE: usize = INPUT_COMPONENTS_P2WSH.vsize();
    pub const TX_P2TR_KEYPATH_INPUT_SIZE: usize = INPUT_COMPONENTS_P2TR_KEYPATH.vsize();
    pub const TX_P2TR_SCRIPT_PATH_LEVEL1_INPUT_SIZE: usize =
        INPUT_COMPONENTS_P2TR_SCRIPT_PATH_LEVEL1.vsize();
    pub const TX_P2TR_SCRIPT_PATH_LEVEL2_INPUT_SIZE: usize =
        INPUT_COMPONENTS_P2TR_SCRIPT_PATH_LEVEL2.vsize();
    pub const TX_P2SH_P2PK_INPUT_SIZE: usize = INPUT_COMPONENTS_P2SH_P2PK.vsize();

    pub const TX_OUTPUT_AMOUNT_SIZE: usize = 8;
    pub const TX_P2SH_OUTPUT_SIZE: usize = 32;
    pub const TX_P2SH_P2WSH_OUTPUT_SIZE: usize = 32;
    pub const TX_P2WSH_OUTPUT_SIZE: usize = 43;
    pub const TX_P2TR_OUTPUT_SIZE: usize = 43;
    pub const TX_P2PKH_OUTPUT_SIZE: usize = 34;
    pub const TX_P2WPKH_OUTPUT_SIZE: usize = 31;

    /// Version, locktime and input/output counts.
    pub const TX_OVERHEAD_SIZE: usize = 10;
    /// Overhead plus the segwit marker and flag (2 weight units, rounded up).
    pub const TX_SEGWIT_OVERHEAD_VSIZE: usize = 11;

    pub fn input_size(input_type: InputScriptType) -> usize {
        match input_type {
            InputScriptType::P2sh => Self::TX_P2SH_INPUT_SIZE,
            InputScriptType::P2shP2wsh => Self::TX_P2SH_P2WSH_INPUT_SIZE,
            InputScriptType::P2wsh => Self::TX_P2WSH_INPUT_SIZE,
            InputScriptType::P2trKeypath => Self::TX_P2TR_KEYPATH_INPUT_SIZE,
            InputScriptType::P2trScriptPathLevel1 => Self::TX_P2TR_SCRIPT_PATH_LEVEL1_INPUT_SIZE,
            InputScriptType::P2trScriptPathLevel2 => Self::TX_P2TR_SCRIPT_PATH_LEVEL2_INPUT_SIZE,
            InputScriptType::P2shP2pk => Self::TX_P2SH_P2PK_INPUT_SIZE,
        }
    }
}

/// Size of an output whose script is `script_len` bytes long.
pub fn output_size_from_script_length(script_len: usize) -> usize {
    script_len + compact_size(script_len) + VirtualSizes::TX_OUTPUT_AMOUNT_SIZE
}

/// `ceil(vsize * fee_rate / 1000)`
pub fn fee_for_vsize(vsize: usize, fee_rate_sat_per_kb: u64) -> Amount {
    let vsize = vsize as u64;
    Amount::from_sat((vsize * fee_rate_sat_per_kb).div_ceil(1000))
}

// ─── Dimensions ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct OutputDimensions {
    pub count: usize,
    /// Sum of output sizes in bytes.
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dimensions {
    pub n_p2sh_inputs: usize,
    pub n_p2sh_p2wsh_inputs: usize,
    pub n_p2wsh_inputs: usize,
    pub n_p2tr_keypath_inputs: usize,
    pub n_p2tr_script_path_level1_inputs: usize,
    pub n_p2tr_script_path_level2_inputs: usize,
    pub n_p2sh_p2pk_inputs: usize,
    pub outputs: OutputDimensions,
}

impl Dimensions {
    pub const ZERO: Dimensions = Dimensions {
        n_p2sh_inputs: 0,
        n_p2sh_p2wsh_inputs: 0,
        n_p2wsh_inputs: 0,
        n_p2tr_keypath_inputs: 0,
        n_p2tr_script_path_level1_inputs: 0,
        n_p2tr_script_path_level2_inputs: 0,
        n_p2sh_p2pk_inputs: 0,
        outputs: OutputDimensions { count: 0, size: 0 },
    };

    pub fn zero() -> Self {
        Self::ZERO
    }

    pub fn sum<I: IntoIterator<Item = Dimensions>>(items: I) -> Self {
        items.into_iter().fold(Self::ZERO, |acc, d| acc + d)
    }

    // ─── Inputs ───

    pub fn from_input_type(input_type: InputScriptType) -> Self {
        let mut d = Self::ZERO;
        match input_type {
            InputScriptType::P2sh => d.n_p2sh_inputs = 1,
            InputScriptType::P2shP2wsh => d.n_p2sh_p2wsh_inputs = 1,
            InputScriptType::P2wsh => d.n_p2wsh_inputs = 1,
            InputScriptType::P2trKeypath => d.n_p2tr_keypath_inputs = 1,
            InputScriptType::P2trScriptPathLevel1 => d.n_p2tr_script_path_level1_inputs = 1,
            InputScriptType::P2trScriptPathLevel2 => d.n_p2tr_script_path_level2_inputs = 1,
            InputScriptType::P2shP2pk => d.n_p2sh_p2pk_inputs = 1,
        }
        d
    }

    /// One input of `script_type`.
    ///
    /// `spend` selects the taproot spend path and is ignored otherwise. p2tr
    /// defaults to the level 1 script path and p2trMusig2 to the key path.
    /// p2trMusig2 has no level 2 leaves.
    pub fn from_script_type(
        script_type: ScriptType2Of3,
        spend: Option<TaprootSpend>,
    ) -> Result<Self, DimensionsError> {
        let input_type = match script_type {
            ScriptType2Of3::P2sh => InputScriptType::P2sh,
            ScriptType2Of3::P2shP2wsh => InputScriptType::P2shP2wsh,
            ScriptType2Of3::P2wsh => InputScriptType::P2wsh,
            ScriptType2Of3::P2tr => InputScriptType::from_taproot_spend(
                spend.unwrap_or(TaprootSpend::ScriptPathLevel1),
            ),
            ScriptType2Of3::P2trMusig2 => match spend.unwrap_or(TaprootSpend::KeyPath) {
                TaprootSpend::ScriptPathLevel2 => {
                    return Err(DimensionsError::InvalidSpend {
                        script_type,
                        spend: TaprootSpend::ScriptPathLevel2,
                    })
                }
                other => InputScriptType::from_taproot_spend(other),
            },
        };
        Ok(Self::from_input_type(input_type))
    }

    /// One wallet unspent on `chain`.
    pub fn from_unspent(chain: ChainCode, p2tr_spend: TaprootSpend) -> Self {
        let input_type = match chain.script_type() {
            ScriptType2Of3::P2sh => InputScriptType::P2sh,
            ScriptType2Of3::P2shP2wsh => InputScriptType::P2shP2wsh,
            ScriptType2Of3::P2wsh => InputScriptType::P2wsh,
            ScriptType2Of3::P2tr | ScriptType2Of3::P2trMusig2 => {
                InputScriptType::from_taproot_spend(p2tr_spend)
            }
        };
        Self::from_input_type(input_type)
    }

    pub fn from_unspents<I: IntoIterator<Item = ChainCode>>(chains: I, p2tr_spend: TaprootSpend) -> Self {
        Self::sum(chains.into_iter().map(|c| Self::from_unspent(c, p2tr_spend)))
    }

    pub fn from_psbt_input(input: &psbt::Input) -> Result<Self, ClassifyError> {
        Ok(Self::from_input_type(classify_psbt_input(input)?))
    }

    // ─── Outputs ───

    pub fn from_output_script_length(script_len: usize) -> Self {
        Dimensions {
            outputs: OutputDimensions {
                count: 1,
                size: output_size_from_script_length(script_len),
            },
            ..Self::ZERO
        }
    }

    pub fn from_output_script(script: &Script) -> Self {
        Self::from_output_script_length(script.len())
    }

    pub fn from_output(output: &TxOut) -> Self {
        Self::from_output_script(&output.script_pubkey)
    }

    pub fn from_outputs<'a, I: IntoIterator<Item = &'a TxOut>>(outputs: I) -> Self {
        Self::sum(outputs.into_iter().map(Self::from_output))
    }

    /// One wallet output on `chain` (p2sh-wrapped scripts are 23 bytes, witness programs 34).
    pub fn from_output_on_chain(chain: ChainCode) -> Self {
        let script_len = match chain.script_type() {
            ScriptType2Of3::P2sh | ScriptType2Of3::P2shP2wsh => 23,
            ScriptType2Of3::P2wsh | ScriptType2Of3::P2tr | ScriptType2Of3::P2trMusig2 => 34,
        };
        Self::from_output_script_length(script_len)
    }

    // ─── Whole transactions ───

    pub fn from_psbt(psbt: &Psbt) -> Result<Self, DimensionsError> {
        let mut d = Self::ZERO;
        for (index, input) in psbt.inputs.iter().enumerate() {
            d += Self::from_psbt_input(input)
                .map_err(|source| DimensionsError::Input { index, source })?;
        }
        let d = d + Self::from_outputs(&psbt.unsigned_tx.output);
        log::debug!(
            "psbt dimensions: {} inputs, {} outputs, vsize {}",
            d.n_inputs(),
            d.n_outputs(),
            d.get_vsize()
        );
        Ok(d)
    }

    /// Dimensions of a signed (or half-signed legacy) transaction.
    pub fn from_transaction(tx: &Transaction) -> Result<Self, DimensionsError> {
        let mut d = Self::ZERO;
        for (index, input) in tx.input.iter().enumerate() {
            let input_type = classify_tx_input(input).map_err(|source| {
                log::warn!("cannot size input {} of {}: {}", index, tx.compute_txid(), source);
                DimensionsError::Input { index, source }
            })?;
            d += Self::from_input_type(input_type);
        }
        Ok(d + Self::from_outputs(&tx.output))
    }

    // ─── Arithmetic ───

    pub fn plus(&self, other: &Dimensions) -> Self {
        *self + *other
    }

    pub fn times(&self, n: usize) -> Self {
        Dimensions {
            n_p2sh_inputs: self.n_p2sh_inputs * n,
            n_p2sh_p2wsh_inputs: self.n_p2sh_p2wsh_inputs * n,
            n_p2wsh_inputs: self.n_p2wsh_inputs * n,
            n_p2tr_keypath_inputs: self.n_p2tr_keypath_inputs * n,
            n_p2tr_script_path_level1_inputs: self.n_p2tr_script_path_level1_inputs * n,
            n_p2tr_script_path_level2_inputs: self.n_p2tr_script_path_level2_inputs * n,
            n_p2sh_p2pk_inputs: self.n_p2sh_p2pk_inputs * n,
            outputs: OutputDimensions {
                count: self.outputs.count * n,
                size: self.outputs.size * n,
            },
        }
    }

    // ─── Sizes ───

    pub fn n_inputs(&self) -> usize {
        self.n_p2sh_inputs
            + self.n_p2sh_p2wsh_inputs
            + self.n_p2wsh_inputs
            + self.n_p2tr_keypath_inputs
            + self.n_p2tr_script_path_level1_inputs
            + self.n_p2tr_script_path_level2_inputs
            + self.n_p2sh_p2pk_inputs
    }

    pub fn n_outputs(&self) -> usize {
        self.outputs.count
    }

    pub fn is_segwit(&self) -> bool {
        self.n_p2sh_p2wsh_inputs
            + self.n_p2wsh_inputs
            + self.n_p2tr_keypath_inputs
            + self.n_p2tr_script_path_level1_inputs
            + self.n_p2tr_script_path_level2_inputs
            > 0
    }

    pub fn get_overhead_vsize(&self) -> usize {
        if self.is_segwit() {
            VirtualSizes::TX_SEGWIT_OVERHEAD_VSIZE
        } else {
            VirtualSizes::TX_OVERHEAD_SIZE
        }
    }

    pub fn get_inputs_vsize(&self) -> usize {
        self.n_p2sh_inputs * VirtualSizes::TX_P2SH_INPUT_SIZE
            + self.n_p2sh_p2wsh_inputs * VirtualSizes::TX_P2SH_P2WSH_INPUT_SIZE
            + self.n_p2wsh_inputs * VirtualSizes::TX_P2WSH_INPUT_SIZE
            + self.n_p2tr_keypath_inputs * VirtualSizes::TX_P2TR_KEYPATH_INPUT_SIZE
            + self.n_p2tr_script_path_level1_inputs
                * VirtualSizes::TX_P2TR_SCRIPT_PATH_LEVEL1_INPUT_SIZE
            + self.n_p2tr_script_path_level2_inputs
                * VirtualSizes::TX_P2TR_SCRIPT_PATH_LEVEL2_INPUT_SIZE
            + self.n_p2sh_p2pk_inputs * VirtualSizes::TX_P2SH_P2PK_INPUT_SIZE
    }

    pub fn get_outputs_vsize(&self) -> usize {
        self.outputs.size
    }

    pub fn get_vsize(&self) -> usize {
        self.get_overhead_vsize() + self.get_inputs_vsize() + self.get_outputs_vsize()
    }

    pub fn get_fee(&self, fee_rate_sat_per_kb: u64) -> Amount {
        fee_for_vsize(self.get_vsize(), fee_rate_sat_per_kb)
    }
}

impl Add for Dimensions {
    type Output = Dimensions;

    fn add(self, rhs: Dimensions) -> Dimensions {
        Dimensions {
            n_p2sh_inputs: self.n_p2sh_inputs + rhs.n_p2sh_inputs,
            n_p2sh_p2wsh_inputs: self.n_p2sh_p2wsh_inputs + rhs.n_p2sh_p2wsh_inputs,
            n_p2wsh_inputs: self.n_p2wsh_inputs + rhs.n_p2wsh_inputs,
            n_p2tr_keypath_inputs: self.n_p2tr_keypath_inputs + rhs.n_p2tr_keypath_inputs,
            n_p2tr_script_path_level1_inputs: self.n_p2tr_script_path_level1_inputs
                + rhs.n_p2tr_script_path_level1_inputs,
            n_p2tr_script_path_level2_inputs: self.n_p2tr_script_path_level2_inputs
                + rhs.n_p2tr_script_path_level2_inputs,
            n_p2sh_p2pk_inputs: self.n_p2sh_p2pk_inputs + rhs.n_p2sh_p2pk_inputs,
            outputs: OutputDimensions {
                count: self.outputs.count + rhs.outputs.count,
                size: self.outputs.size + rhs.outputs.size,
            },
        }
    }
}

impl AddAssign for Dimensions {
    fn add_assign(&mut self, rhs: Dimensions) {
        *self = *self + rhs;
    }
}

impl Sum for Dimensions {
    fn sum<I: Iterator<Item = Dimensions>>(iter: I) -> Self {
        iter.fold(Dimensions::ZERO, |acc, d| acc + d)
    }
}
