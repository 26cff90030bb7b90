//! Wallet PSBT assembly.
//!
//! [`WalletPsbt`] owns a PSBT under construction and knows how to attach the
//! spend metadata of wallet inputs and outputs. [`build_wallet_psbt`] runs the
//! full build: validate, add inputs and outputs, size the transaction, then
//! add change or donate it to the fee.

use std::collections::BTreeMap;

use bitcoin::absolute::LockTime;
use bitcoin::bip32::DerivationPath;
use bitcoin::psbt::{self, Psbt};
use bitcoin::taproot::LeafVersion;
use bitcoin::transaction::Version;
use bitcoin::{Amount, ScriptBuf, Sequence, Transaction, TxIn, TxOut};
use coldsig_core::address::{to_output_script, AddressError};
use coldsig_core::scripts::create_output_script_for_network;
use coldsig_core::{
    ChainCode, DerivedWalletKeys, InvalidChainCode, KeyError, KeyRole, NetworkParams,
    RootWalletKeys, ScriptError, ScriptType2Of3, SpendableScript, TaprootSpend,
};
use coldsig_dimensions::{Dimensions, DimensionsError};
use thiserror::Error;

use crate::policy::FeePolicy;
use crate::sign::{is_finalized, is_input_complete, signature_count};
use crate::unspent::{
    Recipient, ReplayProtectionUnspent, SpendableUnspent, Unspent, UnspentError, WalletUnspent,
};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("fee rate {rate} sat/kvB is below the minimum relay rate {min}")]
    FeeRateTooLow { rate: u64, min: u64 },

    #[error("fee rate {rate} sat/kvB exceeds the maximum {max}")]
    FeeRateTooHigh { rate: u64, max: u64 },

    #[error("no unspents to spend")]
    NoInputs,

    #[error("no recipients")]
    NoOutputs,

    #[error(transparent)]
    Unspent(#[from] UnspentError),

    #[error("recipient {index}: {source}")]
    Recipient {
        index: usize,
        #[source]
        source: AddressError,
    },

    #[error("recipient {index}: amount {amount} is below the dust threshold")]
    DustOutput { index: usize, amount: Amount },

    #[error("change: {0}")]
    ChangeChain(#[from] InvalidChainCode),

    #[error("change address {address} does not derive from the wallet at chain {chain} index {index}")]
    ChangeMismatch {
        address: String,
        chain: ChainCode,
        index: u32,
    },

    #[error("change: {0}")]
    ChangeAddress(#[source] AddressError),

    #[error("key derivation failed: {0}")]
    Key(#[from] KeyError),

    #[error("script construction failed: {0}")]
    Script(#[from] ScriptError),

    #[error("{script_type} cannot be spent by {signer} and {cosigner}")]
    UnsupportedSpend {
        script_type: ScriptType2Of3,
        signer: KeyRole,
        cosigner: KeyRole,
    },

    #[error("unspent {id} needs its previous transaction")]
    MissingPrevTx { id: String },

    #[error("input {0} has no previous output")]
    MissingPrevout(usize),

    #[error(transparent)]
    Dimensions(#[from] DimensionsError),

    #[error("amount overflow")]
    AmountOverflow,

    #[error("cannot cover amount and fee: inputs {input_amount}, outputs {output_amount}, fee {fee}, short by {shortfall}")]
    InsufficientFunds {
        input_amount: Amount,
        output_amount: Amount,
        fee: Amount,
        shortfall: Amount,
    },

    #[error("psbt error: {0}")]
    Psbt(#[from] psbt::Error),
}

/// Lifecycle of a wallet PSBT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsbtState {
    Empty,
    Unsigned,
    PartiallySigned,
    FullySigned,
    /// Every input carries its final script, the network transaction can be extracted.
    Exported,
}

/// Which keys are expected to sign a wallet input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputOptions {
    pub signer: KeyRole,
    pub cosigner: KeyRole,
    pub skip_non_witness_utxo: bool,
}

impl Default for InputOptions {
    fn default() -> Self {
        Self {
            signer: KeyRole::User,
            cosigner: KeyRole::Bitgo,
            skip_non_witness_utxo: false,
        }
    }
}

impl InputOptions {
    /// Options for the user signing with the cosigner the policy's spend path implies.
    pub fn from_policy(policy: &FeePolicy) -> Self {
        let cosigner = match policy.p2tr_spend {
            TaprootSpend::ScriptPathLevel2 => KeyRole::Backup,
            TaprootSpend::KeyPath | TaprootSpend::ScriptPathLevel1 => KeyRole::Bitgo,
        };
        Self {
            signer: KeyRole::User,
            cosigner,
            skip_non_witness_utxo: policy.skip_non_witness_utxo,
        }
    }
}

/// Previous output of input `index`, from the witness UTXO or the full previous transaction.
pub fn prevout(psbt: &Psbt, index: usize) -> Option<TxOut> {
    let input = psbt.inputs.get(index)?;
    if let Some(utxo) = &input.witness_utxo {
        return Some(utxo.clone());
    }
    let vout = psbt.unsigned_tx.input.get(index)?.previous_output.vout as usize;
    input.non_witness_utxo.as_ref()?.output.get(vout).cloned()
}

pub fn prevouts(psbt: &Psbt) -> Result<Vec<TxOut>, BuildError> {
    (0..psbt.inputs.len())
        .map(|i| prevout(psbt, i).ok_or(BuildError::MissingPrevout(i)))
        .collect()
}

// ─── WalletPsbt ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct WalletPsbt {
    psbt: Psbt,
    network: NetworkParams,
}

impl WalletPsbt {
    /// Empty version 2 PSBT carrying the three root xpubs as global xpubs.
    pub fn new(root_keys: &RootWalletKeys, network: &NetworkParams) -> Result<Self, BuildError> {
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: Vec::new(),
            output: Vec::new(),
        };
        let mut psbt = Psbt::from_unsigned_tx(tx)?;
        for xpub in root_keys.triple() {
            psbt.xpub
                .insert(*xpub, (xpub.fingerprint(), DerivationPath::master()));
        }
        Ok(Self {
            psbt,
            network: *network,
        })
    }

    pub fn from_psbt(psbt: Psbt, network: &NetworkParams) -> Self {
        Self {
            psbt,
            network: *network,
        }
    }

    pub fn psbt(&self) -> &Psbt {
        &self.psbt
    }

    pub fn psbt_mut(&mut self) -> &mut Psbt {
        &mut self.psbt
    }

    pub fn into_psbt(self) -> Psbt {
        self.psbt
    }

    pub fn network(&self) -> &NetworkParams {
        &self.network
    }

    fn push_input(&mut self, txin: TxIn, input: psbt::Input) -> usize {
        self.psbt.unsigned_tx.input.push(txin);
        self.psbt.inputs.push(input);
        self.psbt.inputs.len() - 1
    }

    fn push_output(&mut self, txout: TxOut, output: psbt::Output) -> usize {
        self.psbt.unsigned_tx.output.push(txout);
        self.psbt.outputs.push(output);
        self.psbt.outputs.len() - 1
    }

    /// Add a wallet unspent as an input. The claimed address is checked
    /// against the wallet keys first.
    pub fn add_wallet_input(
        &mut self,
        unspent: &WalletUnspent,
        root_keys: &RootWalletKeys,
        options: &InputOptions,
    ) -> Result<usize, BuildError> {
        let (derived, spendable) = unspent.verify_address(root_keys, &self.network)?;
        let mut input = psbt::Input {
            witness_utxo: Some(TxOut {
                value: unspent.value,
                script_pubkey: spendable.script_pubkey.clone(),
            }),
            redeem_script: spendable.redeem_script.clone(),
            witness_script: spendable.witness_script.clone(),
            ..Default::default()
        };

        match (&unspent.prev_tx, spendable.script_type) {
            (_, ScriptType2Of3::P2tr | ScriptType2Of3::P2trMusig2) => {}
            (Some(tx), _) if !options.skip_non_witness_utxo => {
                input.non_witness_utxo = Some(tx.clone());
                if !spendable.script_type.is_segwit() {
                    input.witness_utxo = None;
                }
            }
            (None, ScriptType2Of3::P2sh) if !options.skip_non_witness_utxo => {
                return Err(BuildError::MissingPrevTx { id: unspent.id() });
            }
            _ => {}
        }

        if spendable.script_type.is_taproot() {
            add_taproot_input_metadata(&mut input, &derived, &spendable, options)?;
        } else {
            for role in KeyRole::ALL {
                input
                    .bip32_derivation
                    .insert(derived.public_key(role), derived.key_source(role));
            }
        }

        let index = self.push_input(
            TxIn {
                previous_output: unspent.outpoint,
                sequence: Sequence::MAX,
                ..Default::default()
            },
            input,
        );
        log::debug!(
            "input {}: {} {} at {}/{}",
            index,
            unspent.id(),
            spendable.script_type,
            unspent.chain,
            unspent.index
        );
        Ok(index)
    }

    pub fn add_replay_protection_input(
        &mut self,
        unspent: &ReplayProtectionUnspent,
        skip_non_witness_utxo: bool,
    ) -> Result<usize, BuildError> {
        let mut input = psbt::Input {
            redeem_script: Some(unspent.redeem_script()),
            ..Default::default()
        };
        match (&unspent.prev_tx, skip_non_witness_utxo) {
            (Some(tx), false) => input.non_witness_utxo = Some(tx.clone()),
            (None, false) => {
                return Err(BuildError::MissingPrevTx {
                    id: crate::unspent::format_id(&unspent.outpoint),
                })
            }
            (_, true) => {
                input.witness_utxo = Some(TxOut {
                    value: unspent.value,
                    script_pubkey: unspent.script_pubkey(),
                })
            }
        }
        Ok(self.push_input(
            TxIn {
                previous_output: unspent.outpoint,
                sequence: Sequence::MAX,
                ..Default::default()
            },
            input,
        ))
    }

    pub fn add_output(&mut self, script_pubkey: ScriptBuf, value: Amount) -> usize {
        self.push_output(
            TxOut {
                value,
                script_pubkey,
            },
            psbt::Output::default(),
        )
    }

    /// Add an output paying back to the wallet, with the derivation data an
    /// offline signer needs to recognise it.
    pub fn add_wallet_output(
        &mut self,
        root_keys: &RootWalletKeys,
        chain: ChainCode,
        index: u32,
        script_type: ScriptType2Of3,
        value: Amount,
    ) -> Result<usize, BuildError> {
        let derived = root_keys.derive(chain, index)?;
        let spendable =
            create_output_script_for_network(&derived.public_keys(), script_type, &self.network)?;
        let mut output = psbt::Output {
            redeem_script: spendable.redeem_script.clone(),
            witness_script: spendable.witness_script.clone(),
            ..Default::default()
        };
        match &spendable.taproot {
            Some(taproot) => {
                output.tap_internal_key = Some(taproot.internal_key);
                for role in KeyRole::ALL {
                    let leaf_hashes = taproot
                        .leaves
                        .iter()
                        .filter(|l| l.includes(role))
                        .map(|l| l.leaf_hash())
                        .collect();
                    output.tap_key_origins.insert(
                        derived.public_key(role).x_only_public_key().0,
                        (leaf_hashes, derived.key_source(role)),
                    );
                }
            }
            None => {
                for role in KeyRole::ALL {
                    output
                        .bip32_derivation
                        .insert(derived.public_key(role), derived.key_source(role));
                }
            }
        }
        Ok(self.push_output(
            TxOut {
                value,
                script_pubkey: spendable.script_pubkey,
            },
            output,
        ))
    }

    pub fn input_amount(&self) -> Result<Amount, BuildError> {
        sum_amounts(prevouts(&self.psbt)?.iter().map(|o| o.value))
    }

    pub fn output_amount(&self) -> Result<Amount, BuildError> {
        sum_amounts(self.psbt.unsigned_tx.output.iter().map(|o| o.value))
    }

    /// Inputs minus outputs.
    pub fn absolute_fee(&self) -> Result<Amount, BuildError> {
        let input = self.input_amount()?;
        let output = self.output_amount()?;
        input
            .checked_sub(output)
            .ok_or_else(|| BuildError::InsufficientFunds {
                input_amount: input,
                output_amount: output,
                fee: Amount::ZERO,
                shortfall: output - input,
            })
    }

    pub fn state(&self) -> PsbtState {
        if self.psbt.inputs.is_empty() || self.psbt.unsigned_tx.output.is_empty() {
            return PsbtState::Empty;
        }
        if self.psbt.inputs.iter().all(is_finalized) {
            return PsbtState::Exported;
        }
        let any = self
            .psbt
            .inputs
            .iter()
            .any(|i| signature_count(i) > 0 || is_finalized(i));
        let all = self.psbt.inputs.iter().all(is_input_complete);
        match (any, all) {
            (_, true) => PsbtState::FullySigned,
            (true, false) => PsbtState::PartiallySigned,
            (false, false) => PsbtState::Unsigned,
        }
    }
}

fn sum_amounts<I: IntoIterator<Item = Amount>>(amounts: I) -> Result<Amount, BuildError> {
    amounts
        .into_iter()
        .try_fold(Amount::ZERO, |acc, a| acc.checked_add(a))
        .ok_or(BuildError::AmountOverflow)
}

/// Taproot fields for a key-path or single-leaf script-path spend by
/// `options.signer` and `options.cosigner`.
fn add_taproot_input_metadata(
    input: &mut psbt::Input,
    derived: &DerivedWalletKeys,
    spendable: &SpendableScript,
    options: &InputOptions,
) -> Result<(), BuildError> {
    let unsupported = || BuildError::UnsupportedSpend {
        script_type: spendable.script_type,
        signer: options.signer,
        cosigner: options.cosigner,
    };
    let taproot = spendable.taproot.as_ref().ok_or_else(unsupported)?;
    input.tap_internal_key = Some(taproot.internal_key);
    input.tap_merkle_root = taproot.merkle_root;

    let pair = [options.signer, options.cosigner];
    let key_path = spendable.script_type == ScriptType2Of3::P2trMusig2
        && pair.contains(&KeyRole::User)
        && pair.contains(&KeyRole::Bitgo);

    if key_path {
        for role in pair {
            input.tap_key_origins.insert(
                derived.public_key(role).x_only_public_key().0,
                (Vec::new(), derived.key_source(role)),
            );
        }
        return Ok(());
    }

    let leaf = taproot
        .leaf(options.signer, options.cosigner)
        .ok_or_else(unsupported)?;
    input.tap_scripts = BTreeMap::from([(
        leaf.control_block.clone(),
        (leaf.script.clone(), LeafVersion::TapScript),
    )]);
    for role in leaf.signers {
        input.tap_key_origins.insert(
            derived.public_key(role).x_only_public_key().0,
            (vec![leaf.leaf_hash()], derived.key_source(role)),
        );
    }
    Ok(())
}

// ─── Full build ─────────────────────────────────────────────────────────────

/// Where change goes. The address must be the wallet's own at `chain/index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRequest {
    pub chain: u32,
    pub index: u32,
    pub address: String,
    /// Needed only for p2trMusig2 change on a taproot chain.
    pub script_type: Option<ScriptType2Of3>,
}

#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub network: NetworkParams,
    pub root_keys: RootWalletKeys,
    pub unspents: Vec<Unspent>,
    pub recipients: Vec<Recipient>,
    pub fee_rate_sat_per_kb: u64,
    pub change: ChangeRequest,
}

#[derive(Debug, Clone)]
pub struct BuiltPsbt {
    pub psbt: WalletPsbt,
    /// `ceil(vsize * rate / 1000)`, sized with a change output.
    pub fee: Amount,
    pub vsize: usize,
    /// Output index and value of the change output, if one was added.
    pub change: Option<(usize, Amount)>,
    /// Change at or below the dust threshold, left to the miner.
    pub dust_donated: Amount,
    pub input_amount: Amount,
    pub output_amount: Amount,
}

impl BuiltPsbt {
    /// What the transaction actually pays: `fee` plus any donated dust.
    pub fn absolute_fee(&self) -> Amount {
        self.fee + self.dust_donated
    }
}

/// Re-derive the change script and compare it to the claimed address.
fn verify_change(req: &BuildRequest) -> Result<(ChainCode, ScriptType2Of3), BuildError> {
    let change = &req.change;
    let chain = ChainCode::try_from(change.chain)?;
    let script_type = change.script_type.unwrap_or(chain.script_type());
    let compatible = script_type == chain.script_type()
        || (script_type == ScriptType2Of3::P2trMusig2
            && chain.script_type() == ScriptType2Of3::P2tr);
    let mismatch = || BuildError::ChangeMismatch {
        address: change.address.clone(),
        chain,
        index: change.index,
    };
    if !compatible {
        return Err(mismatch());
    }
    let derived = req.root_keys.derive(chain, change.index)?;
    let expected =
        create_output_script_for_network(&derived.public_keys(), script_type, &req.network)?;
    let claimed =
        to_output_script(&change.address, &req.network).map_err(BuildError::ChangeAddress)?;
    if claimed != expected.script_pubkey {
        return Err(mismatch());
    }
    Ok((chain, script_type))
}

pub(crate) fn check_fee_rate(rate: u64, policy: &FeePolicy) -> Result<(), BuildError> {
    if rate < policy.min_relay_fee_rate_sat_per_kb {
        return Err(BuildError::FeeRateTooLow {
            rate,
            min: policy.min_relay_fee_rate_sat_per_kb,
        });
    }
    if rate > policy.max_fee_rate_sat_per_kb {
        return Err(BuildError::FeeRateTooHigh {
            rate,
            max: policy.max_fee_rate_sat_per_kb,
        });
    }
    Ok(())
}

pub fn build_wallet_psbt(req: &BuildRequest, policy: &FeePolicy) -> Result<BuiltPsbt, BuildError> {
    let rate = req.fee_rate_sat_per_kb;
    check_fee_rate(rate, policy)?;
    if req.unspents.is_empty() {
        return Err(BuildError::NoInputs);
    }
    if req.recipients.is_empty() {
        return Err(BuildError::NoOutputs);
    }
    let (change_chain, change_type) = verify_change(req)?;

    let mut wallet_psbt = WalletPsbt::new(&req.root_keys, &req.network)?;
    let options = InputOptions::from_policy(policy);
    for unspent in &req.unspents {
        match unspent.resolve(&req.network)? {
            SpendableUnspent::Wallet(u) => {
                wallet_psbt.add_wallet_input(&u, &req.root_keys, &options)?;
            }
            SpendableUnspent::ReplayProtection(u) => {
                wallet_psbt.add_replay_protection_input(&u, policy.skip_non_witness_utxo)?;
            }
        }
    }

    let dust = Amount::from_sat(policy.dust_threshold_sat);
    for (index, recipient) in req.recipients.iter().enumerate() {
        let script = recipient
            .output_script(&req.network)
            .map_err(|source| BuildError::Recipient { index, source })?;
        let null_data = script.is_op_return() && recipient.amount == Amount::ZERO;
        if recipient.amount < dust && !null_data {
            return Err(BuildError::DustOutput {
                index,
                amount: recipient.amount,
            });
        }
        wallet_psbt.add_output(script, recipient.amount);
    }

    let input_amount = wallet_psbt.input_amount()?;
    let output_amount = wallet_psbt.output_amount()?;

    let dimensions =
        Dimensions::from_psbt(wallet_psbt.psbt())? + Dimensions::from_output_on_chain(change_chain);
    let vsize = dimensions.get_vsize();
    let fee = dimensions.get_fee(rate);

    let required = output_amount
        .checked_add(fee)
        .ok_or(BuildError::AmountOverflow)?;
    let Some(change_amount) = input_amount.checked_sub(required) else {
        return Err(BuildError::InsufficientFunds {
            input_amount,
            output_amount,
            fee,
            shortfall: required - input_amount,
        });
    };

    let (change, dust_donated) = if change_amount > dust {
        let index = wallet_psbt.add_wallet_output(
            &req.root_keys,
            change_chain,
            req.change.index,
            change_type,
            change_amount,
        )?;
        (Some((index, change_amount)), Amount::ZERO)
    } else {
        (None, change_amount)
    };

    log::info!(
        "built psbt: {} inputs, {} outputs, vsize {}, fee {}, donated {}",
        wallet_psbt.psbt().inputs.len(),
        wallet_psbt.psbt().outputs.len(),
        vsize,
        fee,
        dust_donated
    );

    Ok(BuiltPsbt {
        psbt: wallet_psbt,
        fee,
        vsize,
        change,
        dust_donated,
        input_amount,
        output_amount,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{unspent_of_type, unspent_on_chain, wallet_address};
    use coldsig_core::classify::{classify_psbt_input, InputScriptType};
    use coldsig_core::test_utils::test_root_keys;
    use coldsig_core::Coin;

    fn request(unspents: Vec<Unspent>, amount: u64, rate: u64) -> BuildRequest {
        BuildRequest {
            network: *Coin::Tbtc.params(),
            root_keys: test_root_keys(),
            unspents,
            recipients: vec![Recipient::to_address(
                wallet_address(0, 100, ScriptType2Of3::P2sh),
                Amount::from_sat(amount),
            )],
            fee_rate_sat_per_kb: rate,
            change: ChangeRequest {
                chain: 21,
                index: 7,
                address: wallet_address(21, 7, ScriptType2Of3::P2wsh),
                script_type: None,
            },
        }
    }

    #[test]
    fn test_build_balances_with_change() {
        let unspents = vec![
            unspent_on_chain(0, 1, 0, 100_000),
            unspent_on_chain(10, 2, 1, 100_000),
            unspent_on_chain(20, 3, 2, 100_000),
            unspent_on_chain(30, 4, 3, 100_000),
        ];
        let built = build_wallet_psbt(&request(unspents, 50_000, 2_000), &FeePolicy::default()).unwrap();

        let psbt = built.psbt.psbt();
        assert_eq!(psbt.inputs.len(), 4);
        assert_eq!(psbt.xpub.len(), 3);
        assert_eq!(built.input_amount, Amount::from_sat(400_000));
        let (change_index, change) = built.change.unwrap();
        assert_eq!(change_index, 1);
        assert_eq!(
            built.input_amount,
            built.output_amount + change + built.fee
        );
        assert_eq!(built.psbt.absolute_fee().unwrap(), built.fee);
        assert_eq!(built.fee, Amount::from_sat((built.vsize as u64 * 2_000).div_ceil(1000)));
        assert_eq!(built.psbt.state(), PsbtState::Unsigned);

        let types: Vec<_> = psbt
            .inputs
            .iter()
            .map(|i| classify_psbt_input(i).unwrap())
            .collect();
        assert_eq!(
            types,
            vec![
                InputScriptType::P2sh,
                InputScriptType::P2shP2wsh,
                InputScriptType::P2wsh,
                InputScriptType::P2trScriptPathLevel1,
            ]
        );
        assert!(psbt.inputs[0].non_witness_utxo.is_some());
        assert!(psbt.inputs[0].witness_utxo.is_none());
        assert_eq!(psbt.outputs[1].bip32_derivation.len(), 3);
    }

    #[test]
    fn test_dust_change_is_donated() {
        let rate = 1_000;
        let sized = build_wallet_psbt(
            &request(vec![unspent_on_chain(20, 0, 0, 100_000)], 10_000, rate),
            &FeePolicy::default(),
        )
        .unwrap();
        // Ask for everything but 500 sats beyond the fee.
        let amount = 100_000 - sized.fee.to_sat() - 500;
        let built = build_wallet_psbt(
            &request(vec![unspent_on_chain(20, 0, 0, 100_000)], amount, rate),
            &FeePolicy::default(),
        )
        .unwrap();
        assert!(built.change.is_none());
        assert_eq!(built.dust_donated, Amount::from_sat(500));
        assert_eq!(built.psbt.absolute_fee().unwrap(), built.absolute_fee());
        assert_eq!(built.psbt.psbt().outputs.len(), 1);
    }

    #[test]
    fn test_insufficient_funds_reports_shortfall() {
        let err = build_wallet_psbt(
            &request(vec![unspent_on_chain(20, 0, 0, 10_000)], 10_000, 1_000),
            &FeePolicy::default(),
        )
        .unwrap_err();
        match err {
            BuildError::InsufficientFunds { shortfall, fee, .. } => assert_eq!(shortfall, fee),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_preconditions() {
        let policy = FeePolicy::default();
        let ok = || request(vec![unspent_on_chain(20, 0, 0, 100_000)], 10_000, 1_000);

        let mut req = ok();
        req.fee_rate_sat_per_kb = 999;
        assert!(matches!(build_wallet_psbt(&req, &policy), Err(BuildError::FeeRateTooLow { .. })));

        let mut req = ok();
        req.unspents.clear();
        assert!(matches!(build_wallet_psbt(&req, &policy), Err(BuildError::NoInputs)));

        let mut req = ok();
        req.recipients.clear();
        assert!(matches!(build_wallet_psbt(&req, &policy), Err(BuildError::NoOutputs)));

        let mut req = ok();
        req.recipients[0].amount = Amount::from_sat(100);
        assert!(matches!(
            build_wallet_psbt(&req, &policy),
            Err(BuildError::DustOutput { index: 0, .. })
        ));

        let mut req = ok();
        req.change.index = 8;
        assert!(matches!(
            build_wallet_psbt(&req, &policy),
            Err(BuildError::ChangeMismatch { index: 8, .. })
        ));

        let mut req = ok();
        req.change.chain = 5;
        assert!(matches!(build_wallet_psbt(&req, &policy), Err(BuildError::ChangeChain(_))));
    }

    #[test]
    fn test_foreign_unspent_rejected() {
        let mut unspent = unspent_on_chain(20, 0, 0, 100_000);
        unspent.address = wallet_address(20, 1, ScriptType2Of3::P2wsh);
        let err = build_wallet_psbt(&request(vec![unspent], 10_000, 1_000), &FeePolicy::default())
            .unwrap_err();
        assert!(matches!(
            err,
            BuildError::Unspent(UnspentError::AddressMismatch { .. })
        ));
    }

    #[test]
    fn test_taproot_spend_paths() {
        let musig = unspent_of_type(30, 5, 0, 50_000, ScriptType2Of3::P2trMusig2);
        let p2tr = unspent_on_chain(31, 6, 1, 50_000);

        let built = build_wallet_psbt(
            &request(vec![musig.clone(), p2tr.clone()], 10_000, 1_000),
            &FeePolicy::default(),
        )
        .unwrap();
        let psbt = built.psbt.psbt();
        assert_eq!(classify_psbt_input(&psbt.inputs[0]).unwrap(), InputScriptType::P2trKeypath);
        assert!(psbt.inputs[0].tap_scripts.is_empty());
        assert_eq!(psbt.inputs[0].tap_key_origins.len(), 2);
        assert_eq!(
            classify_psbt_input(&psbt.inputs[1]).unwrap(),
            InputScriptType::P2trScriptPathLevel1
        );

        let policy = FeePolicy {
            p2tr_spend: TaprootSpend::ScriptPathLevel2,
            ..FeePolicy::default()
        };
        let built = build_wallet_psbt(&request(vec![musig, p2tr], 10_000, 1_000), &policy).unwrap();
        let psbt = built.psbt.psbt();
        // user/backup is a depth-1 leaf for p2trMusig2 and depth 2 for p2tr
        assert_eq!(
            classify_psbt_input(&psbt.inputs[0]).unwrap(),
            InputScriptType::P2trScriptPathLevel1
        );
        assert_eq!(
            classify_psbt_input(&psbt.inputs[1]).unwrap(),
            InputScriptType::P2trScriptPathLevel2
        );
    }

    #[test]
    fn test_skip_non_witness_utxo() {
        let policy = FeePolicy {
            skip_non_witness_utxo: true,
            ..FeePolicy::default()
        };
        let mut unspent = unspent_on_chain(0, 0, 0, 100_000);
        unspent.prev_tx = None;
        let built = build_wallet_psbt(&request(vec![unspent.clone()], 10_000, 1_000), &policy).unwrap();
        assert!(built.psbt.psbt().inputs[0].non_witness_utxo.is_none());
        assert!(built.psbt.psbt().inputs[0].witness_utxo.is_some());

        assert!(matches!(
            build_wallet_psbt(&request(vec![unspent], 10_000, 1_000), &FeePolicy::default()),
            Err(BuildError::MissingPrevTx { .. })
        ));
    }
}
