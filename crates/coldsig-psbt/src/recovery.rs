//! Sweeping a wallet with the user and backup keys, without the bitgo cosigner.
//!
//! Recovery runs in three steps:
//!
//! 1. [`scan_wallet_unspents`] walks the wallet addresses of every chain and
//!    collects what an [`UnspentLookup`] reports for them, stopping after a
//!    run of unused addresses
//! 2. [`build_recovery_psbt`] spends everything to one destination, paying the
//!    fee sized from the inputs and outputs, plus an optional provider fee
//! 3. [`sign_recovery_psbt`] adds the user or backup signatures and, once both
//!    signed, finalizes the PSBT and hands back the network transaction
//!
//! Leaving out step 3 gives an unsigned sweep. Signing only with the user key
//! leaves a half-signed PSBT for whoever holds the backup key.

use bitcoin::{Amount, OutPoint, Transaction};
use coldsig_core::address::{from_output_script, to_output_script, AddressError};
use coldsig_core::codes::for_type;
use coldsig_core::scripts::create_output_script_for_network;
use coldsig_core::{
    ChainCode, InvalidChainCode, KeyError, KeyRole, NetworkParams, RootWalletKeys, Scope,
    ScriptError, ScriptType2Of3, WalletSigner,
};
use coldsig_dimensions::Dimensions;
use thiserror::Error;

use crate::builder::{check_fee_rate, BuildError, InputOptions, PsbtState, WalletPsbt};
use crate::finalize::{extract_transaction, finalize_wallet_psbt, FinalizeError};
use crate::policy::FeePolicy;
use crate::sign::{sign_wallet_psbt, SignError};
use crate::unspent::WalletUnspent;

/// Unused addresses in a row after which a chain is considered exhausted.
pub const DEFAULT_SCAN_GAP: usize = 20;

pub type LookupError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("scan gap must be at least 1")]
    InvalidScanGap,

    #[error("lookup of {address} failed: {source}")]
    Lookup {
        address: String,
        #[source]
        source: LookupError,
    },

    #[error("no unspents to recover")]
    NoUnspents,

    #[error("recovery destination: {0}")]
    Destination(#[source] AddressError),

    #[error("provider fee address: {0}")]
    ProviderAddress(#[source] AddressError),

    #[error("balance {input_amount} cannot pay network fee {fee} and provider fee {provider_fee}")]
    BalanceTooLow {
        input_amount: Amount,
        fee: Amount,
        provider_fee: Amount,
    },

    #[error("recovery is signed by the user and backup keys, not {0}")]
    UnexpectedSigner(KeyRole),

    #[error("inputs {0:?} were not signed")]
    Unsigned(Vec<usize>),

    #[error(transparent)]
    Chain(#[from] InvalidChainCode),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Sign(#[from] SignError),

    #[error(transparent)]
    Finalize(#[from] FinalizeError),
}

// ─── Scan ───────────────────────────────────────────────────────────────────

/// An unspent output found at a scanned address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundOutput {
    pub outpoint: OutPoint,
    pub value: Amount,
    /// Needed for p2sh inputs unless the fee policy skips previous transactions.
    pub prev_tx: Option<Transaction>,
}

/// What a block source knows about one address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressActivity {
    /// Any transaction at all marks the address as used, even if it is empty now.
    pub tx_count: u64,
    pub outputs: Vec<FoundOutput>,
}

/// Source of address history, usually a block explorer.
pub trait UnspentLookup {
    fn address_activity(&mut self, address: &str) -> Result<AddressActivity, LookupError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOptions {
    pub gap: usize,
    pub ignore_script_types: Vec<ScriptType2Of3>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            gap: DEFAULT_SCAN_GAP,
            ignore_script_types: Vec::new(),
        }
    }
}

/// p2trMusig2 outputs share the p2tr chains.
fn chains_for(script_type: ScriptType2Of3) -> Result<[ChainCode; 2], InvalidChainCode> {
    let pair = match script_type {
        ScriptType2Of3::P2trMusig2 => for_type(ScriptType2Of3::P2tr)?,
        other => for_type(other)?,
    };
    Ok([pair.get(Scope::External), pair.get(Scope::Internal)])
}

fn scan_chain(
    lookup: &mut dyn UnspentLookup,
    root_keys: &RootWalletKeys,
    network: &NetworkParams,
    chain: ChainCode,
    script_type: ScriptType2Of3,
    gap: usize,
    found: &mut Vec<WalletUnspent>,
) -> Result<(), RecoveryError> {
    let mut unused = 0;
    let mut index: u32 = 0;
    while unused < gap {
        let derived = root_keys.derive(chain, index)?;
        let spendable =
            create_output_script_for_network(&derived.public_keys(), script_type, network)?;
        let address = from_output_script(&spendable.script_pubkey, network)?;
        let activity =
            lookup
                .address_activity(&address)
                .map_err(|source| RecoveryError::Lookup {
                    address: address.clone(),
                    source,
                })?;
        if activity.tx_count == 0 {
            unused += 1;
        } else {
            unused = 0;
            if !activity.outputs.is_empty() {
                log::debug!(
                    "{} ({} {}/{}): {} unspents",
                    address,
                    script_type,
                    chain,
                    index,
                    activity.outputs.len()
                );
            }
            found.extend(activity.outputs.into_iter().map(|o| WalletUnspent {
                outpoint: o.outpoint,
                address: address.clone(),
                value: o.value,
                chain,
                index,
                script_type,
                prev_tx: o.prev_tx,
            }));
        }
        index = match index.checked_add(1) {
            Some(next) => next,
            None => break,
        };
    }
    Ok(())
}

/// Collect the unspents of every wallet address the network can hold.
pub fn scan_wallet_unspents(
    lookup: &mut dyn UnspentLookup,
    root_keys: &RootWalletKeys,
    network: &NetworkParams,
    options: &ScanOptions,
) -> Result<Vec<WalletUnspent>, RecoveryError> {
    if options.gap == 0 {
        return Err(RecoveryError::InvalidScanGap);
    }
    let mut found = Vec::new();
    for script_type in ScriptType2Of3::ALL {
        if !network.supports_script_type(script_type)
            || options.ignore_script_types.contains(&script_type)
        {
            continue;
        }
        for chain in chains_for(script_type)? {
            scan_chain(
                lookup,
                root_keys,
                network,
                chain,
                script_type,
                options.gap,
                &mut found,
            )?;
        }
    }
    log::info!("scan found {} unspents", found.len());
    Ok(found)
}

// ─── Build ──────────────────────────────────────────────────────────────────

/// Fee owed to the service holding the backup key, paid as a second output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderFee {
    pub address: String,
    pub amount: Amount,
}

#[derive(Debug, Clone)]
pub struct RecoveryRequest {
    pub network: NetworkParams,
    pub root_keys: RootWalletKeys,
    pub unspents: Vec<WalletUnspent>,
    pub destination: String,
    pub fee_rate_sat_per_kb: u64,
    pub provider_fee: Option<ProviderFee>,
}

#[derive(Debug, Clone)]
pub struct RecoveryPsbt {
    pub psbt: WalletPsbt,
    pub input_amount: Amount,
    pub fee: Amount,
    pub vsize: usize,
    /// Value of output 0, paid to the destination.
    pub recovery_amount: Amount,
}

/// Unsigned sweep of every unspent in `req` to its destination.
///
/// Taproot inputs get the user/backup leaf. The fee is sized from the
/// finished PSBT, so it covers the provider output too.
pub fn build_recovery_psbt(
    req: &RecoveryRequest,
    policy: &FeePolicy,
) -> Result<RecoveryPsbt, RecoveryError> {
    check_fee_rate(req.fee_rate_sat_per_kb, policy)?;
    if req.unspents.is_empty() {
        return Err(RecoveryError::NoUnspents);
    }

    let mut wallet_psbt = WalletPsbt::new(&req.root_keys, &req.network)?;
    let options = InputOptions {
        signer: KeyRole::User,
        cosigner: KeyRole::Backup,
        skip_non_witness_utxo: policy.skip_non_witness_utxo,
    };
    for unspent in &req.unspents {
        wallet_psbt.add_wallet_input(unspent, &req.root_keys, &options)?;
    }

    let destination =
        to_output_script(&req.destination, &req.network).map_err(RecoveryError::Destination)?;
    let sweep = wallet_psbt.add_output(destination, Amount::ZERO);
    let mut provider_fee = Amount::ZERO;
    if let Some(provider) = req.provider_fee.as_ref().filter(|p| p.amount > Amount::ZERO) {
        let script = to_output_script(&provider.address, &req.network)
            .map_err(RecoveryError::ProviderAddress)?;
        wallet_psbt.add_output(script, provider.amount);
        provider_fee = provider.amount;
    }

    let input_amount = wallet_psbt.input_amount()?;
    let dimensions = Dimensions::from_psbt(wallet_psbt.psbt()).map_err(BuildError::from)?;
    let vsize = dimensions.get_vsize();
    let fee = dimensions.get_fee(req.fee_rate_sat_per_kb);

    let too_low = || RecoveryError::BalanceTooLow {
        input_amount,
        fee,
        provider_fee,
    };
    let recovery_amount = input_amount
        .checked_sub(fee)
        .and_then(|a| a.checked_sub(provider_fee))
        .filter(|a| a.to_sat() > policy.dust_threshold_sat)
        .ok_or_else(too_low)?;
    if let Some(output) = wallet_psbt.psbt_mut().unsigned_tx.output.get_mut(sweep) {
        output.value = recovery_amount;
    }

    log::info!(
        "recovery psbt: {} inputs, {} recovered, fee {}, provider fee {}, vsize {}",
        req.unspents.len(),
        recovery_amount,
        fee,
        provider_fee,
        vsize
    );
    Ok(RecoveryPsbt {
        psbt: wallet_psbt,
        input_amount,
        fee,
        vsize,
        recovery_amount,
    })
}

// ─── Sign ───────────────────────────────────────────────────────────────────

/// Add one recovery signer's signatures to every input.
///
/// Returns the finalized network transaction once both keys have signed,
/// `None` while the PSBT still waits for the other key.
pub fn sign_recovery_psbt(
    psbt: &mut WalletPsbt,
    signer: &WalletSigner,
    root_keys: &RootWalletKeys,
) -> Result<Option<Transaction>, RecoveryError> {
    if signer.role() == KeyRole::Bitgo {
        return Err(RecoveryError::UnexpectedSigner(signer.role()));
    }
    let report = sign_wallet_psbt(psbt.psbt_mut(), signer, root_keys)?;
    if !report.skipped.is_empty() {
        return Err(RecoveryError::Unsigned(report.skipped));
    }
    if psbt.state() != PsbtState::FullySigned {
        log::info!("recovery signed by {}, waiting for the other key", signer.role());
        return Ok(None);
    }
    finalize_wallet_psbt(psbt.psbt_mut())?;
    let tx = extract_transaction(psbt.psbt())?;
    log::info!("recovery transaction {} ready", tx.compute_txid());
    Ok(Some(tx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::sign::signature_validation;
    use crate::test_support::{unspent_of_type, wallet_address};
    use crate::unspent::SpendableUnspent;
    use coldsig_core::classify::{classify_tx_input, InputScriptType};
    use coldsig_core::test_utils::{test_root_keys, test_signer};
    use coldsig_core::Coin;

    #[derive(Default)]
    struct FakeExplorer {
        activity: HashMap<String, AddressActivity>,
        queried: Vec<String>,
    }

    impl FakeExplorer {
        fn fund(&mut self, chain: u32, index: u32, salt: u8, value: u64, script_type: ScriptType2Of3) {
            let unspent = unspent_of_type(chain, index, salt, value, script_type);
            let SpendableUnspent::Wallet(u) = unspent.resolve(Coin::Tbtc.params()).unwrap() else {
                panic!("not a wallet unspent");
            };
            let entry = self.activity.entry(u.address).or_default();
            entry.tx_count += 1;
            entry.outputs.push(FoundOutput {
                outpoint: u.outpoint,
                value: u.value,
                prev_tx: u.prev_tx,
            });
        }

        fn touch(&mut self, chain: u32, index: u32, script_type: ScriptType2Of3) {
            let address = wallet_address(chain, index, script_type);
            self.activity.entry(address).or_default().tx_count += 1;
        }
    }

    impl UnspentLookup for FakeExplorer {
        fn address_activity(&mut self, address: &str) -> Result<AddressActivity, LookupError> {
            self.queried.push(address.to_string());
            Ok(self.activity.get(address).cloned().unwrap_or_default())
        }
    }

    struct Offline;

    impl UnspentLookup for Offline {
        fn address_activity(&mut self, _address: &str) -> Result<AddressActivity, LookupError> {
            Err("connection refused".into())
        }
    }

    fn scan(explorer: &mut FakeExplorer, gap: usize) -> Vec<WalletUnspent> {
        let options = ScanOptions {
            gap,
            ..Default::default()
        };
        scan_wallet_unspents(explorer, &test_root_keys(), Coin::Tbtc.params(), &options).unwrap()
    }

    fn request(unspents: Vec<WalletUnspent>, provider_fee: Option<ProviderFee>) -> RecoveryRequest {
        RecoveryRequest {
            network: *Coin::Tbtc.params(),
            root_keys: test_root_keys(),
            unspents,
            destination: wallet_address(0, 500, ScriptType2Of3::P2sh),
            fee_rate_sat_per_kb: 2_000,
            provider_fee,
        }
    }

    fn funded_wallet() -> Vec<WalletUnspent> {
        let mut explorer = FakeExplorer::default();
        explorer.fund(0, 0, 1, 100_000, ScriptType2Of3::P2sh);
        explorer.fund(11, 1, 2, 200_000, ScriptType2Of3::P2shP2wsh);
        explorer.fund(21, 0, 3, 300_000, ScriptType2Of3::P2wsh);
        explorer.fund(30, 2, 4, 400_000, ScriptType2Of3::P2tr);
        explorer.fund(31, 0, 5, 500_000, ScriptType2Of3::P2trMusig2);
        scan(&mut explorer, DEFAULT_SCAN_GAP)
    }

    #[test]
    fn test_scan_stops_after_gap() {
        let mut explorer = FakeExplorer::default();
        explorer.fund(0, 0, 1, 10_000, ScriptType2Of3::P2sh);
        // two unused addresses in a row end the chain before index 4
        explorer.fund(0, 4, 2, 20_000, ScriptType2Of3::P2sh);
        // a used but empty address keeps the scan going
        explorer.touch(21, 1, ScriptType2Of3::P2wsh);
        explorer.fund(21, 3, 3, 30_000, ScriptType2Of3::P2wsh);
        explorer.fund(30, 1, 4, 40_000, ScriptType2Of3::P2trMusig2);

        let found = scan(&mut explorer, 2);
        let mut located: Vec<_> = found
            .iter()
            .map(|u| (u.chain.value(), u.index, u.script_type, u.value.to_sat()))
            .collect();
        located.sort_by_key(|l| (l.0, l.1));
        assert_eq!(
            located,
            vec![
                (0, 0, ScriptType2Of3::P2sh, 10_000),
                (21, 3, ScriptType2Of3::P2wsh, 30_000),
                (30, 1, ScriptType2Of3::P2trMusig2, 40_000),
            ]
        );
        assert!(!explorer
            .queried
            .contains(&wallet_address(0, 4, ScriptType2Of3::P2sh)));
    }

    #[test]
    fn test_scan_skips_ignored_types() {
        let mut explorer = FakeExplorer::default();
        explorer.fund(10, 0, 1, 10_000, ScriptType2Of3::P2shP2wsh);
        let options = ScanOptions {
            gap: 3,
            ignore_script_types: vec![ScriptType2Of3::P2shP2wsh],
        };
        let found =
            scan_wallet_unspents(&mut explorer, &test_root_keys(), Coin::Tbtc.params(), &options)
                .unwrap();
        assert!(found.is_empty());
        assert!(!explorer
            .queried
            .contains(&wallet_address(10, 0, ScriptType2Of3::P2shP2wsh)));
        // four remaining types, two chains each, three addresses per chain
        assert_eq!(explorer.queried.len(), 4 * 2 * 3);
    }

    #[test]
    fn test_scan_errors() {
        let options = ScanOptions {
            gap: 0,
            ..Default::default()
        };
        let mut explorer = FakeExplorer::default();
        assert!(matches!(
            scan_wallet_unspents(&mut explorer, &test_root_keys(), Coin::Tbtc.params(), &options),
            Err(RecoveryError::InvalidScanGap)
        ));
        assert!(matches!(
            scan_wallet_unspents(
                &mut Offline,
                &test_root_keys(),
                Coin::Tbtc.params(),
                &ScanOptions::default()
            ),
            Err(RecoveryError::Lookup { .. })
        ));
    }

    #[test]
    fn test_user_and_backup_sweep_every_type() {
        let unspents = funded_wallet();
        assert_eq!(unspents.len(), 5);
        let req = request(unspents, None);
        let mut recovery = build_recovery_psbt(&req, &FeePolicy::default()).unwrap();
        assert_eq!(recovery.input_amount, Amount::from_sat(1_500_000));
        assert_eq!(recovery.recovery_amount, recovery.input_amount - recovery.fee);
        assert_eq!(recovery.psbt.state(), PsbtState::Unsigned);
        assert_eq!(
            recovery.fee,
            Dimensions::from_psbt(recovery.psbt.psbt()).unwrap().get_fee(2_000)
        );

        let keys = test_root_keys();
        let half = sign_recovery_psbt(&mut recovery.psbt, &test_signer(KeyRole::User), &keys).unwrap();
        assert!(half.is_none());
        let tx = sign_recovery_psbt(&mut recovery.psbt, &test_signer(KeyRole::Backup), &keys)
            .unwrap()
            .unwrap();
        assert_eq!(recovery.psbt.state(), PsbtState::Exported);

        assert_eq!(tx.output.len(), 1);
        assert_eq!(tx.output[0].value, recovery.recovery_amount);
        let types: Vec<_> = tx.input.iter().map(|i| classify_tx_input(i).unwrap()).collect();
        assert!(types.contains(&InputScriptType::P2trScriptPathLevel2));
        assert!(!types.contains(&InputScriptType::P2trKeypath));
        assert!(Dimensions::from_transaction(&tx).unwrap().get_vsize() >= tx.vsize());
    }

    #[test]
    fn test_provider_fee_and_half_signed_handoff() {
        let provider = ProviderFee {
            address: wallet_address(20, 900, ScriptType2Of3::P2wsh),
            amount: Amount::from_sat(50_000),
        };
        let req = request(funded_wallet(), Some(provider.clone()));
        let mut recovery = build_recovery_psbt(&req, &FeePolicy::default()).unwrap();
        let outputs = &recovery.psbt.psbt().unsigned_tx.output;
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[1].value, provider.amount);
        assert_eq!(
            recovery.recovery_amount,
            recovery.input_amount - recovery.fee - provider.amount
        );

        let keys = test_root_keys();
        assert!(sign_recovery_psbt(&mut recovery.psbt, &test_signer(KeyRole::User), &keys)
            .unwrap()
            .is_none());
        assert_eq!(recovery.psbt.state(), PsbtState::PartiallySigned);
        for valid in signature_validation(recovery.psbt.psbt(), &keys).unwrap() {
            assert_eq!(valid, [true, false, false]);
        }
    }

    #[test]
    fn test_zero_provider_fee_adds_no_output() {
        let provider = ProviderFee {
            address: wallet_address(20, 900, ScriptType2Of3::P2wsh),
            amount: Amount::ZERO,
        };
        let recovery =
            build_recovery_psbt(&request(funded_wallet(), Some(provider)), &FeePolicy::default())
                .unwrap();
        assert_eq!(recovery.psbt.psbt().unsigned_tx.output.len(), 1);
    }

    #[test]
    fn test_balance_too_low() {
        let mut explorer = FakeExplorer::default();
        explorer.fund(20, 0, 1, 1_000, ScriptType2Of3::P2wsh);
        let unspents = scan(&mut explorer, 2);
        let mut req = request(unspents, None);
        req.fee_rate_sat_per_kb = 10_000;
        assert!(matches!(
            build_recovery_psbt(&req, &FeePolicy::default()),
            Err(RecoveryError::BalanceTooLow { .. })
        ));
    }

    #[test]
    fn test_build_rejections() {
        let policy = FeePolicy::default();
        assert!(matches!(
            build_recovery_psbt(&request(Vec::new(), None), &policy),
            Err(RecoveryError::NoUnspents)
        ));

        let mut req = request(funded_wallet(), None);
        req.destination = "not an address".to_string();
        assert!(matches!(
            build_recovery_psbt(&req, &policy),
            Err(RecoveryError::Destination(_))
        ));

        let mut req = request(funded_wallet(), None);
        req.fee_rate_sat_per_kb = 1;
        assert!(matches!(
            build_recovery_psbt(&req, &policy),
            Err(RecoveryError::Build(BuildError::FeeRateTooLow { .. }))
        ));
    }

    #[test]
    fn test_bitgo_cannot_sign_recovery() {
        let mut recovery =
            build_recovery_psbt(&request(funded_wallet(), None), &FeePolicy::default()).unwrap();
        assert!(matches!(
            sign_recovery_psbt(
                &mut recovery.psbt,
                &test_signer(KeyRole::Bitgo),
                &test_root_keys()
            ),
            Err(RecoveryError::UnexpectedSigner(KeyRole::Bitgo))
        ));
    }
}
