//! A vault wallet whose three keys all hang off one root key, and prebuilds
//! spending from it.

use bitcoin::absolute::LockTime;
use bitcoin::bip32::{Xpriv, Xpub};
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, Transaction, TxIn, TxOut, Txid};
use coldsig_core::address::from_output_script;
use coldsig_core::keys::{derive_key_with_seed, RootWalletKeys, WalletSigner};
use coldsig_core::scripts::create_output_script;
use coldsig_core::test_utils::{test_root_keys, test_xpriv};
use coldsig_core::{ChainCode, Coin, KeyRole, ScriptType2Of3, Triple};
use coldsig_psbt::encoding::{psbt_to_hex, tx_to_hex};
use coldsig_psbt::{
    build_wallet_psbt, BuildRequest, BuiltPsbt, ChangeRequest, FeePolicy, Recipient, Unspent,
};

use crate::descriptor::{descriptor_psbt_input, get_descriptor_at_index, WalletDescriptor};
use crate::prebuild::{
    NamedDescriptor, TransactionPrebuild, XpubWithDerivationPath, XpubsWithDerivationPath,
};

/// Seed of the user key, which is also the vault's derivation id.
pub const DERIVATION_ID: &str = "vault-user-7f3e";
pub const BACKUP_SEED: &str = "vault-backup-21c0";
pub const BITGO_SEED: &str = "vault-bitgo-9a4d";
pub const DESCRIPTOR_NAME: &str = "vault-main";
pub const WALLET_ID: &str = "62b1c0ffee";

pub fn vault_root() -> Xpriv {
    test_xpriv(0x42)
}

pub fn role_seed(role: KeyRole) -> &'static str {
    match role {
        KeyRole::User => DERIVATION_ID,
        KeyRole::Backup => BACKUP_SEED,
        KeyRole::Bitgo => BITGO_SEED,
    }
}

pub fn vault_signer(role: KeyRole) -> WalletSigner {
    WalletSigner::new(role, derive_key_with_seed(&vault_root(), role_seed(role)).unwrap())
}

pub fn vault_xpubs() -> Triple<Xpub> {
    KeyRole::ALL.map(|r| vault_signer(r).xpub())
}

pub fn vault_root_keys() -> RootWalletKeys {
    RootWalletKeys::new(vault_xpubs())
}

/// The `xpubs_with_derivation_path` block naming `xpubs` with the vault seeds.
pub fn claimed_xpubs(xpubs: &Triple<Xpub>) -> XpubsWithDerivationPath {
    let entry = |role: KeyRole| XpubWithDerivationPath {
        xpub: xpubs[role.index()].to_string(),
        derived_from_parent_with_seed: Some(role_seed(role).to_string()),
    };
    XpubsWithDerivationPath {
        user: entry(KeyRole::User),
        backup: entry(KeyRole::Backup),
        bitgo: entry(KeyRole::Bitgo),
    }
}

fn funding_tx(salt: u8, output: TxOut) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: Txid::from_byte_array([salt; 32]),
                vout: 0,
            },
            ..Default::default()
        }],
        output: vec![output],
    }
}

/// Vault unspent at `chain/index` with its funding transaction.
pub fn vault_unspent(
    chain: u32,
    index: u32,
    salt: u8,
    value: u64,
    script_type: ScriptType2Of3,
) -> Unspent {
    let keys = vault_root_keys()
        .derive_for_chain_and_index(chain, index)
        .unwrap();
    let spk = create_output_script(&keys.public_keys(), script_type)
        .unwrap()
        .script_pubkey;
    let funding = funding_tx(
        salt,
        TxOut {
            value: Amount::from_sat(value),
            script_pubkey: spk.clone(),
        },
    );
    let chain_type = ChainCode::try_from(chain).unwrap().script_type();
    Unspent {
        id: format!("{}:0", funding.compute_txid()),
        address: from_output_script(&spk, Coin::Tbtc.params()).unwrap(),
        value,
        chain: Some(chain),
        index: Some(index),
        script_type: (script_type != chain_type).then_some(script_type),
        prev_tx: Some(tx_to_hex(&funding)),
    }
}

/// Address outside the vault: the shared test wallet's p2wsh address.
pub fn external_address() -> String {
    let keys = test_root_keys().derive_for_chain_and_index(20, 0).unwrap();
    let spk = create_output_script(&keys.public_keys(), ScriptType2Of3::P2wsh)
        .unwrap()
        .script_pubkey;
    from_output_script(&spk, Coin::Tbtc.params()).unwrap()
}

/// tbtc address of the vault at `chain/index`, of the chain's script type.
pub fn vault_address(chain: u32, index: u32) -> String {
    let keys = vault_root_keys()
        .derive_for_chain_and_index(chain, index)
        .unwrap();
    let script_type = ChainCode::try_from(chain).unwrap().script_type();
    let spk = create_output_script(&keys.public_keys(), script_type)
        .unwrap()
        .script_pubkey;
    from_output_script(&spk, Coin::Tbtc.params()).unwrap()
}

/// Spend one 100k unspent per `(chain, type)` to an external address, with
/// change to chain 21 index 3.
pub fn vault_psbt(inputs: &[(u32, ScriptType2Of3)]) -> BuiltPsbt {
    let unspents = inputs
        .iter()
        .enumerate()
        .map(|(i, (chain, script_type))| {
            vault_unspent(*chain, i as u32, 0xa0 + i as u8, 100_000, *script_type)
        })
        .collect();
    let req = BuildRequest {
        network: *Coin::Tbtc.params(),
        root_keys: vault_root_keys(),
        unspents,
        recipients: vec![Recipient::to_address(
            external_address(),
            Amount::from_sat(30_000),
        )],
        fee_rate_sat_per_kb: 2_000,
        change: ChangeRequest {
            chain: 21,
            index: 3,
            address: vault_address(21, 3),
            script_type: None,
        },
    };
    build_wallet_psbt(&req, &FeePolicy::default()).unwrap()
}

pub fn prebuild_for(inputs: &[(u32, ScriptType2Of3)]) -> TransactionPrebuild {
    TransactionPrebuild {
        wallet_id: Some(WALLET_ID.to_string()),
        tx_hex: psbt_to_hex(vault_psbt(inputs).psbt.psbt()),
        xpubs_with_derivation_path: Some(claimed_xpubs(&vault_xpubs())),
        descriptors: None,
    }
}

/// One input of each multisig type, all signed through the user key.
pub const MIXED_INPUTS: [(u32, ScriptType2Of3); 4] = [
    (0, ScriptType2Of3::P2sh),
    (10, ScriptType2Of3::P2shP2wsh),
    (20, ScriptType2Of3::P2wsh),
    (30, ScriptType2Of3::P2tr),
];

pub fn wallet_prebuild() -> TransactionPrebuild {
    prebuild_for(&MIXED_INPUTS)
}

/// `wsh(multi(2, user/1/*, backup/1/*, bitgo/1/*))` over the vault keys.
pub fn vault_descriptor() -> String {
    let [user, backup, bitgo] = vault_xpubs();
    format!("wsh(multi(2,{}/1/*,{}/1/*,{}/1/*))", user, backup, bitgo)
}

/// [`wallet_prebuild`] plus a last input paid to [`vault_descriptor`] at index 3.
pub fn descriptor_prebuild() -> TransactionPrebuild {
    descriptor_prebuild_with(&vault_descriptor())
}

/// [`wallet_prebuild`] plus a last input paid to `descriptor` at index 3,
/// with the PSBT fields the descriptor fills in.
pub fn descriptor_prebuild_with(descriptor: &str) -> TransactionPrebuild {
    let mut built = vault_psbt(&MIXED_INPUTS);
    let parsed = WalletDescriptor::parse(descriptor).unwrap();
    let resolved = get_descriptor_at_index(&parsed, Some(3)).unwrap();
    let funding = funding_tx(
        0xd5,
        TxOut {
            value: Amount::from_sat(40_000),
            script_pubkey: resolved.script_pubkey(),
        },
    );
    let input = descriptor_psbt_input(&resolved, funding.output[0].clone()).unwrap();
    let psbt = built.psbt.psbt_mut();
    psbt.unsigned_tx.input.push(TxIn {
        previous_output: OutPoint {
            txid: funding.compute_txid(),
            vout: 0,
        },
        sequence: bitcoin::Sequence::MAX,
        ..Default::default()
    });
    psbt.inputs.push(input);
    TransactionPrebuild {
        wallet_id: Some(WALLET_ID.to_string()),
        tx_hex: psbt_to_hex(built.psbt.psbt()),
        xpubs_with_derivation_path: Some(claimed_xpubs(&vault_xpubs())),
        descriptors: Some(vec![NamedDescriptor {
            name: DESCRIPTOR_NAME.to_string(),
            value: descriptor.to_string(),
        }]),
    }
}
