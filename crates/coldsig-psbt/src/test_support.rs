//! Wallet unspents backed by synthetic previous transactions.

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, Transaction, TxIn, TxOut, Txid};
use coldsig_core::address::from_output_script;
use coldsig_core::scripts::create_output_script;
use coldsig_core::test_utils::test_root_keys;
use coldsig_core::{ChainCode, Coin, ScriptType2Of3};

use crate::builder::{BuildRequest, ChangeRequest};
use crate::encoding::tx_to_hex;
use crate::unspent::{Recipient, Unspent};

/// tbtc address of the test wallet at `chain/index`.
pub fn wallet_address(chain: u32, index: u32, script_type: ScriptType2Of3) -> String {
    let keys = test_root_keys()
        .derive_for_chain_and_index(chain, index)
        .unwrap();
    let spk = create_output_script(&keys.public_keys(), script_type)
        .unwrap()
        .script_pubkey;
    from_output_script(&spk, Coin::Tbtc.params()).unwrap()
}

/// Unspent at `chain/index` paying `value`, funded by a one-output transaction.
/// `salt` keeps the funding txids apart.
pub fn unspent_of_type(
    chain: u32,
    index: u32,
    salt: u8,
    value: u64,
    script_type: ScriptType2Of3,
) -> Unspent {
    let keys = test_root_keys()
        .derive_for_chain_and_index(chain, index)
        .unwrap();
    let spk = create_output_script(&keys.public_keys(), script_type)
        .unwrap()
        .script_pubkey;
    let funding = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: Txid::from_byte_array([salt; 32]),
                vout: 0,
            },
            ..Default::default()
        }],
        output: vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: spk.clone(),
        }],
    };
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

pub fn unspent_on_chain(chain: u32, index: u32, salt: u8, value: u64) -> Unspent {
    let script_type = ChainCode::try_from(chain).unwrap().script_type();
    unspent_of_type(chain, index, salt, value, script_type)
}

/// Pay 20k sats to a p2sh address, change to p2wsh chain 21 index 7.
pub fn simple_request(unspents: Vec<Unspent>) -> BuildRequest {
    BuildRequest {
        network: *Coin::Tbtc.params(),
        root_keys: test_root_keys(),
        unspents,
        recipients: vec![Recipient::to_address(
            wallet_address(0, 100, ScriptType2Of3::P2sh),
            Amount::from_sat(20_000),
        )],
        fee_rate_sat_per_kb: 1_000,
        change: ChangeRequest {
            chain: 21,
            index: 7,
            address: wallet_address(21, 7, ScriptType2Of3::P2wsh),
            script_type: None,
        },
    }
}
