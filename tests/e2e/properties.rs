//! Randomized property checks across the crates.
//!
//! Each test draws its cases from `rand` and checks an invariant that must
//! hold for every draw: chain code closure, deterministic derivation,
//! address round trips, fee arithmetic and transaction balance.

use bitcoin::Amount;
use coldsig_core::address::{from_output_script, is_valid_address, to_output_script};
use coldsig_core::classify::InputScriptType;
use coldsig_core::codes;
use coldsig_core::scripts::create_output_script_for_network;
use coldsig_core::{ChainCode, Coin};
use coldsig_dimensions::Dimensions;
use coldsig_psbt::{
    build_wallet_psbt, prevout, BuildError, BuildRequest, ChangeRequest, FeePolicy, Recipient,
};
use coldsig_vault::test_utils::{
    external_address, vault_address, vault_descriptor, vault_root_keys, vault_unspent,
};
use coldsig_vault::{get_descriptor_at_index, DescriptorError, WalletDescriptor};
use rand::seq::SliceRandom;
use rand::Rng;

const CASES: usize = 64;

const INPUT_TYPES: [InputScriptType; 7] = [
    InputScriptType::P2sh,
    InputScriptType::P2shP2wsh,
    InputScriptType::P2wsh,
    InputScriptType::P2trKeypath,
    InputScriptType::P2trScriptPathLevel1,
    InputScriptType::P2trScriptPathLevel2,
    InputScriptType::P2shP2pk,
];

fn random_dimensions(rng: &mut impl Rng) -> Dimensions {
    let n = rng.gen_range(0..6);
    let inputs = Dimensions::sum(
        (0..n).map(|_| Dimensions::from_input_type(*INPUT_TYPES.choose(&mut *rng).unwrap())),
    );
    let outputs = Dimensions::from_output_script_length(rng.gen_range(22..35));
    inputs + outputs.times(rng.gen_range(1..4))
}

// ============================================================================
// Chain codes
// ============================================================================

#[test]
fn test_chain_code_registry_is_closed() {
    let registry = [0, 1, 10, 11, 20, 21, 30, 31];
    for code in -5i64..=50 {
        let valid = registry.contains(&code);
        assert_eq!(codes::is_valid(code), valid, "code {}", code);
        if !valid {
            assert!(codes::is_external(code).is_err());
            assert!(codes::is_internal(code).is_err());
            assert!(codes::script_type_for_code(code).is_err());
            continue;
        }
        let external = codes::is_external(code).unwrap();
        assert_ne!(external, codes::is_internal(code).unwrap());
        let pair = codes::for_type(codes::script_type_for_code(code).unwrap()).unwrap();
        let expected = if external { pair.external } else { pair.internal };
        assert_eq!(i64::from(expected.value()), code);
    }
}

// ============================================================================
// Derivation and addresses
// ============================================================================

#[test]
fn test_derivation_is_deterministic() {
    let mut rng = rand::thread_rng();
    let root_keys = vault_root_keys();
    for _ in 0..CASES {
        let chain = *ChainCode::all().choose(&mut rng).unwrap();
        let index = rng.gen_range(0..1_000_000);
        let a = root_keys.derive(chain, index).unwrap();
        let b = root_keys.derive(chain, index).unwrap();
        assert_eq!(a.public_keys(), b.public_keys());

        let next = root_keys.derive(chain, index + 1).unwrap();
        assert_ne!(a.public_keys(), next.public_keys());
    }
}

#[test]
fn test_address_round_trip_on_every_network() {
    let mut rng = rand::thread_rng();
    let root_keys = vault_root_keys();
    for _ in 0..CASES {
        let chain = *ChainCode::all().choose(&mut rng).unwrap();
        let index = rng.gen_range(0..10_000);
        let keys = root_keys.derive(chain, index).unwrap().public_keys();
        for coin in Coin::ALL {
            let network = coin.params();
            let script_type = chain.script_type();
            if !network.supports_script_type(script_type) {
                assert!(create_output_script_for_network(&keys, script_type, network).is_err());
                continue;
            }
            let spk = create_output_script_for_network(&keys, script_type, network)
                .unwrap()
                .script_pubkey;
            let address = from_output_script(&spk, network).unwrap();
            assert!(is_valid_address(&address, network), "{} {}", coin.name(), address);
            assert_eq!(to_output_script(&address, network).unwrap(), spk);
        }
    }
}

#[test]
fn test_mainnet_addresses_rejected_on_testnet() {
    let mut rng = rand::thread_rng();
    let root_keys = vault_root_keys();
    for _ in 0..CASES {
        let chain = *ChainCode::all().choose(&mut rng).unwrap();
        let keys = root_keys.derive(chain, rng.gen_range(0..10_000)).unwrap();
        let spk = create_output_script_for_network(
            &keys.public_keys(),
            chain.script_type(),
            Coin::Btc.params(),
        )
        .unwrap()
        .script_pubkey;
        let address = from_output_script(&spk, Coin::Btc.params()).unwrap();
        assert!(!is_valid_address(&address, Coin::Tbtc.params()));
    }
}

// ============================================================================
// Descriptors
// ============================================================================

#[test]
fn test_descriptor_index_discipline() {
    let mut rng = rand::thread_rng();
    let derivable = WalletDescriptor::parse(&vault_descriptor()).unwrap();
    assert!(matches!(
        get_descriptor_at_index(&derivable, None),
        Err(DescriptorError::IndexRequired(_))
    ));

    for _ in 0..16 {
        let index = rng.gen_range(0..0x8000_0000u32);
        let resolved = get_descriptor_at_index(&derivable, Some(index)).unwrap();
        let again = get_descriptor_at_index(&derivable, Some(index)).unwrap();
        assert_eq!(resolved.script_pubkey(), again.script_pubkey());

        let hardened = index | 0x8000_0000;
        assert!(get_descriptor_at_index(&derivable, Some(hardened)).is_err());

        // A resolved descriptor parses back as definite and takes no index
        let definite = WalletDescriptor::parse(&resolved.to_string()).unwrap();
        assert!(!definite.is_derivable());
        assert!(matches!(
            get_descriptor_at_index(&definite, Some(index)),
            Err(DescriptorError::IndexNotAllowed { .. })
        ));
        let same = get_descriptor_at_index(&definite, None).unwrap();
        assert_eq!(same.script_pubkey(), resolved.script_pubkey());
    }
}

// ============================================================================
// Fees and balance
// ============================================================================

#[test]
fn test_dimensions_input_sizes_are_additive() {
    let mut rng = rand::thread_rng();
    for _ in 0..CASES {
        let a = random_dimensions(&mut rng);
        let b = random_dimensions(&mut rng);
        let sum = a + b;
        assert_eq!(sum.n_inputs(), a.n_inputs() + b.n_inputs());
        assert_eq!(sum.n_outputs(), a.n_outputs() + b.n_outputs());
        assert_eq!(
            sum.get_inputs_vsize(),
            a.get_inputs_vsize() + b.get_inputs_vsize()
        );
        assert_eq!(
            sum.get_outputs_vsize(),
            a.get_outputs_vsize() + b.get_outputs_vsize()
        );
        assert_eq!(a.plus(&b), sum);
    }
}

#[test]
fn test_fee_is_monotonic_in_rate_and_size() {
    let mut rng = rand::thread_rng();
    for _ in 0..CASES {
        let d = random_dimensions(&mut rng);
        let low = rng.gen_range(1_000..100_000u64);
        let high = low + rng.gen_range(0..100_000u64);
        assert!(d.get_fee(low) <= d.get_fee(high));

        let bigger = d + Dimensions::from_input_type(*INPUT_TYPES.choose(&mut rng).unwrap());
        assert!(d.get_fee(low) <= bigger.get_fee(low));
        // at least vsize * rate / 1000, rounded up
        let floor = (d.get_vsize() as u64 * low).div_ceil(1000);
        assert_eq!(d.get_fee(low), Amount::from_sat(floor));
    }
}

#[test]
fn test_built_transactions_balance() {
    let mut rng = rand::thread_rng();
    let unspents = vec![
        vault_unspent(20, 0, 0xb0, 100_000, coldsig_core::ScriptType2Of3::P2wsh),
        vault_unspent(0, 1, 0xb1, 100_000, coldsig_core::ScriptType2Of3::P2sh),
    ];
    for _ in 0..CASES {
        let amount = rng.gen_range(1_000..=210_000u64);
        let rate = rng.gen_range(1_000..=20_000u64);
        let req = BuildRequest {
            network: *Coin::Tbtc.params(),
            root_keys: vault_root_keys(),
            unspents: unspents.clone(),
            recipients: vec![Recipient::to_address(
                external_address(),
                Amount::from_sat(amount),
            )],
            fee_rate_sat_per_kb: rate,
            change: ChangeRequest {
                chain: 21,
                index: 0,
                address: vault_address(21, 0),
                script_type: None,
            },
        };
        match build_wallet_psbt(&req, &FeePolicy::default()) {
            Ok(built) => {
                let psbt = built.psbt.psbt();
                let spent: u64 = (0..psbt.inputs.len())
                    .map(|i| prevout(psbt, i).unwrap().value.to_sat())
                    .sum();
                let paid: u64 = psbt.unsigned_tx.output.iter().map(|o| o.value.to_sat()).sum();
                assert_eq!(spent - paid, built.absolute_fee().to_sat());
                assert!(built.fee.to_sat() >= (built.vsize as u64 * rate).div_ceil(1000));
                assert_eq!(psbt.unsigned_tx.output[0].value, Amount::from_sat(amount));
            }
            Err(BuildError::InsufficientFunds { .. }) => {
                assert!(amount > 180_000, "amount {} rate {}", amount, rate);
            }
            Err(e) => panic!("amount {} rate {}: {}", amount, rate, e),
        }
    }
}
