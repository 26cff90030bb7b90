//! Security-specific tests for audit preparation.
//!
//! These tests verify:
//! 1. Tampered prebuilds are refused before any signature is made
//! 2. Previous-output data cannot be swapped under the signer
//! 3. Malformed inputs don't panic
//! 4. The vault never signs the same input twice

use bitcoin::hex::{DisplayHex, FromHex};
use bitcoin::{Amount, Psbt, ScriptBuf};
use coldsig_core::address::to_output_script;
use coldsig_core::test_utils::test_xpriv;
use coldsig_core::Coin;
use coldsig_psbt::encoding::{psbt_from_hex, psbt_from_str, psbt_to_hex};
use coldsig_psbt::{SignError, TxFormat};
use coldsig_vault::test_utils::{
    claimed_xpubs, descriptor_prebuild, vault_root, vault_xpubs, wallet_prebuild, DERIVATION_ID,
};
use coldsig_vault::{
    create_half_signed, SignedPrebuild, TransactionPrebuild, TxPart, VerificationError,
    WalletDescriptor,
};
use rand::{Rng, RngCore};

fn half_sign(prebuild: &TransactionPrebuild) -> Result<SignedPrebuild, VerificationError> {
    create_half_signed(Coin::Tbtc, &vault_root(), DERIVATION_ID, prebuild, TxFormat::Psbt)
}

/// `prebuild` with its PSBT rewritten by `edit`.
fn tampered(prebuild: &TransactionPrebuild, edit: impl FnOnce(&mut Psbt)) -> TransactionPrebuild {
    let mut psbt = prebuild.psbt().unwrap();
    edit(&mut psbt);
    TransactionPrebuild {
        tx_hex: psbt_to_hex(&psbt),
        ..prebuild.clone()
    }
}

// ============================================================================
// 1. Key substitution
// ============================================================================

#[test]
fn test_every_single_xpub_substitution_rejected() {
    for position in 0..3 {
        let mut xpubs = vault_xpubs();
        xpubs[position] = bitcoin::bip32::Xpub::from_priv(
            &bitcoin::secp256k1::Secp256k1::new(),
            &test_xpriv(0x90 + position as u8),
        );
        let mut prebuild = wallet_prebuild();
        prebuild.xpubs_with_derivation_path = Some(claimed_xpubs(&xpubs));

        let err = half_sign(&prebuild).unwrap_err();
        assert!(
            matches!(err, VerificationError::KeyMismatch { role } if role.index() == position),
            "position {}: {:?}",
            position,
            err
        );
    }
}

#[test]
fn test_wrong_vault_root_signs_nothing() {
    let err = create_half_signed(
        Coin::Tbtc,
        &test_xpriv(0x43),
        DERIVATION_ID,
        &wallet_prebuild(),
        TxFormat::Psbt,
    )
    .unwrap_err();
    assert!(matches!(err, VerificationError::KeyMismatch { .. }));
}

#[test]
fn test_descriptor_keys_must_be_wallet_keys() {
    let mut prebuild = descriptor_prebuild();
    let [user, backup, _] = vault_xpubs();
    let outsider = bitcoin::bip32::Xpub::from_priv(
        &bitcoin::secp256k1::Secp256k1::new(),
        &test_xpriv(0x77),
    );
    if let Some(descriptors) = prebuild.descriptors.as_mut() {
        descriptors[0].value = format!(
            "wsh(multi(2,{}/1/*,{}/1/*,{}/1/*))",
            user, backup, outsider
        );
    }
    assert!(matches!(
        half_sign(&prebuild).unwrap_err(),
        VerificationError::DescriptorKeyMismatch { .. }
    ));
}

// ============================================================================
// 2. Previous outputs and scripts
// ============================================================================

#[test]
fn test_segwit_prevout_value_inflation_rejected() {
    // input 2 is p2wsh and carries both the witness UTXO and the full prev tx
    let prebuild = tampered(&wallet_prebuild(), |psbt| {
        if let Some(utxo) = psbt.inputs[2].witness_utxo.as_mut() {
            utxo.value += Amount::from_sat(5_000_000);
        }
    });
    assert!(matches!(
        half_sign(&prebuild).unwrap_err(),
        VerificationError::PrevTxMismatch(2)
    ));
}

#[test]
fn test_foreign_prev_tx_rejected() {
    let prebuild = tampered(&wallet_prebuild(), |psbt| {
        let other = psbt.inputs[1].non_witness_utxo.clone();
        psbt.inputs[0].non_witness_utxo = other;
    });
    assert!(matches!(
        half_sign(&prebuild).unwrap_err(),
        VerificationError::PrevTxMismatch(0)
    ));
}

#[test]
fn test_foreign_tap_leaf_rejected() {
    // input 3 is the p2tr script path spend
    let prebuild = tampered(&wallet_prebuild(), |psbt| {
        for (script, _) in psbt.inputs[3].tap_scripts.values_mut() {
            *script = ScriptBuf::from_bytes(vec![0x51]);
        }
    });
    assert!(matches!(
        half_sign(&prebuild).unwrap_err(),
        VerificationError::ScriptMismatch {
            part: TxPart::Input,
            index: 3,
            ..
        }
    ));
}

#[test]
fn test_change_redirected_to_outsider_rejected() {
    let prebuild = tampered(&wallet_prebuild(), |psbt| {
        // still carries the wallet origins for chain 21 index 3
        psbt.unsigned_tx.output[1].script_pubkey = ScriptBuf::new_op_return([0u8; 4]);
    });
    assert!(matches!(
        half_sign(&prebuild).unwrap_err(),
        VerificationError::ScriptMismatch {
            part: TxPart::Output,
            index: 1,
            ..
        }
    ));
}

#[test]
fn test_recipient_is_not_wallet_output() {
    let verified = coldsig_vault::verify_prebuild(
        Coin::Tbtc.params(),
        &vault_root(),
        DERIVATION_ID,
        &wallet_prebuild(),
    )
    .unwrap();
    let recipient = &verified.psbt.unsigned_tx.output[0];
    assert_eq!(
        recipient.script_pubkey,
        to_output_script(
            &coldsig_vault::test_utils::external_address(),
            Coin::Tbtc.params()
        )
        .unwrap()
    );
    assert!(!verified.wallet_outputs.contains(&0));
}

// ============================================================================
// 3. Malformed input handling (no panics)
// ============================================================================

#[test]
fn test_random_prebuild_json_does_not_panic() {
    let mut rng = rand::thread_rng();
    for _ in 0..200 {
        let len = rng.gen_range(0..256);
        let bytes: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        let text = String::from_utf8_lossy(&bytes);
        if let Ok(prebuild) = TransactionPrebuild::from_json(&text) {
            let _ = half_sign(&prebuild);
        }
    }
}

#[test]
fn test_random_tx_hex_does_not_panic() {
    let base = wallet_prebuild();
    let mut rng = rand::thread_rng();
    for _ in 0..200 {
        let mut bytes = vec![0u8; rng.gen_range(0..512)];
        rng.fill_bytes(&mut bytes);
        let prebuild = TransactionPrebuild {
            tx_hex: bytes.to_lower_hex_string(),
            ..base.clone()
        };
        assert!(half_sign(&prebuild).is_err());
    }
}

#[test]
fn test_corrupted_psbt_does_not_panic() {
    let base = wallet_prebuild();
    let hex = psbt_to_hex(&base.psbt().unwrap());
    let mut rng = rand::thread_rng();
    for _ in 0..100 {
        let mut bytes = Vec::<u8>::from_hex(&hex).unwrap();
        let pos = rng.gen_range(0..bytes.len());
        bytes[pos] ^= 1u8 << rng.gen_range(0..8u32);
        let corrupted = bytes.to_lower_hex_string();
        let _ = psbt_from_str(&corrupted);
        let prebuild = TransactionPrebuild {
            tx_hex: corrupted,
            ..base.clone()
        };
        let _ = half_sign(&prebuild);
    }
}

#[test]
fn test_truncated_psbt_rejected() {
    let prebuild = wallet_prebuild();
    let truncated = TransactionPrebuild {
        tx_hex: prebuild.tx_hex[..prebuild.tx_hex.len() / 2].to_string(),
        ..prebuild
    };
    assert!(matches!(
        half_sign(&truncated).unwrap_err(),
        VerificationError::Encoding(_)
    ));
}

#[test]
fn test_garbage_descriptors_do_not_panic() {
    let inputs = [
        "",
        "wsh(",
        "wsh(multi(2))",
        "wsh(multi(2,xpub/1/*))",
        "sh(wpkh(02deadbeef))",
        "wsh(multi(2,[00000000/0h]xpub6/<0;1>/*))",
        "tr(",
    ];
    for input in inputs {
        assert!(WalletDescriptor::parse(input).is_err(), "{}", input);
    }
}

// ============================================================================
// 4. No double signing
// ============================================================================

#[test]
fn test_already_half_signed_prebuild_refused() {
    let prebuild = wallet_prebuild();
    let signed = half_sign(&prebuild).unwrap();
    let resubmitted = TransactionPrebuild {
        tx_hex: signed.tx_hex,
        ..prebuild
    };
    assert!(matches!(
        half_sign(&resubmitted).unwrap_err(),
        VerificationError::Sign(SignError::AlreadySigned { .. })
    ));
}

#[test]
fn test_half_signed_psbt_has_no_cosigner_signatures() {
    let signed = half_sign(&wallet_prebuild()).unwrap();
    let psbt = psbt_from_hex(&signed.tx_hex).unwrap();
    for input in &psbt.inputs {
        assert_eq!(coldsig_psbt::signature_count(input), 1);
        assert!(input.final_script_sig.is_none());
        assert!(input.final_script_witness.is_none());
    }
}
