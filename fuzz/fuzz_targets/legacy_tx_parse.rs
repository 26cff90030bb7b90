#![no_main]

use bitcoin::consensus::deserialize;
use bitcoin::Transaction;
use coldsig_core::classify::classify_tx_input;
use coldsig_psbt::legacy::is_half_signed_script_sig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes as a transaction, then every input through the
    // spend classifier and the half-signed detector.
    if let Ok(tx) = deserialize::<Transaction>(data) {
        for txin in &tx.input {
            let _ = classify_tx_input(txin);
            let _ = is_half_signed_script_sig(&txin.script_sig);
        }
    }
});
