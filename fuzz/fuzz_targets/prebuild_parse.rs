#![no_main]

use bitcoin::bip32::Xpriv;
use bitcoin::NetworkKind;
use coldsig_core::Coin;
use coldsig_psbt::TxFormat;
use coldsig_vault::{create_half_signed, TransactionPrebuild};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Parse arbitrary JSON as a prebuild and run the full verification.
    // Nothing short of a valid prebuild for this root may be signed.
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(prebuild) = TransactionPrebuild::from_json(s) else {
        return;
    };
    let _ = prebuild.psbt();
    let Ok(root) = Xpriv::new_master(NetworkKind::Test, &[0x42; 32]) else {
        return;
    };
    for format in [TxFormat::Psbt, TxFormat::Legacy] {
        let _ = create_half_signed(Coin::Tbtc, &root, "fuzz", &prebuild, format);
    }
});
