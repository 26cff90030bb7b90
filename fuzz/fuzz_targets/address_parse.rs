#![no_main]

use coldsig_core::address::{from_output_script, to_output_script};
use coldsig_core::Coin;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Decoding arbitrary strings must return Ok or Err on every network.
    // Whatever decodes must encode back to the same script.
    if let Ok(s) = std::str::from_utf8(data) {
        for coin in Coin::ALL {
            let network = coin.params();
            if let Ok(script) = to_output_script(s, network) {
                let address = from_output_script(&script, network).expect("decoded script encodes");
                assert_eq!(to_output_script(&address, network).ok(), Some(script));
            }
        }
    }
});
