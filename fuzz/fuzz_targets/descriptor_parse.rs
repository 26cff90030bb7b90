#![no_main]

use coldsig_vault::{get_descriptor_at_index, WalletDescriptor};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(descriptor) = WalletDescriptor::parse(s) {
            // Exactly one of the two index forms resolves.
            let with_index = get_descriptor_at_index(&descriptor, Some(0)).is_ok();
            let without = get_descriptor_at_index(&descriptor, None).is_ok();
            assert!(!(with_index && without));
        }
    }
});
