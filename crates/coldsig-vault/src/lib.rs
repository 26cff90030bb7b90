//! # coldsig vault
//!
//! Air-gapped side of a 2-of-3 wallet. An online service prepares a
//! [`TransactionPrebuild`]; the vault holds one root private key from which
//! all three wallet keys were derived at per-role seeds. [`create_half_signed`]
//! re-derives every claimed key and script from that root and only signs
//! once nothing in the prebuild disagrees with it.
//!
//! Descriptor wallets ship their output descriptors inside the prebuild, see
//! [`descriptor`].

pub mod descriptor;
pub mod half_signed;
pub mod prebuild;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use descriptor::{
    assert_descriptor_keys, descriptor_psbt_input, find_matching_descriptor,
    get_descriptor_at_index, DescriptorError, DescriptorMatch, WalletDescriptor,
};
pub use half_signed::{
    create_half_signed, verify_prebuild, TxPart, VerificationError, VerifiedInput,
    VerifiedPrebuild,
};
pub use prebuild::{
    NamedDescriptor, SignedPrebuild, TransactionPrebuild, XpubWithDerivationPath,
    XpubsWithDerivationPath,
};
