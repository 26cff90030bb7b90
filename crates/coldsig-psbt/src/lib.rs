//! # coldsig PSBT
//!
//! Assembly, signing and finalization of PSBTs spending 2-of-3 wallet outputs.
//!
//! A spend moves through
//! `Empty → Unsigned → PartiallySigned → FullySigned → Exported`:
//!
//! 1. [`build_wallet_psbt`] checks every claimed unspent and the change
//!    address against the wallet keys, sizes the transaction and balances it
//! 2. [`sign_wallet_psbt`] adds one signer's signatures
//! 3. [`finalize_wallet_psbt`] builds the final scripts once two keys signed
//! 4. [`to_broadcast_format`] encodes the network transaction
//!
//! Without the bitgo key, [`recovery`] sweeps a wallet with the user and
//! backup keys.
//!
//! Half-signed transactions can also leave and re-enter as legacy
//! (non-PSBT) transactions, see [`legacy`].

pub mod builder;
pub mod encoding;
pub mod finalize;
pub mod legacy;
pub mod policy;
pub mod recovery;
pub mod sign;
pub mod unspent;

#[cfg(test)]
pub(crate) mod test_support;

pub use builder::{
    build_wallet_psbt, prevout, BuildError, BuildRequest, BuiltPsbt, ChangeRequest, InputOptions,
    PsbtState, WalletPsbt,
};
pub use encoding::{EncodingError, TxFormat};
pub use finalize::{
    extract_transaction, finalize_input, finalize_wallet_psbt, to_broadcast_format, FinalizeError,
};
pub use legacy::{extract_half_signed_legacy_tx, psbt_from_half_signed_legacy_tx, LegacyError};
pub use policy::FeePolicy;
pub use recovery::{
    build_recovery_psbt, scan_wallet_unspents, sign_recovery_psbt, AddressActivity, FoundOutput,
    ProviderFee, RecoveryError, RecoveryPsbt, RecoveryRequest, ScanOptions, UnspentLookup,
};
pub use sign::{
    sign_input, sign_input_with_keys, sign_musig2_key_path, sign_wallet_psbt, signature_count,
    signature_validation, SignError, SigningReport,
};
pub use unspent::{
    Destination, Recipient, ReplayProtectionUnspent, SpendableUnspent, Unspent, UnspentError,
    WalletUnspent,
};
