//! Deterministic wallet fixtures for tests.
//!
//! Root keys are BIP-32 masters built from a fixed 32-byte seed per role, so
//! every test in the workspace sees the same wallet.

use bitcoin::bip32::{Xpriv, Xpub};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::NetworkKind;

use crate::keys::{RootWalletKeys, WalletSigner};
use crate::{KeyRole, Triple};

/// Generate a deterministic keypair from a seed byte.
///
/// The secret key is `[0x01, 0x00, ..., 0x00, seed]` (32 bytes).
pub fn test_keypair(seed_byte: u8) -> (SecretKey, PublicKey) {
    let secp = Secp256k1::new();
    let mut secret_bytes = [0u8; 32];
    secret_bytes[31] = seed_byte;
    secret_bytes[0] = 0x01;
    let sk = SecretKey::from_slice(&secret_bytes).unwrap();
    let pk = sk.public_key(&secp);
    (sk, pk)
}

/// Master key built from the seed `[seed_byte; 32]`.
pub fn test_xpriv(seed_byte: u8) -> Xpriv {
    Xpriv::new_master(NetworkKind::Test, &[seed_byte; 32]).unwrap()
}

fn role_seed(role: KeyRole) -> u8 {
    match role {
        KeyRole::User => 0x11,
        KeyRole::Backup => 0x22,
        KeyRole::Bitgo => 0x33,
    }
}

pub fn test_signer(role: KeyRole) -> WalletSigner {
    WalletSigner::new(role, test_xpriv(role_seed(role)))
}

pub fn test_root_xpubs() -> Triple<Xpub> {
    KeyRole::ALL.map(|r| test_signer(r).xpub())
}

pub fn test_root_keys() -> RootWalletKeys {
    RootWalletKeys::new(test_root_xpubs())
}

/// Three distinct compressed keys in (user, backup, bitgo) order.
pub fn test_pubkeys() -> Triple<PublicKey> {
    [test_keypair(1).1, test_keypair(2).1, test_keypair(3).1]
}
