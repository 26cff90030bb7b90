//! Wallet key triple and BIP-32 derivation.
//!
//! A wallet's keys are derived as `prefix/chain/index` below each root key,
//! where the prefix defaults to `m/0/0`. The same chain and index are used for
//! all three roles so that a single (chain, index) pair identifies one address.

use bitcoin::bip32::{self, ChildNumber, DerivationPath, Fingerprint, KeySource, Xpriv, Xpub};
use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use thiserror::Error;

use crate::codes::{ChainCode, InvalidChainCode};
use crate::{KeyRole, Triple};

#[derive(Debug, Error)]
pub enum KeyError {
    #[error(transparent)]
    InvalidChainCode(#[from] InvalidChainCode),

    #[error("derivation index {0} is not a normal (unhardened) index")]
    InvalidIndex(u32),

    #[error("BIP-32 derivation failed: {0}")]
    Derivation(#[from] bip32::Error),

    #[error("signer key does not match the wallet's {0} key")]
    SignerMismatch(KeyRole),
}

/// Default prefix placed in front of `chain/index`.
pub fn default_derivation_prefix() -> DerivationPath {
    DerivationPath::from(vec![ChildNumber::Normal { index: 0 }, ChildNumber::Normal { index: 0 }])
}

fn normal(index: u32) -> Result<ChildNumber, KeyError> {
    ChildNumber::from_normal_idx(index).map_err(|_| KeyError::InvalidIndex(index))
}

// ─── Root keys ──────────────────────────────────────────────────────────────

/// The (user, backup, bitgo) root extended public keys of a wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootWalletKeys {
    triple: Triple<Xpub>,
    prefixes: Triple<DerivationPath>,
}

impl RootWalletKeys {
    pub fn new(triple: Triple<Xpub>) -> Self {
        Self::with_derivation_prefixes(
            triple,
            [
                default_derivation_prefix(),
                default_derivation_prefix(),
                default_derivation_prefix(),
            ],
        )
    }

    pub fn with_derivation_prefixes(triple: Triple<Xpub>, prefixes: Triple<DerivationPath>) -> Self {
        Self { triple, prefixes }
    }

    pub fn triple(&self) -> &Triple<Xpub> {
        &self.triple
    }

    pub fn get(&self, role: KeyRole) -> &Xpub {
        &self.triple[role.index()]
    }

    pub fn user(&self) -> &Xpub {
        self.get(KeyRole::User)
    }

    pub fn backup(&self) -> &Xpub {
        self.get(KeyRole::Backup)
    }

    pub fn bitgo(&self) -> &Xpub {
        self.get(KeyRole::Bitgo)
    }

    pub fn derivation_prefix(&self, role: KeyRole) -> &DerivationPath {
        &self.prefixes[role.index()]
    }

    pub fn role_of(&self, xpub: &Xpub) -> Option<KeyRole> {
        KeyRole::ALL.into_iter().find(|r| self.get(*r) == xpub)
    }

    pub fn role_of_fingerprint(&self, fingerprint: Fingerprint) -> Option<KeyRole> {
        KeyRole::ALL
            .into_iter()
            .find(|r| self.get(*r).fingerprint() == fingerprint)
    }

    /// Full path (relative to the root key) for `role` at `chain/index`.
    pub fn derivation_path(
        &self,
        role: KeyRole,
        chain: ChainCode,
        index: u32,
    ) -> Result<DerivationPath, KeyError> {
        Ok(self
            .derivation_prefix(role)
            .child(normal(chain.value())?)
            .child(normal(index)?))
    }

    /// Split a key path back into `(chain, index)` if it has this wallet's
    /// prefix for `role` and a registered chain code.
    pub fn parse_derivation_path(
        &self,
        role: KeyRole,
        path: &DerivationPath,
    ) -> Option<(ChainCode, u32)> {
        let prefix: &[ChildNumber] = self.derivation_prefix(role).as_ref();
        let children: &[ChildNumber] = path.as_ref();
        if children.len() != prefix.len() + 2 || !children.starts_with(prefix) {
            return None;
        }
        match &children[prefix.len()..] {
            [ChildNumber::Normal { index: chain }, ChildNumber::Normal { index }] => {
                ChainCode::try_from(*chain).ok().map(|c| (c, *index))
            }
            _ => None,
        }
    }

    /// Derive the three wallet keys for a raw chain code and index.
    pub fn derive_for_chain_and_index(
        &self,
        chain: u32,
        index: u32,
    ) -> Result<DerivedWalletKeys, KeyError> {
        let chain = ChainCode::try_from(chain)?;
        self.derive(chain, index)
    }

    pub fn derive(&self, chain: ChainCode, index: u32) -> Result<DerivedWalletKeys, KeyError> {
        let secp = Secp256k1::verification_only();
        let mut keys = Vec::with_capacity(3);
        let mut paths = Vec::with_capacity(3);
        for role in KeyRole::ALL {
            let path = self.derivation_path(role, chain, index)?;
            keys.push(self.get(role).derive_pub(&secp, &path)?);
            paths.push(path);
        }
        Ok(DerivedWalletKeys {
            chain,
            index,
            keys: [keys[0], keys[1], keys[2]],
            paths: [paths[0].clone(), paths[1].clone(), paths[2].clone()],
            fingerprints: self.triple.map(|x| x.fingerprint()),
        })
    }
}

/// Keys of the three roles at one `chain/index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedWalletKeys {
    pub chain: ChainCode,
    pub index: u32,
    keys: Triple<Xpub>,
    paths: Triple<DerivationPath>,
    fingerprints: Triple<Fingerprint>,
}

impl DerivedWalletKeys {
    pub fn public_keys(&self) -> Triple<PublicKey> {
        self.keys.map(|x| x.public_key)
    }

    pub fn public_key(&self, role: KeyRole) -> PublicKey {
        self.keys[role.index()].public_key
    }

    pub fn xpub(&self, role: KeyRole) -> &Xpub {
        &self.keys[role.index()]
    }

    pub fn path(&self, role: KeyRole) -> &DerivationPath {
        &self.paths[role.index()]
    }

    /// Origin of the derived key: root fingerprint plus full path.
    pub fn key_source(&self, role: KeyRole) -> KeySource {
        (self.fingerprints[role.index()], self.paths[role.index()].clone())
    }
}

// ─── Signer ─────────────────────────────────────────────────────────────────

/// One role's root private key.
#[derive(Clone)]
pub struct WalletSigner {
    role: KeyRole,
    xpriv: Xpriv,
}

impl std::fmt::Debug for WalletSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletSigner")
            .field("role", &self.role)
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

impl WalletSigner {
    pub fn new(role: KeyRole, xpriv: Xpriv) -> Self {
        Self { role, xpriv }
    }

    pub fn role(&self) -> KeyRole {
        self.role
    }

    pub fn xpub(&self) -> Xpub {
        Xpub::from_priv(&Secp256k1::new(), &self.xpriv)
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.xpub().fingerprint()
    }

    /// Whether this signer holds the private half of `root_keys`' key for its role.
    pub fn belongs_to(&self, root_keys: &RootWalletKeys) -> bool {
        root_keys.get(self.role) == &self.xpub()
    }

    /// Derive the keypair at `path` (relative to this signer's root).
    pub fn derive_at(&self, path: &DerivationPath) -> Result<(SecretKey, PublicKey), KeyError> {
        let secp = Secp256k1::new();
        let child = self.xpriv.derive_priv(&secp, path)?;
        let sk = child.private_key;
        Ok((sk, sk.public_key(&secp)))
    }

    /// Signing key for a wallet address; fails if this signer is not part of the wallet.
    pub fn derive_signing_key(
        &self,
        root_keys: &RootWalletKeys,
        chain: ChainCode,
        index: u32,
    ) -> Result<SecretKey, KeyError> {
        if !self.belongs_to(root_keys) {
            return Err(KeyError::SignerMismatch(self.role));
        }
        let path = root_keys.derivation_path(self.role, chain, index)?;
        Ok(self.derive_at(&path)?.0)
    }
}

// ─── Seed-based derivation ──────────────────────────────────────────────────

/// Path `m/999999/a/b` where `a` and `b` are the first and second groups of
/// seven hex digits of `sha256(sha256(seed))`.
pub fn derivation_path_for_seed(seed: &str) -> DerivationPath {
    let once = sha256::Hash::hash(seed.as_bytes());
    let twice = sha256::Hash::hash(once.as_byte_array());
    let digest = twice.to_byte_array();
    // 28 bits each: nibbles 0..7 and 7..14 of the digest
    let a = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) >> 4;
    let b = u32::from_be_bytes([digest[3] & 0x0f, digest[4], digest[5], digest[6]]);
    DerivationPath::from(vec![
        ChildNumber::Normal { index: 999_999 },
        ChildNumber::Normal { index: a },
        ChildNumber::Normal { index: b },
    ])
}

pub fn derive_key_with_seed(root: &Xpriv, seed: &str) -> Result<Xpriv, KeyError> {
    let secp = Secp256k1::new();
    Ok(root.derive_priv(&secp, &derivation_path_for_seed(seed))?)
}

pub fn derive_xpub_with_seed(root: &Xpub, seed: &str) -> Result<Xpub, KeyError> {
    let secp = Secp256k1::verification_only();
    Ok(root.derive_pub(&secp, &derivation_path_for_seed(seed))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_root_keys, test_signer};
    use std::str::FromStr;

    #[test]
    fn test_derivation_is_deterministic() {
        let keys = test_root_keys();
        let a = keys.derive_for_chain_and_index(20, 7).unwrap();
        let b = keys.derive_for_chain_and_index(20, 7).unwrap();
        assert_eq!(a, b);
        assert_ne!(a.public_keys(), keys.derive_for_chain_and_index(21, 7).unwrap().public_keys());
        assert_ne!(a.public_keys(), keys.derive_for_chain_and_index(20, 8).unwrap().public_keys());
    }

    #[test]
    fn test_paths_use_prefix_chain_index() {
        let keys = test_root_keys();
        let derived = keys.derive_for_chain_and_index(11, 3).unwrap();
        assert_eq!(
            derived.path(KeyRole::Backup),
            &DerivationPath::from_str("m/0/0/11/3").unwrap()
        );
        let (fp, path) = derived.key_source(KeyRole::User);
        assert_eq!(fp, keys.user().fingerprint());
        assert_eq!(keys.parse_derivation_path(KeyRole::User, &path), Some((ChainCode::new(11).unwrap(), 3)));
    }

    #[test]
    fn test_invalid_chain_and_index_rejected() {
        let keys = test_root_keys();
        assert!(matches!(
            keys.derive_for_chain_and_index(2, 0),
            Err(KeyError::InvalidChainCode(InvalidChainCode::Code(2)))
        ));
        assert!(matches!(
            keys.derive_for_chain_and_index(0, 1 << 31),
            Err(KeyError::InvalidIndex(_))
        ));
    }

    #[test]
    fn test_parse_rejects_foreign_paths() {
        let keys = test_root_keys();
        for p in ["m/1/3", "m/0/0/12/3", "m/0/1/0/3", "m/0/0/0/3/1", "m/0/0/0h/3"] {
            let path = DerivationPath::from_str(p).unwrap();
            assert_eq!(keys.parse_derivation_path(KeyRole::User, &path), None, "{}", p);
        }
    }

    #[test]
    fn test_custom_prefix() {
        let base = test_root_keys();
        let prefix = DerivationPath::from_str("m/5").unwrap();
        let keys = RootWalletKeys::with_derivation_prefixes(
            *base.triple(),
            [prefix.clone(), prefix.clone(), prefix],
        );
        let derived = keys.derive_for_chain_and_index(0, 0).unwrap();
        assert_eq!(derived.path(KeyRole::Bitgo), &DerivationPath::from_str("m/5/0/0").unwrap());
    }

    #[test]
    fn test_signer_key_matches_derived_pubkey() {
        let keys = test_root_keys();
        let signer = test_signer(KeyRole::Backup);
        let chain = ChainCode::new(30).unwrap();
        let sk = signer.derive_signing_key(&keys, chain, 4).unwrap();
        let derived = keys.derive(chain, 4).unwrap();
        assert_eq!(sk.public_key(&Secp256k1::new()), derived.public_key(KeyRole::Backup));

        let wrong_role = WalletSigner::new(KeyRole::User, test_signer(KeyRole::Backup).xpriv);
        assert!(matches!(
            wrong_role.derive_signing_key(&keys, chain, 4),
            Err(KeyError::SignerMismatch(KeyRole::User))
        ));
    }

    #[test]
    fn test_seed_path_shape() {
        let path = derivation_path_for_seed("wallet-1");
        let children: &[ChildNumber] = path.as_ref();
        assert_eq!(children.len(), 3);
        assert_eq!(children[0], ChildNumber::Normal { index: 999_999 });
        for c in &children[1..] {
            match c {
                ChildNumber::Normal { index } => assert!(*index < (1 << 28)),
                _ => panic!("hardened child in seed path"),
            }
        }
        assert_ne!(path, derivation_path_for_seed("wallet-2"));
    }

    #[test]
    fn test_seed_path_matches_hex_digits() {
        let seed = "abc";
        let once = sha256::Hash::hash(seed.as_bytes());
        let twice = sha256::Hash::hash(once.as_byte_array());
        let hex = hex::encode(twice.to_byte_array());
        let a = u32::from_str_radix(&hex[0..7], 16).unwrap();
        let b = u32::from_str_radix(&hex[7..14], 16).unwrap();
        assert_eq!(
            derivation_path_for_seed(seed),
            DerivationPath::from_str(&format!("m/999999/{}/{}", a, b)).unwrap()
        );
    }

    #[test]
    fn test_seed_derivation_public_and_private_agree() {
        let root = test_signer(KeyRole::User);
        let xprv = derive_key_with_seed(&root.xpriv, "seed").unwrap();
        let xpub = derive_xpub_with_seed(&root.xpub(), "seed").unwrap();
        assert_eq!(Xpub::from_priv(&Secp256k1::new(), &xprv), xpub);
    }
}
