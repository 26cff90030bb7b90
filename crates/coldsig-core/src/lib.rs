//! # coldsig core
//!
//! Building blocks for BitGo-style 2-of-3 multisig wallets:
//!
//! - **Keys**: the (user, backup, bitgo) root key triple and BIP-32 derivation
//!   along `prefix/chain/index` paths
//! - **Chain codes**: the closed registry mapping chain numbers to script types
//! - **Scripts**: p2sh, p2shP2wsh, p2wsh, p2tr and p2trMusig2 output scripts
//! - **Addresses**: per-network base58check and bech32/bech32m codecs
//! - **Classification**: identifying how a PSBT or transaction input is spent
//!
//! Every wallet has exactly three keys and any two of them can spend.

pub mod address;
pub mod classify;
pub mod codes;
pub mod keys;
pub mod musig;
pub mod network;
pub mod scripts;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use serde::{Deserialize, Serialize};

pub use codes::{ChainCode, InvalidChainCode, Scope};
pub use keys::{DerivedWalletKeys, KeyError, RootWalletKeys, WalletSigner};
pub use network::{Coin, NetworkParams};
pub use scripts::{ScriptError, ScriptType2Of3, SpendableScript, TapLeaf, TaprootScripts, TaprootSpend};

/// Ordered `(user, backup, bitgo)` tuple. Order is significant everywhere.
pub type Triple<T> = [T; 3];

/// Position of a key within the wallet triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyRole {
    User,
    Backup,
    Bitgo,
}

impl KeyRole {
    pub const ALL: [KeyRole; 3] = [KeyRole::User, KeyRole::Backup, KeyRole::Bitgo];

    /// Index of this role inside a [`Triple`].
    pub fn index(self) -> usize {
        match self {
            KeyRole::User => 0,
            KeyRole::Backup => 1,
            KeyRole::Bitgo => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KeyRole::User => "user",
            KeyRole::Backup => "backup",
            KeyRole::Bitgo => "bitgo",
        }
    }
}

impl std::fmt::Display for KeyRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
