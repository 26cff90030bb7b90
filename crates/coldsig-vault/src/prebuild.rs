//! Prebuild and signed-prebuild JSON documents.
//!
//! The online service hands the vault a [`TransactionPrebuild`]: the unsigned
//! PSBT plus the wallet keys it claims to spend from. Nothing in it is
//! trusted until [`crate::verify_prebuild`] has re-derived it.

use bitcoin::psbt::Psbt;
use coldsig_core::KeyRole;
use coldsig_psbt::encoding::{psbt_from_str, EncodingError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct XpubWithDerivationPath {
    pub xpub: String,
    /// Seed of the `m/999999/a/b` path this xpub was derived at from the
    /// vault's root key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_from_parent_with_seed: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XpubsWithDerivationPath {
    pub user: XpubWithDerivationPath,
    pub backup: XpubWithDerivationPath,
    pub bitgo: XpubWithDerivationPath,
}

impl XpubsWithDerivationPath {
    pub fn get(&self, role: KeyRole) -> &XpubWithDerivationPath {
        match role {
            KeyRole::User => &self.user,
            KeyRole::Backup => &self.backup,
            KeyRole::Bitgo => &self.bitgo,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedDescriptor {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionPrebuild {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet_id: Option<String>,
    /// PSBT, hex or base64.
    pub tx_hex: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xpubs_with_derivation_path: Option<XpubsWithDerivationPath>,
    /// Present for descriptor wallets only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descriptors: Option<Vec<NamedDescriptor>>,
}

impl TransactionPrebuild {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn psbt(&self) -> Result<Psbt, EncodingError> {
        psbt_from_str(&self.tx_hex)
    }
}

/// What the vault hands back after adding its signatures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPrebuild {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet_id: Option<String>,
    /// Half-signed PSBT hex, or a legacy transaction hex.
    pub tx_hex: String,
    pub signatures_added: usize,
}
