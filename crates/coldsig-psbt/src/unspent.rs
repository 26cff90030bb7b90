//! Spendable coins and payment recipients.
//!
//! [`Unspent`] is the record an external indexer hands us. Before it can be
//! spent it is resolved into either a [`WalletUnspent`] (derived from the
//! wallet keys at a chain/index) or a [`ReplayProtectionUnspent`] (one of the
//! network's fixed p2shP2pk outputs).

use std::str::FromStr;

use bitcoin::secp256k1::PublicKey;
use bitcoin::{Amount, OutPoint, ScriptBuf, Transaction, Txid};
use coldsig_core::address::{to_output_script, AddressError};
use coldsig_core::scripts::{create_output_script_for_network, create_p2pk_script, ScriptError};
use coldsig_core::{
    ChainCode, DerivedWalletKeys, InvalidChainCode, KeyError, NetworkParams, RootWalletKeys,
    ScriptType2Of3, SpendableScript,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::encoding::{tx_from_hex, EncodingError};

#[derive(Debug, Error)]
pub enum UnspentError {
    #[error("malformed unspent id '{0}', expected <txid>:<vout>")]
    InvalidId(String),

    #[error("unspent {id}: {source}")]
    Address {
        id: String,
        #[source]
        source: AddressError,
    },

    #[error("unspent {id}: {source}")]
    ChainCode {
        id: String,
        #[source]
        source: InvalidChainCode,
    },

    #[error("unspent {id}: {source}")]
    Key {
        id: String,
        #[source]
        source: KeyError,
    },

    #[error("unspent {id}: {source}")]
    Script {
        id: String,
        #[source]
        source: ScriptError,
    },

    #[error("unspent {id}: script type {script_type} cannot live on chain {chain}")]
    ScriptTypeMismatch {
        id: String,
        chain: ChainCode,
        script_type: ScriptType2Of3,
    },

    #[error("unspent {id}: address {address} is not the wallet address at chain {chain} index {index}")]
    AddressMismatch {
        id: String,
        address: String,
        chain: ChainCode,
        index: u32,
    },

    #[error("unspent {id} has no chain/index and is not a replay protection output")]
    NotSpendable { id: String },

    #[error("unspent {id}: previous transaction does not contain the spent output")]
    PrevTxMismatch { id: String },

    #[error("unspent {id}: {source}")]
    PrevTx {
        id: String,
        #[source]
        source: EncodingError,
    },
}

/// Parse `<txid>:<vout>`.
pub fn parse_id(id: &str) -> Result<OutPoint, UnspentError> {
    let (txid, vout) = id
        .rsplit_once(':')
        .ok_or_else(|| UnspentError::InvalidId(id.to_string()))?;
    let txid = Txid::from_str(txid).map_err(|_| UnspentError::InvalidId(id.to_string()))?;
    let vout = vout
        .parse::<u32>()
        .map_err(|_| UnspentError::InvalidId(id.to_string()))?;
    Ok(OutPoint { txid, vout })
}

pub fn format_id(outpoint: &OutPoint) -> String {
    format!("{}:{}", outpoint.txid, outpoint.vout)
}

// ─── Raw records ────────────────────────────────────────────────────────────

/// An unspent output as reported by an indexer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Unspent {
    /// `<txid>:<vout>`
    pub id: String,
    pub address: String,
    /// Value in satoshis.
    pub value: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    /// Only needed to mark a taproot-chain output as p2trMusig2.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_type: Option<ScriptType2Of3>,
    /// Hex-encoded previous transaction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_tx: Option<String>,
}

/// Resolved, spendable unspent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpendableUnspent {
    Wallet(WalletUnspent),
    ReplayProtection(ReplayProtectionUnspent),
}

impl SpendableUnspent {
    pub fn outpoint(&self) -> OutPoint {
        match self {
            SpendableUnspent::Wallet(u) => u.outpoint,
            SpendableUnspent::ReplayProtection(u) => u.outpoint,
        }
    }

    pub fn value(&self) -> Amount {
        match self {
            SpendableUnspent::Wallet(u) => u.value,
            SpendableUnspent::ReplayProtection(u) => u.value,
        }
    }
}

impl Unspent {
    pub fn outpoint(&self) -> Result<OutPoint, UnspentError> {
        parse_id(&self.id)
    }

    fn prev_tx(&self) -> Result<Option<Transaction>, UnspentError> {
        self.prev_tx
            .as_deref()
            .map(|hex| {
                tx_from_hex(hex).map_err(|source| UnspentError::PrevTx {
                    id: self.id.clone(),
                    source,
                })
            })
            .transpose()
    }

    /// Resolve into a wallet or replay-protection unspent.
    pub fn resolve(&self, network: &NetworkParams) -> Result<SpendableUnspent, UnspentError> {
        let outpoint = self.outpoint()?;
        let value = Amount::from_sat(self.value);
        let prev_tx = self.prev_tx()?;

        if let (Some(chain), Some(index)) = (self.chain, self.index) {
            let chain = ChainCode::try_from(chain).map_err(|source| UnspentError::ChainCode {
                id: self.id.clone(),
                source,
            })?;
            let script_type = self.script_type.unwrap_or(chain.script_type());
            let compatible = script_type == chain.script_type()
                || (script_type == ScriptType2Of3::P2trMusig2
                    && chain.script_type() == ScriptType2Of3::P2tr);
            if !compatible {
                return Err(UnspentError::ScriptTypeMismatch {
                    id: self.id.clone(),
                    chain,
                    script_type,
                });
            }
            return Ok(SpendableUnspent::Wallet(WalletUnspent {
                outpoint,
                address: self.address.clone(),
                value,
                chain,
                index,
                script_type,
                prev_tx,
            }));
        }

        let script = to_output_script(&self.address, network).map_err(|source| {
            UnspentError::Address {
                id: self.id.clone(),
                source,
            }
        })?;
        network
            .replay_protection_pubkeys()
            .into_iter()
            .map(|pk| pk.inner)
            .find(|pk| create_p2pk_script(pk).to_p2sh() == script)
            .map(|pubkey| {
                SpendableUnspent::ReplayProtection(ReplayProtectionUnspent {
                    outpoint,
                    address: self.address.clone(),
                    value,
                    pubkey,
                    prev_tx,
                })
            })
            .ok_or_else(|| UnspentError::NotSpendable {
                id: self.id.clone(),
            })
    }
}

// ─── Wallet unspents ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletUnspent {
    pub outpoint: OutPoint,
    pub address: String,
    pub value: Amount,
    pub chain: ChainCode,
    pub index: u32,
    pub script_type: ScriptType2Of3,
    pub prev_tx: Option<Transaction>,
}

impl WalletUnspent {
    pub fn id(&self) -> String {
        format_id(&self.outpoint)
    }

    /// Derive the keys and scripts this unspent pays to.
    pub fn derive(
        &self,
        root_keys: &RootWalletKeys,
        network: &NetworkParams,
    ) -> Result<(DerivedWalletKeys, SpendableScript), UnspentError> {
        let derived = root_keys
            .derive(self.chain, self.index)
            .map_err(|source| UnspentError::Key {
                id: self.id(),
                source,
            })?;
        let spendable =
            create_output_script_for_network(&derived.public_keys(), self.script_type, network)
                .map_err(|source| UnspentError::Script {
                    id: self.id(),
                    source,
                })?;
        Ok((derived, spendable))
    }

    /// Check that the claimed address (and previous transaction, if any) match
    /// the script derived from the wallet keys.
    pub fn verify_address(
        &self,
        root_keys: &RootWalletKeys,
        network: &NetworkParams,
    ) -> Result<(DerivedWalletKeys, SpendableScript), UnspentError> {
        let (derived, spendable) = self.derive(root_keys, network)?;
        let claimed = to_output_script(&self.address, network).map_err(|source| {
            UnspentError::Address {
                id: self.id(),
                source,
            }
        })?;
        if claimed != spendable.script_pubkey {
            return Err(UnspentError::AddressMismatch {
                id: self.id(),
                address: self.address.clone(),
                chain: self.chain,
                index: self.index,
            });
        }
        if let Some(tx) = &self.prev_tx {
            let matches = tx.compute_txid() == self.outpoint.txid
                && tx
                    .output
                    .get(self.outpoint.vout as usize)
                    .is_some_and(|o| o.script_pubkey == spendable.script_pubkey && o.value == self.value);
            if !matches {
                return Err(UnspentError::PrevTxMismatch { id: self.id() });
            }
        }
        Ok((derived, spendable))
    }
}

// ─── Replay protection ──────────────────────────────────────────────────────

/// A p2shP2pk output paying to one of the network's replay-protection keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayProtectionUnspent {
    pub outpoint: OutPoint,
    pub address: String,
    pub value: Amount,
    pub pubkey: PublicKey,
    pub prev_tx: Option<Transaction>,
}

impl ReplayProtectionUnspent {
    pub fn redeem_script(&self) -> ScriptBuf {
        create_p2pk_script(&self.pubkey)
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        self.redeem_script().to_p2sh()
    }
}

// ─── Recipients ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Address(String),
    Script(ScriptBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub destination: Destination,
    pub amount: Amount,
}

impl Recipient {
    pub fn to_address(address: impl Into<String>, amount: Amount) -> Self {
        Self {
            destination: Destination::Address(address.into()),
            amount,
        }
    }

    pub fn to_script(script: ScriptBuf, amount: Amount) -> Self {
        Self {
            destination: Destination::Script(script),
            amount,
        }
    }

    pub fn output_script(&self, network: &NetworkParams) -> Result<ScriptBuf, AddressError> {
        match &self.destination {
            Destination::Address(address) => to_output_script(address, network),
            Destination::Script(script) => Ok(script.clone()),
        }
    }
}
