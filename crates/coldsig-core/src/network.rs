//! Per-coin network parameters.
//!
//! Parameters are plain values handed to the functions that need them; there
//! is no coin class hierarchy. [`Coin::params`] returns the built-in table.

use std::str::FromStr;

use bitcoin::{Network, NetworkKind, PublicKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scripts::ScriptType2Of3;

#[derive(Debug, Error)]
#[error("unknown coin '{0}'")]
pub struct UnknownCoin(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Coin {
    Btc,
    Tbtc,
    Ltc,
    Tltc,
    Doge,
    Tdoge,
}

impl Coin {
    pub const ALL: [Coin; 6] = [
        Coin::Btc,
        Coin::Tbtc,
        Coin::Ltc,
        Coin::Tltc,
        Coin::Doge,
        Coin::Tdoge,
    ];

    pub fn params(self) -> &'static NetworkParams {
        match self {
            Coin::Btc => &BTC,
            Coin::Tbtc => &TBTC,
            Coin::Ltc => &LTC,
            Coin::Tltc => &TLTC,
            Coin::Doge => &DOGE,
            Coin::Tdoge => &TDOGE,
        }
    }

    pub fn name(self) -> &'static str {
        self.params().name
    }

    pub fn from_name(name: &str) -> Result<Self, UnknownCoin> {
        name.parse()
    }
}

impl FromStr for Coin {
    type Err = UnknownCoin;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Coin::ALL
            .iter()
            .copied()
            .find(|c| c.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownCoin(s.to_string()))
    }
}

impl std::fmt::Display for Coin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Address and script-support parameters for one network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkParams {
    pub coin: Coin,
    pub name: &'static str,
    /// Mainnet or testnet, used for extended key version bytes.
    pub kind: NetworkKind,
    pub pubkey_hash_version: u8,
    pub script_hash_version: u8,
    /// Human-readable part for segwit addresses, `None` if segwit is absent.
    pub bech32_hrp: Option<&'static str>,
    pub supports_segwit: bool,
    pub supports_taproot: bool,
    /// Hex-encoded compressed keys whose p2shP2pk outputs are replay protection.
    pub replay_protection_keys: &'static [&'static str],
}

impl NetworkParams {
    pub fn is_mainnet(&self) -> bool {
        self.kind == NetworkKind::Main
    }

    /// Bitcoin network whose key and PSBT encodings this network shares.
    pub fn bitcoin_network(&self) -> Network {
        match self.kind {
            NetworkKind::Main => Network::Bitcoin,
            NetworkKind::Test => Network::Testnet,
        }
    }

    pub fn supports_script_type(&self, script_type: ScriptType2Of3) -> bool {
        match script_type {
            ScriptType2Of3::P2sh => true,
            ScriptType2Of3::P2shP2wsh | ScriptType2Of3::P2wsh => self.supports_segwit,
            ScriptType2Of3::P2tr | ScriptType2Of3::P2trMusig2 => self.supports_taproot,
        }
    }

    /// Replay-protection public keys, skipping malformed table entries.
    pub fn replay_protection_pubkeys(&self) -> Vec<PublicKey> {
        self.replay_protection_keys
            .iter()
            .filter_map(|k| match PublicKey::from_str(k) {
                Ok(pk) => Some(pk),
                Err(e) => {
                    log::warn!("{}: bad replay protection key {}: {}", self.name, k, e);
                    None
                }
            })
            .collect()
    }
}

static BTC: NetworkParams = NetworkParams {
    coin: Coin::Btc,
    name: "btc",
    kind: NetworkKind::Main,
    pubkey_hash_version: 0x00,
    script_hash_version: 0x05,
    bech32_hrp: Some("bc"),
    supports_segwit: true,
    supports_taproot: true,
    replay_protection_keys: &[],
};

static TBTC: NetworkParams = NetworkParams {
    coin: Coin::Tbtc,
    name: "tbtc",
    kind: NetworkKind::Test,
    pubkey_hash_version: 0x6f,
    script_hash_version: 0xc4,
    bech32_hrp: Some("tb"),
    supports_segwit: true,
    supports_taproot: true,
    replay_protection_keys: &[],
};

static LTC: NetworkParams = NetworkParams {
    coin: Coin::Ltc,
    name: "ltc",
    kind: NetworkKind::Main,
    pubkey_hash_version: 0x30,
    script_hash_version: 0x32,
    bech32_hrp: Some("ltc"),
    supports_segwit: true,
    supports_taproot: false,
    replay_protection_keys: &[],
};

static TLTC: NetworkParams = NetworkParams {
    coin: Coin::Tltc,
    name: "tltc",
    kind: NetworkKind::Test,
    pubkey_hash_version: 0x6f,
    script_hash_version: 0x3a,
    bech32_hrp: Some("tltc"),
    supports_segwit: true,
    supports_taproot: false,
    replay_protection_keys: &[],
};

static DOGE: NetworkParams = NetworkParams {
    coin: Coin::Doge,
    name: "doge",
    kind: NetworkKind::Main,
    pubkey_hash_version: 0x1e,
    script_hash_version: 0x16,
    bech32_hrp: None,
    supports_segwit: false,
    supports_taproot: false,
    replay_protection_keys: &[],
};

static TDOGE: NetworkParams = NetworkParams {
    coin: Coin::Tdoge,
    name: "tdoge",
    kind: NetworkKind::Test,
    pubkey_hash_version: 0x71,
    script_hash_version: 0xc4,
    bech32_hrp: None,
    supports_segwit: false,
    supports_taproot: false,
    replay_protection_keys: &[],
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coin_names_parse_back() {
        for coin in Coin::ALL {
            assert_eq!(Coin::from_name(coin.name()).unwrap(), coin);
            assert_eq!(coin.params().coin, coin);
        }
        assert!(Coin::from_str("bch").is_err());
    }

    #[test]
    fn test_script_support_matrix() {
        let btc = Coin::Btc.params();
        assert!(btc.supports_script_type(ScriptType2Of3::P2trMusig2));

        let ltc = Coin::Ltc.params();
        assert!(ltc.supports_script_type(ScriptType2Of3::P2wsh));
        assert!(!ltc.supports_script_type(ScriptType2Of3::P2tr));

        let doge = Coin::Doge.params();
        assert!(doge.supports_script_type(ScriptType2Of3::P2sh));
        assert!(!doge.supports_script_type(ScriptType2Of3::P2shP2wsh));
        assert!(doge.bech32_hrp.is_none());
    }

    #[test]
    fn test_replay_protection_keys_are_parsed() {
        let params = NetworkParams {
            replay_protection_keys: &[
                "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798",
                "not-a-key",
            ],
            ..*Coin::Tbtc.params()
        };
        assert_eq!(params.replay_protection_pubkeys().len(), 1);
        assert!(Coin::Btc.params().replay_protection_pubkeys().is_empty());
    }
}
