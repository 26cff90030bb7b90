//! 2-of-3 output scripts.
//!
//! | type        | scriptPubKey                 | spend data                         |
//! |-------------|------------------------------|------------------------------------|
//! | p2sh        | HASH160 <h> EQUAL            | redeemScript = 2-of-3 multisig     |
//! | p2shP2wsh   | HASH160 <h> EQUAL            | redeemScript = p2wsh program       |
//! | p2wsh       | 0 <sha256(witnessScript)>    | witnessScript = 2-of-3 multisig    |
//! | p2tr        | 1 <output key>               | three 2-of-2 leaves                |
//! | p2trMusig2  | 1 <output key>               | MuSig2 key path + two 2-of-2 leaves |
//!
//! Keys are always placed in (user, backup, bitgo) order. The multisig script
//! is never sorted, so the same triple always yields the same script.

use std::str::FromStr;

use bitcoin::key::XOnlyPublicKey;
use bitcoin::opcodes::all::{
    OP_CHECKMULTISIG, OP_CHECKSIG, OP_CHECKSIGVERIFY, OP_PUSHNUM_2, OP_PUSHNUM_3,
};
use bitcoin::script::{Builder, Instruction};
use bitcoin::secp256k1::{Parity, PublicKey, Secp256k1};
use bitcoin::taproot::{
    ControlBlock, LeafVersion, TapLeafHash, TapNodeHash, TaprootBuilder,
};
use bitcoin::{Script, ScriptBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::musig::{self, MusigError};
use crate::network::NetworkParams;
use crate::{KeyRole, Triple};

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("public key {index} has length {len}, expected 33")]
    InvalidPublicKeyLength { index: usize, len: usize },

    #[error("public key {index} is not a valid point: {reason}")]
    InvalidPublicKey { index: usize, reason: String },

    #[error("unknown script type '{0}'")]
    UnknownScriptType(String),

    #[error("script type {script_type} is not supported on {network}")]
    UnsupportedScriptType {
        script_type: ScriptType2Of3,
        network: &'static str,
    },

    #[error("taproot tree construction failed: {0}")]
    Taproot(String),

    #[error(transparent)]
    Musig(#[from] MusigError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScriptType2Of3 {
    P2sh,
    P2shP2wsh,
    P2wsh,
    P2tr,
    P2trMusig2,
}

impl ScriptType2Of3 {
    pub const ALL: [ScriptType2Of3; 5] = [
        ScriptType2Of3::P2sh,
        ScriptType2Of3::P2shP2wsh,
        ScriptType2Of3::P2wsh,
        ScriptType2Of3::P2tr,
        ScriptType2Of3::P2trMusig2,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ScriptType2Of3::P2sh => "p2sh",
            ScriptType2Of3::P2shP2wsh => "p2shP2wsh",
            ScriptType2Of3::P2wsh => "p2wsh",
            ScriptType2Of3::P2tr => "p2tr",
            ScriptType2Of3::P2trMusig2 => "p2trMusig2",
        }
    }

    pub fn is_taproot(self) -> bool {
        matches!(self, ScriptType2Of3::P2tr | ScriptType2Of3::P2trMusig2)
    }

    /// Spends carry witness data.
    pub fn is_segwit(self) -> bool {
        !matches!(self, ScriptType2Of3::P2sh)
    }
}

impl FromStr for ScriptType2Of3 {
    type Err = ScriptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ScriptType2Of3::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ScriptError::UnknownScriptType(s.to_string()))
    }
}

impl std::fmt::Display for ScriptType2Of3 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a taproot output is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaprootSpend {
    KeyPath,
    ScriptPathLevel1,
    ScriptPathLevel2,
}

impl TaprootSpend {
    /// Script-path level from a serialized control block (33 + 32 per level).
    pub fn from_control_block_len(len: usize) -> Option<Self> {
        match len {
            65 => Some(TaprootSpend::ScriptPathLevel1),
            97 => Some(TaprootSpend::ScriptPathLevel2),
            _ => None,
        }
    }
}

// ─── Script data ────────────────────────────────────────────────────────────

/// One 2-of-2 leaf of a taproot wallet output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapLeaf {
    /// Signers in script order: the first key is checked with CHECKSIGVERIFY.
    pub signers: [KeyRole; 2],
    pub script: ScriptBuf,
    pub depth: u8,
    pub control_block: ControlBlock,
}

impl TapLeaf {
    pub fn leaf_hash(&self) -> TapLeafHash {
        TapLeafHash::from_script(&self.script, LeafVersion::TapScript)
    }

    pub fn includes(&self, role: KeyRole) -> bool {
        self.signers.contains(&role)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaprootScripts {
    pub internal_key: XOnlyPublicKey,
    pub output_key: XOnlyPublicKey,
    pub merkle_root: Option<TapNodeHash>,
    pub leaves: Vec<TapLeaf>,
}

impl TaprootScripts {
    /// Leaf spendable by exactly `a` and `b`, in either order.
    pub fn leaf(&self, a: KeyRole, b: KeyRole) -> Option<&TapLeaf> {
        self.leaves.iter().find(|l| l.includes(a) && l.includes(b) && a != b)
    }

    pub fn leaf_by_hash(&self, hash: &TapLeafHash) -> Option<&TapLeaf> {
        self.leaves.iter().find(|l| &l.leaf_hash() == hash)
    }
}

/// Output script plus the data needed to spend it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendableScript {
    pub script_type: ScriptType2Of3,
    pub script_pubkey: ScriptBuf,
    pub redeem_script: Option<ScriptBuf>,
    pub witness_script: Option<ScriptBuf>,
    pub taproot: Option<TaprootScripts>,
}

// ─── Construction ───────────────────────────────────────────────────────────

/// `OP_2 <user> <backup> <bitgo> OP_3 OP_CHECKMULTISIG`
pub fn create_multisig_script(keys: &Triple<PublicKey>) -> ScriptBuf {
    let mut builder = Builder::new().push_opcode(OP_PUSHNUM_2);
    for key in keys {
        builder = builder.push_key(&bitcoin::PublicKey::new(*key));
    }
    builder
        .push_opcode(OP_PUSHNUM_3)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script()
}

/// `<a> OP_CHECKSIGVERIFY <b> OP_CHECKSIG`
pub fn create_taproot_leaf_script(a: &XOnlyPublicKey, b: &XOnlyPublicKey) -> ScriptBuf {
    Builder::new()
        .push_x_only_key(a)
        .push_opcode(OP_CHECKSIGVERIFY)
        .push_x_only_key(b)
        .push_opcode(OP_CHECKSIG)
        .into_script()
}

/// `<pubkey> OP_CHECKSIG`, the redeem script of a p2shP2pk output.
pub fn create_p2pk_script(key: &PublicKey) -> ScriptBuf {
    Builder::new()
        .push_key(&bitcoin::PublicKey::new(*key))
        .push_opcode(OP_CHECKSIG)
        .into_script()
}

/// Parse three 33-byte keys, rejecting any other length (uncompressed included).
pub fn parse_public_keys(keys: [&[u8]; 3]) -> Result<Triple<PublicKey>, ScriptError> {
    let mut parsed = Vec::with_capacity(3);
    for (index, bytes) in keys.iter().enumerate() {
        if bytes.len() != 33 {
            return Err(ScriptError::InvalidPublicKeyLength {
                index,
                len: bytes.len(),
            });
        }
        let key = PublicKey::from_slice(bytes).map_err(|e| ScriptError::InvalidPublicKey {
            index,
            reason: e.to_string(),
        })?;
        parsed.push(key);
    }
    Ok([parsed[0], parsed[1], parsed[2]])
}

pub fn create_output_script_from_bytes(
    keys: [&[u8]; 3],
    script_type: ScriptType2Of3,
) -> Result<SpendableScript, ScriptError> {
    create_output_script(&parse_public_keys(keys)?, script_type)
}

/// Like [`create_output_script`] but refuses types the network cannot carry.
pub fn create_output_script_for_network(
    keys: &Triple<PublicKey>,
    script_type: ScriptType2Of3,
    network: &NetworkParams,
) -> Result<SpendableScript, ScriptError> {
    if !network.supports_script_type(script_type) {
        return Err(ScriptError::UnsupportedScriptType {
            script_type,
            network: network.name,
        });
    }
    create_output_script(keys, script_type)
}

pub fn create_output_script(
    keys: &Triple<PublicKey>,
    script_type: ScriptType2Of3,
) -> Result<SpendableScript, ScriptError> {
    let spendable = match script_type {
        ScriptType2Of3::P2sh => {
            let redeem = create_multisig_script(keys);
            SpendableScript {
                script_type,
                script_pubkey: redeem.to_p2sh(),
                redeem_script: Some(redeem),
                witness_script: None,
                taproot: None,
            }
        }
        ScriptType2Of3::P2shP2wsh => {
            let witness = create_multisig_script(keys);
            let redeem = witness.to_p2wsh();
            SpendableScript {
                script_type,
                script_pubkey: redeem.to_p2sh(),
                redeem_script: Some(redeem),
                witness_script: Some(witness),
                taproot: None,
            }
        }
        ScriptType2Of3::P2wsh => {
            let witness = create_multisig_script(keys);
            SpendableScript {
                script_type,
                script_pubkey: witness.to_p2wsh(),
                redeem_script: None,
                witness_script: Some(witness),
                taproot: None,
            }
        }
        ScriptType2Of3::P2tr | ScriptType2Of3::P2trMusig2 => {
            let taproot = create_taproot_scripts(keys, script_type)?;
            let output_key =
                bitcoin::key::TweakedPublicKey::dangerous_assume_tweaked(taproot.output_key);
            SpendableScript {
                script_type,
                script_pubkey: ScriptBuf::new_p2tr_tweaked(output_key),
                redeem_script: None,
                witness_script: None,
                taproot: Some(taproot),
            }
        }
    };
    Ok(spendable)
}

fn taproot_layout(script_type: ScriptType2Of3) -> &'static [(u8, [KeyRole; 2])] {
    use KeyRole::*;
    match script_type {
        ScriptType2Of3::P2trMusig2 => &[(1, [User, Backup]), (1, [Backup, Bitgo])],
        _ => &[(1, [User, Bitgo]), (2, [User, Backup]), (2, [Backup, Bitgo])],
    }
}

/// Signer pairs of the script tree, in leaf order. Empty for non-taproot types.
pub fn taptree_key_combinations(script_type: ScriptType2Of3) -> Vec<[KeyRole; 2]> {
    if !script_type.is_taproot() {
        return Vec::new();
    }
    taproot_layout(script_type).iter().map(|(_, pair)| *pair).collect()
}

/// Keys aggregated into the internal key, or `None` for non-taproot types.
pub fn key_path_keys(script_type: ScriptType2Of3) -> Option<[KeyRole; 2]> {
    script_type
        .is_taproot()
        .then_some([KeyRole::User, KeyRole::Bitgo])
}

/// Internal key of a taproot wallet output.
///
/// p2trMusig2 aggregates the full user and bitgo keys. p2tr aggregates their
/// x-only forms lifted to even Y, so the key depends only on the x coordinates.
pub fn taproot_internal_key(
    keys: &Triple<PublicKey>,
    script_type: ScriptType2Of3,
) -> Result<XOnlyPublicKey, ScriptError> {
    let user = keys[KeyRole::User.index()];
    let bitgo = keys[KeyRole::Bitgo.index()];
    let agg = match script_type {
        ScriptType2Of3::P2trMusig2 => musig::aggregate_xonly(&[user, bitgo])?,
        ScriptType2Of3::P2tr => {
            let lift = |k: PublicKey| k.x_only_public_key().0.public_key(Parity::Even);
            musig::aggregate_xonly(&[lift(user), lift(bitgo)])?
        }
        other => {
            return Err(ScriptError::Taproot(format!("{} has no internal key", other)));
        }
    };
    Ok(agg)
}

fn create_taproot_scripts(
    keys: &Triple<PublicKey>,
    script_type: ScriptType2Of3,
) -> Result<TaprootScripts, ScriptError> {
    let secp = Secp256k1::verification_only();
    let xonly = keys.map(|k| k.x_only_public_key().0);
    let internal_key = taproot_internal_key(keys, script_type)?;
    let layout = taproot_layout(script_type);

    let leaf_script =
        |[a, b]: [KeyRole; 2]| create_taproot_leaf_script(&xonly[a.index()], &xonly[b.index()]);

    let mut builder = TaprootBuilder::new();
    for (depth, signers) in layout {
        builder = builder
            .add_leaf(*depth, leaf_script(*signers))
            .map_err(|e| ScriptError::Taproot(e.to_string()))?;
    }
    let spend_info = builder
        .finalize(&secp, internal_key)
        .map_err(|_| ScriptError::Taproot("incomplete script tree".into()))?;

    let mut leaves = Vec::with_capacity(layout.len());
    for (depth, signers) in layout {
        let script = leaf_script(*signers);
        let control_block = spend_info
            .control_block(&(script.clone(), LeafVersion::TapScript))
            .ok_or_else(|| ScriptError::Taproot("leaf missing from tree".into()))?;
        leaves.push(TapLeaf {
            signers: *signers,
            script,
            depth: *depth,
            control_block,
        });
    }

    Ok(TaprootScripts {
        internal_key,
        output_key: spend_info.output_key().to_inner(),
        merkle_root: spend_info.merkle_root(),
        leaves,
    })
}

// ─── Parsing ────────────────────────────────────────────────────────────────

/// Keys of a `2 <k1> <k2> <k3> 3 CHECKMULTISIG` script, in script order.
pub fn parse_multisig_script(script: &Script) -> Option<Triple<PublicKey>> {
    let instructions: Vec<Instruction> = script.instructions().collect::<Result<_, _>>().ok()?;
    if instructions.len() != 6 {
        return None;
    }
    if instructions[0] != Instruction::Op(OP_PUSHNUM_2)
        || instructions[4] != Instruction::Op(OP_PUSHNUM_3)
        || instructions[5] != Instruction::Op(OP_CHECKMULTISIG)
    {
        return None;
    }
    let mut keys = Vec::with_capacity(3);
    for ins in &instructions[1..4] {
        match ins {
            Instruction::PushBytes(data) if data.len() == 33 => {
                keys.push(PublicKey::from_slice(data.as_bytes()).ok()?);
            }
            _ => return None,
        }
    }
    Some([keys[0], keys[1], keys[2]])
}

/// Key of a `<pubkey> CHECKSIG` script.
pub fn parse_p2pk_script(script: &Script) -> Option<PublicKey> {
    let bytes = script.as_bytes();
    if bytes.len() != 35 || bytes[0] != 33 || bytes[34] != OP_CHECKSIG.to_u8() {
        return None;
    }
    PublicKey::from_slice(&bytes[1..34]).ok()
}

/// Keys of a `<a> CHECKSIGVERIFY <b> CHECKSIG` leaf.
pub fn parse_taproot_leaf_script(script: &Script) -> Option<[XOnlyPublicKey; 2]> {
    let bytes = script.as_bytes();
    if bytes.len() != 68
        || bytes[0] != 32
        || bytes[33] != OP_CHECKSIGVERIFY.to_u8()
        || bytes[34] != 32
        || bytes[67] != OP_CHECKSIG.to_u8()
    {
        return None;
    }
    let a = XOnlyPublicKey::from_slice(&bytes[1..33]).ok()?;
    let b = XOnlyPublicKey::from_slice(&bytes[35..67]).ok()?;
    Some([a, b])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Coin;
    use crate::test_utils::test_pubkeys;

    #[test]
    fn test_script_pubkey_shapes() {
        let keys = test_pubkeys();

        let p2sh = create_output_script(&keys, ScriptType2Of3::P2sh).unwrap();
        assert!(p2sh.script_pubkey.is_p2sh());
        assert!(p2sh.witness_script.is_none());
        assert_eq!(p2sh.redeem_script.as_ref().unwrap().len(), 105);

        let p2shp2wsh = create_output_script(&keys, ScriptType2Of3::P2shP2wsh).unwrap();
        assert!(p2shp2wsh.script_pubkey.is_p2sh());
        assert!(p2shp2wsh.redeem_script.as_ref().unwrap().is_p2wsh());

        let p2wsh = create_output_script(&keys, ScriptType2Of3::P2wsh).unwrap();
        assert!(p2wsh.script_pubkey.is_p2wsh());
        assert_eq!(p2wsh.witness_script, p2shp2wsh.witness_script);
        assert_eq!(p2wsh.witness_script, p2sh.redeem_script);

        let p2tr = create_output_script(&keys, ScriptType2Of3::P2tr).unwrap();
        assert!(p2tr.script_pubkey.is_p2tr());
        let musig = create_output_script(&keys, ScriptType2Of3::P2trMusig2).unwrap();
        assert!(musig.script_pubkey.is_p2tr());
        assert_ne!(p2tr.script_pubkey, musig.script_pubkey);
    }

    #[test]
    fn test_multisig_keeps_key_order() {
        let keys = test_pubkeys();
        let script = create_multisig_script(&keys);
        assert_eq!(parse_multisig_script(&script), Some(keys));

        let swapped = [keys[1], keys[0], keys[2]];
        assert_ne!(create_multisig_script(&swapped), script);
    }

    #[test]
    fn test_p2tr_leaf_layout() {
        let keys = test_pubkeys();
        let spendable = create_output_script(&keys, ScriptType2Of3::P2tr).unwrap();
        let taproot = spendable.taproot.unwrap();

        let primary = taproot.leaf(KeyRole::Bitgo, KeyRole::User).unwrap();
        assert_eq!(primary.signers, [KeyRole::User, KeyRole::Bitgo]);
        assert_eq!(primary.depth, 1);
        assert_eq!(primary.control_block.serialize().len(), 65);

        let recovery = taproot.leaf(KeyRole::Backup, KeyRole::Bitgo).unwrap();
        assert_eq!(recovery.depth, 2);
        assert_eq!(recovery.control_block.serialize().len(), 97);
        assert!(taproot.merkle_root.is_some());
        assert!(taproot.leaf(KeyRole::User, KeyRole::User).is_none());
    }

    #[test]
    fn test_p2tr_musig2_leaf_layout() {
        let keys = test_pubkeys();
        let taproot = create_output_script(&keys, ScriptType2Of3::P2trMusig2)
            .unwrap()
            .taproot
            .unwrap();
        assert_eq!(taproot.leaves.len(), 2);
        assert!(taproot.leaf(KeyRole::User, KeyRole::Bitgo).is_none());
        for leaf in &taproot.leaves {
            assert_eq!(leaf.depth, 1);
            assert_eq!(leaf.control_block.serialize().len(), 65);
            assert!(leaf.includes(KeyRole::Backup));
        }
        assert_eq!(
            taproot.internal_key,
            musig::aggregate_xonly(&[keys[0], keys[2]]).unwrap()
        );
    }

    #[test]
    fn test_key_combinations() {
        assert_eq!(taptree_key_combinations(ScriptType2Of3::P2tr).len(), 3);
        assert_eq!(
            taptree_key_combinations(ScriptType2Of3::P2trMusig2),
            vec![[KeyRole::User, KeyRole::Backup], [KeyRole::Backup, KeyRole::Bitgo]]
        );
        assert!(taptree_key_combinations(ScriptType2Of3::P2wsh).is_empty());
        assert_eq!(key_path_keys(ScriptType2Of3::P2sh), None);
    }

    #[test]
    fn test_leaf_script_round_trip() {
        let keys = test_pubkeys();
        let a = keys[0].x_only_public_key().0;
        let b = keys[2].x_only_public_key().0;
        let script = create_taproot_leaf_script(&a, &b);
        assert_eq!(parse_taproot_leaf_script(&script), Some([a, b]));
        assert_eq!(parse_taproot_leaf_script(&create_multisig_script(&keys)), None);
    }

    #[test]
    fn test_rejects_non_compressed_keys() {
        let keys = test_pubkeys();
        let uncompressed = keys[1].serialize_uncompressed();
        let user = keys[0].serialize();
        let bitgo = keys[2].serialize();
        let err = create_output_script_from_bytes(
            [&user[..], &uncompressed[..], &bitgo[..]],
            ScriptType2Of3::P2wsh,
        )
        .unwrap_err();
        assert!(matches!(err, ScriptError::InvalidPublicKeyLength { index: 1, len: 65 }));

        let short = &user[..32];
        assert!(create_output_script_from_bytes([short, &user[..], &bitgo[..]], ScriptType2Of3::P2sh).is_err());
    }

    #[test]
    fn test_network_support_enforced() {
        let keys = test_pubkeys();
        let err = create_output_script_for_network(&keys, ScriptType2Of3::P2wsh, Coin::Doge.params())
            .unwrap_err();
        assert!(matches!(err, ScriptError::UnsupportedScriptType { network: "doge", .. }));
        assert!(create_output_script_for_network(&keys, ScriptType2Of3::P2tr, Coin::Tbtc.params()).is_ok());
    }

    #[test]
    fn test_p2pk_script_parse() {
        let keys = test_pubkeys();
        let script = create_p2pk_script(&keys[0]);
        assert_eq!(parse_p2pk_script(&script), Some(keys[0]));
        assert_eq!(parse_p2pk_script(&create_multisig_script(&keys)), None);
    }

    #[test]
    fn test_script_type_names() {
        for t in ScriptType2Of3::ALL {
            assert_eq!(t.as_str().parse::<ScriptType2Of3>().unwrap(), t);
            assert_eq!(serde_json::to_string(&t).unwrap(), format!("\"{}\"", t));
        }
        assert!("p2pkh".parse::<ScriptType2Of3>().is_err());
    }
}
