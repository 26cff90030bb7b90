//! Chain code registry.
//!
//! A chain code is the second-to-last component of a wallet derivation path
//! (`prefix/chain/index`). It selects both the output script type and whether
//! the address is external (receive) or internal (change). The registry is a
//! closed set of eight codes; everything else is rejected.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scripts::ScriptType2Of3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidChainCode {
    #[error("invalid chain code {0}")]
    Code(i64),

    #[error("script type {0} has no chain codes")]
    NoCodesForType(ScriptType2Of3),
}

/// External (receive) or internal (change) address chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    External,
    Internal,
}

/// A validated member of the chain code registry.
///
/// The inner value is private; the only way to get one is through
/// [`ChainCode::new`] or one of the `TryFrom` impls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct ChainCode(u32);

const REGISTRY: [ChainCode; 8] = [
    ChainCode(0),
    ChainCode(1),
    ChainCode(10),
    ChainCode(11),
    ChainCode(20),
    ChainCode(21),
    ChainCode(30),
    ChainCode(31),
];

/// External/internal pair of codes for one script type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainPair {
    pub external: ChainCode,
    pub internal: ChainCode,
}

impl ChainPair {
    pub fn get(&self, scope: Scope) -> ChainCode {
        match scope {
            Scope::External => self.external,
            Scope::Internal => self.internal,
        }
    }
}

impl ChainCode {
    pub fn new(code: u32) -> Result<Self, InvalidChainCode> {
        Self::try_from(code as i64)
    }

    /// Every registered code, in ascending order.
    pub fn all() -> &'static [ChainCode] {
        &REGISTRY
    }

    pub fn value(self) -> u32 {
        self.0
    }

    pub fn scope(self) -> Scope {
        if self.0 % 10 == 0 {
            Scope::External
        } else {
            Scope::Internal
        }
    }

    pub fn is_external(self) -> bool {
        self.scope() == Scope::External
    }

    pub fn is_internal(self) -> bool {
        self.scope() == Scope::Internal
    }

    /// Script type addresses on this chain use.
    ///
    /// The taproot chains (30/31) report `P2tr`; p2trMusig2 outputs share
    /// those chains and are told apart by their script, not their code.
    pub fn script_type(self) -> ScriptType2Of3 {
        match self.0 / 10 {
            0 => ScriptType2Of3::P2sh,
            1 => ScriptType2Of3::P2shP2wsh,
            2 => ScriptType2Of3::P2wsh,
            _ => ScriptType2Of3::P2tr,
        }
    }

    /// Codes whose script type is `script_type`, in registry order.
    pub fn for_script_type(script_type: ScriptType2Of3) -> Result<ChainPair, InvalidChainCode> {
        for_type(script_type)
    }
}

impl TryFrom<i64> for ChainCode {
    type Error = InvalidChainCode;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        REGISTRY
            .iter()
            .copied()
            .find(|c| c.0 as i64 == code)
            .ok_or(InvalidChainCode::Code(code))
    }
}

impl TryFrom<u32> for ChainCode {
    type Error = InvalidChainCode;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        Self::try_from(code as i64)
    }
}

impl From<ChainCode> for u32 {
    fn from(code: ChainCode) -> u32 {
        code.0
    }
}

impl std::fmt::Display for ChainCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ─── Raw-value predicates ───────────────────────────────────────────────────

pub fn is_valid(code: i64) -> bool {
    ChainCode::try_from(code).is_ok()
}

/// Fails with [`InvalidChainCode`] for anything outside the registry.
pub fn is_external(code: i64) -> Result<bool, InvalidChainCode> {
    Ok(ChainCode::try_from(code)?.is_external())
}

/// Fails with [`InvalidChainCode`] for anything outside the registry.
pub fn is_internal(code: i64) -> Result<bool, InvalidChainCode> {
    Ok(ChainCode::try_from(code)?.is_internal())
}

pub fn script_type_for_code(code: i64) -> Result<ScriptType2Of3, InvalidChainCode> {
    Ok(ChainCode::try_from(code)?.script_type())
}

/// External and internal codes for a script type.
///
/// `P2trMusig2` has no codes of its own in the registry and is rejected.
pub fn for_type(script_type: ScriptType2Of3) -> Result<ChainPair, InvalidChainCode> {
    let base = match script_type {
        ScriptType2Of3::P2sh => 0,
        ScriptType2Of3::P2shP2wsh => 10,
        ScriptType2Of3::P2wsh => 20,
        ScriptType2Of3::P2tr => 30,
        ScriptType2Of3::P2trMusig2 => {
            return Err(InvalidChainCode::NoCodesForType(script_type))
        }
    };
    Ok(ChainPair {
        external: ChainCode(base),
        internal: ChainCode(base + 1),
    })
}

/// All external codes, or all internal codes.
pub fn for_scope(scope: Scope) -> Vec<ChainCode> {
    REGISTRY
        .iter()
        .copied()
        .filter(|c| c.scope() == scope)
        .collect()
}
