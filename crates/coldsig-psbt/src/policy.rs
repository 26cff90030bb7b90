//! Fee and dust policy applied when building transactions.

use coldsig_core::TaprootSpend;
use serde::{Deserialize, Serialize};

fn default_min_relay_fee_rate() -> u64 {
    1_000
}

fn default_max_fee_rate() -> u64 {
    1_000_000
}

fn default_dust_threshold() -> u64 {
    546
}

fn default_p2tr_spend() -> TaprootSpend {
    TaprootSpend::ScriptPathLevel1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeePolicy {
    /// Lowest accepted fee rate (sat per 1000 vbytes).
    #[serde(default = "default_min_relay_fee_rate")]
    pub min_relay_fee_rate_sat_per_kb: u64,

    /// Highest accepted fee rate. Anything above is treated as a unit error.
    #[serde(default = "default_max_fee_rate")]
    pub max_fee_rate_sat_per_kb: u64,

    /// Change at or below this value is left to the fee instead of creating an output.
    #[serde(default = "default_dust_threshold")]
    pub dust_threshold_sat: u64,

    /// Spend path used for p2tr inputs: level 1 signs with bitgo, level 2 with backup.
    #[serde(default = "default_p2tr_spend")]
    pub p2tr_spend: TaprootSpend,

    /// Leave out full previous transactions on non-segwit inputs.
    #[serde(default)]
    pub skip_non_witness_utxo: bool,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            min_relay_fee_rate_sat_per_kb: default_min_relay_fee_rate(),
            max_fee_rate_sat_per_kb: default_max_fee_rate(),
            dust_threshold_sat: default_dust_threshold(),
            p2tr_spend: default_p2tr_spend(),
            skip_non_witness_utxo: false,
        }
    }
}
