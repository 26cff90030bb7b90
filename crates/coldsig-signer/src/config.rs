//! Signer configuration: TOML file plus environment overrides.
//!
//! Priority: environment variables > config file > defaults.

use anyhow::{Context, Result};
use coldsig_core::Coin;
use coldsig_psbt::TxFormat;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignerConfig {
    pub signer: SignerSection,

    #[serde(default)]
    pub network: NetworkSection,

    #[serde(default)]
    pub output: OutputSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignerSection {
    /// File holding the vault's root xprv. Read once per run, never logged.
    pub root_key_file: PathBuf,

    /// Seed of the user key. `--derivation-id` overrides it.
    #[serde(default)]
    pub derivation_id: Option<String>,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    /// Coin name: btc, tbtc, ...
    #[serde(default = "default_coin")]
    pub coin: String,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            coin: default_coin(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputSection {
    #[serde(default)]
    pub tx_format: TxFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_coin() -> String {
    "btc".to_string()
}

impl SignerConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&contents).with_context(|| "Failed to parse TOML config")
    }

    /// Apply environment variable overrides.
    ///
    /// Supported env vars:
    /// - `COLDSIG_COIN`
    /// - `COLDSIG_ROOT_KEY_FILE`
    /// - `COLDSIG_DERIVATION_ID`
    /// - `COLDSIG_LOG_LEVEL`
    /// - `COLDSIG_TX_FORMAT`
    ///
    /// An unparseable `COLDSIG_TX_FORMAT` is an error rather than ignored.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("COLDSIG_COIN") {
            self.network.coin = v;
        }
        if let Ok(v) = std::env::var("COLDSIG_ROOT_KEY_FILE") {
            self.signer.root_key_file = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("COLDSIG_DERIVATION_ID") {
            self.signer.derivation_id = Some(v);
        }
        if let Ok(v) = std::env::var("COLDSIG_LOG_LEVEL") {
            self.signer.log_level = v;
        }
        if let Ok(v) = std::env::var("COLDSIG_TX_FORMAT") {
            self.output.tx_format = v
                .parse()
                .map_err(|e: String| anyhow::anyhow!("COLDSIG_TX_FORMAT: {}", e))?;
        }
        Ok(())
    }

    pub fn coin(&self) -> Result<Coin> {
        Ok(Coin::from_name(&self.network.coin)?)
    }

    /// Reject unusable values before any key material is read.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.signer.root_key_file.as_os_str().is_empty(),
            "signer.root_key_file must not be empty"
        );
        anyhow::ensure!(
            LOG_LEVELS.contains(&self.signer.log_level.as_str()),
            "signer.log_level must be one of {}",
            LOG_LEVELS.join("/")
        );
        if let Some(id) = &self.signer.derivation_id {
            anyhow::ensure!(!id.is_empty(), "signer.derivation_id must not be empty");
        }
        self.coin().context("network.coin")?;
        Ok(())
    }
}
