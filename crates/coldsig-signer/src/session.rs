//! One signing run: load the root key, verify and half-sign a prebuild file.

use anyhow::{Context, Result};
use bitcoin::bip32::Xpriv;
use coldsig_core::Coin;
use coldsig_psbt::TxFormat;
use coldsig_vault::{create_half_signed, SignedPrebuild, TransactionPrebuild};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use zeroize::Zeroizing;

use crate::config::SignerConfig;

/// Read the root xprv from `path` and check it is for `coin`'s network.
pub fn load_root_key(path: &Path, coin: Coin) -> Result<Xpriv> {
    let contents = Zeroizing::new(
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read root key file: {}", path.display()))?,
    );
    let root = Xpriv::from_str(contents.trim())
        .map_err(|_| anyhow::anyhow!("{} does not hold a valid xprv", path.display()))?;
    anyhow::ensure!(
        root.network == coin.params().kind,
        "root key network does not match coin {}",
        coin.name()
    );
    Ok(root)
}

#[derive(Debug, Clone)]
pub struct SignJob {
    pub prebuild: PathBuf,
    /// Where the signed prebuild JSON goes. Stdout when `None`.
    pub out: Option<PathBuf>,
    pub derivation_id: Option<String>,
}

pub fn run(config: &SignerConfig, job: &SignJob) -> Result<SignedPrebuild> {
    let coin = config.coin()?;
    let derivation_id = job
        .derivation_id
        .as_deref()
        .or(config.signer.derivation_id.as_deref())
        .context("no derivation id: pass --derivation-id or set signer.derivation_id")?;
    let json = std::fs::read_to_string(&job.prebuild)
        .with_context(|| format!("Failed to read prebuild: {}", job.prebuild.display()))?;
    let prebuild = TransactionPrebuild::from_json(&json).context("Failed to parse prebuild")?;

    let root = load_root_key(&config.signer.root_key_file, coin)?;
    let format: TxFormat = config.output.tx_format;
    log::info!(
        "signing prebuild {} for {} as {:?}",
        job.prebuild.display(),
        coin.name(),
        format
    );
    let signed = create_half_signed(coin, &root, derivation_id, &prebuild, format)
        .context("Prebuild rejected")?;

    let out = serde_json::to_string_pretty(&signed)?;
    match &job.out {
        Some(path) => std::fs::write(path, out)
            .with_context(|| format!("Failed to write {}", path.display()))?,
        None => println!("{}", out),
    }
    Ok(signed)
}
