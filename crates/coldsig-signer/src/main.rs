//! coldsig-signer: air-gapped half-signing of transaction prebuilds.
//!
//! Reads a prebuild JSON produced by the online wallet service, checks every
//! key and script in it against the vault root key, and writes the
//! half-signed result.
//!
//! # Usage
//!
//! ```bash
//! coldsig-signer --config /etc/coldsig/signer.toml --prebuild prebuild.json --out signed.json
//! coldsig-signer --config signer.toml --validate
//! ```

mod config;
mod session;

use anyhow::{Context, Result};
use std::path::PathBuf;

fn main() -> Result<()> {
    // Minimal arg parsing; the signer takes a handful of flags.
    let args: Vec<String> = std::env::args().collect();

    let mut config_path = PathBuf::from("/etc/coldsig/signer.toml");
    let mut prebuild = None;
    let mut out = None;
    let mut derivation_id = None;
    let mut validate_only = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                config_path = PathBuf::from(next_value(&args, &mut i, "--config")?);
            }
            "--prebuild" | "-p" => {
                prebuild = Some(PathBuf::from(next_value(&args, &mut i, "--prebuild")?));
            }
            "--out" | "-o" => {
                out = Some(PathBuf::from(next_value(&args, &mut i, "--out")?));
            }
            "--derivation-id" => {
                derivation_id = Some(next_value(&args, &mut i, "--derivation-id")?.to_string());
            }
            "--validate" => {
                validate_only = true;
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            "--version" | "-V" => {
                println!("coldsig-signer {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            other => {
                anyhow::bail!("Unknown argument: {}", other);
            }
        }
        i += 1;
    }

    let mut signer_config = config::SignerConfig::from_file(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    signer_config.apply_env_overrides()?;
    signer_config
        .validate()
        .context("Configuration validation failed")?;

    // RUST_LOG wins over the configured level.
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(signer_config.signer.log_level.as_str()),
    )
    .init();

    if validate_only {
        println!("Configuration is valid.");
        println!("  Coin:          {}", signer_config.network.coin);
        println!(
            "  Root key file: {}",
            signer_config.signer.root_key_file.display()
        );
        println!("  Output format: {:?}", signer_config.output.tx_format);
        return Ok(());
    }

    let job = session::SignJob {
        prebuild: prebuild.context("--prebuild is required")?,
        out,
        derivation_id,
    };
    let signed = session::run(&signer_config, &job)?;
    log::info!("added {} signatures", signed.signatures_added);
    Ok(())
}

fn next_value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .with_context(|| format!("{} requires an argument", flag))
}

fn print_help() {
    println!(
        r#"coldsig-signer: verify and half-sign a transaction prebuild offline

USAGE:
    coldsig-signer [OPTIONS] --prebuild <PATH>

OPTIONS:
    -c, --config <PATH>       Config file path (default: /etc/coldsig/signer.toml)
    -p, --prebuild <PATH>     Prebuild JSON from the wallet service
    -o, --out <PATH>          Write the signed prebuild here (default: stdout)
    --derivation-id <ID>      User key seed, overrides signer.derivation_id
    --validate                Validate config file and exit
    -h, --help                Show this help message
    -V, --version             Show version

ENVIRONMENT VARIABLES (override config file):
    COLDSIG_COIN              Coin (btc/tbtc/ltc/tltc/doge/tdoge)
    COLDSIG_ROOT_KEY_FILE     Root xprv file
    COLDSIG_DERIVATION_ID     User key seed
    COLDSIG_LOG_LEVEL         Log level (error/warn/info/debug/trace)
    COLDSIG_TX_FORMAT         Output format (psbt/legacy)
"#
    );
}
