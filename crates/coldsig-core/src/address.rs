//! Address <-> output script conversion.
//!
//! Legacy outputs (p2pkh, p2sh) use base58check with the network's version
//! bytes. Witness outputs use bech32 (v0) or bech32m (v1+) with the network's
//! human-readable part.

use bitcoin::base58;
use bitcoin::bech32::{segwit, Fe32, Hrp};
use bitcoin::hashes::Hash;
use bitcoin::{PubkeyHash, Script, ScriptBuf, ScriptHash, WitnessProgram, WitnessVersion};
use thiserror::Error;

use crate::network::NetworkParams;

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("invalid address '{address}': {reason}")]
    Invalid { address: String, reason: String },

    #[error("address '{address}' is not a {network} address")]
    WrongNetwork {
        address: String,
        network: &'static str,
    },

    #[error("output script {script} has no address on {network}")]
    NoAddress {
        script: String,
        network: &'static str,
    },
}

fn invalid(address: &str, reason: impl ToString) -> AddressError {
    AddressError::Invalid {
        address: address.to_string(),
        reason: reason.to_string(),
    }
}

fn no_address(script: &Script, network: &NetworkParams) -> AddressError {
    AddressError::NoAddress {
        script: script.to_hex_string(),
        network: network.name,
    }
}

/// Decode an address into the output script it pays to.
pub fn to_output_script(address: &str, network: &NetworkParams) -> Result<ScriptBuf, AddressError> {
    if let Ok(data) = base58::decode_check(address) {
        return base58_to_script(address, &data, network);
    }

    let (hrp, version, program) = segwit::decode(address).map_err(|e| invalid(address, e))?;
    let expected = network.bech32_hrp.ok_or_else(|| AddressError::WrongNetwork {
        address: address.to_string(),
        network: network.name,
    })?;
    if !hrp.as_str().eq_ignore_ascii_case(expected) {
        return Err(AddressError::WrongNetwork {
            address: address.to_string(),
            network: network.name,
        });
    }

    let version = WitnessVersion::try_from(version).map_err(|e| invalid(address, e))?;
    if version != WitnessVersion::V0 && !network.supports_taproot {
        return Err(invalid(address, format!("witness version {} not supported", version)));
    }
    let program = WitnessProgram::new(version, &program).map_err(|e| invalid(address, e))?;
    Ok(ScriptBuf::new_witness_program(&program))
}

fn base58_to_script(
    address: &str,
    data: &[u8],
    network: &NetworkParams,
) -> Result<ScriptBuf, AddressError> {
    if data.len() != 21 {
        return Err(invalid(address, format!("payload length {}", data.len())));
    }
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&data[1..]);

    if data[0] == network.script_hash_version {
        Ok(ScriptBuf::new_p2sh(&ScriptHash::from_byte_array(hash)))
    } else if data[0] == network.pubkey_hash_version {
        Ok(ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array(hash)))
    } else {
        Err(AddressError::WrongNetwork {
            address: address.to_string(),
            network: network.name,
        })
    }
}

/// Encode an output script as an address on `network`.
pub fn from_output_script(script: &Script, network: &NetworkParams) -> Result<String, AddressError> {
    let bytes = script.as_bytes();

    if script.is_p2sh() {
        return Ok(base58_check(network.script_hash_version, &bytes[2..22]));
    }
    if script.is_p2pkh() {
        return Ok(base58_check(network.pubkey_hash_version, &bytes[3..23]));
    }

    let version = script.witness_version().ok_or_else(|| no_address(script, network))?;
    let hrp = match network.bech32_hrp {
        Some(hrp) if network.supports_segwit => hrp,
        _ => return Err(no_address(script, network)),
    };
    if version != WitnessVersion::V0 && !network.supports_taproot {
        return Err(no_address(script, network));
    }
    let hrp = Hrp::parse(hrp).map_err(|_| no_address(script, network))?;
    let fe = Fe32::try_from(version.to_num()).map_err(|_| no_address(script, network))?;
    segwit::encode(hrp, fe, &bytes[2..]).map_err(|_| no_address(script, network))
}

fn base58_check(version: u8, hash: &[u8]) -> String {
    let mut payload = Vec::with_capacity(21);
    payload.push(version);
    payload.extend_from_slice(hash);
    base58::encode_check(&payload)
}

pub fn is_valid_address(address: &str, network: &NetworkParams) -> bool {
    to_output_script(address, network).is_ok()
}
