//! Address derivation and validation per address family
//!
//! - Bitcoin: P2WPKH (bech32) from the compressed public key
//! - EVM: last 20 bytes of Keccak-256 over the uncompressed key, EIP-55 checksummed

use bitcoin::address::NetworkUnchecked;
use secp256k1::PublicKey;
use sha3::{Digest, Keccak256};
use std::str::FromStr;

use crate::types::AddressFamily;

/// Keccak-256 digest
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Derive the receiving address of `public_key` for a family
pub fn derive_address(family: &AddressFamily, public_key: &PublicKey) -> String {
    match family {
        AddressFamily::Bitcoin { network } => {
            let compressed = bitcoin::CompressedPublicKey(*public_key);
            bitcoin::Address::p2wpkh(&compressed, bitcoin::Network::from(*network)).to_string()
        }
        AddressFamily::Evm { .. } => evm_address(public_key),
    }
}

/// EIP-55 checksummed EVM address of a public key
pub fn evm_address(public_key: &PublicKey) -> String {
    let uncompressed = public_key.serialize_uncompressed();
    let hash = keccak256(&uncompressed[1..]);
    to_checksum(&hash[12..])
}

/// EIP-55 encode 20 address bytes
pub fn to_checksum(bytes: &[u8]) -> String {
    let lower = hex::encode(bytes);
    let hash = keccak256(lower.as_bytes());

    let mut out = String::with_capacity(42);
    out.push_str("0x");
    for (i, c) in lower.chars().enumerate() {
        let nibble = (hash[i / 2] >> if i % 2 == 0 { 4 } else { 0 }) & 0x0f;
        if c.is_ascii_alphabetic() && nibble >= 8 {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Parse a 0x-prefixed EVM address
///
/// All-lowercase and all-uppercase forms are accepted; mixed case must carry
/// a valid EIP-55 checksum.
pub fn parse_evm_address(address: &str) -> Option<[u8; 20]> {
    let body = address.strip_prefix("0x").or_else(|| address.strip_prefix("0X"))?;
    if body.len() != 40 {
        return None;
    }
    let bytes = hex::decode(body).ok()?;
    let mut out = [0u8; 20];
    out.copy_from_slice(&bytes);

    let has_lower = body.chars().any(|c| c.is_ascii_lowercase());
    let has_upper = body.chars().any(|c| c.is_ascii_uppercase());
    if has_lower && has_upper && to_checksum(&out)[2..] != *body {
        return None;
    }
    Some(out)
}

/// Whether `address` is well-formed for the family
pub fn validate_address(family: &AddressFamily, address: &str) -> bool {
    match family {
        AddressFamily::Bitcoin { network } => bitcoin::Address::<NetworkUnchecked>::from_str(address)
            .map(|a| a.is_valid_for_network(bitcoin::Network::from(*network)))
            .unwrap_or(false),
        AddressFamily::Evm { .. } => parse_evm_address(address).is_some(),
    }
}
