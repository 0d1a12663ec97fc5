//! MS-MPPE-Send-Key / MS-MPPE-Recv-Key encoding (RFC 2548 Section 2.4)
//!
//! ```text
//! | Salt (2) | String: encrypted(Key-Length + Key + Padding) ...
//! ```
//!
//! The plaintext is the key length octet, the key, and zero padding to a
//! multiple of 16. Block `i` is XORed with `MD5(secret + authenticator +
//! salt)` for the first block and `MD5(secret + c(i-1))` afterwards.

use crate::attributes::Attribute;
use crate::auth::{Direction, md5_chain};
use crate::packet::PacketError;
use rand::Rng;
use thiserror::Error;

pub const MICROSOFT_VENDOR_ID: u32 = 311;
pub const MS_MPPE_SEND_KEY: u8 = 16;
pub const MS_MPPE_RECV_KEY: u8 = 17;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MppeError {
    #[error("Key too long: {0} bytes")]
    KeyTooLong(usize),
    #[error("Invalid encrypted key length: {0}")]
    InvalidLength(usize),
    #[error("Salt high bit not set")]
    InvalidSalt,
    #[error("Decrypted key length {0} exceeds the ciphertext")]
    InvalidKeyLength(usize),
}

/// Random salt with the most significant bit set.
pub fn generate_salt() -> [u8; 2] {
    let mut salt = [0u8; 2];
    rand::rng().fill(&mut salt);
    salt[0] |= 0x80;
    salt
}

pub fn encrypt_key(key: &[u8], secret: &[u8], authenticator: &[u8; 16]) -> Result<Vec<u8>, MppeError> {
    encrypt_key_with_salt(key, secret, authenticator, generate_salt())
}

/// Deterministic variant of [`encrypt_key`]. The salt's high bit is forced on.
pub fn encrypt_key_with_salt(
    key: &[u8],
    secret: &[u8],
    authenticator: &[u8; 16],
    mut salt: [u8; 2],
) -> Result<Vec<u8>, MppeError> {
    if key.len() > u8::MAX as usize {
        return Err(MppeError::KeyTooLong(key.len()));
    }
    salt[0] |= 0x80;

    let mut plaintext = Vec::with_capacity(key.len() + 16);
    plaintext.push(key.len() as u8);
    plaintext.extend_from_slice(key);
    plaintext.resize(plaintext.len().div_ceil(16) * 16, 0);

    let mut output = salt.to_vec();
    output.extend(md5_chain(&plaintext, secret, &seed(authenticator, salt), Direction::Encrypt));
    Ok(output)
}

/// Inverse of [`encrypt_key`]: returns the key without its padding.
pub fn decrypt_key(blob: &[u8], secret: &[u8], authenticator: &[u8; 16]) -> Result<Vec<u8>, MppeError> {
    if blob.len() < 18 || (blob.len() - 2) % 16 != 0 {
        return Err(MppeError::InvalidLength(blob.len()));
    }
    let salt = [blob[0], blob[1]];
    if salt[0] & 0x80 == 0 {
        return Err(MppeError::InvalidSalt);
    }

    let plaintext = md5_chain(&blob[2..], secret, &seed(authenticator, salt), Direction::Decrypt);
    let key_length = plaintext[0] as usize;
    if key_length + 1 > plaintext.len() {
        return Err(MppeError::InvalidKeyLength(key_length));
    }
    Ok(plaintext[1..1 + key_length].to_vec())
}

fn seed(authenticator: &[u8; 16], salt: [u8; 2]) -> Vec<u8> {
    let mut seed = authenticator.to_vec();
    seed.extend_from_slice(&salt);
    seed
}

/// MS-MPPE-Send-Key (vendor 311, type 16)
pub fn send_key_attribute(
    key: &[u8],
    secret: &[u8],
    authenticator: &[u8; 16],
) -> Result<Attribute, PacketError> {
    key_attribute(MS_MPPE_SEND_KEY, key, secret, authenticator)
}

/// MS-MPPE-Recv-Key (vendor 311, type 17)
pub fn recv_key_attribute(
    key: &[u8],
    secret: &[u8],
    authenticator: &[u8; 16],
) -> Result<Attribute, PacketError> {
    key_attribute(MS_MPPE_RECV_KEY, key, secret, authenticator)
}

fn key_attribute(
    vendor_type: u8,
    key: &[u8],
    secret: &[u8],
    authenticator: &[u8; 16],
) -> Result<Attribute, PacketError> {
    let blob = encrypt_key(key, secret, authenticator)
        .map_err(|e| PacketError::AttributeError(e.to_string()))?;
    Attribute::vendor_specific(MICROSOFT_VENDOR_ID, vendor_type, &blob)
}
