//! Message-Authenticator (RFC 3579 Section 3.2)
//!
//! HMAC-MD5 over the whole packet keyed with the shared secret, with the
//! attribute's own value zeroed during the calculation. Access-Requests
//! carrying EAP-Message must include it; replies that carry EAP-Message
//! always do (see [`crate::auth::encode_response`]).

use crate::attributes::{Attribute, AttributeType};
use crate::packet::{Packet, PacketError};
use hmac::{Hmac, Mac};
use md5_digest::Md5;

type HmacMd5 = Hmac<Md5>;

/// HMAC-MD5 over `packet_bytes`, which must already have the
/// Message-Authenticator value zeroed.
pub fn calculate_message_authenticator(packet_bytes: &[u8], secret: &[u8]) -> [u8; 16] {
    let mut mac = HmacMd5::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(packet_bytes);

    let mut output = [0u8; 16];
    output.copy_from_slice(&mac.finalize().into_bytes());
    output
}

/// Checks the 16-octet Message-Authenticator value starting at
/// `message_auth_offset`.
pub fn verify_message_authenticator(
    packet_bytes: &[u8],
    secret: &[u8],
    message_auth_offset: usize,
) -> bool {
    if message_auth_offset + 16 > packet_bytes.len() {
        return false;
    }

    let mut zeroed = packet_bytes.to_vec();
    zeroed[message_auth_offset..message_auth_offset + 16].fill(0);

    let mut mac = HmacMd5::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(&zeroed);
    mac.verify_slice(&packet_bytes[message_auth_offset..message_auth_offset + 16])
        .is_ok()
}

/// Offset of the Message-Authenticator value inside a raw packet.
pub fn find_message_authenticator(packet_bytes: &[u8]) -> Option<usize> {
    let length = u16::from_be_bytes([*packet_bytes.get(2)?, *packet_bytes.get(3)?]) as usize;
    let end = length.min(packet_bytes.len());
    let mut offset = Packet::MIN_PACKET_SIZE;

    while offset + Attribute::MIN_LENGTH <= end {
        let attr_type = packet_bytes[offset];
        let attr_len = packet_bytes[offset + 1] as usize;
        if attr_len < Attribute::MIN_LENGTH {
            return None;
        }
        if attr_type == AttributeType::MessageAuthenticator.as_u8() && attr_len == 18 {
            return Some(offset + 2);
        }
        offset += attr_len;
    }
    None
}

/// `None` when the packet has no Message-Authenticator, otherwise whether
/// it verifies. Octets past the Length field are padding and are not
/// covered by the HMAC.
pub fn verify_packet_message_authenticator(packet_bytes: &[u8], secret: &[u8]) -> Option<bool> {
    let offset = find_message_authenticator(packet_bytes)?;
    let length = u16::from_be_bytes([packet_bytes[2], packet_bytes[3]]) as usize;
    let packet = &packet_bytes[..length.min(packet_bytes.len())];
    Some(verify_message_authenticator(packet, secret, offset))
}

/// Encodes a request with a freshly computed Message-Authenticator
/// appended. Any existing one is replaced.
pub fn encode_with_message_authenticator(packet: &Packet, secret: &[u8]) -> Result<Vec<u8>, PacketError> {
    let message_auth = AttributeType::MessageAuthenticator.as_u8();
    let mut signed = packet.clone();
    signed.attributes.retain(|a| a.attr_type != message_auth);
    signed.add_attribute(Attribute::new(message_auth, vec![0u8; 16])?);

    let mut bytes = signed.encode()?;
    let mac = calculate_message_authenticator(&bytes, secret);
    let offset = bytes.len() - 16;
    bytes[offset..].copy_from_slice(&mac);
    Ok(bytes)
}
