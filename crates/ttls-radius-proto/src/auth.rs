use crate::attributes::{Attribute, AttributeType};
use crate::message_auth::calculate_message_authenticator;
use crate::packet::{Packet, PacketError};
use rand::Rng;

/// Random Request Authenticator (RFC 2865 Section 3).
pub fn generate_request_authenticator() -> [u8; 16] {
    let mut authenticator = [0u8; 16];
    rand::rng().fill(&mut authenticator);
    authenticator
}

/// Response Authenticator per RFC 2865 Section 3:
/// `MD5(Code + ID + Length + RequestAuth + Attributes + Secret)`.
pub fn calculate_response_authenticator(
    packet: &Packet,
    request_authenticator: &[u8; 16],
    secret: &[u8],
) -> Result<[u8; 16], PacketError> {
    let mut unsigned = packet.clone();
    unsigned.authenticator = *request_authenticator;
    let bytes = unsigned.encode()?;
    Ok(digest_with_secret(&bytes, secret))
}

pub fn verify_response_authenticator(
    response: &Packet,
    request_authenticator: &[u8; 16],
    secret: &[u8],
) -> bool {
    calculate_response_authenticator(response, request_authenticator, secret)
        .map(|expected| expected == response.authenticator)
        .unwrap_or(false)
}

/// Encodes a reply to the request whose authenticator is given.
///
/// A Message-Authenticator is added whenever the reply carries an
/// EAP-Message (RFC 3579 Section 3.2); it is computed with the Request
/// Authenticator in place and before the Response Authenticator, which
/// then covers it.
pub fn encode_response(
    response: &Packet,
    request_authenticator: &[u8; 16],
    secret: &[u8],
) -> Result<Vec<u8>, PacketError> {
    let message_auth = AttributeType::MessageAuthenticator.as_u8();

    let mut packet = response.clone();
    packet.authenticator = *request_authenticator;
    packet.attributes.retain(|a| a.attr_type != message_auth);

    let signed = packet.eap_message().is_some();
    if signed {
        packet.add_attribute(Attribute::new(message_auth, vec![0u8; 16])?);
    }

    let mut bytes = packet.encode()?;
    if signed {
        let mac = calculate_message_authenticator(&bytes, secret);
        let offset = bytes.len() - 16;
        bytes[offset..].copy_from_slice(&mac);
    }

    let authenticator = digest_with_secret(&bytes, secret);
    bytes[4..20].copy_from_slice(&authenticator);
    Ok(bytes)
}

fn digest_with_secret(bytes: &[u8], secret: &[u8]) -> [u8; 16] {
    let mut context = md5::Context::new();
    context.consume(bytes);
    context.consume(secret);
    context.compute().0
}

/// RFC 2865 Section 5.2 hiding: the input is zero-padded to a multiple
/// of 16 octets and XORed with `MD5(secret + authenticator)`, then
/// `MD5(secret + previous ciphertext block)` for each following block.
pub fn encrypt_user_password(password: &[u8], secret: &[u8], authenticator: &[u8; 16]) -> Vec<u8> {
    let mut padded = password.to_vec();
    let blocks = padded.len().div_ceil(16).max(1);
    padded.resize(blocks * 16, 0);
    md5_chain(&padded, secret, authenticator, Direction::Encrypt)
}

/// Reverses [`encrypt_user_password`]. The padding is left in place;
/// callers cut the password at the first NUL.
pub fn decrypt_user_password(
    encrypted: &[u8],
    secret: &[u8],
    authenticator: &[u8; 16],
) -> Result<Vec<u8>, PacketError> {
    if encrypted.is_empty() || encrypted.len() % 16 != 0 || encrypted.len() > 128 {
        return Err(PacketError::InvalidPasswordLength(encrypted.len()));
    }
    Ok(md5_chain(encrypted, secret, authenticator, Direction::Decrypt))
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Encrypt,
    Decrypt,
}

/// MD5 keystream shared by User-Password hiding and MS-MPPE key
/// encryption. `seed` follows the secret in the first block's hash; every
/// later block hashes the secret with the previous ciphertext block.
/// `data` must be a multiple of 16 octets.
pub(crate) fn md5_chain(data: &[u8], secret: &[u8], seed: &[u8], direction: Direction) -> Vec<u8> {
    let mut output = Vec::with_capacity(data.len());
    let mut previous: Vec<u8> = seed.to_vec();

    for block in data.chunks(16) {
        let mut context = md5::Context::new();
        context.consume(secret);
        context.consume(&previous);
        let pad = context.compute();

        let mixed: Vec<u8> = block.iter().zip(pad.0.iter()).map(|(b, p)| b ^ p).collect();
        previous = match direction {
            Direction::Encrypt => mixed.clone(),
            Direction::Decrypt => block.to_vec(),
        };
        output.extend_from_slice(&mixed);
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_auth::verify_packet_message_authenticator;
    use crate::packet::Code;

    #[test]
    fn test_generate_authenticator() {
        assert_ne!(generate_request_authenticator(), generate_request_authenticator());
    }

    #[test]
    fn test_password_encryption_decryption() {
        let secret = b"sharedsecret";
        let authenticator = [1u8; 16];

        let encrypted = encrypt_user_password(b"a password longer than 16", secret, &authenticator);
        assert_eq!(encrypted.len(), 32);

        let decrypted = decrypt_user_password(&encrypted, secret, &authenticator).unwrap();
        assert_eq!(&decrypted[..25], b"a password longer than 16");
        assert!(decrypted[25..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_password_encryption_empty() {
        let encrypted = encrypt_user_password(b"", b"sharedsecret", &[1u8; 16]);
        assert_eq!(encrypted.len(), 16);
    }

    #[test]
    fn test_password_rfc2865_first_block() {
        // First ciphertext block is the plaintext XOR MD5(secret + authenticator).
        let secret = b"xyzzy5461";
        let authenticator = [0x0f; 16];
        let encrypted = encrypt_user_password(b"arctangent", secret, &authenticator);

        let mut seed = secret.to_vec();
        seed.extend_from_slice(&authenticator);
        let pad = md5::compute(&seed).0;
        assert_eq!(encrypted[0], b'a' ^ pad[0]);
        assert_eq!(encrypted[15], pad[15]);
    }

    #[test]
    fn test_invalid_password_length() {
        assert!(decrypt_user_password(&[0u8; 15], b"s", &[0u8; 16]).is_err());
        assert!(decrypt_user_password(&[], b"s", &[0u8; 16]).is_err());
    }

    #[test]
    fn test_response_authenticator() {
        let secret = b"sharedsecret";
        let request_auth = [1u8; 16];
        let mut packet = Packet::new(Code::AccessAccept, 42, [0u8; 16]);

        packet.authenticator = calculate_response_authenticator(&packet, &request_auth, secret).unwrap();
        assert!(verify_response_authenticator(&packet, &request_auth, secret));
        assert!(!verify_response_authenticator(&packet, &[2u8; 16], secret));
    }

    #[test]
    fn test_encode_response_signs_eap_replies() {
        let secret = b"testing123";
        let request_auth = [9u8; 16];
        let mut reply = Packet::new(Code::AccessChallenge, 3, [0u8; 16]);
        reply.add_attribute(Attribute::new(AttributeType::EapMessage.as_u8(), vec![1, 3, 0, 4]).unwrap());

        let bytes = encode_response(&reply, &request_auth, secret).unwrap();
        let decoded = Packet::decode(&bytes).unwrap();
        assert!(verify_response_authenticator(&decoded, &request_auth, secret));

        // The Message-Authenticator was computed with the request authenticator in place.
        let mut unsigned = bytes.clone();
        unsigned[4..20].copy_from_slice(&request_auth);
        assert_eq!(verify_packet_message_authenticator(&unsigned, secret), Some(true));
    }

    #[test]
    fn test_encode_response_without_eap_is_unsigned() {
        let reply = Packet::new(Code::AccessReject, 3, [0u8; 16]);
        let bytes = encode_response(&reply, &[0u8; 16], b"s").unwrap();
        let decoded = Packet::decode(&bytes).unwrap();
        assert!(decoded.find_attribute(AttributeType::MessageAuthenticator.as_u8()).is_none());
    }
}
