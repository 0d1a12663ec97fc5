use super::Code;
use crate::attributes::{Attribute, AttributeType};
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PacketError {
    #[error("Invalid packet length: {0}")]
    InvalidLength(usize),
    #[error("Invalid packet code: {0}")]
    InvalidCode(u8),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Attribute error: {0}")]
    AttributeError(String),
    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),
    #[error("Invalid User-Password length: {0}")]
    InvalidPasswordLength(usize),
}

/// RADIUS packet (RFC 2865 Section 3)
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |     Code      |  Identifier   |            Length             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                         Authenticator (16)                    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Attributes ...
/// +-+-+-+-+-+-+-+-+-+-+-+-+-
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub code: Code,
    pub identifier: u8,
    pub authenticator: [u8; 16],
    pub attributes: Vec<Attribute>,
}

impl Packet {
    /// Header size: code, identifier, length and authenticator.
    pub const MIN_PACKET_SIZE: usize = 20;
    /// RFC 2865 upper bound.
    pub const MAX_PACKET_SIZE: usize = 4096;

    pub fn new(code: Code, identifier: u8, authenticator: [u8; 16]) -> Self {
        Packet {
            code,
            identifier,
            authenticator,
            attributes: Vec::new(),
        }
    }

    pub fn add_attribute(&mut self, attribute: Attribute) {
        self.attributes.push(attribute);
    }

    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let total_length = self.length();
        if total_length > Self::MAX_PACKET_SIZE {
            return Err(PacketError::PacketTooLarge(total_length));
        }

        let mut buffer = Vec::with_capacity(total_length);
        buffer.push(self.code.as_u8());
        buffer.push(self.identifier);
        buffer.extend_from_slice(&(total_length as u16).to_be_bytes());
        buffer.extend_from_slice(&self.authenticator);
        for attr in &self.attributes {
            attr.encode_into(&mut buffer)?;
        }

        Ok(buffer)
    }

    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < Self::MIN_PACKET_SIZE {
            return Err(PacketError::InvalidLength(data.len()));
        }

        let code = Code::from_u8(data[0]).ok_or(PacketError::InvalidCode(data[0]))?;
        let identifier = data[1];
        let length = u16::from_be_bytes([data[2], data[3]]) as usize;

        if !(Self::MIN_PACKET_SIZE..=Self::MAX_PACKET_SIZE).contains(&length) {
            return Err(PacketError::InvalidLength(length));
        }
        if data.len() < length {
            return Err(PacketError::InvalidLength(data.len()));
        }

        let mut authenticator = [0u8; 16];
        authenticator.copy_from_slice(&data[4..20]);

        // Octets beyond the Length field are padding and ignored (RFC 2865 Section 3).
        let mut attributes = Vec::new();
        let mut attr_data = &data[Self::MIN_PACKET_SIZE..length];
        while !attr_data.is_empty() {
            let attr = Attribute::decode(attr_data)?;
            attr_data = &attr_data[attr.encoded_length()..];
            attributes.push(attr);
        }

        Ok(Packet {
            code,
            identifier,
            authenticator,
            attributes,
        })
    }

    /// Encoded length of the packet in octets.
    pub fn length(&self) -> usize {
        Self::MIN_PACKET_SIZE
            + self
                .attributes
                .iter()
                .map(Attribute::encoded_length)
                .sum::<usize>()
    }

    pub fn find_attribute(&self, attr_type: u8) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.attr_type == attr_type)
    }

    pub fn find_all_attributes(&self, attr_type: u8) -> Vec<&Attribute> {
        self.attributes
            .iter()
            .filter(|a| a.attr_type == attr_type)
            .collect()
    }

    /// Concatenated EAP-Message attributes (RFC 3579 Section 3.1), or
    /// `None` when the packet carries no EAP payload.
    pub fn eap_message(&self) -> Option<Vec<u8>> {
        concat_attribute_values(&self.attributes, AttributeType::EapMessage.as_u8())
    }
}

/// Joins the values of every attribute of `attr_type`, preserving order.
pub fn concat_attribute_values(attributes: &[Attribute], attr_type: u8) -> Option<Vec<u8>> {
    let mut parts = attributes.iter().filter(|a| a.attr_type == attr_type).peekable();
    parts.peek()?;
    Some(parts.flat_map(|a| a.value.iter().copied()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_encode_decode() {
        let mut packet = Packet::new(Code::AccessRequest, 42, [1u8; 16]);
        packet.add_attribute(Attribute::string(AttributeType::UserName.as_u8(), "alice").unwrap());
        let encoded = packet.encode().unwrap();
        assert_eq!(encoded.len(), packet.length());

        let decoded = Packet::decode(&encoded).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_packet_min_size() {
        let data = vec![0u8; 19];
        assert!(Packet::decode(&data).is_err());
    }

    #[test]
    fn test_trailing_padding_ignored() {
        let packet = Packet::new(Code::AccessRequest, 7, [0u8; 16]);
        let mut encoded = packet.encode().unwrap();
        encoded.extend_from_slice(&[0xAA; 5]);
        let decoded = Packet::decode(&encoded).unwrap();
        assert!(decoded.attributes.is_empty());
    }

    #[test]
    fn test_eap_message_concatenation() {
        let eap = AttributeType::EapMessage.as_u8();
        let mut packet = Packet::new(Code::AccessRequest, 1, [0u8; 16]);
        assert!(packet.eap_message().is_none());

        packet.add_attribute(Attribute::new(eap, vec![1, 2, 3]).unwrap());
        packet.add_attribute(Attribute::string(AttributeType::UserName.as_u8(), "bob").unwrap());
        packet.add_attribute(Attribute::new(eap, vec![4, 5]).unwrap());
        assert_eq!(packet.eap_message().unwrap(), vec![1, 2, 3, 4, 5]);
    }
}
