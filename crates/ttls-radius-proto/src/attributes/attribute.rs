use crate::packet::PacketError;

/// RADIUS attribute (RFC 2865 Section 5)
///
/// ```text
///  0                   1                   2
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |     Type      |    Length     |  Value ...
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub attr_type: u8,
    pub value: Vec<u8>,
}

impl Attribute {
    /// Type and length octets.
    pub const MIN_LENGTH: usize = 2;
    pub const MAX_LENGTH: usize = 255;
    /// Largest value a single attribute instance can carry.
    pub const MAX_VALUE_LENGTH: usize = 253;

    pub fn new(attr_type: u8, value: Vec<u8>) -> Result<Self, PacketError> {
        if value.len() > Self::MAX_VALUE_LENGTH {
            return Err(PacketError::AttributeError(format!(
                "Attribute value too long: {} bytes (max {})",
                value.len(),
                Self::MAX_VALUE_LENGTH
            )));
        }
        Ok(Attribute { attr_type, value })
    }

    pub fn string(attr_type: u8, value: impl Into<String>) -> Result<Self, PacketError> {
        Self::new(attr_type, value.into().into_bytes())
    }

    /// 32-bit big-endian integer value.
    pub fn integer(attr_type: u8, value: u32) -> Result<Self, PacketError> {
        Self::new(attr_type, value.to_be_bytes().to_vec())
    }

    /// Vendor-Specific attribute (type 26) holding a single sub-attribute.
    ///
    /// ```text
    /// | 26 | Len | Vendor-Id (4) | Vendor-Type | Vendor-Length | Data ...
    /// ```
    pub fn vendor_specific(vendor_id: u32, vendor_type: u8, data: &[u8]) -> Result<Self, PacketError> {
        if data.len() + 2 > u8::MAX as usize {
            return Err(PacketError::AttributeError(format!(
                "Vendor attribute too long: {} bytes",
                data.len()
            )));
        }
        let mut value = Vec::with_capacity(6 + data.len());
        value.extend_from_slice(&vendor_id.to_be_bytes());
        value.push(vendor_type);
        value.push((data.len() + 2) as u8);
        value.extend_from_slice(data);
        Self::new(super::AttributeType::VendorSpecific.as_u8(), value)
    }

    /// Appends the wire form of this attribute to `buffer`.
    pub fn encode_into(&self, buffer: &mut Vec<u8>) -> Result<(), PacketError> {
        let length = self.encoded_length();
        if length > Self::MAX_LENGTH {
            return Err(PacketError::AttributeError(format!(
                "Encoded attribute too long: {} bytes",
                length
            )));
        }
        buffer.push(self.attr_type);
        buffer.push(length as u8);
        buffer.extend_from_slice(&self.value);
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let mut buffer = Vec::with_capacity(self.encoded_length());
        self.encode_into(&mut buffer)?;
        Ok(buffer)
    }

    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < Self::MIN_LENGTH {
            return Err(PacketError::AttributeError(format!(
                "Attribute data too short: {} bytes",
                data.len()
            )));
        }

        let attr_type = data[0];
        let length = data[1] as usize;
        if length < Self::MIN_LENGTH {
            return Err(PacketError::AttributeError(format!(
                "Invalid attribute length: {}",
                length
            )));
        }
        if data.len() < length {
            return Err(PacketError::AttributeError(format!(
                "Insufficient data for attribute: expected {}, got {}",
                length,
                data.len()
            )));
        }

        Ok(Attribute {
            attr_type,
            value: data[Self::MIN_LENGTH..length].to_vec(),
        })
    }

    pub fn encoded_length(&self) -> usize {
        Self::MIN_LENGTH + self.value.len()
    }

    pub fn as_string(&self) -> Result<String, std::string::FromUtf8Error> {
        String::from_utf8(self.value.clone())
    }

    pub fn as_integer(&self) -> Result<u32, PacketError> {
        let bytes: [u8; 4] = self.value.as_slice().try_into().map_err(|_| {
            PacketError::AttributeError(format!(
                "Expected 4 bytes for integer, got {}",
                self.value.len()
            ))
        })?;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Parses the first sub-attribute of a Vendor-Specific attribute.
    pub fn as_vendor_specific(&self) -> Result<VendorSpecific, PacketError> {
        if self.attr_type != super::AttributeType::VendorSpecific.as_u8() {
            return Err(PacketError::AttributeError(format!(
                "Attribute {} is not Vendor-Specific",
                self.attr_type
            )));
        }
        if self.value.len() < 6 {
            return Err(PacketError::AttributeError(format!(
                "Vendor-Specific value too short: {} bytes",
                self.value.len()
            )));
        }
        let vendor_id = u32::from_be_bytes([self.value[0], self.value[1], self.value[2], self.value[3]]);
        let vendor_type = self.value[4];
        let vendor_length = self.value[5] as usize;
        if vendor_length < 2 || 4 + vendor_length > self.value.len() {
            return Err(PacketError::AttributeError(format!(
                "Invalid vendor attribute length: {}",
                vendor_length
            )));
        }
        Ok(VendorSpecific {
            vendor_id,
            vendor_type,
            data: self.value[6..4 + vendor_length].to_vec(),
        })
    }
}

/// Decoded Vendor-Specific sub-attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorSpecific {
    pub vendor_id: u32,
    pub vendor_type: u8,
    pub data: Vec<u8>,
}
