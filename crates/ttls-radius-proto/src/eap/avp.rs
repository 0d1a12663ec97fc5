//! Diameter-style AVPs carried inside the EAP-TTLS tunnel (RFC 5281 Section 10)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           AVP Code                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V M r r r r r r|                  AVP Length                   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Vendor-ID (opt)                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    Data ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The length covers header and data but not the padding that aligns the
//! next AVP on a 4-octet boundary. AVP codes below 256 without a vendor
//! id are the RADIUS attribute numbers.

use super::EapError;
use crate::attributes::AttributeType;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AvpFlags(u8);

impl AvpFlags {
    pub const VENDOR_SPECIFIC: u8 = 0x80;
    pub const MANDATORY: u8 = 0x40;

    pub const fn from_u8(value: u8) -> Self {
        AvpFlags(value)
    }

    pub const fn mandatory() -> Self {
        AvpFlags(Self::MANDATORY)
    }

    pub fn as_u8(self) -> u8 {
        self.0
    }

    pub fn is_vendor_specific(self) -> bool {
        self.0 & Self::VENDOR_SPECIFIC != 0
    }

    pub fn is_mandatory(self) -> bool {
        self.0 & Self::MANDATORY != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Avp {
    pub code: u32,
    pub flags: AvpFlags,
    pub vendor_id: Option<u32>,
    pub data: Vec<u8>,
}

impl Avp {
    const HEADER_LENGTH: usize = 8;
    const VENDOR_HEADER_LENGTH: usize = 12;
    const MAX_LENGTH: usize = 0x00FF_FFFF;

    /// Mandatory AVP without a vendor id.
    pub fn new(code: u32, data: Vec<u8>) -> Self {
        Avp {
            code,
            flags: AvpFlags::mandatory(),
            vendor_id: None,
            data,
        }
    }

    pub fn vendor(code: u32, vendor_id: u32, data: Vec<u8>) -> Self {
        Avp {
            code,
            flags: AvpFlags::from_u8(AvpFlags::MANDATORY | AvpFlags::VENDOR_SPECIFIC),
            vendor_id: Some(vendor_id),
            data,
        }
    }

    /// EAP-Message AVP wrapping an inner EAP frame.
    pub fn eap_message(frame: Vec<u8>) -> Self {
        Self::new(AttributeType::EapMessage.as_u8() as u32, frame)
    }

    /// RADIUS attribute number when this AVP maps onto one.
    pub fn radius_type(&self) -> Option<u8> {
        if self.vendor_id.is_some() {
            return None;
        }
        u8::try_from(self.code).ok()
    }

    fn header_length(&self) -> usize {
        if self.vendor_id.is_some() {
            Self::VENDOR_HEADER_LENGTH
        } else {
            Self::HEADER_LENGTH
        }
    }

    /// Length field value: header plus data, without padding.
    pub fn length(&self) -> usize {
        self.header_length() + self.data.len()
    }

    pub fn encode_into(&self, buffer: &mut Vec<u8>) -> Result<(), EapError> {
        let length = self.length();
        if length > Self::MAX_LENGTH {
            return Err(EapError::InvalidAvp(format!("AVP {} too long: {} bytes", self.code, length)));
        }

        let mut flags = self.flags.as_u8() & !AvpFlags::VENDOR_SPECIFIC;
        if self.vendor_id.is_some() {
            flags |= AvpFlags::VENDOR_SPECIFIC;
        }

        buffer.extend_from_slice(&self.code.to_be_bytes());
        buffer.push(flags);
        buffer.extend_from_slice(&(length as u32).to_be_bytes()[1..]);
        if let Some(vendor_id) = self.vendor_id {
            buffer.extend_from_slice(&vendor_id.to_be_bytes());
        }
        buffer.extend_from_slice(&self.data);
        buffer.resize(buffer.len() + padding(length), 0);
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>, EapError> {
        let mut buffer = Vec::with_capacity(self.length() + 3);
        self.encode_into(&mut buffer)?;
        Ok(buffer)
    }
}

fn padding(length: usize) -> usize {
    (4 - length % 4) % 4
}

/// Parses a run of AVPs. Padding after the last AVP may be absent.
pub fn decode_avps(mut data: &[u8]) -> Result<Vec<Avp>, EapError> {
    let mut avps = Vec::new();

    while !data.is_empty() {
        if data.len() < Avp::HEADER_LENGTH {
            return Err(EapError::InvalidAvp(format!("truncated AVP header: {} bytes", data.len())));
        }
        let code = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let flags = AvpFlags::from_u8(data[4]);
        let length = u32::from_be_bytes([0, data[5], data[6], data[7]]) as usize;

        let (vendor_id, header_length) = if flags.is_vendor_specific() {
            if data.len() < Avp::VENDOR_HEADER_LENGTH {
                return Err(EapError::InvalidAvp(format!("AVP {} truncated vendor id", code)));
            }
            (
                Some(u32::from_be_bytes([data[8], data[9], data[10], data[11]])),
                Avp::VENDOR_HEADER_LENGTH,
            )
        } else {
            (None, Avp::HEADER_LENGTH)
        };

        if length < header_length || length > data.len() {
            return Err(EapError::InvalidAvp(format!(
                "AVP {} length {} outside 8..={}",
                code,
                length,
                data.len()
            )));
        }

        avps.push(Avp {
            code,
            flags,
            vendor_id,
            data: data[header_length..length].to_vec(),
        });

        let next = (length + padding(length)).min(data.len());
        data = &data[next..];
    }

    Ok(avps)
}

pub fn encode_avps(avps: &[Avp]) -> Result<Vec<u8>, EapError> {
    let mut buffer = Vec::new();
    for avp in avps {
        avp.encode_into(&mut buffer)?;
    }
    Ok(buffer)
}
