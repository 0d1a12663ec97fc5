//! EAP framing (RFC 3748) and its transport over RADIUS (RFC 3579).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Code      |  Identifier   |            Length             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Type      |  Type-Data ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Tunneled types (TTLS, PEAP) prefix the type data with a flags octet
//! and, when the L bit is set, a 4-octet total message length:
//!
//! ```text
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |L M S R R  Ver |        Message Length (only when L is set)    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Message Length (cont.)       |  Data ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

pub mod avp;

use crate::attributes::{Attribute, AttributeType};
use crate::packet::{Packet, PacketError};
use thiserror::Error;

/// Largest tunneled payload emitted in one EAP frame: four RADIUS
/// attributes' worth of data after the 5-octet EAP header.
pub const DEFAULT_FRAGMENT_SIZE: usize = (Attribute::MAX_VALUE_LENGTH - 5) * 4;

/// Largest fragment size whose Access-Challenge still encodes next to a
/// full-length State and a Message-Authenticator. The frame header with
/// the L bit takes 10 octets and every EAP-Message attribute 2 more.
pub const MAX_FRAGMENT_SIZE: usize = {
    let room = Packet::MAX_PACKET_SIZE
        - Packet::MIN_PACKET_SIZE
        - (Attribute::MAX_VALUE_LENGTH + 2)
        - 18;
    let attributes = room.div_ceil(Attribute::MAX_VALUE_LENGTH + 2);
    room - 2 * attributes - 10
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EapCode {
    Request = 1,
    Response = 2,
    Success = 3,
    Failure = 4,
}

impl EapCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(EapCode::Request),
            2 => Some(EapCode::Response),
            3 => Some(EapCode::Success),
            4 => Some(EapCode::Failure),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// EAP method types (RFC 3748 and the IANA registry)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EapType {
    Identity = 1,
    Notification = 2,
    /// Response only; lists the types the peer would accept instead.
    Nak = 3,
    Md5Challenge = 4,
    OneTimePassword = 5,
    GenericTokenCard = 6,
    Tls = 13,
    Ttls = 21,
    Peap = 25,
    MsChapV2 = 26,
    Expanded = 254,
}

impl EapType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(EapType::Identity),
            2 => Some(EapType::Notification),
            3 => Some(EapType::Nak),
            4 => Some(EapType::Md5Challenge),
            5 => Some(EapType::OneTimePassword),
            6 => Some(EapType::GenericTokenCard),
            13 => Some(EapType::Tls),
            21 => Some(EapType::Ttls),
            25 => Some(EapType::Peap),
            26 => Some(EapType::MsChapV2),
            254 => Some(EapType::Expanded),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Types whose type data starts with a flags octet.
    pub fn is_tunneled(self) -> bool {
        matches!(self, EapType::Tls | EapType::Ttls | EapType::Peap)
    }

    /// Identifier used for the next server Request of this type. Methods
    /// that open a fresh round (MD5, TTLS, PEAP) move to the next
    /// identifier; Identity, NAK and GTC continue with the peer's one.
    pub fn request_identifier(self, identifier: u8) -> u8 {
        match self {
            EapType::Md5Challenge | EapType::Ttls | EapType::Peap => identifier.wrapping_add(1),
            _ => identifier,
        }
    }
}

/// Flags octet of a tunneled type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EapFlags(u8);

impl EapFlags {
    pub const LENGTH_INCLUDED: u8 = 0x80;
    pub const MORE_FRAGMENTS: u8 = 0x40;
    pub const START: u8 = 0x20;
    const VERSION_MASK: u8 = 0x07;

    pub const fn from_u8(value: u8) -> Self {
        EapFlags(value)
    }

    pub const fn start() -> Self {
        EapFlags(Self::START)
    }

    pub fn as_u8(self) -> u8 {
        self.0
    }

    pub fn length_included(self) -> bool {
        self.0 & Self::LENGTH_INCLUDED != 0
    }

    pub fn more_fragments(self) -> bool {
        self.0 & Self::MORE_FRAGMENTS != 0
    }

    pub fn is_start(self) -> bool {
        self.0 & Self::START != 0
    }

    pub fn version(self) -> u8 {
        self.0 & Self::VERSION_MASK
    }

    fn with(self, bit: u8, on: bool) -> Self {
        if on { EapFlags(self.0 | bit) } else { EapFlags(self.0 & !bit) }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EapError {
    #[error("Packet too short: expected at least {expected} bytes, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("Invalid EAP code: {0}")]
    InvalidCode(u8),

    #[error("Invalid packet length: {0}")]
    InvalidLength(usize),

    #[error("Reassembled {actual} bytes but {expected} were announced")]
    FragmentLengthMismatch { expected: usize, actual: usize },

    #[error("Invalid challenge length: {0}")]
    InvalidChallengeLength(usize),

    #[error("Invalid AVP: {0}")]
    InvalidAvp(String),
}

/// Decoded EAP header and type data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EapHeader {
    pub code: EapCode,
    pub identifier: u8,
    pub length: u16,
    /// Raw type octet; absent for Success and Failure.
    pub type_code: Option<u8>,
    /// Present for tunneled types only.
    pub flags: Option<EapFlags>,
    /// Total message length announced by the L bit.
    pub message_length: Option<u32>,
    pub data: Vec<u8>,
}

impl EapHeader {
    pub fn decode(bytes: &[u8]) -> Result<Self, EapError> {
        if bytes.len() < 4 {
            return Err(EapError::PacketTooShort {
                expected: 4,
                actual: bytes.len(),
            });
        }

        let code = EapCode::from_u8(bytes[0]).ok_or(EapError::InvalidCode(bytes[0]))?;
        let identifier = bytes[1];
        let length = u16::from_be_bytes([bytes[2], bytes[3]]);
        let frame_len = length as usize;
        if frame_len < 4 {
            return Err(EapError::InvalidLength(frame_len));
        }
        if bytes.len() < frame_len {
            return Err(EapError::PacketTooShort {
                expected: frame_len,
                actual: bytes.len(),
            });
        }
        let frame = &bytes[..frame_len];

        let mut header = EapHeader {
            code,
            identifier,
            length,
            type_code: None,
            flags: None,
            message_length: None,
            data: Vec::new(),
        };

        if matches!(code, EapCode::Success | EapCode::Failure) {
            return Ok(header);
        }
        if frame.len() < 5 {
            return Err(EapError::InvalidLength(frame_len));
        }

        let type_code = frame[4];
        header.type_code = Some(type_code);

        let tunneled = EapType::from_u8(type_code).is_some_and(EapType::is_tunneled);
        if !tunneled {
            header.data = frame[5..].to_vec();
            return Ok(header);
        }

        let Some(&flag_byte) = frame.get(5) else {
            return Ok(header);
        };
        let flags = EapFlags::from_u8(flag_byte);
        header.flags = Some(flags);

        let mut data = if flags.length_included() {
            if frame.len() < 10 {
                return Err(EapError::PacketTooShort {
                    expected: 10,
                    actual: frame.len(),
                });
            }
            let total = u32::from_be_bytes([frame[6], frame[7], frame[8], frame[9]]);
            header.message_length = Some(total);
            frame[10..].to_vec()
        } else {
            frame[6..].to_vec()
        };
        if let Some(total) = header.message_length {
            data.truncate(total as usize);
        }
        header.data = data;

        Ok(header)
    }

    pub fn eap_type(&self) -> Option<EapType> {
        self.type_code.and_then(EapType::from_u8)
    }

    pub fn more_fragments(&self) -> bool {
        self.flags.is_some_and(EapFlags::more_fragments)
    }
}

/// Parameters of a frame the server is about to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameParams {
    pub code: EapCode,
    /// Identifier of the message being answered.
    pub identifier: u8,
    pub eap_type: EapType,
    pub flags: EapFlags,
    /// First fragment of a new message; only this one may carry the L bit.
    pub first_fragment: bool,
    pub max_fragment_size: usize,
}

impl FrameParams {
    pub fn request(identifier: u8, eap_type: EapType) -> Self {
        FrameParams {
            code: EapCode::Request,
            identifier,
            eap_type,
            flags: EapFlags::default(),
            first_fragment: true,
            max_fragment_size: DEFAULT_FRAGMENT_SIZE,
        }
    }

    pub fn with_flags(mut self, flags: EapFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn continuation(mut self) -> Self {
        self.first_fragment = false;
        self
    }

    pub fn max_fragment_size(mut self, size: usize) -> Self {
        self.max_fragment_size = size.max(1);
        self
    }
}

/// A frame ready for the wire plus the data that did not fit in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EapFrame {
    pub frame: Vec<u8>,
    pub remainder: Option<Vec<u8>>,
}

/// Builds one EAP frame. Tunneled payloads larger than the fragment size
/// are cut: the frame carries the first `max_fragment_size` octets with
/// the M bit set (and the L bit plus total length on a first fragment),
/// and the rest is returned as the remainder for the next poll.
pub fn encode_frame(params: &FrameParams, data: &[u8]) -> EapFrame {
    let identifier = params.eap_type.request_identifier(params.identifier);
    let mut frame = vec![params.code.as_u8(), identifier, 0, 0, params.eap_type.as_u8()];
    let mut remainder = None;

    if params.eap_type.is_tunneled() {
        let max = params.max_fragment_size;
        let oversized = data.len() > max;
        let include_length = oversized && params.first_fragment;
        let flags = params
            .flags
            .with(EapFlags::LENGTH_INCLUDED, include_length)
            .with(EapFlags::MORE_FRAGMENTS, oversized);

        frame.push(flags.as_u8());
        if include_length {
            frame.extend_from_slice(&(data.len() as u32).to_be_bytes());
        }
        if oversized {
            frame.extend_from_slice(&data[..max]);
            remainder = Some(data[max..].to_vec());
        } else {
            frame.extend_from_slice(data);
        }
    } else {
        frame.extend_from_slice(data);
    }

    let length = frame.len() as u16;
    frame[2..4].copy_from_slice(&length.to_be_bytes());
    EapFrame { frame, remainder }
}

/// 4-octet EAP Success or Failure frame.
pub fn completion_frame(success: bool, identifier: u8) -> [u8; 4] {
    let code = if success { EapCode::Success } else { EapCode::Failure };
    [code.as_u8(), identifier, 0, 4]
}

/// Splits an EAP frame into EAP-Message attributes of at most 253 octets.
pub fn eap_message_attributes(frame: &[u8]) -> Result<Vec<Attribute>, PacketError> {
    frame
        .chunks(Attribute::MAX_VALUE_LENGTH)
        .map(|chunk| Attribute::new(AttributeType::EapMessage.as_u8(), chunk.to_vec()))
        .collect()
}

/// Attributes of an Access-Challenge: the State token first, then the
/// frame sliced into EAP-Message attributes.
pub fn challenge_attributes(frame: &[u8], state: &[u8]) -> Result<Vec<Attribute>, PacketError> {
    let mut attributes = vec![Attribute::new(AttributeType::State.as_u8(), state.to_vec())?];
    attributes.extend(eap_message_attributes(frame)?);
    Ok(attributes)
}

/// Attributes of a terminal Accept/Reject: the Success/Failure frame, the
/// peer's User-Name when given, then any extra attributes.
pub fn completion_attributes(
    success: bool,
    identifier: u8,
    user_name: Option<Attribute>,
    extra: Vec<Attribute>,
) -> Result<Vec<Attribute>, PacketError> {
    let mut attributes = eap_message_attributes(&completion_frame(success, identifier))?;
    attributes.extend(user_name);
    attributes.extend(extra);
    Ok(attributes)
}

/// Reassembles a fragmented tunneled message from successive frames.
#[derive(Debug, Clone, Default)]
pub struct FragmentAssembler {
    expected_length: Option<usize>,
    buffer: Vec<u8>,
}

impl FragmentAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one decoded frame; returns the whole message once a frame
    /// without the M bit arrives.
    pub fn push(&mut self, header: &EapHeader) -> Result<Option<Vec<u8>>, EapError> {
        if let Some(total) = header.message_length
            && self.expected_length.is_none()
        {
            self.expected_length = Some(total as usize);
        }

        self.buffer.extend_from_slice(&header.data);
        if let Some(expected) = self.expected_length
            && self.buffer.len() > expected
        {
            return Err(EapError::FragmentLengthMismatch {
                expected,
                actual: self.buffer.len(),
            });
        }

        if header.more_fragments() {
            return Ok(None);
        }

        let message = std::mem::take(&mut self.buffer);
        let expected = self.expected_length.take();
        match expected {
            Some(expected) if expected != message.len() => Err(EapError::FragmentLengthMismatch {
                expected,
                actual: message.len(),
            }),
            _ => Ok(Some(message)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// EAP-MD5 Challenge type data (RFC 3748 Section 5.4)
///
/// ```text
/// | Value-Size | Value ... | Name ...
/// ```
pub mod eap_md5 {
    use super::EapError;

    pub const MD5_CHALLENGE_SIZE: usize = 16;

    pub fn challenge_data(challenge: &[u8]) -> Vec<u8> {
        let mut data = Vec::with_capacity(1 + challenge.len());
        data.push(challenge.len() as u8);
        data.extend_from_slice(challenge);
        data
    }

    /// Splits response type data into the value and the optional name.
    pub fn parse_response(data: &[u8]) -> Result<(&[u8], &[u8]), EapError> {
        let (&value_size, rest) = data.split_first().ok_or(EapError::InvalidChallengeLength(0))?;
        let value_size = value_size as usize;
        if value_size == 0 || rest.len() < value_size {
            return Err(EapError::InvalidChallengeLength(value_size));
        }
        Ok(rest.split_at(value_size))
    }

    /// `MD5(identifier + password + challenge)`
    pub fn compute_response_hash(identifier: u8, password: &[u8], challenge: &[u8]) -> [u8; 16] {
        let mut context = md5::Context::new();
        context.consume([identifier]);
        context.consume(password);
        context.consume(challenge);
        context.compute().0
    }
}
