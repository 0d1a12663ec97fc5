//! RADIUS and EAP protocol building blocks for an EAP-TTLS/PEAP server
//!
//! - RADIUS packet and attribute codec (RFC 2865)
//! - User-Password hiding and Response Authenticator calculation
//! - Message-Authenticator (RFC 3579)
//! - EAP framing with fragmentation over EAP-Message attributes
//! - EAP-TTLS AVPs (RFC 5281)
//! - MS-MPPE key encryption (RFC 2548)
//!
//! # Example
//!
//! ```rust
//! use ttls_radius_proto::eap::{EapFlags, EapType, FrameParams, challenge_attributes, encode_frame};
//!
//! let params = FrameParams::request(1, EapType::Ttls).with_flags(EapFlags::start());
//! let frame = encode_frame(&params, &[]);
//! let attributes = challenge_attributes(&frame.frame, b"state-token").unwrap();
//! assert_eq!(attributes.len(), 2);
//! ```

pub mod attributes;
pub mod auth;
pub mod eap;
pub mod message_auth;
pub mod mppe;
pub mod packet;

pub use attributes::{Attribute, AttributeType, VendorSpecific};
pub use auth::{
    calculate_response_authenticator, decrypt_user_password, encode_response,
    encrypt_user_password, generate_request_authenticator, verify_response_authenticator,
};
pub use eap::avp::{Avp, AvpFlags};
pub use eap::{EapCode, EapError, EapFlags, EapFrame, EapHeader, EapType, FragmentAssembler, FrameParams};
pub use message_auth::{
    calculate_message_authenticator, encode_with_message_authenticator,
    verify_message_authenticator, verify_packet_message_authenticator,
};
pub use mppe::MppeError;
pub use packet::{Code, Packet, PacketError};
