/// RADIUS attribute types used by an EAP authentication server.
///
/// Types are from RFC 2865 unless noted otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AttributeType {
    UserName = 1,
    UserPassword = 2,
    NasIpAddress = 4,
    NasPort = 5,
    ServiceType = 6,
    FramedProtocol = 7,
    ReplyMessage = 18,
    State = 24,
    Class = 25,
    VendorSpecific = 26,
    SessionTimeout = 27,
    CalledStationId = 30,
    CallingStationId = 31,
    NasIdentifier = 32,
    ProxyState = 33,
    NasPortType = 61,
    /// RFC 2868
    TunnelType = 64,
    /// RFC 2868
    TunnelMediumType = 65,
    /// RFC 3579
    EapMessage = 79,
    /// RFC 3579
    MessageAuthenticator = 80,
    /// RFC 2868
    TunnelPrivateGroupId = 81,
    FramedMtu = 12,
}

impl AttributeType {
    pub fn from_u8(value: u8) -> Option<Self> {
        use AttributeType::*;
        Some(match value {
            1 => UserName,
            2 => UserPassword,
            4 => NasIpAddress,
            5 => NasPort,
            6 => ServiceType,
            7 => FramedProtocol,
            12 => FramedMtu,
            18 => ReplyMessage,
            24 => State,
            25 => Class,
            26 => VendorSpecific,
            27 => SessionTimeout,
            30 => CalledStationId,
            31 => CallingStationId,
            32 => NasIdentifier,
            33 => ProxyState,
            61 => NasPortType,
            64 => TunnelType,
            65 => TunnelMediumType,
            79 => EapMessage,
            80 => MessageAuthenticator,
            81 => TunnelPrivateGroupId,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}
