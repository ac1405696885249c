/// CONNACK return codes, bit-exact with the MQTT 3.1.1 specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectReturnCode {
    /// Connection accepted
    Accepted = 0x00,
    /// The server does not support the requested protocol level
    UnacceptableProtocolVersion = 0x01,
    /// The client identifier is not allowed
    IdentifierRejected = 0x02,
    /// The service is unavailable
    ServerUnavailable = 0x03,
    /// The data in the username or password is malformed or wrong
    BadUsernameOrPassword = 0x04,
    /// The client is not authorized to connect
    NotAuthorized = 0x05,
}

impl ConnectReturnCode {
    /// Converts a wire byte to a return code.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Accepted),
            0x01 => Some(Self::UnacceptableProtocolVersion),
            0x02 => Some(Self::IdentifierRejected),
            0x03 => Some(Self::ServerUnavailable),
            0x04 => Some(Self::BadUsernameOrPassword),
            0x05 => Some(Self::NotAuthorized),
            _ => None,
        }
    }

    /// Returns true for the `Accepted` code.
    #[must_use]
    pub fn is_accepted(self) -> bool {
        self == Self::Accepted
    }
}

impl From<ConnectReturnCode> for u8 {
    fn from(code: ConnectReturnCode) -> Self {
        code as u8
    }
}

/// MQTT CONNACK packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAckPacket {
    /// Session present flag: set iff an existing non-clean session was reopened
    pub session_present: bool,
    /// Connect return code
    pub return_code: ConnectReturnCode,
}

impl ConnAckPacket {
    /// Creates a CONNACK packet.
    #[must_use]
    pub fn new(session_present: bool, return_code: ConnectReturnCode) -> Self {
        Self {
            session_present,
            return_code,
        }
    }

    /// Creates a rejection CONNACK; the session present flag is always clear.
    #[must_use]
    pub fn rejection(return_code: ConnectReturnCode) -> Self {
        Self {
            session_present: false,
            return_code,
        }
    }
}
