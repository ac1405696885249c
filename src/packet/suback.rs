use crate::QoS;

/// SUBACK return codes: the granted QoS per filter, or failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubAckReturnCode {
    /// Success, maximum QoS 0
    GrantedQoS0 = 0x00,
    /// Success, maximum QoS 1
    GrantedQoS1 = 0x01,
    /// Success, maximum QoS 2
    GrantedQoS2 = 0x02,
    /// Subscription refused
    Failure = 0x80,
}

impl SubAckReturnCode {
    /// Creates a return code from a granted QoS level.
    #[must_use]
    pub fn from_qos(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => Self::GrantedQoS0,
            QoS::AtLeastOnce => Self::GrantedQoS1,
            QoS::ExactlyOnce => Self::GrantedQoS2,
        }
    }

    /// Returns true unless this is the failure code.
    #[must_use]
    pub fn is_success(self) -> bool {
        self != Self::Failure
    }
}

impl From<SubAckReturnCode> for u8 {
    fn from(code: SubAckReturnCode) -> Self {
        code as u8
    }
}

/// MQTT SUBACK packet
#[derive(Debug, Clone)]
pub struct SubAckPacket {
    /// Packet identifier echoed from the SUBSCRIBE
    pub packet_id: u16,
    /// One return code per requested filter, in order
    pub return_codes: Vec<SubAckReturnCode>,
}

impl SubAckPacket {
    /// Creates a SUBACK packet.
    #[must_use]
    pub fn new(packet_id: u16, return_codes: Vec<SubAckReturnCode>) -> Self {
        Self {
            packet_id,
            return_codes,
        }
    }
}
