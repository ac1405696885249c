/// MQTT UNSUBACK packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsubAckPacket {
    /// Packet identifier echoed from the UNSUBSCRIBE
    pub packet_id: u16,
}

impl UnsubAckPacket {
    /// Creates an UNSUBACK packet.
    #[must_use]
    pub fn new(packet_id: u16) -> Self {
        Self { packet_id }
    }
}
