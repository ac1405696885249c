/// MQTT PUBACK packet: acknowledges a QoS 1 PUBLISH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubAckPacket {
    /// Packet identifier of the acknowledged PUBLISH
    pub packet_id: u16,
}

impl PubAckPacket {
    /// Creates a PUBACK for the given packet identifier.
    #[must_use]
    pub fn new(packet_id: u16) -> Self {
        Self { packet_id }
    }
}
