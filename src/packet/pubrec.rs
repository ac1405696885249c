/// MQTT PUBREC packet: first acknowledgment leg of a QoS 2 PUBLISH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubRecPacket {
    /// Packet identifier of the received PUBLISH
    pub packet_id: u16,
}

impl PubRecPacket {
    /// Creates a PUBREC for the given packet identifier.
    #[must_use]
    pub fn new(packet_id: u16) -> Self {
        Self { packet_id }
    }
}
