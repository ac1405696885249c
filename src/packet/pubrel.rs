/// MQTT PUBREL packet: release leg of a QoS 2 exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubRelPacket {
    /// Packet identifier of the QoS 2 exchange
    pub packet_id: u16,
}

impl PubRelPacket {
    /// Creates a PUBREL for the given packet identifier.
    #[must_use]
    pub fn new(packet_id: u16) -> Self {
        Self { packet_id }
    }
}
