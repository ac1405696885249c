/// MQTT PUBCOMP packet: final leg of a QoS 2 exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubCompPacket {
    /// Packet identifier of the completed QoS 2 exchange
    pub packet_id: u16,
}

impl PubCompPacket {
    /// Creates a PUBCOMP for the given packet identifier.
    #[must_use]
    pub fn new(packet_id: u16) -> Self {
        Self { packet_id }
    }
}
