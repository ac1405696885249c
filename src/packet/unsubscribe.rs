/// MQTT UNSUBSCRIBE packet
#[derive(Debug, Clone)]
pub struct UnsubscribePacket {
    /// Packet identifier, echoed in the UNSUBACK
    pub packet_id: u16,
    /// Topic filters to remove
    pub topics: Vec<String>,
}

impl UnsubscribePacket {
    /// Creates an UNSUBSCRIBE packet.
    #[must_use]
    pub fn new(packet_id: u16, topics: Vec<String>) -> Self {
        Self { packet_id, topics }
    }
}
