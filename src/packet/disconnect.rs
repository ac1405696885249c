/// MQTT DISCONNECT packet.
///
/// The broker writes one only when a freshly acknowledged session loses the
/// race to reach the connected state; clients send it for a clean close.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisconnectPacket;

impl DisconnectPacket {
    /// Creates a DISCONNECT packet.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}
