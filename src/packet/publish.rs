use crate::QoS;
use bytes::Bytes;

/// MQTT PUBLISH packet
///
/// The payload is a [`Bytes`] handle: cloning a `PublishPacket` shares the
/// underlying buffer, which is how the write path hands the transport an
/// owned duplicate while the in-flight store keeps the original alive.
#[derive(Debug, Clone)]
pub struct PublishPacket {
    /// Topic name
    pub topic_name: String,
    /// Packet identifier (required for QoS > 0)
    pub packet_id: Option<u16>,
    /// Message payload
    pub payload: Bytes,
    /// Quality of Service level
    pub qos: QoS,
    /// Retain flag
    pub retain: bool,
    /// Duplicate delivery flag
    pub dup: bool,
}

impl PublishPacket {
    /// Creates a new PUBLISH packet.
    #[must_use]
    pub fn new(topic_name: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic_name: topic_name.into(),
            packet_id: None,
            payload: payload.into(),
            qos,
            retain: false,
            dup: false,
        }
    }

    /// Sets the packet identifier; QoS 0 publishes never carry one.
    #[must_use]
    pub fn with_packet_id(mut self, id: u16) -> Self {
        if self.qos != QoS::AtMostOnce {
            self.packet_id = Some(id);
        }
        self
    }

    /// Sets the retain flag.
    #[must_use]
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Sets the duplicate flag.
    #[must_use]
    pub fn with_dup(mut self, dup: bool) -> Self {
        self.dup = dup;
        self
    }

    /// Returns a redelivery copy: DUP set, same packet id, shared payload.
    #[must_use]
    pub fn redelivery(&self) -> Self {
        let mut copy = self.clone();
        copy.dup = true;
        copy
    }
}
