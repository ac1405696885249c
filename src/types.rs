//! Shared value types carried across the engine.

use crate::QoS;
use bytes::Bytes;

/// Will message published on the client's behalf when the broker detects an
/// abrupt disconnect.
///
/// # Examples
///
/// ```
/// use mqtt_broker_core::{QoS, WillMessage};
///
/// let will = WillMessage::new("status/offline", b"gone".as_slice())
///     .with_qos(QoS::AtLeastOnce)
///     .with_retain(true);
/// assert_eq!(will.topic, "status/offline");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WillMessage {
    /// Topic the will is published to
    pub topic: String,
    /// Will payload
    pub payload: Bytes,
    /// QoS the will is published with
    pub qos: QoS,
    /// Retain flag for the will publish
    pub retain: bool,
}

impl WillMessage {
    /// Creates a will message with QoS 0 and retain off.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    /// Sets the QoS the will is published with.
    #[must_use]
    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    /// Sets the retain flag.
    #[must_use]
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}
