//! # MQTT Broker Connection Engine
//!
//! The per-connection protocol engine of an MQTT broker: everything between
//! a packet codec and the broker's publish/subscribe fabric for a single
//! client session.
//!
//! The engine terminates one client's session, drives the CONNECT/DISCONNECT
//! lifecycle, enforces the three QoS delivery guarantees in both directions,
//! couples flow control to channel writability and keep-alive timers, and
//! recovers will/session state on abrupt disconnect.
//!
//! Byte-level framing is deliberately below this crate: the codec hands the
//! engine typed [`Packet`] values through a [`broker::ConnectionEvent`]
//! stream and receives typed packets back through a [`broker::Channel`]
//! implementation.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mqtt_broker_core::broker::{
//!     AllowAllAuthenticator, BrokerConfig, Connection, ConnectionEvent,
//!     MessageRouter, SessionRegistry,
//! };
//! use mqtt_broker_core::test_utils::RecordingChannel;
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = BrokerConfig::default();
//!     let registry = Arc::new(SessionRegistry::new());
//!     let router = Arc::new(MessageRouter::new(registry.clone()));
//!
//!     // One connection task per accepted socket. The codec feeds `events`;
//!     // the channel is the codec's write half.
//!     let (events_tx, events_rx) = mpsc::channel::<ConnectionEvent>(64);
//!     let (channel, _probe) = RecordingChannel::new();
//!     let connection = Connection::new(
//!         channel,
//!         config,
//!         Arc::new(AllowAllAuthenticator),
//!         registry,
//!         router,
//!     );
//!     tokio::spawn(connection.run(events_rx));
//!     drop(events_tx);
//! }
//! ```

#![warn(clippy::pedantic)]

pub mod broker;
pub mod error;
pub mod packet;
pub mod packet_id;
pub mod test_utils;
pub mod types;
pub mod validation;

pub use broker::{
    AllowAllAuthenticator, Authenticator, BrokerConfig, Channel, Connection, ConnectionEvent,
    CreationMode, MessageRouter, PasswordFileAuthenticator, PostOffice, SessionRegistry,
};
pub use error::{MqttError, Result};
pub use packet::connack::ConnectReturnCode;
pub use packet::publish::PublishPacket;
pub use packet::{Packet, PacketType};
pub use types::WillMessage;
pub use validation::{
    is_valid_topic_filter, is_valid_topic_name, topic_matches_filter, validate_topic_filter,
    validate_topic_name,
};

/// MQTT Quality of Service levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl From<u8> for QoS {
    fn from(value: u8) -> Self {
        match value {
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtMostOnce, // Default to QoS 0 for invalid values (including 0)
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos as u8
    }
}

impl QoS {
    /// Returns the lower of two QoS levels.
    ///
    /// Outbound deliveries are capped at the QoS granted to the matching
    /// subscription.
    #[must_use]
    pub fn lower_of(self, other: QoS) -> QoS {
        if (self as u8) <= (other as u8) {
            self
        } else {
            other
        }
    }
}
