//! Broker configuration
//!
//! Policy knobs consumed by the connection engine. Everything here is a
//! per-broker setting; per-connection state (keep alive, clean session)
//! arrives with the CONNECT packet instead.

use crate::error::{MqttError, Result};
use serde::{Deserialize, Serialize};

/// Broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Permit CONNECT without credentials
    pub allow_anonymous: bool,

    /// Permit an empty client identifier (implies clean session; the broker
    /// assigns a generated identifier)
    pub allow_zero_byte_client_id: bool,

    /// Flush the channel on every write instead of batching until the codec
    /// signals the end of a read batch
    pub immediate_buffer_flush: bool,

    /// Maximum number of publishes queued for an offline persistent session;
    /// the oldest entries are dropped first when the bound is hit
    pub max_queued_messages: usize,

    /// Depth of the per-connection delivery queue the routing fabric writes
    /// into
    pub outbound_channel_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            allow_anonymous: true,
            allow_zero_byte_client_id: true,
            immediate_buffer_flush: true,
            max_queued_messages: 1024,
            outbound_channel_capacity: 128,
        }
    }
}

impl BrokerConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Permits or forbids anonymous connections.
    #[must_use]
    pub fn with_allow_anonymous(mut self, allow: bool) -> Self {
        self.allow_anonymous = allow;
        self
    }

    /// Permits or forbids empty client identifiers.
    #[must_use]
    pub fn with_allow_zero_byte_client_id(mut self, allow: bool) -> Self {
        self.allow_zero_byte_client_id = allow;
        self
    }

    /// Selects flush-per-write or batched flushing.
    #[must_use]
    pub fn with_immediate_buffer_flush(mut self, immediate: bool) -> Self {
        self.immediate_buffer_flush = immediate;
        self
    }

    /// Sets the offline queue bound.
    #[must_use]
    pub fn with_max_queued_messages(mut self, max: usize) -> Self {
        self.max_queued_messages = max;
        self
    }

    /// Sets the delivery queue depth.
    #[must_use]
    pub fn with_outbound_channel_capacity(mut self, capacity: usize) -> Self {
        self.outbound_channel_capacity = capacity;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a queue bound is zero.
    pub fn validate(&self) -> Result<&Self> {
        if self.max_queued_messages == 0 {
            return Err(MqttError::InvalidState(
                "max_queued_messages must be at least 1".to_string(),
            ));
        }
        if self.outbound_channel_capacity == 0 {
            return Err(MqttError::InvalidState(
                "outbound_channel_capacity must be at least 1".to_string(),
            ));
        }
        Ok(self)
    }
}
