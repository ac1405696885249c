//! Outbound write half of a connection.

use crate::error::Result;
use crate::packet::Packet;
use std::future::Future;

/// The write half the codec exposes to the engine.
///
/// The engine layers its write policy on top of these primitives: outbound
/// packets are dropped while the channel is unwritable, and `flush` is
/// called per write or per read batch depending on
/// [`BrokerConfig::immediate_buffer_flush`](crate::BrokerConfig).
///
/// Writes are asynchronous; completion of the returned future means the
/// packet reached the transport, not the peer. A failed write is fatal for
/// the connection.
pub trait Channel: Send {
    /// Returns whether the transport currently accepts writes.
    fn is_writable(&self) -> bool;

    /// Queues a packet on the transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport has failed or is closed.
    fn write(&mut self, packet: Packet) -> impl Future<Output = Result<()>> + Send + '_;

    /// Flushes queued writes to the peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport has failed or is closed.
    fn flush(&mut self) -> impl Future<Output = Result<()>> + Send + '_;

    /// Closes the transport. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot be closed cleanly.
    fn close(&mut self) -> impl Future<Output = Result<()>> + Send + '_;
}
