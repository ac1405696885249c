//! Per-client session state.
//!
//! A [`Session`] outlives any single connection: persistent sessions park in
//! the registry between connections with their queues and in-flight maps
//! intact, and a reconnect replays them. All QoS bookkeeping for one client
//! lives here; the connection engine decides when to mutate it.

use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, trace, warn};

use crate::packet::pubrel::PubRelPacket;
use crate::packet::publish::PublishPacket;
use crate::packet::Packet;
use crate::types::WillMessage;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No live connection; persistent state parked
    Disconnected,
    /// A connection is binding but CONNACK follow-up has not finished
    Connecting,
    /// Bound to exactly one live connection
    Connected,
    /// Teardown in progress
    Disconnecting,
    /// Removed from the registry; must not be reused
    Destroyed,
}

/// Requests the routing fabric or the registry sends into a bound
/// connection's event loop.
#[derive(Debug)]
pub enum DeliveryRequest {
    /// Deliver an outbound publish to this client
    Publish(PublishPacket),
    /// A competing CONNECT is taking the client id over; tear down without
    /// firing the will and ack on `done`
    Takeover { done: oneshot::Sender<()> },
}

/// Sender half a connection binds into its session.
pub type DeliveryHandle = mpsc::Sender<DeliveryRequest>;

/// Outbound QoS 2 exchange phase.
///
/// The payload is only needed until PUBREC; after that the exchange is
/// identified by packet id alone.
#[derive(Debug, Clone)]
enum Qos2Outbound {
    Published(PublishPacket),
    PubRelSent,
}

/// Per-client session: QoS in-flight state, offline queue, will and the
/// binding to the live connection, if any.
#[derive(Debug)]
pub struct Session {
    client_id: String,
    clean: bool,
    max_queued: usize,
    state: RwLock<SessionState>,
    will: RwLock<Option<WillMessage>>,
    bound: RwLock<Option<DeliveryHandle>>,
    queued_while_offline: RwLock<VecDeque<PublishPacket>>,
    inflight_qos1: RwLock<HashMap<u16, PublishPacket>>,
    inflight_qos2: RwLock<HashMap<u16, Qos2Outbound>>,
    inbound_qos2_pending: RwLock<HashSet<u16>>,
}

impl Session {
    /// Creates a session in the `Connecting` state.
    ///
    /// Sessions are only created by the registry while a CONNECT is being
    /// processed, so they are born mid-handshake.
    #[must_use]
    pub fn new(
        client_id: impl Into<String>,
        clean: bool,
        will: Option<WillMessage>,
        max_queued: usize,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            clean,
            max_queued,
            state: RwLock::new(SessionState::Connecting),
            will: RwLock::new(will),
            bound: RwLock::new(None),
            queued_while_offline: RwLock::new(VecDeque::new()),
            inflight_qos1: RwLock::new(HashMap::new()),
            inflight_qos2: RwLock::new(HashMap::new()),
            inbound_qos2_pending: RwLock::new(HashSet::new()),
        }
    }

    /// Gets the client identifier.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Returns true for a clean session.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.clean
    }

    /// Returns the current lifecycle state.
    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    /// Returns true while bound to a live connection.
    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == SessionState::Connected
    }

    /// Moves a parked session back into `Connecting` for a reopen.
    ///
    /// Returns false if the session is not currently `Disconnected`; the
    /// registry treats that as a takeover that failed to reconcile.
    pub async fn mark_connecting(&self) -> bool {
        let mut state = self.state.write().await;
        if *state == SessionState::Disconnected {
            *state = SessionState::Connecting;
            true
        } else {
            false
        }
    }

    /// Binds the delivery handle of the connection being established.
    pub async fn bind(&self, handle: DeliveryHandle) {
        trace!("Binding connection to session {}", self.client_id);
        *self.bound.write().await = Some(handle);
    }

    /// Transitions `Connecting` → `Connected` once the CONNACK write has
    /// completed.
    ///
    /// Returns false when a competing binder won the race; the caller must
    /// then abandon the connection.
    pub async fn complete_connection(&self) -> bool {
        let mut state = self.state.write().await;
        if *state == SessionState::Connecting {
            *state = SessionState::Connected;
            true
        } else {
            false
        }
    }

    /// Unbinds the connection and parks the session in `Disconnected`.
    pub async fn disconnect(&self) {
        {
            let mut state = self.state.write().await;
            if *state == SessionState::Destroyed {
                return;
            }
            *state = SessionState::Disconnecting;
        }
        *self.bound.write().await = None;
        let mut state = self.state.write().await;
        if *state != SessionState::Destroyed {
            *state = SessionState::Disconnected;
        }
    }

    /// Marks the session unusable after registry removal.
    pub async fn destroy(&self) {
        *self.state.write().await = SessionState::Destroyed;
        *self.bound.write().await = None;
    }

    /// Replaces the will message.
    pub async fn set_will(&self, will: Option<WillMessage>) {
        *self.will.write().await = will;
    }

    /// Returns a copy of the will message, if any.
    pub async fn will(&self) -> Option<WillMessage> {
        self.will.read().await.clone()
    }

    /// Returns the bound delivery handle, if any.
    pub async fn bound_handle(&self) -> Option<DeliveryHandle> {
        self.bound.read().await.clone()
    }

    /// Hands an outbound publish to this session.
    ///
    /// Connected sessions receive it through the bound connection's delivery
    /// queue; a full queue drops the publish (transient backpressure, the
    /// same disposition an unwritable channel gets). Unbound sessions queue
    /// the publish for the next reconnect.
    pub async fn dispatch(&self, publish: PublishPacket) {
        let handle = self.bound.read().await.clone();
        match handle {
            Some(tx) => {
                use tokio::sync::mpsc::error::TrySendError;
                match tx.try_send(DeliveryRequest::Publish(publish)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!(
                            "Delivery queue full for {}, dropping publish",
                            self.client_id
                        );
                    }
                    Err(TrySendError::Closed(DeliveryRequest::Publish(publish))) => {
                        // Connection went away between routing and delivery
                        self.queue_offline(publish).await;
                    }
                    Err(TrySendError::Closed(_)) => {}
                }
            }
            None => self.queue_offline(publish).await,
        }
    }

    /// Queues a publish for redelivery on the next reconnect, dropping the
    /// oldest entry when the bound is hit.
    pub async fn queue_offline(&self, publish: PublishPacket) {
        let mut queue = self.queued_while_offline.write().await;
        if queue.len() >= self.max_queued {
            queue.pop_front();
            debug!(
                "Offline queue full for {}, dropping oldest publish",
                self.client_id
            );
        }
        queue.push_back(publish);
    }

    /// Takes every queued offline publish, preserving order.
    pub async fn drain_offline(&self) -> Vec<PublishPacket> {
        self.queued_while_offline.write().await.drain(..).collect()
    }

    /// Number of publishes currently queued for offline delivery.
    pub async fn queued_offline_len(&self) -> usize {
        self.queued_while_offline.read().await.len()
    }

    /// Records an inbound QoS 2 packet id.
    ///
    /// Returns true when the id is new; false means the PUBLISH is a
    /// duplicate that must not be routed again.
    pub async fn register_inbound_qos2(&self, packet_id: u16) -> bool {
        self.inbound_qos2_pending.write().await.insert(packet_id)
    }

    /// Clears an inbound QoS 2 packet id on PUBREL; returns whether it was
    /// pending.
    pub async fn complete_inbound_qos2(&self, packet_id: u16) -> bool {
        self.inbound_qos2_pending.write().await.remove(&packet_id)
    }

    /// Records an outbound QoS 1 publish awaiting PUBACK.
    pub async fn record_outbound_qos1(&self, packet_id: u16, publish: PublishPacket) {
        self.inflight_qos1.write().await.insert(packet_id, publish);
    }

    /// Removes an outbound QoS 1 entry on PUBACK; returns whether it existed.
    pub async fn ack_outbound_qos1(&self, packet_id: u16) -> bool {
        self.inflight_qos1.write().await.remove(&packet_id).is_some()
    }

    /// Records an outbound QoS 2 publish in the `Published` phase.
    pub async fn record_outbound_qos2(&self, packet_id: u16, publish: PublishPacket) {
        self.inflight_qos2
            .write()
            .await
            .insert(packet_id, Qos2Outbound::Published(publish));
    }

    /// Advances an outbound QoS 2 exchange to `PubRelSent` on PUBREC,
    /// discarding the payload. Returns whether the exchange was known.
    pub async fn pubrec_received(&self, packet_id: u16) -> bool {
        let mut inflight = self.inflight_qos2.write().await;
        match inflight.get_mut(&packet_id) {
            Some(phase) => {
                *phase = Qos2Outbound::PubRelSent;
                true
            }
            None => false,
        }
    }

    /// Completes an outbound QoS 2 exchange on PUBCOMP; returns whether it
    /// existed.
    pub async fn pubcomp_received(&self, packet_id: u16) -> bool {
        self.inflight_qos2.write().await.remove(&packet_id).is_some()
    }

    /// Number of in-flight outbound exchanges (QoS 1 and QoS 2 combined).
    pub async fn inflight_len(&self) -> usize {
        self.inflight_qos1.read().await.len() + self.inflight_qos2.read().await.len()
    }

    /// Packets to retransmit for every unacknowledged exchange: QoS 1 and
    /// QoS 2 `Published` entries as PUBLISH with DUP set, `PubRelSent`
    /// entries as PUBREL.
    pub async fn resend_candidates(&self) -> Vec<Packet> {
        let mut packets = Vec::new();

        for publish in self.inflight_qos1.read().await.values() {
            packets.push(Packet::Publish(publish.redelivery()));
        }

        for (packet_id, phase) in self.inflight_qos2.read().await.iter() {
            match phase {
                Qos2Outbound::Published(publish) => {
                    packets.push(Packet::Publish(publish.redelivery()));
                }
                Qos2Outbound::PubRelSent => {
                    packets.push(Packet::PubRel(PubRelPacket::new(*packet_id)));
                }
            }
        }

        packets
    }
}
