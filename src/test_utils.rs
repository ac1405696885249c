//! Test utilities for exercising the connection engine.
//!
//! These are compiled into the library so integration tests and downstream
//! codecs can drive a [`Connection`] without a real transport.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::broker::auth::Authenticator;
use crate::broker::channel::Channel;
use crate::broker::config::BrokerConfig;
use crate::broker::connection::{Connection, ConnectionEvent};
use crate::broker::post_office::PostOffice;
use crate::broker::registry::SessionRegistry;
use crate::broker::session::DeliveryHandle;
use crate::error::{MqttError, Result};
use crate::packet::connack::ConnAckPacket;
use crate::packet::publish::PublishPacket;
use crate::packet::suback::SubAckReturnCode;
use crate::packet::subscribe::TopicFilter;
use crate::packet::{Packet, PacketType};
use crate::types::WillMessage;

#[derive(Debug, Default)]
struct ChannelShared {
    written: Mutex<Vec<Packet>>,
    flushes: AtomicUsize,
    writable: AtomicBool,
    fail_writes: AtomicBool,
    closed: AtomicBool,
}

/// A [`Channel`] that records every packet instead of encoding it.
#[derive(Debug, Clone)]
pub struct RecordingChannel {
    shared: Arc<ChannelShared>,
}

/// Inspection/scripting handle paired with a [`RecordingChannel`].
#[derive(Debug, Clone)]
pub struct ChannelProbe {
    shared: Arc<ChannelShared>,
}

impl RecordingChannel {
    /// Creates a writable channel and its probe.
    #[must_use]
    pub fn new() -> (Self, ChannelProbe) {
        let shared = Arc::new(ChannelShared {
            writable: AtomicBool::new(true),
            ..ChannelShared::default()
        });
        (
            Self {
                shared: shared.clone(),
            },
            ChannelProbe { shared },
        )
    }
}

impl Channel for RecordingChannel {
    fn is_writable(&self) -> bool {
        self.shared.writable.load(Ordering::SeqCst)
    }

    async fn write(&mut self, packet: Packet) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(MqttError::ChannelClosed);
        }
        if self.shared.fail_writes.load(Ordering::SeqCst) {
            return Err(MqttError::ConnectionError("scripted write failure".to_string()));
        }
        self.shared.written.lock().unwrap().push(packet);
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(MqttError::ChannelClosed);
        }
        self.shared.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.shared.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl ChannelProbe {
    /// Every packet written so far, in order.
    #[must_use]
    pub fn written(&self) -> Vec<Packet> {
        self.shared.written.lock().unwrap().clone()
    }

    /// Packets written so far of one type, in order.
    #[must_use]
    pub fn written_of(&self, packet_type: PacketType) -> Vec<Packet> {
        self.written()
            .into_iter()
            .filter(|p| p.packet_type() == packet_type)
            .collect()
    }

    /// Drops the recorded packets.
    pub fn clear(&self) {
        self.shared.written.lock().unwrap().clear();
    }

    /// Number of flush calls.
    #[must_use]
    pub fn flush_count(&self) -> usize {
        self.shared.flushes.load(Ordering::SeqCst)
    }

    /// Scripts transport writability.
    pub fn set_writable(&self, writable: bool) {
        self.shared.writable.store(writable, Ordering::SeqCst);
    }

    /// Scripts write failures.
    pub fn fail_writes(&self, fail: bool) {
        self.shared.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Whether the channel has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// The single CONNACK written, if exactly one exists.
    #[must_use]
    pub fn connack(&self) -> Option<ConnAckPacket> {
        let connacks: Vec<_> = self
            .written()
            .into_iter()
            .filter_map(|p| match p {
                Packet::ConnAck(connack) => Some(connack),
                _ => None,
            })
            .collect();
        match connacks.as_slice() {
            [connack] => Some(*connack),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct PostOfficeShared {
    routed: Mutex<Vec<(String, PublishPacket)>>,
    subscriptions: Mutex<Vec<(String, TopicFilter)>>,
    unsubscriptions: Mutex<Vec<(String, String)>>,
    fired_wills: Mutex<Vec<WillMessage>>,
    established: Mutex<Vec<String>>,
    disconnected: Mutex<Vec<String>>,
    lost: Mutex<Vec<String>>,
    fail_route: AtomicBool,
}

/// A [`PostOffice`] that records every interaction.
#[derive(Debug, Clone, Default)]
pub struct RecordingPostOffice {
    shared: Arc<PostOfficeShared>,
}

impl RecordingPostOffice {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes routed so far as `(sender client id, publish)` pairs.
    #[must_use]
    pub fn routed(&self) -> Vec<(String, PublishPacket)> {
        self.shared.routed.lock().unwrap().clone()
    }

    /// Wills fired so far.
    #[must_use]
    pub fn fired_wills(&self) -> Vec<WillMessage> {
        self.shared.fired_wills.lock().unwrap().clone()
    }

    /// Subscriptions registered so far.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<(String, TopicFilter)> {
        self.shared.subscriptions.lock().unwrap().clone()
    }

    /// Client ids whose handshakes completed.
    #[must_use]
    pub fn established(&self) -> Vec<String> {
        self.shared.established.lock().unwrap().clone()
    }

    /// Client ids that disconnected cleanly.
    #[must_use]
    pub fn disconnected(&self) -> Vec<String> {
        self.shared.disconnected.lock().unwrap().clone()
    }

    /// Client ids whose connections were lost.
    #[must_use]
    pub fn lost(&self) -> Vec<String> {
        self.shared.lost.lock().unwrap().clone()
    }

    /// Makes `route` fail, as a broken fabric would.
    pub fn fail_route(&self, fail: bool) {
        self.shared.fail_route.store(fail, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl PostOffice for RecordingPostOffice {
    async fn subscribe(
        &self,
        client_id: &str,
        _username: Option<&str>,
        filters: &[TopicFilter],
    ) -> Vec<SubAckReturnCode> {
        let mut recorded = self.shared.subscriptions.lock().unwrap();
        filters
            .iter()
            .map(|filter| {
                recorded.push((client_id.to_string(), filter.clone()));
                SubAckReturnCode::from_qos(filter.qos)
            })
            .collect()
    }

    async fn unsubscribe(&self, client_id: &str, topics: &[String]) {
        let mut recorded = self.shared.unsubscriptions.lock().unwrap();
        for topic in topics {
            recorded.push((client_id.to_string(), topic.clone()));
        }
    }

    async fn route(
        &self,
        publish: &PublishPacket,
        sender_client_id: &str,
        _username: Option<&str>,
    ) -> Result<()> {
        if self.shared.fail_route.load(Ordering::SeqCst) {
            return Err(MqttError::ConnectionError(
                "scripted routing failure".to_string(),
            ));
        }
        self.shared
            .routed
            .lock()
            .unwrap()
            .push((sender_client_id.to_string(), publish.clone()));
        Ok(())
    }

    async fn fire_will(&self, will: &WillMessage) {
        self.shared.fired_wills.lock().unwrap().push(will.clone());
    }

    async fn connection_established(&self, client_id: &str, _username: Option<&str>) {
        self.shared
            .established
            .lock()
            .unwrap()
            .push(client_id.to_string());
    }

    async fn client_disconnected(&self, client_id: &str, _username: Option<&str>) {
        self.shared
            .disconnected
            .lock()
            .unwrap()
            .push(client_id.to_string());
    }

    async fn connection_lost(&self, client_id: &str, _username: Option<&str>) {
        self.shared.lost.lock().unwrap().push(client_id.to_string());
    }
}

/// A spawned connection under test.
pub struct ConnectionHarness {
    /// Codec-side event sender; drop it to simulate transport loss
    pub events: mpsc::Sender<ConnectionEvent>,
    /// Probe for the recording channel
    pub probe: ChannelProbe,
    /// Fabric-side delivery handle
    pub delivery: DeliveryHandle,
    /// Join handle of the connection task
    pub task: tokio::task::JoinHandle<()>,
}

impl ConnectionHarness {
    /// Sends one packet as the codec would.
    ///
    /// # Panics
    ///
    /// Panics if the connection task is gone.
    pub async fn send(&self, packet: Packet) {
        self.events
            .send(ConnectionEvent::Packet(packet))
            .await
            .expect("connection task alive");
    }
}

/// Spawns a connection wired to a recording channel.
pub fn spawn_connection(
    config: BrokerConfig,
    authenticator: Arc<dyn Authenticator>,
    registry: Arc<SessionRegistry>,
    post_office: Arc<dyn PostOffice>,
) -> ConnectionHarness {
    let (events_tx, events_rx) = mpsc::channel(64);
    let (channel, probe) = RecordingChannel::new();
    let connection = Connection::new(channel, config, authenticator, registry, post_office);
    let delivery = connection.delivery_handle();
    let task = tokio::spawn(connection.run(events_rx));
    ConnectionHarness {
        events: events_tx,
        probe,
        delivery,
        task,
    }
}

/// Lets the connection task drain everything already queued.
pub async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}
