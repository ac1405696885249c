//! The per-connection protocol engine.
//!
//! One [`Connection`] task runs per accepted transport. The codec feeds it
//! typed packets through a [`ConnectionEvent`] stream and the routing fabric
//! reaches it through the delivery handle bound into its session. Everything
//! that mutates the connection or its session's in-flight maps happens on
//! this task.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::broker::auth::Authenticator;
use crate::broker::channel::Channel;
use crate::broker::config::BrokerConfig;
use crate::broker::post_office::PostOffice;
use crate::broker::registry::{CreationMode, SessionRegistry};
use crate::broker::session::{DeliveryHandle, DeliveryRequest, Session};
use crate::error::{MqttError, Result};
use crate::packet::connack::{ConnAckPacket, ConnectReturnCode};
use crate::packet::connect::{
    ConnectPacket, PROTOCOL_LEVEL_V31, PROTOCOL_LEVEL_V311, PROTOCOL_LEVEL_V5,
};
use crate::packet::disconnect::DisconnectPacket;
use crate::packet::puback::PubAckPacket;
use crate::packet::pubcomp::PubCompPacket;
use crate::packet::publish::PublishPacket;
use crate::packet::pubrec::PubRecPacket;
use crate::packet::pubrel::PubRelPacket;
use crate::packet::suback::SubAckPacket;
use crate::packet::subscribe::SubscribePacket;
use crate::packet::unsuback::UnsubAckPacket;
use crate::packet::unsubscribe::UnsubscribePacket;
use crate::packet::Packet;
use crate::packet_id::PacketIdCounter;
use crate::validation::is_valid_topic_name;
use crate::QoS;

/// Period between retransmission passes over unacknowledged packets.
const RESEND_PERIOD: Duration = Duration::from_secs(5);

/// Inbound surface of a connection: what the codec reports to the engine.
///
/// Dropping the sender is how the codec signals transport loss.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A complete control packet arrived
    Packet(Packet),
    /// The codec finished a read batch; deferred writes may be flushed
    ReadCompleted,
    /// The transport's writability changed
    WritabilityChanged,
}

/// Per-socket protocol state machine.
pub struct Connection<C: Channel> {
    channel: C,
    config: BrokerConfig,
    authenticator: Arc<dyn Authenticator>,
    registry: Arc<SessionRegistry>,
    post_office: Arc<dyn PostOffice>,
    connected: bool,
    packet_ids: PacketIdCounter,
    session: Option<Arc<Session>>,
    client_id: Option<String>,
    username: Option<String>,
    delivery_tx: DeliveryHandle,
    delivery_rx: Option<mpsc::Receiver<DeliveryRequest>>,
    keep_alive_idle: Option<Duration>,
    last_read: Instant,
    closing: bool,
    suppress_lost: bool,
    lost_dispatched: bool,
}

impl<C: Channel> Connection<C> {
    /// Creates the engine for one accepted transport.
    #[must_use]
    pub fn new(
        channel: C,
        config: BrokerConfig,
        authenticator: Arc<dyn Authenticator>,
        registry: Arc<SessionRegistry>,
        post_office: Arc<dyn PostOffice>,
    ) -> Self {
        let (delivery_tx, delivery_rx) = mpsc::channel(config.outbound_channel_capacity.max(1));
        Self {
            channel,
            config,
            authenticator,
            registry,
            post_office,
            connected: false,
            packet_ids: PacketIdCounter::new(),
            session: None,
            client_id: None,
            username: None,
            delivery_tx,
            delivery_rx: Some(delivery_rx),
            keep_alive_idle: None,
            last_read: Instant::now(),
            closing: false,
            suppress_lost: false,
            lost_dispatched: false,
        }
    }

    /// Returns true after a successful CONNECT handshake.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// The client id negotiated by the handshake, if any.
    #[must_use]
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// A handle for injecting delivery requests, as the routing fabric does
    /// through the bound session.
    #[must_use]
    pub fn delivery_handle(&self) -> DeliveryHandle {
        self.delivery_tx.clone()
    }

    /// Drives the connection until the transport closes, a fatal protocol
    /// error occurs, the client disconnects, the keep-alive timer expires or
    /// a takeover claims the client id.
    pub async fn run(mut self, mut events: mpsc::Receiver<ConnectionEvent>) {
        let mut delivery_rx = self.delivery_rx.take().expect("run may only be called once");
        let mut resender = None;
        self.last_read = Instant::now();

        while !self.closing {
            if self.connected && resender.is_none() {
                let mut interval = time::interval_at(Instant::now() + RESEND_PERIOD, RESEND_PERIOD);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                resender = Some(interval);
            }
            let keep_alive_deadline = self.keep_alive_idle.map(|idle| self.last_read + idle);
            let resend_enabled = resender.is_some();

            let outcome = tokio::select! {
                event = events.recv() => match event {
                    Some(ConnectionEvent::Packet(packet)) => {
                        self.last_read = Instant::now();
                        self.handle_packet(packet).await
                    }
                    Some(ConnectionEvent::ReadCompleted) => self.read_completed().await,
                    Some(ConnectionEvent::WritabilityChanged) => self.writability_changed().await,
                    None => {
                        trace!("Transport closed for {:?}", self.client_id);
                        self.closing = true;
                        Ok(())
                    }
                },
                request = delivery_rx.recv() => match request {
                    Some(DeliveryRequest::Publish(publish)) => self.send_publish(publish).await,
                    Some(DeliveryRequest::Takeover { done }) => {
                        self.handle_takeover().await;
                        let _ = done.send(());
                        self.closing = true;
                        Ok(())
                    }
                    None => {
                        self.closing = true;
                        Ok(())
                    }
                },
                _ = async { resender.as_mut().expect("resender installed").tick().await },
                    if resend_enabled =>
                {
                    self.resend_inflight_not_acked().await
                }
                () = time::sleep_until(
                    keep_alive_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(60)),
                ), if keep_alive_deadline.is_some() => {
                    info!(
                        "Keep-alive expired with no inbound reads, client id: {:?}",
                        self.client_id
                    );
                    self.closing = true;
                    Ok(())
                }
            };

            if let Err(e) = outcome {
                error!("Fatal connection error for {:?}: {e}", self.client_id);
                break;
            }
        }

        if !self.suppress_lost {
            self.handle_connection_lost().await;
        }
        if let Err(e) = self.channel.close().await {
            debug!("Error closing channel: {e}");
        }
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<()> {
        let packet_type = packet.packet_type();
        debug!("Received MQTT packet, type: {packet_type:?}");

        if !self.connected {
            return match packet {
                Packet::Connect(connect) => self.process_connect(*connect).await,
                _ => {
                    warn!("{packet_type:?} received before CONNECT, closing channel");
                    Err(MqttError::ProtocolError(format!(
                        "{packet_type:?} before CONNECT"
                    )))
                }
            };
        }

        match packet {
            Packet::Connect(_) => {
                warn!("Second CONNECT on an established connection, closing channel");
                Err(MqttError::ProtocolError("duplicate CONNECT".to_string()))
            }
            Packet::Publish(publish) => self.process_publish(publish).await,
            Packet::PubAck(ack) => self.process_pub_ack(ack).await,
            Packet::PubRec(rec) => self.process_pub_rec(rec).await,
            Packet::PubRel(rel) => self.process_pub_rel(rel).await,
            Packet::PubComp(comp) => self.process_pub_comp(comp).await,
            Packet::Subscribe(subscribe) => self.process_subscribe(subscribe).await,
            Packet::Unsubscribe(unsubscribe) => self.process_unsubscribe(unsubscribe).await,
            Packet::PingReq => self.write_and_flush(Packet::PingResp).await,
            Packet::Disconnect(_) => self.process_disconnect().await,
            Packet::ConnAck(_) | Packet::SubAck(_) | Packet::UnsubAck(_) | Packet::PingResp => {
                error!("Unexpected packet type from client: {packet_type:?}");
                Ok(())
            }
        }
    }

    async fn process_connect(&mut self, connect: ConnectPacket) -> Result<()> {
        let mut client_id = connect.client_id.clone();
        let username = connect.username.clone();
        trace!("Processing CONNECT, client id: {client_id}, username: {username:?}");

        if !matches!(
            connect.protocol_level,
            PROTOCOL_LEVEL_V31 | PROTOCOL_LEVEL_V311 | PROTOCOL_LEVEL_V5
        ) {
            warn!(
                "MQTT protocol level {} is not valid, client id: {client_id}",
                connect.protocol_level
            );
            return self
                .abort_connection(ConnectReturnCode::UnacceptableProtocolVersion)
                .await;
        }

        if client_id.is_empty() {
            if !self.config.allow_zero_byte_client_id {
                info!("Broker doesn't permit empty client ids, username: {username:?}");
                return self
                    .abort_connection(ConnectReturnCode::IdentifierRejected)
                    .await;
            }
            if !connect.clean_session {
                info!("Empty client id is not allowed for a persistent session, username: {username:?}");
                return self
                    .abort_connection(ConnectReturnCode::IdentifierRejected)
                    .await;
            }
            client_id = Uuid::new_v4().simple().to_string();
            debug!("Generated client id {client_id}, username: {username:?}");
        }

        if !self.login(&connect, &client_id).await {
            return self
                .abort_connection(ConnectReturnCode::BadUsernameOrPassword)
                .await;
        }

        let result = match self.registry.create_or_reopen(&connect, &client_id).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Session for client id {client_id} cannot be created: {e}");
                return self
                    .abort_connection(ConnectReturnCode::ServerUnavailable)
                    .await;
            }
        };
        trace!("Binding connection to session");
        result.session.bind(self.delivery_tx.clone()).await;
        self.session = Some(result.session.clone());

        let session_present = !connect.clean_session && result.already_stored;
        let connack = ConnAckPacket::new(session_present, ConnectReturnCode::Accepted);
        if let Err(e) = self.write_and_flush(Packet::ConnAck(connack)).await {
            error!("CONNACK send failed, cleaning up session and closing: {e}");
            result.session.disconnect().await;
            self.registry.remove(&result.session).await;
            self.closing = true;
            return Ok(());
        }
        trace!("CONNACK sent, client id: {client_id}");

        if !result.session.complete_connection().await {
            warn!("CONNACK sent but the session can't transition to the connected state");
            let _ = self
                .write_and_flush(Packet::Disconnect(DisconnectPacket::new()))
                .await;
            self.closing = true;
            return Ok(());
        }

        self.client_id = Some(client_id.clone());
        self.username = username;
        self.connected = true;

        if result.mode == CreationMode::ReopenedExisting {
            self.send_queued_messages_while_offline().await?;
            self.resend_inflight_not_acked().await?;
        }

        self.initialize_keep_alive(connect.keep_alive);
        self.post_office
            .connection_established(&client_id, self.username.as_deref())
            .await;
        debug!("Connection established, client id: {client_id}");
        Ok(())
    }

    async fn login(&self, connect: &ConnectPacket, client_id: &str) -> bool {
        if let Some(username) = &connect.username {
            let password: &[u8] = match &connect.password {
                Some(password) => password,
                None => {
                    if !self.config.allow_anonymous {
                        info!("Client didn't supply a password and anonymous mode is disabled, client id: {client_id}");
                        return false;
                    }
                    &[]
                }
            };
            if !self
                .authenticator
                .check_valid(client_id, username, password)
                .await
            {
                info!("Authenticator rejected the credentials, client id: {client_id}, username: {username}");
                return false;
            }
            true
        } else if !self.config.allow_anonymous {
            info!("Client didn't supply credentials and anonymous mode is disabled, client id: {client_id}");
            false
        } else {
            true
        }
    }

    /// Writes a rejection CONNACK and schedules the channel for closure.
    async fn abort_connection(&mut self, return_code: ConnectReturnCode) -> Result<()> {
        let connack = ConnAckPacket::rejection(return_code);
        if let Err(e) = self.write_and_flush(Packet::ConnAck(connack)).await {
            debug!("Failed to write rejection CONNACK: {e}");
        }
        self.closing = true;
        Ok(())
    }

    fn initialize_keep_alive(&mut self, keep_alive: u16) {
        if keep_alive == 0 {
            self.keep_alive_idle = None;
            debug!("Keep-alive disabled, client id: {:?}", self.client_id);
            return;
        }
        // Idle budget is 1.5x the negotiated keep-alive, rounded up
        let idle_secs = (u64::from(keep_alive) * 3).div_ceil(2);
        self.keep_alive_idle = Some(Duration::from_secs(idle_secs));
        debug!(
            "Connection configured, client id: {:?}, keepAlive={keep_alive}s, idle={idle_secs}s",
            self.client_id
        );
    }

    async fn process_publish(&mut self, publish: PublishPacket) -> Result<()> {
        trace!(
            "Processing PUBLISH, topic: {}, packet id: {:?}, qos: {:?}",
            publish.topic_name,
            publish.packet_id,
            publish.qos
        );

        if !is_valid_topic_name(&publish.topic_name) {
            debug!("Dropping connection because of invalid topic format");
            self.drop_connection();
            return Ok(());
        }

        let client_id = self.client_id.clone().unwrap_or_default();
        let username = self.username.clone();

        match publish.qos {
            QoS::AtMostOnce => {
                self.post_office
                    .route(&publish, &client_id, username.as_deref())
                    .await?;
            }
            QoS::AtLeastOnce => {
                let Some(packet_id) = publish.packet_id else {
                    return Err(MqttError::ProtocolError(
                        "QoS 1 PUBLISH without a packet id".to_string(),
                    ));
                };
                self.post_office
                    .route(&publish, &client_id, username.as_deref())
                    .await?;
                // Ack only after the fabric accepted the publish
                self.send_pub_ack(packet_id).await?;
            }
            QoS::ExactlyOnce => {
                let Some(packet_id) = publish.packet_id else {
                    return Err(MqttError::ProtocolError(
                        "QoS 2 PUBLISH without a packet id".to_string(),
                    ));
                };
                let session = self.bound_session()?;
                if session.register_inbound_qos2(packet_id).await {
                    self.post_office
                        .route(&publish, &client_id, username.as_deref())
                        .await?;
                } else {
                    trace!("Duplicate QoS 2 PUBLISH {packet_id}, re-sending PUBREC only");
                }
                self.send_pub_rec(packet_id).await?;
            }
        }
        Ok(())
    }

    async fn process_pub_ack(&mut self, ack: PubAckPacket) -> Result<()> {
        let session = self.bound_session()?;
        if !session.ack_outbound_qos1(ack.packet_id).await {
            debug!("PUBACK for unknown packet id {}", ack.packet_id);
        }
        Ok(())
    }

    async fn process_pub_rec(&mut self, rec: PubRecPacket) -> Result<()> {
        let session = self.bound_session()?;
        if session.pubrec_received(rec.packet_id).await {
            self.send_if_writable_else_drop(Packet::PubRel(PubRelPacket::new(rec.packet_id)))
                .await?;
        } else {
            debug!("PUBREC for unknown packet id {}", rec.packet_id);
        }
        Ok(())
    }

    async fn process_pub_rel(&mut self, rel: PubRelPacket) -> Result<()> {
        let session = self.bound_session()?;
        session.complete_inbound_qos2(rel.packet_id).await;
        // PUBCOMP is idempotent: unknown ids get one too
        self.send_pub_comp(rel.packet_id).await
    }

    async fn process_pub_comp(&mut self, comp: PubCompPacket) -> Result<()> {
        let session = self.bound_session()?;
        if !session.pubcomp_received(comp.packet_id).await {
            debug!("PUBCOMP for unknown packet id {}", comp.packet_id);
        }
        Ok(())
    }

    async fn process_subscribe(&mut self, subscribe: SubscribePacket) -> Result<()> {
        let client_id = self.client_id.clone().unwrap_or_default();
        let username = self.username.clone();
        let return_codes = self
            .post_office
            .subscribe(&client_id, username.as_deref(), &subscribe.filters)
            .await;

        trace!("Sending SUBACK, packet id: {}", subscribe.packet_id);
        self.write_and_flush(Packet::SubAck(SubAckPacket::new(
            subscribe.packet_id,
            return_codes,
        )))
        .await
    }

    async fn process_unsubscribe(&mut self, unsubscribe: UnsubscribePacket) -> Result<()> {
        let client_id = self.client_id.clone().unwrap_or_default();
        trace!(
            "Processing UNSUBSCRIBE, topics: {:?}",
            unsubscribe.topics
        );
        self.post_office
            .unsubscribe(&client_id, &unsubscribe.topics)
            .await;

        trace!("Sending UNSUBACK, packet id: {}", unsubscribe.packet_id);
        self.write_and_flush(Packet::UnsubAck(UnsubAckPacket::new(unsubscribe.packet_id)))
            .await
    }

    async fn process_disconnect(&mut self) -> Result<()> {
        trace!("Start DISCONNECT");
        let session = self.bound_session()?;
        // A clean disconnect discards the will
        session.set_will(None).await;
        session.disconnect().await;
        if session.is_clean() {
            self.registry.remove(&session).await;
        }
        self.connected = false;
        self.suppress_lost = true;
        self.closing = true;

        let client_id = self.client_id.clone().unwrap_or_default();
        self.post_office
            .client_disconnected(&client_id, self.username.as_deref())
            .await;
        trace!("Processed DISCONNECT, client id: {client_id}");
        Ok(())
    }

    /// Delivers an outbound publish, allocating a packet id and recording
    /// in-flight state as its QoS demands.
    async fn send_publish(&mut self, mut publish: PublishPacket) -> Result<()> {
        if !self.connected {
            // A delivery raced the teardown; keep QoS > 0 for the reconnect
            if publish.qos != QoS::AtMostOnce {
                if let Some(session) = &self.session {
                    session.queue_offline(publish).await;
                }
            }
            return Ok(());
        }
        let session = self.bound_session()?;

        match publish.qos {
            QoS::AtMostOnce => {
                publish.packet_id = None;
                self.send_if_writable_else_drop(Packet::Publish(publish)).await
            }
            QoS::AtLeastOnce => {
                let packet_id = self.packet_ids.next();
                publish.packet_id = Some(packet_id);
                session.record_outbound_qos1(packet_id, publish.clone()).await;
                trace!(
                    "Sending PUBLISH(AtLeastOnce), packet id: {packet_id}, topic: {}",
                    publish.topic_name
                );
                self.send_if_writable_else_drop(Packet::Publish(publish)).await
            }
            QoS::ExactlyOnce => {
                let packet_id = self.packet_ids.next();
                publish.packet_id = Some(packet_id);
                session.record_outbound_qos2(packet_id, publish.clone()).await;
                trace!(
                    "Sending PUBLISH(ExactlyOnce), packet id: {packet_id}, topic: {}",
                    publish.topic_name
                );
                self.send_if_writable_else_drop(Packet::Publish(publish)).await
            }
        }
    }

    async fn send_pub_ack(&mut self, packet_id: u16) -> Result<()> {
        trace!("Sending PUBACK, packet id: {packet_id}");
        self.send_if_writable_else_drop(Packet::PubAck(PubAckPacket::new(packet_id)))
            .await
    }

    async fn send_pub_rec(&mut self, packet_id: u16) -> Result<()> {
        trace!("Sending PUBREC, packet id: {packet_id}");
        self.send_if_writable_else_drop(Packet::PubRec(PubRecPacket::new(packet_id)))
            .await
    }

    async fn send_pub_comp(&mut self, packet_id: u16) -> Result<()> {
        trace!("Sending PUBCOMP, packet id: {packet_id}");
        self.send_if_writable_else_drop(Packet::PubComp(PubCompPacket::new(packet_id)))
            .await
    }

    /// Applies the outbound write policy: drop while the channel is
    /// unwritable, flush per write only when configured to.
    async fn send_if_writable_else_drop(&mut self, packet: Packet) -> Result<()> {
        if !self.channel.is_writable() {
            debug!(
                "Channel not writable, dropping outbound {:?}",
                packet.packet_type()
            );
            return Ok(());
        }
        self.channel.write(packet).await?;
        if self.config.immediate_buffer_flush {
            self.channel.flush().await?;
        }
        Ok(())
    }

    async fn write_and_flush(&mut self, packet: Packet) -> Result<()> {
        self.channel.write(packet).await?;
        self.channel.flush().await
    }

    /// Re-sends every unacknowledged in-flight exchange.
    async fn resend_inflight_not_acked(&mut self) -> Result<()> {
        let Some(session) = self.session.clone() else {
            return Ok(());
        };
        let packets = session.resend_candidates().await;
        if packets.is_empty() {
            return Ok(());
        }
        debug!(
            "Resending {} unacknowledged packets, client id: {:?}",
            packets.len(),
            self.client_id
        );
        for packet in packets {
            self.send_if_writable_else_drop(packet).await?;
        }
        if !self.config.immediate_buffer_flush {
            self.channel.flush().await?;
        }
        Ok(())
    }

    /// Drains the offline queue through the regular outbound path.
    async fn send_queued_messages_while_offline(&mut self) -> Result<()> {
        let Some(session) = self.session.clone() else {
            return Ok(());
        };
        let queued = session.drain_offline().await;
        if queued.is_empty() {
            return Ok(());
        }
        debug!(
            "Sending {} publishes queued while offline, client id: {:?}",
            queued.len(),
            self.client_id
        );
        for publish in queued {
            self.send_publish(publish).await?;
        }
        Ok(())
    }

    /// Batched-flush hook: the codec finished a read batch.
    async fn read_completed(&mut self) -> Result<()> {
        debug!("Read batch completed, client id: {:?}", self.client_id);
        if self.connected {
            self.send_queued_messages_while_offline().await?;
        }
        self.channel.flush().await
    }

    async fn writability_changed(&mut self) -> Result<()> {
        if self.channel.is_writable() {
            debug!("Channel is again writable");
            if self.connected {
                self.send_queued_messages_while_offline().await?;
                self.resend_inflight_not_acked().await?;
            }
        }
        Ok(())
    }

    /// Requests closure of the channel without writing anything further.
    fn drop_connection(&mut self) {
        self.closing = true;
    }

    /// A competing CONNECT claimed this client id: unbind without firing the
    /// will and without touching the registry entry, which the new binder
    /// owns.
    async fn handle_takeover(&mut self) {
        debug!(
            "Connection taken over by a new CONNECT, client id: {:?}",
            self.client_id
        );
        if let Some(session) = self.session.clone() {
            session.disconnect().await;
        }
        self.connected = false;
        self.suppress_lost = true;
        if let Some(client_id) = self.client_id.clone() {
            self.post_office
                .connection_lost(&client_id, self.username.as_deref())
                .await;
        }
    }

    /// Teardown for an abrupt loss: fires the will, disposes of the session
    /// per its clean flag and notifies the fabric. Runs at most once.
    async fn handle_connection_lost(&mut self) {
        if self.lost_dispatched {
            return;
        }
        self.lost_dispatched = true;

        let Some(client_id) = self.client_id.clone() else {
            return;
        };
        info!("Notifying connection lost event, client id: {client_id}");

        if let Some(session) = self.session.clone() {
            if let Some(will) = session.will().await {
                self.post_office.fire_will(&will).await;
            }
            if session.is_clean() {
                debug!("Removing session for client {client_id}");
                self.registry.remove(&session).await;
            } else {
                session.disconnect().await;
            }
        }
        self.connected = false;
        self.post_office
            .connection_lost(&client_id, self.username.as_deref())
            .await;
    }

    fn bound_session(&self) -> Result<Arc<Session>> {
        self.session.clone().ok_or(MqttError::NotConnected)
    }
}
