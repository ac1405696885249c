//! The routing fabric seen from a connection, and an in-memory
//! implementation of it.
//!
//! The engine only depends on the [`PostOffice`] trait; [`MessageRouter`]
//! is the bundled implementation backed by a subscription map and a
//! retained-message store.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::broker::registry::SessionRegistry;
use crate::error::Result;
use crate::packet::publish::PublishPacket;
use crate::packet::suback::SubAckReturnCode;
use crate::packet::subscribe::TopicFilter;
use crate::types::WillMessage;
use crate::validation::{is_valid_topic_filter, topic_matches_filter};
use crate::QoS;

/// The publish/subscribe fabric a connection talks to.
#[async_trait]
pub trait PostOffice: Send + Sync {
    /// Registers subscriptions for a client and returns one return code per
    /// filter, in order.
    async fn subscribe(
        &self,
        client_id: &str,
        username: Option<&str>,
        filters: &[TopicFilter],
    ) -> Vec<SubAckReturnCode>;

    /// Removes subscriptions for a client.
    async fn unsubscribe(&self, client_id: &str, topics: &[String]);

    /// Accepts a publish for routing. Once this returns `Ok` the fabric owns
    /// the message; for QoS 1 the caller acknowledges only after that.
    ///
    /// # Errors
    ///
    /// Returns an error if the fabric rejects the publish; the connection
    /// treats that as fatal.
    async fn route(
        &self,
        publish: &PublishPacket,
        sender_client_id: &str,
        username: Option<&str>,
    ) -> Result<()>;

    /// Publishes a will message on behalf of an abruptly disconnected
    /// client.
    async fn fire_will(&self, will: &WillMessage);

    /// A connection finished its handshake.
    async fn connection_established(&self, client_id: &str, username: Option<&str>);

    /// A client disconnected cleanly.
    async fn client_disconnected(&self, client_id: &str, username: Option<&str>);

    /// A connection was lost without a DISCONNECT packet.
    async fn connection_lost(&self, client_id: &str, username: Option<&str>);
}

/// A subscription held by the router.
#[derive(Debug, Clone)]
struct Subscription {
    client_id: String,
    qos: QoS,
}

/// In-memory router: filter → subscriptions, plus retained messages.
pub struct MessageRouter {
    registry: Arc<SessionRegistry>,
    subscriptions: RwLock<HashMap<String, Vec<Subscription>>>,
    retained: RwLock<HashMap<String, PublishPacket>>,
}

impl MessageRouter {
    /// Creates a router delivering through the given registry.
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            subscriptions: RwLock::new(HashMap::new()),
            retained: RwLock::new(HashMap::new()),
        }
    }

    /// Number of topic filters with at least one subscriber.
    pub async fn filter_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    /// Number of retained messages.
    pub async fn retained_count(&self) -> usize {
        self.retained.read().await.len()
    }

    async fn deliver_to_subscribers(&self, publish: &PublishPacket) {
        let subscriptions = self.subscriptions.read().await;
        for (filter, subs) in subscriptions.iter() {
            if !topic_matches_filter(&publish.topic_name, filter) {
                continue;
            }
            for sub in subs {
                let Some(session) = self.registry.get(&sub.client_id).await else {
                    continue;
                };

                let effective_qos = publish.qos.lower_of(sub.qos);
                // At-most-once means exactly that: no queueing for offline
                // subscribers
                if effective_qos == QoS::AtMostOnce && !session.is_connected().await {
                    continue;
                }

                let mut message = publish.clone();
                message.qos = effective_qos;
                message.retain = false;
                message.packet_id = None;
                message.dup = false;
                session.dispatch(message).await;
            }
        }
    }

    async fn store_retained(&self, publish: &PublishPacket) {
        let mut retained = self.retained.write().await;
        if publish.payload.is_empty() {
            // Empty retained payload clears the slot
            retained.remove(&publish.topic_name);
            debug!("Cleared retained message for {}", publish.topic_name);
        } else {
            retained.insert(publish.topic_name.clone(), publish.clone());
            debug!("Stored retained message for {}", publish.topic_name);
        }
    }

    async fn deliver_retained(&self, client_id: &str, filter: &TopicFilter) {
        let Some(session) = self.registry.get(client_id).await else {
            return;
        };
        let retained = self.retained.read().await;
        for (topic, message) in retained.iter() {
            if !topic_matches_filter(topic, &filter.filter) {
                continue;
            }
            let mut publish = message.clone();
            publish.qos = message.qos.lower_of(filter.qos);
            publish.retain = true;
            publish.packet_id = None;
            publish.dup = false;
            session.dispatch(publish).await;
        }
    }
}

#[async_trait]
impl PostOffice for MessageRouter {
    async fn subscribe(
        &self,
        client_id: &str,
        _username: Option<&str>,
        filters: &[TopicFilter],
    ) -> Vec<SubAckReturnCode> {
        let mut return_codes = Vec::with_capacity(filters.len());

        for filter in filters {
            if !is_valid_topic_filter(&filter.filter) {
                return_codes.push(SubAckReturnCode::Failure);
                continue;
            }

            {
                let mut subscriptions = self.subscriptions.write().await;
                let subs = subscriptions.entry(filter.filter.clone()).or_default();
                // A re-subscribe replaces the granted QoS
                subs.retain(|sub| sub.client_id != client_id);
                subs.push(Subscription {
                    client_id: client_id.to_string(),
                    qos: filter.qos,
                });
            }
            debug!("Client {client_id} subscribed to {}", filter.filter);
            return_codes.push(SubAckReturnCode::from_qos(filter.qos));

            self.deliver_retained(client_id, filter).await;
        }

        return_codes
    }

    async fn unsubscribe(&self, client_id: &str, topics: &[String]) {
        let mut subscriptions = self.subscriptions.write().await;
        for topic in topics {
            if let Some(subs) = subscriptions.get_mut(topic) {
                subs.retain(|sub| sub.client_id != client_id);
                if subs.is_empty() {
                    subscriptions.remove(topic);
                }
                debug!("Client {client_id} unsubscribed from {topic}");
            }
        }
    }

    async fn route(
        &self,
        publish: &PublishPacket,
        sender_client_id: &str,
        _username: Option<&str>,
    ) -> Result<()> {
        trace!(
            "Routing publish from {sender_client_id} to topic {}",
            publish.topic_name
        );

        if publish.retain {
            self.store_retained(publish).await;
        }

        self.deliver_to_subscribers(publish).await;
        Ok(())
    }

    async fn fire_will(&self, will: &WillMessage) {
        debug!("Firing will on topic {}", will.topic);
        let publish = PublishPacket::new(will.topic.clone(), will.payload.clone(), will.qos)
            .with_retain(will.retain);

        if publish.retain {
            self.store_retained(&publish).await;
        }
        self.deliver_to_subscribers(&publish).await;
    }

    async fn connection_established(&self, client_id: &str, _username: Option<&str>) {
        trace!("Connection established for {client_id}");
    }

    async fn client_disconnected(&self, client_id: &str, username: Option<&str>) {
        trace!("Client {client_id} disconnected");
        self.reap_subscriptions(client_id, username).await;
    }

    async fn connection_lost(&self, client_id: &str, username: Option<&str>) {
        trace!("Connection lost for {client_id}");
        self.reap_subscriptions(client_id, username).await;
    }
}

impl MessageRouter {
    /// Drops a client's subscriptions once its session is gone from the
    /// registry (clean sessions); persistent sessions keep theirs.
    async fn reap_subscriptions(&self, client_id: &str, _username: Option<&str>) {
        if self.registry.get(client_id).await.is_some() {
            return;
        }
        let mut subscriptions = self.subscriptions.write().await;
        subscriptions.retain(|_, subs| {
            subs.retain(|sub| sub.client_id != client_id);
            !subs.is_empty()
        });
    }
}
