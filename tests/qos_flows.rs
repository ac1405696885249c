//! QoS 0/1/2 state machines in both directions: acknowledgment ordering,
//! duplicate suppression, in-flight tracking and redelivery.

use std::sync::Arc;
use std::time::Duration;

use mqtt_broker_core::broker::{BrokerConfig, DeliveryRequest, SessionRegistry};
use mqtt_broker_core::packet::connect::ConnectPacket;
use mqtt_broker_core::packet::puback::PubAckPacket;
use mqtt_broker_core::packet::pubcomp::PubCompPacket;
use mqtt_broker_core::packet::publish::PublishPacket;
use mqtt_broker_core::packet::pubrec::PubRecPacket;
use mqtt_broker_core::packet::pubrel::PubRelPacket;
use mqtt_broker_core::test_utils::{
    settle, spawn_connection, ConnectionHarness, RecordingPostOffice,
};
use mqtt_broker_core::{AllowAllAuthenticator, Packet, PacketType, QoS};

async fn connected_harness(
    config: BrokerConfig,
    client_id: &str,
) -> (ConnectionHarness, Arc<SessionRegistry>, RecordingPostOffice) {
    let registry = Arc::new(SessionRegistry::new());
    let post_office = RecordingPostOffice::new();
    let harness = spawn_connection(
        config,
        Arc::new(AllowAllAuthenticator),
        registry.clone(),
        Arc::new(post_office.clone()),
    );
    harness
        .send(Packet::Connect(Box::new(
            ConnectPacket::new(client_id).with_clean_session(false),
        )))
        .await;
    settle().await;
    harness.probe.clear();
    (harness, registry, post_office)
}

fn inbound_publish(topic: &str, id: Option<u16>, qos: QoS, dup: bool) -> Packet {
    let mut publish = PublishPacket::new(topic, b"payload".as_slice(), qos).with_dup(dup);
    if let Some(id) = id {
        publish = publish.with_packet_id(id);
    }
    Packet::Publish(publish)
}

#[tokio::test]
async fn qos0_inbound_is_routed_without_an_ack() {
    let (harness, _registry, post_office) =
        connected_harness(BrokerConfig::default(), "c1").await;

    harness
        .send(inbound_publish("a/b", None, QoS::AtMostOnce, false))
        .await;
    settle().await;

    let routed = post_office.routed();
    assert_eq!(routed.len(), 1);
    assert_eq!(routed[0].0, "c1");
    assert_eq!(routed[0].1.topic_name, "a/b");
    assert!(harness.probe.written().is_empty(), "QoS 0 gets no ack");
}

#[tokio::test]
async fn qos1_inbound_is_acked_after_routing() {
    let (harness, _registry, post_office) =
        connected_harness(BrokerConfig::default(), "c1").await;

    harness
        .send(inbound_publish("a/b", Some(11), QoS::AtLeastOnce, false))
        .await;
    settle().await;

    assert_eq!(post_office.routed().len(), 1);
    let pubacks = harness.probe.written_of(PacketType::PubAck);
    assert!(
        matches!(pubacks.as_slice(), [Packet::PubAck(ack)] if ack.packet_id == 11),
        "one PUBACK echoing the packet id"
    );
}

#[tokio::test]
async fn qos1_inbound_routing_failure_is_fatal_and_unacked() {
    let (harness, _registry, post_office) =
        connected_harness(BrokerConfig::default(), "c1").await;

    post_office.fail_route(true);
    harness
        .send(inbound_publish("a/b", Some(11), QoS::AtLeastOnce, false))
        .await;
    settle().await;

    assert!(harness.probe.written_of(PacketType::PubAck).is_empty());
    assert!(harness.probe.is_closed());
}

#[tokio::test]
async fn qos2_inbound_duplicate_routes_once_but_acks_twice() {
    let (harness, _registry, post_office) =
        connected_harness(BrokerConfig::default(), "c1").await;

    harness
        .send(inbound_publish("a/b", Some(7), QoS::ExactlyOnce, false))
        .await;
    settle().await;
    harness
        .send(inbound_publish("a/b", Some(7), QoS::ExactlyOnce, true))
        .await;
    settle().await;

    assert_eq!(post_office.routed().len(), 1, "payload routed exactly once");
    let pubrecs = harness.probe.written_of(PacketType::PubRec);
    assert_eq!(pubrecs.len(), 2, "each PUBLISH gets a PUBREC");
    for packet in pubrecs {
        assert!(matches!(packet, Packet::PubRec(rec) if rec.packet_id == 7));
    }

    harness.send(Packet::PubRel(PubRelPacket::new(7))).await;
    settle().await;
    let pubcomps = harness.probe.written_of(PacketType::PubComp);
    assert!(matches!(pubcomps.as_slice(), [Packet::PubComp(c)] if c.packet_id == 7));

    // After PUBREL the id is fresh: the same id may be reused and routed again
    harness
        .send(inbound_publish("a/b", Some(7), QoS::ExactlyOnce, false))
        .await;
    settle().await;
    assert_eq!(post_office.routed().len(), 2);
}

#[tokio::test]
async fn pubrel_for_unknown_packet_id_still_gets_pubcomp() {
    let (harness, _registry, _post_office) =
        connected_harness(BrokerConfig::default(), "c1").await;

    harness.send(Packet::PubRel(PubRelPacket::new(9))).await;
    settle().await;

    let pubcomps = harness.probe.written_of(PacketType::PubComp);
    assert!(matches!(pubcomps.as_slice(), [Packet::PubComp(c)] if c.packet_id == 9));
}

#[tokio::test]
async fn invalid_topic_drops_the_connection_without_routing() {
    let (harness, _registry, post_office) =
        connected_harness(BrokerConfig::default(), "c1").await;

    harness
        .send(inbound_publish("bad/#/topic", Some(5), QoS::AtLeastOnce, false))
        .await;
    settle().await;

    assert!(post_office.routed().is_empty(), "nothing reaches the fabric");
    assert!(harness.probe.written_of(PacketType::PubAck).is_empty());
    assert!(harness.probe.is_closed());
}

#[tokio::test]
async fn outbound_packet_ids_are_consecutive_from_one() {
    let (harness, _registry, _post_office) =
        connected_harness(BrokerConfig::default(), "c1").await;

    for _ in 0..3 {
        harness
            .delivery
            .send(DeliveryRequest::Publish(PublishPacket::new(
                "t",
                b"x".as_slice(),
                QoS::AtLeastOnce,
            )))
            .await
            .unwrap();
    }
    settle().await;

    let ids: Vec<_> = harness
        .probe
        .written_of(PacketType::Publish)
        .into_iter()
        .filter_map(|p| match p {
            Packet::Publish(publish) => publish.packet_id,
            _ => None,
        })
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);
}

#[tokio::test]
async fn outbound_qos1_puback_removes_exactly_one_entry() {
    let (harness, registry, _post_office) =
        connected_harness(BrokerConfig::default(), "c1").await;
    let session = registry.get("c1").await.unwrap();

    for _ in 0..2 {
        harness
            .delivery
            .send(DeliveryRequest::Publish(PublishPacket::new(
                "t",
                b"x".as_slice(),
                QoS::AtLeastOnce,
            )))
            .await
            .unwrap();
    }
    settle().await;
    assert_eq!(session.inflight_len().await, 2);

    harness.send(Packet::PubAck(PubAckPacket::new(1))).await;
    settle().await;
    assert_eq!(session.inflight_len().await, 1);

    // A duplicate PUBACK removes nothing further
    harness.send(Packet::PubAck(PubAckPacket::new(1))).await;
    settle().await;
    assert_eq!(session.inflight_len().await, 1);
}

#[tokio::test(start_paused = true)]
async fn unacked_qos1_publish_is_resent_with_dup() {
    let (harness, _registry, _post_office) =
        connected_harness(BrokerConfig::default(), "c1").await;

    harness
        .delivery
        .send(DeliveryRequest::Publish(PublishPacket::new(
            "t",
            b"x".as_slice(),
            QoS::AtLeastOnce,
        )))
        .await
        .unwrap();
    settle().await;

    tokio::time::sleep(Duration::from_secs(6)).await;
    settle().await;

    let publishes = harness.probe.written_of(PacketType::Publish);
    assert_eq!(publishes.len(), 2, "original plus one resend");
    match (&publishes[0], &publishes[1]) {
        (Packet::Publish(first), Packet::Publish(resent)) => {
            assert!(!first.dup);
            assert!(resent.dup, "resend carries DUP=1");
            assert_eq!(first.packet_id, resent.packet_id, "same packet id");
        }
        _ => panic!("expected two PUBLISH packets"),
    }
}

#[tokio::test(start_paused = true)]
async fn outbound_qos2_walks_publish_pubrec_pubrel_pubcomp() {
    let (harness, registry, _post_office) =
        connected_harness(BrokerConfig::default(), "c1").await;
    let session = registry.get("c1").await.unwrap();

    harness
        .delivery
        .send(DeliveryRequest::Publish(PublishPacket::new(
            "t",
            b"x".as_slice(),
            QoS::ExactlyOnce,
        )))
        .await
        .unwrap();
    settle().await;

    let publishes = harness.probe.written_of(PacketType::Publish);
    assert_eq!(publishes.len(), 1);
    assert_eq!(session.inflight_len().await, 1);

    harness.send(Packet::PubRec(PubRecPacket::new(1))).await;
    settle().await;
    let pubrels = harness.probe.written_of(PacketType::PubRel);
    assert!(matches!(pubrels.as_slice(), [Packet::PubRel(r)] if r.packet_id == 1));

    // After PUBREC only the PUBREL is retransmitted, never the payload
    tokio::time::sleep(Duration::from_secs(6)).await;
    settle().await;
    assert_eq!(harness.probe.written_of(PacketType::Publish).len(), 1);
    assert_eq!(harness.probe.written_of(PacketType::PubRel).len(), 2);

    harness.send(Packet::PubComp(PubCompPacket::new(1))).await;
    settle().await;
    assert_eq!(session.inflight_len().await, 0);

    tokio::time::sleep(Duration::from_secs(6)).await;
    settle().await;
    assert_eq!(
        harness.probe.written_of(PacketType::PubRel).len(),
        2,
        "completed exchange is never retransmitted"
    );
}

#[tokio::test]
async fn unwritable_channel_drops_qos0_outright() {
    let (harness, _registry, _post_office) =
        connected_harness(BrokerConfig::default(), "c1").await;

    harness.probe.set_writable(false);
    harness
        .delivery
        .send(DeliveryRequest::Publish(PublishPacket::new(
            "t",
            b"x".as_slice(),
            QoS::AtMostOnce,
        )))
        .await
        .unwrap();
    settle().await;

    assert!(harness.probe.written_of(PacketType::Publish).is_empty());

    // Restored writability does not resurrect an untracked QoS 0 publish
    harness.probe.set_writable(true);
    harness
        .events
        .send(mqtt_broker_core::ConnectionEvent::WritabilityChanged)
        .await
        .unwrap();
    settle().await;
    assert!(harness.probe.written_of(PacketType::Publish).is_empty());
}

#[tokio::test]
async fn qos1_deferred_while_unwritable_is_sent_on_writability_restored() {
    let (harness, registry, _post_office) =
        connected_harness(BrokerConfig::default(), "c1").await;
    let session = registry.get("c1").await.unwrap();

    harness.probe.set_writable(false);
    harness
        .delivery
        .send(DeliveryRequest::Publish(PublishPacket::new(
            "t",
            b"x".as_slice(),
            QoS::AtLeastOnce,
        )))
        .await
        .unwrap();
    settle().await;

    assert!(harness.probe.written_of(PacketType::Publish).is_empty());
    assert_eq!(session.inflight_len().await, 1, "tracked despite the drop");

    harness.probe.set_writable(true);
    harness
        .events
        .send(mqtt_broker_core::ConnectionEvent::WritabilityChanged)
        .await
        .unwrap();
    settle().await;

    let publishes = harness.probe.written_of(PacketType::Publish);
    assert!(
        matches!(publishes.as_slice(), [Packet::Publish(p)] if p.packet_id == Some(1) && p.dup)
    );
}

#[tokio::test]
async fn batched_flush_waits_for_read_completed() {
    let (harness, _registry, _post_office) = connected_harness(
        BrokerConfig::default().with_immediate_buffer_flush(false),
        "c1",
    )
    .await;
    let flushes_before = harness.probe.flush_count();

    harness
        .delivery
        .send(DeliveryRequest::Publish(PublishPacket::new(
            "t",
            b"x".as_slice(),
            QoS::AtMostOnce,
        )))
        .await
        .unwrap();
    settle().await;

    assert_eq!(harness.probe.written_of(PacketType::Publish).len(), 1);
    assert_eq!(
        harness.probe.flush_count(),
        flushes_before,
        "write deferred until the read batch ends"
    );

    harness
        .events
        .send(mqtt_broker_core::ConnectionEvent::ReadCompleted)
        .await
        .unwrap();
    settle().await;
    assert_eq!(harness.probe.flush_count(), flushes_before + 1);
}
