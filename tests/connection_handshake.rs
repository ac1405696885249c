//! CONNECT handshake behavior: protocol gates, identifier policy,
//! authentication, CONNACK ordering and keep-alive boundaries.

use std::sync::Arc;

use mqtt_broker_core::broker::{BrokerConfig, SessionRegistry};
use mqtt_broker_core::packet::connect::ConnectPacket;
use mqtt_broker_core::packet::publish::PublishPacket;
use mqtt_broker_core::test_utils::{
    settle, spawn_connection, ConnectionHarness, RecordingPostOffice,
};
use mqtt_broker_core::{
    AllowAllAuthenticator, ConnectReturnCode, Packet, PacketType, PasswordFileAuthenticator, QoS,
    WillMessage,
};

fn harness_with(
    config: BrokerConfig,
) -> (ConnectionHarness, Arc<SessionRegistry>, RecordingPostOffice) {
    let registry = Arc::new(SessionRegistry::new());
    let post_office = RecordingPostOffice::new();
    let harness = spawn_connection(
        config,
        Arc::new(AllowAllAuthenticator),
        registry.clone(),
        Arc::new(post_office.clone()),
    );
    (harness, registry, post_office)
}

fn harness() -> (ConnectionHarness, Arc<SessionRegistry>, RecordingPostOffice) {
    harness_with(BrokerConfig::default())
}

#[tokio::test]
async fn clean_anonymous_connect_with_generated_client_id() {
    let (harness, registry, post_office) = harness();

    harness
        .send(Packet::Connect(Box::new(
            ConnectPacket::new("").with_clean_session(true),
        )))
        .await;
    settle().await;

    let connack = harness.probe.connack().expect("exactly one CONNACK");
    assert_eq!(connack.return_code, ConnectReturnCode::Accepted);
    assert!(!connack.session_present);

    let established = post_office.established();
    assert_eq!(established.len(), 1);
    let client_id = &established[0];
    assert_eq!(client_id.len(), 32, "generated id is 32 hex characters");
    assert!(client_id.chars().all(|c| c.is_ascii_hexdigit()));

    let session = registry.get(client_id).await.expect("session stored");
    assert!(session.is_connected().await);
    assert!(!harness.probe.is_closed());
}

#[tokio::test]
async fn connack_is_first_packet_on_the_wire() {
    let (harness, _registry, _post_office) = harness();

    harness
        .send(Packet::Connect(Box::new(ConnectPacket::new("c1"))))
        .await;
    harness
        .send(Packet::Publish(PublishPacket::new(
            "a/b",
            b"x".as_slice(),
            QoS::AtMostOnce,
        )))
        .await;
    settle().await;

    let written = harness.probe.written();
    assert!(!written.is_empty());
    assert_eq!(
        written[0].packet_type(),
        PacketType::ConnAck,
        "no outbound packet may precede the CONNACK"
    );
    assert_eq!(harness.probe.written_of(PacketType::ConnAck).len(), 1);
}

#[tokio::test]
async fn unacceptable_protocol_version_is_rejected() {
    let (harness, registry, _post_office) = harness();

    harness
        .send(Packet::Connect(Box::new(
            ConnectPacket::new("c1").with_protocol_level(2),
        )))
        .await;
    settle().await;

    let connack = harness.probe.connack().unwrap();
    assert_eq!(
        connack.return_code,
        ConnectReturnCode::UnacceptableProtocolVersion
    );
    assert!(!connack.session_present);
    assert!(harness.probe.is_closed());
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn all_supported_protocol_levels_are_accepted() {
    for level in [3u8, 4, 5] {
        let (harness, _registry, _post_office) = harness();
        harness
            .send(Packet::Connect(Box::new(
                ConnectPacket::new(format!("c-{level}")).with_protocol_level(level),
            )))
            .await;
        settle().await;
        let connack = harness.probe.connack().unwrap();
        assert_eq!(connack.return_code, ConnectReturnCode::Accepted);
    }
}

#[tokio::test]
async fn empty_client_id_rejected_when_not_allowed() {
    let (harness, registry, _post_office) =
        harness_with(BrokerConfig::default().with_allow_zero_byte_client_id(false));

    harness
        .send(Packet::Connect(Box::new(
            ConnectPacket::new("").with_clean_session(true),
        )))
        .await;
    settle().await;

    let connack = harness.probe.connack().unwrap();
    assert_eq!(connack.return_code, ConnectReturnCode::IdentifierRejected);
    assert!(harness.probe.is_closed());
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn empty_client_id_with_persistent_session_rejected_even_when_allowed() {
    let (harness, registry, _post_office) = harness();

    harness
        .send(Packet::Connect(Box::new(
            ConnectPacket::new("").with_clean_session(false),
        )))
        .await;
    settle().await;

    let connack = harness.probe.connack().unwrap();
    assert_eq!(connack.return_code, ConnectReturnCode::IdentifierRejected);
    assert!(harness.probe.is_closed());
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn bad_credentials_are_rejected_without_storing_a_session() {
    let registry = Arc::new(SessionRegistry::new());
    let post_office = RecordingPostOffice::new();
    let authenticator = PasswordFileAuthenticator::new();
    authenticator.add_user("u", "good").await;

    let harness = spawn_connection(
        BrokerConfig::default().with_allow_anonymous(false),
        Arc::new(authenticator),
        registry.clone(),
        Arc::new(post_office.clone()),
    );

    harness
        .send(Packet::Connect(Box::new(
            ConnectPacket::new("c1").with_credentials("u", b"bad"),
        )))
        .await;
    settle().await;

    let connack = harness.probe.connack().unwrap();
    assert_eq!(connack.return_code, ConnectReturnCode::BadUsernameOrPassword);
    assert!(harness.probe.is_closed());
    assert!(registry.is_empty().await, "no session stored");
    assert!(post_office.established().is_empty());
}

#[tokio::test]
async fn anonymous_connect_rejected_when_disallowed() {
    let (harness, registry, _post_office) =
        harness_with(BrokerConfig::default().with_allow_anonymous(false));

    harness
        .send(Packet::Connect(Box::new(ConnectPacket::new("c1"))))
        .await;
    settle().await;

    let connack = harness.probe.connack().unwrap();
    assert_eq!(connack.return_code, ConnectReturnCode::BadUsernameOrPassword);
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn username_without_password_rejected_when_anonymous_disallowed() {
    let registry = Arc::new(SessionRegistry::new());
    let authenticator = PasswordFileAuthenticator::new();
    authenticator.add_user("u", "good").await;
    let harness = spawn_connection(
        BrokerConfig::default().with_allow_anonymous(false),
        Arc::new(authenticator),
        registry.clone(),
        Arc::new(RecordingPostOffice::new()),
    );

    harness
        .send(Packet::Connect(Box::new(
            ConnectPacket::new("c1").with_username("u"),
        )))
        .await;
    settle().await;

    let connack = harness.probe.connack().unwrap();
    assert_eq!(connack.return_code, ConnectReturnCode::BadUsernameOrPassword);
}

#[tokio::test]
async fn second_connect_closes_without_a_second_connack() {
    let (harness, _registry, _post_office) = harness();

    harness
        .send(Packet::Connect(Box::new(ConnectPacket::new("c1"))))
        .await;
    settle().await;
    harness
        .send(Packet::Connect(Box::new(ConnectPacket::new("c1"))))
        .await;
    settle().await;

    assert_eq!(
        harness.probe.written_of(PacketType::ConnAck).len(),
        1,
        "exactly one CONNACK over the connection's lifetime"
    );
    assert!(harness.probe.is_closed());
}

#[tokio::test]
async fn packet_before_connect_closes_the_channel() {
    let (harness, _registry, post_office) = harness();

    harness.send(Packet::PingReq).await;
    settle().await;

    assert!(harness.probe.is_closed());
    assert!(harness.probe.written().is_empty(), "no reply at all");
    assert!(post_office.lost().is_empty(), "no session to tear down");
}

#[tokio::test]
async fn pingreq_gets_pingresp_without_session_mutation() {
    let (harness, registry, _post_office) = harness();

    harness
        .send(Packet::Connect(Box::new(
            ConnectPacket::new("c1").with_clean_session(false),
        )))
        .await;
    settle().await;
    harness.send(Packet::PingReq).await;
    settle().await;

    assert_eq!(harness.probe.written_of(PacketType::PingResp).len(), 1);
    let session = registry.get("c1").await.unwrap();
    assert_eq!(session.inflight_len().await, 0);
    assert_eq!(session.queued_offline_len().await, 0);
}

#[tokio::test]
async fn connack_write_failure_cleans_up_the_session() {
    let (harness, registry, post_office) = harness();

    harness.probe.fail_writes(true);
    harness
        .send(Packet::Connect(Box::new(ConnectPacket::new("c1"))))
        .await;
    settle().await;

    assert!(harness.probe.is_closed());
    assert!(registry.is_empty().await, "session removed after write failure");
    assert!(post_office.established().is_empty());
}

#[tokio::test(start_paused = true)]
async fn keep_alive_timeout_closes_and_fires_the_will() {
    let (harness, registry, post_office) = harness();

    harness
        .send(Packet::Connect(Box::new(
            ConnectPacket::new("c1")
                .with_keep_alive(10)
                .with_will(WillMessage::new("lwt", b"bye".as_slice()).with_qos(QoS::AtLeastOnce)),
        )))
        .await;
    settle().await;
    assert!(!harness.probe.is_closed());

    // Idle budget is ceil(10 * 1.5) = 15 seconds
    tokio::time::sleep(std::time::Duration::from_secs(16)).await;
    settle().await;

    assert!(harness.probe.is_closed());
    let wills = post_office.fired_wills();
    assert_eq!(wills.len(), 1);
    assert_eq!(wills[0].topic, "lwt");
    assert_eq!(wills[0].payload.as_ref(), b"bye");
    assert_eq!(wills[0].qos, QoS::AtLeastOnce);
    assert!(registry.is_empty().await, "clean session removed");
}

#[tokio::test(start_paused = true)]
async fn inbound_traffic_resets_the_keep_alive_timer() {
    let (harness, _registry, _post_office) = harness();

    harness
        .send(Packet::Connect(Box::new(
            ConnectPacket::new("c1").with_keep_alive(10),
        )))
        .await;
    settle().await;

    for _ in 0..3 {
        tokio::time::sleep(std::time::Duration::from_secs(10)).await;
        harness.send(Packet::PingReq).await;
        settle().await;
        assert!(!harness.probe.is_closed());
    }
}

#[tokio::test(start_paused = true)]
async fn zero_keep_alive_installs_no_idle_timer() {
    let (harness, _registry, _post_office) = harness();

    harness
        .send(Packet::Connect(Box::new(
            ConnectPacket::new("c1").with_keep_alive(0),
        )))
        .await;
    settle().await;

    tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
    settle().await;
    assert!(!harness.probe.is_closed(), "keepAlive=0 never idles out");
}
