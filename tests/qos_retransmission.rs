//! Duplicate-handling rules, retransmission behavior, and protocol
//! violation handling at the packet boundary.

mod common;

use std::time::Duration;

use common::{publishes, TestBroker};
use routemq::protocol::{
    Packet, PubAck, PubComp, PubRec, PubRel, SubAck, Subscribe, SubscribeFilter,
    SubscribeReturnCode,
};
use routemq::QoS;

/// A PUBREL whose exchange already completed is answered with PUBCOMP and
/// nothing is delivered.
#[tokio::test]
async fn orphan_pubrel_gets_pubcomp() {
    let tb = TestBroker::with_defaults();
    let a = tb.connect("client-a", true).await;
    tb.subscribe(a, 1, "#", QoS::ExactlyOnce).await;

    let b = tb.connect("client-b", true).await;
    tb.broker.on_packet(b, Packet::PubRel(PubRel::new(50))).await;

    tb.transport
        .wait_for(b, |p| matches!(p, Packet::PubComp(c) if c.packet_id == 50))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(publishes(&tb.transport.sent_to(a)).is_empty());
}

/// PUBREC and PUBCOMP without a matching context are silently dropped and
/// do not hurt the connection.
#[tokio::test]
async fn orphan_pubrec_and_pubcomp_are_silently_dropped() {
    let tb = TestBroker::with_defaults();
    let b = tb.connect("client-b", true).await;
    tb.transport.drain(b);

    tb.broker.on_packet(b, Packet::PubRec(PubRec::new(60))).await;
    tb.broker.on_packet(b, Packet::PubComp(PubComp::new(61))).await;

    tb.broker.on_packet(b, Packet::PingReq).await;
    tb.transport
        .wait_for(b, |p| matches!(p, Packet::PingResp))
        .await;
    let packets = tb.transport.sent_to(b);
    assert!(packets
        .iter()
        .all(|p| matches!(p, Packet::PingResp)));
}

/// An unanswered inbound QoS 2 exchange re-emits PUBREC on the retry
/// timer; PUBREL then completes it.
#[tokio::test]
async fn inbound_qos2_retransmits_pubrec_until_pubrel() {
    let tb = TestBroker::with_defaults(); // retry 100ms
    let b = tb.connect("client-b", true).await;
    tb.publish(b, "q2/topic", b"x", QoS::ExactlyOnce, Some(8)).await;

    tb.transport
        .wait_for(b, |p| matches!(p, Packet::PubRec(r) if r.packet_id == 8))
        .await;
    // Let at least one retransmission happen.
    tokio::time::sleep(Duration::from_millis(250)).await;
    let pubrecs = tb
        .transport
        .sent_to(b)
        .iter()
        .filter(|p| matches!(p, Packet::PubRec(r) if r.packet_id == 8))
        .count();
    assert!(pubrecs >= 2, "expected PUBREC retransmission, got {}", pubrecs);

    tb.broker.on_packet(b, Packet::PubRel(PubRel::new(8))).await;
    tb.transport
        .wait_for(b, |p| matches!(p, Packet::PubComp(c) if c.packet_id == 8))
        .await;
}

/// A persistent session resumes its unacknowledged outbound PUBLISH with
/// the original packet id and DUP set.
#[tokio::test]
async fn resumed_session_retransmits_inflight_with_dup() {
    let tb = TestBroker::with_defaults();
    let c1 = tb.connect("client-c", false).await;
    tb.subscribe(c1, 1, "x", QoS::AtLeastOnce).await;

    let d = tb.connect("client-d", true).await;
    tb.publish(d, "x", b"m", QoS::AtLeastOnce, Some(1)).await;

    let first = tb
        .transport
        .wait_for(c1, |p| matches!(p, Packet::Publish(_)))
        .await;
    let Packet::Publish(first) = first else {
        unreachable!()
    };
    let original_id = first.packet_id.unwrap();
    assert!(!first.dup);

    // The link drops before the PUBACK arrives.
    tb.broker
        .on_disconnect(c1, routemq::DisconnectReason::TransportError)
        .await;

    let c2 = tb.connect("client-c", false).await;
    let resent = tb
        .transport
        .wait_for(c2, |p| matches!(p, Packet::Publish(_)))
        .await;
    let Packet::Publish(resent) = resent else {
        unreachable!()
    };
    assert!(resent.dup);
    assert_eq!(resent.packet_id, Some(original_id));

    tb.broker
        .on_packet(c2, Packet::PubAck(PubAck::new(original_id)))
        .await;
}

/// Unsubscribing stops delivery; a second UNSUBSCRIBE for the same filter
/// is still acknowledged.
#[tokio::test]
async fn unsubscribe_is_effective_and_idempotent() {
    let tb = TestBroker::with_defaults();
    let a = tb.connect("client-a", true).await;
    tb.subscribe(a, 1, "t/+", QoS::AtLeastOnce).await;
    tb.unsubscribe(a, 2, "t/+").await;
    tb.unsubscribe(a, 3, "t/+").await;

    let b = tb.connect("client-b", true).await;
    tb.publish(b, "t/x", b"m", QoS::AtLeastOnce, Some(1)).await;
    tb.transport
        .wait_for(b, |p| matches!(p, Packet::PubAck(_)))
        .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(publishes(&tb.transport.sent_to(a)).is_empty());
}

/// The broker caps granted QoS at its configured maximum and reports the
/// grant in the SUBACK.
#[tokio::test]
async fn granted_qos_capped_in_suback() {
    let mut config = common::test_config();
    config.max_qos = QoS::AtLeastOnce;
    let tb = TestBroker::new(config);

    let a = tb.connect("client-a", true).await;
    tb.broker
        .on_packet(
            a,
            Packet::Subscribe(Subscribe {
                packet_id: 4,
                filters: vec![SubscribeFilter {
                    filter: "t".to_string(),
                    qos: QoS::ExactlyOnce,
                }],
            }),
        )
        .await;

    let suback = tb
        .transport
        .wait_for(a, |p| matches!(p, Packet::SubAck(_)))
        .await;
    assert_eq!(
        suback,
        Packet::SubAck(SubAck {
            packet_id: 4,
            return_codes: vec![SubscribeReturnCode::GrantedQos1],
        })
    );
}

/// A server-only packet from a client is a protocol violation: the
/// connection dies and a clean session is destroyed with it.
#[tokio::test]
async fn server_only_packet_terminates_connection() {
    let tb = TestBroker::with_defaults();
    let a = tb.connect("client-a", true).await;
    assert_eq!(tb.broker.session_count(), 1);

    tb.broker
        .on_packet(
            a,
            Packet::SubAck(SubAck {
                packet_id: 1,
                return_codes: vec![],
            }),
        )
        .await;

    tb.transport.wait_closed(a).await;
    assert_eq!(tb.broker.session_count(), 0);
    assert_eq!(tb.broker.connection_count(), 0);
}

/// A malformed filter in SUBSCRIBE terminates the connection.
#[tokio::test]
async fn malformed_filter_terminates_connection() {
    let tb = TestBroker::with_defaults();
    let a = tb.connect("client-a", true).await;

    tb.broker
        .on_packet(
            a,
            Packet::Subscribe(Subscribe {
                packet_id: 1,
                filters: vec![SubscribeFilter {
                    filter: "bad/#/more".to_string(),
                    qos: QoS::AtMostOnce,
                }],
            }),
        )
        .await;

    tb.transport.wait_closed(a).await;
}

/// A second CONNECT on the same connection is a protocol violation.
#[tokio::test]
async fn second_connect_terminates_connection() {
    let tb = TestBroker::with_defaults();
    let a = tb.connect("client-a", true).await;

    tb.broker
        .on_packet(
            a,
            Packet::Connect(Box::new(routemq::protocol::Connect {
                client_id: "client-a".to_string(),
                ..routemq::protocol::Connect::default()
            })),
        )
        .await;

    tb.transport.wait_closed(a).await;
}

/// A PUBLISH whose topic contains wildcards is malformed.
#[tokio::test]
async fn wildcard_publish_topic_terminates_connection() {
    let tb = TestBroker::with_defaults();
    let a = tb.connect("client-a", true).await;

    tb.publish(a, "rooms/+/temp", b"x", QoS::AtMostOnce, None).await;
    tb.transport.wait_closed(a).await;
}

/// Clean-session teardown removes every subscription row (the table only
/// holds clients whose sessions exist).
#[tokio::test]
async fn clean_disconnect_clears_subscription_rows() {
    let tb = TestBroker::with_defaults();
    let a = tb.connect("client-a", true).await;
    tb.subscribe(a, 1, "one/#", QoS::AtMostOnce).await;
    tb.subscribe(a, 2, "two/+", QoS::AtLeastOnce).await;
    assert_eq!(tb.broker.subscription_count(), 2);

    tb.broker.on_packet(a, Packet::Disconnect).await;
    tb.transport.wait_closed(a).await;
    assert_eq!(tb.broker.subscription_count(), 0);
    assert_eq!(tb.broker.session_count(), 0);
}
