//! QoS delivery tests
//!
//! Outgoing publishes against a broker that can drop acknowledgements, and
//! ordering of inbound messages on the way to the callback.

mod test_helpers;

use mqtt_engine::protocol::{Packet, PacketExt};
use mqtt_engine::testing::MockBrokerSettings;
use mqtt_engine::{Limits, MqttError, MqttEvent, PublishRequest, QoS, Subscription};
use std::time::Duration;
use test_helpers::{test_limits, Harness};

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_qos0_publish_completes_without_ack() {
    let harness = Harness::connected().await;

    let pending = harness
        .engine
        .publish_async(harness.id, PublishRequest::new("metrics/cpu", "12", QoS::AtMostOnce))
        .await
        .unwrap();

    assert_eq!(pending.packet_id(), None);
    pending.await.unwrap();
    let publishes = harness.broker.publishes_received();
    assert_eq!(publishes.len(), 1);
    assert_eq!(publishes[0].packet_id, None);
    assert_eq!(harness.engine.inflight(harness.id).unwrap(), 0);
}

#[tokio::test]
async fn test_qos1_publish_completes_on_puback() {
    let harness = Harness::connected().await;

    harness
        .engine
        .publish(
            harness.id,
            PublishRequest::new("metrics/cpu", "12", QoS::AtLeastOnce).retain(true),
        )
        .await
        .unwrap();

    let publishes = harness.broker.publishes_received();
    assert_eq!(publishes.len(), 1);
    assert!(publishes[0].packet_id.is_some());
    assert!(publishes[0].retain);
    assert!(!publishes[0].dup);
    assert_eq!(harness.engine.inflight(harness.id).unwrap(), 0);
}

#[tokio::test]
async fn test_qos2_publish_runs_full_handshake() {
    let harness = Harness::connected().await;

    harness
        .engine
        .publish(harness.id, PublishRequest::new("orders/1", "paid", QoS::ExactlyOnce))
        .await
        .unwrap();

    let outgoing: Vec<&'static str> = harness
        .broker
        .received()
        .iter()
        .map(|packet| packet.name())
        .collect();
    assert_eq!(outgoing, vec!["CONNECT", "PUBLISH", "PUBREL"]);
}

#[tokio::test]
async fn test_packet_ids_are_distinct_and_nonzero() {
    let harness = Harness::connected().await;
    let mut ids = Vec::new();

    for i in 0..3 {
        let pending = harness
            .engine
            .publish_async(
                harness.id,
                PublishRequest::new(format!("ids/{i}"), "x", QoS::AtLeastOnce),
            )
            .await
            .unwrap();
        ids.push(pending.packet_id().unwrap());
        pending.await.unwrap();
    }

    assert!(ids.iter().all(|id| *id != 0));
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_puback_is_retransmitted_with_dup() {
    // Arrange
    let harness = Harness::connected().await;
    harness.broker.drop_acks([true]);

    // Act
    harness
        .engine
        .publish(harness.id, PublishRequest::new("alerts/door", "open", QoS::AtLeastOnce))
        .await
        .unwrap();

    // Assert: exactly one retransmission, flagged dup, same packet id
    let publishes = harness.broker.publishes_received();
    assert_eq!(publishes.len(), 2);
    assert!(!publishes[0].dup);
    assert!(publishes[1].dup);
    assert_eq!(publishes[0].packet_id, publishes[1].packet_id);
    assert_eq!(harness.engine.inflight(harness.id).unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_publish_fails_after_retry_budget() {
    // Arrange: max_retry is 3, so four transmissions go unanswered
    let harness = Harness::connected().await;
    harness.broker.drop_acks([true; 4]);

    // Act
    let result = harness
        .engine
        .publish(harness.id, PublishRequest::new("alerts/door", "open", QoS::AtLeastOnce))
        .await;

    // Assert
    assert!(matches!(result, Err(MqttError::PublishFail { .. })));
    assert_eq!(harness.broker.publishes_received().len(), 4);
    assert_eq!(harness.engine.inflight(harness.id).unwrap(), 0);
    // the handle stays connected; only the request failed
    harness
        .engine
        .publish(harness.id, PublishRequest::new("alerts/door", "closed", QoS::AtLeastOnce))
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_fails_after_retry_budget() {
    // Arrange: every SUBACK for the original and its three resends is lost
    let harness = Harness::connected().await;
    harness.broker.drop_acks([true; 4]);

    // Act
    let result = harness
        .engine
        .subscribe(
            harness.id,
            vec![Subscription::new("alerts/#", QoS::AtLeastOnce)],
        )
        .await;

    // Assert
    assert!(matches!(result, Err(MqttError::SubscribeFail { .. })));
    assert_eq!(
        harness
            .broker
            .count_received(|p| matches!(p, Packet::Subscribe(_))),
        4
    );
    assert_eq!(harness.engine.inflight(harness.id).unwrap(), 0);
    let handle = harness.engine.lookup(harness.id).unwrap();
    assert_eq!(handle.subscription_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_fails_after_retry_budget() {
    // Arrange
    let harness = Harness::connected().await;
    harness
        .engine
        .subscribe(
            harness.id,
            vec![Subscription::new("alerts/#", QoS::AtLeastOnce)],
        )
        .await
        .unwrap();
    harness.broker.drop_acks([true; 4]);

    // Act
    let result = harness
        .engine
        .unsubscribe(harness.id, vec!["alerts/#".to_string()])
        .await;

    // Assert
    assert!(matches!(result, Err(MqttError::UnsubscribeFail { .. })));
    assert_eq!(
        harness
            .broker
            .count_received(|p| matches!(p, Packet::Unsubscribe(_))),
        4
    );
    assert_eq!(harness.engine.inflight(harness.id).unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_pubcomp_resends_pubrel() {
    let harness = Harness::connected().await;
    // PUBREC goes through, the first PUBCOMP is lost
    harness.broker.drop_acks([false, true]);

    harness
        .engine
        .publish(harness.id, PublishRequest::new("orders/2", "paid", QoS::ExactlyOnce))
        .await
        .unwrap();

    assert_eq!(harness.broker.publishes_received().len(), 1);
    assert_eq!(
        harness
            .broker
            .count_received(|p| matches!(p, Packet::PubRel(_))),
        2
    );
}

#[tokio::test(start_paused = true)]
async fn test_publish_capacity_exhausted_returns_no_mem() {
    // Arrange
    let limits = Limits {
        max_outgoing_publishes: 1,
        ..test_limits()
    };
    let harness = Harness::connected_with(MockBrokerSettings::default(), limits, 0).await;
    harness.broker.drop_acks([true]);
    let first = harness
        .engine
        .publish_async(harness.id, PublishRequest::new("a", "1", QoS::AtLeastOnce))
        .await
        .unwrap();

    // Act
    let second = harness
        .engine
        .publish_async(harness.id, PublishRequest::new("a", "2", QoS::AtLeastOnce))
        .await;

    // Assert
    assert!(matches!(second, Err(MqttError::NoMem { .. })));
    // QoS 0 is not tracked and is unaffected
    harness
        .engine
        .publish(harness.id, PublishRequest::new("a", "0", QoS::AtMostOnce))
        .await
        .unwrap();
    first.await.unwrap();
    harness
        .engine
        .publish(harness.id, PublishRequest::new("a", "3", QoS::AtLeastOnce))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_disconnect_fails_every_inflight_request() {
    // Arrange
    let harness = Harness::connected().await;
    harness.broker.drop_acks([true, true]);
    let first = harness
        .engine
        .publish_async(harness.id, PublishRequest::new("a", "1", QoS::AtLeastOnce))
        .await
        .unwrap();
    let second = harness
        .engine
        .publish_async(harness.id, PublishRequest::new("b", "2", QoS::ExactlyOnce))
        .await
        .unwrap();
    assert_eq!(harness.engine.inflight(harness.id).unwrap(), 2);

    // Act
    harness.engine.disconnect(harness.id).await.unwrap();

    // Assert
    assert!(matches!(first.await, Err(MqttError::PublishFail { .. })));
    assert!(matches!(second.await, Err(MqttError::PublishFail { .. })));
}

#[tokio::test]
async fn test_invalid_publish_topics_are_rejected() {
    let harness = Harness::connected().await;

    for topic in ["", "sensors/+", "sensors/#", "bad\0topic"] {
        let result = harness
            .engine
            .publish(harness.id, PublishRequest::new(topic, "x", QoS::AtMostOnce))
            .await;
        assert!(
            matches!(result, Err(MqttError::BadArg { .. })),
            "topic {topic:?} produced {result:?}"
        );
    }
    assert!(harness.broker.publishes_received().is_empty());
}

#[tokio::test]
async fn test_inbound_messages_keep_broker_order() {
    // Arrange
    let harness = Harness::connected().await;
    harness
        .engine
        .subscribe(harness.id, vec![Subscription::new("seq/#", QoS::AtLeastOnce)])
        .await
        .unwrap();

    // Act
    for i in 0..20 {
        harness
            .broker
            .inject_publish(&format!("seq/{i}"), format!("{i}"), QoS::AtLeastOnce);
    }

    // Assert
    assert!(harness.events.wait_for_count(20, WAIT).await);
    let expected: Vec<String> = (0..20).map(|i| format!("seq/{i}")).collect();
    assert_eq!(harness.events.topics(), expected);
    assert!(
        harness
            .broker
            .wait_for(
                |packets| packets
                    .iter()
                    .filter(|p| matches!(p, Packet::PubAck(_)))
                    .count()
                    == 20,
                WAIT
            )
            .await
    );
    assert!(harness
        .events
        .events()
        .iter()
        .all(|event| matches!(event, MqttEvent::SubscriptionMessage(_))));
}
