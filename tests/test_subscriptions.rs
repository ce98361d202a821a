//! Subscription tests
//!
//! Per-filter grant results, routing of inbound messages to handle and
//! per-subscription callbacks, and exactly-once inbound delivery.

mod test_helpers;

use mqtt_engine::protocol::packet::{PubComp, PubRec};
use mqtt_engine::protocol::{Packet, Publish};
use mqtt_engine::testing::MockBrokerSettings;
use mqtt_engine::{
    ConnectInfo, FilterOutcome, MqttError, MqttEvent, PublishRequest, QoS, Subscription,
};
use std::time::Duration;
use test_helpers::{test_limits, EventLog, Harness};

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_subscribe_reports_each_filter_and_skips_rejected() {
    // Arrange
    let settings = MockBrokerSettings {
        reject_filters: vec!["secret/#".into()],
        max_granted_qos: QoS::AtLeastOnce,
        ..Default::default()
    };
    let harness = Harness::connected_with(settings, test_limits(), 0).await;

    // Act
    let results = harness
        .engine
        .subscribe(
            harness.id,
            vec![
                Subscription::new("sensors/#", QoS::ExactlyOnce),
                Subscription::new("secret/#", QoS::AtLeastOnce),
                Subscription::new("status/+", QoS::AtMostOnce),
            ],
        )
        .await
        .unwrap();

    // Assert: results follow request order
    let outcomes: Vec<(&str, FilterOutcome)> = results
        .iter()
        .map(|r| (r.filter.as_str(), r.outcome))
        .collect();
    assert_eq!(
        outcomes,
        vec![
            ("sensors/#", FilterOutcome::Granted(QoS::AtLeastOnce)),
            ("secret/#", FilterOutcome::Rejected),
            ("status/+", FilterOutcome::Granted(QoS::AtMostOnce)),
        ]
    );
    let handle = harness.engine.lookup(harness.id).unwrap();
    assert_eq!(handle.subscription_count(), 2);

    // a message for the rejected filter is not delivered; the next one is
    harness
        .broker
        .inject_publish("secret/plans", "x", QoS::AtMostOnce);
    harness
        .broker
        .inject_publish("sensors/1/temp", "21.5", QoS::AtLeastOnce);
    assert!(harness.events.wait_for_count(1, WAIT).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.events.topics(), vec!["sensors/1/temp".to_string()]);
}

#[tokio::test]
async fn test_subscription_handler_overrides_handle_callback() {
    // Arrange
    let harness = Harness::connected().await;
    let alerts = EventLog::default();
    harness
        .engine
        .subscribe(
            harness.id,
            vec![
                Subscription::new("alerts/#", QoS::AtLeastOnce).with_handler(alerts.callback()),
                Subscription::new("logs/#", QoS::AtMostOnce),
            ],
        )
        .await
        .unwrap();

    // Act
    harness.broker.inject_publish("alerts/fire", "!", QoS::AtLeastOnce);
    harness.broker.inject_publish("logs/app", "started", QoS::AtMostOnce);

    // Assert
    assert!(alerts.wait_for_count(1, WAIT).await);
    assert!(harness.events.wait_for_count(1, WAIT).await);
    assert_eq!(alerts.topics(), vec!["alerts/fire".to_string()]);
    assert_eq!(harness.events.topics(), vec!["logs/app".to_string()]);
    match &alerts.events()[0] {
        MqttEvent::SubscriptionMessage(message) => {
            assert_eq!(message.payload_str(), Some("!"));
            assert_eq!(message.qos, QoS::AtLeastOnce);
        }
        other => panic!("expected subscription message, got {other:?}"),
    }
}

#[tokio::test]
async fn test_own_publish_is_echoed_to_matching_subscription() {
    let harness = Harness::connected().await;
    harness
        .engine
        .subscribe(harness.id, vec![Subscription::new("echo/+", QoS::AtLeastOnce)])
        .await
        .unwrap();

    harness
        .engine
        .publish(harness.id, PublishRequest::new("echo/1", "ping", QoS::AtLeastOnce))
        .await
        .unwrap();

    assert!(harness.events.wait_for_count(1, WAIT).await);
    assert_eq!(harness.events.topics(), vec!["echo/1".to_string()]);
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    // Arrange
    let harness = Harness::connected().await;
    harness
        .engine
        .subscribe(
            harness.id,
            vec![
                Subscription::new("a/#", QoS::AtMostOnce),
                Subscription::new("b/#", QoS::AtMostOnce),
            ],
        )
        .await
        .unwrap();

    // Act
    harness
        .engine
        .unsubscribe(harness.id, vec!["a/#".to_string()])
        .await
        .unwrap();
    harness.broker.inject_publish("a/1", "x", QoS::AtMostOnce);
    harness.broker.inject_publish("b/1", "y", QoS::AtMostOnce);

    // Assert
    assert!(harness.events.wait_for_count(1, WAIT).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.events.topics(), vec!["b/1".to_string()]);
    assert_eq!(
        harness.engine.lookup(harness.id).unwrap().subscription_count(),
        1
    );
}

#[tokio::test]
async fn test_inbound_qos2_duplicate_is_delivered_once() {
    // Arrange
    let harness = Harness::connected().await;
    harness
        .engine
        .subscribe(harness.id, vec![Subscription::new("pay/#", QoS::ExactlyOnce)])
        .await
        .unwrap();
    let mut publish = Publish {
        dup: false,
        qos: QoS::ExactlyOnce,
        retain: false,
        topic: "pay/1".into(),
        pkid: 9,
        payload: "42".into(),
    };

    // Act: the broker resends before the client's PUBREC arrives
    harness
        .broker
        .send_to_client(&Packet::Publish(publish.clone()));
    publish.dup = true;
    harness.broker.send_to_client(&Packet::Publish(publish));

    // Assert: both copies are acknowledged, the broker's PUBREL completes the flow
    assert!(
        harness
            .broker
            .wait_for(
                |packets| {
                    let recs = packets
                        .iter()
                        .filter(|p| **p == Packet::PubRec(PubRec::new(9)))
                        .count();
                    recs == 2 && packets.contains(&Packet::PubComp(PubComp::new(9)))
                },
                WAIT
            )
            .await
    );
    assert!(harness.events.wait_for_count(1, WAIT).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.events.len(), 1);
}

#[tokio::test]
async fn test_resumed_session_delivers_unmatched_as_publish_event() {
    // Arrange: broker reports a stored session from an earlier connection
    let broker = mqtt_engine::testing::MockBroker::with_settings(MockBrokerSettings {
        session_present: true,
        ..Default::default()
    });
    let engine = mqtt_engine::MqttEngine::new(test_limits(), broker.connector()).unwrap();
    let id = engine
        .create(mqtt_engine::HandleConfig::new(
            "resumed",
            test_helpers::test_broker(),
        ))
        .unwrap();
    let events = EventLog::default();
    engine.register(id, events.callback()).unwrap();
    let outcome = engine
        .connect(
            id,
            ConnectInfo::new("persistent-client")
                .with_clean_session(false)
                .with_keepalive(0),
        )
        .await
        .unwrap();
    assert!(outcome.session_present);

    // Act
    broker.inject_publish("old/subscription", "queued", QoS::AtLeastOnce);

    // Assert
    assert!(events.wait_for_count(1, WAIT).await);
    assert!(matches!(&events.events()[0], MqttEvent::Publish(m) if m.topic == "old/subscription"));
}

#[tokio::test]
async fn test_subscribe_argument_errors() {
    let harness = Harness::connected().await;

    let empty = harness.engine.subscribe(harness.id, Vec::new()).await;
    assert!(matches!(empty, Err(MqttError::BadArg { .. })));

    let bad_filter = harness
        .engine
        .subscribe(harness.id, vec![Subscription::new("a/#/b", QoS::AtMostOnce)])
        .await;
    assert!(matches!(bad_filter, Err(MqttError::BadArg { .. })));

    let empty_unsubscribe = harness.engine.unsubscribe(harness.id, Vec::new()).await;
    assert!(matches!(empty_unsubscribe, Err(MqttError::BadArg { .. })));

    assert!(harness
        .broker
        .received()
        .iter()
        .all(|p| !matches!(p, Packet::Subscribe(_) | Packet::Unsubscribe(_))));
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_capacity_shared_with_unsubscribe() {
    // Arrange: two subscribe/unsubscribe slots, acks withheld
    let harness = Harness::connected().await;
    harness.broker.drop_acks([true, true]);
    let subscribe = harness
        .engine
        .subscribe_async(harness.id, vec![Subscription::new("x/#", QoS::AtMostOnce)])
        .await
        .unwrap();
    let unsubscribe = harness
        .engine
        .unsubscribe_async(harness.id, vec!["y/#".to_string()])
        .await
        .unwrap();

    // Act
    let third = harness
        .engine
        .subscribe_async(harness.id, vec![Subscription::new("z/#", QoS::AtMostOnce)])
        .await;

    // Assert
    assert!(matches!(third, Err(MqttError::NoMem { .. })));
    assert!(subscribe.await.unwrap()[0].is_granted());
    unsubscribe.await.unwrap();
}
