//! Engine-level tests: handle allocation, lookup, callbacks, shutdown and the
//! blocking facade.

mod test_helpers;

use mqtt_engine::protocol::Packet;
use mqtt_engine::testing::MockBroker;
use mqtt_engine::{
    BlockingClient, ConnectInfo, ConnectionState, DisconnectType, HandleConfig, Limits,
    MqttEngine, MqttError, MqttEvent, PublishRequest, QoS, Subscription,
};
use std::sync::Arc;
use test_helpers::{test_broker, test_limits, EventLog};

fn engine() -> (MqttEngine, MockBroker) {
    let broker = MockBroker::new();
    let engine = MqttEngine::new(test_limits(), broker.connector()).unwrap();
    (engine, broker)
}

#[test]
fn test_invalid_limits_are_rejected() {
    let broker = MockBroker::new();
    let limits = Limits {
        max_handles: 0,
        ..Limits::default()
    };

    let result = MqttEngine::new(limits, broker.connector());

    assert!(matches!(result, Err(MqttError::BadArg { .. })));
}

#[test]
fn test_handle_table_exhaustion_returns_no_mem() {
    // Arrange: test limits allow two handles
    let (engine, _broker) = engine();
    engine.create(HandleConfig::new("one", test_broker())).unwrap();
    engine.create(HandleConfig::new("two", test_broker())).unwrap();

    // Act
    let result = engine.create(HandleConfig::new("three", test_broker()));

    // Assert
    assert!(matches!(result, Err(MqttError::NoMem { .. })));
    assert_eq!(engine.handles().len(), 2);
}

#[test]
fn test_descriptor_rules() {
    let (engine, _broker) = engine();
    engine.create(HandleConfig::new("sensor-1", test_broker())).unwrap();

    let cases = vec![
        "sensor-1",                   // duplicate
        "",                           // empty
        "has space",                  // bad character
        "a-descriptor-that-is-too-long", // over 20 characters
    ];
    for descriptor in cases {
        let result = engine.create(HandleConfig::new(descriptor, test_broker()));
        assert!(
            matches!(result, Err(MqttError::BadArg { .. })),
            "descriptor {descriptor:?} produced {result:?}"
        );
    }
}

#[test]
fn test_find_by_descriptor() {
    let (engine, _broker) = engine();
    let first = engine.create(HandleConfig::new("first", test_broker())).unwrap();
    let second = engine.create(HandleConfig::new("second", test_broker())).unwrap();

    assert_eq!(engine.find("first").unwrap(), first);
    assert_eq!(engine.find("second").unwrap(), second);
    assert!(matches!(engine.find("third"), Err(MqttError::HandleNotFound)));
    assert_eq!(engine.lookup(first).unwrap().descriptor(), "first");
}

#[tokio::test]
async fn test_deleted_id_never_resolves_again() {
    // Arrange
    let (engine, _broker) = engine();
    let old = engine.create(HandleConfig::new("reused", test_broker())).unwrap();
    engine.delete(old).await.unwrap();

    // Act: the freed slot is reused
    let new = engine.create(HandleConfig::new("reused", test_broker())).unwrap();

    // Assert
    assert_ne!(old, new);
    assert!(matches!(engine.lookup(old), Err(MqttError::HandleNotFound)));
    assert!(matches!(engine.delete(old).await, Err(MqttError::InvalidHandle)));
    assert!(matches!(
        engine.connect(old, ConnectInfo::new("ghost")).await,
        Err(MqttError::HandleNotFound)
    ));
    assert_eq!(engine.state(new).unwrap(), ConnectionState::Init);
}

#[test]
fn test_register_is_exclusive_and_deregister_is_idempotent() {
    let (engine, _broker) = engine();
    let id = engine.create(HandleConfig::new("cb", test_broker())).unwrap();
    let log = EventLog::default();

    engine.register(id, log.callback()).unwrap();
    let second = engine.register(id, log.callback());
    assert!(matches!(second, Err(MqttError::BadArg { .. })));

    engine.deregister(id).unwrap();
    engine.deregister(id).unwrap();
    assert!(!engine.lookup(id).unwrap().has_callback());
}

#[tokio::test]
async fn test_handles_are_independent() {
    // Arrange
    let (engine, broker_a) = engine();
    let engine = Arc::new(engine);
    let a = engine.create(HandleConfig::new("a", test_broker())).unwrap();
    let b = engine.create(HandleConfig::new("b", test_broker())).unwrap();

    // Act
    engine
        .connect(a, ConnectInfo::new("client-a").with_keepalive(0))
        .await
        .unwrap();

    // Assert
    assert_eq!(engine.state(a).unwrap(), ConnectionState::Connected);
    assert_eq!(engine.state(b).unwrap(), ConnectionState::Init);
    assert!(matches!(
        engine
            .publish(b, PublishRequest::new("t", "x", QoS::AtMostOnce))
            .await,
        Err(MqttError::NotConnected { .. })
    ));
    assert_eq!(broker_a.connections(), 1);
}

#[tokio::test]
async fn test_shutdown_disconnects_and_reports_user_requested() {
    // Arrange
    let (engine, broker) = engine();
    let id = engine.create(HandleConfig::new("live", test_broker())).unwrap();
    let idle = engine.create(HandleConfig::new("idle", test_broker())).unwrap();
    let events = EventLog::default();
    engine.register(id, events.callback()).unwrap();
    engine
        .connect(id, ConnectInfo::new("live-client").with_keepalive(0))
        .await
        .unwrap();

    // Act
    engine.shutdown().await.unwrap();

    // Assert: queued events are drained before shutdown returns
    let delivered = events.events();
    assert_eq!(delivered.len(), 1);
    match &delivered[0] {
        MqttEvent::Disconnect(event) => assert_eq!(event.kind, DisconnectType::UserRequested),
        other => panic!("expected disconnect event, got {other:?}"),
    }
    assert_eq!(
        broker.count_received(|p| matches!(p, Packet::Disconnect)),
        1
    );
    assert!(!engine.is_initialized());
    assert!(matches!(engine.lookup(idle), Err(MqttError::NotInitialized)));
    assert!(matches!(
        engine.create(HandleConfig::new("late", test_broker())),
        Err(MqttError::NotInitialized)
    ));
    assert!(matches!(engine.shutdown().await, Err(MqttError::NotInitialized)));
}

#[test]
fn test_blocking_client_round_trip() {
    // Arrange
    let broker = MockBroker::new();
    let client = BlockingClient::new(test_limits(), broker.connector()).unwrap();
    let id = client
        .create(HandleConfig::new("blocking", test_broker()))
        .unwrap();
    let events = EventLog::default();
    client.register(id, events.callback()).unwrap();

    // Act
    let outcome = client
        .connect(id, ConnectInfo::new("blocking-client").with_keepalive(0))
        .unwrap();
    let results = client
        .subscribe(id, vec![Subscription::new("loop/#", QoS::AtLeastOnce)])
        .unwrap();
    client
        .publish(id, PublishRequest::new("loop/1", "hello", QoS::ExactlyOnce))
        .unwrap();
    client.unsubscribe(id, vec!["loop/#".to_string()]).unwrap();
    client.disconnect(id).unwrap();
    client.delete(id).unwrap();

    // Assert
    assert!(!outcome.session_present);
    assert!(results[0].is_granted());
    assert_eq!(client.engine().handles().len(), 0);
    // delete drains the dispatcher, so the echoed message has been delivered
    assert_eq!(events.topics(), vec!["loop/1".to_string()]);
    client.shutdown().unwrap();
}
