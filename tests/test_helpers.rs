//! Test helpers and utilities for integration tests

use mqtt_engine::testing::{MockBroker, MockBrokerSettings};
use mqtt_engine::{
    BrokerInfo, ConnectInfo, EventCallback, HandleConfig, HandleId, Limits, MqttEngine,
    MqttEvent,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Limits small enough to exercise capacity errors and fast retries
#[allow(dead_code)]
pub fn test_limits() -> Limits {
    Limits {
        max_handles: 2,
        max_outgoing_publishes: 4,
        max_outgoing_subscribes: 2,
        ack_receive_timeout_ms: 200,
        message_send_timeout_ms: 200,
        message_receive_timeout_ms: 100,
        max_retry: 3,
        ..Limits::default()
    }
}

#[allow(dead_code)]
pub fn test_broker() -> BrokerInfo {
    BrokerInfo::new("mock-broker", 1883)
}

/// Records every event delivered to it, in delivery order
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<MqttEvent>>>,
}

#[allow(dead_code)]
impl EventLog {
    pub fn callback(&self) -> Arc<dyn EventCallback> {
        let events = Arc::clone(&self.events);
        Arc::new(move |_: HandleId, event: &MqttEvent| {
            events.lock().unwrap().push(event.clone());
        })
    }

    pub fn events(&self) -> Vec<MqttEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn topics(&self) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|event| event.message().map(|m| m.topic.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    /// Poll until at least `count` events arrived
    pub async fn wait_for_count(&self, count: usize, timeout: Duration) -> bool {
        let waiting = async {
            while self.len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(timeout, waiting).await.is_ok()
    }
}

/// An engine wired to a mock broker with one connected handle
#[allow(dead_code)]
pub struct Harness {
    pub engine: Arc<MqttEngine>,
    pub broker: MockBroker,
    pub id: HandleId,
    pub events: EventLog,
}

#[allow(dead_code)]
impl Harness {
    /// Connect with default settings and keepalive disabled
    pub async fn connected() -> Self {
        Self::connected_with(MockBrokerSettings::default(), test_limits(), 0).await
    }

    pub async fn connected_with(
        settings: MockBrokerSettings,
        limits: Limits,
        keepalive_secs: u16,
    ) -> Self {
        let broker = MockBroker::with_settings(settings);
        let engine = Arc::new(MqttEngine::new(limits, broker.connector()).unwrap());
        let id = engine
            .create(HandleConfig::new("test-handle", test_broker()))
            .unwrap();
        let events = EventLog::default();
        engine.register(id, events.callback()).unwrap();
        engine
            .connect(id, ConnectInfo::new("test-client").with_keepalive(keepalive_secs))
            .await
            .unwrap();
        Self {
            engine,
            broker,
            id,
            events,
        }
    }
}
