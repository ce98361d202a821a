//! MQTT Engine - Rust Implementation
//!
//! A multi-handle MQTT 3.1.1 client engine for constrained network stacks.
//!
//! # Overview
//!
//! This crate provides:
//! - A fixed-capacity handle table of independently connectable clients
//! - A per-handle connection state machine with classified disconnects
//! - QoS 1 and QoS 2 delivery tracking with bounded retransmission
//! - Keepalive probing on its own scheduler
//! - Ordered event dispatch to application callbacks off the network path
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use mqtt_engine::{
//!     BrokerInfo, ConnectInfo, HandleConfig, HandleId, Limits, MqttEngine, MqttEvent, QoS,
//!     Subscription, TcpConnector,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> mqtt_engine::MqttResult<()> {
//! let engine = MqttEngine::new(Limits::default(), Arc::new(TcpConnector::new()))?;
//! let id = engine.create(HandleConfig::new("demo", BrokerInfo::new("localhost", 1883)))?;
//!
//! engine.register(id, Arc::new(|handle: HandleId, event: &MqttEvent| {
//!     println!("{handle}: {}", event.kind());
//! }))?;
//! engine.connect(id, ConnectInfo::new("demo-client")).await?;
//!
//! let results = engine
//!     .subscribe(id, vec![Subscription::new("sensors/#", QoS::AtLeastOnce)])
//!     .await?;
//! assert!(results.iter().all(|r| r.is_granted()));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use config::{BrokerInfo, EngineConfig, Limits, TlsSettings};
pub use engine::{
    BlockingClient, ClientHandle, ConnectInfo, ConnectOutcome, ConnectionState, Credentials,
    DisconnectEvent, DisconnectType, EventCallback, FilterOutcome, FilterResult, HandleConfig,
    HandleId, InboundMessage, MqttEngine, MqttEvent, PendingAck, PublishRequest, Subscription,
};
pub use error::{MqttError, MqttResult, ResultCode};
pub use protocol::{LastWill, Packet, QoS};
pub use transport::{Connector, TcpConnector, Transport, TransportError};
