//! The MQTT client engine
//!
//! [`MqttEngine`] owns a fixed-capacity table of [`ClientHandle`]s that share
//! one connector and one packet codec. Each handle connects independently;
//! operations on different handles never contend on a shared lock.
//!
//! ```no_run
//! use mqtt_engine::config::{BrokerInfo, Limits};
//! use mqtt_engine::engine::{ConnectInfo, HandleConfig, MqttEngine, PublishRequest};
//! use mqtt_engine::protocol::QoS;
//! use mqtt_engine::transport::TcpConnector;
//! use std::sync::Arc;
//!
//! # async fn example() -> mqtt_engine::error::MqttResult<()> {
//! let engine = MqttEngine::new(Limits::default(), Arc::new(TcpConnector::new()))?;
//! let id = engine.create(HandleConfig::new("sensor-1", BrokerInfo::new("localhost", 1883)))?;
//! engine.connect(id, ConnectInfo::new("sensor-1")).await?;
//! engine
//!     .publish(id, PublishRequest::new("sensors/1/temp", "21.5", QoS::AtLeastOnce))
//!     .await?;
//! engine.disconnect(id).await?;
//! engine.delete(id).await?;
//! # Ok(())
//! # }
//! ```

pub mod blocking;
mod client;
mod dispatcher;
mod handle_table;
mod keepalive;
mod session;
mod state;
mod subscriptions;
mod tracker;

pub use blocking::BlockingClient;
pub use client::{
    ClientHandle, ConnectInfo, ConnectOutcome, Credentials, PublishRequest, Subscription,
    MAX_CLIENT_ID_LEN,
};
pub use dispatcher::{DisconnectEvent, EventCallback, InboundMessage, MqttEvent};
pub use handle_table::{HandleId, HandleTable};
pub use keepalive::{KeepaliveAction, KeepaliveTimer};
pub use state::{ConnectionState, DisconnectCause, DisconnectType, StateEvent, StateMachine};
pub use tracker::{
    Completion, DeliveryTracker, FilterOutcome, FilterResult, PendingAck, RequestKind,
    RequestState,
};

use crate::config::{validate_descriptor, BrokerInfo, EngineConfig, Limits};
use crate::error::{MqttError, MqttResult};
use crate::observability::metrics::metrics;
use crate::protocol::codec::{Mqtt311Codec, PacketCodec};
use crate::transport::{Connector, TcpConnector};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, Instrument};

/// Per-handle settings fixed at creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleConfig {
    /// Short name, unique among live handles
    pub descriptor: String,
    pub broker: BrokerInfo,
}

impl HandleConfig {
    pub fn new(descriptor: impl Into<String>, broker: BrokerInfo) -> Self {
        Self {
            descriptor: descriptor.into(),
            broker,
        }
    }
}

pub struct MqttEngine {
    limits: Limits,
    connector: Arc<dyn Connector>,
    codec: Arc<dyn PacketCodec>,
    handles: HandleTable<ClientHandle>,
    /// Serializes descriptor uniqueness checks with slot allocation
    create_lock: Mutex<()>,
    initialized: AtomicBool,
}

impl MqttEngine {
    pub fn new(limits: Limits, connector: Arc<dyn Connector>) -> MqttResult<Self> {
        limits
            .validate()
            .map_err(|e| MqttError::bad_arg(e.to_string()))?;
        info!(
            max_handles = limits.max_handles,
            max_outgoing_publishes = limits.max_outgoing_publishes,
            max_retry = limits.max_retry,
            "MQTT engine initialized"
        );
        Ok(Self {
            codec: Arc::new(Mqtt311Codec::new(limits.max_packet_size)),
            handles: HandleTable::with_capacity(limits.max_handles),
            limits,
            connector,
            create_lock: Mutex::new(()),
            initialized: AtomicBool::new(true),
        })
    }

    /// Engine over TCP, with TLS for brokers that configure it, and the limits from `config`
    pub fn from_config(config: &EngineConfig) -> MqttResult<Self> {
        Self::new(config.limits.clone(), Arc::new(TcpConnector::new()))
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn ensure_initialized(&self) -> MqttResult<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(MqttError::NotInitialized)
        }
    }

    /// Allocate a handle in `Init` state.
    ///
    /// Fails with `NoMem` when the table is full and `BadArg` for an invalid
    /// or already used descriptor or an invalid broker.
    pub fn create(&self, config: HandleConfig) -> MqttResult<HandleId> {
        self.ensure_initialized()?;
        validate_descriptor(&config.descriptor).map_err(|e| MqttError::bad_arg(e.to_string()))?;
        config
            .broker
            .validate()
            .map_err(|e| MqttError::bad_arg(e.to_string()))?;

        let _creating = self
            .create_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.find_live(&config.descriptor).is_some() {
            return Err(MqttError::bad_arg(format!(
                "descriptor '{}' is already in use",
                config.descriptor
            )));
        }

        let HandleConfig { descriptor, broker } = config;
        let id = self.handles.insert_with(|id| {
            Ok(ClientHandle::new(
                id,
                descriptor.clone(),
                broker.clone(),
                self.limits.clone(),
                Arc::clone(&self.connector),
                Arc::clone(&self.codec),
            ))
        })?;
        metrics().record_handle_created();
        info!(handle = %id, descriptor = %descriptor, broker = %broker, "Handle created");
        Ok(id)
    }

    /// Release a handle. It must be in `Init`; its id never resolves again.
    pub async fn delete(&self, id: HandleId) -> MqttResult<()> {
        self.ensure_initialized()?;
        self.remove(id).await
    }

    async fn remove(&self, id: HandleId) -> MqttResult<()> {
        let handle = self.handles.remove_if(id, |handle| {
            handle
                .transition(StateEvent::Deleted)
                .map(|_| ())
                .map_err(|state| MqttError::NotDisconnected { state })
        })?;
        handle.close_dispatcher().await;
        metrics().record_handle_deleted();
        info!(handle = %id, descriptor = %handle.descriptor(), "Handle deleted");
        Ok(())
    }

    pub fn lookup(&self, id: HandleId) -> MqttResult<Arc<ClientHandle>> {
        self.ensure_initialized()?;
        self.handles.get(id)
    }

    /// Id of the live handle named `descriptor`
    pub fn find(&self, descriptor: &str) -> MqttResult<HandleId> {
        self.ensure_initialized()?;
        self.find_live(descriptor).ok_or(MqttError::HandleNotFound)
    }

    fn find_live(&self, descriptor: &str) -> Option<HandleId> {
        self.handles
            .entries()
            .into_iter()
            .find(|(_, handle)| handle.descriptor() == descriptor)
            .map(|(id, _)| id)
    }

    /// Ids of every live handle
    pub fn handles(&self) -> Vec<HandleId> {
        self.handles.entries().into_iter().map(|(id, _)| id).collect()
    }

    pub async fn connect(&self, id: HandleId, info: ConnectInfo) -> MqttResult<ConnectOutcome> {
        let handle = self.lookup(id)?;
        let span = crate::handle_span!(handle = %id, descriptor = %handle.descriptor());
        handle.connect(info).instrument(span).await
    }

    pub async fn disconnect(&self, id: HandleId) -> MqttResult<()> {
        self.lookup(id)?.disconnect().await
    }

    pub async fn publish(&self, id: HandleId, request: PublishRequest) -> MqttResult<()> {
        self.lookup(id)?.publish(request).await
    }

    pub async fn publish_async(
        &self,
        id: HandleId,
        request: PublishRequest,
    ) -> MqttResult<PendingAck<()>> {
        self.lookup(id)?.publish_async(request).await
    }

    pub async fn subscribe(
        &self,
        id: HandleId,
        subscriptions: Vec<Subscription>,
    ) -> MqttResult<Vec<FilterResult>> {
        self.lookup(id)?.subscribe(subscriptions).await
    }

    pub async fn subscribe_async(
        &self,
        id: HandleId,
        subscriptions: Vec<Subscription>,
    ) -> MqttResult<PendingAck<Vec<FilterResult>>> {
        self.lookup(id)?.subscribe_async(subscriptions).await
    }

    pub async fn unsubscribe(&self, id: HandleId, filters: Vec<String>) -> MqttResult<()> {
        self.lookup(id)?.unsubscribe(filters).await
    }

    pub async fn unsubscribe_async(
        &self,
        id: HandleId,
        filters: Vec<String>,
    ) -> MqttResult<PendingAck<()>> {
        self.lookup(id)?.unsubscribe_async(filters).await
    }

    pub fn register(&self, id: HandleId, callback: Arc<dyn EventCallback>) -> MqttResult<()> {
        self.lookup(id)?.register(callback)
    }

    pub fn deregister(&self, id: HandleId) -> MqttResult<()> {
        self.lookup(id)?.deregister()
    }

    pub fn start_keepalive(&self, id: HandleId, interval_secs: u16) -> MqttResult<()> {
        self.lookup(id)?.start_keepalive(interval_secs)
    }

    pub fn stop_keepalive(&self, id: HandleId) -> MqttResult<()> {
        self.lookup(id)?.stop_keepalive()
    }

    pub fn state(&self, id: HandleId) -> MqttResult<ConnectionState> {
        Ok(self.lookup(id)?.state())
    }

    pub fn inflight(&self, id: HandleId) -> MqttResult<usize> {
        Ok(self.lookup(id)?.inflight())
    }

    /// Disconnect and delete every handle; later calls fail with
    /// `NotInitialized`.
    ///
    /// Handles that were connected raise a `UserRequested` disconnect event
    /// before their dispatcher drains.
    pub async fn shutdown(&self) -> MqttResult<()> {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return Err(MqttError::NotInitialized);
        }
        let entries = self.handles.entries();
        info!(handles = entries.len(), "Shutting down MQTT engine");
        for (id, handle) in entries {
            if let Err(e) = handle.shutdown().await {
                debug!(handle = %id, "No session to close: {}", e);
            }
            if let Err(e) = self.remove(id).await {
                debug!(handle = %id, "Handle already released: {}", e);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for MqttEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttEngine")
            .field("limits", &self.limits)
            .field("handles", &self.handles.len())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
