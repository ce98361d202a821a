//! Synchronous facade over [`MqttEngine`]
//!
//! For callers without an async runtime. The client owns a multi-threaded
//! tokio runtime that keeps session tasks and dispatch workers running
//! between calls; each method blocks the calling thread on the matching
//! engine future. Must not be used from inside another tokio runtime.

use super::{
    ConnectInfo, ConnectOutcome, ConnectionState, EventCallback, FilterResult, HandleConfig,
    HandleId, MqttEngine, PublishRequest, Subscription,
};
use crate::config::Limits;
use crate::error::{MqttError, MqttResult};
use crate::transport::Connector;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Runtime;

pub struct BlockingClient {
    runtime: Runtime,
    engine: Arc<MqttEngine>,
}

impl BlockingClient {
    pub fn new(limits: Limits, connector: Arc<dyn Connector>) -> MqttResult<Self> {
        let engine = Arc::new(MqttEngine::new(limits, connector)?);
        Self::from_engine(engine)
    }

    /// Drive an existing engine from its own runtime
    pub fn from_engine(engine: Arc<MqttEngine>) -> MqttResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .worker_threads(2)
            .thread_name("mqtt-engine-worker")
            .build()
            .map_err(|e| MqttError::Other {
                reason: format!("failed to start runtime: {e}"),
            })?;
        Ok(Self { runtime, engine })
    }

    pub fn engine(&self) -> &Arc<MqttEngine> {
        &self.engine
    }

    fn run<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    pub fn create(&self, config: HandleConfig) -> MqttResult<HandleId> {
        self.engine.create(config)
    }

    pub fn delete(&self, id: HandleId) -> MqttResult<()> {
        self.run(self.engine.delete(id))
    }

    pub fn connect(&self, id: HandleId, info: ConnectInfo) -> MqttResult<ConnectOutcome> {
        self.run(self.engine.connect(id, info))
    }

    pub fn disconnect(&self, id: HandleId) -> MqttResult<()> {
        self.run(self.engine.disconnect(id))
    }

    /// Blocks until the publish completes, fails or exhausts its retries
    pub fn publish(&self, id: HandleId, request: PublishRequest) -> MqttResult<()> {
        self.run(self.engine.publish(id, request))
    }

    pub fn subscribe(
        &self,
        id: HandleId,
        subscriptions: Vec<Subscription>,
    ) -> MqttResult<Vec<FilterResult>> {
        self.run(self.engine.subscribe(id, subscriptions))
    }

    pub fn unsubscribe(&self, id: HandleId, filters: Vec<String>) -> MqttResult<()> {
        self.run(self.engine.unsubscribe(id, filters))
    }

    pub fn register(&self, id: HandleId, callback: Arc<dyn EventCallback>) -> MqttResult<()> {
        self.engine.register(id, callback)
    }

    pub fn deregister(&self, id: HandleId) -> MqttResult<()> {
        self.engine.deregister(id)
    }

    pub fn start_keepalive(&self, id: HandleId, interval_secs: u16) -> MqttResult<()> {
        self.engine.start_keepalive(id, interval_secs)
    }

    pub fn stop_keepalive(&self, id: HandleId) -> MqttResult<()> {
        self.engine.stop_keepalive(id)
    }

    pub fn state(&self, id: HandleId) -> MqttResult<ConnectionState> {
        self.engine.state(id)
    }

    pub fn shutdown(&self) -> MqttResult<()> {
        self.run(self.engine.shutdown())
    }
}
