//! One logical MQTT client
//!
//! A [`ClientHandle`] lives in the engine's handle table for as long as the
//! handle exists. It owns the connection state, the broker endpoint, the
//! event dispatcher and, while connected, the current [`Session`].
//!
//! State lives in a `watch` channel so that a `disconnect` issued while a
//! connect is still in its handshake can be observed by the connecting task,
//! and so callers can wait for the handle to settle back in `Init`.

use super::dispatcher::{DisconnectEvent, Dispatcher, EventCallback, MqttEvent};
use super::handle_table::HandleId;
use super::session::{SendError, Session};
use super::state::{ConnectionState, DisconnectCause, DisconnectType, StateEvent, StateMachine};
use super::tracker::{FilterResult, PendingAck};
use crate::config::{BrokerInfo, Limits};
use crate::error::{MqttError, MqttResult};
use crate::observability::metrics::metrics;
use crate::protocol::codec::PacketCodec;
use crate::protocol::packet::{
    ConnAck, Connect, ConnectReturnCode, LastWill, Login, Packet, PacketExt, QoS,
};
use crate::protocol::topic::{validate_topic_filter, validate_topic_name};
use crate::transport::{Connector, Transport, TransportError};
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn, Instrument};

/// Longest client identifier accepted in CONNECT
pub const MAX_CLIENT_ID_LEN: usize = 65535;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

/// Parameters of one connect attempt
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectInfo {
    /// Generated from a UUID when empty
    pub client_id: String,
    pub clean_session: bool,
    /// 0 disables keepalive
    pub keepalive_secs: u16,
    pub credentials: Option<Credentials>,
    pub will: Option<LastWill>,
    /// Budget for the transport connect and the CONNACK wait together
    pub connect_timeout: Duration,
}

impl ConnectInfo {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            clean_session: true,
            keepalive_secs: 60,
            credentials: None,
            will: None,
            connect_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_keepalive(mut self, keepalive_secs: u16) -> Self {
        self.keepalive_secs = keepalive_secs;
        self
    }

    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    pub fn validate(&self) -> MqttResult<()> {
        if self.client_id.len() > MAX_CLIENT_ID_LEN {
            return Err(MqttError::bad_arg("client id too long"));
        }
        if self.client_id.is_empty() && !self.clean_session {
            return Err(MqttError::bad_arg(
                "an empty client id requires a clean session",
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(MqttError::bad_arg("connect timeout must be greater than zero"));
        }
        if let Some(will) = &self.will {
            validate_topic_name(&will.topic)?;
        }
        Ok(())
    }
}

/// Result of a successful connect
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectOutcome {
    /// Broker resumed a stored session
    pub session_present: bool,
    /// Identifier actually sent in CONNECT
    pub client_id: String,
    pub keepalive_secs: u16,
}

/// An application message to publish
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRequest {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl PublishRequest {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
        }
    }

    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// One filter of a subscribe request
#[derive(Clone)]
pub struct Subscription {
    pub filter: String,
    pub qos: QoS,
    /// Receives messages for this filter instead of the handle callback
    pub handler: Option<Arc<dyn EventCallback>>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("filter", &self.filter)
            .field("qos", &self.qos)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

impl Subscription {
    pub fn new(filter: impl Into<String>, qos: QoS) -> Self {
        Self {
            filter: filter.into(),
            qos,
            handler: None,
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn EventCallback>) -> Self {
        self.handler = Some(handler);
        self
    }
}

/// Resets a connecting handle to `Init` if the connect does not finish
struct ConnectGuard<'a> {
    client: &'a ClientHandle,
    armed: bool,
}

impl ConnectGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            metrics().record_connect_failure();
            let _ = self.client.transition(StateEvent::HandshakeFailed);
        }
    }
}

pub struct ClientHandle {
    id: HandleId,
    descriptor: String,
    broker: BrokerInfo,
    limits: Limits,
    connector: Arc<dyn Connector>,
    codec: Arc<dyn PacketCodec>,
    state: watch::Sender<ConnectionState>,
    session: Mutex<Option<Arc<Session>>>,
    last_connect: Mutex<Option<ConnectOutcome>>,
    dispatcher: Dispatcher,
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.id)
            .field("descriptor", &self.descriptor)
            .field("broker", &self.broker)
            .field("state", &self.state())
            .finish()
    }
}

impl ClientHandle {
    pub(crate) fn new(
        id: HandleId,
        descriptor: String,
        broker: BrokerInfo,
        limits: Limits,
        connector: Arc<dyn Connector>,
        codec: Arc<dyn PacketCodec>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Init);
        let dispatcher = Dispatcher::new(id, limits.event_queue_warn_depth);
        Self {
            id,
            descriptor,
            broker,
            limits,
            connector,
            codec,
            state,
            session: Mutex::new(None),
            last_connect: Mutex::new(None),
            dispatcher,
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn broker(&self) -> &BrokerInfo {
        &self.broker
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state changes, e.g. to wait for an unsolicited disconnect
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Outcome of the most recent successful connect
    pub fn last_connect(&self) -> Option<ConnectOutcome> {
        lock(&self.last_connect).clone()
    }

    /// Requests awaiting acknowledgement; 0 when not connected
    pub fn inflight(&self) -> usize {
        lock(&self.session)
            .as_ref()
            .map_or(0, |session| session.inflight())
    }

    /// Filters currently granted by the broker
    pub fn subscription_count(&self) -> usize {
        lock(&self.session)
            .as_ref()
            .map_or(0, |session| session.subscription_count())
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        lock(&self.session)
            .as_ref()
            .and_then(|session| session.keepalive_interval())
    }

    pub fn has_callback(&self) -> bool {
        self.dispatcher.has_callback()
    }

    /// Apply `event`; returns the previous state, or the unchanged current
    /// state when the event is not legal there
    pub(crate) fn transition(&self, event: StateEvent) -> Result<ConnectionState, ConnectionState> {
        let mut outcome = Err(ConnectionState::Init);
        self.state.send_if_modified(|state| match StateMachine::next_state(*state, event) {
            Some(next) => {
                StateMachine::log_state_transition(&self.descriptor, *state, next);
                outcome = Ok(*state);
                *state = next;
                true
            }
            None => {
                outcome = Err(*state);
                false
            }
        });
        outcome
    }

    async fn wait_until_idle(&self) {
        let mut changes = self.state.subscribe();
        let _ = changes
            .wait_for(|state| {
                matches!(
                    state,
                    ConnectionState::Init | ConnectionState::Deinitialized
                )
            })
            .await;
    }

    pub fn register(&self, callback: Arc<dyn EventCallback>) -> MqttResult<()> {
        if self.state() == ConnectionState::Deinitialized {
            return Err(MqttError::Closed);
        }
        if !self.dispatcher.register(callback) {
            return Err(MqttError::bad_arg("a callback is already registered"));
        }
        debug!(handle = %self.id, "Callback registered");
        Ok(())
    }

    /// Remove the handle callback; a no-op when none is registered
    pub fn deregister(&self) -> MqttResult<()> {
        if self.state() == ConnectionState::Deinitialized {
            return Err(MqttError::Closed);
        }
        if self.dispatcher.deregister() {
            debug!(handle = %self.id, "Callback deregistered");
        }
        Ok(())
    }

    /// Open the transport, exchange CONNECT/CONNACK and start the session.
    pub async fn connect(self: &Arc<Self>, info: ConnectInfo) -> MqttResult<ConnectOutcome> {
        info.validate()?;
        self.transition(StateEvent::ConnectRequested)
            .map_err(|state| match state {
                ConnectionState::Deinitialized => MqttError::Closed,
                _ => MqttError::AlreadyConnected,
            })?;
        self.dispatcher.ensure_started();
        metrics().record_connect_attempt();
        let mut guard = ConnectGuard {
            client: self,
            armed: true,
        };

        let mut changes = self.state.subscribe();
        let handshake = tokio::select! {
            result = self.handshake(&info) => result,
            _ = changes.wait_for(|state| *state == ConnectionState::Disconnecting) => {
                Err(MqttError::connect_fail("disconnect requested during connect"))
            }
        };
        let (transport, connack, client_id, buffered) = match handshake {
            Ok(parts) => parts,
            Err(e) => {
                warn!(handle = %self.id, broker = %self.broker, "Connect failed: {}", e);
                return Err(e);
            }
        };

        let session = Arc::new(Session::new(
            self.id,
            transport,
            Arc::clone(&self.codec),
            self.limits.clone(),
            connack.session_present,
        ));
        *lock(&self.session) = Some(Arc::clone(&session));
        if self.transition(StateEvent::HandshakeSucceeded).is_err() {
            lock(&self.session).take();
            session.terminate("disconnect requested during connect").await;
            return Err(MqttError::connect_fail("disconnect requested during connect"));
        }
        guard.disarm();

        if info.keepalive_secs > 0 {
            session.start_keepalive(Duration::from_secs(u64::from(info.keepalive_secs)));
        }
        self.spawn_session_tasks(&session, buffered);
        metrics().record_connect_success();

        let outcome = ConnectOutcome {
            session_present: connack.session_present,
            client_id,
            keepalive_secs: info.keepalive_secs,
        };
        info!(
            handle = %self.id,
            broker = %self.broker,
            client_id = %outcome.client_id,
            session_present = outcome.session_present,
            "Connected"
        );
        *lock(&self.last_connect) = Some(outcome.clone());
        Ok(outcome)
    }

    async fn handshake(
        &self,
        info: &ConnectInfo,
    ) -> MqttResult<(Arc<dyn Transport>, ConnAck, String, BytesMut)> {
        let deadline = Instant::now() + info.connect_timeout;
        let transport: Arc<dyn Transport> = self
            .connector
            .connect(&self.broker, info.connect_timeout)
            .await
            .map_err(|e| MqttError::connect_fail(e.to_string()))?
            .into();

        let result = self.exchange_connect(transport.as_ref(), info, deadline).await;
        let checked = result.and_then(|(connack, client_id, buffered)| {
            connack_result(connack.code)?;
            Ok((connack, client_id, buffered))
        });
        match checked {
            Ok((connack, client_id, buffered)) => Ok((transport, connack, client_id, buffered)),
            Err(e) => {
                if let Err(close_error) = transport.close().await {
                    debug!(handle = %self.id, "Transport close failed: {}", close_error);
                }
                Err(e)
            }
        }
    }

    async fn exchange_connect(
        &self,
        transport: &dyn Transport,
        info: &ConnectInfo,
        deadline: Instant,
    ) -> MqttResult<(ConnAck, String, BytesMut)> {
        let client_id = if info.client_id.is_empty() {
            format!("mqtt-engine-{}", uuid::Uuid::new_v4().simple())
        } else {
            info.client_id.clone()
        };
        let mut connect = Connect::new(client_id.clone());
        connect.clean_session = info.clean_session;
        connect.keep_alive = info.keepalive_secs;
        connect.last_will = info.will.clone();
        // an empty password is left out of CONNECT
        connect.login = info.credentials.as_ref().map(|c| Login {
            username: c.username.clone(),
            password: c.password.clone().unwrap_or_default(),
        });
        let connect = Packet::Connect(connect);

        let mut outbound = BytesMut::new();
        self.codec.encode(&connect, &mut outbound)?;
        transport
            .send(&outbound, self.limits.send_timeout())
            .await
            .map_err(|e| MqttError::connect_fail(format!("sending CONNECT: {e}")))?;
        metrics().record_packet_sent(outbound.len());

        let mut inbound = BytesMut::new();
        let mut chunk = vec![0u8; self.limits.network_buffer_size];
        loop {
            match self.codec.decode(&mut inbound) {
                Ok(Some(Packet::ConnAck(connack))) => return Ok((connack, client_id, inbound)),
                Ok(Some(other)) => {
                    return Err(MqttError::handshake_failed(format!(
                        "expected CONNACK, received {}",
                        other.name()
                    )))
                }
                Ok(None) => {}
                Err(e) => return Err(MqttError::handshake_failed(format!("garbled CONNACK: {e}"))),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(MqttError::handshake_failed("no CONNACK before connect timeout"));
            }
            match transport.receive(&mut chunk, remaining).await {
                Ok(0) => {
                    return Err(MqttError::handshake_failed(
                        "broker closed the connection before CONNACK",
                    ))
                }
                Ok(read) => {
                    metrics().record_bytes_received(read);
                    inbound.extend_from_slice(&chunk[..read]);
                }
                Err(TransportError::Timeout) => {
                    return Err(MqttError::handshake_failed("no CONNACK before connect timeout"))
                }
                Err(e) => return Err(MqttError::connect_fail(e.to_string())),
            }
        }
    }

    fn spawn_session_tasks(self: &Arc<Self>, session: &Arc<Session>, buffered: BytesMut) {
        let span = crate::session_span!(handle = %self.id, broker = %self.broker);

        let client = Arc::clone(self);
        let receiving = Arc::clone(session);
        tokio::spawn(
            async move {
                if let Some(cause) = receiving.receive_loop(buffered, &client.dispatcher).await {
                    client.end_session(&receiving, cause).await;
                }
            }
            .instrument(span.clone()),
        );

        let client = Arc::clone(self);
        let scheduling = Arc::clone(session);
        tokio::spawn(
            async move {
                if let Some(cause) = scheduling.scheduler_loop().await {
                    client.end_session(&scheduling, cause).await;
                }
            }
            .instrument(span),
        );
    }

    /// Tear down `session` after an unsolicited failure.
    ///
    /// Only the first caller for a given session does anything; the receive
    /// loop, the scheduler and request paths may all observe the same failure.
    pub(crate) async fn end_session(&self, session: &Arc<Session>, cause: DisconnectCause) {
        let owned = {
            let mut slot = lock(&self.session);
            match slot.as_ref() {
                Some(current) if Arc::ptr_eq(current, session) => {
                    slot.take();
                    true
                }
                _ => false,
            }
        };
        if !owned {
            return;
        }

        let kind = StateMachine::classify_disconnect(&cause);
        let failed = session.terminate(&format!("session lost: {cause}")).await;
        let was_connected = self.state() == ConnectionState::Connected;
        let _ = self.transition(StateEvent::SessionEnded);
        metrics().record_disconnect(kind);
        error!(handle = %self.id, broker = %self.broker, %cause, %kind, failed, "Session lost");

        if was_connected {
            self.dispatch_disconnect(kind, &cause);
        }
    }

    fn dispatch_disconnect(&self, kind: DisconnectType, cause: &DisconnectCause) {
        let event = MqttEvent::Disconnect(DisconnectEvent {
            kind,
            reason: cause.to_string(),
            at: Utc::now(),
        });
        self.dispatcher.dispatch(event, None);
    }

    /// Send DISCONNECT, fail in-flight requests and return to `Init`.
    ///
    /// No disconnect event is raised; the caller already knows.
    pub async fn disconnect(&self) -> MqttResult<()> {
        self.close_session(None).await
    }

    /// Disconnect on behalf of the engine, raising a disconnect event
    pub(crate) async fn shutdown(&self) -> MqttResult<()> {
        self.close_session(Some(DisconnectCause::EngineShutdown)).await
    }

    async fn close_session(&self, announce: Option<DisconnectCause>) -> MqttResult<()> {
        match self.transition(StateEvent::DisconnectRequested) {
            Ok(ConnectionState::Connected) => {
                let session = lock(&self.session).take();
                let Some(session) = session else {
                    // an unsolicited failure is already tearing the session down
                    self.wait_until_idle().await;
                    return Ok(());
                };
                session.send_disconnect().await;
                let failed = session.terminate("disconnected by user").await;
                metrics().record_disconnect(DisconnectType::UserRequested);
                info!(handle = %self.id, failed, "Disconnected");
                if let Some(cause) = announce {
                    self.dispatch_disconnect(StateMachine::classify_disconnect(&cause), &cause);
                }
                let _ = self.transition(StateEvent::SessionEnded);
                Ok(())
            }
            Ok(_) | Err(ConnectionState::Disconnecting) => {
                self.wait_until_idle().await;
                Ok(())
            }
            Err(ConnectionState::Deinitialized) => Err(MqttError::Closed),
            Err(state) => Err(MqttError::NotConnected { state }),
        }
    }

    fn active_session(&self) -> MqttResult<Arc<Session>> {
        let state = self.state();
        if !StateMachine::allows_requests(state) {
            return Err(match state {
                ConnectionState::Deinitialized => MqttError::Closed,
                state => MqttError::NotConnected { state },
            });
        }
        let session = lock(&self.session).clone();
        session.ok_or(MqttError::NotConnected { state })
    }

    async fn resolve_send<T>(
        &self,
        session: &Arc<Session>,
        result: Result<T, SendError>,
        fail: fn(String) -> MqttError,
    ) -> MqttResult<T> {
        match result {
            Ok(value) => Ok(value),
            Err(SendError::Rejected(e)) => Err(e),
            Err(SendError::Broken(e)) => {
                let reason = e.to_string();
                self.end_session(session, DisconnectCause::Transport(e)).await;
                Err(fail(reason))
            }
        }
    }

    /// Send a publish and return once it is written.
    ///
    /// The returned future resolves when the publish completes: immediately
    /// for QoS 0, on PUBACK or PUBCOMP otherwise.
    pub async fn publish_async(&self, request: PublishRequest) -> MqttResult<PendingAck<()>> {
        validate_topic_name(&request.topic)?;
        let session = self.active_session()?;
        let result = session.publish(request).await;
        self.resolve_send(&session, result, MqttError::publish_fail).await
    }

    pub async fn publish(&self, request: PublishRequest) -> MqttResult<()> {
        self.publish_async(request).await?.await
    }

    /// Send one SUBSCRIBE carrying every filter in `subscriptions`.
    ///
    /// The future yields one result per filter, in request order; filters
    /// the broker rejected do not fail the others.
    pub async fn subscribe_async(
        &self,
        subscriptions: Vec<Subscription>,
    ) -> MqttResult<PendingAck<Vec<FilterResult>>> {
        if subscriptions.is_empty() {
            return Err(MqttError::bad_arg("subscribe needs at least one filter"));
        }
        for subscription in &subscriptions {
            validate_topic_filter(&subscription.filter)?;
        }
        let session = self.active_session()?;
        let result = session.subscribe(subscriptions).await;
        self.resolve_send(&session, result, MqttError::subscribe_fail).await
    }

    pub async fn subscribe(&self, subscriptions: Vec<Subscription>) -> MqttResult<Vec<FilterResult>> {
        self.subscribe_async(subscriptions).await?.await
    }

    pub async fn unsubscribe_async(&self, filters: Vec<String>) -> MqttResult<PendingAck<()>> {
        if filters.is_empty() {
            return Err(MqttError::bad_arg("unsubscribe needs at least one filter"));
        }
        for filter in &filters {
            validate_topic_filter(filter)?;
        }
        let session = self.active_session()?;
        let result = session.unsubscribe(filters).await;
        self.resolve_send(&session, result, MqttError::unsubscribe_fail).await
    }

    pub async fn unsubscribe(&self, filters: Vec<String>) -> MqttResult<()> {
        self.unsubscribe_async(filters).await?.await
    }

    /// (Re)start keepalive probing; 0 stops it
    pub fn start_keepalive(&self, interval_secs: u16) -> MqttResult<()> {
        let session = self.active_session()?;
        session.start_keepalive(Duration::from_secs(u64::from(interval_secs)));
        debug!(handle = %self.id, interval_secs, "Keepalive started");
        Ok(())
    }

    pub fn stop_keepalive(&self) -> MqttResult<()> {
        let session = self.active_session()?;
        session.stop_keepalive();
        debug!(handle = %self.id, "Keepalive stopped");
        Ok(())
    }

    /// Wait for queued events to be delivered and stop the dispatcher
    pub(crate) async fn close_dispatcher(&self) {
        self.dispatcher.shutdown().await;
    }
}

fn connack_result(code: ConnectReturnCode) -> MqttResult<()> {
    match code {
        ConnectReturnCode::Success => Ok(()),
        ConnectReturnCode::RefusedProtocolVersion => Err(MqttError::ProtocolNotSupported),
        ConnectReturnCode::BadClientId => {
            Err(MqttError::handshake_failed("client identifier rejected"))
        }
        ConnectReturnCode::ServiceUnavailable => Err(MqttError::connect_fail("server unavailable")),
        ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
            Err(MqttError::InvalidCredentials)
        }
    }
}
