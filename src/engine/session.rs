//! A live MQTT session: one accepted CONNECT on one transport
//!
//! The session owns everything that only exists while connected: the
//! transport, the delivery tracker, the keepalive timer, the granted
//! subscriptions and the inbound QoS 2 bookkeeping. Two tasks drive it:
//!
//! - the receive loop decodes inbound frames, matches acks inline and queues
//!   messages on the handle's dispatcher;
//! - the scheduler loop sleeps until the earliest retransmission or keepalive
//!   deadline and acts on whatever is due.
//!
//! Both loops return the cause when the session breaks; the owning handle
//! then tears the session down exactly once.

use super::client::{PublishRequest, Subscription};
use super::dispatcher::{Dispatcher, InboundMessage, MqttEvent};
use super::handle_table::HandleId;
use super::keepalive::{KeepaliveAction, KeepaliveTimer};
use super::state::DisconnectCause;
use super::subscriptions::{Route, SubscriptionTable};
use super::tracker::{AckOutcome, DeliveryTracker, FilterResult, PendingAck, PendingFilter};
use crate::config::Limits;
use crate::error::MqttError;
use crate::observability::metrics::metrics;
use crate::protocol::codec::{CodecError, PacketCodec};
use crate::protocol::packet::{
    Packet, PacketExt, PubAck, PubComp, PubRec, PubRel, Publish, QoS, Subscribe, SubscribeFilter,
    Unsubscribe,
};
use crate::transport::{Transport, TransportError};
use bytes::BytesMut;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{watch, Notify};
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Why a request could not be sent
pub(crate) enum SendError {
    /// Refused before anything was written
    Rejected(MqttError),
    /// Transport failed; the session is unusable
    Broken(TransportError),
}

impl From<MqttError> for SendError {
    fn from(error: MqttError) -> Self {
        SendError::Rejected(error)
    }
}

enum WriteError {
    Codec(CodecError),
    Transport(TransportError),
}

impl From<WriteError> for DisconnectCause {
    fn from(error: WriteError) -> Self {
        match error {
            WriteError::Codec(e) => DisconnectCause::Malformed(e.to_string()),
            WriteError::Transport(e) => DisconnectCause::Transport(e),
        }
    }
}

pub(crate) struct Session {
    handle: HandleId,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn PacketCodec>,
    limits: Limits,
    session_present: bool,
    tracker: Mutex<DeliveryTracker>,
    keepalive: Mutex<KeepaliveTimer>,
    subscriptions: Mutex<SubscriptionTable>,
    /// QoS 2 packet ids received but not yet released by PUBREL
    inbound_qos2: Mutex<HashSet<u16>>,
    wake: Notify,
    shutdown: watch::Sender<bool>,
}

impl Session {
    pub(crate) fn new(
        handle: HandleId,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn PacketCodec>,
        limits: Limits,
        session_present: bool,
    ) -> Self {
        let now = Instant::now();
        let tracker = DeliveryTracker::new(
            limits.max_outgoing_publishes,
            limits.max_outgoing_subscribes,
            limits.ack_timeout(),
            limits.max_retry,
        );
        let keepalive = KeepaliveTimer::new(limits.receive_timeout(), now);
        let (shutdown, _) = watch::channel(false);
        Self {
            handle,
            transport,
            codec,
            limits,
            session_present,
            tracker: Mutex::new(tracker),
            keepalive: Mutex::new(keepalive),
            subscriptions: Mutex::new(SubscriptionTable::default()),
            inbound_qos2: Mutex::new(HashSet::new()),
            wake: Notify::new(),
            shutdown,
        }
    }

    pub(crate) fn inflight(&self) -> usize {
        lock(&self.tracker).len()
    }

    pub(crate) fn subscription_count(&self) -> usize {
        lock(&self.subscriptions).len()
    }

    pub(crate) fn start_keepalive(&self, interval: Duration) {
        lock(&self.keepalive).start(interval, Instant::now());
        self.wake.notify_one();
    }

    pub(crate) fn stop_keepalive(&self) {
        lock(&self.keepalive).stop();
        self.wake.notify_one();
    }

    pub(crate) fn keepalive_interval(&self) -> Option<Duration> {
        lock(&self.keepalive).interval()
    }

    async fn write(&self, packet: &Packet) -> Result<(), WriteError> {
        let mut buf = BytesMut::with_capacity(self.limits.network_buffer_size);
        self.codec.encode(packet, &mut buf).map_err(WriteError::Codec)?;
        self.transport
            .send(&buf, self.limits.send_timeout())
            .await
            .map_err(WriteError::Transport)?;

        lock(&self.keepalive).record_sent(Instant::now());
        metrics().record_packet_sent(buf.len());
        trace!(handle = %self.handle, packet = packet.name(), bytes = buf.len(), "Sent packet");
        Ok(())
    }

    async fn write_or_break(&self, packet: &Packet) -> Result<(), DisconnectCause> {
        self.write(packet).await.map_err(DisconnectCause::from)
    }

    /// Send a request frame the tracker already owns
    async fn write_tracked(&self, frame: &Packet) -> Result<(), SendError> {
        match self.write(frame).await {
            Ok(()) => Ok(()),
            Err(WriteError::Transport(e)) => Err(SendError::Broken(e)),
            Err(WriteError::Codec(e)) => {
                if let Some(packet_id) = frame.packet_id() {
                    lock(&self.tracker).abandon(packet_id);
                }
                Err(SendError::Rejected(MqttError::Codec(e)))
            }
        }
    }

    pub(crate) async fn publish(&self, request: PublishRequest) -> Result<PendingAck<()>, SendError> {
        let PublishRequest {
            topic,
            payload,
            qos,
            retain,
        } = request;
        metrics().record_publish(qos);

        if qos == QoS::AtMostOnce {
            let packet = Packet::Publish(Publish {
                dup: false,
                qos,
                retain,
                topic,
                pkid: 0,
                payload,
            });
            return match self.write(&packet).await {
                Ok(()) => Ok(PendingAck::published()),
                Err(WriteError::Transport(e)) => Err(SendError::Broken(e)),
                Err(WriteError::Codec(e)) => Err(SendError::Rejected(MqttError::Codec(e))),
            };
        }

        let (frame, pending) = lock(&self.tracker).begin_publish(Instant::now(), |packet_id| {
            Packet::Publish(Publish {
                dup: false,
                qos,
                retain,
                topic,
                pkid: packet_id,
                payload,
            })
        })?;
        self.wake.notify_one();
        self.write_tracked(&frame).await?;
        Ok(pending)
    }

    pub(crate) async fn subscribe(
        &self,
        subscriptions: Vec<Subscription>,
    ) -> Result<PendingAck<Vec<FilterResult>>, SendError> {
        let filters: Vec<SubscribeFilter> = subscriptions
            .iter()
            .map(|s| SubscribeFilter::new(s.filter.clone(), s.qos))
            .collect();
        let pending_filters = subscriptions
            .into_iter()
            .map(|s| PendingFilter {
                filter: s.filter,
                handler: s.handler,
            })
            .collect();

        let (frame, pending) =
            lock(&self.tracker).begin_subscribe(Instant::now(), pending_filters, |packet_id| {
                Packet::Subscribe(Subscribe {
                    pkid: packet_id,
                    filters,
                })
            })?;
        self.wake.notify_one();
        self.write_tracked(&frame).await?;
        Ok(pending)
    }

    pub(crate) async fn unsubscribe(&self, filters: Vec<String>) -> Result<PendingAck<()>, SendError> {
        let (frame, pending) = lock(&self.tracker).begin_unsubscribe(Instant::now(), |packet_id| {
            Packet::Unsubscribe(Unsubscribe {
                pkid: packet_id,
                topics: filters,
            })
        })?;
        self.wake.notify_one();
        self.write_tracked(&frame).await?;
        Ok(pending)
    }

    /// Best-effort DISCONNECT ahead of a user-requested teardown
    pub(crate) async fn send_disconnect(&self) {
        if self.write(&Packet::Disconnect).await.is_err() {
            debug!(handle = %self.handle, "DISCONNECT could not be sent");
        }
    }

    /// Stop both loops, fail in-flight requests and close the transport.
    ///
    /// Returns the number of requests failed.
    pub(crate) async fn terminate(&self, reason: &str) -> usize {
        self.shutdown.send_replace(true);
        lock(&self.keepalive).stop();
        let failed = lock(&self.tracker).fail_all(reason);
        lock(&self.inbound_qos2).clear();
        if let Err(e) = self.transport.close().await {
            debug!(handle = %self.handle, "Transport close failed: {}", e);
        }
        failed
    }

    /// Read and handle inbound frames until shutdown or failure.
    ///
    /// `buffered` holds bytes that arrived together with CONNACK.
    pub(crate) async fn receive_loop(
        &self,
        mut buffered: BytesMut,
        dispatcher: &Dispatcher,
    ) -> Option<DisconnectCause> {
        let mut shutdown = self.shutdown.subscribe();
        let mut buf = vec![0u8; self.limits.network_buffer_size];
        loop {
            loop {
                match self.codec.decode(&mut buffered) {
                    Ok(Some(packet)) => {
                        if let Err(cause) = self.handle_packet(packet, dispatcher).await {
                            return Some(cause);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => return Some(DisconnectCause::Malformed(e.to_string())),
                }
            }

            let received = tokio::select! {
                _ = shutdown.wait_for(|stopped| *stopped) => return None,
                received = self.transport.receive(&mut buf, self.limits.receive_timeout()) => received,
            };
            match received {
                Ok(0) => return Some(DisconnectCause::PeerClosed),
                Ok(read) => {
                    metrics().record_bytes_received(read);
                    buffered.extend_from_slice(&buf[..read]);
                }
                Err(TransportError::Timeout) => continue,
                Err(e) => return Some(DisconnectCause::Transport(e)),
            }
        }
    }

    async fn handle_packet(
        &self,
        packet: Packet,
        dispatcher: &Dispatcher,
    ) -> Result<(), DisconnectCause> {
        let now = Instant::now();
        trace!(handle = %self.handle, packet = packet.name(), "Received packet");

        match packet {
            Packet::PubAck(ack) => {
                let outcome = lock(&self.tracker).on_puback(ack.pkid, now);
                self.note_ack(outcome, "PUBACK", ack.pkid);
            }
            Packet::PubRec(rec) => {
                let outcome = lock(&self.tracker).on_pubrec(rec.pkid, now);
                match outcome {
                    AckOutcome::Release(packet_id) => {
                        self.wake.notify_one();
                        self.write_or_break(&Packet::PubRel(PubRel::new(packet_id))).await?;
                    }
                    other => self.note_ack(other, "PUBREC", rec.pkid),
                }
            }
            Packet::PubComp(comp) => {
                let outcome = lock(&self.tracker).on_pubcomp(comp.pkid, now);
                self.note_ack(outcome, "PUBCOMP", comp.pkid);
            }
            Packet::SubAck(suback) => {
                let outcome = lock(&self.tracker).on_suback(&suback);
                match outcome {
                    AckOutcome::Subscribed { granted } => {
                        let mut table = lock(&self.subscriptions);
                        for (pending, qos) in granted {
                            debug!(handle = %self.handle, filter = %pending.filter, ?qos, "Subscription granted");
                            table.insert(pending.filter, pending.handler);
                        }
                    }
                    AckOutcome::Mismatch => {
                        return Err(DisconnectCause::UnexpectedPacket(
                            "SUBACK with wrong number of return codes".to_string(),
                        ))
                    }
                    other => self.note_ack(other, "SUBACK", suback.pkid),
                }
            }
            Packet::UnsubAck(unsuback) => {
                let outcome = lock(&self.tracker).on_unsuback(unsuback.pkid, now);
                match outcome {
                    AckOutcome::Unsubscribed { filters, latency } => {
                        metrics().record_ack(latency);
                        debug!(handle = %self.handle, packet_id = unsuback.pkid, latency_ms = latency.as_millis() as u64, "Unsubscribe acknowledged");
                        let mut table = lock(&self.subscriptions);
                        for filter in filters {
                            table.remove(&filter);
                        }
                    }
                    other => self.note_ack(other, "UNSUBACK", unsuback.pkid),
                }
            }
            Packet::Publish(publish) => self.on_inbound_publish(publish, dispatcher).await?,
            Packet::PubRel(rel) => {
                lock(&self.inbound_qos2).remove(&rel.pkid);
                self.write_or_break(&Packet::PubComp(PubComp::new(rel.pkid))).await?;
            }
            Packet::PingResp => {
                if !lock(&self.keepalive).on_ping_response() {
                    debug!(handle = %self.handle, "Ignoring unsolicited PINGRESP");
                }
            }
            Packet::Disconnect => return Err(DisconnectCause::BrokerDisconnect),
            other => return Err(DisconnectCause::UnexpectedPacket(other.name().to_string())),
        }
        Ok(())
    }

    fn note_ack(&self, outcome: AckOutcome, name: &str, packet_id: u16) {
        match outcome {
            AckOutcome::Completed { kind, latency } => {
                metrics().record_ack(latency);
                debug!(handle = %self.handle, packet_id, ?kind, latency_ms = latency.as_millis() as u64, "Request acknowledged");
            }
            AckOutcome::Unmatched => {
                metrics().record_unmatched_ack();
                warn!(handle = %self.handle, packet_id, "Ignoring {} for unknown packet id", name);
            }
            _ => {}
        }
    }

    async fn on_inbound_publish(
        &self,
        publish: Publish,
        dispatcher: &Dispatcher,
    ) -> Result<(), DisconnectCause> {
        let packet_id = publish.pkid;
        let first_delivery = match publish.qos {
            QoS::AtMostOnce => true,
            _ if packet_id == 0 => {
                return Err(DisconnectCause::Malformed(
                    "PUBLISH above QoS 0 without packet id".to_string(),
                ))
            }
            QoS::AtLeastOnce => {
                self.write_or_break(&Packet::PubAck(PubAck::new(packet_id))).await?;
                true
            }
            QoS::ExactlyOnce => {
                let first = lock(&self.inbound_qos2).insert(packet_id);
                self.write_or_break(&Packet::PubRec(PubRec::new(packet_id))).await?;
                first
            }
        };
        if !first_delivery {
            metrics().record_duplicate_inbound();
            debug!(handle = %self.handle, topic = %publish.topic, "Suppressing duplicate QoS 2 delivery");
            return Ok(());
        }

        metrics().record_inbound_message();
        let message = InboundMessage {
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
            dup: publish.dup,
            received_at: Utc::now(),
        };
        let route = lock(&self.subscriptions).route(&message.topic);
        match route {
            Route::Subscription(target) => {
                dispatcher.dispatch(MqttEvent::SubscriptionMessage(message), target)
            }
            // a resumed session may carry subscriptions made on an earlier connection
            Route::Unmatched if self.session_present => {
                dispatcher.dispatch(MqttEvent::Publish(message), None)
            }
            Route::Unmatched => {
                metrics().record_event_dropped();
                debug!(handle = %self.handle, topic = %message.topic, "Dropping message that matches no subscription");
            }
        }
        Ok(())
    }

    /// Retransmit, fail and ping as deadlines fall due, until shutdown or failure
    pub(crate) async fn scheduler_loop(&self) -> Option<DisconnectCause> {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                _ = shutdown.wait_for(|stopped| *stopped) => return None,
                _ = self.wake.notified() => continue,
                _ = sleep_until(deadline) => {}
            }
            if let Err(cause) = self.advance_timers(Instant::now()).await {
                return Some(cause);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let tracker = lock(&self.tracker).next_deadline();
        let keepalive = lock(&self.keepalive).next_deadline();
        match (tracker, keepalive) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    async fn advance_timers(&self, now: Instant) -> Result<(), DisconnectCause> {
        let expired = lock(&self.tracker).expire(now);
        for (packet_id, kind) in &expired.failed {
            metrics().record_request_failed();
            warn!(handle = %self.handle, packet_id, ?kind, "Request failed after retry budget");
        }
        for frame in &expired.resend {
            metrics().record_retransmission();
            debug!(handle = %self.handle, packet = frame.name(), packet_id = ?frame.packet_id(), "Retransmitting");
            self.write_or_break(frame).await?;
        }

        let action = lock(&self.keepalive).poll(now);
        match action {
            KeepaliveAction::Idle => {}
            KeepaliveAction::SendPing => {
                // arm the response deadline first; PINGRESP may race the send
                lock(&self.keepalive).on_ping_sent(now);
                metrics().record_ping_sent();
                self.write_or_break(&Packet::PingReq).await?;
            }
            KeepaliveAction::Expired => {
                metrics().record_keepalive_expired();
                return Err(DisconnectCause::KeepaliveExpired);
            }
        }
        Ok(())
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
