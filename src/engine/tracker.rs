//! Outgoing request tracking
//!
//! [`DeliveryTracker`] owns every request of a session that is waiting for an
//! acknowledgement: QoS 1 and QoS 2 publishes, subscribes and unsubscribes.
//! It allocates packet identifiers, advances the QoS handshakes as acks are
//! reported, and decides what to retransmit or give up on when deadlines pass.
//! It performs no I/O; the session feeds it acks and timestamps and sends
//! whatever frames it hands back.

use super::dispatcher::EventCallback;
use crate::error::MqttError;
use crate::protocol::packet::{Packet, PubRel, QoS, SubAck, SubscribeReasonCode};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Publish,
    Subscribe,
    Unsubscribe,
}

/// Position of a request in its acknowledgement handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Waiting for PUBACK, SUBACK or UNSUBACK
    AwaitingAck,
    /// QoS 2 publish waiting for PUBREC
    AwaitingRec,
    /// QoS 2 publish released, waiting for PUBCOMP
    AwaitingComp,
}

/// Broker decision for one filter of a subscribe request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOutcome {
    Granted(QoS),
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterResult {
    pub filter: String,
    pub outcome: FilterOutcome,
}

impl FilterResult {
    pub fn is_granted(&self) -> bool {
        matches!(self.outcome, FilterOutcome::Granted(_))
    }
}

/// Successful outcome of a tracked request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Published,
    Subscribed(Vec<FilterResult>),
    Unsubscribed,
}

type Responder = oneshot::Sender<Result<Completion, MqttError>>;

/// Completion handle for a request that has been sent.
///
/// Resolves once the broker acknowledged the request, it failed after the
/// retry budget, or the session ended.
pub struct PendingAck<T> {
    packet_id: Option<u16>,
    receiver: oneshot::Receiver<Result<Completion, MqttError>>,
    map: fn(Completion) -> Result<T, MqttError>,
}

impl<T> fmt::Debug for PendingAck<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingAck")
            .field("packet_id", &self.packet_id)
            .finish()
    }
}

impl<T> PendingAck<T> {
    fn new(
        packet_id: Option<u16>,
        receiver: oneshot::Receiver<Result<Completion, MqttError>>,
        map: fn(Completion) -> Result<T, MqttError>,
    ) -> Self {
        Self {
            packet_id,
            receiver,
            map,
        }
    }

    /// Packet identifier assigned to the request; `None` for QoS 0 publishes
    pub fn packet_id(&self) -> Option<u16> {
        self.packet_id
    }
}

impl PendingAck<()> {
    /// Already-completed publish, used for QoS 0
    pub(crate) fn published() -> Self {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(Ok(Completion::Published));
        Self::new(None, receiver, expect_published)
    }
}

impl<T> Future for PendingAck<T> {
    type Output = Result<T, MqttError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let map = self.map;
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(Ok(completion))) => Poll::Ready(map(completion)),
            Poll::Ready(Ok(Err(error))) => Poll::Ready(Err(error)),
            Poll::Ready(Err(_)) => Poll::Ready(Err(MqttError::Closed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn mismatch() -> MqttError {
    MqttError::Other {
        reason: "acknowledgement of the wrong kind completed a request".into(),
    }
}

pub(crate) fn expect_published(completion: Completion) -> Result<(), MqttError> {
    match completion {
        Completion::Published => Ok(()),
        _ => Err(mismatch()),
    }
}

pub(crate) fn expect_subscribed(completion: Completion) -> Result<Vec<FilterResult>, MqttError> {
    match completion {
        Completion::Subscribed(results) => Ok(results),
        _ => Err(mismatch()),
    }
}

pub(crate) fn expect_unsubscribed(completion: Completion) -> Result<(), MqttError> {
    match completion {
        Completion::Unsubscribed => Ok(()),
        _ => Err(mismatch()),
    }
}

/// Filter and handler of a pending subscribe, registered once granted
pub(crate) struct PendingFilter {
    pub filter: String,
    pub handler: Option<Arc<dyn EventCallback>>,
}

struct OutgoingRequest {
    kind: RequestKind,
    state: RequestState,
    /// Frame retransmitted on timeout (dup flag set for publishes)
    frame: Packet,
    sent_at: Instant,
    deadline: Instant,
    retry_count: u32,
    filters: Vec<PendingFilter>,
    responder: Option<Responder>,
}

impl OutgoingRequest {
    fn complete(&mut self, result: Result<Completion, MqttError>) {
        if let Some(responder) = self.responder.take() {
            // receiver may have been dropped by a caller that stopped waiting
            let _ = responder.send(result);
        }
    }
}

/// What the session must do after reporting an inbound ack
pub(crate) enum AckOutcome {
    /// No request matched; the ack is ignored
    Unmatched,
    Completed { kind: RequestKind, latency: Duration },
    /// PUBREC accepted; send PUBREL for this id
    Release(u16),
    /// SUBACK accepted; these filters are now active
    Subscribed { granted: Vec<(PendingFilter, QoS)> },
    /// UNSUBACK accepted; these filters are no longer active
    Unsubscribed { filters: Vec<String>, latency: Duration },
    /// SUBACK return code count differs from the request
    Mismatch,
}

/// Result of advancing the clock
#[derive(Default)]
pub(crate) struct ExpireOutcome {
    pub resend: Vec<Packet>,
    pub failed: Vec<(u16, RequestKind)>,
}

/// Tracks in-flight requests and assigns packet identifiers
pub struct DeliveryTracker {
    entries: HashMap<u16, OutgoingRequest>,
    next_id: u16,
    max_publishes: usize,
    max_subscribes: usize,
    ack_timeout: Duration,
    max_retry: u32,
    /// Set once the session has ended; no new requests are accepted
    closed: bool,
}

impl DeliveryTracker {
    pub fn new(
        max_publishes: usize,
        max_subscribes: usize,
        ack_timeout: Duration,
        max_retry: u32,
    ) -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 1,
            max_publishes,
            max_subscribes,
            ack_timeout,
            max_retry,
            closed: false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, packet_id: u16) -> bool {
        self.entries.contains_key(&packet_id)
    }

    #[cfg(test)]
    fn state_of(&self, packet_id: u16) -> Option<RequestState> {
        self.entries.get(&packet_id).map(|entry| entry.state)
    }

    #[cfg(test)]
    fn retries_of(&self, packet_id: u16) -> Option<u32> {
        self.entries.get(&packet_id).map(|entry| entry.retry_count)
    }

    fn count(&self, kinds: &[RequestKind]) -> usize {
        self.entries
            .values()
            .filter(|entry| kinds.contains(&entry.kind))
            .count()
    }

    fn has_capacity(&self, kind: RequestKind) -> bool {
        match kind {
            RequestKind::Publish => self.count(&[RequestKind::Publish]) < self.max_publishes,
            RequestKind::Subscribe | RequestKind::Unsubscribe => {
                self.count(&[RequestKind::Subscribe, RequestKind::Unsubscribe])
                    < self.max_subscribes
            }
        }
    }

    /// Next identifier in 1..=65535 that is not currently in flight
    fn allocate_id(&mut self) -> Option<u16> {
        for _ in 0..u16::MAX {
            let candidate = self.next_id;
            self.next_id = if self.next_id == u16::MAX {
                1
            } else {
                self.next_id + 1
            };
            if !self.entries.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }

    fn begin(
        &mut self,
        kind: RequestKind,
        now: Instant,
        build: impl FnOnce(u16) -> Packet,
        filters: Vec<PendingFilter>,
    ) -> Result<(u16, Packet, oneshot::Receiver<Result<Completion, MqttError>>), MqttError>
    {
        if self.closed {
            return Err(failure(kind, "session closed"));
        }
        let resource = match kind {
            RequestKind::Publish => "outgoing publishes",
            RequestKind::Subscribe | RequestKind::Unsubscribe => "outgoing subscriptions",
        };
        if !self.has_capacity(kind) {
            return Err(MqttError::NoMem { resource });
        }
        let packet_id = self.allocate_id().ok_or(MqttError::NoMem {
            resource: "packet identifiers",
        })?;

        let frame = build(packet_id);
        let state = match &frame {
            Packet::Publish(publish) if publish.qos == QoS::ExactlyOnce => {
                RequestState::AwaitingRec
            }
            _ => RequestState::AwaitingAck,
        };
        let (responder, receiver) = oneshot::channel();
        self.entries.insert(
            packet_id,
            OutgoingRequest {
                kind,
                state,
                frame: frame.clone(),
                sent_at: now,
                deadline: now + self.ack_timeout,
                retry_count: 0,
                filters,
                responder: Some(responder),
            },
        );
        Ok((packet_id, frame, receiver))
    }

    /// Register a QoS 1/2 publish. `build` receives the allocated packet id.
    pub fn begin_publish(
        &mut self,
        now: Instant,
        build: impl FnOnce(u16) -> Packet,
    ) -> Result<(Packet, PendingAck<()>), MqttError> {
        let (packet_id, frame, receiver) = self.begin(RequestKind::Publish, now, build, Vec::new())?;
        Ok((frame, PendingAck::new(Some(packet_id), receiver, expect_published)))
    }

    pub(crate) fn begin_subscribe(
        &mut self,
        now: Instant,
        filters: Vec<PendingFilter>,
        build: impl FnOnce(u16) -> Packet,
    ) -> Result<(Packet, PendingAck<Vec<FilterResult>>), MqttError> {
        let (packet_id, frame, receiver) = self.begin(RequestKind::Subscribe, now, build, filters)?;
        Ok((frame, PendingAck::new(Some(packet_id), receiver, expect_subscribed)))
    }

    pub fn begin_unsubscribe(
        &mut self,
        now: Instant,
        build: impl FnOnce(u16) -> Packet,
    ) -> Result<(Packet, PendingAck<()>), MqttError> {
        let (packet_id, frame, receiver) =
            self.begin(RequestKind::Unsubscribe, now, build, Vec::new())?;
        Ok((frame, PendingAck::new(Some(packet_id), receiver, expect_unsubscribed)))
    }

    fn finish(&mut self, packet_id: u16, completion: Completion) -> Option<OutgoingRequest> {
        let mut entry = self.entries.remove(&packet_id)?;
        entry.complete(Ok(completion));
        Some(entry)
    }

    pub(crate) fn on_puback(&mut self, packet_id: u16, now: Instant) -> AckOutcome {
        match self.entries.get(&packet_id) {
            Some(entry)
                if entry.kind == RequestKind::Publish && entry.state == RequestState::AwaitingAck => {}
            _ => return AckOutcome::Unmatched,
        }
        match self.finish(packet_id, Completion::Published) {
            Some(entry) => AckOutcome::Completed {
                kind: entry.kind,
                latency: now.saturating_duration_since(entry.sent_at),
            },
            None => AckOutcome::Unmatched,
        }
    }

    pub(crate) fn on_pubrec(&mut self, packet_id: u16, now: Instant) -> AckOutcome {
        let ack_timeout = self.ack_timeout;
        match self.entries.get_mut(&packet_id) {
            Some(entry) if entry.kind == RequestKind::Publish => match entry.state {
                RequestState::AwaitingRec => {
                    entry.state = RequestState::AwaitingComp;
                    entry.frame = Packet::PubRel(PubRel::new(packet_id));
                    entry.deadline = now + ack_timeout;
                    AckOutcome::Release(packet_id)
                }
                // duplicate PUBREC; PUBREL must be resent
                RequestState::AwaitingComp => AckOutcome::Release(packet_id),
                RequestState::AwaitingAck => AckOutcome::Unmatched,
            },
            _ => AckOutcome::Unmatched,
        }
    }

    pub(crate) fn on_pubcomp(&mut self, packet_id: u16, now: Instant) -> AckOutcome {
        match self.entries.get(&packet_id) {
            Some(entry) if entry.state == RequestState::AwaitingComp => {}
            _ => return AckOutcome::Unmatched,
        }
        match self.finish(packet_id, Completion::Published) {
            Some(entry) => AckOutcome::Completed {
                kind: entry.kind,
                latency: now.saturating_duration_since(entry.sent_at),
            },
            None => AckOutcome::Unmatched,
        }
    }

    pub(crate) fn on_suback(&mut self, suback: &SubAck) -> AckOutcome {
        let expected = match self.entries.get(&suback.pkid) {
            Some(entry) if entry.kind == RequestKind::Subscribe => entry.filters.len(),
            _ => return AckOutcome::Unmatched,
        };
        if expected != suback.return_codes.len() {
            return AckOutcome::Mismatch;
        }
        let Some(mut entry) = self.entries.remove(&suback.pkid) else {
            return AckOutcome::Unmatched;
        };

        let mut results = Vec::with_capacity(expected);
        let mut granted = Vec::new();
        for (pending, code) in entry.filters.drain(..).zip(&suback.return_codes) {
            match code {
                SubscribeReasonCode::Success(qos) => {
                    results.push(FilterResult {
                        filter: pending.filter.clone(),
                        outcome: FilterOutcome::Granted(*qos),
                    });
                    granted.push((pending, *qos));
                }
                SubscribeReasonCode::Failure => results.push(FilterResult {
                    filter: pending.filter,
                    outcome: FilterOutcome::Rejected,
                }),
            }
        }
        entry.complete(Ok(Completion::Subscribed(results)));
        AckOutcome::Subscribed { granted }
    }

    pub(crate) fn on_unsuback(&mut self, packet_id: u16, now: Instant) -> AckOutcome {
        let filters = match self.entries.get(&packet_id) {
            Some(entry) if entry.kind == RequestKind::Unsubscribe => match &entry.frame {
                Packet::Unsubscribe(unsubscribe) => unsubscribe.topics.clone(),
                _ => Vec::new(),
            },
            _ => return AckOutcome::Unmatched,
        };
        match self.finish(packet_id, Completion::Unsubscribed) {
            Some(entry) => AckOutcome::Unsubscribed {
                filters,
                latency: now.saturating_duration_since(entry.sent_at),
            },
            None => AckOutcome::Unmatched,
        }
    }

    /// Handle every entry whose deadline has passed.
    ///
    /// Entries with retry budget left are rescheduled and their frame is
    /// returned for retransmission; the rest are failed and removed. The budget
    /// is shared across the steps of a QoS 2 handshake.
    pub(crate) fn expire(&mut self, now: Instant) -> ExpireOutcome {
        let mut outcome = ExpireOutcome::default();
        let mut expired: Vec<u16> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();

        for packet_id in expired {
            let Some(entry) = self.entries.get_mut(&packet_id) else {
                continue;
            };
            if entry.retry_count < self.max_retry {
                entry.retry_count += 1;
                entry.deadline = now + self.ack_timeout;
                if let Packet::Publish(publish) = &mut entry.frame {
                    publish.dup = true;
                }
                outcome.resend.push(entry.frame.clone());
            } else if let Some(mut entry) = self.entries.remove(&packet_id) {
                let error = failure(entry.kind, &format!(
                    "no acknowledgement after {} retransmissions",
                    self.max_retry
                ));
                entry.complete(Err(error));
                outcome.failed.push((packet_id, entry.kind));
            }
        }
        outcome
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|entry| entry.deadline).min()
    }

    /// Drop a request whose frame could not be sent, without completing it
    pub(crate) fn abandon(&mut self, packet_id: u16) {
        self.entries.remove(&packet_id);
    }

    /// Fail every in-flight request, empty the tracker and refuse new requests
    pub fn fail_all(&mut self, reason: &str) -> usize {
        self.closed = true;
        let count = self.entries.len();
        for (_, mut entry) in self.entries.drain() {
            let error = failure(entry.kind, reason);
            entry.complete(Err(error));
        }
        count
    }
}

fn failure(kind: RequestKind, reason: &str) -> MqttError {
    match kind {
        RequestKind::Publish => MqttError::publish_fail(reason),
        RequestKind::Subscribe => MqttError::subscribe_fail(reason),
        RequestKind::Unsubscribe => MqttError::unsubscribe_fail(reason),
    }
}
