//! Mock implementations for testing
//!
//! Provides an in-memory MQTT broker together with the Transport and
//! Connector that reach it, so the engine can be exercised end to end without
//! a network or an external broker. The broker is scriptable: it can drop
//! acknowledgements, reject filters, refuse CONNECT, stop answering pings,
//! inject publishes and close the connection under the client.

use crate::config::BrokerInfo;
use crate::protocol::codec::{Mqtt311Codec, PacketCodec};
use crate::protocol::packet::{
    min_qos, ConnAck, ConnectReturnCode, Packet, PacketExt, PubAck, PubComp, PubRec, PubRel,
    Publish, QoS, SubAck, SubscribeReasonCode, UnsubAck,
};
use crate::protocol::topic;
use crate::transport::{Connector, Transport, TransportError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::debug;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Broker behaviour knobs
#[derive(Debug, Clone)]
pub struct MockBrokerSettings {
    pub connack_code: ConnectReturnCode,
    pub session_present: bool,
    pub respond_to_ping: bool,
    /// Granted QoS is capped at this level
    pub max_granted_qos: QoS,
    /// Filters answered with a SUBACK failure code
    pub reject_filters: Vec<String>,
    pub refuse_connections: bool,
    /// Record packets but never answer, not even CONNECT
    pub silent: bool,
}

impl Default for MockBrokerSettings {
    fn default() -> Self {
        Self {
            connack_code: ConnectReturnCode::Success,
            session_present: false,
            respond_to_ping: true,
            max_granted_qos: QoS::ExactlyOnce,
            reject_filters: Vec::new(),
            refuse_connections: false,
            silent: false,
        }
    }
}

enum Delivery {
    Data(Vec<u8>),
    Close,
    Fail(TransportError),
}

struct Link {
    id: u64,
    sender: mpsc::UnboundedSender<Delivery>,
}

struct BrokerState {
    settings: Mutex<MockBrokerSettings>,
    /// Pending drop decisions for outgoing acks; `true` drops one ack
    ack_drops: Mutex<VecDeque<bool>>,
    received: Mutex<Vec<Packet>>,
    received_count: watch::Sender<usize>,
    subscriptions: Mutex<Vec<(String, QoS)>>,
    link: Mutex<Option<Link>>,
    connections: AtomicU64,
    next_packet_id: Mutex<u16>,
    codec: Mqtt311Codec,
}

/// In-memory broker; clones share state
#[derive(Clone)]
pub struct MockBroker {
    state: Arc<BrokerState>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    pub fn new() -> Self {
        Self::with_settings(MockBrokerSettings::default())
    }

    pub fn with_settings(settings: MockBrokerSettings) -> Self {
        let (received_count, _) = watch::channel(0);
        Self {
            state: Arc::new(BrokerState {
                settings: Mutex::new(settings),
                ack_drops: Mutex::new(VecDeque::new()),
                received: Mutex::new(Vec::new()),
                received_count,
                subscriptions: Mutex::new(Vec::new()),
                link: Mutex::new(None),
                connections: AtomicU64::new(0),
                next_packet_id: Mutex::new(0),
                codec: Mqtt311Codec::default(),
            }),
        }
    }

    pub fn connector(&self) -> Arc<MockConnector> {
        Arc::new(MockConnector {
            broker: self.clone(),
        })
    }

    pub fn update_settings(&self, update: impl FnOnce(&mut MockBrokerSettings)) {
        update(&mut lock(&self.state.settings));
    }

    /// Decide the fate of the next acks the broker sends, in order.
    ///
    /// `true` drops that ack; once the pattern is used up every ack is sent.
    pub fn drop_acks(&self, pattern: impl IntoIterator<Item = bool>) {
        lock(&self.state.ack_drops).extend(pattern);
    }

    pub fn received(&self) -> Vec<Packet> {
        lock(&self.state.received).clone()
    }

    pub fn count_received(&self, predicate: impl Fn(&Packet) -> bool) -> usize {
        lock(&self.state.received)
            .iter()
            .filter(|packet| predicate(packet))
            .count()
    }

    pub fn pings_received(&self) -> usize {
        self.count_received(|packet| matches!(packet, Packet::PingReq))
    }

    pub fn publishes_received(&self) -> Vec<Publish> {
        lock(&self.state.received)
            .iter()
            .filter_map(|packet| match packet {
                Packet::Publish(publish) => Some(publish.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear_received(&self) {
        lock(&self.state.received).clear();
    }

    /// Connections accepted so far
    pub fn connections(&self) -> u64 {
        self.state.connections.load(Ordering::Relaxed)
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state.link).is_some()
    }

    pub fn granted_subscriptions(&self) -> Vec<(String, QoS)> {
        lock(&self.state.subscriptions).clone()
    }

    /// Wait until `predicate` holds for the packets received so far
    pub async fn wait_for(
        &self,
        predicate: impl Fn(&[Packet]) -> bool,
        timeout: Duration,
    ) -> bool {
        let mut changes = self.state.received_count.subscribe();
        let check = async {
            loop {
                if predicate(&lock(&self.state.received)) {
                    return true;
                }
                if changes.changed().await.is_err() {
                    return false;
                }
            }
        };
        tokio::time::timeout(timeout, check).await.unwrap_or(false)
    }

    /// Encode and deliver `packet` to the connected client
    pub fn send_to_client(&self, packet: &Packet) -> bool {
        let mut buf = BytesMut::new();
        if let Err(e) = self.state.codec.encode(packet, &mut buf) {
            debug!("Mock broker cannot encode {}: {}", packet.name(), e);
            return false;
        }
        self.deliver(Delivery::Data(buf.to_vec()))
    }

    /// Deliver bytes verbatim, e.g. a malformed frame
    pub fn send_raw(&self, bytes: &[u8]) -> bool {
        self.deliver(Delivery::Data(bytes.to_vec()))
    }

    /// Publish to the client as if another client had published.
    ///
    /// Returns the packet id used, `None` for QoS 0.
    pub fn inject_publish(
        &self,
        topic_name: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
    ) -> Option<u16> {
        let packet_id = (qos != QoS::AtMostOnce).then(|| self.next_packet_id());
        let publish = Publish {
            dup: false,
            qos,
            retain: false,
            topic: topic_name.to_string(),
            pkid: packet_id.unwrap_or(0),
            payload: payload.into(),
        };
        self.send_to_client(&Packet::Publish(publish));
        packet_id
    }

    /// Close the connection without a DISCONNECT, as a crashing broker would
    pub fn close_connection(&self) {
        self.deliver(Delivery::Close);
        lock(&self.state.link).take();
    }

    /// Make the client's next receive fail with `error`
    pub fn fail_connection(&self, error: TransportError) {
        self.deliver(Delivery::Fail(error));
        lock(&self.state.link).take();
    }

    fn deliver(&self, delivery: Delivery) -> bool {
        match lock(&self.state.link).as_ref() {
            Some(link) => link.sender.send(delivery).is_ok(),
            None => false,
        }
    }

    fn next_packet_id(&self) -> u16 {
        let mut next = lock(&self.state.next_packet_id);
        *next = next.checked_add(1).unwrap_or(1);
        *next
    }

    fn attach(&self) -> (u64, mpsc::UnboundedReceiver<Delivery>) {
        let id = self.state.connections.fetch_add(1, Ordering::Relaxed) + 1;
        let (sender, receiver) = mpsc::unbounded_channel();
        // replacing the link drops the previous sender, closing that connection
        *lock(&self.state.link) = Some(Link { id, sender });
        (id, receiver)
    }

    fn detach(&self, link_id: u64) {
        let mut link = lock(&self.state.link);
        if link.as_ref().is_some_and(|link| link.id == link_id) {
            link.take();
        }
    }

    fn is_current(&self, link_id: u64) -> bool {
        lock(&self.state.link)
            .as_ref()
            .is_some_and(|link| link.id == link_id)
    }

    fn record(&self, packet: Packet) {
        lock(&self.state.received).push(packet);
        self.state.received_count.send_modify(|count| *count += 1);
    }

    /// Send an acknowledgement unless the drop pattern says otherwise
    fn ack(&self, packet: Packet) {
        let drop_it = lock(&self.state.ack_drops).pop_front().unwrap_or(false);
        if drop_it {
            debug!("Mock broker dropping {}", packet.name());
            return;
        }
        self.send_to_client(&packet);
    }

    fn handle_packet(&self, link_id: u64, packet: Packet) {
        let settings = lock(&self.state.settings).clone();
        self.record(packet.clone());
        if settings.silent {
            return;
        }

        match packet {
            Packet::Connect(connect) => {
                if connect.clean_session {
                    lock(&self.state.subscriptions).clear();
                }
                self.send_to_client(&Packet::ConnAck(ConnAck {
                    session_present: settings.session_present,
                    code: settings.connack_code,
                }));
                if settings.connack_code != ConnectReturnCode::Success {
                    self.detach(link_id);
                }
            }
            Packet::Publish(publish) => {
                match publish.qos {
                    QoS::AtLeastOnce => self.ack(Packet::PubAck(PubAck::new(publish.pkid))),
                    QoS::ExactlyOnce => self.ack(Packet::PubRec(PubRec::new(publish.pkid))),
                    QoS::AtMostOnce => {}
                }
                if !publish.dup {
                    self.route(&publish);
                }
            }
            Packet::PubRel(rel) => self.ack(Packet::PubComp(PubComp::new(rel.pkid))),
            // the client acknowledging a QoS 2 publish we sent
            Packet::PubRec(rec) => {
                self.send_to_client(&Packet::PubRel(PubRel::new(rec.pkid)));
            }
            Packet::Subscribe(subscribe) => {
                let mut return_codes = Vec::with_capacity(subscribe.filters.len());
                for requested in subscribe.filters {
                    let filter = requested.path;
                    if settings.reject_filters.contains(&filter) {
                        return_codes.push(SubscribeReasonCode::Failure);
                        continue;
                    }
                    let granted = min_qos(requested.qos, settings.max_granted_qos);
                    let mut subscriptions = lock(&self.state.subscriptions);
                    subscriptions.retain(|(existing, _)| *existing != filter);
                    subscriptions.push((filter, granted));
                    return_codes.push(SubscribeReasonCode::Success(granted));
                }
                self.ack(Packet::SubAck(SubAck::new(subscribe.pkid, return_codes)));
            }
            Packet::Unsubscribe(unsubscribe) => {
                lock(&self.state.subscriptions)
                    .retain(|(filter, _)| !unsubscribe.topics.contains(filter));
                self.ack(Packet::UnsubAck(UnsubAck::new(unsubscribe.pkid)));
            }
            Packet::PingReq => {
                if settings.respond_to_ping {
                    self.send_to_client(&Packet::PingResp);
                }
            }
            Packet::Disconnect => self.detach(link_id),
            _ => {}
        }
    }

    /// Forward a publish to the client if one of its filters matches
    fn route(&self, publish: &Publish) {
        let granted = lock(&self.state.subscriptions)
            .iter()
            .find(|(filter, _)| topic::matches(filter, &publish.topic))
            .map(|(_, qos)| *qos);
        let Some(granted) = granted else {
            return;
        };
        let qos = min_qos(publish.qos, granted);
        let pkid = if qos == QoS::AtMostOnce {
            0
        } else {
            self.next_packet_id()
        };
        self.send_to_client(&Packet::Publish(Publish {
            dup: false,
            qos,
            retain: publish.retain,
            topic: publish.topic.clone(),
            pkid,
            payload: publish.payload.clone(),
        }));
    }
}

/// Client end of a connection to a [`MockBroker`]
pub struct MockTransport {
    broker: MockBroker,
    link_id: u64,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>,
    leftover: Mutex<Vec<u8>>,
    outbound: Mutex<BytesMut>,
    closed: AtomicBool,
}

impl MockTransport {
    fn drain_leftover(&self, buf: &mut [u8]) -> Option<usize> {
        let mut leftover = lock(&self.leftover);
        if leftover.is_empty() {
            return None;
        }
        let read = buf.len().min(leftover.len());
        buf[..read].copy_from_slice(&leftover[..read]);
        leftover.drain(..read);
        Some(read)
    }

    fn decode_outbound(&self, data: &[u8]) -> Result<Vec<Packet>, TransportError> {
        let mut outbound = lock(&self.outbound);
        outbound.extend_from_slice(data);
        let mut packets = Vec::new();
        loop {
            match self.broker.state.codec.decode(&mut outbound) {
                Ok(Some(packet)) => packets.push(packet),
                Ok(None) => return Ok(packets),
                Err(e) => return Err(TransportError::Io(format!("broker rejected frame: {e}"))),
            }
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, data: &[u8], _timeout: Duration) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) || !self.broker.is_current(self.link_id) {
            return Err(TransportError::Closed);
        }
        for packet in self.decode_outbound(data)? {
            self.broker.handle_packet(self.link_id, packet);
        }
        Ok(())
    }

    async fn receive(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        if let Some(read) = self.drain_leftover(buf) {
            return Ok(read);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let mut inbound = self.inbound.lock().await;
        match tokio::time::timeout(timeout, inbound.recv()).await {
            Err(_) => Err(TransportError::Timeout),
            Ok(None) | Ok(Some(Delivery::Close)) => Ok(0),
            Ok(Some(Delivery::Fail(error))) => Err(error),
            Ok(Some(Delivery::Data(data))) => {
                let read = buf.len().min(data.len());
                buf[..read].copy_from_slice(&data[..read]);
                if read < data.len() {
                    lock(&self.leftover).extend_from_slice(&data[read..]);
                }
                Ok(read)
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        self.broker.detach(self.link_id);
        Ok(())
    }
}

/// Opens [`MockTransport`]s to one [`MockBroker`]
pub struct MockConnector {
    broker: MockBroker,
}

impl MockConnector {
    pub fn broker(&self) -> &MockBroker {
        &self.broker
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        _broker: &BrokerInfo,
        _timeout: Duration,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let refuse = lock(&self.broker.state.settings).refuse_connections;
        if refuse {
            return Err(TransportError::Unreachable(
                "connection refused by mock broker".into(),
            ));
        }
        let (link_id, receiver) = self.broker.attach();
        Ok(Box::new(MockTransport {
            broker: self.broker.clone(),
            link_id,
            inbound: tokio::sync::Mutex::new(receiver),
            leftover: Mutex::new(Vec::new()),
            outbound: Mutex::new(BytesMut::new()),
            closed: AtomicBool::new(false),
        }))
    }
}
