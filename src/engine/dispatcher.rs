//! Event delivery to application callbacks
//!
//! Each handle owns one [`Dispatcher`]. Network tasks hand it events without
//! blocking; a single worker task drains the queue and runs callbacks on the
//! blocking pool one at a time, so callbacks for a handle observe events in
//! the order they were queued and a slow callback never stalls the receive
//! path or the keepalive scheduler. The queue itself is unbounded so the
//! receive path never waits on a callback; its depth is tracked and reported
//! once it reaches the configured warning level.

use super::handle_table::HandleId;
use super::state::DisconnectType;
use crate::observability::metrics::metrics;
use crate::protocol::packet::QoS;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Message received from the broker
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    /// Payload as UTF-8 text, if it is valid UTF-8
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Unsolicited session loss
#[derive(Debug, Clone, PartialEq)]
pub struct DisconnectEvent {
    pub kind: DisconnectType,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Events delivered to callbacks
#[derive(Debug, Clone, PartialEq)]
pub enum MqttEvent {
    /// Message that matched no active subscription of this session
    Publish(InboundMessage),
    /// Message that matched an active subscription
    SubscriptionMessage(InboundMessage),
    Disconnect(DisconnectEvent),
}

impl MqttEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            MqttEvent::Publish(_) => "publish_receive",
            MqttEvent::SubscriptionMessage(_) => "subscription_message_receive",
            MqttEvent::Disconnect(_) => "disconnect",
        }
    }

    pub fn message(&self) -> Option<&InboundMessage> {
        match self {
            MqttEvent::Publish(message) | MqttEvent::SubscriptionMessage(message) => Some(message),
            MqttEvent::Disconnect(_) => None,
        }
    }
}

/// Application hook for engine events.
///
/// Runs on the blocking thread pool; it may block, but events for the same
/// handle queue behind it.
pub trait EventCallback: Send + Sync + 'static {
    fn on_event(&self, handle: HandleId, event: &MqttEvent);
}

impl<F> EventCallback for F
where
    F: Fn(HandleId, &MqttEvent) + Send + Sync + 'static,
{
    fn on_event(&self, handle: HandleId, event: &MqttEvent) {
        self(handle, event)
    }
}

struct Delivery {
    event: MqttEvent,
    /// Overrides the handle-level callback, e.g. a per-subscription handler
    target: Option<Arc<dyn EventCallback>>,
}

type SharedCallback = Arc<RwLock<Option<Arc<dyn EventCallback>>>>;

pub(crate) struct Dispatcher {
    handle: HandleId,
    callback: SharedCallback,
    queue: Mutex<Option<mpsc::UnboundedSender<Delivery>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Events queued but not yet taken by the worker
    depth: Arc<AtomicUsize>,
    warn_depth: usize,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("handle", &self.handle)
            .field("has_callback", &self.has_callback())
            .finish()
    }
}

impl Dispatcher {
    pub(crate) fn new(handle: HandleId, warn_depth: usize) -> Self {
        Self {
            handle,
            callback: Arc::new(RwLock::new(None)),
            queue: Mutex::new(None),
            worker: Mutex::new(None),
            depth: Arc::new(AtomicUsize::new(0)),
            warn_depth,
        }
    }

    /// Install the handle-level callback; fails if one is already registered
    pub(crate) fn register(&self, callback: Arc<dyn EventCallback>) -> bool {
        let mut slot = self.callback.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        *slot = Some(callback);
        true
    }

    /// Remove the handle-level callback; returns whether one was registered
    pub(crate) fn deregister(&self) -> bool {
        self.callback
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    pub(crate) fn has_callback(&self) -> bool {
        self.callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Spawn the worker if it is not running. Requires a tokio runtime.
    pub(crate) fn ensure_started(&self) {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        if queue.as_ref().is_some_and(|sender| !sender.is_closed()) {
            return;
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        self.depth.store(0, Ordering::Release);
        let worker = tokio::spawn(run_worker(
            self.handle,
            Arc::clone(&self.callback),
            Arc::clone(&self.depth),
            receiver,
        ));
        *queue = Some(sender);
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(worker);
    }

    /// Queue `event` without blocking
    pub(crate) fn dispatch(&self, event: MqttEvent, target: Option<Arc<dyn EventCallback>>) {
        let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = queue.as_ref() else {
            debug!(handle = %self.handle, event = event.kind(), "No dispatcher running, dropping event");
            metrics().record_event_dropped();
            return;
        };
        let depth = self.depth.fetch_add(1, Ordering::AcqRel) + 1;
        if sender.send(Delivery { event, target }).is_err() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            metrics().record_event_dropped();
            return;
        }
        metrics().record_event_queue_depth(depth);
        if depth == self.warn_depth {
            warn!(handle = %self.handle, depth, "Event queue is backing up behind a slow callback");
        }
    }

    #[cfg(test)]
    fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    /// Stop accepting events and wait for already queued ones to be delivered
    pub(crate) async fn shutdown(&self) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(handle = %self.handle, "Dispatcher worker ended abnormally: {}", e);
            }
        }
    }
}

async fn run_worker(
    handle: HandleId,
    callback: SharedCallback,
    depth: Arc<AtomicUsize>,
    mut receiver: mpsc::UnboundedReceiver<Delivery>,
) {
    while let Some(delivery) = receiver.recv().await {
        depth.fetch_sub(1, Ordering::AcqRel);
        let target = delivery.target.or_else(|| {
            callback
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        });
        let Some(target) = target else {
            debug!(handle = %handle, event = delivery.event.kind(), "No callback registered, dropping event");
            metrics().record_event_dropped();
            continue;
        };

        let event = delivery.event;
        let result =
            tokio::task::spawn_blocking(move || target.on_event(handle, &event)).await;
        match result {
            Ok(()) => metrics().record_event_delivered(),
            Err(e) => warn!(handle = %handle, "Event callback panicked: {}", e),
        }
    }
    debug!(handle = %handle, "Dispatcher worker stopped");
}
