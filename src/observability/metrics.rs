//! Thread-safe metrics collection system
//!
//! Provides atomic counters and mutex-protected collections for tracking
//! engine statistics across handles, sessions, delivery and event dispatch.

use crate::engine::DisconnectType;
use crate::protocol::packet::QoS;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

const MAX_LATENCY_SAMPLES: usize = 1000;

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Handle lifecycle
    handles_created: AtomicU64,
    handles_deleted: AtomicU64,

    // Sessions
    connect_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    disconnects: Mutex<HashMap<DisconnectType, u64>>,

    // Wire traffic (atomic for high frequency)
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,

    // Delivery
    publishes: [AtomicU64; 3],
    acks_received: AtomicU64,
    retransmissions: AtomicU64,
    requests_failed: AtomicU64,
    unmatched_acks: AtomicU64,
    ack_latencies: Mutex<Vec<u64>>, // in milliseconds

    // Inbound
    messages_received: AtomicU64,
    duplicates_suppressed: AtomicU64,

    // Keepalive
    pings_sent: AtomicU64,
    keepalive_expirations: AtomicU64,

    // Dispatch
    events_delivered: AtomicU64,
    events_dropped: AtomicU64,
    event_queue_peak: AtomicU64,

    started_at: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            handles_created: AtomicU64::new(0),
            handles_deleted: AtomicU64::new(0),
            connect_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            disconnects: Mutex::new(HashMap::new()),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            publishes: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
            acks_received: AtomicU64::new(0),
            retransmissions: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            unmatched_acks: AtomicU64::new(0),
            ack_latencies: Mutex::new(Vec::new()),
            messages_received: AtomicU64::new(0),
            duplicates_suppressed: AtomicU64::new(0),
            pings_sent: AtomicU64::new(0),
            keepalive_expirations: AtomicU64::new(0),
            events_delivered: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            event_queue_peak: AtomicU64::new(0),
            started_at: AtomicU64::new(current_timestamp()),
        }
    }

    pub fn record_handle_created(&self) {
        self.handles_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handle_deleted(&self) {
        self.handles_deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect_success(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect_failure(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disconnect(&self, kind: DisconnectType) {
        if let Ok(mut disconnects) = self.disconnects.lock() {
            *disconnects.entry(kind).or_insert(0) += 1;
        }
    }

    /// One encoded packet of `bytes` length left the engine
    pub fn record_packet_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_bytes_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_publish(&self, qos: QoS) {
        self.publishes[qos as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// A tracked request completed after `latency`
    pub fn record_ack(&self, latency: Duration) {
        self.acks_received.fetch_add(1, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut latencies) = self.ack_latencies.lock() {
            latencies.push(latency.as_millis() as u64);

            // Limit to last measurements to prevent unbounded growth
            if latencies.len() > MAX_LATENCY_SAMPLES {
                latencies.remove(0);
            }
        }
    }

    pub fn record_retransmission(&self) {
        self.retransmissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unmatched_ack(&self) {
        self.unmatched_acks.fetch_add(1, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_inbound_message(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate_inbound(&self) {
        self.duplicates_suppressed.fetch_add(1, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ping_sent(&self) {
        self.pings_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_keepalive_expired(&self) {
        self.keepalive_expirations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_delivered(&self) {
        self.events_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Events waiting in one handle's dispatch queue; keeps the peak
    pub fn record_event_queue_depth(&self, depth: usize) {
        self.event_queue_peak.fetch_max(depth as u64, Ordering::Relaxed);
    }

    // Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.handles_created,
            &self.handles_deleted,
            &self.connect_attempts,
            &self.connections_established,
            &self.connection_failures,
            &self.packets_sent,
            &self.packets_received,
            &self.bytes_sent,
            &self.bytes_received,
            &self.acks_received,
            &self.retransmissions,
            &self.requests_failed,
            &self.unmatched_acks,
            &self.messages_received,
            &self.duplicates_suppressed,
            &self.pings_sent,
            &self.keepalive_expirations,
            &self.events_delivered,
            &self.events_dropped,
            &self.event_queue_peak,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        for counter in &self.publishes {
            counter.store(0, Ordering::Relaxed);
        }
        if let Ok(mut disconnects) = self.disconnects.lock() {
            disconnects.clear();
        }
        if let Ok(mut latencies) = self.ack_latencies.lock() {
            latencies.clear();
        }
        self.started_at.store(current_timestamp(), Ordering::Relaxed);
    }

    /// Calculate ack latency statistics (pure function)
    fn calculate_latency_statistics(&self) -> (f64, f64, f64, f64) {
        if let Ok(latencies) = self.ack_latencies.lock() {
            if latencies.is_empty() {
                (0.0, 0.0, 0.0, 0.0)
            } else {
                let mut sorted = latencies.clone();
                sorted.sort_unstable();

                let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
                (
                    avg,
                    percentile(&sorted, 50.0),
                    percentile(&sorted, 95.0),
                    percentile(&sorted, 99.0),
                )
            }
        } else {
            (0.0, 0.0, 0.0, 0.0)
        }
    }

    fn disconnect_counts(&self) -> HashMap<String, u64> {
        self.disconnects
            .lock()
            .map(|disconnects| {
                disconnects
                    .iter()
                    .map(|(kind, count)| (kind.to_string(), *count))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg_ack_latency_ms, p50, p95, p99) = self.calculate_latency_statistics();
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        MetricsSnapshot {
            handles: HandleMetrics {
                created: load(&self.handles_created),
                deleted: load(&self.handles_deleted),
            },
            sessions: SessionMetrics {
                connect_attempts: load(&self.connect_attempts),
                connections_established: load(&self.connections_established),
                connection_failures: load(&self.connection_failures),
                disconnects: self.disconnect_counts(),
                pings_sent: load(&self.pings_sent),
                keepalive_expirations: load(&self.keepalive_expirations),
            },
            traffic: TrafficMetrics {
                packets_sent: load(&self.packets_sent),
                packets_received: load(&self.packets_received),
                bytes_sent: load(&self.bytes_sent),
                bytes_received: load(&self.bytes_received),
            },
            delivery: DeliveryMetrics {
                publishes_qos0: load(&self.publishes[0]),
                publishes_qos1: load(&self.publishes[1]),
                publishes_qos2: load(&self.publishes[2]),
                acks_received: load(&self.acks_received),
                retransmissions: load(&self.retransmissions),
                requests_failed: load(&self.requests_failed),
                unmatched_acks: load(&self.unmatched_acks),
                avg_ack_latency_ms,
                ack_latency_p50_ms: p50,
                ack_latency_p95_ms: p95,
                ack_latency_p99_ms: p99,
            },
            events: EventMetrics {
                messages_received: load(&self.messages_received),
                duplicates_suppressed: load(&self.duplicates_suppressed),
                delivered: load(&self.events_delivered),
                dropped: load(&self.events_dropped),
                queue_peak: load(&self.event_queue_peak),
            },
            uptime_seconds: now.saturating_sub(load(&self.started_at)),
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

// Public metrics structures
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub handles: HandleMetrics,
    pub sessions: SessionMetrics,
    pub traffic: TrafficMetrics,
    pub delivery: DeliveryMetrics,
    pub events: EventMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct HandleMetrics {
    pub created: u64,
    pub deleted: u64,
}

#[derive(Debug, Serialize)]
pub struct SessionMetrics {
    pub connect_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    /// Unsolicited and user disconnects keyed by classification
    pub disconnects: HashMap<String, u64>,
    pub pings_sent: u64,
    pub keepalive_expirations: u64,
}

#[derive(Debug, Serialize)]
pub struct TrafficMetrics {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Debug, Serialize)]
pub struct DeliveryMetrics {
    pub publishes_qos0: u64,
    pub publishes_qos1: u64,
    pub publishes_qos2: u64,
    pub acks_received: u64,
    pub retransmissions: u64,
    pub requests_failed: u64,
    pub unmatched_acks: u64,
    pub avg_ack_latency_ms: f64,
    pub ack_latency_p50_ms: f64,
    pub ack_latency_p95_ms: f64,
    pub ack_latency_p99_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct EventMetrics {
    pub messages_received: u64,
    pub duplicates_suppressed: u64,
    pub delivered: u64,
    pub dropped: u64,
    /// Deepest any dispatch queue has been
    pub queue_peak: u64,
}

// Helper functions
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_index = index.floor() as usize;
        let upper_index = index.ceil() as usize;
        let lower_value = sorted_data[lower_index] as f64;
        let upper_value = sorted_data[upper_index] as f64;

        lower_value + (upper_value - lower_value) * index.fract()
    }
}
