//! Thread-safe metrics collection
//!
//! Atomic counters for the high-frequency paths (message receipt, channel
//! push, persistence) and a mutex-protected window of recent processing
//! times. One [`IngestMetrics`] is shared by every component of a service
//! instance through an `Arc`.

use crate::identity::ConnectionIdentity;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const PROCESSING_WINDOW: usize = 1000;

/// Thread-safe metrics collector using atomics and mutexes
pub struct IngestMetrics {
    // Message flow
    messages_received: AtomicU64,
    messages_enqueued: AtomicU64,
    messages_dropped: AtomicU64,
    messages_persisted: AtomicU64,
    messages_failed: AtomicU64,
    slow_messages: AtomicU64,
    batches_drained: AtomicU64,
    received_by_identity: DashMap<ConnectionIdentity, u64>,

    // Connections
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    connections_lost: AtomicU64,
    reconnect_attempts: AtomicU64,
    subscription_restore_failures: AtomicU64,
    state_update_failures: AtomicU64,

    processing_times: Mutex<Vec<u64>>, // in milliseconds
    uptime_start: u64,
}

impl IngestMetrics {
    pub fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            messages_enqueued: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            messages_persisted: AtomicU64::new(0),
            messages_failed: AtomicU64::new(0),
            slow_messages: AtomicU64::new(0),
            batches_drained: AtomicU64::new(0),
            received_by_identity: DashMap::new(),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            connections_lost: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            subscription_restore_failures: AtomicU64::new(0),
            state_update_failures: AtomicU64::new(0),
            processing_times: Mutex::new(Vec::new()),
            uptime_start: current_timestamp(),
        }
    }

    // Message flow
    pub fn message_received(&self, identity: &ConnectionIdentity) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        *self
            .received_by_identity
            .entry(identity.clone())
            .or_insert(0) += 1;
    }

    pub fn message_enqueued(&self) {
        self.messages_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_persisted(&self, duration: Duration) {
        self.messages_persisted.fetch_add(1, Ordering::Relaxed);
        self.record_processing_time(duration);
    }

    pub fn message_failed(&self, duration: Duration) {
        self.messages_failed.fetch_add(1, Ordering::Relaxed);
        // Record processing time even for failed messages
        self.record_processing_time(duration);
    }

    pub fn slow_message(&self) {
        self.slow_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn batch_drained(&self) {
        self.batches_drained.fetch_add(1, Ordering::Relaxed);
    }

    fn record_processing_time(&self, duration: Duration) {
        if let Ok(mut times) = self.processing_times.lock() {
            times.push(duration.as_millis() as u64);

            if times.len() > PROCESSING_WINDOW {
                times.remove(0);
            }
        }
    }

    // Connections
    pub fn connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_lost(&self) {
        self.connections_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscription_restore_failed(&self) {
        self.subscription_restore_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn state_update_failed(&self) {
        self.state_update_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Messages received so far for one connection
    pub fn received_for(&self, identity: &str) -> u64 {
        self.received_by_identity
            .get(identity)
            .map(|count| *count)
            .unwrap_or(0)
    }

    /// Calculate processing time statistics (avg, p50, p95)
    fn calculate_processing_time_statistics(&self) -> (f64, f64, f64) {
        let Ok(times) = self.processing_times.lock() else {
            return (0.0, 0.0, 0.0);
        };
        if times.is_empty() {
            return (0.0, 0.0, 0.0);
        }

        let mut sorted_times = times.clone();
        drop(times);
        sorted_times.sort_unstable();

        let avg = sorted_times.iter().sum::<u64>() as f64 / sorted_times.len() as f64;
        (
            avg,
            percentile(&sorted_times, 50.0),
            percentile(&sorted_times, 95.0),
        )
    }

    /// Get complete metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg_processing_time_ms, p50, p95) = self.calculate_processing_time_statistics();

        let received_by_connection = self
            .received_by_identity
            .iter()
            .map(|entry| (entry.key().to_string(), *entry.value()))
            .collect();

        MetricsSnapshot {
            messages: MessageMetrics {
                received: self.messages_received.load(Ordering::Relaxed),
                enqueued: self.messages_enqueued.load(Ordering::Relaxed),
                dropped: self.messages_dropped.load(Ordering::Relaxed),
                persisted: self.messages_persisted.load(Ordering::Relaxed),
                failed: self.messages_failed.load(Ordering::Relaxed),
                slow: self.slow_messages.load(Ordering::Relaxed),
                batches_drained: self.batches_drained.load(Ordering::Relaxed),
                avg_processing_time_ms,
                processing_time_p50_ms: p50,
                processing_time_p95_ms: p95,
                received_by_connection,
            },
            connections: ConnectionMetrics {
                attempts: self.connection_attempts.load(Ordering::Relaxed),
                established: self.connections_established.load(Ordering::Relaxed),
                failures: self.connection_failures.load(Ordering::Relaxed),
                lost: self.connections_lost.load(Ordering::Relaxed),
                reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
                subscription_restore_failures: self
                    .subscription_restore_failures
                    .load(Ordering::Relaxed),
                state_update_failures: self.state_update_failures.load(Ordering::Relaxed),
            },
            uptime_seconds: now.saturating_sub(self.uptime_start),
            timestamp: now,
        }
    }
}

impl Default for IngestMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub messages: MessageMetrics,
    pub connections: ConnectionMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct MessageMetrics {
    pub received: u64,
    pub enqueued: u64,
    pub dropped: u64,
    pub persisted: u64,
    pub failed: u64,
    pub slow: u64,
    pub batches_drained: u64,
    pub avg_processing_time_ms: f64,
    pub processing_time_p50_ms: f64,
    pub processing_time_p95_ms: f64,
    pub received_by_connection: BTreeMap<String, u64>,
}

#[derive(Debug, Serialize)]
pub struct ConnectionMetrics {
    pub attempts: u64,
    pub established: u64,
    pub failures: u64,
    pub lost: u64,
    pub reconnect_attempts: u64,
    pub subscription_restore_failures: u64,
    pub state_update_failures: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn percentile(sorted_values: &[u64], percentile: f64) -> f64 {
    if sorted_values.is_empty() {
        return 0.0;
    }

    let index = (percentile / 100.0 * (sorted_values.len() - 1) as f64).round() as usize;
    sorted_values[index.min(sorted_values.len() - 1)] as f64
}
