//! Client metrics counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counter set shared by producer and consumer.
#[derive(Debug, Default)]
pub struct ClientMetrics {
    // producer
    pub records_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub send_errors: AtomicU64,

    // consumer
    pub records_consumed: AtomicU64,
    pub bytes_consumed: AtomicU64,
    pub consume_errors: AtomicU64,

    // transport
    pub connection_errors: AtomicU64,
}

impl ClientMetrics {
    pub fn record_send(&self, records: u64, bytes: u64) {
        self.records_sent.fetch_add(records, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_consume(&self, records: u64, bytes: u64) {
        self.records_consumed.fetch_add(records, Ordering::Relaxed);
        self.bytes_consumed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_consume_error(&self) {
        self.consume_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_sent: self.records_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            records_consumed: self.records_consumed.load(Ordering::Relaxed),
            bytes_consumed: self.bytes_consumed.load(Ordering::Relaxed),
            consume_errors: self.consume_errors.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub records_sent: u64,
    pub bytes_sent: u64,
    pub send_errors: u64,
    pub records_consumed: u64,
    pub bytes_consumed: u64,
    pub consume_errors: u64,
    pub connection_errors: u64,
}

/// Process-wide metrics instance for applications that aggregate across
/// several clients.
static GLOBAL_METRICS: once_cell::sync::Lazy<Arc<ClientMetrics>> =
    once_cell::sync::Lazy::new(|| Arc::new(ClientMetrics::default()));

pub fn global_metrics() -> Arc<ClientMetrics> {
    GLOBAL_METRICS.clone()
}
