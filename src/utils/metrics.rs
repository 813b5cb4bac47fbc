//! Runtime statistics
//!
//! Atomic counters owned by a [`Runtime`](crate::runtime::Runtime). Reading them
//! never blocks the connection tasks that update them.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Instant, SystemTime};
use tracing::{debug, info};

/// Counters for one runtime instance
#[derive(Debug)]
pub struct Metrics {
    /// Total connections created
    pub connections_total: AtomicU64,
    /// Currently live connections
    pub connections_active: AtomicU64,
    /// Total messages queued for sending
    pub messages_sent: AtomicU64,
    /// Total messages read off the wire
    pub messages_received: AtomicU64,
    /// Total bytes written
    pub bytes_sent: AtomicU64,
    /// Total bytes read
    pub bytes_received: AtomicU64,
    /// Payloads compressed before sending
    pub compressed: AtomicU64,
    /// Inbound payloads that failed codec parsing
    pub parse_errors: AtomicU64,
    /// Tasks currently tracked by the runtime
    pub go_count: AtomicI64,
    /// Pooled worker tasks currently alive
    pub pool_go_count: AtomicI64,
    /// Panics caught in tracked tasks
    pub panic_count: AtomicU64,
    /// Unix seconds of the last caught panic
    pub last_panic: AtomicU64,
    start_time: Instant,
    started_at: SystemTime,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            compressed: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            go_count: AtomicI64::new(0),
            pool_go_count: AtomicI64::new(0),
            panic_count: AtomicU64::new(0),
            last_panic: AtomicU64::new(0),
            start_time: Instant::now(),
            started_at: SystemTime::now(),
        }
    }

    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn message_sent(&self, byte_count: u64) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn message_received(&self, byte_count: u64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn compression(&self) {
        self.compressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a caught panic at `unix_secs`
    pub fn panic_caught(&self, unix_secs: u64) {
        self.panic_count.fetch_add(1, Ordering::Relaxed);
        self.last_panic.store(unix_secs, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            compressed: self.compressed.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            go_count: self.go_count.load(Ordering::Relaxed),
            pool_go_count: self.pool_go_count.load(Ordering::Relaxed),
            panic_count: self.panic_count.load(Ordering::Relaxed),
            last_panic: self.last_panic.load(Ordering::Relaxed),
            msgque_count: 0,
            started_at: self.started_at,
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            messages_sent = snapshot.messages_sent,
            messages_received = snapshot.messages_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            compressed = snapshot.compressed,
            parse_errors = snapshot.parse_errors,
            go_count = snapshot.go_count,
            pool_go_count = snapshot.pool_go_count,
            panic_count = snapshot.panic_count,
            uptime_seconds = snapshot.uptime_seconds,
            "Runtime metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub compressed: u64,
    pub parse_errors: u64,
    pub go_count: i64,
    pub pool_go_count: i64,
    pub panic_count: u64,
    pub last_panic: u64,
    /// Connections in the registry, filled in by the runtime
    pub msgque_count: usize,
    pub started_at: SystemTime,
    pub uptime_seconds: u64,
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_counters() {
        let m = Metrics::new();
        m.connection_established();
        m.connection_established();
        m.connection_closed();
        let snap = m.snapshot();
        assert_eq!(snap.connections_total, 2);
        assert_eq!(snap.connections_active, 1);
    }

    #[test]
    fn test_panic_records_time() {
        let m = Metrics::new();
        m.panic_caught(1_700_000_000);
        let snap = m.snapshot();
        assert_eq!(snap.panic_count, 1);
        assert_eq!(snap.last_panic, 1_700_000_000);
    }
}
