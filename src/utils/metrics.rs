//! Observability and Metrics
//!
//! Per-connection counters for packet and stream activity.
//!
//! Uses atomic counters for thread-safe metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Metrics collector for one connection
#[derive(Debug)]
pub struct Metrics {
    /// Packets handed to the plugin
    pub packets_sent: AtomicU64,
    /// Packets answered with a Fulfill
    pub packets_fulfilled: AtomicU64,
    /// Packets answered with a Reject of any kind
    pub packets_rejected: AtomicU64,
    /// Rejections that narrowed the packet amount search
    pub capacity_rejections: AtomicU64,
    /// `T..` rejections
    pub temporary_rejections: AtomicU64,
    /// Plugin errors and unreadable replies
    pub transport_failures: AtomicU64,
    /// Packets that hit the per-packet deadline
    pub timeouts: AtomicU64,
    /// Encoded bytes sent
    pub bytes_sent: AtomicU64,
    /// Encoded bytes received from the peer
    pub bytes_received: AtomicU64,
    /// Prepares handled for the peer
    pub packets_received: AtomicU64,
    /// Streams created locally or by the peer
    pub streams_opened: AtomicU64,
    /// Streams whose close was announced or received
    pub streams_closed: AtomicU64,
    /// Payments abandoned because no amount could be sent
    pub terminal_failures: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            packets_sent: AtomicU64::new(0),
            packets_fulfilled: AtomicU64::new(0),
            packets_rejected: AtomicU64::new(0),
            capacity_rejections: AtomicU64::new(0),
            temporary_rejections: AtomicU64::new(0),
            transport_failures: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            streams_opened: AtomicU64::new(0),
            streams_closed: AtomicU64::new(0),
            terminal_failures: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a packet handed to the plugin
    pub fn packet_sent(&self, byte_count: u64) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn packet_fulfilled(&self) {
        self.packets_fulfilled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_rejected(&self) {
        self.packets_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn capacity_rejection(&self) {
        self.capacity_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn temporary_rejection(&self) {
        self.temporary_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transport_failure(&self) {
        self.transport_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a Prepare handled for the peer
    pub fn packet_received(&self, byte_count: u64) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn stream_opened(&self) {
        self.streams_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_closed(&self) {
        self.streams_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn terminal_failure(&self) {
        self.terminal_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_fulfilled: self.packets_fulfilled.load(Ordering::Relaxed),
            packets_rejected: self.packets_rejected.load(Ordering::Relaxed),
            capacity_rejections: self.capacity_rejections.load(Ordering::Relaxed),
            temporary_rejections: self.temporary_rejections.load(Ordering::Relaxed),
            transport_failures: self.transport_failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            streams_opened: self.streams_opened.load(Ordering::Relaxed),
            streams_closed: self.streams_closed.load(Ordering::Relaxed),
            terminal_failures: self.terminal_failures.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            packets_sent = snapshot.packets_sent,
            packets_fulfilled = snapshot.packets_fulfilled,
            packets_rejected = snapshot.packets_rejected,
            capacity_rejections = snapshot.capacity_rejections,
            temporary_rejections = snapshot.temporary_rejections,
            transport_failures = snapshot.transport_failures,
            timeouts = snapshot.timeouts,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            packets_received = snapshot.packets_received,
            streams_opened = snapshot.streams_opened,
            streams_closed = snapshot.streams_closed,
            terminal_failures = snapshot.terminal_failures,
            uptime_seconds = snapshot.uptime_seconds,
            "Connection metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub packets_sent: u64,
    pub packets_fulfilled: u64,
    pub packets_rejected: u64,
    pub capacity_rejections: u64,
    pub temporary_rejections: u64,
    pub transport_failures: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_received: u64,
    pub streams_opened: u64,
    pub streams_closed: u64,
    pub terminal_failures: u64,
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
    fn test_counters_show_in_snapshot() {
        let metrics = Metrics::new();
        metrics.packet_sent(40);
        metrics.packet_sent(2);
        metrics.packet_rejected();
        metrics.capacity_rejection();
        metrics.stream_opened();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.packets_sent, 2);
        assert_eq!(snapshot.bytes_sent, 42);
        assert_eq!(snapshot.packets_rejected, 1);
        assert_eq!(snapshot.capacity_rejections, 1);
        assert_eq!(snapshot.streams_opened, 1);
        assert_eq!(snapshot.packets_fulfilled, 0);
    }
}
