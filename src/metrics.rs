//! Per-engine counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Lifecycle and traffic counters for one [`Engine`](crate::Engine)
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub streams_opened: AtomicU64,
    pub streams_closed: AtomicU64,
    pub listeners_opened: AtomicU64,
    pub listeners_closed: AtomicU64,
    /// Streams handed out by `accept`
    pub connections_accepted: AtomicU64,
    /// Drop-time releases that arrived after the engine stopped
    pub releases_skipped: AtomicU64,
    pub bytes_written: AtomicU64,
    pub bytes_read: AtomicU64,
}

impl EngineMetrics {
    pub fn stream_opened(&self) {
        self.streams_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_closed(&self) {
        self.streams_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn listener_opened(&self) {
        self.listeners_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn listener_closed(&self) {
        self.listeners_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn release_skipped(&self) {
        self.releases_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self, bytes: usize) {
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_read(&self, bytes: usize) {
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            streams_opened: self.streams_opened.load(Ordering::Relaxed),
            streams_closed: self.streams_closed.load(Ordering::Relaxed),
            listeners_opened: self.listeners_opened.load(Ordering::Relaxed),
            listeners_closed: self.listeners_closed.load(Ordering::Relaxed),
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            releases_skipped: self.releases_skipped.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub streams_opened: u64,
    pub streams_closed: u64,
    pub listeners_opened: u64,
    pub listeners_closed: u64,
    pub connections_accepted: u64,
    pub releases_skipped: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
}

impl MetricsSnapshot {
    pub fn active_streams(&self) -> u64 {
        self.streams_opened.saturating_sub(self.streams_closed)
    }

    pub fn active_listeners(&self) -> u64 {
        self.listeners_opened.saturating_sub(self.listeners_closed)
    }
}

/// Format metrics for human-readable display
pub fn format_metrics(snapshot: &MetricsSnapshot) -> String {
    format!(
        "KCP Engine Metrics:\n\
         Streams: {} opened, {} active, {} accepted\n\
         Listeners: {} opened, {} active\n\
         Traffic: {} bytes written, {} bytes read\n\
         Releases skipped after stop: {}",
        snapshot.streams_opened,
        snapshot.active_streams(),
        snapshot.connections_accepted,
        snapshot.listeners_opened,
        snapshot.active_listeners(),
        snapshot.bytes_written,
        snapshot.bytes_read,
        snapshot.releases_skipped,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_metrics() {
        let metrics = EngineMetrics::default();

        metrics.stream_opened();
        metrics.stream_opened();
        metrics.stream_closed();
        metrics.record_write(10);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.active_streams(), 1);
        assert_eq!(snapshot.bytes_written, 10);
        assert!(format_metrics(&snapshot).contains("2 opened, 1 active"));
    }
}
