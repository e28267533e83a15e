//! Connection multiplexer metrics.

use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

#[derive(Debug, Clone, Default, Serialize)]
/// Snapshot of multiplexer metrics at a point in time.
pub struct MetricsSnapshot {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub active_connections: u32,
    /// Accepted connections that run TLS.
    pub tls_connections: u64,
    pub transitions_total: u64,
    /// Transitions that failed and closed their channel.
    pub transition_errors: u64,
    /// Readiness reports synthesized by wake-ups rather than the socket.
    pub wakeups_total: u64,
    /// Events merged into a transition already running on the same channel.
    pub coalesced_events: u64,
}

/// Thread-safe multiplexer metrics collector.
pub struct TransportMetrics {
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    active_connections: AtomicU32,
    tls_connections: AtomicU64,
    transitions_total: AtomicU64,
    transition_errors: AtomicU64,
    wakeups_total: AtomicU64,
    coalesced_events: AtomicU64,
}

impl Default for TransportMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransportMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl TransportMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            active_connections: AtomicU32::new(0),
            tls_connections: AtomicU64::new(0),
            transitions_total: AtomicU64::new(0),
            transition_errors: AtomicU64::new(0),
            wakeups_total: AtomicU64::new(0),
            coalesced_events: AtomicU64::new(0),
        }
    }

    /// Records a new connection, incrementing both the opened counter and active connections.
    pub fn connection_opened(&self, secure: bool) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        if secure {
            self.tls_connections.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a closed connection, decrementing active connections.
    pub fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    pub fn inc_transitions(&self) {
        self.transitions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_transition_errors(&self) {
        self.transition_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_wakeups(&self) {
        self.wakeups_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_coalesced(&self) {
        self.coalesced_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a snapshot of all current metric values.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            tls_connections: self.tls_connections.load(Ordering::Relaxed),
            transitions_total: self.transitions_total.load(Ordering::Relaxed),
            transition_errors: self.transition_errors.load(Ordering::Relaxed),
            wakeups_total: self.wakeups_total.load(Ordering::Relaxed),
            coalesced_events: self.coalesced_events.load(Ordering::Relaxed),
        }
    }
}
