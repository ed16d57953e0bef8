// ABOUTME: Metric sink for the proxy core
//
// Tracks:
// - Listener: connections accepted, connections dropped, accept errors
// - Dispatcher: messages dispatched, admission timeouts, replies relayed,
//   message errors, backend connects, workers lost, workers active
//
// The core only increments. Readers (tests, an exporter) call `count()`.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Increment by `n`
    pub fn mark(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value
    pub fn count(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Value that moves both ways
#[derive(Debug, Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    /// Add one
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Subtract one
    pub fn decrement(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    /// Current value
    pub fn value(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Listener-side metrics
#[derive(Debug, Default)]
pub struct ListenerMetrics {
    pub connections_accepted: Counter,
    pub connections_dropped: Counter,
    pub accept_errors: Counter,
}

impl ListenerMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Dispatcher-side metrics
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    pub messages_dispatched: Counter,
    pub dispatch_timeouts: Counter,
    pub replies_relayed: Counter,
    pub message_errors: Counter,
    /// Requests whose client stopped waiting before the relay finished
    pub messages_abandoned: Counter,
    pub backend_connects: Counter,
    /// Workers that exhausted their reconnect budget and exited
    pub workers_lost: Counter,
    pub workers_active: Gauge,
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Both halves of the sink, shared with the components that increment them
#[derive(Debug, Clone, Default)]
pub struct ProxyMetrics {
    pub listener: Arc<ListenerMetrics>,
    pub dispatch: Arc<DispatchMetrics>,
}
