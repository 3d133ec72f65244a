//! Pipeline metrics
//!
//! Counters shared by the connector, the dispatcher and the management
//! surface. Everything is a relaxed atomic except the callback latency
//! window, which sits behind a mutex.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Counters for one pipeline instance.
pub struct PipelineMetrics {
    // Connection
    pub connects: AtomicU64,
    pub connect_failures: AtomicU64,
    pub disconnects: AtomicU64,

    // Decoding
    pub records_decoded: AtomicU64,
    pub decode_errors: AtomicU64,
    pub decode_errors_skipped: AtomicU64,

    // Dispatch
    pub records_dispatched: AtomicU64,
    pub processing_failures: AtomicU64,
    pub records_dropped: AtomicU64,
    pub dispatch_latency_ns: Mutex<LatencyTracker>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            connects: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            disconnects: AtomicU64::new(0),
            records_decoded: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            decode_errors_skipped: AtomicU64::new(0),
            records_dispatched: AtomicU64::new(0),
            processing_failures: AtomicU64::new(0),
            records_dropped: AtomicU64::new(0),
            dispatch_latency_ns: Mutex::new(LatencyTracker::new(1000)),
        }
    }

    pub fn record_connect(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decoded(&self) {
        self.records_decoded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a decode error; `skipped` when the read phase carried on.
    pub fn record_decode_error(&self, skipped: bool) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
        if skipped {
            self.decode_errors_skipped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a record handed to the application callback.
    pub fn record_dispatched(&self, latency_ns: u64) {
        self.records_dispatched.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut tracker) = self.dispatch_latency_ns.lock() {
            tracker.record(latency_ns);
        }
    }

    pub fn record_processing_failure(&self) {
        self.processing_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.records_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// p99 callback latency over the recent window.
    pub fn dispatch_latency_p99(&self) -> Option<u64> {
        self.dispatch_latency_ns
            .lock()
            .ok()
            .and_then(|tracker| tracker.percentile(99))
    }

    /// Export counters as a sorted map.
    pub fn export(&self) -> BTreeMap<String, u64> {
        let mut m = BTreeMap::new();
        m.insert("connects".to_string(), self.connects.load(Ordering::Relaxed));
        m.insert("connect_failures".to_string(), self.connect_failures.load(Ordering::Relaxed));
        m.insert("disconnects".to_string(), self.disconnects.load(Ordering::Relaxed));
        m.insert("records_decoded".to_string(), self.records_decoded.load(Ordering::Relaxed));
        m.insert("decode_errors".to_string(), self.decode_errors.load(Ordering::Relaxed));
        m.insert("decode_errors_skipped".to_string(), self.decode_errors_skipped.load(Ordering::Relaxed));
        m.insert("records_dispatched".to_string(), self.records_dispatched.load(Ordering::Relaxed));
        m.insert("processing_failures".to_string(), self.processing_failures.load(Ordering::Relaxed));
        m.insert("records_dropped".to_string(), self.records_dropped.load(Ordering::Relaxed));
        if let Some(p99) = self.dispatch_latency_p99() {
            m.insert("dispatch_latency_p99_ns".to_string(), p99);
        }
        m
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Sliding window of the most recent callback latencies.
pub struct LatencyTracker {
    window: VecDeque<u64>,
    capacity: usize,
}

impl LatencyTracker {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Add a sample, evicting the oldest once the window is full.
    pub fn record(&mut self, value: u64) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(value);
    }

    /// Nearest-rank percentile (0-100) over the window.
    pub fn percentile(&self, p: usize) -> Option<u64> {
        let last = self.window.len().checked_sub(1)?;
        let mut sorted: Vec<u64> = self.window.iter().copied().collect();
        let rank = (p.min(100) * last) / 100;
        let (_, value, _) = sorted.select_nth_unstable(rank);
        Some(*value)
    }

    pub fn count(&self) -> usize {
        self.window.len()
    }
}
