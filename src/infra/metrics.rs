//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention. All
//! counter updates are lock-free; reporting swaps the interval counters
//! for a consistent snapshot.
//!
//! NOTE: All atomics use Relaxed ordering intentionally—these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
pub const METRICS_BUCKET_BOUNDS: [u64; 10] =
    [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
pub const METRICS_NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    METRICS_BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics. The `report()`
/// method swaps interval counters to get a consistent snapshot; monotonic
/// totals are only loaded.
pub struct Metrics {
    /// Events accepted at the ingest boundary (monotonic)
    events_received: AtomicU64,
    /// Events dropped because an ingest shard was full (monotonic)
    ingest_dropped: AtomicU64,
    /// Events run through the engine (monotonic)
    events_processed: AtomicU64,
    /// Events since last report (reset on report)
    events_since_report: AtomicU64,
    /// Sum of engine latencies in microseconds (reset on report)
    latency_sum_us: AtomicU64,
    /// Max engine latency in microseconds (reset on report)
    latency_max_us: AtomicU64,
    /// Engine latency histogram buckets (monotonic)
    latency_buckets: [AtomicU64; METRICS_NUM_BUCKETS],
    /// Deliveries opened (monotonic)
    deliveries_opened: AtomicU64,
    /// Deliveries closed (monotonic)
    deliveries_closed: AtomicU64,
    /// No-op transitions absorbed by the table (monotonic)
    noop_transitions: AtomicU64,
    /// Events rejected for an invalid status value (monotonic)
    invalid_events: AtomicU64,
    /// Events rejected for an unregistered gate (monotonic)
    unknown_gate_events: AtomicU64,
    /// Lease acquisition failures (monotonic)
    lock_contention: AtomicU64,
    /// Ledger conflict / invalid-state failures (monotonic)
    ledger_conflicts: AtomicU64,
    /// Task retries scheduled (monotonic)
    task_retries: AtomicU64,
    /// Tasks that exhausted retries or failed terminally (monotonic)
    tasks_failed: AtomicU64,
    /// Effect intents dropped because the channel was full (monotonic)
    effects_dropped: AtomicU64,
    /// Outbound notification failures (monotonic)
    notify_failures: AtomicU64,
    /// Progress snapshots emitted (monotonic)
    snapshots_emitted: AtomicU64,
    /// When the last report was taken
    last_report: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            events_received: AtomicU64::new(0),
            ingest_dropped: AtomicU64::new(0),
            events_processed: AtomicU64::new(0),
            events_since_report: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_max_us: AtomicU64::new(0),
            latency_buckets: Default::default(),
            deliveries_opened: AtomicU64::new(0),
            deliveries_closed: AtomicU64::new(0),
            noop_transitions: AtomicU64::new(0),
            invalid_events: AtomicU64::new(0),
            unknown_gate_events: AtomicU64::new(0),
            lock_contention: AtomicU64::new(0),
            ledger_conflicts: AtomicU64::new(0),
            task_retries: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            effects_dropped: AtomicU64::new(0),
            notify_failures: AtomicU64::new(0),
            snapshots_emitted: AtomicU64::new(0),
            last_report: parking_lot::Mutex::new(Instant::now()),
        }
    }

    pub fn record_event_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ingest_dropped(&self) {
        self.ingest_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_processed(&self, latency_us: u64) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);
        self.events_since_report.fetch_add(1, Ordering::Relaxed);
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        update_atomic_max(&self.latency_max_us, latency_us);
        self.latency_buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery_opened(&self) {
        self.deliveries_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery_closed(&self) {
        self.deliveries_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_noop_transition(&self) {
        self.noop_transitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid_event(&self) {
        self.invalid_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unknown_gate(&self) {
        self.unknown_gate_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_contention(&self) {
        self.lock_contention.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ledger_conflict(&self) {
        self.ledger_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_retry(&self) {
        self.task_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_effect_dropped(&self) {
        self.effects_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_notify_failure(&self) {
        self.notify_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_snapshot_emitted(&self) {
        self.snapshots_emitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Load current bucket values without resetting
    pub fn latency_buckets(&self) -> [u64; METRICS_NUM_BUCKETS] {
        let mut result = [0u64; METRICS_NUM_BUCKETS];
        for (i, bucket) in self.latency_buckets.iter().enumerate() {
            result[i] = bucket.load(Ordering::Relaxed);
        }
        result
    }

    /// Snapshot all counters; interval counters reset
    pub fn report(&self) -> MetricsSummary {
        let now = Instant::now();
        let elapsed = {
            let mut last = self.last_report.lock();
            let elapsed = now.duration_since(*last);
            *last = now;
            elapsed
        };

        let events_interval = self.events_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.latency_sum_us.swap(0, Ordering::Relaxed);
        let latency_max = self.latency_max_us.swap(0, Ordering::Relaxed);
        let avg_latency = if events_interval > 0 { latency_sum / events_interval } else { 0 };
        let events_per_sec = if elapsed.as_secs_f64() > 0.0 {
            events_interval as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        MetricsSummary {
            events_received: self.events_received.load(Ordering::Relaxed),
            ingest_dropped: self.ingest_dropped.load(Ordering::Relaxed),
            events_processed: self.events_processed.load(Ordering::Relaxed),
            events_per_sec,
            avg_latency_us: avg_latency,
            max_latency_us: latency_max,
            deliveries_opened: self.deliveries_opened.load(Ordering::Relaxed),
            deliveries_closed: self.deliveries_closed.load(Ordering::Relaxed),
            noop_transitions: self.noop_transitions.load(Ordering::Relaxed),
            invalid_events: self.invalid_events.load(Ordering::Relaxed),
            unknown_gate_events: self.unknown_gate_events.load(Ordering::Relaxed),
            lock_contention: self.lock_contention.load(Ordering::Relaxed),
            ledger_conflicts: self.ledger_conflicts.load(Ordering::Relaxed),
            task_retries: self.task_retries.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            effects_dropped: self.effects_dropped.load(Ordering::Relaxed),
            notify_failures: self.notify_failures.load(Ordering::Relaxed),
            snapshots_emitted: self.snapshots_emitted.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of all metric counters
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub events_received: u64,
    pub ingest_dropped: u64,
    pub events_processed: u64,
    pub events_per_sec: f64,
    pub avg_latency_us: u64,
    pub max_latency_us: u64,
    pub deliveries_opened: u64,
    pub deliveries_closed: u64,
    pub noop_transitions: u64,
    pub invalid_events: u64,
    pub unknown_gate_events: u64,
    pub lock_contention: u64,
    pub ledger_conflicts: u64,
    pub task_retries: u64,
    pub tasks_failed: u64,
    pub effects_dropped: u64,
    pub notify_failures: u64,
    pub snapshots_emitted: u64,
}

impl MetricsSummary {
    /// Log the summary in the periodic reporter
    pub fn log(&self) {
        info!(
            events_received = %self.events_received,
            events_processed = %self.events_processed,
            events_per_sec = %format!("{:.2}", self.events_per_sec),
            avg_latency_us = %self.avg_latency_us,
            max_latency_us = %self.max_latency_us,
            deliveries_opened = %self.deliveries_opened,
            deliveries_closed = %self.deliveries_closed,
            noop_transitions = %self.noop_transitions,
            invalid_events = %self.invalid_events,
            unknown_gate_events = %self.unknown_gate_events,
            lock_contention = %self.lock_contention,
            ledger_conflicts = %self.ledger_conflicts,
            task_retries = %self.task_retries,
            tasks_failed = %self.tasks_failed,
            effects_dropped = %self.effects_dropped,
            notify_failures = %self.notify_failures,
            snapshots_emitted = %self.snapshots_emitted,
            "metrics_summary"
        );
    }
}
