//! Telemetry with atomic counters and JSON export

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

const MAX_LATENCY_SAMPLES: usize = 1000;

/// Atomic counters updated on the hot path
#[derive(Debug, Default)]
pub struct EngineTelemetry {
    pub sessions_started: AtomicU64,
    pub sessions_completed: AtomicU64,
    /// Starts answered with `deferred_to_existing`
    pub sessions_deferred: AtomicU64,
    pub handoffs: AtomicU64,
    pub session_timeouts: AtomicU64,
    pub emergency_stops: AtomicU64,
    /// Starts that failed on the lock subsystem
    pub start_failures: AtomicU64,
    pub fragments_processed: AtomicU64,
    pub fragments_filtered: AtomicU64,
    pub fragments_kept: AtomicU64,
    pub cache_hits: AtomicU64,
    pub similarity_hits: AtomicU64,
    pub classifier_requests: AtomicU64,
    pub classifier_failures: AtomicU64,
    pub decisions_applied: AtomicU64,
    pub decisions_discarded: AtomicU64,
    pub visibility_errors: AtomicU64,
    pub mutation_batches: AtomicU64,
    pub scroll_events: AtomicU64,
    pub scroll_events_throttled: AtomicU64,
    pub queue_depth: AtomicU64,
    /// Viewport pass latencies in microseconds
    viewport_latency_us: Mutex<VecDeque<u64>>,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub sessions_started: u64,
    pub sessions_completed: u64,
    pub sessions_deferred: u64,
    pub handoffs: u64,
    pub session_timeouts: u64,
    pub emergency_stops: u64,
    pub start_failures: u64,
    pub fragments_processed: u64,
    pub fragments_filtered: u64,
    pub fragments_kept: u64,
    pub cache_hits: u64,
    pub similarity_hits: u64,
    pub classifier_requests: u64,
    pub classifier_failures: u64,
    pub decisions_applied: u64,
    pub decisions_discarded: u64,
    pub visibility_errors: u64,
    pub mutation_batches: u64,
    pub scroll_events: u64,
    pub scroll_events_throttled: u64,
    pub queue_depth: u64,
    pub viewport_p50_us: Option<u64>,
    pub viewport_p99_us: Option<u64>,
}

#[inline]
fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

impl EngineTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.store(depth as u64, Ordering::Relaxed);
    }

    /// Record the duration of one synchronous viewport pass
    pub fn record_viewport_latency(&self, latency_us: u64) {
        let mut samples = self.viewport_latency_us.lock();
        if samples.len() >= MAX_LATENCY_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(latency_us);
    }

    /// Viewport pass latency percentile, `None` without samples
    pub fn viewport_percentile(&self, percentile: f64) -> Option<u64> {
        let samples = self.viewport_latency_us.lock();
        if samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = samples.iter().copied().collect();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64 * percentile) as usize).min(sorted.len() - 1);
        Some(sorted[idx])
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            sessions_started: load(&self.sessions_started),
            sessions_completed: load(&self.sessions_completed),
            sessions_deferred: load(&self.sessions_deferred),
            handoffs: load(&self.handoffs),
            session_timeouts: load(&self.session_timeouts),
            emergency_stops: load(&self.emergency_stops),
            start_failures: load(&self.start_failures),
            fragments_processed: load(&self.fragments_processed),
            fragments_filtered: load(&self.fragments_filtered),
            fragments_kept: load(&self.fragments_kept),
            cache_hits: load(&self.cache_hits),
            similarity_hits: load(&self.similarity_hits),
            classifier_requests: load(&self.classifier_requests),
            classifier_failures: load(&self.classifier_failures),
            decisions_applied: load(&self.decisions_applied),
            decisions_discarded: load(&self.decisions_discarded),
            visibility_errors: load(&self.visibility_errors),
            mutation_batches: load(&self.mutation_batches),
            scroll_events: load(&self.scroll_events),
            scroll_events_throttled: load(&self.scroll_events_throttled),
            queue_depth: load(&self.queue_depth),
            viewport_p50_us: self.viewport_percentile(0.50),
            viewport_p99_us: self.viewport_percentile(0.99),
        }
    }

    /// Snapshot as a JSON document for dashboards
    pub fn snapshot_json(&self) -> String {
        serde_json::to_string(&self.snapshot()).unwrap_or_else(|_| "{}".to_string())
    }

    /// Reset all counters (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.sessions_started,
            &self.sessions_completed,
            &self.sessions_deferred,
            &self.handoffs,
            &self.session_timeouts,
            &self.emergency_stops,
            &self.start_failures,
            &self.fragments_processed,
            &self.fragments_filtered,
            &self.fragments_kept,
            &self.cache_hits,
            &self.similarity_hits,
            &self.classifier_requests,
            &self.classifier_failures,
            &self.decisions_applied,
            &self.decisions_discarded,
            &self.visibility_errors,
            &self.mutation_batches,
            &self.scroll_events,
            &self.scroll_events_throttled,
            &self.queue_depth,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.viewport_latency_us.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let telemetry = EngineTelemetry::new();
        EngineTelemetry::incr(&telemetry.sessions_started);
        EngineTelemetry::add(&telemetry.fragments_filtered, 3);
        telemetry.set_queue_depth(12);

        let snap = telemetry.snapshot();
        assert_eq!(snap.sessions_started, 1);
        assert_eq!(snap.fragments_filtered, 3);
        assert_eq!(snap.queue_depth, 12);
        assert_eq!(snap.viewport_p50_us, None);
    }

    #[test]
    fn test_json_snapshot() {
        let telemetry = EngineTelemetry::new();
        EngineTelemetry::incr(&telemetry.cache_hits);
        let json: serde_json::Value = serde_json::from_str(&telemetry.snapshot_json()).unwrap();
        assert_eq!(json["cache_hits"], 1);
        assert_eq!(json["handoffs"], 0);
    }

    #[test]
    fn test_percentiles() {
        let telemetry = EngineTelemetry::new();
        for v in 1..=100 {
            telemetry.record_viewport_latency(v);
        }
        assert_eq!(telemetry.viewport_percentile(0.5), Some(51));
        assert_eq!(telemetry.viewport_percentile(0.99), Some(100));
    }

    #[test]
    fn test_latency_ring_is_bounded() {
        let telemetry = EngineTelemetry::new();
        for v in 0..(MAX_LATENCY_SAMPLES as u64 + 10) {
            telemetry.record_viewport_latency(v);
        }
        assert_eq!(telemetry.viewport_percentile(0.0), Some(10));
    }

    #[test]
    fn test_reset() {
        let telemetry = EngineTelemetry::new();
        EngineTelemetry::incr(&telemetry.emergency_stops);
        telemetry.record_viewport_latency(5);
        telemetry.reset();
        assert_eq!(telemetry.snapshot(), TelemetrySnapshot::default());
    }
}
