//! Prometheus metrics owned by one orchestrator instance

use std::time::Instant;

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Metric registry and handles for the filtering engine
pub struct Metrics {
    registry: Registry,

    // Counters
    pub sessions_started: IntCounter,
    pub sessions_completed: IntCounterVec,
    pub sessions_deferred: IntCounter,
    pub session_start_failures: IntCounter,
    pub fragments_filtered: IntCounterVec,
    pub fragments_kept: IntCounter,
    pub classifier_requests: IntCounter,
    pub classifier_failures: IntCounter,
    pub decisions_discarded: IntCounter,

    // Gauges
    pub active_sessions: IntGauge,
    pub queue_depth: IntGauge,
    pub cache_entries: IntGauge,

    // Histograms
    pub session_duration: Histogram,
    pub classifier_latency: Histogram,
    pub viewport_pass_latency: Histogram,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new_custom(Some("progressive_filter".to_string()), None)?;

        let sessions_started =
            IntCounter::with_opts(Opts::new("sessions_started_total", "Filtering sessions started"))?;

        let sessions_completed = IntCounterVec::new(
            Opts::new("sessions_completed_total", "Filtering sessions completed, by reason"),
            &["reason"],
        )?;

        let sessions_deferred = IntCounter::with_opts(Opts::new(
            "sessions_deferred_total",
            "Start requests answered by the already active session",
        ))?;

        let session_start_failures = IntCounter::with_opts(Opts::new(
            "session_start_failures_total",
            "Start requests failed by the lock subsystem",
        ))?;

        let fragments_filtered = IntCounterVec::new(
            Opts::new("fragments_filtered_total", "Fragments hidden, by decision source"),
            &["source"],
        )?;

        let fragments_kept =
            IntCounter::with_opts(Opts::new("fragments_kept_total", "Fragments judged keep"))?;

        let classifier_requests = IntCounter::with_opts(Opts::new(
            "classifier_requests_total",
            "Batches submitted to the classifier",
        ))?;

        let classifier_failures = IntCounter::with_opts(Opts::new(
            "classifier_failures_total",
            "Classifier submissions that failed or timed out",
        ))?;

        let decisions_discarded = IntCounter::with_opts(Opts::new(
            "decisions_discarded_total",
            "Classifier decisions dropped as stale or unknown",
        ))?;

        let active_sessions =
            IntGauge::with_opts(Opts::new("active_sessions", "Currently active sessions (0 or 1)"))?;

        let queue_depth =
            IntGauge::with_opts(Opts::new("queue_depth", "Work items awaiting a decision"))?;

        let cache_entries =
            IntGauge::with_opts(Opts::new("cache_entries", "Live analysis cache entries"))?;

        let session_duration = Histogram::with_opts(
            HistogramOpts::new("session_duration_seconds", "Filtering session lifetime")
                .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 120.0, 300.0, 600.0]),
        )?;

        let classifier_latency = Histogram::with_opts(
            HistogramOpts::new("classifier_latency_seconds", "Classifier round-trip latency")
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;

        let viewport_pass_latency = Histogram::with_opts(
            HistogramOpts::new("viewport_pass_seconds", "Synchronous viewport pass duration")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.2, 0.5]),
        )?;

        registry.register(Box::new(sessions_started.clone()))?;
        registry.register(Box::new(sessions_completed.clone()))?;
        registry.register(Box::new(sessions_deferred.clone()))?;
        registry.register(Box::new(session_start_failures.clone()))?;
        registry.register(Box::new(fragments_filtered.clone()))?;
        registry.register(Box::new(fragments_kept.clone()))?;
        registry.register(Box::new(classifier_requests.clone()))?;
        registry.register(Box::new(classifier_failures.clone()))?;
        registry.register(Box::new(decisions_discarded.clone()))?;
        registry.register(Box::new(active_sessions.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(cache_entries.clone()))?;
        registry.register(Box::new(session_duration.clone()))?;
        registry.register(Box::new(classifier_latency.clone()))?;
        registry.register(Box::new(viewport_pass_latency.clone()))?;

        Ok(Self {
            registry,
            sessions_started,
            sessions_completed,
            sessions_deferred,
            session_start_failures,
            fragments_filtered,
            fragments_kept,
            classifier_requests,
            classifier_failures,
            decisions_discarded,
            active_sessions,
            queue_depth,
            cache_entries,
            session_duration,
            classifier_latency,
            viewport_pass_latency,
        })
    }

    /// Get the registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn gather_text(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Timer helper for measuring operation duration
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn observe_duration(&self, histogram: &Histogram) {
        histogram.observe(self.elapsed_secs());
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
