//! Metrics collection for observability
//!
//! Prometheus metrics for the sync queue and the LOS integration.
//!
//! # Metrics
//!
//! - `los_sync_enqueued_total` - Items accepted by the queue
//! - `los_sync_outcomes_total{status}` - Terminal and retry outcomes
//! - `los_sync_queue_depth{state}` - Items per queue state
//! - `los_sync_external_call_duration_seconds` - LOS call latencies
//! - `los_sync_loop_iterations_total` - Worker loop iterations

use crate::types::QueueDepth;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct SyncMetrics {
    /// Items enqueued
    pub enqueued_total: IntCounter,

    /// Outcomes by status label
    pub outcomes_total: IntCounterVec,

    /// Queue depth by state label
    pub queue_depth: IntGaugeVec,

    /// LOS call latency
    pub external_call_duration: Histogram,

    /// Worker loop iterations
    pub loop_iterations: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl std::fmt::Debug for SyncMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncMetrics").finish_non_exhaustive()
    }
}

impl SyncMetrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let enqueued_total = IntCounter::new(
            "los_sync_enqueued_total",
            "Total number of sync items enqueued",
        )?;
        registry.register(Box::new(enqueued_total.clone()))?;

        let outcomes_total = IntCounterVec::new(
            Opts::new("los_sync_outcomes_total", "Sync item outcomes by status"),
            &["status"],
        )?;
        registry.register(Box::new(outcomes_total.clone()))?;

        let queue_depth = IntGaugeVec::new(
            Opts::new("los_sync_queue_depth", "Sync items per queue state"),
            &["state"],
        )?;
        registry.register(Box::new(queue_depth.clone()))?;

        let external_call_duration = Histogram::with_opts(
            HistogramOpts::new(
                "los_sync_external_call_duration_seconds",
                "Histogram of LOS call latencies",
            )
            .buckets(vec![0.010, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0]),
        )?;
        registry.register(Box::new(external_call_duration.clone()))?;

        let loop_iterations = IntCounter::new(
            "los_sync_loop_iterations_total",
            "Total number of worker loop iterations",
        )?;
        registry.register(Box::new(loop_iterations.clone()))?;

        Ok(Self {
            enqueued_total,
            outcomes_total,
            queue_depth,
            external_call_duration,
            loop_iterations,
            registry,
        })
    }

    /// Record an accepted item
    pub fn record_enqueued(&self) {
        self.enqueued_total.inc();
    }

    /// Record an outcome (`success`, `error`, `dead_letter`, `retry`)
    pub fn record_outcome(&self, status: &str) {
        self.outcomes_total.with_label_values(&[status]).inc();
    }

    /// Publish queue depth gauges
    pub fn update_queue_depth(&self, depth: &QueueDepth) {
        self.queue_depth
            .with_label_values(&["pending"])
            .set(depth.pending as i64);
        self.queue_depth
            .with_label_values(&["in_flight"])
            .set(depth.in_flight as i64);
        self.queue_depth
            .with_label_values(&["dead_letter"])
            .set(depth.dead_letter as i64);
    }

    /// Record LOS call duration
    pub fn record_external_call(&self, duration_seconds: f64) {
        self.external_call_duration.observe(duration_seconds);
    }

    /// Record a worker loop iteration
    pub fn record_loop_iteration(&self) {
        self.loop_iterations.inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render in the Prometheus text format
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
