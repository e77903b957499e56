use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OperationLabels {
    pub operation: String,
    pub outcome: Outcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OperationKindLabels {
    pub operation: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Success,
    Failure,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct JobLabels {
    pub outcome: JobOutcomeLabel,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum JobOutcomeLabel {
    Fetched,
    Failed,
    Requeued,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every metric recorded by the clone registry and the fetch worker.
pub struct Metrics {
    // -- clone operations --
    pub operations_total: Family<OperationLabels, Counter>,
    pub operation_duration_seconds: Family<OperationKindLabels, Histogram>,

    // -- worker --
    pub fetch_jobs_total: Family<JobLabels, Counter>,
    pub jobs_enqueued: Counter,
    pub jobs_coalesced: Counter,
    pub jobs_recovered: Counter,

    // -- locks --
    pub lock_acquisitions: Counter,
    pub lock_waits: Counter,
    pub lock_timeouts: Counter,

    // -- gauges --
    pub open_clones: Gauge,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let operations_total = Family::<OperationLabels, Counter>::default();
        registry.register(
            "clonekeeper_operations_total",
            "Clone operations by kind and outcome",
            operations_total.clone(),
        );

        let operation_duration_seconds =
            Family::<OperationKindLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.01, 2.0, 14))
            });
        registry.register(
            "clonekeeper_operation_duration_seconds",
            "Clone operation latency in seconds, including time waiting for the repo",
            operation_duration_seconds.clone(),
        );

        let fetch_jobs_total = Family::<JobLabels, Counter>::default();
        registry.register(
            "clonekeeper_fetch_jobs_total",
            "Fetch jobs handled by the worker, by outcome",
            fetch_jobs_total.clone(),
        );

        let jobs_enqueued = Counter::default();
        registry.register(
            "clonekeeper_jobs_enqueued_total",
            "Fetch jobs added to the queue",
            jobs_enqueued.clone(),
        );

        let jobs_coalesced = Counter::default();
        registry.register(
            "clonekeeper_jobs_coalesced_total",
            "Fetch requests folded into an already pending job",
            jobs_coalesced.clone(),
        );

        let jobs_recovered = Counter::default();
        registry.register(
            "clonekeeper_jobs_recovered_total",
            "In-flight jobs returned to the queue on worker start",
            jobs_recovered.clone(),
        );

        let lock_acquisitions = Counter::default();
        registry.register(
            "clonekeeper_lock_acquisitions_total",
            "Distributed fetch lock acquisitions",
            lock_acquisitions.clone(),
        );

        let lock_waits = Counter::default();
        registry.register(
            "clonekeeper_lock_waits_total",
            "Distributed fetch lock wait events",
            lock_waits.clone(),
        );

        let lock_timeouts = Counter::default();
        registry.register(
            "clonekeeper_lock_timeouts_total",
            "Distributed fetch lock timeout events",
            lock_timeouts.clone(),
        );

        let open_clones: Gauge = Gauge::default();
        registry.register(
            "clonekeeper_open_clones",
            "Clones opened by this process",
            open_clones.clone(),
        );

        Self {
            operations_total,
            operation_duration_seconds,
            fetch_jobs_total,
            jobs_enqueued,
            jobs_coalesced,
            jobs_recovered,
            lock_acquisitions,
            lock_waits,
            lock_timeouts,
            open_clones,
        }
    }

    pub fn record_operation(&self, operation: &str, success: bool, seconds: f64) {
        let outcome = if success {
            Outcome::Success
        } else {
            Outcome::Failure
        };
        self.operations_total
            .get_or_create(&OperationLabels {
                operation: operation.to_string(),
                outcome,
            })
            .inc();
        self.operation_duration_seconds
            .get_or_create(&OperationKindLabels {
                operation: operation.to_string(),
            })
            .observe(seconds);
    }

    pub fn record_job(&self, outcome: JobOutcomeLabel) {
        self.fetch_jobs_total
            .get_or_create(&JobLabels { outcome })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Err(e) = prometheus_client::encoding::text::encode(&mut out, &self.registry) {
            tracing::warn!(error = %e, "failed to encode metrics");
        }
        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_recorded_operations() {
        let registry = MetricsRegistry::new();
        registry.metrics.record_operation("fetch", true, 0.2);
        registry.metrics.record_job(JobOutcomeLabel::Failed);
        let text = registry.render();
        assert!(text.contains("clonekeeper_operations_total"));
        assert!(text.contains("operation=\"fetch\""));
        assert!(text.contains("outcome=\"Failed\""));
    }
}
