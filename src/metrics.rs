//! Per-variant request metrics.
//!
//! ## Responsibility
//! Count requests, errors and latency for every variant that served traffic,
//! and expose them both as structured snapshots and in the Prometheus text
//! exposition format.
//!
//! ## Guarantees
//! - `record` takes no global lock: counters are per-variant `AtomicU64`s
//!   reached through a sharded [`DashMap`]
//! - Per-field atomicity only; a snapshot is not a cross-variant transaction
//! - Names are recorded as given, even for variants that are no longer
//!   configured; history is kept until [`MetricsAggregator::purge`]
//! - Each aggregator owns its Prometheus [`Registry`]; there is no process-wide
//!   metrics singleton
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `ab_test_requests_total` | Counter | `variant_name`, `variant_version` |
//! | `ab_test_errors_total` | Counter | `variant_name`, `variant_version` |
//! | `ab_test_prediction_duration_seconds` | Histogram | `variant_name`, `variant_version` |
//!
//! Structured snapshots are keyed by name only; the version label splits the
//! Prometheus series so two deployments of one variant stay distinguishable.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use serde::Serialize;

use crate::config::MetricsConfig;
use crate::RouterError;

/// How a routed request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The model returned a prediction.
    Success,
    /// The model returned an error or timed out.
    Error,
    /// The caller gave up before the model answered.
    Cancelled,
}

impl Outcome {
    /// Return `true` for outcomes counted as errors.
    pub fn is_error(self) -> bool {
        !matches!(self, Outcome::Success)
    }
}

/// Point-in-time copy of a latency histogram.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyHistogram {
    /// Upper bounds in seconds, strictly increasing.
    pub bounds: Vec<f64>,
    /// Per-bucket (non-cumulative) counts. One longer than `bounds`; the last
    /// entry holds observations above the highest bound.
    pub counts: Vec<u64>,
    /// Sum of all observed latencies, in seconds.
    pub sum_seconds: f64,
}

impl LatencyHistogram {
    /// Total number of observations.
    pub fn count(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Mean latency, or `None` before the first observation.
    pub fn mean_seconds(&self) -> Option<f64> {
        match self.count() {
            0 => None,
            n => Some(self.sum_seconds / n as f64),
        }
    }
}

/// Snapshot of one variant's counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsRecord {
    /// Requests recorded, whatever the outcome.
    pub request_count: u64,
    /// Requests that ended in [`Outcome::Error`] or [`Outcome::Cancelled`].
    pub error_count: u64,
    /// Subset of `error_count` that were cancelled by the caller.
    pub cancelled_count: u64,
    /// Latency distribution.
    pub latency: LatencyHistogram,
}

impl MetricsRecord {
    /// Fraction of requests that failed, 0.0 when nothing was recorded.
    pub fn error_rate(&self) -> f64 {
        if self.request_count == 0 {
            0.0
        } else {
            self.error_count as f64 / self.request_count as f64
        }
    }
}

// ── Internal counters ──────────────────────────────────────────────────────

/// Version label used by [`MetricsAggregator::record`].
pub const UNKNOWN_VERSION: &str = "unknown";

/// Prometheus children bound to one `(variant_name, variant_version)` pair.
struct PromHandles {
    requests: IntCounter,
    errors: IntCounter,
    duration: Histogram,
}

impl PromHandles {
    fn observe(&self, outcome: Outcome, secs: f64) {
        self.requests.inc();
        if outcome.is_error() {
            self.errors.inc();
        }
        self.duration.observe(secs);
    }
}

struct VariantCounters {
    requests: AtomicU64,
    errors: AtomicU64,
    cancelled: AtomicU64,
    buckets: Box<[AtomicU64]>,
    sum_nanos: AtomicU64,
    /// Prometheus children per version label seen for this variant.
    series: DashMap<String, PromHandles>,
}

impl VariantCounters {
    fn new(bucket_count: usize) -> Self {
        Self {
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            buckets: (0..bucket_count).map(|_| AtomicU64::new(0)).collect(),
            sum_nanos: AtomicU64::new(0),
            series: DashMap::new(),
        }
    }

    fn record(&self, outcome: Outcome, latency: Duration, bounds: &[f64]) {
        let secs = latency.as_secs_f64();
        let slot = bounds
            .iter()
            .position(|b| secs <= *b)
            .unwrap_or(bounds.len());

        self.requests.fetch_add(1, Ordering::Relaxed);
        if outcome.is_error() {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        if outcome == Outcome::Cancelled {
            self.cancelled.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(bucket) = self.buckets.get(slot) {
            bucket.fetch_add(1, Ordering::Relaxed);
        }
        let nanos = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        self.sum_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    fn mirror(
        &self,
        prom: &PromMirror,
        variant: &str,
        version: &str,
        outcome: Outcome,
        secs: f64,
    ) {
        if let Some(handles) = self.series.get(version) {
            handles.observe(outcome, secs);
            return;
        }
        if let Some(handles) = prom.handles(variant, version) {
            handles.observe(outcome, secs);
            self.series.insert(version.to_string(), handles);
        }
    }

    fn load(&self, bounds: &[f64]) -> MetricsRecord {
        MetricsRecord {
            request_count: self.requests.load(Ordering::Relaxed),
            error_count: self.errors.load(Ordering::Relaxed),
            cancelled_count: self.cancelled.load(Ordering::Relaxed),
            latency: LatencyHistogram {
                bounds: bounds.to_vec(),
                counts: self
                    .buckets
                    .iter()
                    .map(|b| b.load(Ordering::Relaxed))
                    .collect(),
                sum_seconds: self.sum_nanos.load(Ordering::Relaxed) as f64 / 1e9,
            },
        }
    }
}

/// Metric vectors registered in the aggregator's own registry.
struct PromMirror {
    registry: Registry,
    requests_total: IntCounterVec,
    errors_total: IntCounterVec,
    duration: HistogramVec,
}

impl PromMirror {
    fn new(bounds: &[f64]) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("ab_test_requests_total", "Total routed requests per variant"),
            &["variant_name", "variant_version"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let errors_total = IntCounterVec::new(
            Opts::new("ab_test_errors_total", "Failed or cancelled requests per variant"),
            &["variant_name", "variant_version"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let duration = HistogramVec::new(
            HistogramOpts::new(
                "ab_test_prediction_duration_seconds",
                "Model invocation latency per variant",
            )
            .buckets(bounds.to_vec()),
            &["variant_name", "variant_version"],
        )?;
        registry.register(Box::new(duration.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            errors_total,
            duration,
        })
    }

    fn handles(&self, variant: &str, version: &str) -> Option<PromHandles> {
        let labels = [variant, version];
        Some(PromHandles {
            requests: self.requests_total.get_metric_with_label_values(&labels).ok()?,
            errors: self.errors_total.get_metric_with_label_values(&labels).ok()?,
            duration: self.duration.get_metric_with_label_values(&labels).ok()?,
        })
    }

    fn remove(&self, variant: &str, version: &str) {
        let labels = [variant, version];
        let _ = self.requests_total.remove_label_values(&labels);
        let _ = self.errors_total.remove_label_values(&labels);
        let _ = self.duration.remove_label_values(&labels);
    }
}

// ── Aggregator ─────────────────────────────────────────────────────────────

/// Collects per-variant metrics for the router.
///
/// Shared between request tasks behind an `Arc`; all methods take `&self`.
///
/// # Panics
///
/// This type and its methods never panic.
pub struct MetricsAggregator {
    bounds: Arc<[f64]>,
    variants: DashMap<String, Arc<VariantCounters>>,
    prom: Option<PromMirror>,
}

impl std::fmt::Debug for MetricsAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsAggregator")
            .field("bounds", &self.bounds)
            .field("variants", &self.variants.len())
            .field("prometheus", &self.prom.is_some())
            .finish()
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsAggregator {
    /// Create an aggregator with the Prometheus default latency buckets.
    pub fn new() -> Self {
        Self::build(prometheus::DEFAULT_BUCKETS.to_vec())
    }

    /// Create an aggregator with custom latency bucket bounds (seconds).
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Other`] if `bounds` is empty, contains a
    /// non-finite or non-positive value, or is not strictly increasing.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn with_buckets(bounds: Vec<f64>) -> Result<Self, RouterError> {
        if bounds.is_empty() {
            return Err(RouterError::Other(
                "latency histogram needs at least one bucket".into(),
            ));
        }
        if bounds.iter().any(|b| !b.is_finite() || *b <= 0.0) {
            return Err(RouterError::Other(format!(
                "latency bucket bounds must be finite and positive: {bounds:?}"
            )));
        }
        if bounds.windows(2).any(|w| w[0] >= w[1]) {
            return Err(RouterError::Other(format!(
                "latency bucket bounds must be strictly increasing: {bounds:?}"
            )));
        }
        Ok(Self::build(bounds))
    }

    /// Create an aggregator from the `[metrics]` config section.
    ///
    /// # Errors
    ///
    /// See [`with_buckets`](Self::with_buckets).
    pub fn from_config(config: &MetricsConfig) -> Result<Self, RouterError> {
        Self::with_buckets(config.latency_buckets_s.clone())
    }

    fn build(bounds: Vec<f64>) -> Self {
        // Exposition degrades to structured snapshots only if registration fails.
        let prom = match PromMirror::new(&bounds) {
            Ok(mirror) => Some(mirror),
            Err(e) => {
                tracing::warn!(error = %e, "prometheus registry unavailable, text exposition disabled");
                None
            }
        };
        Self {
            bounds: bounds.into(),
            variants: DashMap::new(),
            prom,
        }
    }

    /// Histogram bucket bounds, in seconds.
    pub fn bounds(&self) -> &[f64] {
        &self.bounds
    }

    fn counters(&self, variant: &str) -> Arc<VariantCounters> {
        if let Some(existing) = self.variants.get(variant) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .variants
            .entry(variant.to_string())
            .or_insert_with(|| Arc::new(VariantCounters::new(self.bounds.len() + 1)));
        Arc::clone(entry.value())
    }

    /// Record one finished request for `variant` under the
    /// [`UNKNOWN_VERSION`] label.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn record(&self, variant: &str, outcome: Outcome, latency: Duration) {
        self.record_version(variant, UNKNOWN_VERSION, outcome, latency);
    }

    /// Record one finished request for `variant` deployed as `version`.
    ///
    /// Increments the request counter, the error counter when `outcome` is
    /// not [`Outcome::Success`], and the latency bucket. The structured
    /// counters are shared by all versions of a name; the Prometheus series
    /// carry `version` as the `variant_version` label.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn record_version(
        &self,
        variant: &str,
        version: &str,
        outcome: Outcome,
        latency: Duration,
    ) {
        let counters = self.counters(variant);
        counters.record(outcome, latency, &self.bounds);
        if let Some(prom) = &self.prom {
            counters.mirror(prom, variant, version, outcome, latency.as_secs_f64());
        }
    }

    /// Snapshot of every variant seen so far, keyed by name.
    pub fn snapshot(&self) -> BTreeMap<String, MetricsRecord> {
        self.variants
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(&self.bounds)))
            .collect()
    }

    /// Snapshot of one variant, if it was ever recorded.
    pub fn get(&self, variant: &str) -> Option<MetricsRecord> {
        self.variants
            .get(variant)
            .map(|entry| entry.value().load(&self.bounds))
    }

    /// Drop all history for `variant`. Returns `true` if it existed.
    ///
    /// In-flight requests that already hold the variant's counters finish
    /// recording into the discarded set.
    pub fn purge(&self, variant: &str) -> bool {
        let Some((_, counters)) = self.variants.remove(variant) else {
            return false;
        };
        if let Some(prom) = &self.prom {
            for series in counters.series.iter() {
                prom.remove(variant, series.key());
            }
        }
        tracing::info!(variant = %variant, "variant metrics purged");
        true
    }

    /// Gather all metrics in the Prometheus text exposition format.
    ///
    /// Returns an empty string if nothing was recorded or encoding fails.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn gather_text(&self) -> String {
        let Some(prom) = &self.prom else {
            return String::new();
        };
        let families = prom.registry.gather();
        if families.is_empty() {
            return String::new();
        }
        let mut buffer = Vec::new();
        if TextEncoder::new().encode(&families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
