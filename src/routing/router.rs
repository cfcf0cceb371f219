//! Request routing facade.
//!
//! The [`VariantRouter`] ties the pieces together for each request: one load
//! of the active [`RoutingTable`] from the [`SwapController`], one variant
//! selection, one call to the [`ModelInvoker`], and one update of the
//! [`MetricsAggregator`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

use super::controller::SwapController;
use super::selector::{select, RequestContext, Strategy};
use super::table::{BucketRange, RoutingTable};
use super::variant::{ModelRef, Stage, Variant};
use crate::config::RouterConfig;
use crate::invoker::ModelInvoker;
use crate::metrics::{MetricsAggregator, MetricsRecord, Outcome};
use crate::RouterError;

/// Errors returned by [`VariantRouter::route_and_invoke`].
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Error)]
pub enum RouteError<E> {
    /// Nothing has been published yet.
    #[error("no routing configuration has been published")]
    NoActiveConfiguration,

    /// The invoker failed; the error is passed through unchanged.
    #[error(transparent)]
    Invocation(E),

    /// The invoker did not answer within the configured timeout.
    #[error("variant '{variant}' did not answer within {elapsed_ms}ms")]
    Timeout {
        /// Variant that was selected.
        variant: String,
        /// Time spent waiting, in milliseconds.
        elapsed_ms: u64,
    },
}

impl<E> RouteError<E> {
    /// The invoker's error, if that is what failed.
    pub fn invocation(&self) -> Option<&E> {
        match self {
            Self::Invocation(e) => Some(e),
            _ => None,
        }
    }
}

/// A prediction annotated with the variant that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutedPrediction<P> {
    /// The invoker's output.
    pub prediction: P,
    /// Name of the serving variant.
    pub variant_name: String,
    /// Stage of the serving variant.
    pub stage: Stage,
    /// `true` if the configured strategy lacked its identifier and a random
    /// draw was used instead.
    pub fallback_used: bool,
    /// Generation of the table the request was routed with.
    pub generation: u64,
}

/// Read-only view of the active configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouterStatus {
    /// Experiment name.
    pub experiment: String,
    /// Configured strategy.
    pub strategy: Strategy,
    /// Generation of the active table.
    pub generation: u64,
    /// Variants in configuration order.
    pub variants: Vec<VariantStatus>,
}

/// One variant as reported by [`RouterStatus`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariantStatus {
    /// Variant name.
    pub name: String,
    /// Model version label.
    pub version: String,
    /// Lifecycle stage.
    pub stage: Stage,
    /// Model reference handed to the invoker.
    pub model: ModelRef,
    /// Traffic weight in percent.
    pub weight: u32,
    /// Buckets owned by the variant.
    pub range: BucketRange,
}

impl RouterStatus {
    /// Describe `table`.
    pub fn from_table(table: &RoutingTable) -> Self {
        Self {
            experiment: table.name().to_string(),
            strategy: table.strategy(),
            generation: table.generation(),
            variants: table
                .entries()
                .map(|(variant, range)| VariantStatus {
                    name: variant.name.clone(),
                    version: variant.version.clone(),
                    stage: variant.stage.clone(),
                    model: variant.model.clone(),
                    weight: variant.weight,
                    range,
                })
                .collect(),
        }
    }
}

/// Records `Outcome::Cancelled` if the request future is dropped before the
/// invocation finishes.
struct InFlight<'a> {
    metrics: &'a MetricsAggregator,
    variant: &'a str,
    version: &'a str,
    started: Instant,
    finished: bool,
}

impl<'a> InFlight<'a> {
    fn start(metrics: &'a MetricsAggregator, variant: &'a Variant) -> Self {
        Self {
            metrics,
            variant: &variant.name,
            version: &variant.version,
            started: Instant::now(),
            finished: false,
        }
    }

    fn finish(mut self, outcome: Outcome) -> Duration {
        let elapsed = self.started.elapsed();
        self.metrics
            .record_version(self.variant, self.version, outcome, elapsed);
        self.finished = true;
        elapsed
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let elapsed = self.started.elapsed();
            self.metrics
                .record_version(self.variant, self.version, Outcome::Cancelled, elapsed);
            tracing::debug!(
                variant = %self.variant,
                latency_ms = elapsed.as_millis() as u64,
                "request cancelled before the model answered"
            );
        }
    }
}

/// Routes requests to model variants and records the outcome.
///
/// Cloning is cheap; clones share the controller, invoker and metrics.
///
/// # Panics
///
/// This type and its methods never panic.
pub struct VariantRouter<M: ModelInvoker> {
    controller: Arc<SwapController>,
    invoker: Arc<M>,
    metrics: Arc<MetricsAggregator>,
    invoke_timeout: Option<Duration>,
}

impl<M: ModelInvoker> Clone for VariantRouter<M> {
    fn clone(&self) -> Self {
        Self {
            controller: Arc::clone(&self.controller),
            invoker: Arc::clone(&self.invoker),
            metrics: Arc::clone(&self.metrics),
            invoke_timeout: self.invoke_timeout,
        }
    }
}

impl<M: ModelInvoker> std::fmt::Debug for VariantRouter<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VariantRouter")
            .field("controller", &self.controller)
            .field("metrics", &self.metrics)
            .field("invoke_timeout", &self.invoke_timeout)
            .finish()
    }
}

impl<M: ModelInvoker> VariantRouter<M> {
    /// Build a router over existing shared components.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::NoActiveConfiguration`] if `controller` has
    /// never had a table published.
    pub fn new(
        controller: Arc<SwapController>,
        invoker: Arc<M>,
        metrics: Arc<MetricsAggregator>,
    ) -> Result<Self, RouterError> {
        if !controller.is_active() {
            return Err(RouterError::NoActiveConfiguration);
        }
        Ok(Self {
            controller,
            invoker,
            metrics,
            invoke_timeout: None,
        })
    }

    /// Publish `config` into a fresh controller and build a router around it.
    ///
    /// # Errors
    ///
    /// - [`RouterError::Configuration`] if the routing section is invalid.
    /// - [`RouterError::Other`] if the histogram bounds are invalid.
    pub fn from_config(config: &RouterConfig, invoker: M) -> Result<Self, RouterError> {
        let controller = Arc::new(SwapController::with_config(&config.routing)?);
        let metrics = Arc::new(MetricsAggregator::from_config(&config.metrics)?);
        let router = Self::new(controller, Arc::new(invoker), metrics)?;
        Ok(match config.serving.invoke_timeout_ms {
            Some(ms) => router.with_invoke_timeout(Duration::from_millis(ms)),
            None => router,
        })
    }

    /// Fail invocations that take longer than `timeout`.
    pub fn with_invoke_timeout(mut self, timeout: Duration) -> Self {
        self.invoke_timeout = Some(timeout);
        self
    }

    /// Pick a variant for `context`, invoke its model with `input`, and
    /// record the outcome.
    ///
    /// Uses a single snapshot of the active table for the whole request, so
    /// a concurrent publish never affects a request already in progress.
    /// Invocation errors are recorded and then returned unchanged; nothing
    /// is retried. Dropping the returned future before it completes records
    /// the request as cancelled.
    ///
    /// # Errors
    ///
    /// - [`RouteError::NoActiveConfiguration`] if no table was published.
    /// - [`RouteError::Invocation`] with the invoker's error.
    /// - [`RouteError::Timeout`] if the configured timeout elapsed.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub async fn route_and_invoke(
        &self,
        input: M::Input,
        context: &RequestContext,
    ) -> Result<RoutedPrediction<M::Prediction>, RouteError<M::Error>> {
        let table = self
            .controller
            .current()
            .ok_or(RouteError::NoActiveConfiguration)?;
        let assignment = select(&table, table.strategy(), context);
        let variant = &assignment.variant;

        let in_flight = InFlight::start(&self.metrics, variant);
        let call = self.invoker.invoke(&variant.model, input);
        let result = match self.invoke_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result.map_err(RouteError::Invocation),
                Err(_) => Err(RouteError::Timeout {
                    variant: variant.name.clone(),
                    elapsed_ms: limit.as_millis() as u64,
                }),
            },
            None => call.await.map_err(RouteError::Invocation),
        };

        match result {
            Ok(prediction) => {
                let latency = in_flight.finish(Outcome::Success);
                tracing::debug!(
                    generation = assignment.generation,
                    strategy = %assignment.applied_strategy(),
                    variant = %variant.name,
                    fallback = assignment.fallback_used,
                    latency_ms = latency.as_millis() as u64,
                    "request routed"
                );
                Ok(RoutedPrediction {
                    prediction,
                    variant_name: variant.name.clone(),
                    stage: variant.stage.clone(),
                    fallback_used: assignment.fallback_used,
                    generation: assignment.generation,
                })
            }
            Err(e) => {
                let latency = in_flight.finish(Outcome::Error);
                tracing::warn!(
                    generation = assignment.generation,
                    strategy = %assignment.applied_strategy(),
                    variant = %variant.name,
                    fallback = assignment.fallback_used,
                    latency_ms = latency.as_millis() as u64,
                    error = %e,
                    "model invocation failed"
                );
                Err(e)
            }
        }
    }

    /// Describe the active configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::NoActiveConfiguration`] if no table is active.
    pub fn status(&self) -> Result<RouterStatus, RouterError> {
        self.controller
            .current()
            .map(|table| RouterStatus::from_table(&table))
            .ok_or(RouterError::NoActiveConfiguration)
    }

    /// Per-variant counters and latency histograms.
    pub fn metrics_snapshot(&self) -> BTreeMap<String, MetricsRecord> {
        self.metrics.snapshot()
    }

    /// Shared metrics aggregator.
    pub fn metrics(&self) -> &Arc<MetricsAggregator> {
        &self.metrics
    }

    /// Shared swap controller, for publishing new configurations.
    pub fn controller(&self) -> &Arc<SwapController> {
        &self.controller
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RoutingConfig, VariantConfig};
    use crate::invoker::{EchoInvoker, InvocationError};
    use async_trait::async_trait;

    fn churn_config(strategy: &str) -> RouterConfig {
        RouterConfig::from_routing(
            RoutingConfig::new("churn-rollout", strategy)
                .with_variant(
                    VariantConfig::new("production", 90, Stage::Champion)
                        .with_model("models:/churn/1")
                        .with_version("1.0.0"),
                )
                .with_variant(
                    VariantConfig::new("staging", 10, Stage::Challenger)
                        .with_model("models:/churn/2")
                        .with_version("1.1.0"),
                ),
        )
    }

    /// Invoker that never answers.
    struct StuckInvoker;

    #[async_trait]
    impl ModelInvoker for StuckInvoker {
        type Input = String;
        type Prediction = String;
        type Error = InvocationError;

        async fn invoke(&self, _model: &ModelRef, _input: String) -> Result<String, InvocationError> {
            std::future::pending().await
        }
    }

    #[test]
    fn test_new_without_published_table_fails() {
        let result = VariantRouter::new(
            Arc::new(SwapController::new()),
            Arc::new(EchoInvoker::new()),
            Arc::new(MetricsAggregator::new()),
        );
        assert!(matches!(result, Err(RouterError::NoActiveConfiguration)));
    }

    #[test]
    fn test_from_config_rejects_invalid_routing() {
        let mut config = churn_config("hash");
        config.routing.variants[1].weight = 5;
        let err = VariantRouter::from_config(&config, EchoInvoker::new()).expect_err("test: invalid");
        assert!(matches!(err, RouterError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_hash_routes_known_customer_to_production() {
        let router =
            VariantRouter::from_config(&churn_config("hash"), EchoInvoker::new()).expect("test: router");
        let routed = router
            .route_and_invoke("features".into(), &RequestContext::for_user("CUST_000123"))
            .await
            .expect("test: routed");
        assert_eq!(routed.variant_name, "production");
        assert_eq!(routed.stage, Stage::Champion);
        assert_eq!(routed.prediction, "models:/churn/1: features");
        assert!(!routed.fallback_used);
        assert_eq!(routed.generation, 1);
    }

    #[tokio::test]
    async fn test_hash_without_identifier_falls_back() {
        let router =
            VariantRouter::from_config(&churn_config("hash"), EchoInvoker::new()).expect("test: router");
        let routed = router
            .route_and_invoke("x".into(), &RequestContext::anonymous())
            .await
            .expect("test: routed");
        assert!(routed.fallback_used);
    }

    #[tokio::test]
    async fn test_invocation_error_is_recorded_and_passed_through() {
        let mut config = churn_config("random");
        config.routing.variants[0].weight = 0;
        config.routing.variants[1].weight = 100;
        let invoker = EchoInvoker::new().failing_on("models:/churn/2");
        let router = VariantRouter::from_config(&config, invoker).expect("test: router");

        let err = router
            .route_and_invoke("x".into(), &RequestContext::anonymous())
            .await
            .expect_err("test: should fail");
        assert_eq!(
            err.invocation(),
            Some(&InvocationError::Unavailable {
                model: "models:/churn/2".into()
            })
        );

        let staging = router.metrics_snapshot().remove("staging").expect("test: recorded");
        assert_eq!(staging.request_count, 1);
        assert_eq!(staging.error_count, 1);
    }

    #[tokio::test]
    async fn test_successful_requests_are_recorded() {
        let router =
            VariantRouter::from_config(&churn_config("sticky"), EchoInvoker::new()).expect("test: router");
        for i in 0..20 {
            let ctx = RequestContext::for_session(format!("session-{i}"));
            router.route_and_invoke("x".into(), &ctx).await.expect("test: routed");
        }
        let total: u64 = router
            .metrics_snapshot()
            .values()
            .map(|r| r.request_count)
            .sum();
        assert_eq!(total, 20);
    }

    #[tokio::test]
    async fn test_prometheus_series_carry_variant_version() {
        let router =
            VariantRouter::from_config(&churn_config("hash"), EchoInvoker::new()).expect("test: router");
        router
            .route_and_invoke("x".into(), &RequestContext::for_user("CUST_000123"))
            .await
            .expect("test: routed");
        let text = router.metrics().gather_text();
        assert!(text.contains(
            "ab_test_requests_total{variant_name=\"production\",variant_version=\"1.0.0\"} 1"
        ));
    }

    #[tokio::test]
    async fn test_dropped_request_is_recorded_as_cancelled() {
        let config = churn_config("hash");
        let router = VariantRouter::from_config(&config, StuckInvoker).expect("test: router");

        let ctx = RequestContext::for_user("CUST_000123");
        let result = tokio::time::timeout(
            Duration::from_millis(20),
            router.route_and_invoke("x".into(), &ctx),
        )
        .await;
        assert!(result.is_err(), "stuck invoker should never answer");

        let production = router.metrics().get("production").expect("test: recorded");
        assert_eq!(production.request_count, 1);
        assert_eq!(production.error_count, 1);
        assert_eq!(production.cancelled_count, 1);
    }

    #[tokio::test]
    async fn test_invoke_timeout_returns_timeout_error() {
        let mut config = churn_config("hash");
        config.serving.invoke_timeout_ms = Some(10);
        let router = VariantRouter::from_config(&config, StuckInvoker).expect("test: router");

        let err = router
            .route_and_invoke("x".into(), &RequestContext::for_user("CUST_000123"))
            .await
            .expect_err("test: should time out");
        assert!(matches!(
            err,
            RouteError::Timeout { ref variant, elapsed_ms: 10 } if variant == "production"
        ));

        let production = router.metrics().get("production").expect("test: recorded");
        assert_eq!(production.error_count, 1);
        assert_eq!(production.cancelled_count, 0);
    }

    #[tokio::test]
    async fn test_requests_after_publish_use_new_table() {
        let router =
            VariantRouter::from_config(&churn_config("hash"), EchoInvoker::new()).expect("test: router");
        let all_staging = RoutingConfig::new("churn-rollout", "hash")
            .with_variant(VariantConfig::new("production", 0, Stage::Champion))
            .with_variant(VariantConfig::new("staging", 100, Stage::Challenger));
        router.controller().publish(&all_staging).expect("test: publish");

        let routed = router
            .route_and_invoke("x".into(), &RequestContext::for_user("CUST_000123"))
            .await
            .expect("test: routed");
        assert_eq!(routed.variant_name, "staging");
        assert_eq!(routed.generation, 2);
    }

    #[test]
    fn test_status_reports_active_configuration() {
        let router =
            VariantRouter::from_config(&churn_config("hash"), EchoInvoker::new()).expect("test: router");
        let status = router.status().expect("test: status");
        assert_eq!(status.experiment, "churn-rollout");
        assert_eq!(status.strategy, Strategy::Hash);
        assert_eq!(status.generation, 1);
        assert_eq!(status.variants.len(), 2);
        assert_eq!(status.variants[1].name, "staging");
        assert_eq!(status.variants[1].version, "1.1.0");
        assert_eq!(status.variants[1].range, BucketRange { start: 90, end: 100 });
    }

    #[test]
    fn test_status_serializes_to_json() {
        let router =
            VariantRouter::from_config(&churn_config("hash"), EchoInvoker::new()).expect("test: router");
        let json = serde_json::to_value(router.status().expect("test: status")).expect("test: json");
        assert_eq!(json["strategy"], "hash");
        assert_eq!(json["variants"][0]["stage"], "champion");
        assert_eq!(json["variants"][0]["model"], "models:/churn/1");
    }

    #[test]
    fn test_route_error_display() {
        let err: RouteError<InvocationError> = RouteError::Timeout {
            variant: "a".into(),
            elapsed_ms: 5,
        };
        assert_eq!(err.to_string(), "variant 'a' did not answer within 5ms");
    }
}
