//! Metrics HTTP server
//!
//! Exposes router metrics and the active configuration over HTTP.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use variant_router::metrics_server::{self, ServerState};
//! use variant_router::{MetricsAggregator, SwapController};
//!
//! #[tokio::main]
//! async fn main() {
//!     let state = ServerState {
//!         controller: Arc::new(SwapController::new()),
//!         metrics: Arc::new(MetricsAggregator::new()),
//!     };
//!     let handle = tokio::spawn(metrics_server::start_server("0.0.0.0:9090", state));
//!
//!     // Your application code...
//!
//!     handle.abort();
//! }
//! ```
//!
//! ## Endpoints
//!
//! - `GET /metrics` - Prometheus metrics in text format
//! - `GET /status` - Active routing configuration as JSON
//! - `GET /health` - Health check endpoint
//!
//! ## Scraping with Prometheus
//!
//! Add to your `prometheus.yml`:
//! ```yaml
//! scrape_configs:
//!   - job_name: 'variant-router'
//!     static_configs:
//!       - targets: ['localhost:9090']
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::metrics::MetricsAggregator;
use crate::routing::{RouterStatus, SwapController};

/// Shared handles served by the HTTP endpoints.
#[derive(Debug, Clone)]
pub struct ServerState {
    /// Source of the active routing table.
    pub controller: Arc<SwapController>,
    /// Source of per-variant metrics.
    pub metrics: Arc<MetricsAggregator>,
}

/// Build the axum [`Router`] without binding a socket.
pub fn app(state: ServerState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/status", get(status_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the metrics HTTP server
///
/// Returns a future that runs until the listener fails.
///
/// # Errors
///
/// Returns an error if `addr` does not parse or cannot be bound.
pub async fn start_server(
    addr: &str,
    state: ServerState,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr: SocketAddr = addr.parse()?;

    info!("starting metrics server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("metrics at http://{}/metrics, status at http://{}/status", addr, addr);

    axum::serve(listener, app(state)).await?;

    Ok(())
}

/// Handler for /metrics endpoint
async fn metrics_handler(State(state): State<ServerState>) -> Response {
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        state.metrics.gather_text(),
    )
        .into_response()
}

/// Handler for /status endpoint
async fn status_handler(State(state): State<ServerState>) -> Response {
    let Some(table) = state.controller.current() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            [("Content-Type", "application/json")],
            r#"{"error":"no routing configuration has been published"}"#.to_string(),
        )
            .into_response();
    };

    let body = serde_json::json!({
        "config": RouterStatus::from_table(&table),
        "metrics": state.metrics.snapshot(),
    });

    (
        StatusCode::OK,
        [("Content-Type", "application/json")],
        serde_json::to_string_pretty(&body)
            .unwrap_or_else(|_| r#"{"error":"serialization failed"}"#.to_string()),
    )
        .into_response()
}

/// Handler for /health endpoint
async fn health_handler(State(state): State<ServerState>) -> Response {
    let active = state.controller.is_active();
    let health_status = serde_json::json!({
        "status": if active { "healthy" } else { "no_configuration" },
        "generation": state.controller.generation(),
        "variants_tracked": state.metrics.snapshot().len(),
    });
    let code = if active {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        [("Content-Type", "application/json")],
        serde_json::to_string_pretty(&health_status)
            .unwrap_or_else(|_| r#"{"error":"serialization failed"}"#.to_string()),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RoutingConfig, VariantConfig};
    use crate::metrics::Outcome;
    use crate::routing::Stage;
    use std::time::Duration;

    fn state(published: bool) -> ServerState {
        let controller = SwapController::new();
        if published {
            controller
                .publish(
                    &RoutingConfig::new("exp", "hash")
                        .with_variant(VariantConfig::new("production", 90, Stage::Champion))
                        .with_variant(VariantConfig::new("staging", 10, Stage::Challenger)),
                )
                .expect("test: publish");
        }
        ServerState {
            controller: Arc::new(controller),
            metrics: Arc::new(MetricsAggregator::new()),
        }
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("test: body");
        String::from_utf8(bytes.to_vec()).expect("test: utf8")
    }

    #[tokio::test]
    async fn test_health_endpoint_ok_when_published() {
        let response = health_handler(State(state(true))).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_endpoint_unavailable_without_config() {
        let response = health_handler(State(state(false))).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_renders_prometheus_text() {
        let state = state(true);
        state
            .metrics
            .record("staging", Outcome::Success, Duration::from_millis(4));
        let body = body_text(metrics_handler(State(state)).await).await;
        assert!(body.contains("ab_test_requests_total{variant_name=\"staging\",variant_version=\"unknown\"} 1"));
    }

    #[tokio::test]
    async fn test_status_endpoint_reports_config_and_metrics() {
        let state = state(true);
        state
            .metrics
            .record("production", Outcome::Error, Duration::from_millis(4));
        let body = body_text(status_handler(State(state)).await).await;
        let json: serde_json::Value = serde_json::from_str(&body).expect("test: json");
        assert_eq!(json["config"]["experiment"], "exp");
        assert_eq!(json["config"]["variants"][1]["weight"], 10);
        assert_eq!(json["metrics"]["production"]["error_count"], 1);
    }
}
