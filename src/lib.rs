//! # variant-router
//!
//! Traffic routing for model experiments: decide which model variant serves
//! each inference request, keep that decision stable per user or session,
//! swap configurations live, and count what every variant did.
//!
//! ## Architecture
//!
//! ```text
//! RouterConfig ─validate─► RoutingTable ─publish─► SwapController
//!                                                       │ current()
//! request + RequestContext ──► select() ──► ModelInvoker ──► MetricsAggregator
//!                                                       │
//!                                       RoutedPrediction { variant, stage }
//! ```
//!
//! The controller and the aggregator are plain owned values shared via `Arc`;
//! there is no process-wide routing state.

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod config;
pub mod invoker;
pub mod metrics;
pub mod routing;

#[cfg(feature = "metrics-server")]
pub mod metrics_server;

// Re-exports for convenience
pub use config::validation::{ConfigError, ValidationError};
pub use config::RouterConfig;
pub use invoker::{EchoInvoker, InvocationError, ModelInvoker};
pub use metrics::{MetricsAggregator, MetricsRecord, Outcome};
pub use routing::{
    RequestContext, RouteError, RoutedPrediction, RouterStatus, Stage, Strategy, SwapController,
    VariantRouter,
};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"`: structured JSON output for log aggregators
/// - anything else (including unset): human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`RouterError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Panics
///
/// This function never panics.
///
/// # Example
///
/// ```no_run
/// # use variant_router::{init_tracing, RouterError};
/// # fn example() -> Result<(), RouterError> {
/// init_tracing()?;
/// # Ok(()) }
/// ```
pub fn init_tracing() -> Result<(), RouterError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| RouterError::Other(format!("tracing init failed: {e}")))
}

/// Top-level router errors.
///
/// Request-path failures are reported separately through
/// [`RouteError`] so the invoker's own error type passes through untouched.
#[derive(Error, Debug)]
pub enum RouterError {
    /// A routing configuration was rejected; the active table is unchanged.
    #[error("invalid routing configuration: {0}")]
    Configuration(#[from] ValidationError),

    /// No routing table has been published yet.
    #[error("no routing configuration has been published")]
    NoActiveConfiguration,

    /// Loading or validating the configuration file failed.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error_display_includes_cause() {
        let err = RouterError::from(ValidationError::WeightsDoNotSumTo100 { total: 99 });
        assert!(err.to_string().contains("sum to 99"));
    }

    #[test]
    fn test_config_error_converts_into_router_error() {
        let err = RouterError::from(ConfigError::Validation("bad".into()));
        assert!(matches!(err, RouterError::Config(_)));
    }

    #[test]
    fn test_no_active_configuration_display() {
        assert_eq!(
            RouterError::NoActiveConfiguration.to_string(),
            "no routing configuration has been published"
        );
    }

    #[test]
    fn test_init_tracing_second_call_returns_err() {
        // First call may succeed or fail depending on test execution order
        // (another test may have already installed a subscriber).
        let _ = init_tracing();
        // Second call must not panic; it should return Err.
        let result = init_tracing();
        assert!(result.is_err(), "double init must return Err, not panic");
    }
}
