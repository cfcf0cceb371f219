//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`RouterConfig`] that cannot be
//! expressed through the type system alone: weights summing to 100, unique
//! variant names, a recognised strategy, sane histogram bounds.
//!
//! ## Guarantees
//! - Every validation rule has at least one test that triggers it
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Routing errors are reported in a fixed order so the table builder can
//!   surface a stable "first" error
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - Building the routing table (that belongs to `routing::table`)

use std::collections::HashSet;
use std::str::FromStr;

use super::{RouterConfig, RoutingConfig};
use crate::routing::Strategy;

/// A routing configuration that must not become active.
///
/// Returned synchronously from [`SwapController::publish`](crate::SwapController::publish);
/// the previously active table stays in force.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// The configuration lists no variants.
    #[error("variant set is empty")]
    EmptyVariantSet,

    /// The strategy is not one of `random`, `hash`, `sticky`.
    #[error("unknown routing strategy '{0}' (expected random, hash or sticky)")]
    UnknownStrategy(String),

    /// A variant has a blank name.
    #[error("variant at position {index} has an empty name")]
    EmptyVariantName {
        /// Zero-based position in the variant list.
        index: usize,
    },

    /// Two variants share a name.
    #[error("duplicate variant name '{0}'")]
    DuplicateVariantName(String),

    /// The weights do not add up to exactly 100.
    #[error("variant weights sum to {total}, expected 100")]
    WeightsDoNotSumTo100 {
        /// Observed sum of all weights.
        total: u64,
    },
}

/// Errors arising from configuration parsing, validation, or I/O.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The routing section is invalid.
    #[error("Invalid routing configuration: {0}")]
    Routing(#[from] ValidationError),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "metrics.latency_buckets_s").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// An environment variable could not be interpreted.
    #[error("Environment variable {var} is invalid: {reason}")]
    Env {
        /// Name of the offending variable.
        var: String,
        /// Human-readable explanation.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Validate the routing section.
///
/// Errors are collected in a fixed order: empty set, strategy, names,
/// duplicates, weight sum.
///
/// # Returns
///
/// - `Ok(strategy)` with the parsed strategy if all constraints pass.
/// - `Err(Vec<ValidationError>)` with every violation found.
///
/// # Panics
///
/// This function never panics.
pub fn validate_routing(config: &RoutingConfig) -> Result<Strategy, Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.variants.is_empty() {
        errors.push(ValidationError::EmptyVariantSet);
    }

    let strategy = match Strategy::from_str(&config.strategy) {
        Ok(s) => Some(s),
        Err(e) => {
            errors.push(e);
            None
        }
    };

    for (index, variant) in config.variants.iter().enumerate() {
        if variant.name.trim().is_empty() {
            errors.push(ValidationError::EmptyVariantName { index });
        }
    }

    let mut seen = HashSet::with_capacity(config.variants.len());
    for variant in &config.variants {
        if !seen.insert(variant.name.as_str()) {
            errors.push(ValidationError::DuplicateVariantName(variant.name.clone()));
        }
    }

    if !config.variants.is_empty() {
        let total: u64 = config.variants.iter().map(|v| u64::from(v.weight)).sum();
        if total != 100 {
            errors.push(ValidationError::WeightsDoNotSumTo100 { total });
        }
    }

    match strategy {
        Some(strategy) if errors.is_empty() => Ok(strategy),
        _ => Err(errors),
    }
}

/// Validate all semantic constraints on a [`RouterConfig`].
///
/// Collects every violation before returning so the caller sees the full
/// scope of issues at once.
///
/// # Returns
///
/// - `Ok(())` if all constraints pass.
/// - `Err(Vec<ConfigError>)` with every violation found.
///
/// # Panics
///
/// This function never panics.
pub fn validate(config: &RouterConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors: Vec<ConfigError> = match validate_routing(&config.routing) {
        Ok(_) => Vec::new(),
        Err(routing) => routing.into_iter().map(ConfigError::Routing).collect(),
    };

    // ── Invocation timeout ───────────────────────────────────────────
    if config.serving.invoke_timeout_ms == Some(0) {
        errors.push(ConfigError::InvalidField {
            field: "serving.invoke_timeout_ms".into(),
            value: "0".into(),
            reason: "timeout must be at least 1ms when set".into(),
        });
    }

    // ── Histogram bounds ─────────────────────────────────────────────
    let bounds = &config.metrics.latency_buckets_s;
    if bounds.is_empty() {
        errors.push(ConfigError::InvalidField {
            field: "metrics.latency_buckets_s".into(),
            value: "[]".into(),
            reason: "at least one bucket bound is required".into(),
        });
    }
    if let Some(bad) = bounds.iter().find(|b| !b.is_finite() || **b <= 0.0) {
        errors.push(ConfigError::InvalidField {
            field: "metrics.latency_buckets_s".into(),
            value: bad.to_string(),
            reason: "bucket bounds must be finite and positive".into(),
        });
    }
    if bounds.windows(2).any(|w| w[0] >= w[1]) {
        errors.push(ConfigError::InvalidField {
            field: "metrics.latency_buckets_s".into(),
            value: format!("{bounds:?}"),
            reason: "bucket bounds must be strictly increasing".into(),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
