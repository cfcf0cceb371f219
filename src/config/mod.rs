//! # Declarative Routing Configuration
//!
//! ## Responsibility
//! Parse, validate, and hot-reload the TOML file that describes an experiment:
//! the routing strategy, the competing variants and their traffic weights,
//! plus serving and metrics knobs.
//! ```text
//! cargo run -- --config router.toml
//! ```
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `RouterConfig`
//! - Validated: all semantic constraints are checked before a config is accepted
//! - Type-safe: stage labels and model references are typed at parse time
//! - Hot-reloadable: file changes are detected and validated before applying
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Building the routing table (that belongs to `routing::table`)
//! - Publishing configs to live traffic (that belongs to `routing::controller`)
//! - Metrics collection (that belongs to `metrics`)

pub mod loader;
pub mod validation;
pub mod watcher;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::routing::{ModelRef, Stage};

// ── Default value functions ──────────────────────────────────────────────

/// Default experiment name.
fn default_experiment_name() -> String {
    "default".to_string()
}

/// Default routing strategy.
fn default_strategy() -> String {
    "random".to_string()
}

/// Default model version label.
fn default_version() -> String {
    "unknown".to_string()
}

/// Default latency histogram bounds, in seconds.
fn default_latency_buckets() -> Vec<f64> {
    prometheus::DEFAULT_BUCKETS.to_vec()
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for a router instance.
///
/// # Example
///
/// ```toml
/// [routing]
/// name = "churn-rollout"
/// strategy = "hash"
///
/// [[routing.variants]]
/// name = "production"
/// weight = 90
/// stage = "champion"
/// model = "models:/churn/1"
///
/// [[routing.variants]]
/// name = "staging"
/// weight = 10
/// stage = "challenger"
/// model = "models:/churn/2"
/// ```
///
/// # Panics
///
/// This type never panics during construction or access.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RouterConfig {
    /// Experiment definition: strategy and variants.
    pub routing: RoutingConfig,
    /// Model invocation settings.
    #[serde(default)]
    pub serving: ServingConfig,
    /// Per-variant metrics settings.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl RouterConfig {
    /// Wrap a routing configuration with default serving and metrics settings.
    pub fn from_routing(routing: RoutingConfig) -> Self {
        Self {
            routing,
            serving: ServingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

// ── Routing ──────────────────────────────────────────────────────────────

/// The externally supplied experiment definition.
///
/// `strategy` stays a string here so that an unrecognised value can be
/// reported as a validation error instead of a parse failure.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RoutingConfig {
    /// Experiment name, reported in status output.
    #[serde(default = "default_experiment_name")]
    pub name: String,
    /// One of `random`, `hash`, `sticky`.
    #[serde(default = "default_strategy")]
    pub strategy: String,
    /// Variants in routing order. Range boundaries follow this order.
    #[serde(default)]
    pub variants: Vec<VariantConfig>,
}

impl RoutingConfig {
    /// Start an empty configuration for the given strategy.
    pub fn new(name: impl Into<String>, strategy: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            strategy: strategy.into(),
            variants: Vec::new(),
        }
    }

    /// Append a variant, builder style.
    pub fn with_variant(mut self, variant: VariantConfig) -> Self {
        self.variants.push(variant);
        self
    }
}

/// One variant entry in a [`RoutingConfig`].
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct VariantConfig {
    /// Unique variant name.
    pub name: String,
    /// Traffic share in percent.
    pub weight: u32,
    /// Experiment role; defaults to `control`.
    #[serde(default)]
    pub stage: Stage,
    /// Model reference handed to the invoker. Defaults to the variant name.
    #[serde(default)]
    pub model: Option<ModelRef>,
    /// Model version label.
    #[serde(default = "default_version")]
    pub version: String,
}

impl VariantConfig {
    /// Create a variant entry whose model reference is its own name.
    pub fn new(name: impl Into<String>, weight: u32, stage: Stage) -> Self {
        Self {
            name: name.into(),
            weight,
            stage,
            model: None,
            version: default_version(),
        }
    }

    /// Set the model reference.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(ModelRef::new(model));
        self
    }

    /// Set the version label.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Model reference, falling back to the variant name.
    pub fn model_ref(&self) -> ModelRef {
        self.model
            .clone()
            .unwrap_or_else(|| ModelRef::new(self.name.clone()))
    }
}

// ── Serving ──────────────────────────────────────────────────────────────

/// Model invocation settings.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ServingConfig {
    /// Upper bound on a single model invocation. `None` waits indefinitely.
    pub invoke_timeout_ms: Option<u64>,
}

// ── Metrics ──────────────────────────────────────────────────────────────

/// Per-variant metrics settings.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct MetricsConfig {
    /// Upper bounds (seconds) of the latency histogram buckets, strictly increasing.
    #[serde(default = "default_latency_buckets")]
    pub latency_buckets_s: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            latency_buckets_s: default_latency_buckets(),
        }
    }
}

/// Export the JSON Schema for `RouterConfig`.
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails (should not
/// happen with well-formed derive macros).
///
/// # Panics
///
/// This function never panics.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(RouterConfig);
    serde_json::to_string_pretty(&schema)
}
