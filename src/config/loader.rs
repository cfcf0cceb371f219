//! Configuration loading.
//!
//! ## Responsibility
//! Read a TOML file from disk (or the legacy `AB_*` environment variables),
//! parse it into a [`RouterConfig`], and run validation before returning.
//! This is the primary entry point for loading configuration at startup.
//!
//! ## Guarantees
//! - A successfully loaded config is always validated
//! - I/O errors and parse errors are distinguished in the error type
//! - File path is included in every error message
//!
//! ## NOT Responsible For
//! - Hot-reloading on file changes (that belongs to `watcher`)
//! - Defining the config schema (that belongs to `mod.rs`)

use std::path::Path;

use super::validation::{self, ConfigError};
use super::{RouterConfig, RoutingConfig, VariantConfig};
use crate::routing::Stage;

/// Enables routing from the environment when set to `true`.
pub const ENV_ENABLED: &str = "AB_TESTING_ENABLED";
/// Strategy name, defaults to `random`.
pub const ENV_STRATEGY: &str = "AB_ROUTING_STRATEGY";
/// Traffic split in `name:percent,name:percent` form.
pub const ENV_TRAFFIC: &str = "AB_TRAFFIC_CONFIG";
/// Experiment name, defaults to `default`.
pub const ENV_EXPERIMENT: &str = "AB_EXPERIMENT_NAME";

/// Load a [`RouterConfig`] from a TOML file.
///
/// # Returns
///
/// - `Ok(RouterConfig)` if the file is readable, well-formed, and valid.
/// - `Err(ConfigError::Io)` if the file cannot be read.
/// - `Err(ConfigError::Parse)` if the TOML is malformed.
/// - `Err(ConfigError::Validation)` if semantic constraints are violated.
///
/// # Panics
///
/// This function never panics.
///
/// # Example
///
/// ```rust,ignore
/// use variant_router::config::loader::load_from_file;
/// use std::path::Path;
///
/// let config = load_from_file(Path::new("router.toml"))?;
/// println!("Loaded experiment: {}", config.routing.name);
/// ```
pub fn load_from_file(path: &Path) -> Result<RouterConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        file: path.display().to_string(),
        source: e,
    })?;

    load_from_str(&content, &path.display().to_string())
}

/// Load a [`RouterConfig`] from a TOML string.
///
/// # Arguments
///
/// * `content`: TOML content as a string.
/// * `source_name`: Identifier for the source (used in error messages).
///
/// # Panics
///
/// This function never panics.
pub fn load_from_str(content: &str, source_name: &str) -> Result<RouterConfig, ConfigError> {
    let config: RouterConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
        file: source_name.to_string(),
        source: e,
    })?;

    validate_joined(&config)?;
    Ok(config)
}

/// Load a [`RouterConfig`] from the process environment.
///
/// Returns `Ok(None)` when `AB_TESTING_ENABLED` is not `true`, so callers
/// can fall back to a file or refuse to start.
///
/// # Errors
///
/// - [`ConfigError::Env`] if `AB_TRAFFIC_CONFIG` is missing or malformed.
/// - [`ConfigError::Validation`] if the resulting config is invalid.
///
/// # Panics
///
/// This function never panics.
pub fn load_from_env() -> Result<Option<RouterConfig>, ConfigError> {
    load_from_vars(|key| std::env::var(key).ok())
}

/// Same as [`load_from_env`] but reads variables through `lookup`.
///
/// # Panics
///
/// This function never panics.
pub fn load_from_vars<F>(lookup: F) -> Result<Option<RouterConfig>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let enabled = lookup(ENV_ENABLED)
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if !enabled {
        tracing::info!("{ENV_ENABLED} is not set to true; environment routing disabled");
        return Ok(None);
    }

    let strategy = lookup(ENV_STRATEGY).unwrap_or_else(|| "random".to_string());
    let name = lookup(ENV_EXPERIMENT).unwrap_or_else(|| "default".to_string());
    let traffic = lookup(ENV_TRAFFIC).ok_or_else(|| ConfigError::Env {
        var: ENV_TRAFFIC.to_string(),
        reason: "required when routing is enabled".to_string(),
    })?;

    let routing = parse_traffic_config(&traffic)?
        .into_iter()
        .fold(RoutingConfig::new(name, strategy.trim()), |cfg, (variant, weight)| {
            cfg.with_variant(VariantConfig::new(variant, weight, Stage::Control))
        });

    let config = RouterConfig::from_routing(routing);
    validate_joined(&config)?;

    tracing::info!(
        experiment = %config.routing.name,
        strategy = %config.routing.strategy,
        variants = config.routing.variants.len(),
        "loaded routing configuration from environment"
    );
    Ok(Some(config))
}

/// Parse a legacy `name:percent,name:percent` traffic split.
///
/// Whitespace around names and numbers is ignored. Percentages must be
/// whole numbers.
///
/// # Errors
///
/// Returns [`ConfigError::Env`] naming the offending pair.
///
/// # Panics
///
/// This function never panics.
pub fn parse_traffic_config(raw: &str) -> Result<Vec<(String, u32)>, ConfigError> {
    raw.split(',')
        .filter(|pair| !pair.trim().is_empty())
        .map(|pair| {
            let (name, pct) = pair.split_once(':').ok_or_else(|| ConfigError::Env {
                var: ENV_TRAFFIC.to_string(),
                reason: format!("expected name:percent, got '{}'", pair.trim()),
            })?;
            let weight = pct.trim().parse::<u32>().map_err(|e| ConfigError::Env {
                var: ENV_TRAFFIC.to_string(),
                reason: format!("bad percentage '{}' for '{}': {e}", pct.trim(), name.trim()),
            })?;
            Ok((name.trim().to_string(), weight))
        })
        .collect()
}

fn validate_joined(config: &RouterConfig) -> Result<(), ConfigError> {
    validation::validate(config).map_err(|errors| {
        ConfigError::Validation(
            errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        )
    })
}
