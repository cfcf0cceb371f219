//! Variants and the immutable variant registry.
//!
//! A [`Variant`] is one independently deployed model version that may receive
//! routed traffic. Variants are never mutated while active: a reconfiguration
//! builds a fresh [`VariantRegistry`] and the old one is dropped once the last
//! in-flight reader releases it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Opaque handle to a model, resolved by the [`ModelInvoker`](crate::ModelInvoker).
///
/// The router never interprets the contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct ModelRef(
    /// The raw reference, e.g. a registry URI such as `models:/churn/3`.
    pub String,
);

impl ModelRef {
    /// Create a new [`ModelRef`] from any string-like value.
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    /// Return the reference as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Role a variant plays in an experiment.
///
/// The four well-known labels are parsed case-insensitively; anything else is
/// preserved verbatim in [`Stage::Other`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Incumbent production model.
    Champion,
    /// Candidate competing against the champion.
    Challenger,
    /// Baseline arm of a controlled experiment.
    #[default]
    Control,
    /// Treatment arm of a controlled experiment.
    Treatment,
    /// Operator-defined label.
    Other(String),
}

impl Stage {
    /// Parse a stage label. Never fails; unknown labels become [`Stage::Other`].
    pub fn parse(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "champion" => Self::Champion,
            "challenger" => Self::Challenger,
            "control" => Self::Control,
            "treatment" => Self::Treatment,
            _ => Self::Other(label.trim().to_string()),
        }
    }

    /// Return the label as written in configuration and status output.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Champion => "champion",
            Self::Challenger => "challenger",
            Self::Control => "control",
            Self::Treatment => "treatment",
            Self::Other(label) => label,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Stage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Stage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        Ok(Self::parse(&label))
    }
}

impl JsonSchema for Stage {
    fn schema_name() -> String {
        "Stage".to_string()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        String::json_schema(gen)
    }
}

/// A named model version eligible to receive traffic.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Variant {
    /// Unique, stable key.
    pub name: String,
    /// Model behind this variant.
    pub model: ModelRef,
    /// Experiment role.
    pub stage: Stage,
    /// Share of traffic in percent (0–100).
    pub weight: u32,
    /// Free-form model version, `"unknown"` when not configured.
    pub version: String,
}

/// Immutable, generation-stamped table of variants in configuration order.
///
/// Lookups by name are O(1); iteration preserves insertion order.
#[derive(Debug, Clone)]
pub struct VariantRegistry {
    generation: u64,
    variants: Vec<Arc<Variant>>,
    index: HashMap<String, usize>,
}

impl VariantRegistry {
    /// Build a registry from variants in configuration order.
    ///
    /// Names are assumed unique (the table builder validates this first); if a
    /// name repeats, lookup resolves to its first occurrence.
    pub(crate) fn new(variants: Vec<Variant>) -> Self {
        let mut index = HashMap::with_capacity(variants.len());
        for (i, variant) in variants.iter().enumerate() {
            index.entry(variant.name.clone()).or_insert(i);
        }
        Self {
            generation: 0,
            variants: variants.into_iter().map(Arc::new).collect(),
            index,
        }
    }

    pub(crate) fn stamp(&mut self, generation: u64) {
        self.generation = generation;
    }

    /// Generation assigned by the swap controller (0 for unpublished tables).
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Look up a variant by name.
    pub fn get(&self, name: &str) -> Option<&Arc<Variant>> {
        self.index.get(name).and_then(|&i| self.variants.get(i))
    }

    /// Return `true` if a variant with this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Iterate variants in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Variant>> {
        self.variants.iter()
    }

    /// Number of registered variants.
    pub fn len(&self) -> usize {
        self.variants.len()
    }

    /// Return `true` if the registry holds no variants.
    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variant(name: &str, weight: u32) -> Variant {
        Variant {
            name: name.to_string(),
            model: ModelRef::new(format!("models:/{name}")),
            stage: Stage::Control,
            weight,
            version: "unknown".to_string(),
        }
    }

    #[test]
    fn test_stage_parse_known_labels_case_insensitive() {
        assert_eq!(Stage::parse("Champion"), Stage::Champion);
        assert_eq!(Stage::parse(" challenger "), Stage::Challenger);
        assert_eq!(Stage::parse("CONTROL"), Stage::Control);
        assert_eq!(Stage::parse("treatment"), Stage::Treatment);
    }

    #[test]
    fn test_stage_parse_unknown_label_kept_verbatim() {
        assert_eq!(Stage::parse("shadow"), Stage::Other("shadow".to_string()));
        assert_eq!(Stage::parse("shadow").as_str(), "shadow");
    }

    #[test]
    fn test_stage_serializes_as_plain_string() {
        let json = serde_json::to_string(&Stage::Champion).expect("test: serialize");
        assert_eq!(json, "\"champion\"");
        let other: Stage = serde_json::from_str("\"canary\"").expect("test: deserialize");
        assert_eq!(other, Stage::Other("canary".to_string()));
    }

    #[test]
    fn test_stage_default_is_control() {
        assert_eq!(Stage::default(), Stage::Control);
    }

    #[test]
    fn test_model_ref_serializes_transparently() {
        let json = serde_json::to_string(&ModelRef::new("models:/a/1")).expect("test: serialize");
        assert_eq!(json, "\"models:/a/1\"");
    }

    #[test]
    fn test_registry_preserves_configuration_order() {
        let registry = VariantRegistry::new(vec![variant("b", 30), variant("a", 70)]);
        let names: Vec<_> = registry.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn test_registry_lookup_by_name() {
        let registry = VariantRegistry::new(vec![variant("a", 50), variant("b", 50)]);
        assert_eq!(registry.get("b").map(|v| v.weight), Some(50));
        assert!(registry.contains("a"));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_registry_generation_defaults_to_zero_until_stamped() {
        let mut registry = VariantRegistry::new(vec![variant("a", 100)]);
        assert_eq!(registry.generation(), 0);
        registry.stamp(7);
        assert_eq!(registry.generation(), 7);
    }
}
