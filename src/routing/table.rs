//! Routing table construction.
//!
//! A [`RoutingTable`] partitions the bucket space `[0, 100)` into one
//! half-open range per variant, in configuration order, and precomputes a
//! bucket → variant array so every lookup is a single index.

use std::sync::Arc;

use serde::Serialize;

use super::selector::Strategy;
use super::variant::{Variant, VariantRegistry};
use crate::config::validation::{validate_routing, ValidationError};
use crate::config::RoutingConfig;

/// Size of the bucket space. Weights are percentages of it.
pub const BUCKETS: u8 = 100;

/// The half-open bucket range `[start, end)` owned by one variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BucketRange {
    /// First bucket (inclusive).
    pub start: u8,
    /// One past the last bucket (exclusive).
    pub end: u8,
}

impl BucketRange {
    /// Return `true` if `bucket` falls inside this range.
    pub fn contains(&self, bucket: u8) -> bool {
        (self.start..self.end).contains(&bucket)
    }

    /// Number of buckets covered.
    pub fn len(&self) -> u8 {
        self.end - self.start
    }

    /// Return `true` for zero-weight variants.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Immutable routing table derived from one [`RoutingConfig`].
///
/// Built once per configuration change and shared behind an `Arc`; never
/// mutated after publication.
///
/// # Panics
///
/// This type and its methods never panic.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    name: String,
    strategy: Strategy,
    registry: VariantRegistry,
    ranges: Vec<BucketRange>,
    /// `slots[b]` is the variant owning bucket `b`; always exactly 100 long.
    slots: Box<[Arc<Variant>]>,
}

impl RoutingTable {
    /// Validate `config` and build its table.
    ///
    /// Pure: safe to call concurrently and to discard the result.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`] found, in the order: empty set,
    /// unknown strategy, empty name, duplicate name, weight sum.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn build(config: &RoutingConfig) -> Result<Self, ValidationError> {
        let strategy = validate_routing(config).map_err(|errors| {
            errors
                .into_iter()
                .next()
                .unwrap_or(ValidationError::EmptyVariantSet)
        })?;

        let registry = VariantRegistry::new(
            config
                .variants
                .iter()
                .map(|v| Variant {
                    name: v.name.clone(),
                    model: v.model_ref(),
                    stage: v.stage.clone(),
                    weight: v.weight,
                    version: v.version.clone(),
                })
                .collect(),
        );

        // Validation guarantees every weight is at most 100 and the total is
        // exactly 100, so the narrowing cast cannot truncate.
        let mut ranges = Vec::with_capacity(registry.len());
        let mut slots = Vec::with_capacity(usize::from(BUCKETS));
        let mut cumulative: u8 = 0;
        for variant in registry.iter() {
            let start = cumulative;
            let end = start + variant.weight as u8;
            slots.extend(
                std::iter::repeat_with(|| Arc::clone(variant)).take(usize::from(end - start)),
            );
            ranges.push(BucketRange { start, end });
            cumulative = end;
        }

        if cumulative != BUCKETS || slots.len() != usize::from(BUCKETS) {
            return Err(ValidationError::WeightsDoNotSumTo100 {
                total: u64::from(cumulative),
            });
        }

        Ok(Self {
            name: config.name.clone(),
            strategy,
            registry,
            ranges,
            slots: slots.into_boxed_slice(),
        })
    }

    pub(crate) fn stamp(&mut self, generation: u64) {
        self.registry.stamp(generation);
    }

    /// Experiment name from the configuration.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured routing strategy.
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Generation assigned when the table was published.
    pub fn generation(&self) -> u64 {
        self.registry.generation()
    }

    /// The variants backing this table.
    pub fn registry(&self) -> &VariantRegistry {
        &self.registry
    }

    /// Variants paired with their bucket ranges, in configuration order.
    pub fn entries(&self) -> impl Iterator<Item = (&Arc<Variant>, BucketRange)> {
        self.registry.iter().zip(self.ranges.iter().copied())
    }

    /// Range owned by a variant, if present.
    pub fn range_of(&self, name: &str) -> Option<BucketRange> {
        self.entries()
            .find(|(v, _)| v.name == name)
            .map(|(_, range)| range)
    }

    /// Resolve a bucket in `[0, 100)` to its variant.
    ///
    /// Buckets outside the space wrap modulo 100.
    pub fn lookup(&self, bucket: u8) -> &Arc<Variant> {
        &self.slots[usize::from(bucket % BUCKETS)]
    }
}
