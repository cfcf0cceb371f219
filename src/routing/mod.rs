//! # Variant Routing
//!
//! ## Responsibility
//! Decide which model variant serves each request. A validated
//! [`RoutingConfig`](crate::config::RoutingConfig) is compiled into an
//! immutable [`RoutingTable`], published through the [`SwapController`], and
//! consulted by the [`select`] function for every request.
//!
//! ## Guarantees
//! - Deterministic: for a fixed table, the same user (hash) or session
//!   (sticky) identifier always lands on the same variant, across restarts
//!   and replicas (MD5 bucketing).
//! - Consistent: a request sees exactly one table generation, never a
//!   partially applied update.
//! - Non-blocking: readers never wait on a publisher; selection is a hash or
//!   a random draw plus one array index.
//! - Total: every bucket in `[0, 100)` belongs to exactly one variant.
//!
//! ## NOT Responsible For
//! - Calling the model (that belongs to [`invoker`](crate::invoker))
//! - Deciding when an experiment is over or which variant won
//! - Persisting configuration or assignments

pub mod controller;
pub mod router;
pub mod selector;
pub mod table;
pub mod variant;

// Re-exports for convenience
pub use controller::{spawn_reload_task, SwapController};
pub use router::{RouteError, RoutedPrediction, RouterStatus, VariantRouter, VariantStatus};
pub use selector::{select, select_with_rng, stable_bucket, Assignment, RequestContext, Strategy};
pub use table::{BucketRange, RoutingTable, BUCKETS};
pub use variant::{ModelRef, Stage, Variant, VariantRegistry};
