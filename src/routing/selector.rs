//! Variant selection strategies.
//!
//! All three strategies map a request to a bucket in `[0, 100)` and resolve
//! it through the same [`RoutingTable`]:
//!
//! | Strategy | Bucket source |
//! |----------|---------------|
//! | `random` | fresh uniform draw per request |
//! | `hash`   | MD5 of `user_identifier`, modulo 100 |
//! | `sticky` | MD5 of `session_identifier`, modulo 100 |
//!
//! When `hash`/`sticky` lack their identifier the request is routed by a
//! random draw and the [`Assignment`] is flagged with `fallback_used`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rand::Rng;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::table::{RoutingTable, BUCKETS};
use super::variant::{Stage, Variant};
use crate::config::validation::ValidationError;

/// How a request is mapped to a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Uniform random draw per request.
    Random,
    /// Deterministic on the caller's user identifier.
    Hash,
    /// Deterministic on the caller's session identifier.
    Sticky,
}

impl Strategy {
    /// Lowercase name as used in configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::Hash => "hash",
            Self::Sticky => "sticky",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "random" => Ok(Self::Random),
            "hash" => Ok(Self::Hash),
            "sticky" => Ok(Self::Sticky),
            _ => Err(ValidationError::UnknownStrategy(s.to_string())),
        }
    }
}

/// Per-request identifiers supplied by the transport layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Stable caller identity, used by [`Strategy::Hash`].
    pub user_identifier: Option<String>,
    /// Session identity, used by [`Strategy::Sticky`].
    pub session_identifier: Option<String>,
}

impl RequestContext {
    /// Context with no identifiers.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Context carrying a user identifier.
    pub fn for_user(user: impl Into<String>) -> Self {
        Self {
            user_identifier: Some(user.into()),
            session_identifier: None,
        }
    }

    /// Context carrying a session identifier.
    pub fn for_session(session: impl Into<String>) -> Self {
        Self {
            user_identifier: None,
            session_identifier: Some(session.into()),
        }
    }

    /// Add a session identifier.
    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session_identifier = Some(session.into());
        self
    }

    /// Add a user identifier.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user_identifier = Some(user.into());
        self
    }

    /// The identifier a strategy keys on, ignoring empty strings.
    fn identifier_for(&self, strategy: Strategy) -> Option<&str> {
        let raw = match strategy {
            Strategy::Random => None,
            Strategy::Hash => self.user_identifier.as_deref(),
            Strategy::Sticky => self.session_identifier.as_deref(),
        };
        raw.filter(|id| !id.is_empty())
    }
}

/// The routing decision for one request.
///
/// Ephemeral; only its aggregate effect is kept, in the metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    /// Chosen variant, shared with the table it came from.
    pub variant: Arc<Variant>,
    /// Strategy the table was configured with.
    pub strategy: Strategy,
    /// Identifier the bucket was derived from, if any.
    pub identifier: Option<String>,
    /// Bucket in `[0, 100)` that resolved to `variant`.
    pub bucket: u8,
    /// `true` when `hash`/`sticky` had no identifier and a random draw was used.
    pub fallback_used: bool,
    /// Generation of the table the decision was made against.
    pub generation: u64,
}

impl Assignment {
    /// Name of the chosen variant.
    pub fn variant_name(&self) -> &str {
        &self.variant.name
    }

    /// Stage of the chosen variant.
    pub fn stage(&self) -> &Stage {
        &self.variant.stage
    }

    /// The strategy that actually produced the bucket.
    pub fn applied_strategy(&self) -> Strategy {
        if self.fallback_used {
            Strategy::Random
        } else {
            self.strategy
        }
    }
}

/// Map an identifier to a bucket in `[0, 100)`.
///
/// The MD5 digest is read as a big-endian 128-bit integer. The result depends
/// only on the identifier bytes, so it is identical across restarts, replicas
/// and platforms.
///
/// Only the bucket is stable. The variant that owns a bucket is decided by
/// the active table, so a reconfiguration that moves a range boundary across
/// the bucket moves the identifier to a different variant.
///
/// # Panics
///
/// This function never panics.
pub fn stable_bucket(identifier: &str) -> u8 {
    let digest = md5::compute(identifier.as_bytes());
    (u128::from_be_bytes(digest.0) % u128::from(BUCKETS)) as u8
}

/// Select a variant for one request using the thread-local RNG.
///
/// For `hash` and `sticky`, the same identifier gets the same variant for as
/// long as `table` is in use. Across tables only the bucket is guaranteed;
/// see [`stable_bucket`].
///
/// # Panics
///
/// This function never panics.
pub fn select(table: &RoutingTable, strategy: Strategy, context: &RequestContext) -> Assignment {
    select_with_rng(table, strategy, context, &mut rand::thread_rng())
}

/// Select a variant for one request drawing randomness from `rng`.
///
/// For `hash` and `sticky` with an identifier present, `rng` is not touched
/// and the result is a pure function of `(table, identifier)`.
///
/// # Panics
///
/// This function never panics.
pub fn select_with_rng<R: Rng + ?Sized>(
    table: &RoutingTable,
    strategy: Strategy,
    context: &RequestContext,
    rng: &mut R,
) -> Assignment {
    let identifier = context.identifier_for(strategy);
    let fallback_used = strategy != Strategy::Random && identifier.is_none();

    let bucket = match identifier {
        Some(id) => stable_bucket(id),
        None => rng.gen_range(0..BUCKETS),
    };

    if fallback_used {
        tracing::debug!(
            strategy = %strategy,
            bucket,
            "missing identifier, falling back to random selection"
        );
    }

    Assignment {
        variant: Arc::clone(table.lookup(bucket)),
        strategy,
        identifier: identifier.map(str::to_string),
        bucket,
        fallback_used,
        generation: table.generation(),
    }
}
