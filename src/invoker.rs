//! Model invocation abstraction.
//!
//! The router never calls a model itself; it resolves a variant to a
//! [`ModelRef`] and hands the request to a [`ModelInvoker`]. Retry, pooling
//! and transport all live behind this trait.
//!
//! - `EchoInvoker`: demo/test invoker that echoes the input back

use std::collections::HashSet;

use async_trait::async_trait;
use thiserror::Error;

use crate::routing::ModelRef;

/// Capability that runs a prediction against a resolved model.
///
/// Implementations must be thread-safe (Send + Sync) for use across tasks.
/// Errors are returned to the router's caller unchanged.
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    /// Request payload.
    type Input: Send + 'static;
    /// Successful prediction.
    type Prediction: Send + 'static;
    /// Failure reported by the model backend.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Run `input` against `model`.
    async fn invoke(
        &self,
        model: &ModelRef,
        input: Self::Input,
    ) -> Result<Self::Prediction, Self::Error>;
}

/// Errors produced by the bundled invokers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvocationError {
    /// The model backend could not be reached.
    #[error("model '{model}' is unavailable")]
    Unavailable {
        /// Model reference that was called.
        model: String,
    },

    /// The model rejected or failed the request.
    #[error("model '{model}' failed: {reason}")]
    Failed {
        /// Model reference that was called.
        model: String,
        /// Backend-supplied reason.
        reason: String,
    },
}

// ============================================================================
// Echo Invoker (Testing)
// ============================================================================

/// Dummy invoker for testing and demos.
///
/// Returns `"<model>: <input>"` after an optional delay. Models registered
/// with [`failing_on`](Self::failing_on) always return
/// [`InvocationError::Unavailable`].
#[derive(Debug, Clone, Default)]
pub struct EchoInvoker {
    /// Simulated inference delay
    pub delay_ms: u64,
    failing: HashSet<String>,
}

impl EchoInvoker {
    /// Create an invoker with no delay.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an invoker that sleeps `delay_ms` before answering.
    pub fn with_delay(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            ..Self::default()
        }
    }

    /// Make every call to `model` fail.
    pub fn failing_on(mut self, model: impl Into<String>) -> Self {
        self.failing.insert(model.into());
        self
    }
}

#[async_trait]
impl ModelInvoker for EchoInvoker {
    type Input = String;
    type Prediction = String;
    type Error = InvocationError;

    async fn invoke(&self, model: &ModelRef, input: String) -> Result<String, InvocationError> {
        if self.delay_ms > 0 {
            tokio::time::sleep(tokio::time::Duration::from_millis(self.delay_ms)).await;
        }

        if self.failing.contains(model.as_str()) {
            return Err(InvocationError::Unavailable {
                model: model.to_string(),
            });
        }

        Ok(format!("{model}: {input}"))
    }
}
