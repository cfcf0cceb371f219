//! Live reconfiguration of the active routing table.
//!
//! The [`SwapController`] owns the currently active [`RoutingTable`] behind an
//! [`ArcSwapOption`]. Readers take a lock-free snapshot (`Arc` clone) and keep
//! routing against it even if a newer table is published mid-request; the
//! superseded table is freed when its last snapshot is dropped. Publishers
//! are serialized by a mutex that also hands out generation numbers.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::table::RoutingTable;
use crate::config::validation::ValidationError;
use crate::config::{RouterConfig, RoutingConfig, VariantConfig};

/// Holds the active routing table and swaps it atomically.
///
/// Cheap to share: wrap in an `Arc` and hand it to every component that
/// needs the current table.
///
/// # Panics
///
/// This type and its methods never panic.
pub struct SwapController {
    active: ArcSwapOption<RoutingTable>,
    /// Config the active table was built from, for copy-on-write updates.
    writer: Mutex<WriterState>,
}

struct WriterState {
    next_generation: u64,
    config: Option<RoutingConfig>,
}

impl std::fmt::Debug for SwapController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwapController")
            .field("generation", &self.generation())
            .finish()
    }
}

impl Default for SwapController {
    fn default() -> Self {
        Self::new()
    }
}

impl SwapController {
    /// Create a controller with no active table.
    pub fn new() -> Self {
        Self {
            active: ArcSwapOption::empty(),
            writer: Mutex::new(WriterState {
                next_generation: 1,
                config: None,
            }),
        }
    }

    /// Create a controller and publish `config` as its first table.
    ///
    /// # Errors
    ///
    /// Returns the [`ValidationError`] if `config` is invalid.
    pub fn with_config(config: &RoutingConfig) -> Result<Self, ValidationError> {
        let controller = Self::new();
        controller.publish(config)?;
        Ok(controller)
    }

    /// Validate `config`, build its table, and make it the active one.
    ///
    /// Every `current()` call that starts after this returns sees the new
    /// table in full. On error nothing changes.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`] from the table builder.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn publish(&self, config: &RoutingConfig) -> Result<Arc<RoutingTable>, ValidationError> {
        let mut writer = self.writer.lock();
        self.publish_locked(&mut writer, config)
    }

    /// Build and store `config`; the caller holds the writer lock.
    fn publish_locked(
        &self,
        writer: &mut WriterState,
        config: &RoutingConfig,
    ) -> Result<Arc<RoutingTable>, ValidationError> {
        let mut table = match RoutingTable::build(config) {
            Ok(table) => table,
            Err(e) => {
                tracing::warn!(
                    experiment = %config.name,
                    error = %e,
                    active_generation = self.generation(),
                    "routing configuration rejected, keeping active table"
                );
                return Err(e);
            }
        };

        let generation = writer.next_generation;
        table.stamp(generation);
        let table = Arc::new(table);
        self.active.store(Some(Arc::clone(&table)));
        writer.next_generation += 1;
        writer.config = Some(config.clone());

        tracing::info!(
            experiment = %table.name(),
            strategy = %table.strategy(),
            generation,
            variants = table.registry().len(),
            "routing configuration published"
        );
        Ok(table)
    }

    /// Snapshot of the active table, or `None` if nothing was ever published.
    ///
    /// Never blocks on a concurrent [`publish`](Self::publish).
    pub fn current(&self) -> Option<Arc<RoutingTable>> {
        self.active.load_full()
    }

    /// Return `true` once a table has been published.
    pub fn is_active(&self) -> bool {
        self.active.load().is_some()
    }

    /// Generation of the active table, 0 if none.
    pub fn generation(&self) -> u64 {
        self.active
            .load()
            .as_ref()
            .map_or(0, |table| table.generation())
    }

    /// Re-weight variants of the active configuration and publish the result.
    ///
    /// Variants not named in `weights` keep their weight. Names that are not
    /// part of the active configuration are ignored with a warning. The
    /// resulting configuration is fully re-validated. The writer lock is held
    /// from reading the active configuration until the result is stored, so
    /// a concurrent [`publish`](Self::publish) lands either before (and is
    /// re-weighted) or after (and wins).
    ///
    /// # Errors
    ///
    /// - [`ValidationError::EmptyVariantSet`] if nothing was ever published.
    /// - Any builder error for the re-weighted configuration.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn update_weights(
        &self,
        weights: &HashMap<String, u32>,
    ) -> Result<Arc<RoutingTable>, ValidationError> {
        let mut writer = self.writer.lock();
        let base = writer
            .config
            .clone()
            .ok_or(ValidationError::EmptyVariantSet)?;

        for name in weights.keys() {
            if !base.variants.iter().any(|v| &v.name == name) {
                tracing::warn!(variant = %name, "weight update for unknown variant ignored");
            }
        }

        let updated = RoutingConfig {
            variants: base
                .variants
                .into_iter()
                .map(|v| match weights.get(&v.name) {
                    Some(&weight) => VariantConfig { weight, ..v },
                    None => v,
                })
                .collect(),
            ..base
        };
        self.publish_locked(&mut writer, &updated)
    }

    /// Configuration the active table was built from.
    pub fn active_config(&self) -> Option<RoutingConfig> {
        self.writer.lock().config.clone()
    }
}

/// Publish every config received from `updates` until the channel closes.
///
/// Pair with [`ConfigWatcher`](crate::config::watcher::ConfigWatcher) for
/// file-driven hot reload. Rejections are logged by
/// [`SwapController::publish`] and leave the active table in place.
///
/// # Panics
///
/// This function never panics.
pub fn spawn_reload_task(
    controller: Arc<SwapController>,
    mut updates: broadcast::Receiver<RouterConfig>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(config) => {
                    let _ = controller.publish(&config.routing);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "config reload lagged, older updates dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
