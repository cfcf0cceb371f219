//! Configuration hot-reload watcher.
//!
//! ## Responsibility
//! Watch a TOML config file for changes and broadcast validated new configs
//! to subscribers. Invalid reloads are logged and rejected; the current
//! config remains unchanged.
//!
//! ## Guarantees
//! - Only validated configs are broadcast
//! - Invalid file edits are logged but do not disrupt live routing
//! - A burst of writes is read once after it settles, so the last edit
//!   always wins
//! - Subscribers receive the new config via a `broadcast` channel
//!
//! ## NOT Responsible For
//! - Publishing the config to live traffic (see
//!   [`spawn_reload_task`](crate::routing::controller::spawn_reload_task))
//! - Initial config loading (that belongs to `loader`)

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use super::loader::load_from_file;
use super::validation::ConfigError;
use super::RouterConfig;

/// Quiet period after the last change before the file is re-read.
const DEBOUNCE: Duration = Duration::from_millis(500);

/// Watches a config file for changes and broadcasts validated updates.
///
/// # Panics
///
/// This type never panics.
pub struct ConfigWatcher {
    tx: broadcast::Sender<RouterConfig>,
    /// Dropping the watcher closes the event channel and ends the reload task.
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Create a new [`ConfigWatcher`] for the given config file path.
    ///
    /// Returns the watcher and a receiver for config change notifications.
    /// The initial config is **not** broadcast; use `loader::load_from_file`
    /// for the initial load. Must be called inside a Tokio runtime.
    ///
    /// A burst of writes is read once, 500 ms after the last of them,
    /// so the broadcast config always reflects the file's final contents.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file watcher cannot be created or
    /// the parent directory cannot be watched.
    ///
    /// # Panics
    ///
    /// This function never panics.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// use variant_router::config::watcher::ConfigWatcher;
    /// use std::path::PathBuf;
    ///
    /// let (watcher, mut rx) = ConfigWatcher::new(PathBuf::from("router.toml"))?;
    /// tokio::spawn(async move {
    ///     while let Ok(config) = rx.recv().await {
    ///         println!("Config reloaded: {}", config.routing.name);
    ///     }
    /// });
    /// ```
    pub fn new(path: PathBuf) -> Result<(Self, broadcast::Receiver<RouterConfig>), ConfigError> {
        let (tx, rx) = broadcast::channel(8);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let io_error = |file: &Path, e: notify::Error| ConfigError::Io {
            file: file.display().to_string(),
            source: std::io::Error::other(e.to_string()),
        };

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<notify::Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = event_tx.send(event);
                }
            },
            notify::Config::default(),
        )
        .map_err(|e| io_error(path.as_path(), e))?;

        // Watch the parent directory so atomic saves (write temp, rename over)
        // are still observed.
        let watch_dir = path
            .parent()
            .map(Path::to_path_buf)
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| PathBuf::from("."));
        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| io_error(watch_dir.as_path(), e))?;

        tokio::spawn(reload_loop(path, event_rx, tx.clone()));

        Ok((
            Self {
                tx,
                _watcher: watcher,
            },
            rx,
        ))
    }

    /// Subscribe to config change notifications.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn subscribe(&self) -> broadcast::Receiver<RouterConfig> {
        self.tx.subscribe()
    }
}

/// Return `true` if `event` created or modified the file at `path`.
fn touches(event: &notify::Event, path: &Path) -> bool {
    matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == path.file_name())
}

/// Re-read `path` once it has been quiet for [`DEBOUNCE`] and broadcast it
/// if it validates. Ends when the notify watcher is dropped.
async fn reload_loop(
    path: PathBuf,
    mut events: mpsc::UnboundedReceiver<notify::Event>,
    tx: broadcast::Sender<RouterConfig>,
) {
    let mut due: Option<Instant> = None;
    loop {
        let received = match due {
            Some(at) => match tokio::time::timeout_at(at, events.recv()).await {
                Ok(received) => received,
                Err(_) => {
                    due = None;
                    reload(&path, &tx);
                    continue;
                }
            },
            None => events.recv().await,
        };

        match received {
            Some(event) if touches(&event, &path) => {
                due = Some(Instant::now() + DEBOUNCE);
            }
            Some(_) => {}
            None => {
                tracing::debug!(path = %path.display(), "file watcher dropped, stopping reload loop");
                return;
            }
        }
    }
}

fn reload(path: &Path, tx: &broadcast::Sender<RouterConfig>) {
    match load_from_file(path) {
        Ok(config) => {
            tracing::info!(
                path = %path.display(),
                experiment = %config.routing.name,
                "config reloaded successfully"
            );
            // No receivers is fine; the config was still validated.
            let _ = tx.send(config);
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "config reload rejected, keeping current config"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const VALID_TOML: &str = r#"
[routing]
name = "watcher-test"
strategy = "random"

[[routing.variants]]
name = "a"
weight = 70

[[routing.variants]]
name = "b"
weight = 30
"#;

    #[tokio::test]
    async fn test_config_watcher_creation_succeeds() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let path = dir.path().join("router.toml");
        std::fs::write(&path, VALID_TOML).expect("test: write");

        assert!(ConfigWatcher::new(path).is_ok());
    }

    #[tokio::test]
    async fn test_config_watcher_subscribe_returns_receiver() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let path = dir.path().join("router.toml");
        std::fs::write(&path, VALID_TOML).expect("test: write");

        let (watcher, _rx) = ConfigWatcher::new(path).expect("test: create watcher");
        let _rx2 = watcher.subscribe();
    }

    #[tokio::test]
    async fn test_config_watcher_detects_file_change() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let path = dir.path().join("router.toml");
        std::fs::write(&path, VALID_TOML).expect("test: write");

        let (_watcher, mut rx) = ConfigWatcher::new(path.clone()).expect("test: create watcher");
        tokio::time::sleep(Duration::from_millis(200)).await;

        let updated = VALID_TOML.replace("watcher-test", "updated-name");
        let mut f = std::fs::File::create(&path).expect("test: open for write");
        f.write_all(updated.as_bytes()).expect("test: write");
        f.sync_all().expect("test: sync");
        drop(f);

        let result = tokio::time::timeout(Duration::from_secs(3), rx.recv()).await;
        let config = result.expect("test: timeout").expect("test: recv");
        assert_eq!(config.routing.name, "updated-name");
    }

    fn write_named(path: &Path, name: &str) {
        std::fs::write(path, VALID_TOML.replace("watcher-test", name)).expect("test: write");
    }

    #[tokio::test]
    async fn test_config_watcher_broadcasts_last_of_rapid_edits() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let path = dir.path().join("router.toml");
        std::fs::write(&path, VALID_TOML).expect("test: write");

        let (_watcher, mut rx) = ConfigWatcher::new(path.clone()).expect("test: create watcher");
        tokio::time::sleep(Duration::from_millis(200)).await;

        write_named(&path, "v2");
        tokio::time::sleep(Duration::from_millis(100)).await;
        write_named(&path, "v3");

        let mut last = None;
        while let Ok(Ok(config)) = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            last = Some(config.routing.name);
        }
        assert_eq!(last.as_deref(), Some("v3"));
    }

    #[tokio::test]
    async fn test_config_watcher_edit_right_after_reload_is_broadcast() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let path = dir.path().join("router.toml");
        std::fs::write(&path, VALID_TOML).expect("test: write");

        let (_watcher, mut rx) = ConfigWatcher::new(path.clone()).expect("test: create watcher");
        tokio::time::sleep(Duration::from_millis(200)).await;

        write_named(&path, "v2");
        let first = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("test: timeout")
            .expect("test: recv");
        assert_eq!(first.routing.name, "v2");

        write_named(&path, "v3");
        let second = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("test: timeout")
            .expect("test: recv");
        assert_eq!(second.routing.name, "v3");
    }

    #[tokio::test]
    async fn test_config_watcher_rejects_invalid_weights() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let path = dir.path().join("router.toml");
        std::fs::write(&path, VALID_TOML).expect("test: write");

        let (_watcher, mut rx) = ConfigWatcher::new(path.clone()).expect("test: create watcher");
        tokio::time::sleep(Duration::from_millis(200)).await;

        std::fs::write(&path, VALID_TOML.replace("weight = 30", "weight = 20"))
            .expect("test: write invalid");

        let result = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(result.is_err(), "should not broadcast invalid config");
    }

    #[tokio::test]
    async fn test_config_watcher_nonexistent_parent_returns_error() {
        let path = PathBuf::from("/definitely/nonexistent/dir/router.toml");
        assert!(ConfigWatcher::new(path).is_err());
    }
}
