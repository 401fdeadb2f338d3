//! Configuration directory watcher.
//!
//! Filesystem events from `notify` are bridged onto a tokio channel and
//! handled by a dedicated task: filter out anything that is not a config
//! file, wait out a short quiet period so half-written files are not parsed,
//! coalesce the burst, then hand control back to the lifecycle controller's
//! reload debounce.

use std::path::{Path, PathBuf};

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::AgentError;

/// Quiet period observed after a relevant event before requesting a reload.
/// Editors and config management tools write files in several steps; acting
/// on the first event would parse partial content.
pub const EVENT_SETTLE: std::time::Duration = std::time::Duration::from_secs(1);

pub struct ConfigWatcher {
    // Held for its Drop: dropping the watcher stops event delivery.
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl ConfigWatcher {
    /// Watch `dir` for added, modified, and deleted files. Paths accepted by
    /// `is_config_file` trigger `on_change` after the settle period; a burst
    /// of events collapses into a single callback.
    pub fn start<F, R>(dir: &Path, is_config_file: F, on_change: R) -> Result<Self, AgentError>
    where
        F: Fn(&Path) -> bool + Send + 'static,
        R: Fn() + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<PathBuf>>();
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    if event.kind.is_create() || event.kind.is_modify() || event.kind.is_remove() {
                        let _ = tx.send(event.paths);
                    }
                }
            },
            notify::Config::default(),
        )
        .map_err(|e| AgentError::Config(format!("failed to create file watcher: {e}")))?;
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| AgentError::Config(format!("failed to watch {}: {e}", dir.display())))?;
        info!(dir = %dir.display(), "watching configuration directory");

        let task = tokio::spawn(async move {
            while let Some(paths) = rx.recv().await {
                if !paths.iter().any(|p| is_config_file(p)) {
                    continue;
                }
                info!(?paths, "configuration change detected");
                tokio::time::sleep(EVENT_SETTLE).await;
                // Coalesce everything that arrived during the settle sleep.
                while let Ok(more) = rx.try_recv() {
                    debug!(paths = ?more, "coalesced configuration event");
                }
                on_change();
            }
        });

        Ok(Self {
            _watcher: watcher,
            task,
        })
    }

    pub fn stop(self) {
        self.task.abort();
    }
}
