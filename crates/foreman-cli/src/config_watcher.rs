//! Policy hot-reload watcher.
//!
//! Watches the policy file's directory for writes to the file and invokes a
//! callback with the freshly parsed [`Policy`] after a debounce window.

use foreman_core::{ForemanError, ForemanResult};
use foreman_orchestrator::Policy;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::time::{Duration, Instant};

/// Watches a policy file on disk and calls back on every (debounced) change.
///
/// Dropping it stops the background thread and releases the watch.
pub struct PolicyWatcher {
    _watcher: RecommendedWatcher,
}

impl PolicyWatcher {
    /// Start watching `policy_path`.
    ///
    /// The parent directory is watched rather than the file itself so that
    /// editors which save by rename keep triggering reloads. `on_reload` runs
    /// on a background thread and only sees documents that parsed and
    /// validated; anything else is logged and skipped.
    pub fn start<F>(policy_path: PathBuf, debounce: Duration, on_reload: F) -> ForemanResult<Self>
    where
        F: Fn(Policy) + Send + 'static,
    {
        let dir = match policy_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = policy_path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .ok_or_else(|| {
                ForemanError::Config(format!("{} is not a file path", policy_path.display()))
            })?;

        let (tx, rx) = std_mpsc::channel();
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            let Ok(event) = res else { return };
            let relevant = matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
                && event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == Some(file_name.as_os_str()));
            if relevant {
                let _ = tx.send(());
            }
        })
        .map_err(|e| ForemanError::Config(format!("Failed to create file watcher: {e}")))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| ForemanError::Config(format!("Failed to watch {}: {e}", dir.display())))?;

        let path = policy_path.clone();
        std::thread::spawn(move || {
            let mut last_reload = Instant::now();
            while rx.recv().is_ok() {
                // One reload per burst of writes.
                while rx.try_recv().is_ok() {}
                let since = last_reload.elapsed();
                if since < debounce {
                    std::thread::sleep(debounce - since);
                }
                while rx.try_recv().is_ok() {}
                last_reload = Instant::now();

                match reload(&path) {
                    Ok(policy) => on_reload(policy),
                    Err(e) => tracing::warn!(error = %e, "Ignoring invalid policy; previous policy stays active"),
                }
            }
            tracing::debug!("Policy watcher thread exiting");
        });

        tracing::info!(path = %policy_path.display(), "Policy hot-reload watcher started");
        Ok(Self { _watcher: watcher })
    }
}

/// Read, parse and validate the policy at `path`.
pub fn reload(path: &Path) -> ForemanResult<Policy> {
    Policy::load(path)
}
