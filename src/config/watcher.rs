//! Filesystem watcher for the config file (spec.md §4.6 "Watch()").
//!
//! Grounded on the debounced-settling-delay pattern used by the pack's Lua
//! hot-reload watcher: a `notify::Watcher` feeds an mpsc channel drained on
//! a dedicated thread, which collapses rapid successive writes into a
//! single reparse after a settling delay.

use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc as tokio_mpsc;
use tracing::{debug, info, warn};

/// Minimum quiet period after the last filesystem event before reparsing
/// (spec.md §4.6: "≥500 ms after last event").
pub const SETTLING_DELAY: Duration = Duration::from_millis(500);

/// Fires once per settled batch of config file changes.
pub struct ConfigChangeEvent;

pub struct WatcherHandle {
    _watcher: RecommendedWatcher,
    path: PathBuf,
}

impl WatcherHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Start watching `path`'s parent directory (so the watcher survives
/// temp-file-then-rename writes to `path` itself) and deliver one
/// debounced `ConfigChangeEvent` per settled batch on `tx`.
pub fn start_watcher(
    path: &Path,
    tx: tokio_mpsc::Sender<ConfigChangeEvent>,
) -> Result<WatcherHandle> {
    let watch_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&watch_dir)
        .with_context(|| format!("failed to create config dir: {}", watch_dir.display()))?;

    let (raw_tx, raw_rx) = mpsc::channel();
    let mut watcher: RecommendedWatcher =
        Watcher::new(raw_tx, notify::Config::default())
            .context("failed to create config filesystem watcher")?;
    watcher
        .watch(&watch_dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch: {}", watch_dir.display()))?;

    info!(dir = %watch_dir.display(), "watching config directory for changes");

    let path_clone = path.to_path_buf();
    std::thread::spawn(move || debounce_loop(raw_rx, &path_clone, tx));

    Ok(WatcherHandle {
        _watcher: watcher,
        path: path.to_path_buf(),
    })
}

fn debounce_loop(
    rx: mpsc::Receiver<notify::Result<notify::Event>>,
    target: &Path,
    tx: tokio_mpsc::Sender<ConfigChangeEvent>,
) {
    let mut last_event: Option<Instant> = None;

    loop {
        let timeout = match last_event {
            Some(t) => SETTLING_DELAY.saturating_sub(t.elapsed()),
            None => Duration::from_secs(3600),
        };

        match rx.recv_timeout(timeout) {
            Ok(Ok(event)) => {
                if event.paths.iter().any(|p| paths_match(p, target)) && is_relevant(&event.kind) {
                    debug!(?event, "config directory event");
                    last_event = Some(Instant::now());
                }
            }
            Ok(Err(e)) => warn!(error = %e, "config watcher error"),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if last_event.take().is_some() && tx.blocking_send(ConfigChangeEvent).is_err() {
                    debug!("config watcher receiver dropped, stopping");
                    return;
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                debug!("config filesystem watcher channel closed");
                return;
            }
        }
    }
}

fn is_relevant(kind: &notify::EventKind) -> bool {
    matches!(
        kind,
        notify::EventKind::Create(_) | notify::EventKind::Modify(_) | notify::EventKind::Remove(_)
    )
}

/// Matches both direct writes to `target` and temp-file+rename writes that
/// land on `target`'s final name (the common atomic-write idiom).
fn paths_match(event_path: &Path, target: &Path) -> bool {
    event_path == target
        || event_path.file_name() == target.file_name()
            && event_path.parent() == target.parent()
}
