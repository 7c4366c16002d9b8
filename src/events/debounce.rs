//! Debounced fan-out collaborator contract (spec.md §4.4).
//!
//! Accepts a stream of `server_name` updates, batches them for a fixed
//! debounce window, and collapses the batch into one refresh signal. A
//! batch larger than a size threshold is promoted to a full resync
//! instead of per-server patches, so a reconciliation storm (e.g. the
//! scheduler finishing a large wave) doesn't fan out hundreds of
//! individual UI patches.

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};

/// Debounce window (spec.md §4.4: "≈100 ms").
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(100);
/// Batch size above which a full resync replaces per-server patches
/// (spec.md §4.4: "≈5").
pub const RESYNC_THRESHOLD: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refresh {
    /// Patch exactly these servers.
    Servers(Vec<String>),
    /// Batch exceeded the threshold — do a full resync instead.
    FullResync,
}

/// Drains `updates` into debounced [`Refresh`] batches delivered on the
/// returned receiver. The task exits once `updates` closes.
pub fn spawn_debouncer(mut updates: mpsc::Receiver<String>) -> mpsc::Receiver<Refresh> {
    let (tx, rx) = mpsc::channel(32);

    tokio::spawn(async move {
        let mut batch: HashSet<String> = HashSet::new();
        loop {
            let Some(first) = updates.recv().await else {
                break;
            };
            batch.insert(first);
            let deadline = Instant::now() + DEBOUNCE_WINDOW;

            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                tokio::select! {
                    maybe = updates.recv() => {
                        match maybe {
                            Some(name) => { batch.insert(name); }
                            None => break,
                        }
                    }
                    _ = sleep(remaining) => break,
                }
            }

            let refresh = if batch.len() > RESYNC_THRESHOLD {
                batch.clear();
                Refresh::FullResync
            } else {
                Refresh::Servers(batch.drain().collect())
            };

            if tx.send(refresh).await.is_err() {
                break;
            }
        }
    });

    rx
}
