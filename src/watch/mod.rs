//! Filesystem observers feeding the sync engine.

mod local;
mod pin;

pub use local::LocalEventSource;
pub use pin::PinWatcher;

use std::path::Path;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::error::Result;

/// Bridges a notify watcher onto a tokio channel. The watcher delivers on
/// its own thread; consumers drain the receiver from async tasks.
pub(crate) fn channel_watcher(
    root: &Path,
) -> Result<(
    RecommendedWatcher,
    mpsc::UnboundedReceiver<notify::Result<Event>>,
)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |event: notify::Result<Event>| {
        let _ = tx.send(event);
    })?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    Ok((watcher, rx))
}
