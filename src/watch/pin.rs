//! Watches for pin ("always keep on this device") and unpin ("free up
//! space") gestures, which the shell expresses as attribute changes.

use std::{path::Path, sync::Arc, time::Duration};

use notify::{event::ModifyKind, Event, EventKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::Result,
    placeholder::{PlaceholderStore, WHOLE_FILE},
    shell,
    watch::channel_watcher,
};

pub struct PinWatcher {
    task: JoinHandle<()>,
}

impl PinWatcher {
    pub fn spawn(store: Arc<PlaceholderStore>, stopping: CancellationToken) -> Result<Self> {
        let root = store.paths().client_root().to_path_buf();
        let (watcher, mut rx) = channel_watcher(&root)?;

        let task = tokio::spawn(async move {
            let _watcher = watcher;
            loop {
                tokio::select! {
                    _ = stopping.cancelled() => break,
                    received = rx.recv() => match received {
                        Some(Ok(event)) => handle(&store, event).await,
                        Some(Err(e)) => warn!(error = %e, "pin watcher error"),
                        None => break,
                    },
                }
            }
        });
        Ok(Self { task })
    }

    pub async fn stop(self) {
        let _ = self.task.await;
    }
}

async fn handle(store: &PlaceholderStore, event: Event) {
    if !matches!(
        event.kind,
        EventKind::Modify(ModifyKind::Metadata(_)) | EventKind::Modify(ModifyKind::Any)
    ) {
        return;
    }
    for path in &event.paths {
        if path.is_dir() {
            continue;
        }
        attribute_changed(store, path).await;
    }
}

async fn attribute_changed(store: &PlaceholderStore, path: &Path) {
    let state = match store.state(path) {
        Ok(state) => state,
        Err(_) => return,
    };

    if state.is_pinned && (state.is_offline || state.is_partial) {
        debug!(path = %path.display(), "pin requested, hydrating");
        match store.hydrate(path, 0, WHOLE_FILE) {
            Ok(()) => {
                let _ = store.mark_in_sync(path);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "hydration failed"),
        }
    } else if state.is_unpinned && !state.is_offline {
        debug!(path = %path.display(), "unpin requested, dehydrating");
        dehydrate(store, path, state.is_placeholder, state.is_in_sync).await;
    }
}

/// The dehydration protocol: the filter only releases content for an entry
/// that is a placeholder, in sync, and not pinned, so each precondition is
/// walked explicitly instead of failing opaquely.
async fn dehydrate(store: &PlaceholderStore, path: &Path, is_placeholder: bool, is_in_sync: bool) {
    let relative = match store.paths().client_relative(path) {
        Ok(relative) => relative,
        Err(_) => return,
    };

    // A file the user created moments ago and never synced: one call both
    // converts and releases the content.
    if !is_placeholder {
        match store.convert_and_dehydrate(path, &relative) {
            Ok(()) => {
                if let Some(parent) = path.parent() {
                    shell::notify_directory_changed(parent);
                }
            }
            Err(e) => warn!(path = %path.display(), error = %e, "convert+dehydrate failed"),
        }
        return;
    }

    if !is_in_sync {
        let _ = store.mark_in_sync(path);
        // Give the filter a moment to persist the transition.
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    match store.dehydrate(path, 0, WHOLE_FILE) {
        Err(e) => {
            warn!(path = %path.display(), error = %e, "dehydration failed");
            // Best effort to clear the sync-pending glyph.
            let _ = store.mark_in_sync(path);
        }
        Ok(()) => {
            let _ = store.mark_in_sync(path);
            if let Some(parent) = path.parent() {
                shell::notify_directory_changed(parent);
            }
        }
    }
}
