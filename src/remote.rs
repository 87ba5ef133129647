//! The server→client direction: an abstract feed of remote change events and
//! the applier that mirrors them as placeholder operations.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use notify::{
    event::{ModifyKind, RenameMode},
    Event, EventKind,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    activity::{ActivityBus, ActivityKind},
    engine::SyncEngine,
    error::{Result, SyncError},
    path::PathMap,
    placeholder::PlaceholderStore,
    shell, temp,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteEventKind {
    Create,
    Delete,
    Rename,
}

/// One change on the server, in server-relative terms.
#[derive(Debug, Clone)]
pub struct RemoteEvent {
    pub kind: RemoteEventKind,
    pub relative_path: PathBuf,
    pub old_relative_path: Option<PathBuf>,
}

/// Source of remote change events. The reference implementation watches the
/// server directory; a production deployment substitutes a push stream.
/// Delivery must be at-least-once; the applier is idempotent.
#[async_trait]
pub trait RemoteChangeFeed: Send {
    /// The next event, or `None` once the feed has stopped.
    async fn next(&mut self) -> Option<RemoteEvent>;
}

/// Reference feed: a second filesystem observer on the server tree, its raw
/// notifications translated 1:1 into [`RemoteEvent`]s.
pub struct FsChangeFeed {
    rx: mpsc::UnboundedReceiver<RemoteEvent>,
    _task: JoinHandle<()>,
}

impl FsChangeFeed {
    pub fn spawn(paths: &PathMap, stopping: CancellationToken) -> Result<Self> {
        let (watcher, mut raw) = crate::watch::channel_watcher(paths.server_root())?;
        let (tx, rx) = mpsc::unbounded_channel();
        let paths = paths.clone();

        let task = tokio::spawn(async move {
            let _watcher = watcher;
            let mut rename_from: Option<PathBuf> = None;
            loop {
                tokio::select! {
                    _ = stopping.cancelled() => break,
                    received = raw.recv() => match received {
                        Some(Ok(event)) => translate(&paths, event, &mut rename_from, &tx),
                        Some(Err(e)) => warn!(error = %e, "server watcher error"),
                        None => break,
                    },
                }
            }
        });

        Ok(Self { rx, _task: task })
    }
}

#[async_trait]
impl RemoteChangeFeed for FsChangeFeed {
    async fn next(&mut self) -> Option<RemoteEvent> {
        self.rx.recv().await
    }
}

fn translate(
    paths: &PathMap,
    event: Event,
    rename_from: &mut Option<PathBuf>,
    tx: &mpsc::UnboundedSender<RemoteEvent>,
) {
    let emit = |kind: RemoteEventKind, abs: &Path, old_abs: Option<&Path>| {
        if temp::is_temporary_name(abs) {
            return;
        }
        let Ok(relative) = paths.server_relative(abs) else {
            return;
        };
        let old_relative = old_abs.and_then(|old| paths.server_relative(old).ok());
        let _ = tx.send(RemoteEvent {
            kind,
            relative_path: relative,
            old_relative_path: old_relative,
        });
    };

    match event.kind {
        EventKind::Create(_) => {
            for path in &event.paths {
                emit(RemoteEventKind::Create, path, None);
            }
        }
        EventKind::Remove(_) => {
            for path in &event.paths {
                emit(RemoteEventKind::Delete, path, None);
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            if let [old, new] = event.paths.as_slice() {
                emit(RemoteEventKind::Rename, new, Some(old));
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            *rename_from = event.paths.first().cloned();
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            if let Some(new) = event.paths.first() {
                match rename_from.take() {
                    Some(old) => emit(RemoteEventKind::Rename, new, Some(&old)),
                    None => emit(RemoteEventKind::Create, new, None),
                }
            }
        }
        // Content changes propagate through hydration, not the feed.
        _ => {}
    }
}

/// Applies remote events to the client tree, honoring the engine's
/// suppression set so this direction never reacts to the other one's writes.
pub struct ServerApplier {
    store: Arc<PlaceholderStore>,
    engine: Arc<SyncEngine>,
    activity: ActivityBus,
}

impl ServerApplier {
    pub fn new(store: Arc<PlaceholderStore>, engine: Arc<SyncEngine>, activity: ActivityBus) -> Self {
        Self {
            store,
            engine,
            activity,
        }
    }

    pub async fn run(self, mut feed: impl RemoteChangeFeed, stopping: CancellationToken) {
        loop {
            tokio::select! {
                _ = stopping.cancelled() => break,
                event = feed.next() => match event {
                    Some(event) => {
                        if let Err(e) = self.apply(&event) {
                            warn!(?event, error = %e, "remote event not applied");
                        }
                    }
                    None => break,
                },
            }
        }
    }

    pub fn apply(&self, event: &RemoteEvent) -> Result<()> {
        if self.engine.is_suppressed(&event.relative_path)
            || event
                .old_relative_path
                .as_deref()
                .is_some_and(|old| self.engine.is_suppressed(old))
        {
            debug!(relative = %event.relative_path.display(), "own echo dropped");
            return Ok(());
        }

        let paths = self.store.paths();
        let client_abs = paths.client_abs(&event.relative_path);

        match event.kind {
            RemoteEventKind::Create => {
                let server_abs = paths.server_abs(&event.relative_path);
                self.store.create_single(&server_abs, &client_abs)?;
                if let Some(parent) = client_abs.parent() {
                    shell::notify_directory_changed(parent);
                }
                self.activity
                    .completed(ActivityKind::Synced, event.relative_path.clone());
            }
            RemoteEventKind::Delete => {
                self.store.delete(&client_abs)?;
            }
            RemoteEventKind::Rename => {
                let old_relative = event
                    .old_relative_path
                    .as_deref()
                    .ok_or_else(|| SyncError::NotFound(event.relative_path.clone()))?;
                let old_client_abs = paths.client_abs(old_relative);

                match self.store.rename(&old_client_abs, &client_abs) {
                    // Redelivered after a crash: the move already happened.
                    Err(SyncError::NotFound(_)) if client_abs.exists() => return Ok(()),
                    other => other?,
                }
                self.store
                    .update_identity(&client_abs, &event.relative_path)?;
                self.store.mark_in_sync(&client_abs)?;
            }
        }
        Ok(())
    }
}
