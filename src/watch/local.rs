//! Observes the client tree and turns raw change notifications into engine
//! events, filtering editor noise and placeholder-population echoes.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use notify::{
    event::{ModifyKind, RemoveKind, RenameMode},
    Event, EventKind,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    engine::SyncEngine,
    error::Result,
    placeholder::PlaceholderStore,
    temp,
    watch::channel_watcher,
};

pub struct LocalEventSource {
    task: JoinHandle<()>,
}

impl LocalEventSource {
    pub fn spawn(
        store: Arc<PlaceholderStore>,
        engine: Arc<SyncEngine>,
        stopping: CancellationToken,
    ) -> Result<Self> {
        let root = store.paths().client_root().to_path_buf();
        let (watcher, rx) = channel_watcher(&root)?;

        let pump = Pump { store, engine, root };
        let task = tokio::spawn(pump.run(watcher, rx, stopping));
        Ok(Self { task })
    }

    /// Waits for the pump to drain after its stop token fires.
    pub async fn stop(self) {
        let _ = self.task.await;
    }
}

struct Pump {
    store: Arc<PlaceholderStore>,
    engine: Arc<SyncEngine>,
    root: PathBuf,
}

impl Pump {
    async fn run(
        self,
        mut watcher: notify::RecommendedWatcher,
        mut rx: tokio::sync::mpsc::UnboundedReceiver<notify::Result<Event>>,
        stopping: CancellationToken,
    ) {
        // Half of a split rename pair, waiting for its other side.
        let mut rename_from: Option<PathBuf> = None;

        loop {
            tokio::select! {
                _ = stopping.cancelled() => break,
                received = rx.recv() => match received {
                    Some(Ok(event)) => self.dispatch(event, &mut rename_from),
                    Some(Err(e)) => {
                        // Buffer overflow and friends: restart the observer.
                        warn!(error = %e, "client watcher error, restarting");
                        match self.restart(&mut watcher, &mut rx).await {
                            Ok(()) => {}
                            Err(restart_error) => {
                                warn!(error = %restart_error, "client watcher restart failed");
                                break;
                            }
                        }
                    }
                    None => {
                        warn!("client watcher channel closed, restarting");
                        match self.restart(&mut watcher, &mut rx).await {
                            Ok(()) => {}
                            Err(restart_error) => {
                                warn!(error = %restart_error, "client watcher restart failed");
                                break;
                            }
                        }
                    }
                },
            }
        }
    }

    async fn restart(
        &self,
        watcher: &mut notify::RecommendedWatcher,
        rx: &mut tokio::sync::mpsc::UnboundedReceiver<notify::Result<Event>>,
    ) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let (new_watcher, new_rx) = channel_watcher(&self.root)?;
        *watcher = new_watcher;
        *rx = new_rx;
        Ok(())
    }

    fn dispatch(&self, event: Event, rename_from: &mut Option<PathBuf>) {
        // Anything but the matching rename half means the stashed source
        // left the tree.
        if !matches!(
            event.kind,
            EventKind::Modify(ModifyKind::Name(RenameMode::To))
        ) {
            if let Some(old) = rename_from.take() {
                self.deleted(&old, false);
            }
        }

        match event.kind {
            EventKind::Create(_) => {
                for path in &event.paths {
                    self.created(path);
                }
            }
            EventKind::Remove(kind) => {
                let is_directory = matches!(kind, RemoveKind::Folder);
                for path in &event.paths {
                    self.deleted(path, is_directory);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                if let [old, new] = event.paths.as_slice() {
                    self.renamed(old, new);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                *rename_from = event.paths.first().cloned();
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                if let Some(new) = event.paths.first() {
                    match rename_from.take() {
                        Some(old) => self.renamed(&old, new),
                        None => self.created(new),
                    }
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Any)) => {
                for path in &event.paths {
                    if path.exists() {
                        self.created(path);
                    } else {
                        self.deleted(path, false);
                    }
                }
            }
            // Attribute churn belongs to the pin watcher.
            EventKind::Modify(ModifyKind::Metadata(_)) => {}
            EventKind::Modify(_) => {
                for path in &event.paths {
                    self.modified(path);
                }
            }
            _ => {}
        }
    }

    fn created(&self, path: &Path) {
        if temp::is_temporary(path) {
            debug!(path = %path.display(), "temp create dropped");
            return;
        }
        let placeholder_only = self
            .store
            .state(path)
            .map(|state| state.placeholder_only())
            .unwrap_or(false);
        self.engine.on_created(path, placeholder_only);
    }

    fn deleted(&self, path: &Path, is_directory: bool) {
        if temp::is_temporary_name(path) {
            debug!(path = %path.display(), "temp delete dropped");
            return;
        }
        self.engine.on_deleted(path, is_directory);
    }

    fn renamed(&self, old: &Path, new: &Path) {
        let old_temp = temp::is_temporary_name(old);
        let new_temp = temp::is_temporary(new);
        match (old_temp, new_temp) {
            (true, true) => {}
            // An editor finishing an atomic save: the real file appears now.
            (true, false) => self.created(new),
            (false, true) => self.deleted(old, new.is_dir()),
            (false, false) => self.engine.on_renamed(old, new),
        }
    }

    fn modified(&self, path: &Path) {
        if path.is_dir() || temp::is_temporary(path) {
            return;
        }
        let placeholder_only = self
            .store
            .state(path)
            .map(|state| state.placeholder_only())
            .unwrap_or(false);
        if placeholder_only {
            return;
        }
        self.engine.on_modified(path);
    }
}
