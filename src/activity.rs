use std::path::PathBuf;

use tokio::sync::broadcast;

/// What a completed operation did, for the activity display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    Uploaded,
    Downloaded,
    Deleted,
    Renamed,
    /// A rename whose parent directory changed.
    Moved,
    Synced,
}

#[derive(Debug, Clone)]
pub enum SyncEvent {
    Completed {
        kind: ActivityKind,
        relative_path: PathBuf,
    },
    Failed {
        relative_path: PathBuf,
        error: String,
    },
}

/// Fan-out channel the UI layer subscribes to. Sending never blocks and never
/// fails; with no subscribers events are simply dropped.
#[derive(Debug, Clone)]
pub struct ActivityBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl ActivityBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    pub fn completed(&self, kind: ActivityKind, relative_path: PathBuf) {
        let _ = self.tx.send(SyncEvent::Completed {
            kind,
            relative_path,
        });
    }

    pub fn failed(&self, relative_path: PathBuf, error: String) {
        let _ = self.tx.send(SyncEvent::Failed {
            relative_path,
            error,
        });
    }
}

impl Default for ActivityBus {
    fn default() -> Self {
        Self::new()
    }
}
