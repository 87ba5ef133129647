use std::path::{Path, PathBuf};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Create,
    Rename,
    Delete,
    Modify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpState {
    Pending,
    InProgress,
}

/// One coalesced client-side change waiting out its debounce window.
#[derive(Debug, Clone)]
pub(crate) struct PendingOp {
    pub kind: OpKind,
    pub current_path: PathBuf,
    pub original_path: Option<PathBuf>,
    pub current_relative: PathBuf,
    pub original_relative: Option<PathBuf>,
    pub is_directory: bool,
    /// Rename produced by pairing a recent delete with a create, rather than
    /// by a rename event. Reported as a move regardless of parent.
    pub detected_move: bool,
    pub created_at: Instant,
    pub state: OpState,
    /// Guards the one-shot debounce timer; a fired timer with a stale epoch
    /// must not execute.
    pub epoch: u64,
    pub timer: Option<CancellationToken>,
    /// Destination recorded by a rename that arrived while this create was
    /// already executing; applied after the create completes.
    pub queued_rename: Option<PathBuf>,
}

impl PendingOp {
    pub fn new(kind: OpKind, current_path: PathBuf, current_relative: PathBuf) -> Self {
        Self {
            kind,
            current_path,
            original_path: None,
            current_relative,
            original_relative: None,
            is_directory: false,
            detected_move: false,
            created_at: Instant::now(),
            state: OpState::Pending,
            epoch: 0,
            timer: None,
            queued_rename: None,
        }
    }

    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

/// A deletion eligible to pair with an upcoming create into a move. Keyed by
/// bare filename.
#[derive(Debug, Clone)]
pub(crate) struct DeletedRecord {
    pub original_path: PathBuf,
    pub relative_path: PathBuf,
    pub is_directory: bool,
    pub deleted_at: Instant,
}

/// Case-insensitive map key for a path, matching the filesystem the events
/// come from.
pub(crate) fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_lowercase()
}

pub(crate) fn name_key(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}
