//! The client→server half of the sync engine: debounces noisy filesystem
//! events, merges them into a minimal set of semantic operations, detects
//! cross-directory moves, executes against the server with retry, and owns
//! the echo-suppression set consulted by the server→client direction.

mod executor;
mod op;

pub use op::OpKind;

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::time::Instant;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::{
    activity::ActivityBus,
    config::Tuning,
    path::PathMap,
    placeholder::PlaceholderStore,
};

use op::{path_key, name_key, DeletedRecord, OpState, PendingOp};

#[derive(Debug, Clone, Copy)]
pub struct EngineTuning {
    pub debounce: Duration,
    pub move_window: Duration,
    pub suppression_ttl: Duration,
    pub max_retries: u32,
}

impl Default for EngineTuning {
    fn default() -> Self {
        Tuning::default().into()
    }
}

impl From<Tuning> for EngineTuning {
    fn from(tuning: Tuning) -> Self {
        Self {
            debounce: tuning.debounce(),
            move_window: tuning.move_window(),
            suppression_ttl: tuning.suppression_ttl(),
            max_retries: tuning.max_retries,
        }
    }
}

#[derive(Default)]
struct EngineState {
    /// At most one operation per case-folded absolute path.
    pending: HashMap<String, PendingOp>,
    /// Recent deletions by bare filename, for move detection.
    deleted_recent: HashMap<String, DeletedRecord>,
    /// Relative paths this engine is currently writing, with expiry.
    suppressed: HashMap<String, Instant>,
    next_epoch: u64,
}

impl EngineState {
    fn sweep_deleted(&mut self, window: Duration) {
        let now = Instant::now();
        self.deleted_recent
            .retain(|_, record| now - record.deleted_at <= window);
    }

    fn cancel_and_remove(&mut self, key: &str) -> Option<PendingOp> {
        let mut removed = self.pending.remove(key)?;
        removed.cancel_timer();
        Some(removed)
    }
}

pub struct SyncEngine {
    paths: PathMap,
    store: Arc<PlaceholderStore>,
    tuning: EngineTuning,
    activity: ActivityBus,
    state: Mutex<EngineState>,
    disposed: CancellationToken,
    tasks: TaskTracker,
}

impl SyncEngine {
    pub fn new(
        store: Arc<PlaceholderStore>,
        tuning: EngineTuning,
        activity: ActivityBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            paths: store.paths().clone(),
            store,
            tuning,
            activity,
            state: Mutex::new(EngineState::default()),
            disposed: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    pub fn activity(&self) -> &ActivityBus {
        &self.activity
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    /// A create under the client root. `placeholder_only` marks entries whose
    /// content state proves they came from server-side population.
    pub fn on_created(self: &Arc<Self>, path: &Path, placeholder_only: bool) {
        let relative = match self.paths.client_relative(path) {
            Ok(relative) => relative,
            Err(e) => {
                warn!(error = %e, "create outside client root ignored");
                return;
            }
        };

        let mut state = self.state.lock().unwrap();
        state.sweep_deleted(self.tuning.move_window);

        // A delete of the same basename inside the move window means this
        // create is the second half of a move.
        if let Some(record) = take_move_source(&mut state, path) {
            self.adopt_move(&mut state, path, relative, record);
            drop(state);
            // Show the sync-pending glyph while the move propagates. UI
            // only; failures are swallowed.
            if let Err(e) = self.store.mark_not_in_sync(path) {
                debug!(error = %e, "mark_not_in_sync skipped");
            }
            return;
        }

        if placeholder_only {
            debug!(relative = %relative.display(), "placeholder echo dropped");
            return;
        }

        let key = path_key(path);
        state.cancel_and_remove(&key);

        let mut pending = PendingOp::new(OpKind::Create, path.to_path_buf(), relative);
        pending.is_directory = path.is_dir();
        self.insert_and_schedule(&mut state, key, pending);
    }

    /// Converts a delete+create pair into a single rename operation.
    fn adopt_move(
        self: &Arc<Self>,
        state: &mut EngineState,
        path: &Path,
        relative: PathBuf,
        record: DeletedRecord,
    ) {
        // The delete pending for the source is now part of the move.
        state.cancel_and_remove(&path_key(&record.original_path));

        // Replace gesture: Delete(dest) + Delete(src) + Create(dest). The
        // destination delete is redundant once the rename overwrites it.
        let key = path_key(path);
        if state
            .pending
            .get(&key)
            .is_some_and(|pending| pending.kind == OpKind::Delete)
        {
            state.cancel_and_remove(&key);
        }

        info!(
            from = %record.relative_path.display(),
            to = %relative.display(),
            "move detected"
        );

        let mut pending = PendingOp::new(OpKind::Rename, path.to_path_buf(), relative);
        pending.original_path = Some(record.original_path);
        pending.original_relative = Some(record.relative_path);
        pending.is_directory = record.is_directory;
        pending.detected_move = true;
        self.insert_and_schedule(state, key, pending);
    }

    pub fn on_renamed(self: &Arc<Self>, old: &Path, new: &Path) {
        let new_relative = match self.paths.client_relative(new) {
            Ok(relative) => relative,
            Err(e) => {
                warn!(error = %e, "rename outside client root ignored");
                return;
            }
        };

        let mut state = self.state.lock().unwrap();
        let old_key = path_key(old);
        let new_key = path_key(new);

        // A rename landing while the create for the same file is executing:
        // remember the destination and apply it after the create finishes.
        if let Some(pending) = state.pending.get_mut(&old_key) {
            if pending.kind == OpKind::Create && pending.state == OpState::InProgress {
                pending.queued_rename = Some(new.to_path_buf());
                return;
            }
        }

        let existing = state.cancel_and_remove(&old_key);
        state.cancel_and_remove(&new_key);

        match existing {
            // The file has not reached the server yet: one create at the
            // final name is the entire story.
            Some(superseded) if superseded.kind == OpKind::Create => {
                let mut pending =
                    PendingOp::new(OpKind::Create, new.to_path_buf(), new_relative);
                pending.is_directory = superseded.is_directory;
                pending.created_at = superseded.created_at;
                self.insert_and_schedule(&mut state, new_key, pending);
            }
            other => {
                let mut pending = PendingOp::new(OpKind::Rename, new.to_path_buf(), new_relative);
                // A second rename before the first executed keeps pointing at
                // the path the server still has.
                let (original_path, original_relative) = match other {
                    Some(prior) if prior.kind == OpKind::Rename => {
                        (prior.original_path, prior.original_relative)
                    }
                    _ => (
                        Some(old.to_path_buf()),
                        self.paths.client_relative(old).ok(),
                    ),
                };
                pending.original_path = original_path;
                pending.original_relative = original_relative;
                pending.is_directory = new.is_dir();
                self.insert_and_schedule(&mut state, new_key, pending);
            }
        }
    }

    pub fn on_deleted(self: &Arc<Self>, path: &Path, is_directory: bool) {
        let relative = match self.paths.client_relative(path) {
            Ok(relative) => relative,
            Err(e) => {
                warn!(error = %e, "delete outside client root ignored");
                return;
            }
        };

        let mut state = self.state.lock().unwrap();
        state.sweep_deleted(self.tuning.move_window);
        let key = path_key(path);

        // Create followed by delete before anything executed: net zero.
        if state
            .pending
            .get(&key)
            .is_some_and(|pending| pending.kind == OpKind::Create && pending.state == OpState::Pending)
        {
            state.cancel_and_remove(&key);
            debug!(relative = %relative.display(), "create+delete cancelled out");
            return;
        }

        state.cancel_and_remove(&key);

        let mut pending = PendingOp::new(OpKind::Delete, path.to_path_buf(), relative.clone());
        pending.is_directory = is_directory;
        self.insert_and_schedule(&mut state, key, pending);

        state.deleted_recent.insert(
            name_key(path),
            DeletedRecord {
                original_path: path.to_path_buf(),
                relative_path: relative,
                is_directory,
                deleted_at: Instant::now(),
            },
        );
    }

    pub fn on_modified(self: &Arc<Self>, path: &Path) {
        let relative = match self.paths.client_relative(path) {
            Ok(relative) => relative,
            Err(_) => return,
        };

        let mut state = self.state.lock().unwrap();
        let key = path_key(path);

        // An existing pending op just has its debounce window restarted; its
        // kind already covers the content change.
        if state
            .pending
            .get(&key)
            .is_some_and(|pending| pending.state == OpState::Pending)
        {
            let pending = state.cancel_and_remove(&key).expect("entry checked above");
            self.insert_and_schedule(&mut state, key, pending);
            return;
        }

        let pending = PendingOp::new(OpKind::Modify, path.to_path_buf(), relative);
        self.insert_and_schedule(&mut state, key, pending);
    }

    /// Whether the server→client direction should treat an event on this
    /// relative path as this engine's own echo.
    pub fn is_suppressed(&self, relative: &Path) -> bool {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        state.suppressed.retain(|_, expires| *expires > now);
        state.suppressed.contains_key(&path_key(relative))
    }

    fn suppress(&self, state: &mut EngineState, relative: &Path) {
        state.suppressed.insert(
            path_key(relative),
            Instant::now() + self.tuning.suppression_ttl,
        );
    }

    fn insert_and_schedule(self: &Arc<Self>, state: &mut EngineState, key: String, mut op: PendingOp) {
        let epoch = state.next_epoch;
        state.next_epoch += 1;

        let timer = CancellationToken::new();
        op.epoch = epoch;
        op.state = OpState::Pending;
        op.timer = Some(timer.clone());
        state.pending.insert(key.clone(), op);

        let engine = Arc::clone(self);
        let debounce = self.tuning.debounce;
        let disposed = self.disposed.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = disposed.cancelled() => {}
                _ = tokio::time::sleep(debounce) => engine.mature(&key, epoch).await,
            }
        });
    }

    /// Debounce expiry: transition to in-progress, declare intent in the
    /// suppression set, and execute.
    async fn mature(self: &Arc<Self>, key: &str, epoch: u64) {
        let snapshot = {
            let mut state = self.state.lock().unwrap();
            match state.pending.get_mut(key) {
                Some(pending) if pending.epoch == epoch && pending.state == OpState::Pending => {
                    pending.state = OpState::InProgress;
                    pending.timer = None;
                    pending.clone()
                }
                // Merged away or superseded after the timer fired.
                _ => return,
            }
        };

        let mut attempt = 0u32;
        let outcome = loop {
            {
                let mut state = self.state.lock().unwrap();
                self.suppress(&mut state, &snapshot.current_relative);
                if let Some(original) = &snapshot.original_relative {
                    self.suppress(&mut state, original);
                }
            }

            match executor::execute(&snapshot, &self.paths, &self.store).await {
                Ok(kind) => break Ok(kind),
                Err(e) if attempt < self.tuning.max_retries && e.is_transient() => {
                    warn!(
                        relative = %snapshot.current_relative.display(),
                        attempt, error = %e,
                        "operation failed, backing off"
                    );
                    tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                    attempt += 1;
                }
                Err(e) => break Err(e),
            }
        };

        // Release the slot unless a newer op already claimed it.
        let queued_rename = {
            let mut state = self.state.lock().unwrap();
            match state.pending.get(key) {
                Some(current) if current.epoch == epoch => state
                    .pending
                    .remove(key)
                    .and_then(|entry| entry.queued_rename),
                _ => None,
            }
        };

        match outcome {
            Ok(kind) => {
                info!(
                    relative = %snapshot.current_relative.display(),
                    ?kind,
                    "synced to server"
                );
                self.activity
                    .completed(kind, snapshot.current_relative.clone());
                if let Some(new_path) = queued_rename {
                    self.on_renamed(&snapshot.current_path, &new_path);
                }
            }
            Err(e) => {
                error!(
                    relative = %snapshot.current_relative.display(),
                    error = %e,
                    "operation failed permanently"
                );
                self.activity
                    .failed(snapshot.current_relative.clone(), e.to_string());
            }
        }
    }

    /// Cancels every pending timer, clears all state, and waits for in-flight
    /// executors to finish.
    pub async fn dispose(&self) {
        self.disposed.cancel();
        {
            let mut state = self.state.lock().unwrap();
            for pending in state.pending.values_mut() {
                pending.cancel_timer();
            }
            state.pending.clear();
            state.deleted_recent.clear();
            state.suppressed.clear();
        }
        self.tasks.close();
        self.tasks.wait().await;
    }
}

/// Picks the deletion this create completes into a move, if any.
///
/// The basename lookup normally answers directly. When it returns the created
/// path itself, the gesture was a replace: the matching record is the
/// overwritten destination, and the true source is the newest other deletion
/// still in the window.
fn take_move_source(state: &mut EngineState, created: &Path) -> Option<DeletedRecord> {
    let record = state.deleted_recent.remove(&name_key(created))?;
    if path_key(&record.original_path) != path_key(created) {
        return Some(record);
    }

    let newest = state
        .deleted_recent
        .iter()
        .max_by_key(|(_, candidate)| candidate.deleted_at)
        .map(|(key, _)| key.clone())?;
    state.deleted_recent.remove(&newest)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    struct Rig {
        _server: TempDir,
        _client: TempDir,
        client_root: PathBuf,
        engine: Arc<SyncEngine>,
    }

    fn rig() -> Rig {
        rig_with(EngineTuning::default())
    }

    fn rig_with(tuning: EngineTuning) -> Rig {
        let server = tempfile::tempdir().unwrap();
        let client = tempfile::tempdir().unwrap();
        let paths = PathMap::new(
            server.path().canonicalize().unwrap(),
            client.path().canonicalize().unwrap(),
        )
        .unwrap();
        let client_root = paths.client_root().to_path_buf();
        let store = Arc::new(PlaceholderStore::new(paths));
        let engine = SyncEngine::new(store, tuning, ActivityBus::new());
        Rig {
            _server: server,
            _client: client,
            client_root,
            engine,
        }
    }

    fn kind_at(engine: &SyncEngine, path: &Path) -> Option<OpKind> {
        engine
            .state
            .lock()
            .unwrap()
            .pending
            .get(&path_key(path))
            .map(|pending| pending.kind)
    }

    #[tokio::test(start_paused = true)]
    async fn create_then_rename_coalesces_into_one_create() {
        let rig = rig();
        let first = rig.client_root.join("New Folder");
        let renamed = rig.client_root.join("Reports");
        fs::create_dir(&first).unwrap();

        rig.engine.on_created(&first, false);
        fs::rename(&first, &renamed).unwrap();
        rig.engine.on_renamed(&first, &renamed);

        assert_eq!(kind_at(&rig.engine, &first), None);
        assert_eq!(kind_at(&rig.engine, &renamed), Some(OpKind::Create));
        assert_eq!(rig.engine.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn create_then_delete_nets_to_nothing() {
        let rig = rig();
        let path = rig.client_root.join("ephemeral.txt");
        fs::write(&path, b"x").unwrap();

        rig.engine.on_created(&path, false);
        fs::remove_file(&path).unwrap();
        rig.engine.on_deleted(&path, false);

        assert_eq!(rig.engine.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_then_create_becomes_a_move() {
        let rig = rig();
        let source = rig.client_root.join("a").join("file.txt");
        let target = rig.client_root.join("b").join("file.txt");

        rig.engine.on_deleted(&source, false);
        rig.engine.on_created(&target, false);

        assert_eq!(rig.engine.pending_count(), 1);
        let state = rig.engine.state.lock().unwrap();
        let pending = state.pending.get(&path_key(&target)).unwrap();
        assert_eq!(pending.kind, OpKind::Rename);
        assert!(pending.detected_move);
        assert_eq!(
            pending.original_relative.as_deref(),
            Some(Path::new("a/file.txt"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn replace_gesture_pairs_with_the_real_source() {
        let rig = rig();
        let dest = rig.client_root.join("report.txt");
        let source = rig.client_root.join("report-v2.txt");

        // Delete(dest) + Delete(src) + Create(dest), as the shell emits them.
        rig.engine.on_deleted(&dest, false);
        rig.engine.on_deleted(&source, false);
        rig.engine.on_created(&dest, false);

        assert_eq!(rig.engine.pending_count(), 1);
        let state = rig.engine.state.lock().unwrap();
        let pending = state.pending.get(&path_key(&dest)).unwrap();
        assert_eq!(pending.kind, OpKind::Rename);
        assert_eq!(
            pending.original_relative.as_deref(),
            Some(Path::new("report-v2.txt"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn placeholder_only_create_is_dropped() {
        let rig = rig();
        let path = rig.client_root.join("from-server.txt");

        rig.engine.on_created(&path, true);

        assert_eq!(rig.engine.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn modify_resets_the_timer_without_changing_the_kind() {
        let rig = rig();
        let old = rig.client_root.join("was.txt");
        let new = rig.client_root.join("now.txt");
        fs::write(&new, b"x").unwrap();

        rig.engine.on_renamed(&old, &new);
        rig.engine.on_modified(&new);

        assert_eq!(kind_at(&rig.engine, &new), Some(OpKind::Rename));
        assert_eq!(rig.engine.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn chained_renames_keep_the_first_original() {
        let rig = rig();
        let a = rig.client_root.join("a.txt");
        let b = rig.client_root.join("b.txt");
        let c = rig.client_root.join("c.txt");
        fs::write(&c, b"x").unwrap();

        rig.engine.on_renamed(&a, &b);
        rig.engine.on_renamed(&b, &c);

        assert_eq!(rig.engine.pending_count(), 1);
        let state = rig.engine.state.lock().unwrap();
        let pending = state.pending.get(&path_key(&c)).unwrap();
        assert_eq!(
            pending.original_relative.as_deref(),
            Some(Path::new("a.txt"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn suppression_expires_after_ttl() {
        let rig = rig();
        let relative = Path::new("docs/x.txt");
        {
            let mut state = rig.engine.state.lock().unwrap();
            rig.engine.suppress(&mut state, relative);
        }

        assert!(rig.engine.is_suppressed(relative));
        // Case folding applies to suppression lookups as well.
        assert!(rig.engine.is_suppressed(Path::new("DOCS/X.TXT")));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!rig.engine.is_suppressed(relative));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_deleted_records_are_swept() {
        let rig = rig();
        let source = rig.client_root.join("old.txt");
        let target = rig.client_root.join("elsewhere").join("old.txt");

        rig.engine.on_deleted(&source, false);
        tokio::time::advance(Duration::from_secs(30)).await;

        // Outside the window the create is just a create.
        rig.engine.on_created(&target, false);
        assert_eq!(kind_at(&rig.engine, &target), Some(OpKind::Create));
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_cancels_pending_timers() {
        let rig = rig();
        let path = rig.client_root.join("pending.txt");
        fs::write(&path, b"x").unwrap();

        rig.engine.on_modified(&path);
        assert_eq!(rig.engine.pending_count(), 1);

        rig.engine.dispose().await;
        assert_eq!(rig.engine.pending_count(), 0);

        // The debounce window elapsing afterwards must not execute anything.
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(rig.engine.pending_count(), 0);
    }
}
