//! End-to-end engine scenarios against real temp trees, with virtual time so
//! debounce windows elapse instantly.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use tempfile::TempDir;
use tokio::{sync::broadcast, time::timeout};

use nuvii_sync::{
    activity::{ActivityBus, ActivityKind, SyncEvent},
    engine::{EngineTuning, SyncEngine},
    path::PathMap,
    placeholder::{PlaceholderStore, WHOLE_FILE},
    remote::{RemoteEvent, RemoteEventKind, ServerApplier},
};

struct World {
    _server_dir: TempDir,
    _client_dir: TempDir,
    server: PathBuf,
    client: PathBuf,
    store: Arc<PlaceholderStore>,
    engine: Arc<SyncEngine>,
    events: broadcast::Receiver<SyncEvent>,
}

fn world() -> World {
    let server_dir = tempfile::tempdir().unwrap();
    let client_dir = tempfile::tempdir().unwrap();
    let server = server_dir.path().canonicalize().unwrap();
    let client = client_dir.path().canonicalize().unwrap();

    let paths = PathMap::new(server.clone(), client.clone()).unwrap();
    let activity = ActivityBus::new();
    let events = activity.subscribe();
    let store = Arc::new(PlaceholderStore::new(paths));
    let engine = SyncEngine::new(store.clone(), EngineTuning::default(), activity);

    World {
        _server_dir: server_dir,
        _client_dir: client_dir,
        server,
        client,
        store,
        engine,
        events,
    }
}

async fn next_completed(events: &mut broadcast::Receiver<SyncEvent>) -> (ActivityKind, PathBuf) {
    match timeout(Duration::from_secs(600), events.recv())
        .await
        .expect("an activity event before the window closes")
        .expect("activity channel open")
    {
        SyncEvent::Completed {
            kind,
            relative_path,
        } => (kind, relative_path),
        SyncEvent::Failed {
            relative_path,
            error,
        } => panic!("sync failed for {}: {error}", relative_path.display()),
    }
}

fn assert_no_more_events(events: &mut broadcast::Receiver<SyncEvent>) {
    assert!(matches!(
        events.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test(start_paused = true)]
async fn create_then_rename_reaches_the_server_only_under_the_final_name() {
    let mut w = world();
    let first = w.client.join("New Folder");
    let renamed = w.client.join("Reports");

    fs::create_dir(&first).unwrap();
    w.engine.on_created(&first, false);

    // Renamed well inside the debounce window.
    fs::rename(&first, &renamed).unwrap();
    w.engine.on_renamed(&first, &renamed);

    let (kind, relative) = next_completed(&mut w.events).await;
    assert_eq!(kind, ActivityKind::Uploaded);
    assert_eq!(relative, Path::new("Reports"));
    assert!(w.server.join("Reports").is_dir());
    assert!(!w.server.join("New Folder").exists());
    assert_eq!(w.engine.pending_count(), 0);
    assert_no_more_events(&mut w.events);
}

#[tokio::test(start_paused = true)]
async fn cross_directory_move_is_one_server_rename() {
    let mut w = world();
    for root in [&w.server, &w.client] {
        fs::create_dir(root.join("a")).unwrap();
        fs::create_dir(root.join("b")).unwrap();
    }
    fs::write(w.server.join("a/file.txt"), b"payload").unwrap();
    fs::write(w.client.join("a/file.txt"), b"payload").unwrap();

    // The shell reports a cross-directory move as delete + create.
    fs::rename(w.client.join("a/file.txt"), w.client.join("b/file.txt")).unwrap();
    w.engine.on_deleted(&w.client.join("a/file.txt"), false);
    w.engine.on_created(&w.client.join("b/file.txt"), false);

    let (kind, relative) = next_completed(&mut w.events).await;
    assert_eq!(kind, ActivityKind::Moved);
    assert_eq!(relative, Path::new("b/file.txt"));
    assert_eq!(fs::read(w.server.join("b/file.txt")).unwrap(), b"payload");
    assert!(!w.server.join("a/file.txt").exists());

    // Both ends of the move are declared to the other direction.
    assert!(w.engine.is_suppressed(Path::new("a/file.txt")));
    assert!(w.engine.is_suppressed(Path::new("b/file.txt")));
    assert_no_more_events(&mut w.events);
}

#[tokio::test(start_paused = true)]
async fn replace_file_becomes_one_overwriting_move() {
    let mut w = world();
    fs::write(w.server.join("report.txt"), b"old").unwrap();
    fs::write(w.server.join("report-v2.txt"), b"new").unwrap();
    fs::write(w.client.join("report.txt"), b"old").unwrap();
    fs::write(w.client.join("report-v2.txt"), b"new").unwrap();

    // Drag-and-drop with overwrite: Delete(dest) + Delete(src) + Create(dest).
    fs::remove_file(w.client.join("report.txt")).unwrap();
    fs::rename(w.client.join("report-v2.txt"), w.client.join("report.txt")).unwrap();
    w.engine.on_deleted(&w.client.join("report.txt"), false);
    w.engine.on_deleted(&w.client.join("report-v2.txt"), false);
    w.engine.on_created(&w.client.join("report.txt"), false);

    let (kind, relative) = next_completed(&mut w.events).await;
    assert_eq!(kind, ActivityKind::Moved);
    assert_eq!(relative, Path::new("report.txt"));
    assert_eq!(fs::read(w.server.join("report.txt")).unwrap(), b"new");
    assert!(!w.server.join("report-v2.txt").exists());
    assert_eq!(w.engine.pending_count(), 0);
    assert_no_more_events(&mut w.events);
}

#[tokio::test(start_paused = true)]
async fn placeholder_echo_causes_no_server_operation() {
    let mut w = world();
    fs::write(w.server.join("x.txt"), b"remote").unwrap();

    let applier = ServerApplier::new(w.store.clone(), w.engine.clone(), ActivityBus::new());
    applier
        .apply(&RemoteEvent {
            kind: RemoteEventKind::Create,
            relative_path: "x.txt".into(),
            old_relative_path: None,
        })
        .unwrap();
    assert!(w.client.join("x.txt").exists());

    // The reflected local create carries the placeholder-only flag.
    w.engine.on_created(&w.client.join("x.txt"), true);
    tokio::time::advance(Duration::from_secs(10)).await;

    assert_eq!(w.engine.pending_count(), 0);
    assert_eq!(fs::read_dir(&w.server).unwrap().count(), 1);
    assert_no_more_events(&mut w.events);
}

#[tokio::test(start_paused = true)]
async fn own_upload_echo_is_dropped_by_the_applier() {
    let mut w = world();
    fs::write(w.client.join("y.txt"), b"local").unwrap();
    w.engine.on_created(&w.client.join("y.txt"), false);

    let (kind, _) = next_completed(&mut w.events).await;
    assert_eq!(kind, ActivityKind::Uploaded);
    assert!(w.engine.is_suppressed(Path::new("y.txt")));

    // The feed reflects our own server write back at us; prove the applier
    // dropped it by removing the client copy it would otherwise recreate.
    fs::remove_file(w.client.join("y.txt")).unwrap();
    let applier = ServerApplier::new(w.store.clone(), w.engine.clone(), ActivityBus::new());
    applier
        .apply(&RemoteEvent {
            kind: RemoteEventKind::Create,
            relative_path: "y.txt".into(),
            old_relative_path: None,
        })
        .unwrap();
    assert!(!w.client.join("y.txt").exists());
}

#[tokio::test(start_paused = true)]
async fn repeated_modifies_debounce_into_one_upload() {
    let mut w = world();
    let doc = w.client.join("doc.docx");

    for (pause, content) in [(0u64, "v1"), (1, "v2"), (1, "v3")] {
        tokio::time::advance(Duration::from_secs(pause)).await;
        fs::write(&doc, content).unwrap();
        w.engine.on_modified(&doc);
    }

    let (kind, relative) = next_completed(&mut w.events).await;
    assert_eq!(kind, ActivityKind::Uploaded);
    assert_eq!(relative, Path::new("doc.docx"));
    assert_eq!(fs::read(w.server.join("doc.docx")).unwrap(), b"v3");
    assert_eq!(w.engine.pending_count(), 0);
    assert_no_more_events(&mut w.events);
}

#[tokio::test(start_paused = true)]
async fn remote_directory_create_populates_all_children() {
    let w = world();
    fs::create_dir_all(w.server.join("docs/sub")).unwrap();
    fs::write(w.server.join("docs/a.txt"), b"aaaa").unwrap();
    fs::write(w.server.join("docs/sub/b.txt"), b"bb").unwrap();

    let applier = ServerApplier::new(w.store.clone(), w.engine.clone(), ActivityBus::new());
    let event = RemoteEvent {
        kind: RemoteEventKind::Create,
        relative_path: "docs".into(),
        old_relative_path: None,
    };
    applier.apply(&event).unwrap();

    assert!(w.client.join("docs/a.txt").exists());
    assert!(w.client.join("docs/sub/b.txt").exists());
    // Placeholders mirror the server sizes without carrying content yet.
    assert_eq!(
        fs::metadata(w.client.join("docs/a.txt")).unwrap().len(),
        fs::metadata(w.server.join("docs/a.txt")).unwrap().len()
    );

    // At-least-once delivery: the same event twice is the same end state.
    applier.apply(&event).unwrap();
    assert!(w.client.join("docs/sub/b.txt").exists());
}

#[tokio::test(start_paused = true)]
async fn remote_rename_applies_idempotently() {
    let w = world();
    fs::write(w.server.join("old-name.txt"), b"data").unwrap();

    let applier = ServerApplier::new(w.store.clone(), w.engine.clone(), ActivityBus::new());
    applier
        .apply(&RemoteEvent {
            kind: RemoteEventKind::Create,
            relative_path: "old-name.txt".into(),
            old_relative_path: None,
        })
        .unwrap();

    let rename = RemoteEvent {
        kind: RemoteEventKind::Rename,
        relative_path: "new-name.txt".into(),
        old_relative_path: Some("old-name.txt".into()),
    };
    applier.apply(&rename).unwrap();
    assert!(w.client.join("new-name.txt").exists());
    assert!(!w.client.join("old-name.txt").exists());

    // Redelivery finds the move already done and changes nothing.
    applier.apply(&rename).unwrap();
    assert!(w.client.join("new-name.txt").exists());

    let delete = RemoteEvent {
        kind: RemoteEventKind::Delete,
        relative_path: "new-name.txt".into(),
        old_relative_path: None,
    };
    applier.apply(&delete).unwrap();
    applier.apply(&delete).unwrap();
    assert!(!w.client.join("new-name.txt").exists());
}

#[tokio::test(start_paused = true)]
async fn hydrate_then_dehydrate_round_trips_content() {
    let w = world();
    fs::write(w.server.join("data.bin"), b"0123456789").unwrap();

    let applier = ServerApplier::new(w.store.clone(), w.engine.clone(), ActivityBus::new());
    applier
        .apply(&RemoteEvent {
            kind: RemoteEventKind::Create,
            relative_path: "data.bin".into(),
            old_relative_path: None,
        })
        .unwrap();

    let client_file = w.client.join("data.bin");
    assert!(w.store.state(&client_file).unwrap().is_offline);

    w.store.hydrate(&client_file, 0, WHOLE_FILE).unwrap();
    assert_eq!(fs::read(&client_file).unwrap(), b"0123456789");
    assert!(!w.store.state(&client_file).unwrap().is_offline);

    w.store.dehydrate(&client_file, 0, WHOLE_FILE).unwrap();
    assert!(w.store.state(&client_file).unwrap().is_offline);

    // A second hydration yields identical bytes: no data was lost.
    w.store.hydrate(&client_file, 0, WHOLE_FILE).unwrap();
    assert_eq!(fs::read(&client_file).unwrap(), b"0123456789");
}

#[tokio::test(start_paused = true)]
async fn zero_byte_file_round_trips() {
    let w = world();
    fs::write(w.server.join("empty.txt"), b"").unwrap();

    let applier = ServerApplier::new(w.store.clone(), w.engine.clone(), ActivityBus::new());
    applier
        .apply(&RemoteEvent {
            kind: RemoteEventKind::Create,
            relative_path: "empty.txt".into(),
            old_relative_path: None,
        })
        .unwrap();

    let client_file = w.client.join("empty.txt");
    assert_eq!(fs::metadata(&client_file).unwrap().len(), 0);
    w.store.hydrate(&client_file, 0, WHOLE_FILE).unwrap();
    assert_eq!(fs::metadata(&client_file).unwrap().len(), 0);
}
