//! Ordered start-up and shutdown of the whole provider.

use std::{path::Path, sync::Arc};

use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    activity::{ActivityBus, SyncEvent},
    config::SyncConfig,
    engine::SyncEngine,
    error::{Result, SyncError},
    path::PathMap,
    placeholder::PlaceholderStore,
    remote::{FsChangeFeed, ServerApplier},
    watch::{LocalEventSource, PinWatcher},
};

#[cfg(windows)]
use crate::hydration::HydrationHandler;

#[cfg(windows)]
use super::connect::Connection;

/// A running provider attached to one sync root.
///
/// Construction follows the fixed order, each step succeeding before the
/// next: enroll the client root with the search indexer, register the sync
/// root, connect the filter callbacks, populate placeholders, then start the
/// observers, the engine, and the remote applier. [`SyncSession::shutdown`]
/// reverses the later steps; the registration itself persists until an
/// operator removes it.
pub struct SyncSession {
    engine: Arc<SyncEngine>,
    activity: ActivityBus,
    stopping: CancellationToken,
    local: LocalEventSource,
    pin: PinWatcher,
    applier: JoinHandle<()>,
    #[cfg(windows)]
    connection: Connection,
    #[cfg(windows)]
    sync_root_id: String,
}

impl SyncSession {
    pub async fn start(config: SyncConfig) -> Result<Self> {
        config.validate()?;
        if !config.server_path.is_dir() {
            return Err(SyncError::Config(format!(
                "server path {} is not a directory",
                config.server_path.display()
            )));
        }
        std::fs::create_dir_all(&config.client_path)?;

        let paths = PathMap::new(config.server_path.clone(), config.client_path.clone())?;
        let activity = ActivityBus::new();
        let store = Arc::new(PlaceholderStore::new(paths.clone()));
        let engine = SyncEngine::new(store.clone(), config.tuning.into(), activity.clone());

        #[cfg(windows)]
        super::indexer::enroll(&config.client_path)?;

        #[cfg(windows)]
        let sync_root_id = super::register::ensure_registered(&config)?;

        #[cfg(windows)]
        let connection = {
            let handler = HydrationHandler::new(paths.clone(), activity.clone());
            Connection::connect(&config.client_path, &handler)?
        };

        #[cfg(not(windows))]
        tracing::warn!("cloud filter unavailable on this platform; mirroring without placeholders");

        // Initial population of the whole tree.
        store.create_tree(Path::new(""))?;

        let stopping = CancellationToken::new();
        let pin = PinWatcher::spawn(store.clone(), stopping.child_token())?;
        let local = LocalEventSource::spawn(store.clone(), engine.clone(), stopping.child_token())?;
        let feed = FsChangeFeed::spawn(&paths, stopping.child_token())?;
        let applier = tokio::spawn(
            ServerApplier::new(store, engine.clone(), activity.clone())
                .run(feed, stopping.child_token()),
        );

        info!(
            server = %config.server_path.display(),
            client = %config.client_path.display(),
            "sync session running"
        );

        Ok(Self {
            engine,
            activity,
            stopping,
            local,
            pin,
            applier,
            #[cfg(windows)]
            connection,
            #[cfg(windows)]
            sync_root_id,
        })
    }

    pub fn activity(&self) -> broadcast::Receiver<SyncEvent> {
        self.activity.subscribe()
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Stops observers and the applier, drains the engine, and disconnects
    /// the filter channel. The sync-root registration is left in place.
    pub async fn shutdown(self) {
        self.stopping.cancel();
        let _ = self.applier.await;
        self.local.stop().await;
        self.pin.stop().await;
        self.engine.dispose().await;

        // Dropping the connection closes the filter channel last, after the
        // engine can no longer issue placeholder work.
        #[cfg(windows)]
        drop(self.connection);

        info!("sync session stopped");
    }

    /// Explicitly removes the sync-root registration. Not part of normal
    /// shutdown.
    #[cfg(windows)]
    pub fn unregister(&self) -> Result<()> {
        super::register::unregister(&self.sync_root_id)
    }
}
