//! The filter-callback channel for a registered sync root.

#![cfg(windows)]

use std::{
    path::Path,
    sync::{Arc, Weak},
};

use tracing::{info, warn};
use windows::Win32::Storage::CloudFilters::{
    self, CfConnectSyncRoot, CfDisconnectSyncRoot, CF_CALLBACK_REGISTRATION, CF_CONNECTION_KEY,
};

use crate::{error::Result, hydration::HydrationHandler};

/// An active callback connection. The callback table and handler stay pinned
/// for the connection's lifetime; dropping disconnects.
pub struct Connection {
    key: i64,
    _callbacks: Box<[CF_CALLBACK_REGISTRATION; 3]>,
    _handler: Arc<HydrationHandler>,
}

impl Connection {
    pub fn connect(client_path: &Path, handler: &Arc<HydrationHandler>) -> Result<Self> {
        let callbacks = Box::new(crate::hydration::callback_table());
        let key = unsafe {
            CfConnectSyncRoot(
                client_path.as_os_str(),
                callbacks.as_ptr(),
                // The handler is reached through a weak reference so a torn
                // down connection cannot resurrect it.
                Weak::into_raw(Arc::downgrade(handler)) as *const _,
                CloudFilters::CF_CONNECT_FLAG_REQUIRE_FULL_FILE_PATH,
            )
        }?;

        info!(path = %client_path.display(), "filter callbacks connected");
        Ok(Self {
            key: key.0,
            _callbacks: callbacks,
            _handler: handler.clone(),
        })
    }

    pub fn disconnect(&self) -> Result<()> {
        unsafe { CfDisconnectSyncRoot(&CF_CONNECTION_KEY(self.key)) }?;
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            warn!(error = %e, "disconnect on drop failed");
        }
    }
}
