//! Search-indexer enrollment for the client root.

#![cfg(windows)]

use std::{ffi::OsString, path::Path};

use tracing::info;
use windows::Win32::System::{
    Com::{CoCreateInstance, CLSCTX_SERVER},
    Search::{CSearchManager, ISearchCatalogManager, ISearchManager, FF_INDEXCOMPLEXURLS},
};

use crate::error::Result;

/// Adds the client root to the system catalog's default crawl scope, so
/// Explorer search keeps up as placeholders appear and dehydrate. Runs
/// before sync-root registration; a root the indexer cannot reach is a
/// start-up failure, not a degraded mode.
pub fn enroll(client_root: &Path) -> Result<()> {
    let mut scope_url = OsString::from("file:///");
    scope_url.push(client_root);

    unsafe {
        let manager: ISearchManager = CoCreateInstance(&CSearchManager, None, CLSCTX_SERVER)?;
        let system_index: ISearchCatalogManager = manager.GetCatalog("SystemIndex")?;
        let scope = system_index.GetCrawlScopeManager()?;
        scope.AddDefaultScopeRule(scope_url, true, FF_INDEXCOMPLEXURLS.0 as u32)?;
        scope.SaveAll()?;
    }

    info!(path = %client_root.display(), "client root enrolled with the search indexer");
    Ok(())
}
