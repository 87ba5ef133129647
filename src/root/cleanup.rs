//! Operator force-cleanup: strips every provider-prefixed sync-root
//! registration from the shell and the registry, then restarts Explorer so
//! the navigation pane forgets the entries.

use crate::error::Result;

#[cfg(windows)]
pub fn purge(provider_prefix: &str) -> Result<u32> {
    use tracing::{info, warn};
    use windows::Storage::Provider::StorageProviderSyncRootManager;

    let mut removed = 0u32;

    if let Ok(roots) = StorageProviderSyncRootManager::GetCurrentSyncRoots() {
        for root in roots {
            let Ok(id) = root.Id() else { continue };
            let id = id.to_string_lossy();
            if !id.starts_with(provider_prefix) {
                continue;
            }
            match StorageProviderSyncRootManager::Unregister(&windows::core::HSTRING::from(
                id.as_str(),
            )) {
                Ok(()) => {
                    info!(%id, "sync root unregistered");
                    removed += 1;
                }
                Err(e) => warn!(%id, error = %e, "unregister failed"),
            }
        }
    }

    removed += purge_registry(provider_prefix)?;
    restart_explorer();
    Ok(removed)
}

#[cfg(not(windows))]
pub fn purge(_provider_prefix: &str) -> Result<u32> {
    Err(crate::error::SyncError::Unsupported("sync-root cleanup"))
}

/// Deletes stale `SyncRootManager` registry entries left behind by crashed
/// or half-unregistered providers.
#[cfg(windows)]
fn purge_registry(provider_prefix: &str) -> Result<u32> {
    use tracing::{info, warn};
    use widestring::U16CString;
    use windows::{
        core::{w, PCWSTR},
        Win32::System::Registry::{
            RegCloseKey, RegDeleteTreeW, RegEnumKeyExW, RegOpenKeyExW, HKEY,
            HKEY_LOCAL_MACHINE, KEY_ENUMERATE_SUB_KEYS, KEY_WRITE,
        },
    };

    const SYNC_ROOT_MANAGER: PCWSTR =
        w!("SOFTWARE\\Microsoft\\Windows\\CurrentVersion\\Explorer\\SyncRootManager");

    let mut key = HKEY::default();
    let opened = unsafe {
        RegOpenKeyExW(
            HKEY_LOCAL_MACHINE,
            SYNC_ROOT_MANAGER,
            0,
            KEY_ENUMERATE_SUB_KEYS | KEY_WRITE,
            &mut key,
        )
    };
    if opened.is_err() {
        // Nothing registered on this machine; that is a clean state.
        return Ok(0);
    }

    // Collect first: deleting while enumerating shifts the indices.
    let mut stale = Vec::new();
    let mut index = 0u32;
    loop {
        let mut name = [0u16; 256];
        let mut len = name.len() as u32;
        let status = unsafe {
            RegEnumKeyExW(
                key,
                index,
                windows::core::PWSTR(name.as_mut_ptr()),
                &mut len,
                None,
                windows::core::PWSTR::null(),
                None,
                None,
            )
        };
        if status.is_err() {
            break;
        }
        let sub_key = String::from_utf16_lossy(&name[..len as usize]);
        if sub_key.starts_with(provider_prefix) {
            stale.push(sub_key);
        }
        index += 1;
    }

    let mut removed = 0u32;
    for sub_key in stale {
        let Ok(wide) = U16CString::from_str(&sub_key) else {
            continue;
        };
        let status = unsafe { RegDeleteTreeW(key, PCWSTR(wide.as_ptr())) };
        if status.is_ok() {
            info!(key = %sub_key, "stale sync-root registry entry removed");
            removed += 1;
        } else {
            warn!(key = %sub_key, "registry entry not removed");
        }
    }

    unsafe {
        let _ = RegCloseKey(key);
    }
    Ok(removed)
}

#[cfg(windows)]
fn restart_explorer() {
    use std::process::Command;
    use tracing::warn;

    if let Err(e) = Command::new("taskkill")
        .args(["/F", "/IM", "explorer.exe"])
        .status()
    {
        warn!(error = %e, "explorer not stopped");
        return;
    }
    if let Err(e) = Command::new("explorer.exe").spawn() {
        warn!(error = %e, "explorer not restarted");
    }
}
