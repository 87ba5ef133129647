//! Cloud Filter API bindings for the store operations.

use std::{
    fs::{self, OpenOptions},
    io, mem,
    os::windows::{
        fs::{MetadataExt, OpenOptionsExt},
        io::AsRawHandle,
    },
    path::Path,
    ptr,
};

use widestring::U16CString;
use windows::{
    core::PCWSTR,
    Win32::{
        Foundation::{self, ERROR_NOT_A_CLOUD_FILE, ERROR_SHARING_VIOLATION, HANDLE},
        Storage::{
            CloudFilters::{
                self, CfCloseHandle, CfConvertToPlaceholder, CfCreatePlaceholders,
                CfGetPlaceholderInfo, CfHydratePlaceholder, CfOpenFileWithOplock,
                CfSetInSyncState, CfUpdatePlaceholder, CF_FILE_RANGE, CF_FS_METADATA,
                CF_OPEN_FILE_FLAGS, CF_PLACEHOLDER_CREATE_INFO, CF_PLACEHOLDER_STANDARD_INFO,
            },
            FileSystem::{
                FILE_ATTRIBUTE_OFFLINE, FILE_ATTRIBUTE_PINNED,
                FILE_ATTRIBUTE_RECALL_ON_DATA_ACCESS, FILE_ATTRIBUTE_REPARSE_POINT,
                FILE_ATTRIBUTE_UNPINNED, FILE_BASIC_INFO, FILE_FLAG_BACKUP_SEMANTICS,
                FILE_FLAG_OPEN_REPARSE_POINT, FILE_WRITE_ATTRIBUTES,
            },
        },
    },
};

use super::{identity, PlaceholderState};
use crate::{
    error::{Result, SyncError},
    path::PathMap,
};

/// An owned `CfOpenFileWithOplock` handle, closed on drop.
struct CfHandle(HANDLE);

impl CfHandle {
    fn open(path: &Path, flags: CF_OPEN_FILE_FLAGS) -> Result<Self> {
        let wide = wide(path)?;
        let handle =
            unsafe { CfOpenFileWithOplock(PCWSTR(wide.as_ptr()), flags) }.map_err(|e| {
                if e.code() == ERROR_SHARING_VIOLATION.to_hresult() {
                    SyncError::InUse(path.to_path_buf())
                } else {
                    SyncError::Os(e)
                }
            })?;
        Ok(Self(handle))
    }
}

impl Drop for CfHandle {
    fn drop(&mut self) {
        unsafe { CfCloseHandle(self.0) }
    }
}

fn wide(path: &Path) -> Result<U16CString> {
    U16CString::from_os_str(path.as_os_str()).map_err(|_| {
        SyncError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "path contains an interior NUL",
        ))
    })
}

pub(super) fn create_one(
    _paths: &PathMap,
    client_abs: &Path,
    relative: &Path,
    metadata: &fs::Metadata,
) -> Result<()> {
    let parent = client_abs
        .parent()
        .ok_or_else(|| SyncError::NotFound(client_abs.to_path_buf()))?;
    fs::create_dir_all(parent)?;

    let file_name = client_abs
        .file_name()
        .ok_or_else(|| SyncError::NotFound(client_abs.to_path_buf()))?;
    let file_name = wide(Path::new(file_name))?;
    let blob = identity::encode(relative);

    let mut flags = CloudFilters::CF_PLACEHOLDER_CREATE_FLAG_MARK_IN_SYNC;
    if metadata.is_dir() {
        // Children are populated eagerly; the filter must never ask for them.
        flags |= CloudFilters::CF_PLACEHOLDER_CREATE_FLAG_DISABLE_ON_DEMAND_POPULATION;
    }

    let mut info = CF_PLACEHOLDER_CREATE_INFO {
        RelativeFileName: PCWSTR(file_name.as_ptr()),
        FsMetadata: CF_FS_METADATA {
            BasicInfo: FILE_BASIC_INFO {
                CreationTime: metadata.creation_time() as i64,
                LastAccessTime: metadata.last_access_time() as i64,
                LastWriteTime: metadata.last_write_time() as i64,
                ChangeTime: metadata.last_write_time() as i64,
                FileAttributes: metadata.file_attributes(),
            },
            FileSize: metadata.file_size() as i64,
        },
        FileIdentity: blob.as_ptr() as *const _,
        FileIdentityLength: blob.len() as u32,
        Flags: flags,
        Result: Foundation::S_OK,
        ..Default::default()
    };

    unsafe {
        CfCreatePlaceholders(
            parent.as_os_str(),
            &mut info as *mut _,
            1,
            CloudFilters::CF_CREATE_FLAG_NONE,
            ptr::null_mut(),
        )
    }?;
    info.Result.ok()?;
    Ok(())
}

pub(super) fn mark_in_sync(_paths: &PathMap, client_abs: &Path, relative: &Path) -> Result<()> {
    let handle = CfHandle::open(client_abs, CloudFilters::CF_OPEN_FILE_FLAG_WRITE_ACCESS)?;
    match standard_info(&handle)? {
        Some(_) => unsafe {
            CfSetInSyncState(
                handle.0,
                CloudFilters::CF_IN_SYNC_STATE_IN_SYNC,
                CloudFilters::CF_SET_IN_SYNC_FLAG_NONE,
                None,
            )
        }?,
        // A file the user just created: convert in place, keeping content.
        None => {
            let blob = identity::encode(relative);
            unsafe {
                CfConvertToPlaceholder(
                    handle.0,
                    Some(blob.as_ptr() as *const _),
                    blob.len() as u32,
                    CloudFilters::CF_CONVERT_FLAG_MARK_IN_SYNC,
                    None,
                    None,
                )
            }?;
        }
    }
    Ok(())
}

pub(super) fn mark_not_in_sync(client_abs: &Path) -> Result<()> {
    // Attribute-write access plus reparse-point semantics: the open must not
    // hydrate the file just to flip its glyph.
    let file = OpenOptions::new()
        .access_mode(FILE_WRITE_ATTRIBUTES.0)
        .custom_flags((FILE_FLAG_OPEN_REPARSE_POINT | FILE_FLAG_BACKUP_SEMANTICS).0)
        .open(client_abs)?;
    unsafe {
        CfSetInSyncState(
            HANDLE(file.as_raw_handle() as _),
            CloudFilters::CF_IN_SYNC_STATE_NOT_IN_SYNC,
            CloudFilters::CF_SET_IN_SYNC_FLAG_NONE,
            None,
        )
    }?;
    Ok(())
}

pub(super) fn convert(
    _paths: &PathMap,
    client_abs: &Path,
    relative: &Path,
    dehydrate: bool,
) -> Result<()> {
    let handle = CfHandle::open(
        client_abs,
        CloudFilters::CF_OPEN_FILE_FLAG_WRITE_ACCESS | CloudFilters::CF_OPEN_FILE_FLAG_EXCLUSIVE,
    )?;
    let blob = identity::encode(relative);

    let mut flags = CloudFilters::CF_CONVERT_FLAG_MARK_IN_SYNC;
    if dehydrate {
        flags |= CloudFilters::CF_CONVERT_FLAG_DEHYDRATE;
    }
    unsafe {
        CfConvertToPlaceholder(
            handle.0,
            Some(blob.as_ptr() as *const _),
            blob.len() as u32,
            flags,
            None,
            None,
        )
    }?;
    Ok(())
}

pub(super) fn hydrate(_paths: &PathMap, client_abs: &Path, offset: u64, length: i64) -> Result<()> {
    let handle = CfHandle::open(client_abs, CloudFilters::CF_OPEN_FILE_FLAG_NONE)?;
    unsafe {
        CfHydratePlaceholder(
            handle.0,
            offset as i64,
            length,
            CloudFilters::CF_HYDRATE_FLAG_NONE,
            None,
        )
    }?;
    Ok(())
}

pub(super) fn dehydrate(
    _paths: &PathMap,
    client_abs: &Path,
    offset: u64,
    length: i64,
) -> Result<()> {
    let handle = CfHandle::open(
        client_abs,
        CloudFilters::CF_OPEN_FILE_FLAG_WRITE_ACCESS | CloudFilters::CF_OPEN_FILE_FLAG_EXCLUSIVE,
    )?;

    if length < 0 {
        unsafe {
            CfUpdatePlaceholder(
                handle.0,
                None,
                None,
                0,
                None,
                CloudFilters::CF_UPDATE_FLAG_DEHYDRATE,
                None,
                None,
            )
        }?;
    } else {
        let ranges = [CF_FILE_RANGE {
            StartingOffset: offset as i64,
            Length: length,
        }];
        unsafe {
            CfUpdatePlaceholder(
                handle.0,
                None,
                None,
                0,
                Some(&ranges),
                CloudFilters::CF_UPDATE_FLAG_NONE,
                None,
                None,
            )
        }?;
    }
    Ok(())
}

pub(super) fn update_identity(client_abs: &Path, new_relative: &Path) -> Result<()> {
    let handle = CfHandle::open(client_abs, CloudFilters::CF_OPEN_FILE_FLAG_WRITE_ACCESS)?;
    let blob = identity::encode(new_relative);
    unsafe {
        CfUpdatePlaceholder(
            handle.0,
            None,
            Some(blob.as_ptr() as *const _),
            blob.len() as u32,
            None,
            CloudFilters::CF_UPDATE_FLAG_NONE,
            None,
            None,
        )
    }?;
    Ok(())
}

pub(super) fn state(client_abs: &Path) -> Result<PlaceholderState> {
    let metadata = match fs::metadata(client_abs) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(SyncError::NotFound(client_abs.to_path_buf()))
        }
        other => other?,
    };
    let attrs = metadata.file_attributes();

    let mut state = PlaceholderState {
        is_offline: attrs & FILE_ATTRIBUTE_OFFLINE.0 != 0,
        is_pinned: attrs & FILE_ATTRIBUTE_PINNED.0 != 0,
        is_unpinned: attrs & FILE_ATTRIBUTE_UNPINNED.0 != 0,
        ..Default::default()
    };
    if attrs & FILE_ATTRIBUTE_REPARSE_POINT.0 == 0 {
        return Ok(state);
    }

    let handle = CfHandle::open(client_abs, CloudFilters::CF_OPEN_FILE_FLAG_NONE)?;
    if let Some(info) = standard_info(&handle)? {
        state.is_placeholder = true;
        state.is_in_sync = info.InSyncState == CloudFilters::CF_IN_SYNC_STATE_IN_SYNC;
        state.is_partial = (info.OnDiskDataSize as u64) < metadata.file_size();
        state.is_pinned |= info.PinState == CloudFilters::CF_PIN_STATE_PINNED;
        state.is_unpinned |= info.PinState == CloudFilters::CF_PIN_STATE_UNPINNED;
        if !state.is_offline {
            state.is_offline = info.OnDiskDataSize == 0
                && metadata.file_size() > 0
                && attrs & FILE_ATTRIBUTE_RECALL_ON_DATA_ACCESS.0 != 0;
        }
    }
    Ok(state)
}

fn standard_info(handle: &CfHandle) -> Result<Option<CF_PLACEHOLDER_STANDARD_INFO>> {
    // Generous room for the identity blob trailing the fixed struct.
    let mut data = vec![0u8; mem::size_of::<CF_PLACEHOLDER_STANDARD_INFO>() + 4096];

    let result = unsafe {
        CfGetPlaceholderInfo(
            handle.0,
            CloudFilters::CF_PLACEHOLDER_INFO_STANDARD,
            data.as_mut_ptr() as *mut _,
            data.len() as u32,
            None,
        )
    };

    match result {
        Ok(()) => {
            let info =
                unsafe { (data.as_ptr() as *const CF_PLACEHOLDER_STANDARD_INFO).read_unaligned() };
            Ok(Some(info))
        }
        Err(e) if e.code() == ERROR_NOT_A_CLOUD_FILE.to_hresult() => Ok(None),
        Err(e) => Err(e.into()),
    }
}
