//! Plain-filesystem fallback for targets without the cloud filter.
//!
//! Placeholders are stub files sized with `set_len`; hydration copies the
//! byte range back from the server copy and dehydration truncates. Shell
//! state transitions have nothing to act on and succeed silently.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
};

use super::PlaceholderState;
use crate::{
    error::{Result, SyncError},
    path::PathMap,
};

pub(super) fn create_one(
    _paths: &PathMap,
    client_abs: &Path,
    _relative: &Path,
    metadata: &fs::Metadata,
) -> Result<()> {
    if metadata.is_dir() {
        fs::create_dir_all(client_abs)?;
    } else {
        if let Some(parent) = client_abs.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(client_abs)?;
        file.set_len(metadata.len())?;
    }
    Ok(())
}

pub(super) fn mark_in_sync(_paths: &PathMap, client_abs: &Path, _relative: &Path) -> Result<()> {
    exists(client_abs)
}

pub(super) fn mark_not_in_sync(client_abs: &Path) -> Result<()> {
    exists(client_abs)
}

pub(super) fn convert(
    _paths: &PathMap,
    client_abs: &Path,
    _relative: &Path,
    dehydrate: bool,
) -> Result<()> {
    exists(client_abs)?;
    if dehydrate {
        OpenOptions::new().write(true).open(client_abs)?.set_len(0)?;
    }
    Ok(())
}

pub(super) fn hydrate(paths: &PathMap, client_abs: &Path, offset: u64, length: i64) -> Result<()> {
    let server_abs = paths.client_to_server(client_abs)?;
    let mut source = File::open(&server_abs)?;
    let mut target = OpenOptions::new().write(true).open(client_abs)?;

    source.seek(SeekFrom::Start(offset))?;
    target.seek(SeekFrom::Start(offset))?;

    let mut remaining = if length < 0 {
        u64::MAX
    } else {
        length as u64
    };
    let mut buffer = [0u8; 64 * 1024];
    while remaining > 0 {
        let want = buffer.len().min(remaining.min(buffer.len() as u64) as usize);
        let got = source.read(&mut buffer[..want])?;
        if got == 0 {
            break;
        }
        target.write_all(&buffer[..got])?;
        remaining -= got as u64;
    }
    Ok(())
}

pub(super) fn dehydrate(
    _paths: &PathMap,
    client_abs: &Path,
    _offset: u64,
    _length: i64,
) -> Result<()> {
    OpenOptions::new().write(true).open(client_abs)?.set_len(0)?;
    Ok(())
}

pub(super) fn update_identity(client_abs: &Path, _new_relative: &Path) -> Result<()> {
    exists(client_abs)
}

pub(super) fn state(client_abs: &Path) -> Result<PlaceholderState> {
    exists(client_abs)?;
    Ok(PlaceholderState::default())
}

fn exists(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Err(SyncError::NotFound(path.to_path_buf()))
        }
        Err(e) => Err(e.into()),
    }
}
