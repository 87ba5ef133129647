//! Creation, mutation, and destruction of cloud-file placeholders under the
//! client root.
//!
//! Every operation opens its own short-lived handle and reports a typed
//! error for the caller to retry; durable placeholder state lives in the
//! filter's own metadata, not here. On non-Windows targets the cloud-filter
//! calls degrade to plain filesystem operations (with a small in-memory
//! stand-in for the metadata) so the engine above stays exercisable.

use std::{
    collections::VecDeque,
    fs, io,
    path::Path,
};

use tracing::debug;

use crate::{
    error::{Result, SyncError},
    path::PathMap,
};

#[cfg(windows)]
#[path = "windows.rs"]
mod sys;

#[cfg(not(windows))]
#[path = "portable.rs"]
mod sys;

/// Whole-file sentinel for [`PlaceholderStore::hydrate`] and
/// [`PlaceholderStore::dehydrate`] lengths.
pub const WHOLE_FILE: i64 = -1;

/// The file identity stored inside every placeholder: the UTF-16 encoding of
/// the server-relative path with a trailing NUL. The filter hands these bytes
/// back on every hydration callback.
pub mod identity {
    use std::path::{Path, PathBuf};

    pub fn encode(relative: &Path) -> Vec<u8> {
        let mut bytes = Vec::with_capacity((relative.as_os_str().len() + 1) * 2);
        for unit in relative.to_string_lossy().encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Option<PathBuf> {
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .take_while(|&unit| unit != 0)
            .collect();
        if units.is_empty() {
            return None;
        }
        String::from_utf16(&units).ok().map(PathBuf::from)
    }
}

/// The shell-visible state vector of one entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaceholderState {
    pub is_placeholder: bool,
    pub is_in_sync: bool,
    pub is_partial: bool,
    pub is_offline: bool,
    pub is_pinned: bool,
    pub is_unpinned: bool,
}

impl PlaceholderState {
    /// True for entries that could only have been produced by server-side
    /// population, never by a user edit: dehydrated placeholders, or in-sync
    /// placeholders that are still partial.
    pub fn placeholder_only(&self) -> bool {
        self.is_placeholder && (self.is_offline || (self.is_in_sync && self.is_partial))
    }
}

#[derive(Debug)]
pub struct PlaceholderStore {
    paths: PathMap,
    /// Dehydrated entries on targets without the cloud filter, which would
    /// otherwise persist this in placeholder metadata. Keyed case-insensitively.
    #[cfg(not(windows))]
    stubs: std::sync::Mutex<std::collections::HashSet<String>>,
}

impl PlaceholderStore {
    pub fn new(paths: PathMap) -> Self {
        Self {
            paths,
            #[cfg(not(windows))]
            stubs: std::sync::Mutex::new(std::collections::HashSet::new()),
        }
    }

    pub fn paths(&self) -> &PathMap {
        &self.paths
    }

    /// Creates the placeholder for `server_abs` at `client_abs`, mirroring
    /// size, timestamps, and attributes. Directory placeholders are created
    /// with on-demand population disabled and their children are then
    /// populated eagerly. Creating an entry that already exists is a no-op.
    pub fn create_single(&self, server_abs: &Path, client_abs: &Path) -> Result<()> {
        let relative = self.paths.server_relative(server_abs)?;
        let metadata = fs::metadata(server_abs)
            .map_err(|e| not_found_or_io(e, server_abs))?;

        if !client_abs.exists() {
            sys::create_one(&self.paths, client_abs, &relative, &metadata)?;
            #[cfg(not(windows))]
            if !metadata.is_dir() {
                self.note_stub(client_abs);
            }
            debug!(relative = %relative.display(), "created placeholder");
        }
        if metadata.is_dir() {
            self.create_tree(&relative)?;
        }
        Ok(())
    }

    /// Breadth-first placeholder creation for everything under
    /// `relative_subdir` on the server. Used for initial population.
    pub fn create_tree(&self, relative_subdir: &Path) -> Result<()> {
        let mut queue = VecDeque::new();
        queue.push_back(relative_subdir.to_path_buf());

        while let Some(dir) = queue.pop_front() {
            let server_dir = self.paths.server_abs(&dir);
            for entry in fs::read_dir(&server_dir)? {
                let entry = entry?;
                let metadata = entry.metadata()?;
                let relative = dir.join(entry.file_name());
                let client_abs = self.paths.client_abs(&relative);

                if !client_abs.exists() {
                    sys::create_one(&self.paths, &client_abs, &relative, &metadata)?;
                    #[cfg(not(windows))]
                    if !metadata.is_dir() {
                        self.note_stub(&client_abs);
                    }
                }
                if metadata.is_dir() {
                    queue.push_back(relative);
                }
            }
        }
        Ok(())
    }

    /// Removes the entry; recursive for directories. Absent entries are fine.
    pub fn delete(&self, client_abs: &Path) -> Result<()> {
        #[cfg(not(windows))]
        self.forget_stub(client_abs);
        match fs::metadata(client_abs) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
            Ok(metadata) if metadata.is_dir() => Ok(fs::remove_dir_all(client_abs)?),
            Ok(_) => Ok(fs::remove_file(client_abs)?),
        }
    }

    /// Moves the entry, creating the destination parent first.
    ///
    /// This only moves bytes on disk. Per the identity contract, a rename
    /// must be followed by [`PlaceholderStore::update_identity`] before the
    /// next in-sync transition, or later hydrations will chase the old
    /// server path.
    pub fn rename(&self, old_client_abs: &Path, new_client_abs: &Path) -> Result<()> {
        if !old_client_abs.exists() {
            return Err(SyncError::NotFound(old_client_abs.to_path_buf()));
        }
        if new_client_abs.exists() {
            return Err(SyncError::Collision(new_client_abs.to_path_buf()));
        }
        if let Some(parent) = new_client_abs.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(old_client_abs, new_client_abs)?;
        #[cfg(not(windows))]
        self.move_stub(old_client_abs, new_client_abs);
        Ok(())
    }

    /// Marks the entry in sync. A regular file that is not yet a placeholder
    /// is converted first, with an identity built from its current relative
    /// path.
    pub fn mark_in_sync(&self, client_abs: &Path) -> Result<()> {
        let relative = self.paths.client_relative(client_abs)?;
        sys::mark_in_sync(&self.paths, client_abs, &relative)
    }

    /// Shows the sync-pending glyph. Opens with attribute-write access and
    /// reparse-point semantics so the read itself cannot trigger hydration.
    pub fn mark_not_in_sync(&self, client_abs: &Path) -> Result<()> {
        sys::mark_not_in_sync(client_abs)
    }

    /// Converts a regular file into an in-sync placeholder, preserving its
    /// content.
    pub fn convert_to_placeholder(&self, client_abs: &Path, identity_relative: &Path) -> Result<()> {
        sys::convert(&self.paths, client_abs, identity_relative, false)
    }

    /// Converts and releases the cached content in a single call. Used for
    /// "free up space" on files the engine has not uploaded as placeholders
    /// yet.
    pub fn convert_and_dehydrate(&self, client_abs: &Path, identity_relative: &Path) -> Result<()> {
        sys::convert(&self.paths, client_abs, identity_relative, true)?;
        #[cfg(not(windows))]
        self.note_stub(client_abs);
        Ok(())
    }

    /// Ensures `[offset, offset + length)` is present on disk.
    /// `length == WHOLE_FILE` hydrates to end of file.
    pub fn hydrate(&self, client_abs: &Path, offset: u64, length: i64) -> Result<()> {
        sys::hydrate(&self.paths, client_abs, offset, length)?;
        #[cfg(not(windows))]
        if offset == 0 && length == WHOLE_FILE {
            self.forget_stub(client_abs);
        }
        Ok(())
    }

    /// Releases the on-disk data for the range; `WHOLE_FILE` drops all of it.
    pub fn dehydrate(&self, client_abs: &Path, offset: u64, length: i64) -> Result<()> {
        sys::dehydrate(&self.paths, client_abs, offset, length)?;
        #[cfg(not(windows))]
        self.note_stub(client_abs);
        Ok(())
    }

    /// Rewrites the stored identity after a move so future hydration
    /// callbacks carry the new server-relative path.
    pub fn update_identity(&self, client_abs: &Path, new_relative: &Path) -> Result<()> {
        sys::update_identity(client_abs, new_relative)
    }

    /// Reads the current state vector for the entry.
    pub fn state(&self, client_abs: &Path) -> Result<PlaceholderState> {
        #[allow(unused_mut)]
        let mut state = sys::state(client_abs)?;
        #[cfg(not(windows))]
        if self.is_stub(client_abs) {
            state.is_placeholder = true;
            state.is_offline = true;
        }
        Ok(state)
    }

    #[cfg(not(windows))]
    fn note_stub(&self, client_abs: &Path) {
        self.stubs.lock().unwrap().insert(stub_key(client_abs));
    }

    #[cfg(not(windows))]
    fn forget_stub(&self, client_abs: &Path) {
        self.stubs.lock().unwrap().remove(&stub_key(client_abs));
    }

    #[cfg(not(windows))]
    fn move_stub(&self, old: &Path, new: &Path) {
        let mut stubs = self.stubs.lock().unwrap();
        if stubs.remove(&stub_key(old)) {
            stubs.insert(stub_key(new));
        }
    }

    #[cfg(not(windows))]
    fn is_stub(&self, client_abs: &Path) -> bool {
        self.stubs.lock().unwrap().contains(&stub_key(client_abs))
    }
}

#[cfg(not(windows))]
fn stub_key(path: &Path) -> String {
    path.to_string_lossy().to_lowercase()
}

fn not_found_or_io(e: io::Error, path: &Path) -> SyncError {
    if e.kind() == io::ErrorKind::NotFound {
        SyncError::NotFound(path.to_path_buf())
    } else {
        e.into()
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::identity;

    #[test]
    fn identity_round_trips() {
        let relative = Path::new("docs/Ünïcode name.txt");
        let bytes = identity::encode(relative);
        // UTF-16 code units plus the trailing NUL.
        assert_eq!(bytes.len() % 2, 0);
        assert_eq!(&bytes[bytes.len() - 2..], &[0, 0]);
        assert_eq!(identity::decode(&bytes).unwrap(), relative);
    }

    #[test]
    fn empty_identity_decodes_to_none() {
        assert_eq!(identity::decode(&[]), None);
        assert_eq!(identity::decode(&[0, 0]), None);
    }
}
