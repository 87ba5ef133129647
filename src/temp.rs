//! Classifies filenames and attributes as editor temp/lock/backup files so
//! they never participate in sync.

use std::path::Path;

use tracing::trace;

/// Extensions that always indicate scratch or backup content.
const TEMP_EXTENSIONS: &[&str] = &[
    "tmp", "temp", "bak", "backup", "old", "swp", "swo", "swn", "lock", "lck", "asd",
];

/// System noise the shell drops into every directory.
const SYSTEM_NOISE: &[&str] = &["desktop.ini", "thumbs.db", ".ds_store", "Icon\r"];

/// Full classification: OS temporary attribute first, then name patterns,
/// then heuristics. An unreadable attribute defaults to "not temp"; syncing
/// too much beats silently dropping.
pub fn is_temporary(path: &Path) -> bool {
    if has_temporary_attribute(path) {
        trace!(path = %path.display(), "temporary attribute set");
        return true;
    }
    matches_temp_name(path, is_hidden(path))
}

/// Name-only variant for deletion events, where the entry no longer exists
/// and attributes cannot be read.
pub fn is_temporary_name(path: &Path) -> bool {
    // With the entry gone the hidden bit is unknowable; assume it was set so
    // the dotfile heuristics still apply.
    matches_temp_name(path, true)
}

fn matches_temp_name(path: &Path, hidden: bool) -> bool {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => name,
        None => return false,
    };
    let lower = name.to_lowercase();

    // Office owner lock: ~$report.docx
    if name.starts_with("~$") {
        return true;
    }
    // Word-style scratch: ~WRL0001.tmp
    if name.starts_with('~') && lower.ends_with(".tmp") {
        return true;
    }
    // LibreOffice lock: .~lock.report.odt#
    if lower.starts_with(".~lock.") && name.ends_with('#') {
        return true;
    }
    if is_blender_backup(&lower) {
        return true;
    }
    if let Some(ext) = lower.rsplit_once('.').map(|(_, ext)| ext) {
        if TEMP_EXTENSIONS.contains(&ext) {
            return true;
        }
    }
    // Generic backup: report.txt~
    if name.ends_with('~') {
        return true;
    }
    if SYSTEM_NOISE.iter().any(|noise| lower == noise.to_lowercase()) {
        return true;
    }

    // Atomic-save temp: exactly eight hex characters, no extension.
    if name.len() == 8 && !name.contains('.') && name.chars().all(|c| c.is_ascii_hexdigit()) {
        return true;
    }
    if hidden && name.starts_with('~') {
        return true;
    }
    if hidden
        && name.starts_with('.')
        && (lower.contains("~lock")
            || lower.contains(".tmp")
            || lower.contains(".temp")
            || lower.contains(".swp")
            || name.starts_with(".#"))
    {
        return true;
    }

    false
}

/// Blender numbered backups: scene.blend1 .. scene.blend32, plus the
/// in-progress save marker scene.blend@.
fn is_blender_backup(lower: &str) -> bool {
    if lower.ends_with(".blend@") {
        return true;
    }
    match lower.rfind(".blend") {
        Some(at) => {
            let suffix = &lower[at + ".blend".len()..];
            matches!(suffix.parse::<u32>(), Ok(n) if (1..=32).contains(&n))
        }
        None => false,
    }
}

#[cfg(windows)]
fn has_temporary_attribute(path: &Path) -> bool {
    use std::os::windows::fs::MetadataExt;

    use windows::Win32::Storage::FileSystem::FILE_ATTRIBUTE_TEMPORARY;

    match std::fs::metadata(path) {
        Ok(metadata) => metadata.file_attributes() & FILE_ATTRIBUTE_TEMPORARY.0 != 0,
        Err(_) => false,
    }
}

#[cfg(not(windows))]
fn has_temporary_attribute(_path: &Path) -> bool {
    false
}

#[cfg(windows)]
fn is_hidden(path: &Path) -> bool {
    use std::os::windows::fs::MetadataExt;

    use windows::Win32::Storage::FileSystem::FILE_ATTRIBUTE_HIDDEN;

    match std::fs::metadata(path) {
        Ok(metadata) => metadata.file_attributes() & FILE_ATTRIBUTE_HIDDEN.0 != 0,
        Err(_) => false,
    }
}

#[cfg(not(windows))]
fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_name(name: &str) -> bool {
        is_temporary_name(Path::new(name))
    }

    #[test]
    fn office_and_editor_locks() {
        assert!(temp_name("~$report.docx"));
        assert!(temp_name("~WRL0001.tmp"));
        assert!(temp_name(".~lock.report.odt#"));
        assert!(temp_name(".report.txt.swp"));
    }

    #[test]
    fn known_extensions_and_backups() {
        for name in [
            "a.tmp", "a.temp", "a.bak", "a.backup", "a.old", "a.swp", "a.swo", "a.swn", "a.lock",
            "a.lck", "a.asd", "notes.txt~",
        ] {
            assert!(temp_name(name), "{name} should be temp");
        }
        assert!(!temp_name("a.txt"));
    }

    #[test]
    fn blender_backups() {
        assert!(temp_name("scene.blend1"));
        assert!(temp_name("scene.blend32"));
        assert!(temp_name("scene.blend@"));
        assert!(!temp_name("scene.blend"));
        assert!(!temp_name("scene.blend33"));
        assert!(!temp_name("scene.blend0"));
    }

    #[test]
    fn system_noise() {
        assert!(temp_name("Desktop.ini"));
        assert!(temp_name("Thumbs.db"));
        assert!(temp_name(".DS_Store"));
    }

    #[test]
    fn eight_hex_atomic_save() {
        assert!(temp_name("0a1b2c3d"));
        assert!(temp_name("DEADBEEF"));
        // Not exactly eight, or carrying an extension: regular files.
        assert!(!temp_name("0a1b2c3"));
        assert!(!temp_name("0a1b2c3d4"));
        assert!(!temp_name("deadbeef.txt"));
        assert!(!temp_name("nothexok"));
    }

    #[test]
    fn dotfile_heuristics() {
        assert!(temp_name(".#merge-target"));
        assert!(temp_name(".foo~lock.bar"));
        assert!(!temp_name(".gitignore"));
    }

    #[test]
    fn missing_file_defaults_to_not_temp() {
        assert!(!is_temporary(Path::new("definitely/not/present/report.txt")));
    }
}
