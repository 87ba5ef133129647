//! Best-effort shell refresh notifications.

use std::path::Path;

/// Tells Explorer that the contents of `directory` changed so its aggregate
/// sync glyph refreshes. Failures are irrelevant to correctness.
#[cfg(windows)]
pub fn notify_directory_changed(directory: &Path) {
    use widestring::U16CString;
    use windows::Win32::UI::Shell::{SHChangeNotify, SHCNE_UPDATEDIR, SHCNF_PATHW};

    if let Ok(wide) = U16CString::from_os_str(directory.as_os_str()) {
        unsafe {
            SHChangeNotify(
                SHCNE_UPDATEDIR,
                SHCNF_PATHW,
                Some(wide.as_ptr() as *const _),
                None,
            );
        }
    }
}

#[cfg(not(windows))]
pub fn notify_directory_changed(_directory: &Path) {}
