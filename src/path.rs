use std::path::{Component, Path, PathBuf};

use crate::error::{Result, SyncError};

/// Translates between server-relative, client-relative, and absolute paths.
///
/// All comparisons are case-insensitive and honor path-separator boundaries,
/// matching the filesystem the placeholders live on.
#[derive(Debug, Clone)]
pub struct PathMap {
    server_root: PathBuf,
    client_root: PathBuf,
}

impl PathMap {
    pub fn new(server_root: impl Into<PathBuf>, client_root: impl Into<PathBuf>) -> Result<Self> {
        let server_root = server_root.into();
        let client_root = client_root.into();

        let ok = server_root.is_absolute()
            && client_root.is_absolute()
            && !contains(&server_root, &client_root)
            && !contains(&client_root, &server_root);
        if !ok {
            return Err(SyncError::BadRoots {
                server: server_root,
                client: client_root,
            });
        }

        Ok(Self {
            server_root,
            client_root,
        })
    }

    pub fn server_root(&self) -> &Path {
        &self.server_root
    }

    pub fn client_root(&self) -> &Path {
        &self.client_root
    }

    /// The tail of `abs` under the client root, without a leading separator.
    pub fn client_relative(&self, abs: &Path) -> Result<PathBuf> {
        relative_of(&self.client_root, abs).ok_or_else(|| SyncError::OutOfScope {
            path: abs.to_path_buf(),
            root: self.client_root.clone(),
        })
    }

    pub fn server_relative(&self, abs: &Path) -> Result<PathBuf> {
        relative_of(&self.server_root, abs).ok_or_else(|| SyncError::OutOfScope {
            path: abs.to_path_buf(),
            root: self.server_root.clone(),
        })
    }

    pub fn client_abs(&self, relative: &Path) -> PathBuf {
        self.client_root.join(relative)
    }

    pub fn server_abs(&self, relative: &Path) -> PathBuf {
        self.server_root.join(relative)
    }

    /// Maps an absolute client path to its server counterpart.
    pub fn client_to_server(&self, abs: &Path) -> Result<PathBuf> {
        Ok(self.server_abs(&self.client_relative(abs)?))
    }

    pub fn server_to_client(&self, abs: &Path) -> Result<PathBuf> {
        Ok(self.client_abs(&self.server_relative(abs)?))
    }
}

/// Case-insensitive prefix test on whole components only, so `C:\a\bc` is not
/// inside `C:\a\b`.
pub fn contains(root: &Path, abs: &Path) -> bool {
    relative_of(root, abs).is_some()
}

fn relative_of(root: &Path, abs: &Path) -> Option<PathBuf> {
    let mut root_components = root.components();
    let mut abs_components = abs.components();

    loop {
        match root_components.next() {
            None => {
                return Some(abs_components.as_path().to_path_buf());
            }
            Some(want) => match abs_components.next() {
                Some(got) if component_eq(&want, &got) => {}
                _ => return None,
            },
        }
    }
}

fn component_eq(a: &Component, b: &Component) -> bool {
    match (a, b) {
        (Component::Normal(a), Component::Normal(b)) => {
            a.to_string_lossy().to_lowercase() == b.to_string_lossy().to_lowercase()
        }
        (Component::Prefix(a), Component::Prefix(b)) => {
            a.as_os_str().to_string_lossy().to_lowercase()
                == b.as_os_str().to_string_lossy().to_lowercase()
        }
        (a, b) => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roots() -> (PathBuf, PathBuf) {
        if cfg!(windows) {
            ("C:\\srv\\data".into(), "C:\\Users\\u\\Nuvii".into())
        } else {
            ("/srv/data".into(), "/home/u/nuvii".into())
        }
    }

    fn map() -> PathMap {
        let (server, client) = roots();
        PathMap::new(server, client).unwrap()
    }

    #[test]
    fn relative_strips_root_and_separator() {
        let map = map();
        let abs = map.client_root().join("docs").join("a.txt");
        assert_eq!(map.client_relative(&abs).unwrap(), Path::new("docs/a.txt"));
    }

    #[test]
    fn relative_is_case_insensitive() {
        let map = map();
        let upper: PathBuf = map.client_root().to_string_lossy().to_uppercase().into();
        let abs = upper.join("a.txt");
        assert_eq!(map.client_relative(&abs).unwrap(), Path::new("a.txt"));
    }

    #[test]
    fn out_of_scope_is_rejected() {
        let map = map();
        let foreign = map.server_root().join("a.txt");
        assert!(matches!(
            map.client_relative(&foreign),
            Err(SyncError::OutOfScope { .. })
        ));
    }

    #[test]
    fn containment_honors_component_boundaries() {
        let (server, _) = roots();
        let sibling = PathBuf::from(format!("{}x", server.to_string_lossy()));
        assert!(!contains(&server, &sibling));
        assert!(contains(&server, &server.join("inner")));
    }

    #[test]
    fn nested_roots_are_rejected() {
        let (server, _) = roots();
        let nested = server.join("client");
        assert!(matches!(
            PathMap::new(server, nested),
            Err(SyncError::BadRoots { .. })
        ));
    }

    #[test]
    fn root_swap_round_trips() {
        let map = map();
        let client = map.client_root().join("x").join("y.bin");
        let server = map.client_to_server(&client).unwrap();
        assert_eq!(server, map.server_root().join("x").join("y.bin"));
        assert_eq!(map.server_to_client(&server).unwrap(), client);
    }
}
