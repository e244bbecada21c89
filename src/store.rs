//! Served-directory file store
//!
//! Every target named on the wire is resolved under one root directory. The
//! store reports "not found" separately from other I/O failures so handlers
//! can pick the right status code.

use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tokio::fs::File;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("invalid filename {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },
    #[error("I/O error on {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    fn from_io(name: &str, e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::NotFound {
            StoreError::NotFound(name.to_string())
        } else {
            StoreError::Io {
                name: name.to_string(),
                source: e,
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Normalize a path to be safely under a root directory.
/// This prevents path traversal by:
/// 1. Rejecting empty names and NUL bytes
/// 2. Rejecting absolute paths, parent directory components, and root/prefix components
/// 3. Resolving every existing symlink along the path; dangling links are refused
/// 4. Ensuring the result is under the root
pub fn normalize_under_root(root: &Path, name: &str) -> Result<PathBuf, StoreError> {
    use Component::{CurDir, Normal, ParentDir, Prefix, RootDir};

    let invalid = |reason: &'static str| StoreError::InvalidName {
        name: name.to_string(),
        reason,
    };

    if name.is_empty() {
        return Err(invalid("empty filename"));
    }
    if name.contains('\0') {
        return Err(invalid("filename contains NUL byte"));
    }

    let mut safe = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            CurDir => {}
            Normal(s) => {
                // On Windows, reject components with ':' (ADS defense)
                #[cfg(windows)]
                if s.to_string_lossy().contains(':') {
                    return Err(invalid("path component contains colon"));
                }
                safe.push(s);
            }
            ParentDir => return Err(invalid("path contains parent component")),
            RootDir | Prefix(_) => return Err(invalid("path is absolute")),
        }
    }
    if safe.as_os_str().is_empty() {
        return Err(invalid("filename names the root"));
    }

    let canon_root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());

    // Walk the existing prefix one component at a time so every symlink is
    // resolved and checked; components past the first missing one are created
    // later as real directories/files under an already-verified ancestor.
    let mut resolved = canon_root.clone();
    let mut components = safe.components();
    for component in components.by_ref() {
        let next = resolved.join(component);
        match std::fs::symlink_metadata(&next) {
            Ok(md) if md.file_type().is_symlink() => {
                let target = match next.canonicalize() {
                    Ok(t) => t,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        return Err(invalid("dangling symlink"))
                    }
                    Err(e) => return Err(StoreError::from_io(name, e)),
                };
                if !target.starts_with(&canon_root) {
                    return Err(invalid("path escapes served root"));
                }
                resolved = target;
            }
            Ok(_) => resolved = next,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                resolved = next;
                break;
            }
            Err(e) => return Err(StoreError::from_io(name, e)),
        }
    }
    resolved.extend(components);

    if !resolved.starts_with(&canon_root) {
        return Err(invalid("path escapes served root"));
    }
    Ok(resolved)
}

/// Filesystem collaborator rooted at one directory. Cheap to clone.
#[derive(Clone, Debug)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, name: &str) -> Result<PathBuf, StoreError> {
        normalize_under_root(&self.root, name)
    }

    /// Create (or truncate) `name`, creating missing parent directories
    pub async fn create(&self, name: &str) -> Result<File, StoreError> {
        let path = self.resolve(name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::from_io(name, e))?;
        }
        File::create(&path)
            .await
            .map_err(|e| StoreError::from_io(name, e))
    }

    pub async fn open(&self, name: &str) -> Result<File, StoreError> {
        let path = self.resolve(name)?;
        File::open(&path)
            .await
            .map_err(|e| StoreError::from_io(name, e))
    }

    pub async fn read_all(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.resolve(name)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| StoreError::from_io(name, e))
    }

    /// Size in bytes of a regular file
    pub async fn stat(&self, name: &str) -> Result<u64, StoreError> {
        let path = self.resolve(name)?;
        let md = tokio::fs::metadata(&path)
            .await
            .map_err(|e| StoreError::from_io(name, e))?;
        if !md.is_file() {
            return Err(StoreError::Io {
                name: name.to_string(),
                source: io::Error::new(io::ErrorKind::Other, "not a regular file"),
            });
        }
        Ok(md.len())
    }

    pub async fn remove(&self, name: &str) -> Result<(), StoreError> {
        let path = self.resolve(name)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| StoreError::from_io(name, e))
    }
}
