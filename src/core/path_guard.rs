/*
 * Validation of the relative paths that flow through the engine. Every resource keeps
 * its source and target paths relative to some root directory, and those paths must
 * never escape that root. This module owns that single rule so that resources, storage
 * backends and classifiers all agree on what a "safe" relative path is.
 */
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    Empty,
    Absolute(PathBuf),
    Traversal(PathBuf),
}

impl std::fmt::Display for PathError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathError::Empty => write!(f, "Path must not be empty"),
            PathError::Absolute(p) => write!(f, "Path must not be absolute: {p:?}"),
            PathError::Traversal(p) => {
                write!(f, "Path must not contain traversal segments: {p:?}")
            }
        }
    }
}

impl std::error::Error for PathError {}

pub type Result<T> = std::result::Result<T, PathError>;

/*
 * Verifies that `path` is a non-empty relative path without `..` segments and without
 * any root or drive prefix. On success the path is returned as an owned `PathBuf`;
 * `.` segments are dropped so that equal paths compare equal.
 */
pub fn verify_relative_path(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    if path.as_os_str().is_empty() {
        return Err(PathError::Empty);
    }

    // `Path::is_absolute` is platform dependent; a leading separator is treated as a
    // root marker everywhere.
    let text = path.to_string_lossy();
    if path.is_absolute() || text.starts_with('/') || text.starts_with('\\') {
        return Err(PathError::Absolute(path.to_path_buf()));
    }

    let mut verified = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => verified.push(part),
            Component::CurDir => {}
            Component::ParentDir => return Err(PathError::Traversal(path.to_path_buf())),
            Component::RootDir | Component::Prefix(_) => {
                return Err(PathError::Absolute(path.to_path_buf()));
            }
        }
    }

    if verified.as_os_str().is_empty() {
        return Err(PathError::Empty);
    }
    Ok(verified)
}

/*
 * Renders a verified relative path with forward slashes regardless of platform. Used for
 * collection identities and for version-control paths, which are always POSIX-style.
 */
pub fn to_posix_string(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
