/*
 * The storage layer persists packages. A backend receives whole packages and decides per
 * resource whether to write, skip (no target, target already present) or, for
 * transactional backends, schedule the file in one commit. Skips are reported in the
 * returned `WriteReport` and on the event bus; only hard failures surface as errors.
 */
use crate::core::config::StorageTarget;
use crate::core::events::EventBus;
use crate::core::file_storage::FileStorage;
use crate::core::package::Package;
use crate::core::path_guard::PathError;
use crate::core::subversion_storage::{CoreSubversionClient, SubversionStorage};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug)]
pub enum StorageError {
    Io(io::Error),
    InvalidRoot(PathBuf),
    ForceNotAllowed,
    MissingExecutable(String),
    Subversion {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },
    InvalidListing(String),
    Path(PathError),
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}

impl From<PathError> for StorageError {
    fn from(err: PathError) -> Self {
        StorageError::Path(err)
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Io(e) => write!(f, "Storage I/O error: {e}"),
            StorageError::InvalidRoot(p) => write!(
                f,
                "Storage root must be an existing, writeable directory: {p:?}"
            ),
            StorageError::ForceNotAllowed => {
                write!(f, "Not allowed to force writing to this storage")
            }
            StorageError::MissingExecutable(name) => write!(
                f,
                "The {name} executable could not be found. Make sure it is installed and in your PATH"
            ),
            StorageError::Subversion {
                command,
                exit_code,
                stderr,
            } => match exit_code {
                Some(code) => write!(f, "Command {command} failed (exited with code {code}):\n{stderr}"),
                None => write!(f, "Command {command} was terminated:\n{stderr}"),
            },
            StorageError::InvalidListing(msg) => {
                write!(f, "Could not read versioned paths: {msg}")
            }
            StorageError::Path(e) => write!(f, "Invalid target path: {e}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Io(e) => Some(e),
            StorageError::Path(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/*
 * Outcome of one `Storage::write` call. `written` holds the targets that were copied or
 * committed; the skip lists hold targets (or, for `skipped_no_target`, source files) that
 * were deliberately left alone. `committed` is only ever true for transactional backends.
 */
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteReport {
    pub written: Vec<PathBuf>,
    pub skipped_existing: Vec<PathBuf>,
    pub skipped_no_target: Vec<PathBuf>,
    pub committed: bool,
}

impl WriteReport {
    pub fn nothing_written(&self) -> bool {
        self.written.is_empty()
    }

    pub fn merge(&mut self, other: WriteReport) {
        self.written.extend(other.written);
        self.skipped_existing.extend(other.skipped_existing);
        self.skipped_no_target.extend(other.skipped_no_target);
        self.committed |= other.committed;
    }
}

pub trait Storage: Send + Sync {
    fn description(&self) -> String;

    fn write(&self, package: &Package, force: bool) -> Result<WriteReport>;

    /// Removes the package's targets. Returns the removed (or scheduled) paths.
    fn delete(&self, package: &Package) -> Result<Vec<PathBuf>>;
}

/*
 * Opens the backend a configuration section asks for. `allow_force` is the section's
 * `allow_force` policy, independent of its `force` write mode; the filesystem backend
 * refuses forced writes unless it is set.
 */
pub fn open_storage(
    target: &StorageTarget,
    allow_force: bool,
    events: Arc<EventBus>,
) -> Result<Box<dyn Storage>> {
    match target {
        StorageTarget::File { root_directory } => {
            log::debug!("Storage: Opening file storage at {root_directory:?}.");
            let storage = FileStorage::new(root_directory, events)?.with_force_allowed(allow_force);
            Ok(Box::new(storage))
        }
        StorageTarget::Subversion {
            repo_url,
            username,
            password,
        } => {
            log::debug!("Storage: Opening subversion storage at {repo_url}.");
            let client =
                CoreSubversionClient::new(repo_url, username.clone(), password.clone())?;
            Ok(Box::new(SubversionStorage::new(Box::new(client), events)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_storage_for_missing_directory_fails() {
        let dir = tempdir().unwrap();
        let target = StorageTarget::File {
            root_directory: dir.path().join("does_not_exist"),
        };
        let result = open_storage(&target, false, Arc::new(EventBus::new()));
        assert!(matches!(result, Err(StorageError::InvalidRoot(_))));
    }

    #[test]
    fn test_open_storage_for_directory() {
        let dir = tempdir().unwrap();
        let target = StorageTarget::File {
            root_directory: dir.path().to_path_buf(),
        };
        let storage = open_storage(&target, false, Arc::new(EventBus::new())).unwrap();
        assert!(storage.description().starts_with("file storage"));
    }

    #[test]
    fn test_report_merge() {
        let mut first = WriteReport {
            written: vec![PathBuf::from("a")],
            ..WriteReport::default()
        };
        let second = WriteReport {
            skipped_existing: vec![PathBuf::from("b")],
            committed: true,
            ..WriteReport::default()
        };
        first.merge(second);
        assert_eq!(first.written.len(), 1);
        assert_eq!(first.skipped_existing.len(), 1);
        assert!(first.committed);
        assert!(!first.nothing_written());
    }
}
