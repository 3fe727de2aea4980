/*
 * Staging area for files synthesized during the transform phase (metadata sheets, result
 * bundles). Staged files are ordinary source files from the storage backends' point of
 * view: they are added to packages as resources whose source directory is a subdirectory
 * of the staging root. After writing, the orchestrator removes the subdirectories it
 * handed out; other entries below the root are only removed by an explicit age-based
 * `clear`.
 */
use crate::core::path_utils;
use std::fs::{self, File};
use std::io;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

#[derive(Debug)]
pub enum TempDirError {
    Io(io::Error),
    Zip(zip::result::ZipError),
    OutsideRoot { file: PathBuf, root: PathBuf },
    NoHomeDirectory,
}

impl From<io::Error> for TempDirError {
    fn from(err: io::Error) -> Self {
        TempDirError::Io(err)
    }
}

impl From<zip::result::ZipError> for TempDirError {
    fn from(err: zip::result::ZipError) -> Self {
        TempDirError::Zip(err)
    }
}

impl std::fmt::Display for TempDirError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TempDirError::Io(e) => write!(f, "Temp directory I/O error: {e}"),
            TempDirError::Zip(e) => write!(f, "Zip error: {e}"),
            TempDirError::OutsideRoot { file, root } => {
                write!(f, "File {file:?} is not located under {root:?}")
            }
            TempDirError::NoHomeDirectory => {
                write!(f, "Could not determine a home directory for the temp directory")
            }
        }
    }
}

impl std::error::Error for TempDirError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TempDirError::Io(e) => Some(e),
            TempDirError::Zip(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, TempDirError>;

#[derive(Debug, Clone)]
pub struct TempDirectory {
    root: PathBuf,
    staged: Arc<Mutex<BTreeSet<PathBuf>>>,
}

impl TempDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        TempDirectory {
            root: root.into(),
            staged: Arc::default(),
        }
    }

    /// The per-user default, `~/sdm_temp`.
    pub fn default_location() -> Result<Self> {
        path_utils::default_temp_dir()
            .map(Self::new)
            .ok_or(TempDirError::NoHomeDirectory)
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Creates the root if needed and returns it.
    pub fn ensure(&self) -> Result<PathBuf> {
        fs::create_dir_all(&self.root)?;
        Ok(self.root.clone())
    }

    fn staged(&self) -> MutexGuard<'_, BTreeSet<PathBuf>> {
        match self.staged.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// A named subdirectory of the root, created on demand and removed by `clear_staged`.
    pub fn subdirectory(&self, name: &str) -> Result<PathBuf> {
        let path = self.root.join(name);
        fs::create_dir_all(&path)?;
        self.staged().insert(path.clone());
        Ok(path)
    }

    /*
     * Removes every subdirectory handed out by `subdirectory` since the last call and
     * nothing else, so a root shared with other files keeps them. Failures are logged.
     * Returns the number of removed directories.
     */
    pub fn clear_staged(&self) -> usize {
        let staged = std::mem::take(&mut *self.staged());
        let mut removed = 0;
        for path in staged {
            if !path.exists() {
                continue;
            }
            match fs::remove_dir_all(&path) {
                Ok(()) => removed += 1,
                Err(e) => log::warn!("TempDirectory: Could not remove {path:?}: {e}"),
            }
        }
        log::debug!("TempDirectory: Removed {removed} staging directories below {:?}", self.root);
        removed
    }

    /*
     * Removes top-level entries whose modification time is not newer than
     * `now - days_old`; `clear(0)` therefore empties the directory. Entries that cannot be
     * removed (permissions, concurrent use) are logged and left in place. Returns the
     * number of removed entries.
     */
    pub fn clear(&self, days_old: u64) -> Result<usize> {
        if !self.root.exists() {
            return Ok(0);
        }
        let cutoff = SystemTime::now()
            .checked_sub(Duration::from_secs(days_old.saturating_mul(24 * 60 * 60)))
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            let modified = entry.metadata()?.modified()?;
            if modified > cutoff {
                continue;
            }
            let result = if entry.file_type()?.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => log::warn!("TempDirectory: Could not remove {path:?}: {e}"),
            }
        }
        log::debug!("TempDirectory: Removed {removed} entries from {:?}", self.root);
        Ok(removed)
    }
}

/*
 * Writes the given files into a deflate-compressed zip at `output`, each stored under its
 * path relative to `relative_to`. Paths that are not regular files are skipped.
 */
pub fn create_zip_file(files: &[PathBuf], output: &Path, relative_to: &Path) -> Result<PathBuf> {
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut zip = ZipWriter::new(File::create(output)?);
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for file in files {
        if !file.is_file() {
            log::debug!("TempDirectory: Skipping {file:?} in zip, not a file.");
            continue;
        }
        let relative = file
            .strip_prefix(relative_to)
            .map_err(|_| TempDirError::OutsideRoot {
                file: file.clone(),
                root: relative_to.to_path_buf(),
            })?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        zip.start_file(name, options)?;
        let mut source = File::open(file)?;
        io::copy(&mut source, &mut zip)?;
    }
    zip.finish()?;
    log::debug!("TempDirectory: Created zip {output:?} with {} entries.", files.len());
    Ok(output.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;

    #[test]
    fn test_clear_zero_days_removes_everything() {
        let dir = tempdir().unwrap();
        let temp = TempDirectory::new(dir.path().join("sdm_temp"));
        assert_eq!(temp.clear(0).unwrap(), 0);

        let sub = temp.subdirectory("IFCB").unwrap();
        fs::write(sub.join("a.txt"), "x").unwrap();
        fs::write(temp.path().join("b.txt"), "y").unwrap();

        // mtime must be strictly before the cutoff on coarse-grained filesystems.
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(temp.clear(0).unwrap(), 2);
        assert!(temp.path().is_dir());
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_clear_keeps_recent_entries() {
        let dir = tempdir().unwrap();
        let temp = TempDirectory::new(dir.path());
        fs::write(dir.path().join("fresh.txt"), "x").unwrap();
        let old = dir.path().join("old.txt");
        fs::write(&old, "y").unwrap();
        let ten_days_ago = filetime::FileTime::from_unix_time(
            (SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap()
                .as_secs()
                - 10 * 24 * 3600) as i64,
            0,
        );
        filetime::set_file_mtime(&old, ten_days_ago).unwrap();

        assert_eq!(temp.clear(5).unwrap(), 1);
        assert!(dir.path().join("fresh.txt").exists());
        assert!(!old.exists());
    }

    #[test]
    fn test_clear_with_huge_age_removes_nothing() {
        let dir = tempdir().unwrap();
        let temp = TempDirectory::new(dir.path());
        fs::write(dir.path().join("a.txt"), "x").unwrap();

        assert_eq!(temp.clear(u64::MAX).unwrap(), 0);
        assert_eq!(temp.clear(u64::MAX / 1000).unwrap(), 0);
        assert!(dir.path().join("a.txt").exists());
    }

    #[test]
    fn test_clear_staged_leaves_foreign_entries() {
        let dir = tempdir().unwrap();
        let temp = TempDirectory::new(dir.path());
        fs::write(dir.path().join("notes.txt"), "keep").unwrap();
        fs::create_dir_all(dir.path().join("other")).unwrap();
        let ifcb = temp.subdirectory("IFCB").unwrap();
        fs::write(ifcb.join("sheet.txt"), "x").unwrap();
        let shared = temp.clone();
        shared.subdirectory("IFCBresults").unwrap();

        assert_eq!(temp.clear_staged(), 2);
        assert!(!ifcb.exists());
        assert!(!dir.path().join("IFCBresults").exists());
        assert!(dir.path().join("notes.txt").is_file());
        assert!(dir.path().join("other").is_dir());
        assert_eq!(temp.clear_staged(), 0);
    }

    #[test]
    fn test_zip_stores_relative_names() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("results");
        fs::create_dir_all(root.join("run1")).unwrap();
        let a = root.join("run1/a.mat");
        let b = root.join("summary.mat");
        fs::write(&a, "A").unwrap();
        fs::write(&b, "B").unwrap();

        let output = dir.path().join("out/result.zip");
        create_zip_file(&[a, b, root.join("missing.mat")], &output, &root).unwrap();

        let mut archive = zip::ZipArchive::new(File::open(&output).unwrap()).unwrap();
        assert_eq!(archive.len(), 2);
        let mut content = String::new();
        archive
            .by_name("run1/a.mat")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "A");
        assert!(archive.by_name("summary.mat").is_ok());
    }

    #[test]
    fn test_zip_rejects_files_outside_root() {
        let dir = tempdir().unwrap();
        let outside = dir.path().join("x.txt");
        fs::write(&outside, "x").unwrap();
        let result = create_zip_file(&[outside], &dir.path().join("o.zip"), &dir.path().join("r"));
        assert!(matches!(result, Err(TempDirError::OutsideRoot { .. })));
    }
}
