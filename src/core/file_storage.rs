/*
 * Local filesystem backend. Targets are resolved against a fixed root directory and copied
 * byte for byte with the source modification time preserved. The backend follows a
 * partial-success model: a resource without target, or whose target already exists, is
 * skipped and reported while the remaining files of the package are still written.
 *
 * Forcing is a construction-time policy. By default `write(package, true)` is rejected with
 * `StorageError::ForceNotAllowed`; a backend built with `with_force_allowed(true)`
 * overwrites existing targets instead.
 */
use crate::core::checksum_utils;
use crate::core::events::{Event, EventBus};
use crate::core::package::Package;
use crate::core::storage::{Result, Storage, StorageError, WriteReport};
use filetime::FileTime;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct FileStorage {
    root_directory: PathBuf,
    allow_force: bool,
    events: Arc<EventBus>,
}

impl FileStorage {
    pub fn new(root_directory: impl AsRef<Path>, events: Arc<EventBus>) -> Result<Self> {
        let root_directory = root_directory.as_ref();
        if !root_directory.is_dir() {
            log::error!(
                "FileStorage: Root directory must be an existing, writeable directory: {root_directory:?}"
            );
            return Err(StorageError::InvalidRoot(root_directory.to_path_buf()));
        }
        let root_directory = fs::canonicalize(root_directory)?;
        Ok(FileStorage {
            root_directory,
            allow_force: false,
            events,
        })
    }

    pub fn with_force_allowed(mut self, allow_force: bool) -> Self {
        self.allow_force = allow_force;
        self
    }

    pub fn root_directory(&self) -> &Path {
        &self.root_directory
    }

    fn resolve(&self, target: &Path) -> PathBuf {
        self.root_directory.join(target)
    }

    fn log_existing_target(source: &Path, target: &Path) {
        match checksum_utils::files_identical(source, target) {
            Ok(true) => log::info!(
                "FileStorage: Will not write file. Target {target:?} already exists with identical content."
            ),
            Ok(false) => log::warn!(
                "FileStorage: Will not write file. Target {target:?} already exists with different content."
            ),
            Err(e) => log::warn!(
                "FileStorage: Will not write file. Target {target:?} already exists (comparison failed: {e})."
            ),
        }
    }

    fn copy_preserving_mtime(source: &Path, target: &Path) -> Result<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(source, target)?;
        let metadata = fs::metadata(source)?;
        let mtime = FileTime::from_last_modification_time(&metadata);
        filetime::set_file_mtime(target, mtime)?;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn description(&self) -> String {
        format!("file storage at {}", self.root_directory.display())
    }

    fn write(&self, package: &Package, force: bool) -> Result<WriteReport> {
        if force && !self.allow_force {
            log::error!("FileStorage: Not allowed to force writing to file storage.");
            return Err(StorageError::ForceNotAllowed);
        }
        let instrument = package.instrument();
        let mut report = WriteReport::default();

        // First pass decides what to copy; nothing is touched on disk yet.
        let mut files_to_copy: Vec<(PathBuf, PathBuf)> = Vec::new();
        let mut scheduled: HashSet<PathBuf> = HashSet::new();
        for resource in package.resources() {
            let source = resource.absolute_source_path();
            let Some(target) = resource.target_path() else {
                log::info!("FileStorage: Will not write file. No target path given for {source:?}");
                self.events.publish(Event::TargetPathNotGiven {
                    instrument: instrument.to_string(),
                    path: source.clone(),
                });
                report.skipped_no_target.push(source);
                continue;
            };
            let absolute_target = self.resolve(target);

            let collides = scheduled.contains(&absolute_target)
                || (!force && absolute_target.exists());
            if collides {
                if scheduled.contains(&absolute_target) {
                    log::warn!(
                        "FileStorage: Will not write file. Target {absolute_target:?} is claimed by another resource in package {package}."
                    );
                } else {
                    Self::log_existing_target(&source, &absolute_target);
                }
                self.events.publish(Event::TargetPathExists {
                    instrument: instrument.to_string(),
                    path: absolute_target.clone(),
                });
                report.skipped_existing.push(absolute_target);
                continue;
            }
            scheduled.insert(absolute_target.clone());
            files_to_copy.push((source, absolute_target));
        }

        let total = files_to_copy.len();
        for (nr, (source, target)) in files_to_copy.into_iter().enumerate() {
            log::debug!("FileStorage: Copying {source:?} -> {target:?}");
            Self::copy_preserving_mtime(&source, &target)?;
            self.events.publish(Event::progress(
                instrument,
                format!("Copying files from package {package} to file storage..."),
                nr + 1,
                total,
            ));
            self.events.publish(Event::FileStorageCopied {
                instrument: instrument.to_string(),
                source_path: source,
                target_path: target.clone(),
                nr_files_total: total,
                nr_files_copied: nr + 1,
            });
            report.written.push(target);
        }

        log::info!(
            "FileStorage: Package {package}: {} written, {} already present, {} without target.",
            report.written.len(),
            report.skipped_existing.len(),
            report.skipped_no_target.len()
        );
        Ok(report)
    }

    /*
     * Removes every resolved target that is a file. Directories left empty are kept.
     */
    fn delete(&self, package: &Package) -> Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        for resource in package.resources() {
            let Some(target) = resource.target_path() else {
                continue;
            };
            let absolute_target = self.resolve(target);
            if absolute_target.is_file() {
                fs::remove_file(&absolute_target)?;
                log::debug!("FileStorage: Removed {absolute_target:?}");
                removed.push(absolute_target);
            }
        }
        Ok(removed)
    }
}
