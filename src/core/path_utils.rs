/*
 * Per-user directories of the application: log files, run reports and the staging area
 * for files synthesized during the transform phase. Locations come from `directories`
 * and are created on first use.
 */
use directories::{BaseDirs, ProjectDirs};
use std::fs;
use std::path::{Path, PathBuf};

pub const APP_NAME: &str = "svea_data_manager";
pub const TEMP_DIRECTORY_NAME: &str = "sdm_temp";

fn ensure_directory(path: &Path) -> Option<PathBuf> {
    if !path.exists() {
        if let Err(e) = fs::create_dir_all(path) {
            log::error!("PathUtils: Failed to create directory {path:?}: {e}");
            return None;
        }
        log::debug!("PathUtils: Created directory {path:?}");
    }
    Some(path.to_path_buf())
}

/*
 * Local (non-roaming) data directory of the application, e.g. `~/.local/share/<app>` on
 * Linux or `AppData/Local/<app>/data` on Windows. `None` when no home directory can be
 * determined or the directory cannot be created.
 */
pub fn get_app_data_local_dir(app_name: &str) -> Option<PathBuf> {
    log::trace!("PathUtils: Resolving local data dir for '{app_name}'");
    ProjectDirs::from("", "", app_name).and_then(|dirs| ensure_directory(dirs.data_local_dir()))
}

pub fn get_log_dir(app_name: &str) -> Option<PathBuf> {
    get_app_data_local_dir(app_name).and_then(|base| ensure_directory(&base.join("logs")))
}

pub fn get_report_dir(app_name: &str) -> Option<PathBuf> {
    get_app_data_local_dir(app_name).and_then(|base| ensure_directory(&base.join("reports")))
}

/// `~/sdm_temp`, the staging area shared by every instrument of a run. Not created here.
pub fn default_temp_dir() -> Option<PathBuf> {
    BaseDirs::new().map(|dirs| dirs.home_dir().join(TEMP_DIRECTORY_NAME))
}
