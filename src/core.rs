/*
 * Instrument-independent machinery of the data manager: resources and packages, the
 * regex classifier, the three-phase pipeline with its event bus, the storage backends
 * (plain directory tree or Subversion working copy), configuration loading, run reports
 * and the per-user directories. Concrete instruments live in `crate::instruments`.
 * End-to-end tests of the orchestrator are in `manager_tests.rs`.
 */
pub mod checksum_utils;
pub mod classifier;
pub mod config;
pub mod events;
pub mod file_storage;
pub mod instrument;
pub mod manager;
pub mod package;
pub mod path_guard;
pub mod path_utils;
pub mod report;
pub mod resource;
pub mod storage;
pub mod subversion_storage;
pub mod temp_dir;


pub use config::{InstrumentConfig, SveaConfig, parse_key_value};
pub use events::{Event, EventBus, Topic};
pub use instrument::{PipelineOperations, RunContext, TransformOptions};
pub use manager::{ManagerError, SveaDataManager};
pub use report::ReportCollector;
pub use temp_dir::TempDirectory;
