/*
 * The three-phase instrument pipeline. An `Instrument` implementation supplies the
 * domain hooks (classify a file, compute its package key, transform and write packages);
 * `InstrumentPipeline` wraps it with everything that is the same for every instrument:
 * enumerating source files, bucketing resources into packages, publishing progress and
 * enforcing the UNINITIALIZED -> READ -> TRANSFORMED -> WRITTEN state machine.
 *
 * The orchestrator only sees pipelines through the object-safe `PipelineOperations`
 * trait, so instruments of different concrete types can share one registry.
 */
use crate::core::config::ConfigError;
use crate::core::events::{Event, EventBus};
use crate::core::package::{Package, PackageCollection};
use crate::core::path_guard::PathError;
use crate::core::resource::{CollectionError, Resource};
use crate::core::storage::{Storage, StorageError, WriteReport};
use crate::core::temp_dir::{TempDirError, TempDirectory};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

#[derive(Debug)]
pub enum InstrumentError {
    PackagesNotExtracted(String),
    PhaseOrder {
        instrument: String,
        expected: PipelineState,
        found: PipelineState,
    },
    Collection(CollectionError),
    Path(PathError),
    Storage(StorageError),
    Config(ConfigError),
    Io(io::Error),
    Pattern(regex::Error),
    Cruise(String),
    Bundle(TempDirError),
}

impl From<CollectionError> for InstrumentError {
    fn from(err: CollectionError) -> Self {
        InstrumentError::Collection(err)
    }
}

impl From<PathError> for InstrumentError {
    fn from(err: PathError) -> Self {
        InstrumentError::Path(err)
    }
}

impl From<StorageError> for InstrumentError {
    fn from(err: StorageError) -> Self {
        InstrumentError::Storage(err)
    }
}

impl From<ConfigError> for InstrumentError {
    fn from(err: ConfigError) -> Self {
        InstrumentError::Config(err)
    }
}

impl From<io::Error> for InstrumentError {
    fn from(err: io::Error) -> Self {
        InstrumentError::Io(err)
    }
}

impl From<regex::Error> for InstrumentError {
    fn from(err: regex::Error) -> Self {
        InstrumentError::Pattern(err)
    }
}

impl From<TempDirError> for InstrumentError {
    fn from(err: TempDirError) -> Self {
        InstrumentError::Bundle(err)
    }
}

impl From<walkdir::Error> for InstrumentError {
    fn from(err: walkdir::Error) -> Self {
        InstrumentError::Io(io::Error::from(err))
    }
}

impl std::fmt::Display for InstrumentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstrumentError::PackagesNotExtracted(name) => write!(
                f,
                "Packages have not yet been extracted for {name}. Call read_packages first"
            ),
            InstrumentError::PhaseOrder {
                instrument,
                expected,
                found,
            } => write!(
                f,
                "{instrument}: phase requires state {expected:?}, but pipeline is {found:?}"
            ),
            InstrumentError::Collection(e) => write!(f, "{e}"),
            InstrumentError::Path(e) => write!(f, "{e}"),
            InstrumentError::Storage(e) => write!(f, "{e}"),
            InstrumentError::Config(e) => write!(f, "{e}"),
            InstrumentError::Io(e) => write!(f, "I/O error: {e}"),
            InstrumentError::Pattern(e) => write!(f, "Invalid classification pattern: {e}"),
            InstrumentError::Cruise(msg) => write!(f, "Missing cruise information: {msg}"),
            InstrumentError::Bundle(e) => write!(f, "Could not create bundle: {e}"),
        }
    }
}

impl std::error::Error for InstrumentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InstrumentError::Collection(e) => Some(e),
            InstrumentError::Path(e) => Some(e),
            InstrumentError::Storage(e) => Some(e),
            InstrumentError::Config(e) => Some(e),
            InstrumentError::Io(e) => Some(e),
            InstrumentError::Pattern(e) => Some(e),
            InstrumentError::Bundle(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, InstrumentError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Uninitialized,
    Read,
    Transformed,
    Written,
}

/// Collaborators shared by every instrument of a run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub events: Arc<EventBus>,
    pub temp_dir: Arc<TempDirectory>,
}

impl RunContext {
    pub fn new(events: Arc<EventBus>, temp_dir: Arc<TempDirectory>) -> Self {
        RunContext { events, temp_dir }
    }
}

/*
 * Run-time options of the transform phase. `metadata` is the free-form key/value input a
 * front end collects from its user (ship, cruise, comment, quality flag, ...).
 */
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformOptions {
    pub metadata: BTreeMap<String, String>,
}

impl TransformOptions {
    pub fn new(metadata: BTreeMap<String, String>) -> Self {
        TransformOptions { metadata }
    }

    /// `configured` overlaid with the non-empty run-time metadata.
    pub fn merged_over(&self, configured: &BTreeMap<String, String>) -> TransformOptions {
        let mut metadata = configured.clone();
        for (key, value) in &self.metadata {
            if !value.is_empty() {
                metadata.insert(key.clone(), value.clone());
            }
        }
        TransformOptions { metadata }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

/*
 * Domain hooks of one instrument type. Only classification, package keys, storage access
 * and the identity strings are required; transform defaults to a no-op and write to
 * handing every package to the bound storage backend.
 */
pub trait Instrument: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn source_directory(&self) -> &Arc<Path>;

    /// Attributes from the configuration, the base layer of the transform metadata.
    fn configured_attributes(&self) -> &BTreeMap<String, String>;

    fn storage(&self) -> &dyn Storage;

    fn force(&self) -> bool;

    /*
     * Turns a source file (relative to `source_directory`) into a resource, or `None` when
     * no classifier rule recognizes it.
     */
    fn classify(&self, source_path: &Path) -> Result<Option<Resource>>;

    fn package_key(&self, resource: &Resource) -> Result<String>;

    fn transform_packages(
        &mut self,
        packages: &mut PackageCollection,
        options: &TransformOptions,
    ) -> Result<()> {
        for package in packages.iter_mut() {
            self.transform_package(package, options)?;
        }
        Ok(())
    }

    fn transform_package(&mut self, _package: &mut Package, _options: &TransformOptions) -> Result<()> {
        Ok(())
    }

    fn write_packages(&mut self, packages: &PackageCollection) -> Result<Vec<WriteReport>> {
        packages
            .iter()
            .map(|package| self.write_package(package))
            .collect()
    }

    fn write_package(&mut self, package: &Package) -> Result<WriteReport> {
        log::info!(
            "{}: Writing package {package} to {}",
            self.name(),
            self.storage().description()
        );
        Ok(self.storage().write(package, self.force())?)
    }
}

/// Object-safe view of a pipeline, as seen by the orchestrator and front ends.
pub trait PipelineOperations: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn state(&self) -> PipelineState;
    fn read_packages(&mut self) -> Result<()>;
    fn transform_packages(&mut self, options: &TransformOptions) -> Result<()>;
    fn write_packages(&mut self) -> Result<Vec<WriteReport>>;
    fn packages(&self) -> Result<&PackageCollection>;
}

/*
 * Regular files below `root`, relative to it, visited depth-first with entries sorted by
 * file name at every level so that runs over the same tree are reproducible.
 */
pub fn list_source_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(relative) = entry.path().strip_prefix(root) {
            files.push(relative.to_path_buf());
        }
    }
    Ok(files)
}

pub struct InstrumentPipeline<I: Instrument> {
    instrument: I,
    events: Arc<EventBus>,
    packages: Option<PackageCollection>,
    state: PipelineState,
}

impl<I: Instrument> InstrumentPipeline<I> {
    pub fn new(instrument: I, events: Arc<EventBus>) -> Self {
        InstrumentPipeline {
            instrument,
            events,
            packages: None,
            state: PipelineState::Uninitialized,
        }
    }

    pub fn instrument(&self) -> &I {
        &self.instrument
    }

    fn require(&self, expected: PipelineState) -> Result<()> {
        if self.packages.is_none() {
            return Err(InstrumentError::PackagesNotExtracted(
                self.instrument.name().to_string(),
            ));
        }
        if self.state != expected {
            return Err(InstrumentError::PhaseOrder {
                instrument: self.instrument.name().to_string(),
                expected,
                found: self.state,
            });
        }
        Ok(())
    }

    fn reject(&self, path: PathBuf) {
        self.events.publish(Event::ResourceRejected {
            instrument: self.instrument.name().to_string(),
            path,
        });
    }
}

impl<I: Instrument> PipelineOperations for InstrumentPipeline<I> {
    fn name(&self) -> &str {
        self.instrument.name()
    }

    fn description(&self) -> &str {
        self.instrument.description()
    }

    fn state(&self) -> PipelineState {
        self.state
    }

    fn read_packages(&mut self) -> Result<()> {
        let name = self.instrument.name();
        let root = Arc::clone(self.instrument.source_directory());
        log::info!("{name}: Reading packages from {root:?}");
        let files = list_source_files(&root)?;
        let total = files.len();

        let mut packages = PackageCollection::new();
        for (nr, source_path) in files.iter().enumerate() {
            self.events.publish(Event::progress(
                name,
                format!("Reading file {}", source_path.display()),
                nr + 1,
                total,
            ));
            let absolute = root.join(source_path);
            let resource = match self.instrument.classify(source_path) {
                Ok(Some(resource)) => resource,
                Ok(None) => {
                    log::debug!("{name}: No pattern matches file {absolute:?}");
                    self.reject(absolute);
                    continue;
                }
                Err(e) => {
                    log::warn!("{name}: Could not classify {absolute:?}: {e}");
                    self.reject(absolute);
                    continue;
                }
            };
            let package_key = self.instrument.package_key(&resource)?;
            let resource_key = resource.key();
            packages
                .get_or_create(&package_key, name)?
                .add_resource(resource)?;
            self.events.publish(Event::ResourceAdded {
                instrument: name.to_string(),
                resource: resource_key,
                path: absolute,
            });
        }

        log::info!(
            "{name}: Read {} resources into {} packages ({} files seen).",
            packages.resource_count(),
            packages.len(),
            total
        );
        self.packages = Some(packages);
        self.state = PipelineState::Read;
        Ok(())
    }

    fn transform_packages(&mut self, options: &TransformOptions) -> Result<()> {
        self.require(PipelineState::Read)?;
        let merged = options.merged_over(self.instrument.configured_attributes());
        let Some(packages) = self.packages.as_mut() else {
            return Err(InstrumentError::PackagesNotExtracted(
                self.instrument.name().to_string(),
            ));
        };
        self.instrument.transform_packages(packages, &merged)?;
        self.state = PipelineState::Transformed;
        Ok(())
    }

    fn write_packages(&mut self) -> Result<Vec<WriteReport>> {
        self.require(PipelineState::Transformed)?;
        let Some(packages) = self.packages.as_ref() else {
            return Err(InstrumentError::PackagesNotExtracted(
                self.instrument.name().to_string(),
            ));
        };
        let reports = self.instrument.write_packages(packages)?;
        self.events.publish(Event::StopWrite {
            instrument: self.instrument.name().to_string(),
        });
        self.state = PipelineState::Written;
        Ok(reports)
    }

    fn packages(&self) -> Result<&PackageCollection> {
        self.packages
            .as_ref()
            .ok_or_else(|| InstrumentError::PackagesNotExtracted(self.instrument.name().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::Topic;
    use crate::core::file_storage::FileStorage;
    use crate::core::resource::{Attributes, ResourceKind};
    use std::fs;
    use std::sync::Mutex;
    use tempfile::{TempDir, tempdir};

    /// Groups `.dat` files by their parent directory name; everything else is rejected.
    struct DirectoryInstrument {
        source_directory: Arc<Path>,
        attributes: BTreeMap<String, String>,
        storage: FileStorage,
        seen_metadata: Arc<Mutex<Vec<BTreeMap<String, String>>>>,
    }

    impl Instrument for DirectoryInstrument {
        fn name(&self) -> &'static str {
            "Dir"
        }
        fn description(&self) -> &'static str {
            "Test instrument"
        }
        fn source_directory(&self) -> &Arc<Path> {
            &self.source_directory
        }
        fn configured_attributes(&self) -> &BTreeMap<String, String> {
            &self.attributes
        }
        fn storage(&self) -> &dyn Storage {
            &self.storage
        }
        fn force(&self) -> bool {
            false
        }
        fn classify(&self, source_path: &Path) -> Result<Option<Resource>> {
            if source_path.extension().and_then(|e| e.to_str()) != Some("dat") {
                return Ok(None);
            }
            let resource = Resource::new(
                Arc::clone(&self.source_directory),
                source_path,
                ResourceKind::Raw,
                Attributes::new(),
            )?;
            Ok(Some(resource))
        }
        fn package_key(&self, resource: &Resource) -> Result<String> {
            Ok(resource
                .source_path()
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| "root".to_string()))
        }
        fn transform_package(&mut self, _package: &mut Package, options: &TransformOptions) -> Result<()> {
            self.seen_metadata.lock().unwrap().push(options.metadata.clone());
            Ok(())
        }
    }

    struct Fixture {
        _source: TempDir,
        _target: TempDir,
        events: Arc<EventBus>,
        seen_metadata: Arc<Mutex<Vec<BTreeMap<String, String>>>>,
        pipeline: InstrumentPipeline<DirectoryInstrument>,
    }

    fn fixture() -> Fixture {
        let source = tempdir().unwrap();
        let target = tempdir().unwrap();
        for (path, content) in [
            ("b/2.dat", "2"),
            ("a/1.dat", "1"),
            ("a/0.dat", "0"),
            ("a/notes.txt", "n"),
            ("top.dat", "t"),
        ] {
            let full = source.path().join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
        }
        let events = Arc::new(EventBus::new());
        let seen_metadata = Arc::new(Mutex::new(Vec::new()));
        let mut attributes = BTreeMap::new();
        attributes.insert("ship".to_string(), "77SE".to_string());
        attributes.insert("cruise".to_string(), "01".to_string());
        let instrument = DirectoryInstrument {
            source_directory: Arc::from(source.path()),
            attributes,
            storage: FileStorage::new(target.path(), Arc::clone(&events)).unwrap(),
            seen_metadata: Arc::clone(&seen_metadata),
        };
        let pipeline = InstrumentPipeline::new(instrument, Arc::clone(&events));
        Fixture {
            _source: source,
            _target: target,
            events,
            seen_metadata,
            pipeline,
        }
    }

    #[test]
    fn test_phases_must_run_in_order() {
        let mut fx = fixture();
        assert!(matches!(
            fx.pipeline.write_packages(),
            Err(InstrumentError::PackagesNotExtracted(_))
        ));
        assert!(matches!(
            fx.pipeline.transform_packages(&TransformOptions::default()),
            Err(InstrumentError::PackagesNotExtracted(_))
        ));
        assert!(fx.pipeline.packages().is_err());

        fx.pipeline.read_packages().unwrap();
        assert!(matches!(
            fx.pipeline.write_packages(),
            Err(InstrumentError::PhaseOrder {
                expected: PipelineState::Transformed,
                found: PipelineState::Read,
                ..
            })
        ));

        fx.pipeline
            .transform_packages(&TransformOptions::default())
            .unwrap();
        let reports = fx.pipeline.write_packages().unwrap();
        assert_eq!(reports.len(), 3);
        assert_eq!(fx.pipeline.state(), PipelineState::Written);

        fx.pipeline.read_packages().unwrap();
        assert_eq!(fx.pipeline.state(), PipelineState::Read);
    }

    #[test]
    fn test_read_buckets_sorted_files_and_reports_rejections() {
        let mut fx = fixture();
        let rejected = Arc::new(Mutex::new(Vec::new()));
        let added = Arc::new(Mutex::new(Vec::new()));
        let r = Arc::clone(&rejected);
        fx.events.subscribe(Topic::OnResourceRejected, 50, move |e| {
            r.lock().unwrap().push(e.clone())
        });
        let a = Arc::clone(&added);
        fx.events.subscribe(Topic::OnResourceAdded, 50, move |e| {
            if let Event::ResourceAdded { resource, .. } = e {
                a.lock().unwrap().push(resource.clone());
            }
        });

        fx.pipeline.read_packages().unwrap();
        let packages = fx.pipeline.packages().unwrap();
        assert_eq!(packages.keys(), vec!["a", "b", "root"]);
        assert_eq!(packages.get("a").unwrap().resources().len(), 2);
        assert_eq!(rejected.lock().unwrap().len(), 1);
        assert_eq!(
            *added.lock().unwrap(),
            vec!["a/0.dat", "a/1.dat", "b/2.dat", "top.dat"]
        );
    }

    #[test]
    fn test_classification_is_deterministic() {
        let mut fx = fixture();
        fx.pipeline.read_packages().unwrap();
        let first: Vec<(String, Vec<String>)> = fx
            .pipeline
            .packages()
            .unwrap()
            .iter()
            .map(|p| (p.key().to_string(), p.resources().iter().map(Resource::key).collect()))
            .collect();
        fx.pipeline.read_packages().unwrap();
        let second: Vec<(String, Vec<String>)> = fx
            .pipeline
            .packages()
            .unwrap()
            .iter()
            .map(|p| (p.key().to_string(), p.resources().iter().map(Resource::key).collect()))
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_runtime_metadata_overrides_configured_attributes() {
        let mut fx = fixture();
        fx.pipeline.read_packages().unwrap();
        let mut metadata = BTreeMap::new();
        metadata.insert("cruise".to_string(), "07".to_string());
        metadata.insert("comment".to_string(), String::new());
        fx.pipeline
            .transform_packages(&TransformOptions::new(metadata))
            .unwrap();

        let seen = fx.seen_metadata.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].get("ship").map(String::as_str), Some("77SE"));
        assert_eq!(seen[0].get("cruise").map(String::as_str), Some("07"));
        assert!(!seen[0].contains_key("comment"));
    }

    #[test]
    fn test_write_publishes_stop_event() {
        let mut fx = fixture();
        let stopped = Arc::new(Mutex::new(0));
        let s = Arc::clone(&stopped);
        fx.events
            .subscribe(Topic::OnStopWrite, 50, move |_| *s.lock().unwrap() += 1);
        fx.pipeline.read_packages().unwrap();
        fx.pipeline
            .transform_packages(&TransformOptions::default())
            .unwrap();
        fx.pipeline.write_packages().unwrap();
        assert_eq!(*stopped.lock().unwrap(), 1);
    }

    #[test]
    fn test_missing_source_directory_fails_read() {
        let dir = tempdir().unwrap();
        assert!(list_source_files(&dir.path().join("nope")).is_err());
    }
}
