/*
 * The concrete instrument types and the registry that builds a pipeline for a
 * configuration section. Each submodule declares its classifier rules, package key and
 * target layout; the generic read/transform/write machinery lives in
 * `core::instrument`.
 */
pub mod adcp;
pub mod ctd;
pub mod ferrybox;
pub mod ifcb;
pub mod ifcb_results;
pub mod mvp;

use crate::core::config::{ConfigError, InstrumentConfig, StorageTarget};
use crate::core::instrument::{
    self, InstrumentError, InstrumentPipeline, PipelineOperations, RunContext, TransformOptions,
};
use crate::core::package::Package;
use crate::core::resource::{Attributes, Resource, ResourceKind};
use crate::core::storage::{self, Storage};
use crate::core::subversion_storage::COMMIT_MESSAGE_ATTRIBUTE;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;

pub use adcp::Adcp;
pub use ctd::Ctd;
pub use ferrybox::Ferrybox;
pub use ifcb::Ifcb;
pub use ifcb_results::IfcbResults;
pub use mvp::Mvp;

/// Canonical names of the instrument types, as used for configuration sections.
pub const INSTRUMENT_NAMES: [&str; 6] = ["CTD", "MVP", "ADCP", "Ferrybox", "IFCB", "IFCBresults"];

/// Canonical spelling of an instrument name, matched case-insensitively.
pub fn resolve(name: &str) -> Option<&'static str> {
    INSTRUMENT_NAMES
        .iter()
        .copied()
        .find(|known| known.eq_ignore_ascii_case(name.trim()))
}

/*
 * What every instrument is constructed from: the configuration section resolved into a
 * source directory, an opened storage backend and the shared run collaborators.
 */
pub struct InstrumentSetup {
    pub source_directory: Arc<Path>,
    pub attributes: BTreeMap<String, String>,
    pub storage: Box<dyn Storage>,
    pub force: bool,
    pub wiski_storage: Option<Box<dyn Storage>>,
    pub context: RunContext,
}

impl InstrumentSetup {
    pub fn from_config(config: &InstrumentConfig, context: &RunContext) -> instrument::Result<Self> {
        let target = config.storage_target()?;
        let storage = storage::open_storage(&target, config.allow_force, Arc::clone(&context.events))?;
        let wiski_storage = match &config.wiski_directory {
            Some(directory) => Some(storage::open_storage(
                &StorageTarget::File {
                    root_directory: directory.clone(),
                },
                config.allow_force,
                Arc::clone(&context.events),
            )?),
            None => None,
        };
        Ok(InstrumentSetup {
            source_directory: Arc::from(config.source_directory.as_path()),
            attributes: config.attributes.clone(),
            storage,
            force: config.force,
            wiski_storage,
            context: context.clone(),
        })
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// A resource below this instrument's source directory with the given target.
    pub fn resource(
        &self,
        source_path: &Path,
        kind: ResourceKind,
        attributes: Attributes,
        target_path: Option<PathBuf>,
    ) -> instrument::Result<Resource> {
        let mut resource = Resource::new(Arc::clone(&self.source_directory), source_path, kind, attributes)?;
        match target_path {
            Some(target) => resource.set_target_path(target)?,
            None => resource.clear_target_path(),
        }
        Ok(resource)
    }
}

/// Builds the pipeline for one configuration section.
pub fn build_pipeline(
    config: &InstrumentConfig,
    context: &RunContext,
) -> instrument::Result<Box<dyn PipelineOperations>> {
    let name = resolve(&config.name).ok_or_else(|| {
        log::error!("Instruments: No instrument named '{}'.", config.name);
        InstrumentError::Config(ConfigError::UnknownInstrument(config.name.clone()))
    })?;
    log::debug!("Instruments: Building pipeline for {name}.");
    let setup = InstrumentSetup::from_config(config, context)?;
    let events = Arc::clone(&context.events);
    let pipeline: Box<dyn PipelineOperations> = match name {
        "CTD" => Box::new(InstrumentPipeline::new(Ctd::new(setup)?, events)),
        "MVP" => Box::new(InstrumentPipeline::new(Mvp::new(setup)?, events)),
        "ADCP" => Box::new(InstrumentPipeline::new(Adcp::new(setup)?, events)),
        "Ferrybox" => Box::new(InstrumentPipeline::new(Ferrybox::new(setup)?, events)),
        "IFCB" => Box::new(InstrumentPipeline::new(Ifcb::new(setup)?, events)),
        _ => Box::new(InstrumentPipeline::new(IfcbResults::new(setup)?, events)),
    };
    Ok(pipeline)
}

/// Upper-cased stem followed by the lower-cased suffix, the archive's file naming rule.
pub fn normalized_file_name(resource_stem: &str, suffix: &str) -> String {
    format!("{}{}", resource_stem.to_uppercase(), suffix.to_lowercase())
}

/// `YYYYMMDD` from the year/month/day attributes.
pub fn date_string(attributes: &Attributes) -> Option<String> {
    Some(format!(
        "{}{}{}",
        attributes.year.as_deref()?,
        attributes.month.as_deref()?,
        attributes.day.as_deref()?
    ))
}

/// Today's local date as `YYYYMMDD`, UTC when the local offset is unknown.
pub fn today_string() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    format!("{:04}{:02}{:02}", now.year(), u8::from(now.month()), now.day())
}

/*
 * Copies the run-time metadata onto every resource of a package, `comment` becoming the
 * version-control commit message.
 */
pub fn propagate_metadata(package: &mut Package, options: &TransformOptions) {
    for resource in package.resources_mut().iter_mut() {
        for (key, value) in &options.metadata {
            if value.is_empty() {
                continue;
            }
            if key == "comment" {
                resource.attributes.set(COMMIT_MESSAGE_ATTRIBUTE, value.as_str());
            } else {
                resource.attributes.set(key, value.as_str());
            }
        }
    }
}

/// Setup writing to a local directory, for instrument tests.
#[cfg(test)]
pub(crate) fn test_setup(source: &Path, target: &Path, temp: &Path) -> InstrumentSetup {
    use crate::core::events::EventBus;
    use crate::core::file_storage::FileStorage;
    use crate::core::temp_dir::TempDirectory;

    let events = Arc::new(EventBus::new());
    InstrumentSetup {
        source_directory: Arc::from(source),
        attributes: BTreeMap::new(),
        storage: Box::new(FileStorage::new(target, Arc::clone(&events)).unwrap()),
        force: false,
        wiski_storage: None,
        context: RunContext::new(events, Arc::new(TempDirectory::new(temp))),
    }
}
