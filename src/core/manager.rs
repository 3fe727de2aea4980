/*
 * `SveaDataManager` drives every registered instrument pipeline through read, transform
 * and write, in registration order, publishing lifecycle events around each phase. At
 * most one pipeline per instrument type may be registered. After the write phase the
 * staging directories created during the run are removed.
 */
use crate::core::config::{ConfigError, InstrumentConfig, SveaConfig};
use crate::core::events::{Event, EventBus};
use crate::core::instrument::{
    InstrumentError, PipelineOperations, RunContext, TransformOptions,
};
use crate::core::storage::WriteReport;
use std::sync::Arc;

#[derive(Debug)]
pub enum ManagerError {
    DuplicateInstrument(String),
    NotRegistered(String),
    Instrument {
        instrument: String,
        source: InstrumentError,
    },
    Config(ConfigError),
}

impl From<ConfigError> for ManagerError {
    fn from(err: ConfigError) -> Self {
        ManagerError::Config(err)
    }
}

impl std::fmt::Display for ManagerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManagerError::DuplicateInstrument(name) => write!(
                f,
                "Exactly one instance of the same instrument can be registered. An instance of {name} is already registered"
            ),
            ManagerError::NotRegistered(name) => {
                write!(f, "Instrument {name} is not registered")
            }
            ManagerError::Instrument { instrument, source } => write!(f, "{instrument}: {source}"),
            ManagerError::Config(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ManagerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ManagerError::Instrument { source, .. } => Some(source),
            ManagerError::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl ManagerError {
    /// True for the "missing cruise information" domain error a front end reports specially.
    pub fn is_cruise_error(&self) -> bool {
        matches!(
            self,
            ManagerError::Instrument {
                source: InstrumentError::Cruise(_),
                ..
            }
        )
    }
}

pub type Result<T> = std::result::Result<T, ManagerError>;

/// Builds the pipeline for one configuration section.
pub type PipelineFactory =
    fn(&InstrumentConfig, &RunContext) -> crate::core::instrument::Result<Box<dyn PipelineOperations>>;

pub struct SveaDataManager {
    instruments: Vec<Box<dyn PipelineOperations>>,
    context: RunContext,
    clear_temp_after_write: bool,
}

impl SveaDataManager {
    pub fn new(context: RunContext) -> Self {
        SveaDataManager {
            instruments: Vec::new(),
            context,
            clear_temp_after_write: true,
        }
    }

    /*
     * Builds one pipeline per configuration section, in file order. Resolution errors
     * (unknown instrument names, missing keys, unusable storage) abort construction.
     */
    pub fn from_config(
        config: &SveaConfig,
        context: RunContext,
        factory: PipelineFactory,
    ) -> Result<Self> {
        let mut manager = SveaDataManager::new(context);
        for section in &config.instruments {
            let pipeline = factory(section, &manager.context).map_err(|e| match e {
                InstrumentError::Config(config_error) => ManagerError::Config(config_error),
                other => ManagerError::Instrument {
                    instrument: section.name.clone(),
                    source: other,
                },
            })?;
            manager.register(pipeline)?;
        }
        Ok(manager)
    }

    pub fn set_clear_temp_after_write(&mut self, clear: bool) {
        self.clear_temp_after_write = clear;
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.context.events
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    pub fn register(&mut self, pipeline: Box<dyn PipelineOperations>) -> Result<()> {
        let name = pipeline.name().to_string();
        if self.position(&name).is_some() {
            log::error!("SveaDataManager: An instance of {name} is already registered.");
            return Err(ManagerError::DuplicateInstrument(name));
        }
        self.instruments.push(pipeline);
        log::debug!("SveaDataManager: Registered {name}.");
        self.publish_log(format!("Instrument registered: {name}"));
        Ok(())
    }

    pub fn unregister(&mut self, name: &str) -> Result<Box<dyn PipelineOperations>> {
        let position = self
            .position(name)
            .ok_or_else(|| ManagerError::NotRegistered(name.to_string()))?;
        let pipeline = self.instruments.remove(position);
        self.publish_log(format!("Instrument unregistered: {}", pipeline.name()));
        Ok(pipeline)
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.instruments
            .iter()
            .position(|p| p.name().eq_ignore_ascii_case(name))
    }

    pub fn instrument(&self, name: &str) -> Option<&dyn PipelineOperations> {
        self.position(name).map(|i| self.instruments[i].as_ref())
    }

    pub fn instruments(&self) -> impl Iterator<Item = &dyn PipelineOperations> {
        self.instruments.iter().map(|p| p.as_ref())
    }

    pub fn instrument_names(&self) -> Vec<String> {
        self.instruments.iter().map(|p| p.name().to_string()).collect()
    }

    fn publish_log(&self, msg: String) {
        self.context.events.publish(Event::log(msg));
    }

    fn wrap(pipeline: &dyn PipelineOperations, source: InstrumentError) -> ManagerError {
        log::error!("SveaDataManager: {} failed: {source}", pipeline.name());
        ManagerError::Instrument {
            instrument: pipeline.name().to_string(),
            source,
        }
    }

    pub fn read_packages(&mut self) -> Result<()> {
        self.context.events.publish(Event::BeforeReadPackages);
        self.publish_log("Reading packages...".to_string());
        for pipeline in self.instruments.iter_mut() {
            pipeline
                .read_packages()
                .map_err(|e| Self::wrap(pipeline.as_ref(), e))?;
        }
        self.context.events.publish(Event::AfterReadPackages);
        Ok(())
    }

    pub fn transform_packages(&mut self, options: &TransformOptions) -> Result<()> {
        self.context.events.publish(Event::BeforeTransformPackages);
        self.publish_log("Transforming packages...".to_string());
        for pipeline in self.instruments.iter_mut() {
            pipeline
                .transform_packages(options)
                .map_err(|e| Self::wrap(pipeline.as_ref(), e))?;
        }
        self.context.events.publish(Event::AfterTransformPackages);
        Ok(())
    }

    pub fn write_packages(&mut self) -> Result<Vec<(String, Vec<WriteReport>)>> {
        self.context.events.publish(Event::BeforeWritePackages);
        self.publish_log("Writing packages...".to_string());
        let mut reports = Vec::with_capacity(self.instruments.len());
        for pipeline in self.instruments.iter_mut() {
            let written = pipeline
                .write_packages()
                .map_err(|e| Self::wrap(pipeline.as_ref(), e))?;
            reports.push((pipeline.name().to_string(), written));
        }
        if self.clear_temp_after_write {
            let removed = self.context.temp_dir.clear_staged();
            log::debug!("SveaDataManager: Cleared {removed} staging directories.");
        }
        self.context.events.publish(Event::AfterWritePackages);
        Ok(reports)
    }

    pub fn run(&mut self, options: &TransformOptions) -> Result<Vec<(String, Vec<WriteReport>)>> {
        self.publish_log("Running all".to_string());
        self.read_packages()?;
        self.transform_packages(options)?;
        self.write_packages()
    }
}
