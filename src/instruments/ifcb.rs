/*
 * Imaging FlowCytobot raw data. One sample produces an `.adc`, `.hdr` and `.roi` file
 * sharing the stem `DYYYYMMDDThhmmss_IFCBn`; the stem is the package key. The transform
 * phase synthesizes a `<stem>.txt` metadata sheet from the header's GPS fields and the
 * run-time metadata, staged in the temp directory and archived next to the raw files.
 */
use crate::core::classifier::{Candidate, Classifier, PatternList};
use crate::core::events::Event;
use crate::core::instrument::{Instrument, Result, TransformOptions};
use crate::core::package::Package;
use crate::core::resource::{Attributes, Resource, ResourceKind};
use crate::core::storage::Storage;
use crate::instruments::{InstrumentSetup, date_string, normalized_file_name, today_string};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const RAW_SUFFIXES: [&str; 3] = [".adc", ".hdr", ".roi"];

const STEM_PATTERN: &str = r"^D(?P<year>\d{4})(?P<month>\d{2})(?P<day>\d{2})T(?P<hour>\d{2})(?P<minute>\d{2})(?P<second>\d{2})_IFCB(?P<instrument_number>\d*)$";

/// Position fields of an IFCB `.hdr` file. `N/A` is read as empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HdrPosition {
    pub latitude: String,
    pub longitude: String,
}

impl HdrPosition {
    /// Parses `key: value` lines, splitting on the first colon.
    pub fn parse(text: &str) -> Self {
        let mut position = HdrPosition::default();
        for line in text.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = match value.trim() {
                "N/A" => String::new(),
                other => other.to_string(),
            };
            match key.trim() {
                "gpsLatitude" => position.latitude = value,
                "gpsLongitude" => position.longitude = value,
                _ => {}
            }
        }
        position
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.parse::<f64>().is_ok() && self.longitude.parse::<f64>().is_ok()
    }
}

/// The per-sample metadata sheet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IfcbMetadata {
    pub id: String,
    pub ship: String,
    pub cruise_number: String,
    pub sampling_depth: String,
    pub latitude: String,
    pub longitude: String,
    pub quality_flag: String,
    pub classifier_version: String,
    pub comments: Vec<String>,
}

impl IfcbMetadata {
    /*
     * Header position first, run-time metadata on top. A missing or unparsable position
     * flags the sample `B` unless the caller supplied a quality flag.
     */
    pub fn build(id: &str, position: &HdrPosition, options: &TransformOptions) -> Self {
        let value = |key: &str| options.get(key).unwrap_or_default().to_string();
        let quality_flag = match options.get("quality_flag") {
            Some(flag) => flag.to_string(),
            None if !position.is_valid() => "B".to_string(),
            None => String::new(),
        };
        let cruise_number = options
            .get("cruise_number")
            .or_else(|| options.get("cruise"))
            .unwrap_or_default()
            .to_string();
        let comments = options
            .get("comment")
            .map(|comment| vec![format!("{} ({})", comment.replace('\n', " "), today_string())])
            .unwrap_or_default();
        IfcbMetadata {
            id: id.to_string(),
            ship: value("ship"),
            cruise_number,
            sampling_depth: value("sampling_depth"),
            latitude: position.latitude.clone(),
            longitude: position.longitude.clone(),
            quality_flag,
            classifier_version: value("classifier_version"),
            comments,
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.txt", self.id)
    }

    pub fn to_text(&self) -> String {
        let mut lines = vec![
            format!("id: {}", self.id),
            format!("ship: {}", self.ship),
            format!("cruise_number: {}", self.cruise_number),
            format!("sampling_depth: {}", self.sampling_depth),
            format!("latitude: {}", self.latitude),
            format!("longitude: {}", self.longitude),
            format!("quality_flag: {}", self.quality_flag),
            format!("classifier_version: {}", self.classifier_version),
        ];
        lines.extend(self.comments.iter().map(|c| format!("comment: {c}")));
        lines.join("\n")
    }
}

pub struct Ifcb {
    setup: InstrumentSetup,
    classifier: Classifier,
}

impl Ifcb {
    pub const NAME: &'static str = "IFCB";

    pub fn new(setup: InstrumentSetup) -> Result<Self> {
        let stems = PatternList::new(&[STEM_PATTERN])?;
        let classifier = Classifier::new().rule(ResourceKind::Raw, move |c| {
            if !RAW_SUFFIXES.contains(&c.suffix.to_lowercase().as_str()) {
                return None;
            }
            let mut attributes = stems.first_match(&c.stem)?;
            let number = attributes.instrument_number.clone().unwrap_or_default();
            attributes.instrument = Some(format!("IFCB{number}"));
            Some(attributes)
        });
        Ok(Ifcb { setup, classifier })
    }

    fn target_directory(attributes: &Attributes) -> Option<PathBuf> {
        let instrument = attributes.instrument.as_deref()?;
        Some(
            Path::new(instrument)
                .join("data_raw")
                .join(format!("D{}", date_string(attributes)?)),
        )
    }

    fn read_position(package: &Package) -> Result<HdrPosition> {
        let header = package
            .resources()
            .iter()
            .find(|r| r.suffix().eq_ignore_ascii_case(".hdr"));
        match header {
            Some(resource) => {
                let text = fs::read_to_string(resource.absolute_source_path())?;
                Ok(HdrPosition::parse(&text))
            }
            None => {
                log::warn!("IFCB: No hdr file in package {}", package.key());
                Ok(HdrPosition::default())
            }
        }
    }
}

impl Instrument for Ifcb {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &'static str {
        "Imaging FlowCytobot (IFCB)"
    }

    fn source_directory(&self) -> &Arc<Path> {
        &self.setup.source_directory
    }

    fn configured_attributes(&self) -> &BTreeMap<String, String> {
        &self.setup.attributes
    }

    fn storage(&self) -> &dyn Storage {
        self.setup.storage.as_ref()
    }

    fn force(&self) -> bool {
        self.setup.force
    }

    fn classify(&self, source_path: &Path) -> Result<Option<Resource>> {
        let candidate = Candidate::new(&self.setup.source_directory, source_path);
        let Some((kind, attributes)) = self.classifier.classify(&candidate) else {
            return Ok(None);
        };
        let target = Self::target_directory(&attributes)
            .map(|dir| dir.join(normalized_file_name(&candidate.stem, &candidate.suffix)));
        Ok(Some(self.setup.resource(source_path, kind, attributes, target)?))
    }

    fn package_key(&self, resource: &Resource) -> Result<String> {
        Ok(resource.stem())
    }

    fn transform_package(&mut self, package: &mut Package, options: &TransformOptions) -> Result<()> {
        let position = Self::read_position(package)?;
        let metadata = IfcbMetadata::build(package.key(), &position, options);
        let Some(attributes) = package.resources().iter().next().map(|r| r.attributes.clone())
        else {
            return Ok(());
        };

        let staging = self.setup.context.temp_dir.subdirectory(Self::NAME)?;
        let file_name = metadata.file_name();
        fs::write(staging.join(&file_name), metadata.to_text())?;
        log::debug!("IFCB: Staged metadata {file_name} for package {}", package.key());

        let target = Self::target_directory(&attributes).map(|dir| dir.join(&file_name));
        let mut resource = Resource::new(
            Arc::from(staging.as_path()),
            &file_name,
            ResourceKind::Metadata,
            attributes,
        )?;
        if let Some(target) = target {
            resource.set_target_path(target)?;
        }
        package.add_resource(resource)?;
        self.setup.context.events.publish(Event::TransformAddFile {
            instrument: Self::NAME.to_string(),
            resource: package.key().to_string(),
            name: file_name,
        });
        Ok(())
    }
}
