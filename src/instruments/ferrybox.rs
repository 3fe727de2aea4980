/*
 * Ferrybox underway data. Raw sensor logs are packaged per day and mirrored below the
 * year directory. Processed products (CO2 series, wiski exports) cover a date range and
 * are packaged by the date of the run that archives them; wiski exports may be routed to a
 * separate directory.
 */
use crate::core::classifier::{Candidate, Classifier, PatternList};
use crate::core::instrument::{Instrument, Result};
use crate::core::package::Package;
use crate::core::resource::{Attributes, Resource, ResourceKind};
use crate::core::storage::{Storage, WriteReport};
use crate::instruments::{InstrumentSetup, today_string};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const RAW_PATTERNS: [&str; 4] = [
    // All_sensors (root)
    r"^(?P<prefix>.+)_(?P<year>\d{4})-(?P<month>\d{2})-(?P<day>\d{2})(?P<suffix>\D*)?$",
    // All_sensors (toFTP)
    r"^(?P<prefix>.+)_(?P<year>\d{4})-(?P<month>\d{2})-(?P<day>\d{2})_(?P<hour>\d{2})-(?P<minute>\d{2})$",
    // CO2FT
    r"^(?P<prefix>.+) (?P<year>\d{4})(?P<month>\d{2})(?P<day>\d{2}) (?P<hour>\d{2})(?P<minute>\d{2})(?P<second>\d{2})$",
    // GPS etc.
    r"^(?P<prefix>.+)_(?P<year>\d{4})(?P<month>\d{2})(?P<day>\d{2})$",
];

const WISKI_PATTERN: &str = r"^(?P<from_year>\d{4})-(?P<from_month>\d{2})-(?P<from_day>\d{2})_(?P<to_year>\d{4})-(?P<to_month>\d{2})-(?P<to_day>\d{2})_wiski$";

const CO2_PATTERN: &str = r"^(?P<from_year>\d{4})-(?P<from_month>\d{2})-(?P<from_day>\d{2})_(?P<to_year>\d{4})-(?P<to_month>\d{2})-(?P<to_day>\d{2})_(?P<name>.+)$";

const EXCLUDED_DIRECTORIES: [&str; 2] = ["toFTP", "FTP_temp"];
const DEVICE_DIRECTORIES: [&str; 2] = ["CO2FT_A", "HydroFIA_pH_A"];

pub const WISKI_KEY_SUFFIX: &str = "_wiski";

fn in_raw_tree(candidate: &Candidate<'_>) -> bool {
    candidate.full_path.to_uppercase().contains("FERRYBOX")
        && !candidate
            .parent_parts()
            .iter()
            .any(|part| EXCLUDED_DIRECTORIES.contains(&part.as_str()))
}

pub struct Ferrybox {
    setup: InstrumentSetup,
    classifier: Classifier,
    run_date: String,
}

impl Ferrybox {
    pub const NAME: &'static str = "Ferrybox";

    pub fn new(setup: InstrumentSetup) -> Result<Self> {
        let raw = PatternList::new(&RAW_PATTERNS)?;
        let wiski = PatternList::new(&[WISKI_PATTERN])?;
        let co2 = PatternList::new(&[CO2_PATTERN])?;
        // A date-range stem must not pass as a raw log with a date prefix.
        let date_prefix = Regex::new(r"^\d{4}-\d{2}-\d{2}$")?;
        let classifier = Classifier::new()
            .rule(ResourceKind::Raw, move |c| {
                if !in_raw_tree(c) {
                    return None;
                }
                let attributes = raw.first_match(&c.stem)?;
                match attributes.prefix.as_deref() {
                    Some(prefix) if date_prefix.is_match(prefix) => None,
                    _ => Some(attributes),
                }
            })
            .rule(ResourceKind::Export, move |c| wiski.first_match(&c.stem))
            .rule(ResourceKind::Processed, move |c| co2.first_match(&c.stem));
        Ok(Ferrybox {
            setup,
            classifier,
            run_date: today_string(),
        })
    }

    /// Fixes the date processed packages are keyed by.
    pub fn with_run_date(mut self, run_date: impl Into<String>) -> Self {
        self.run_date = run_date.into();
        self
    }

    fn raw_target(candidate: &Candidate<'_>, attributes: &Attributes) -> Option<PathBuf> {
        let year = Path::new(attributes.year.as_deref()?);
        let prefix = attributes.prefix.as_deref().unwrap_or_default();
        if prefix.starts_with("All_sensors") {
            return Some(year.join("AllSensors").join(&candidate.file_name));
        }
        if prefix.starts_with("Watersampler") {
            return Some(year.join("Watersampler").join(&candidate.file_name));
        }
        let mut parts: Vec<String> = candidate.parent_parts();
        if let Some(working) = parts.iter().position(|p| p == "Working") {
            parts.drain(..=working);
        }
        parts.push(candidate.file_name.clone());
        let needs_device_directory = parts
            .iter()
            .any(|p| DEVICE_DIRECTORIES.contains(&p.as_str()))
            && !parts.iter().any(|p| p == "DeviceData");
        let mut target = year.to_path_buf();
        if needs_device_directory {
            target.push("DeviceData");
        }
        target.extend(parts);
        Some(target)
    }

    fn processed_key(&self, kind: ResourceKind) -> String {
        match kind {
            ResourceKind::Export => format!("{}{WISKI_KEY_SUFFIX}", self.run_date),
            _ => self.run_date.clone(),
        }
    }

    fn processed_target(&self, candidate: &Candidate<'_>, kind: ResourceKind, attributes: &Attributes) -> Option<PathBuf> {
        Some(
            Path::new(attributes.get("from_year")?)
                .join(self.processed_key(kind))
                .join(&candidate.file_name),
        )
    }
}

impl Instrument for Ferrybox {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &'static str {
        "Ferrybox monitoring from Svea"
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
        let target = match kind {
            ResourceKind::Raw => Self::raw_target(&candidate, &attributes),
            _ => self.processed_target(&candidate, kind, &attributes),
        };
        Ok(Some(self.setup.resource(source_path, kind, attributes, target)?))
    }

    fn package_key(&self, resource: &Resource) -> Result<String> {
        if resource.kind() != ResourceKind::Raw {
            return Ok(self.processed_key(resource.kind()));
        }
        let a = &resource.attributes;
        let key = match (&a.year, &a.month, &a.day) {
            (Some(year), Some(month), Some(day)) => format!("{year}-{month}-{day}"),
            _ => resource.stem(),
        };
        Ok(key)
    }

    fn write_package(&mut self, package: &Package) -> Result<WriteReport> {
        let is_wiski = package.key().to_lowercase().contains("wiski");
        match (&self.setup.wiski_storage, is_wiski) {
            (Some(wiski), true) => {
                log::info!(
                    "Ferrybox: Writing package {package} to wiski {}",
                    wiski.description()
                );
                Ok(wiski.write(package, self.setup.force)?)
            }
            _ => {
                log::info!(
                    "Ferrybox: Writing package {package} to {}",
                    self.setup.storage.description()
                );
                Ok(self.setup.storage.write(package, self.setup.force)?)
            }
        }
    }
}
