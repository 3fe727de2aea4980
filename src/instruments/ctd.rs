/*
 * Sea-Bird CTD casts. Every file of a cast shares a stem naming the sensor, the cast's
 * date and time, the ship and a serial number; the suffix decides where the file lands
 * below the year directory (`raw/`, `cnv/` with an up/downcast split, or the year itself).
 */
use crate::core::classifier::{Candidate, Classifier, PatternList};
use crate::core::instrument::{Instrument, Result, TransformOptions};
use crate::core::package::Package;
use crate::core::resource::{Attributes, Resource, ResourceKind};
use crate::core::storage::Storage;
use crate::instruments::{InstrumentSetup, date_string, normalized_file_name, propagate_metadata};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const RAW_SUFFIXES: [&str; 7] = [".bl", ".btl", ".hdr", ".hex", ".ros", ".xmlcon", ".xml"];

const STEM_PATTERNS: [&str; 2] = [
    r"^(?P<prefix>u|d)?(?P<instrument>SBE\d{2})_(?P<instrument_number>\d{4})_(?P<year>\d{4})(?P<month>\d{2})(?P<day>\d{2})_(?P<hour>\d{2})(?P<minute>\d{2})_(?P<ship>\d{2}_\w{2})_(?P<serno>\d{4})$",
    r"^(?P<prefix>u)?(?P<instrument>SBE\d{2})_(?P<instrument_number>\d{4})_(?P<year>\d{4})(?P<month>\d{2})(?P<day>\d{2})_(?P<hour>\d{2})(?P<minute>\d{2})_(?P<ship>\d{2}\w{2})_(?P<cruise>\d{2})_(?P<serno>\d{4})$",
];

/// Ship codes written by older acquisition setups.
fn ship_alias(ship: &str) -> &str {
    match ship {
        "77_10" => "77SE",
        other => other,
    }
}

fn is_accepted_suffix(suffix: &str) -> bool {
    let suffix = suffix.to_lowercase();
    RAW_SUFFIXES.contains(&suffix.as_str()) || suffix == ".cnv" || suffix == ".txt"
}

pub struct Ctd {
    setup: InstrumentSetup,
    classifier: Classifier,
}

impl Ctd {
    pub const NAME: &'static str = "CTD";

    pub fn new(setup: InstrumentSetup) -> Result<Self> {
        let stems = PatternList::new(&STEM_PATTERNS)?;
        let classifier = Classifier::new().rule(ResourceKind::Raw, move |c| {
            if !is_accepted_suffix(&c.suffix) {
                return None;
            }
            let mut attributes = stems.first_match(&c.stem)?;
            if let Some(ship) = attributes.ship.take() {
                attributes.ship = Some(ship_alias(&ship).to_string());
            }
            Some(attributes)
        });
        Ok(Ctd { setup, classifier })
    }

    fn target_directory(attributes: &Attributes, suffix: &str) -> Option<PathBuf> {
        let year = Path::new(attributes.year.as_deref()?);
        let suffix = suffix.to_lowercase();
        let directory = if suffix == ".cnv" {
            match attributes.prefix.as_deref().map(str::to_lowercase).as_deref() {
                Some("u") => year.join("cnv").join("upcast"),
                Some("d") => year.join("cnv").join("downcast"),
                _ => year.join("cnv"),
            }
        } else if RAW_SUFFIXES.contains(&suffix.as_str()) {
            year.join("raw")
        } else {
            year.to_path_buf()
        };
        Some(directory)
    }

    pub fn package_key_for(attributes: &Attributes) -> Option<String> {
        Some(format!(
            "{}_{}_{}_{}{}_{}_{}_{}",
            attributes.instrument.as_deref()?,
            attributes.instrument_number.as_deref()?,
            date_string(attributes)?,
            attributes.hour.as_deref()?,
            attributes.minute.as_deref()?,
            attributes.ship.as_deref()?,
            attributes.cruise.as_deref().unwrap_or("00"),
            attributes.get("serno")?,
        ))
    }
}

impl Instrument for Ctd {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &'static str {
        "Conductivity, temperature and depth monitoring from Svea"
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
        let target = Self::target_directory(&attributes, &candidate.suffix)
            .map(|dir| dir.join(normalized_file_name(&candidate.stem, &candidate.suffix)));
        Ok(Some(self.setup.resource(source_path, kind, attributes, target)?))
    }

    fn package_key(&self, resource: &Resource) -> Result<String> {
        // Every stem pattern captures the key's fields.
        Ok(Self::package_key_for(&resource.attributes).unwrap_or_else(|| resource.stem()))
    }

    fn transform_package(&mut self, package: &mut Package, options: &TransformOptions) -> Result<()> {
        propagate_metadata(package, options);
        Ok(())
    }
}
