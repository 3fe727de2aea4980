/*
 * Acoustic Doppler current profiler data from Svea. Packages are cruise legs keyed
 * `{instrument}_{ship}_{year}_{cruise}`. Raw file names do not always carry the cruise, so
 * the transform phase derives it from the leg's start date (a `cruise_info` file or the
 * acquisition `.LOG`) and rekeys the package. Readme files form a package of their own
 * that is copied into every cruise leg when writing.
 */
use crate::core::classifier::{Candidate, Classifier, PatternList};
use crate::core::instrument::{Instrument, InstrumentError, Result, TransformOptions};
use crate::core::package::{Package, PackageCollection};
use crate::core::resource::{Attributes, Resource, ResourceKind};
use crate::core::storage::{Storage, WriteReport};
use crate::instruments::InstrumentSetup;
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{Date, Month};

pub const README_PACKAGE_KEY: &str = "readme";

const UNKNOWN_SHIP: &str = "unknown";
const UNKNOWN_CRUISE: &str = "00";

const PROCESSED_PATTERNS: [&str; 2] = [
    r"(?P<instrument>ADCP\w+)_(?P<ship>\d{2}\D{2})_(?P<year>\d{4})_(?P<cruise>\d{2})_processed",
    r"(?P<instrument>ADCP\w+)_(?P<ship>\d{2}\D{2})_(?P<year>\d{4})_(?P<cruise>\d{2})_utdata",
];

const RAW_PATTERNS: [&str; 4] = [
    // ADCPOS150_77SE_2022_01_000_00000
    r"^(?P<instrument>ADCP\w+)_(?P<ship>\d{2}\D{2})_(?P<year>\d{4})_(?P<cruise>\d{2})_(?P<counter>.+)_(?P<nr>.+)$",
    r"^(?P<instrument>ADCP\w+)_(?P<ship>\d{2}\D{2})_(?P<year>\d{4})_(?P<cruise>\d{2})_(?P<nr>.+)$",
    // OS150_SMHI_JAN_2022_ADCP001__029_000000
    r"^(?P<instrument>\w+)_SMHI_(?P<month_string>\D+)_(?P<year>\d{4})_(?P<nr>.+)$",
    // ADCPOS150_SMHI_Aug2022_013003_000000
    r"^(?P<instrument>\w+)_SMHI_(?P<month_string>\D+)(?P<year>\d{4})_(?P<nr>.+)$",
];

const PROCESSED_SUB_DIRECTORIES: [&str; 2] = ["BB", "NB"];

fn instrument_alias(instrument: &str) -> &str {
    match instrument {
        "ADCPWHM600" | "WH600" | "WHM600" => "ADCPWH600",
        "OS150" => "ADCPOS150",
        other => other,
    }
}

/// Instrument implied by the processing directory, which wins over the file name.
fn instrument_from_path(full_path: &str) -> Option<&'static str> {
    [("OS_LTA", "ADCPOS150"), ("WH_LTA", "ADCPWH600")]
        .into_iter()
        .find(|(id, _)| full_path.contains(id))
        .map(|(_, instrument)| instrument)
}

/// Cruise legs of 2022 by date range; later legs carry the cruise in their file names.
const CRUISE_MAPPING_2022: [((u8, u8), (u8, u8), &str); 8] = [
    ((1, 10), (1, 13), "01"),
    ((2, 8), (2, 10), "03"),
    ((3, 17), (3, 21), "05"),
    ((4, 20), (4, 25), "07"),
    ((5, 19), (5, 26), "10"),
    ((6, 13), (6, 17), "11"),
    ((7, 12), (7, 17), "12"),
    ((8, 12), (8, 19), "13"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CruiseLookup {
    NotNeeded,
    Mapped(&'static str),
    Unmapped,
}

pub fn cruise_for_date(date: Date) -> CruiseLookup {
    if (date.year(), u8::from(date.month()), date.day()) > (2023, 1, 1) {
        return CruiseLookup::NotNeeded;
    }
    if date.year() != 2022 {
        return CruiseLookup::Unmapped;
    }
    let day = (u8::from(date.month()), date.day());
    CRUISE_MAPPING_2022
        .iter()
        .find(|(from, to, _)| *from <= day && day <= *to)
        .map(|(_, _, cruise)| CruiseLookup::Mapped(*cruise))
        .unwrap_or(CruiseLookup::Unmapped)
}

fn first_slash_date(date_pattern: &Regex, line: &str) -> Option<Date> {
    let captures = date_pattern.captures(line)?;
    let year: i32 = captures.get(1)?.as_str().parse().ok()?;
    let month: u8 = captures.get(2)?.as_str().parse().ok()?;
    let day: u8 = captures.get(3)?.as_str().parse().ok()?;
    Date::from_calendar_date(year, Month::try_from(month).ok()?, day).ok()
}

pub struct Adcp {
    setup: InstrumentSetup,
    classifier: Classifier,
    date_pattern: Regex,
}

impl Adcp {
    pub const NAME: &'static str = "ADCP";

    pub fn new(setup: InstrumentSetup) -> Result<Self> {
        let processed = PatternList::new(&PROCESSED_PATTERNS)?;
        let raw = PatternList::new(&RAW_PATTERNS)?;
        let classifier = Classifier::new()
            .rule(ResourceKind::Processed, move |c| {
                let mut attributes = processed.first_match(&c.full_path)?;
                if let Some(instrument) = instrument_from_path(&c.full_path) {
                    attributes.instrument = Some(instrument.to_string());
                }
                Some(attributes)
            })
            .rule(ResourceKind::Raw, move |c| raw.first_match(&c.stem))
            .rule(ResourceKind::Readme, |c| {
                c.source_path
                    .to_string_lossy()
                    .contains("readme")
                    .then(Attributes::new)
            });
        Ok(Adcp {
            setup,
            classifier,
            date_pattern: Regex::new(r"(\d{4})/(\d{2})/(\d{2})")?,
        })
    }

    fn complete_attributes(&self, candidate: &Candidate<'_>, attributes: &mut Attributes) {
        attributes.suffix = Some(candidate.suffix.clone());
        if let Some(instrument) = attributes.instrument.take() {
            attributes.instrument = Some(instrument_alias(&instrument).to_string());
        }
        if let Some(ship) = self.setup.attribute("ship") {
            attributes.ship = Some(ship.to_string());
        } else if attributes.ship.is_none() {
            attributes.ship = Some(UNKNOWN_SHIP.to_string());
        }
        if let Some(cruise) = self.setup.attribute("cruise") {
            attributes.cruise = Some(cruise.to_string());
        } else if attributes.cruise.is_none() {
            attributes.cruise = Some(UNKNOWN_CRUISE.to_string());
        }
    }

    fn key_for(attributes: &Attributes) -> Option<String> {
        Some(format!(
            "{}_{}_{}_{}",
            attributes.instrument.as_deref()?,
            attributes.ship.as_deref()?,
            attributes.year.as_deref()?,
            attributes.cruise.as_deref()?
        ))
    }

    /// Target of a raw or processed resource inside the package `key`.
    fn target_for(resource: &Resource, key: &str) -> Option<PathBuf> {
        let attributes = &resource.attributes;
        let leg = Path::new(attributes.instrument.as_deref()?)
            .join(attributes.year.as_deref()?)
            .join(key);
        let name = resource.file_name();
        match resource.kind() {
            ResourceKind::Raw => Some(leg.join("raw").join(name)),
            ResourceKind::Processed => {
                let mut root = leg.join("processed");
                let sub_directory = resource
                    .source_path()
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().to_uppercase())
                    .find(|part| PROCESSED_SUB_DIRECTORIES.contains(&part.as_str()));
                if let Some(sub_directory) = sub_directory {
                    root = root.join(sub_directory);
                }
                let target = match resource.suffix().as_str() {
                    ".nc" => root.join(name),
                    ".png" => root.join("plots").join(format!("{key}_{name}")),
                    _ => root.join("info").join(format!("{key}_{name}")),
                };
                Some(target)
            }
            _ => None,
        }
    }

    /// Start date of a cruise leg, from the first resource that records one.
    fn start_date(&self, package: &Package) -> Result<Option<Date>> {
        for resource in package.resources() {
            let is_cruise_info = resource.stem() == "cruise_info";
            let is_log = resource.suffix().eq_ignore_ascii_case(".log");
            if !is_cruise_info && !is_log {
                continue;
            }
            let bytes = fs::read(resource.absolute_source_path())?;
            let text = String::from_utf8_lossy(&bytes);
            let date = if is_cruise_info {
                text.lines()
                    .filter(|line| line.starts_with("CRUISE DATES"))
                    .find_map(|line| first_slash_date(&self.date_pattern, line))
            } else {
                text.lines()
                    .find_map(|line| first_slash_date(&self.date_pattern, line))
            };
            if date.is_some() {
                return Ok(date);
            }
        }
        Ok(None)
    }

    /*
     * Resolves the cruise of one leg and returns the package's new key. A start date
     * inside the mapped period must either map to a cruise or have one supplied by the
     * caller.
     */
    fn transform_leg(&self, package: &mut Package, options: &TransformOptions) -> Result<Option<String>> {
        let mut metadata = options.metadata.clone();
        metadata.retain(|_, value| !value.is_empty());
        if let Some(date) = self.start_date(package)? {
            match cruise_for_date(date) {
                CruiseLookup::NotNeeded => {}
                CruiseLookup::Mapped(cruise) => {
                    log::warn!(
                        "ADCP: Cruise for package {package} set by internal mapping from {:?} to {cruise}",
                        options.get("cruise")
                    );
                    metadata.insert("cruise".to_string(), cruise.to_string());
                }
                CruiseLookup::Unmapped => match options.get("cruise") {
                    Some(cruise) => {
                        log::warn!("ADCP: Cruise for package {package} set from the outside to {cruise}");
                    }
                    None => {
                        let msg = format!("No internal mapping for cruise was found for package {package}");
                        log::error!("ADCP: {msg}");
                        return Err(InstrumentError::Cruise(msg));
                    }
                },
            }
        }

        let mut new_key = None;
        for resource in package.resources_mut().iter_mut() {
            resource.attributes.update(&metadata);
            new_key = Self::key_for(&resource.attributes);
        }
        let Some(key) = new_key else {
            return Ok(None);
        };
        for resource in package.resources_mut().iter_mut() {
            if let Some(target) = Self::target_for(resource, &key) {
                resource.set_target_path(target)?;
            }
        }
        Ok(Some(key))
    }

    /// The readme package as written into one cruise leg.
    fn readme_for_leg(readme: &Package, leg: &Package) -> Result<Option<Package>> {
        let Some(first) = leg.resources().iter().next() else {
            return Ok(None);
        };
        let (Some(instrument), Some(year)) = (
            first.attributes.instrument.clone(),
            first.attributes.year.clone(),
        ) else {
            return Ok(None);
        };
        let mut copy = readme.clone();
        for resource in copy.resources_mut().iter_mut() {
            let target = Path::new(&instrument)
                .join(&year)
                .join(leg.key())
                .join(resource.file_name().to_lowercase());
            resource.attributes.set("package_key", leg.key());
            resource.set_target_path(target)?;
        }
        Ok(Some(copy))
    }
}

impl Instrument for Adcp {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &'static str {
        "ADCP monitoring from Svea"
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
        let Some((kind, mut attributes)) = self.classifier.classify(&candidate) else {
            log::info!("ADCP: No pattern matches file {source_path:?}");
            return Ok(None);
        };
        if kind == ResourceKind::Readme {
            return Ok(Some(self.setup.resource(source_path, kind, attributes, None)?));
        }
        self.complete_attributes(&candidate, &mut attributes);
        let mut resource = self.setup.resource(source_path, kind, attributes, None)?;
        if let Some(key) = Self::key_for(&resource.attributes) {
            if let Some(target) = Self::target_for(&resource, &key) {
                resource.set_target_path(target)?;
            }
        }
        Ok(Some(resource))
    }

    fn package_key(&self, resource: &Resource) -> Result<String> {
        if resource.kind() == ResourceKind::Readme {
            return Ok(README_PACKAGE_KEY.to_string());
        }
        Ok(Self::key_for(&resource.attributes).unwrap_or_else(|| resource.stem()))
    }

    fn transform_packages(&mut self, packages: &mut PackageCollection, options: &TransformOptions) -> Result<()> {
        let mut renames = Vec::new();
        for package in packages.iter_mut() {
            if package.key() == README_PACKAGE_KEY {
                continue;
            }
            if let Some(new_key) = self.transform_leg(package, options)? {
                if new_key != package.key() {
                    renames.push((package.key().to_string(), new_key));
                }
            }
        }
        for (old_key, new_key) in &renames {
            log::debug!("ADCP: Package {old_key} is now {new_key}");
        }
        packages.rekey_all(&renames)?;
        Ok(())
    }

    fn write_packages(&mut self, packages: &PackageCollection) -> Result<Vec<WriteReport>> {
        let mut reports = Vec::new();
        let readme = packages.get(README_PACKAGE_KEY).ok();
        for package in packages.iter().filter(|p| p.key() != README_PACKAGE_KEY) {
            reports.push(self.write_package(package)?);
            if let Some(readme) = readme {
                if let Some(copy) = Self::readme_for_leg(readme, package)? {
                    reports.push(self.write_package(&copy)?);
                }
            }
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruments::test_setup;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        source: TempDir,
        target: TempDir,
        _temp: TempDir,
        adcp: Adcp,
    }

    fn fixture(attributes: &[(&str, &str)]) -> Fixture {
        let source = tempdir().unwrap();
        let target = tempdir().unwrap();
        let temp = tempdir().unwrap();
        let mut setup = test_setup(source.path(), target.path(), temp.path());
        for (key, value) in attributes {
            setup.attributes.insert(key.to_string(), value.to_string());
        }
        let adcp = Adcp::new(setup).unwrap();
        Fixture {
            source,
            target,
            _temp: temp,
            adcp,
        }
    }

    fn write(root: &Path, path: &str, content: &str) {
        let full = root.join(path);
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(full, content).unwrap();
    }

    fn read_all(fx: &Fixture) -> PackageCollection {
        let mut packages = PackageCollection::new();
        for path in crate::core::instrument::list_source_files(fx.source.path()).unwrap() {
            if let Some(resource) = fx.adcp.classify(&path).unwrap() {
                let key = fx.adcp.package_key(&resource).unwrap();
                packages
                    .get_or_create(&key, Adcp::NAME)
                    .unwrap()
                    .add_resource(resource)
                    .unwrap();
            }
        }
        packages
    }

    #[test]
    fn test_cruise_lookup() {
        let date = |y, m: u8, d| Date::from_calendar_date(y, Month::try_from(m).unwrap(), d).unwrap();
        assert_eq!(cruise_for_date(date(2022, 5, 20)), CruiseLookup::Mapped("10"));
        assert_eq!(cruise_for_date(date(2022, 1, 10)), CruiseLookup::Mapped("01"));
        assert_eq!(cruise_for_date(date(2022, 5, 1)), CruiseLookup::Unmapped);
        assert_eq!(cruise_for_date(date(2021, 12, 1)), CruiseLookup::Unmapped);
        assert_eq!(cruise_for_date(date(2023, 3, 1)), CruiseLookup::NotNeeded);
    }

    #[test]
    fn test_classification_order_and_aliases() {
        let fx = fixture(&[("ship", "77SE")]);
        let processed = fx
            .adcp
            .classify(Path::new("ADCPWHM600_77SE_2023_04_processed/WH_LTA/BB/section.png"))
            .unwrap()
            .unwrap();
        assert_eq!(processed.kind(), ResourceKind::Processed);
        assert_eq!(processed.attributes.instrument.as_deref(), Some("ADCPWH600"));
        assert_eq!(
            processed.target_path(),
            Some(Path::new(
                "ADCPWH600/2023/ADCPWH600_77SE_2023_04/processed/BB/plots/ADCPWH600_77SE_2023_04_section.png"
            ))
        );

        let raw = fx
            .adcp
            .classify(Path::new("raw/OS150_SMHI_JAN_2022_ADCP001__029_000000.LTA"))
            .unwrap()
            .unwrap();
        assert_eq!(raw.kind(), ResourceKind::Raw);
        assert_eq!(fx.adcp.package_key(&raw).unwrap(), "ADCPOS150_77SE_2022_00");

        let readme = fx.adcp.classify(Path::new("docs/readme.txt")).unwrap().unwrap();
        assert_eq!(readme.kind(), ResourceKind::Readme);
        assert_eq!(fx.adcp.package_key(&readme).unwrap(), README_PACKAGE_KEY);
        assert!(readme.target_path().is_none());

        assert!(fx.adcp.classify(Path::new("notes.txt")).unwrap().is_none());
    }

    #[test]
    fn test_transform_maps_cruise_and_rekeys() {
        let mut fx = fixture(&[("ship", "77SE")]);
        write(fx.source.path(), "raw/OS150_SMHI_MAY_2022_000_000000.LTA", "x");
        write(
            fx.source.path(),
            "raw/OS150_SMHI_MAY_2022_000_000000.LOG",
            "header\nStarted 2022/05/20 10:00\n",
        );
        let mut packages = read_all(&fx);
        assert_eq!(packages.keys(), vec!["ADCPOS150_77SE_2022_00"]);

        fx.adcp
            .transform_packages(&mut packages, &TransformOptions::default())
            .unwrap();
        assert_eq!(packages.keys(), vec!["ADCPOS150_77SE_2022_10"]);
        let package = packages.get("ADCPOS150_77SE_2022_10").unwrap();
        let resource = package
            .resources()
            .get("raw/OS150_SMHI_MAY_2022_000_000000.LTA")
            .unwrap();
        assert_eq!(
            resource.target_path(),
            Some(Path::new(
                "ADCPOS150/2022/ADCPOS150_77SE_2022_10/raw/OS150_SMHI_MAY_2022_000_000000.LTA"
            ))
        );
    }

    #[test]
    fn test_unmapped_cruise_is_a_cruise_error_unless_supplied() {
        let mut fx = fixture(&[]);
        write(fx.source.path(), "raw/ADCPOS150_77SE_2022_00_000_00000.LTA", "x");
        write(
            fx.source.path(),
            "ADCPOS150_77SE_2022_00_processed/cruise_info.txt",
            "SHIP Svea\nCRUISE DATES 2022/05/01 - 2022/05/05\n",
        );
        let mut packages = read_all(&fx);
        let result = fx
            .adcp
            .transform_packages(&mut packages, &TransformOptions::default());
        assert!(matches!(result, Err(InstrumentError::Cruise(_))));

        let mut packages = read_all(&fx);
        let mut metadata = BTreeMap::new();
        metadata.insert("cruise".to_string(), "09".to_string());
        fx.adcp
            .transform_packages(&mut packages, &TransformOptions::new(metadata))
            .unwrap();
        assert_eq!(packages.keys(), vec!["ADCPOS150_77SE_2022_09"]);
    }

    #[test]
    fn test_readme_is_written_into_every_leg() {
        let mut fx = fixture(&[("ship", "77SE")]);
        write(fx.source.path(), "ADCPOS150_77SE_2023_01_000_00000.LTA", "a");
        write(fx.source.path(), "ADCPOS150_77SE_2023_02_000_00000.LTA", "b");
        write(fx.source.path(), "readme/README.TXT", "read me");
        let mut packages = read_all(&fx);
        assert_eq!(packages.len(), 3);
        fx.adcp
            .transform_packages(&mut packages, &TransformOptions::default())
            .unwrap();
        fx.adcp.write_packages(&packages).unwrap();

        for leg in ["ADCPOS150_77SE_2023_01", "ADCPOS150_77SE_2023_02"] {
            let readme = fx.target.path().join("ADCPOS150/2023").join(leg).join("readme.txt");
            assert_eq!(fs::read_to_string(readme).unwrap(), "read me");
        }
        assert!(fx
            .target
            .path()
            .join("ADCPOS150/2023/ADCPOS150_77SE_2023_01/raw/ADCPOS150_77SE_2023_01_000_00000.LTA")
            .is_file());
    }
}
