/*
 * IFCB classification results. A classifier run leaves one `_class_` matrix per sample
 * plus yearly summaries in a run directory; the directory name is the package key. The
 * source files are not archived one by one: the transform phase bundles each run into
 * `result_<key>.zip` and writes `result_<key>.txt` listing the samples it covers.
 */
use crate::core::classifier::{Candidate, Classifier, PatternList};
use crate::core::events::Event;
use crate::core::instrument::{Instrument, Result, TransformOptions};
use crate::core::package::Package;
use crate::core::resource::{Attributes, Resource, ResourceKind};
use crate::core::storage::Storage;
use crate::core::temp_dir;
use crate::instruments::InstrumentSetup;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const CLASS_PATTERN: &str = r"^D(?P<year>\d{4})(?P<month>\d{2})(?P<day>\d{2})T(?P<hour>\d{2})(?P<minute>\d{2})(?P<second>\d{2})_(?P<instrument>IFCB\d*)_(?P<process_type>class)(?P<version>.*)\.mat$";

const SUMMARY_PATTERNS: [&str; 2] = [
    r"^summary_allTB_(?P<year>\d{4})\.mat$",
    r"^summary_biovol_allTB2(?P<year>\d{4})\.mat$",
];

const DEFAULT_INSTRUMENT: &str = "IFCB";
const ROOT_PACKAGE_KEY: &str = "results";

/// `DYYYYMMDDThhmmss_IFCBn` of a per-sample result file.
pub fn sample_key(stem: &str) -> String {
    stem.splitn(3, '_').take(2).collect::<Vec<_>>().join("_")
}

pub struct IfcbResults {
    setup: InstrumentSetup,
    classifier: Classifier,
}

impl IfcbResults {
    pub const NAME: &'static str = "IFCBresults";

    pub fn new(setup: InstrumentSetup) -> Result<Self> {
        let patterns = PatternList::new(&[CLASS_PATTERN, SUMMARY_PATTERNS[0], SUMMARY_PATTERNS[1]])?;
        let classifier = Classifier::new().rule(ResourceKind::Classification, move |c| {
            patterns.first_match(&c.file_name)
        });
        Ok(IfcbResults { setup, classifier })
    }

    fn instrument_of(&self, package: &Package) -> String {
        package
            .resources()
            .iter()
            .find_map(|r| r.attributes.instrument.clone())
            .or_else(|| self.setup.attribute("instrument").map(str::to_string))
            .unwrap_or_else(|| DEFAULT_INSTRUMENT.to_string())
    }

    fn stage(
        &self,
        package: &mut Package,
        source_directory: &Arc<Path>,
        file_name: &str,
        target: PathBuf,
    ) -> Result<()> {
        let mut resource = Resource::new(
            Arc::clone(source_directory),
            file_name,
            ResourceKind::ResultBundle,
            Attributes::new(),
        )?;
        resource.set_target_path(target)?;
        package.add_resource(resource)?;
        self.setup.context.events.publish(Event::TransformAddFile {
            instrument: Self::NAME.to_string(),
            resource: package.key().to_string(),
            name: file_name.to_string(),
        });
        Ok(())
    }
}

impl Instrument for IfcbResults {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &'static str {
        "Classification results of Imaging FlowCytobot (IFCB)"
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
        Ok(Some(self.setup.resource(source_path, kind, attributes, None)?))
    }

    fn package_key(&self, resource: &Resource) -> Result<String> {
        let parent = resource
            .source_path()
            .parent()
            .and_then(Path::file_name)
            .map(|name| name.to_string_lossy().into_owned());
        Ok(parent.unwrap_or_else(|| ROOT_PACKAGE_KEY.to_string()))
    }

    fn transform_package(&mut self, package: &mut Package, _options: &TransformOptions) -> Result<()> {
        let files: Vec<PathBuf> = package
            .resources()
            .iter()
            .filter(|r| r.kind() == ResourceKind::Classification)
            .map(Resource::absolute_source_path)
            .collect();
        if files.is_empty() {
            return Ok(());
        }
        let samples: BTreeSet<String> = package
            .resources()
            .iter()
            .filter(|r| r.attributes.get("process_type").is_some())
            .map(|r| sample_key(&r.stem()))
            .collect();

        let key = package.key().to_string();
        let staging = self.setup.context.temp_dir.subdirectory(Self::NAME)?;
        let zip_name = format!("result_{key}.zip");
        let list_name = format!("result_{key}.txt");
        temp_dir::create_zip_file(&files, &staging.join(&zip_name), &self.setup.source_directory)?;
        let listing: Vec<&str> = samples.iter().map(String::as_str).collect();
        fs::write(staging.join(&list_name), listing.join("\n"))?;
        log::debug!(
            "IFCBresults: Bundled {} files covering {} samples for {key}",
            files.len(),
            samples.len()
        );

        let results = Path::new(&self.instrument_of(package)).join("results");
        let staging: Arc<Path> = Arc::from(staging.as_path());
        self.stage(package, &staging, &zip_name, results.join(&zip_name))?;
        self.stage(package, &staging, &list_name, results.join(&list_name))?;
        Ok(())
    }
}
