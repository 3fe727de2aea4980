/*
 * Moving Vessel Profiler casts. Files are only considered below a `SMHI_...` directory of
 * an MVP tree; the directory right after it names the cut (transect) and becomes part of
 * the target path. Processed files carry the cut in their name as well.
 */
use crate::core::classifier::{Candidate, Classifier, PatternList};
use crate::core::instrument::{Instrument, Result, TransformOptions};
use crate::core::package::Package;
use crate::core::resource::{Attributes, Resource, ResourceKind};
use crate::core::storage::Storage;
use crate::instruments::{InstrumentSetup, propagate_metadata};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const PROCESSED_PATTERN: &str = r"^(?P<prefix>.{1})?(?P<instrument>MVP)_(?P<year>\d{4})-(?P<month>\d{2})-(?P<day>\d{2})_(?P<hour>\d{2})(?P<minute>\d{2})(?P<second>\d{2})_(?P<cut>.+-.+)$";

const RAW_PATTERN: &str = r"^(?P<prefix>.{1})?(?P<instrument>MVP)_(?P<year>\d{4})-(?P<month>\d{2})-(?P<day>\d{2})_(?P<hour>\d{2})(?P<minute>\d{2})(?P<second>\d{2})(?P<ending>_.*)?$";

const RAW_DIRECTORY: &str = "RAWDATA";
const UNKNOWN_CUT: &str = "unknown";

fn in_mvp_tree(candidate: &Candidate<'_>) -> bool {
    let full_path = candidate.full_path.to_uppercase();
    full_path.contains("MVP") && full_path.contains("SMHI_")
}

fn finish_attributes(candidate: &Candidate<'_>, mut attributes: Attributes) -> Attributes {
    if !attributes.contains("cut") && candidate.parent_parts().iter().any(|p| p == RAW_DIRECTORY) {
        if let Some(parent) = candidate.parent_name() {
            attributes.set("cut", parent);
        }
    }
    if let Some(cut) = attributes.remove("cut") {
        attributes.set("cut", cut.to_uppercase());
    }
    attributes.suffix = Some(candidate.suffix.clone());
    attributes
}

pub struct Mvp {
    setup: InstrumentSetup,
    classifier: Classifier,
}

impl Mvp {
    pub const NAME: &'static str = "MVP";

    pub fn new(setup: InstrumentSetup) -> Result<Self> {
        let processed = PatternList::case_insensitive(&[PROCESSED_PATTERN])?;
        let raw = PatternList::new(&[RAW_PATTERN])?;
        let classifier = Classifier::new()
            .rule(ResourceKind::Processed, move |c| {
                if !in_mvp_tree(c) {
                    return None;
                }
                processed
                    .first_match(&c.stem)
                    .map(|attributes| finish_attributes(c, attributes))
            })
            .rule(ResourceKind::Raw, move |c| {
                if !in_mvp_tree(c) {
                    return None;
                }
                raw.first_match(&c.stem)
                    .map(|attributes| finish_attributes(c, attributes))
            });
        Ok(Mvp { setup, classifier })
    }

    /// The directory following the `SMHI_...` directory of the source path.
    fn cut_from_path(candidate: &Candidate<'_>) -> String {
        let parts = candidate.parent_parts();
        parts
            .iter()
            .position(|part| part.starts_with("SMHI_"))
            .and_then(|i| parts.get(i + 1))
            .cloned()
            .unwrap_or_else(|| UNKNOWN_CUT.to_string())
    }

    fn target_path(candidate: &Candidate<'_>, attributes: &Attributes) -> Option<PathBuf> {
        let name = &candidate.file_name;
        let Some(year) = attributes.year.as_deref() else {
            return Some(Path::new("annat").join(name));
        };
        let base = Path::new(year).join(Self::cut_from_path(candidate));
        if candidate.parent_parts().iter().any(|p| p == RAW_DIRECTORY) {
            return Some(base.join("raw").join(name));
        }
        let target = match candidate.suffix.as_str() {
            ".cnv" => match attributes.prefix.as_deref() {
                Some("u") => base.join("cnv").join("upcast").join(name),
                Some("d") => base.join("cnv").join("downcast").join(name),
                _ => base.join("cnv").join(name),
            },
            ".jpg" => base.join("cnv").join("downcast").join("plot").join(name),
            _ => Path::new("annat").join(name),
        };
        Some(target)
    }
}

impl Instrument for Mvp {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &'static str {
        "MVP monitoring from Svea"
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
        let target = Self::target_path(&candidate, &attributes);
        Ok(Some(self.setup.resource(source_path, kind, attributes, target)?))
    }

    fn package_key(&self, resource: &Resource) -> Result<String> {
        let a = &resource.attributes;
        let key = match (&a.year, &a.month, &a.day, &a.hour, &a.minute, &a.second) {
            (Some(y), Some(mo), Some(d), Some(h), Some(mi), Some(s)) => {
                format!("{y}-{mo}-{d} {h}:{mi}:{s}")
            }
            _ => resource.stem(),
        };
        Ok(key)
    }

    fn transform_package(&mut self, package: &mut Package, options: &TransformOptions) -> Result<()> {
        propagate_metadata(package, options);
        Ok(())
    }
}
