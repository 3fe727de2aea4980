/*
 * A `Resource` is one physical source file mapped to one eventual target file, together
 * with the attributes a classifier extracted from its name. Source and target paths are
 * both relative and always pass through the path guard, so nothing built from a resource
 * can point outside its root directory.
 *
 * The `ResourceCollection` keeps resources unique by the POSIX form of their source path.
 */
use crate::core::path_guard::{self, PathError};
use regex::{Captures, Regex};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{Date, Month, PrimitiveDateTime, Time};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionError {
    ResourceAlreadyInCollection(String),
    ResourceNotInCollection(String),
    PackageAlreadyInCollection(String),
    PackageNotInCollection(String),
    EmptyPackageKey,
}

impl std::fmt::Display for CollectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectionError::ResourceAlreadyInCollection(key) => write!(
                f,
                "Resource {key} could not be added since it already is in the collection"
            ),
            CollectionError::ResourceNotInCollection(key) => {
                write!(f, "Resource {key} does not exist in the collection")
            }
            CollectionError::PackageAlreadyInCollection(key) => write!(
                f,
                "Package {key} could not be added since it already is in the collection"
            ),
            CollectionError::PackageNotInCollection(key) => {
                write!(f, "Package {key} does not exist in the collection")
            }
            CollectionError::EmptyPackageKey => write!(f, "Package key must not be empty"),
        }
    }
}

impl std::error::Error for CollectionError {}

/// Tags which classifier variant produced a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Raw,
    Processed,
    Readme,
    Export,
    Metadata,
    Classification,
    ResultBundle,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Raw => "raw",
            ResourceKind::Processed => "processed",
            ResourceKind::Readme => "readme",
            ResourceKind::Export => "export",
            ResourceKind::Metadata => "metadata",
            ResourceKind::Classification => "classification",
            ResourceKind::ResultBundle => "result_bundle",
        }
    }
}

/*
 * Attributes extracted by classification and enriched by the transform phase. The keys
 * that every instrument shares are named fields; instrument-specific keys (serial number,
 * cut, process type, commit message, ...) live in the ordered `extra` map. String lookups
 * route to the named field when the key names one, so callers can treat the record as a
 * plain key/value map when that is convenient.
 */
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Attributes {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub month: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hour: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minute: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub second: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instrument: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instrument_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ship: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cruise: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /*
     * Builds attributes from the named groups of a regex match. Groups that did not take
     * part in the match are left unset, which is how optional pattern parts (an absent
     * `prefix`, a missing `cruise`) stay distinguishable from empty strings.
     */
    pub fn from_captures(regex: &Regex, captures: &Captures<'_>) -> Self {
        let mut attributes = Self::default();
        for name in regex.capture_names().flatten() {
            if let Some(value) = captures.name(name) {
                attributes.set(name, value.as_str());
            }
        }
        attributes
    }

    fn slot(&self, key: &str) -> Option<&Option<String>> {
        match key {
            "year" => Some(&self.year),
            "month" => Some(&self.month),
            "day" => Some(&self.day),
            "hour" => Some(&self.hour),
            "minute" => Some(&self.minute),
            "second" => Some(&self.second),
            "instrument" => Some(&self.instrument),
            "instrument_number" => Some(&self.instrument_number),
            "ship" => Some(&self.ship),
            "cruise" => Some(&self.cruise),
            "prefix" => Some(&self.prefix),
            "suffix" => Some(&self.suffix),
            _ => None,
        }
    }

    fn slot_mut(&mut self, key: &str) -> Option<&mut Option<String>> {
        match key {
            "year" => Some(&mut self.year),
            "month" => Some(&mut self.month),
            "day" => Some(&mut self.day),
            "hour" => Some(&mut self.hour),
            "minute" => Some(&mut self.minute),
            "second" => Some(&mut self.second),
            "instrument" => Some(&mut self.instrument),
            "instrument_number" => Some(&mut self.instrument_number),
            "ship" => Some(&mut self.ship),
            "cruise" => Some(&mut self.cruise),
            "prefix" => Some(&mut self.prefix),
            "suffix" => Some(&mut self.suffix),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        match self.slot(key) {
            Some(field) => field.as_deref(),
            None => self.extra.get(key).map(String::as_str),
        }
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.slot_mut(key) {
            Some(field) => *field = Some(value),
            None => {
                self.extra.insert(key.to_string(), value);
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        match self.slot_mut(key) {
            Some(field) => field.take(),
            None => self.extra.remove(key),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Overwrites every key present in `values`.
    pub fn update(&mut self, values: &BTreeMap<String, String>) {
        for (key, value) in values {
            self.set(key, value.as_str());
        }
    }

    /// All present attributes as `(key, value)` pairs, named fields first.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        const NAMED: [&str; 12] = [
            "year",
            "month",
            "day",
            "hour",
            "minute",
            "second",
            "instrument",
            "instrument_number",
            "ship",
            "cruise",
            "prefix",
            "suffix",
        ];
        NAMED
            .into_iter()
            .filter_map(move |key| self.get(key).map(|value| (key, value)))
            .chain(
                self.extra
                    .iter()
                    .map(|(key, value)| (key.as_str(), value.as_str())),
            )
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    /// Calendar date from year/month/day, `None` when absent or not a valid date.
    pub fn date(&self) -> Option<Date> {
        let year: i32 = self.year.as_deref()?.parse().ok()?;
        let month: u8 = self.month.as_deref()?.parse().ok()?;
        let day: u8 = self.day.as_deref()?.parse().ok()?;
        let month = Month::try_from(month).ok()?;
        Date::from_calendar_date(year, month, day).ok()
    }

    /*
     * Date and time of day. Requires a valid date; absent hour, minute or second default
     * to zero, while present but malformed components yield `None`.
     */
    pub fn datetime(&self) -> Option<PrimitiveDateTime> {
        let date = self.date()?;
        let component = |value: &Option<String>| -> Option<u8> {
            match value.as_deref() {
                Some(text) => text.parse().ok(),
                None => Some(0),
            }
        };
        let time = Time::from_hms(
            component(&self.hour)?,
            component(&self.minute)?,
            component(&self.second)?,
        )
        .ok()?;
        Some(PrimitiveDateTime::new(date, time))
    }
}

/*
 * One source file. `source_directory` is shared between every resource of an instrument
 * run; `source_path` and `target_path` are relative and verified. A `None` target means
 * the file is not written by the storage backend.
 */
#[derive(Debug, Clone)]
pub struct Resource {
    source_directory: Arc<Path>,
    source_path: PathBuf,
    target_path: Option<PathBuf>,
    kind: ResourceKind,
    pub attributes: Attributes,
}

impl Resource {
    pub fn new(
        source_directory: Arc<Path>,
        source_path: impl AsRef<Path>,
        kind: ResourceKind,
        attributes: Attributes,
    ) -> path_guard::Result<Self> {
        let source_path = path_guard::verify_relative_path(source_path)?;
        Ok(Resource {
            source_directory,
            target_path: Some(source_path.clone()),
            source_path,
            kind,
            attributes,
        })
    }

    /// Collection identity: the POSIX form of the source path.
    pub fn key(&self) -> String {
        path_guard::to_posix_string(&self.source_path)
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn source_directory(&self) -> &Arc<Path> {
        &self.source_directory
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn absolute_source_path(&self) -> PathBuf {
        self.source_directory.join(&self.source_path)
    }

    pub fn target_path(&self) -> Option<&Path> {
        self.target_path.as_deref()
    }

    pub fn set_target_path(&mut self, path: impl AsRef<Path>) -> Result<(), PathError> {
        self.target_path = Some(path_guard::verify_relative_path(path)?);
        Ok(())
    }

    pub fn clear_target_path(&mut self) {
        self.target_path = None;
    }

    pub fn file_name(&self) -> String {
        self.source_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// File name without its last extension.
    pub fn stem(&self) -> String {
        file_stem(&self.source_path)
    }

    /// Last extension including the leading dot, or an empty string.
    pub fn suffix(&self) -> String {
        file_suffix(&self.source_path)
    }

    pub fn date(&self) -> Option<Date> {
        self.attributes.date()
    }

    pub fn datetime(&self) -> Option<PrimitiveDateTime> {
        self.attributes.datetime()
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

pub fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub fn file_suffix(path: &Path) -> String {
    path.extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default()
}

/*
 * Insertion-ordered set of resources, unique by `Resource::key`. Ordering follows the
 * order in which the read phase discovered the files.
 */
#[derive(Debug, Clone, Default)]
pub struct ResourceCollection {
    resources: Vec<Resource>,
    index: HashMap<String, usize>,
}

impl ResourceCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, resource: Resource) -> Result<(), CollectionError> {
        let key = resource.key();
        if self.index.contains_key(&key) {
            return Err(CollectionError::ResourceAlreadyInCollection(key));
        }
        self.index.insert(key, self.resources.len());
        self.resources.push(resource);
        Ok(())
    }

    pub fn has(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Result<&Resource, CollectionError> {
        self.index
            .get(key)
            .map(|&position| &self.resources[position])
            .ok_or_else(|| CollectionError::ResourceNotInCollection(key.to_string()))
    }

    pub fn get_mut(&mut self, key: &str) -> Result<&mut Resource, CollectionError> {
        match self.index.get(key) {
            Some(&position) => Ok(&mut self.resources[position]),
            None => Err(CollectionError::ResourceNotInCollection(key.to_string())),
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Resource> {
        self.resources.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Resource> {
        self.resources.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub(crate) fn into_vec(self) -> Vec<Resource> {
        self.resources
    }
}

impl<'a> IntoIterator for &'a ResourceCollection {
    type Item = &'a Resource;
    type IntoIter = std::slice::Iter<'a, Resource>;

    fn into_iter(self) -> Self::IntoIter {
        self.resources.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> Arc<Path> {
        Arc::from(Path::new("/data/source"))
    }

    fn resource(path: &str) -> Resource {
        Resource::new(root(), path, ResourceKind::Raw, Attributes::new()).unwrap()
    }

    #[test]
    fn test_new_rejects_unsafe_source_paths() {
        for candidate in ["../x.cnv", "/abs/x.cnv", "a/../../x"] {
            let result = Resource::new(root(), candidate, ResourceKind::Raw, Attributes::new());
            assert!(result.is_err(), "Expected {candidate:?} to be rejected");
        }
    }

    #[test]
    fn test_target_defaults_to_source_and_is_validated_on_assignment() {
        let mut r = resource("cruise/file.hex");
        assert_eq!(r.target_path(), Some(Path::new("cruise/file.hex")));

        assert!(matches!(
            r.set_target_path("../escape.hex"),
            Err(PathError::Traversal(_))
        ));
        assert_eq!(r.target_path(), Some(Path::new("cruise/file.hex")));

        r.set_target_path("2022/raw/FILE.hex").unwrap();
        assert_eq!(r.target_path(), Some(Path::new("2022/raw/FILE.hex")));

        r.clear_target_path();
        assert_eq!(r.target_path(), None);
    }

    #[test]
    fn test_absolute_source_path_joins_root() {
        let r = resource("a/b.txt");
        assert_eq!(r.absolute_source_path(), PathBuf::from("/data/source/a/b.txt"));
        assert_eq!(r.stem(), "b");
        assert_eq!(r.suffix(), ".txt");
        assert_eq!(r.file_name(), "b.txt");
    }

    #[test]
    fn test_attribute_routing_between_named_fields_and_extra() {
        let mut attributes = Attributes::new();
        attributes.set("year", "2022");
        attributes.set("serno", "0001");
        assert_eq!(attributes.year.as_deref(), Some("2022"));
        assert_eq!(attributes.extra.get("serno").map(String::as_str), Some("0001"));
        assert_eq!(attributes.get("serno"), Some("0001"));

        let mut update = BTreeMap::new();
        update.insert("ship".to_string(), "77SE".to_string());
        update.insert("comment".to_string(), "test".to_string());
        attributes.update(&update);
        assert_eq!(attributes.ship.as_deref(), Some("77SE"));
        assert_eq!(attributes.get("comment"), Some("test"));

        assert_eq!(attributes.remove("year"), Some("2022".to_string()));
        assert!(!attributes.contains("year"));

        let keys: Vec<&str> = attributes.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["ship", "comment", "serno"]);
    }

    #[test]
    fn test_from_captures_skips_non_participating_groups() {
        let regex = Regex::new(r"^(?P<prefix>u|d)?SBE(?P<instrument_number>\d{2})$").unwrap();
        let captures = regex.captures("SBE09").unwrap();
        let attributes = Attributes::from_captures(&regex, &captures);
        assert_eq!(attributes.prefix, None);
        assert_eq!(attributes.instrument_number.as_deref(), Some("09"));
    }

    #[test]
    fn test_date_and_datetime_derivation() {
        let mut attributes = Attributes::new();
        assert_eq!(attributes.date(), None);

        attributes.set("year", "2023");
        attributes.set("month", "06");
        attributes.set("day", "15");
        let date = attributes.date().unwrap();
        assert_eq!(date.year(), 2023);
        assert_eq!(u8::from(date.month()), 6);
        assert_eq!(date.day(), 15);

        let midnight = attributes.datetime().unwrap();
        assert_eq!(midnight.hour(), 0);

        attributes.set("hour", "12");
        attributes.set("minute", "30");
        let datetime = attributes.datetime().unwrap();
        assert_eq!((datetime.hour(), datetime.minute(), datetime.second()), (12, 30, 0));

        attributes.set("month", "13");
        assert_eq!(attributes.date(), None);
        assert_eq!(attributes.datetime(), None);
    }

    #[test]
    fn test_collection_rejects_duplicate_source_path() {
        let mut collection = ResourceCollection::new();
        collection.add(resource("a/b.txt")).unwrap();
        let second = collection.add(resource("a/./b.txt"));
        assert_eq!(
            second,
            Err(CollectionError::ResourceAlreadyInCollection("a/b.txt".to_string()))
        );
        assert_eq!(collection.len(), 1);
        assert!(collection.has("a/b.txt"));
        assert!(collection.get("missing").is_err());
    }

    #[test]
    fn test_collection_preserves_insertion_order() {
        let mut collection = ResourceCollection::new();
        for name in ["c.txt", "a.txt", "b.txt"] {
            collection.add(resource(name)).unwrap();
        }
        let keys: Vec<String> = collection.iter().map(Resource::key).collect();
        assert_eq!(keys, vec!["c.txt", "a.txt", "b.txt"]);
    }
}
