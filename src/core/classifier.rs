/*
 * Ordered, first-match-wins classification. An instrument declares a list of rules, each
 * tagging the resources it produces with a `ResourceKind`; rules are tried in declaration
 * order (raw before processed before catch-alls) and the first matcher that returns
 * attributes decides the kind. A miss across all rules is not an error, the caller simply
 * skips the file.
 */
use crate::core::resource::{Attributes, ResourceKind, file_stem, file_suffix};
use regex::{Regex, RegexBuilder};
use std::path::Path;

/// Everything a matcher may inspect about one candidate file.
#[derive(Debug, Clone)]
pub struct Candidate<'a> {
    pub source_directory: &'a Path,
    pub source_path: &'a Path,
    pub file_name: String,
    pub stem: String,
    pub suffix: String,
    pub full_path: String,
}

impl<'a> Candidate<'a> {
    pub fn new(source_directory: &'a Path, source_path: &'a Path) -> Self {
        Candidate {
            source_directory,
            source_path,
            file_name: source_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            stem: file_stem(source_path),
            suffix: file_suffix(source_path),
            full_path: source_directory
                .join(source_path)
                .to_string_lossy()
                .into_owned(),
        }
    }

    /// Directory names of the relative source path, outermost first.
    pub fn parent_parts(&self) -> Vec<String> {
        self.source_path
            .parent()
            .map(|parent| {
                parent
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Name of the directory directly containing the file, if any.
    pub fn parent_name(&self) -> Option<String> {
        self.parent_parts().pop()
    }
}

/*
 * A list of regular expressions tried in order. `first_match` runs a search (not an
 * anchored match, patterns anchor themselves where needed) and returns the named groups
 * of the first pattern that matches.
 */
#[derive(Debug, Clone)]
pub struct PatternList {
    patterns: Vec<Regex>,
}

impl PatternList {
    pub fn new(patterns: &[&str]) -> Result<Self, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PatternList { patterns })
    }

    pub fn case_insensitive(patterns: &[&str]) -> Result<Self, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|p| RegexBuilder::new(p).case_insensitive(true).build())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PatternList { patterns })
    }

    pub fn first_match(&self, text: &str) -> Option<Attributes> {
        self.patterns.iter().find_map(|regex| {
            regex
                .captures(text)
                .map(|captures| Attributes::from_captures(regex, &captures))
        })
    }
}

pub type Matcher = Box<dyn Fn(&Candidate<'_>) -> Option<Attributes> + Send + Sync>;

#[derive(Default)]
pub struct Classifier {
    rules: Vec<(ResourceKind, Matcher)>,
}

impl std::fmt::Debug for Classifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<ResourceKind> = self.rules.iter().map(|(kind, _)| *kind).collect();
        f.debug_struct("Classifier").field("rules", &kinds).finish()
    }
}

impl Classifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule<F>(mut self, kind: ResourceKind, matcher: F) -> Self
    where
        F: Fn(&Candidate<'_>) -> Option<Attributes> + Send + Sync + 'static,
    {
        self.rules.push((kind, Box::new(matcher)));
        self
    }

    pub fn classify(&self, candidate: &Candidate<'_>) -> Option<(ResourceKind, Attributes)> {
        self.rules
            .iter()
            .find_map(|(kind, matcher)| matcher(candidate).map(|attributes| (*kind, attributes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_matching_pattern_wins() {
        let patterns = PatternList::new(&[
            r"^(?P<year>\d{4})_(?P<cruise>\d{2})$",
            r"^(?P<year>\d{4})_(?P<nr>.+)$",
        ])
        .unwrap();
        let attributes = patterns.first_match("2022_01").unwrap();
        assert_eq!(attributes.cruise.as_deref(), Some("01"));
        assert_eq!(attributes.get("nr"), None);

        let attributes = patterns.first_match("2022_abc").unwrap();
        assert_eq!(attributes.get("nr"), Some("abc"));
        assert!(patterns.first_match("nothing").is_none());
    }

    #[test]
    fn test_case_insensitive_patterns() {
        let patterns = PatternList::case_insensitive(&[r"^(?P<instrument>mvp)_x$"]).unwrap();
        let attributes = patterns.first_match("MVP_X").unwrap();
        assert_eq!(attributes.instrument.as_deref(), Some("MVP"));
    }

    #[test]
    fn test_rules_are_tried_in_declaration_order() {
        let classifier = Classifier::new()
            .rule(ResourceKind::Processed, |c| {
                c.full_path.contains("processed").then(Attributes::new)
            })
            .rule(ResourceKind::Raw, |c| {
                (c.suffix == ".000").then(Attributes::new)
            })
            .rule(ResourceKind::Readme, |c| {
                c.full_path.contains("readme").then(Attributes::new)
            });

        let root = Path::new("/root");
        let raw = Path::new("processed/file.000");
        let (kind, _) = classifier.classify(&Candidate::new(root, raw)).unwrap();
        assert_eq!(kind, ResourceKind::Processed);

        let raw = Path::new("raw/file.000");
        let (kind, _) = classifier.classify(&Candidate::new(root, raw)).unwrap();
        assert_eq!(kind, ResourceKind::Raw);

        let other = Path::new("raw/other.txt");
        assert!(classifier.classify(&Candidate::new(root, other)).is_none());
    }

    #[test]
    fn test_candidate_parts() {
        let candidate = Candidate::new(Path::new("/data"), Path::new("a/b/c.txt"));
        assert_eq!(candidate.parent_parts(), vec!["a", "b"]);
        assert_eq!(candidate.parent_name().as_deref(), Some("b"));
        assert_eq!(candidate.stem, "c");
        assert_eq!(candidate.suffix, ".txt");
        assert_eq!(candidate.file_name, "c.txt");
    }
}
