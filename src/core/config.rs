/*
 * Loading of the YAML run configuration. The file maps instrument section names to
 * records; section order is preserved and becomes the registration order of the run.
 *
 * Before parsing, the raw text is treated as a template: `$NAME` and `${NAME}` are
 * replaced from environment variables whose names start with `SVEA_` and from explicit
 * variables given by the caller (which win over the environment). `$$` yields a literal
 * dollar sign and placeholders without a value are left untouched.
 */
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "SVEA_";

#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Yaml(serde_yaml::Error),
    MissingKey { instrument: String, key: String },
    UnknownInstrument(String),
    InvalidValue { instrument: String, key: String, message: String },
}

impl From<io::Error> for ConfigError {
    fn from(err: io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Yaml(err)
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Configuration I/O error: {e}"),
            ConfigError::Yaml(e) => write!(f, "Configuration YAML error: {e}"),
            ConfigError::MissingKey { instrument, key } => {
                write!(f, "Missing required configuration '{key}' for {instrument}")
            }
            ConfigError::UnknownInstrument(name) => write!(
                f,
                "Could not resolve instrument for key '{name}' found in config"
            ),
            ConfigError::InvalidValue {
                instrument,
                key,
                message,
            } => write!(f, "Invalid value for '{key}' in {instrument}: {message}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Yaml(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Where an instrument's packages are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageTarget {
    File {
        root_directory: PathBuf,
    },
    Subversion {
        repo_url: String,
        username: Option<String>,
        password: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct RawInstrumentConfig {
    source_directory: Option<PathBuf>,
    target_directory: Option<PathBuf>,
    subversion_repo_url: Option<String>,
    username: Option<String>,
    password: Option<String>,
    #[serde(default)]
    force: bool,
    #[serde(default)]
    allow_force: bool,
    wiski_directory: Option<PathBuf>,
    #[serde(default)]
    attributes: serde_yaml::Mapping,
}

/// One instrument section of the configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InstrumentConfig {
    pub name: String,
    pub source_directory: PathBuf,
    pub target_directory: Option<PathBuf>,
    pub subversion_repo_url: Option<String>,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// Write mode: overwrite targets that already exist.
    pub force: bool,
    /// Backend policy: whether the filesystem backend accepts forced writes at all.
    pub allow_force: bool,
    pub wiski_directory: Option<PathBuf>,
    pub attributes: BTreeMap<String, String>,
}

impl InstrumentConfig {
    /// Minimal section writing to a local directory; used by tests and embedding callers.
    pub fn new(name: &str, source_directory: impl Into<PathBuf>) -> Self {
        InstrumentConfig {
            name: name.to_string(),
            source_directory: source_directory.into(),
            ..InstrumentConfig::default()
        }
    }

    fn from_value(name: &str, value: serde_yaml::Value) -> Result<Self> {
        if value.is_null() {
            return Err(ConfigError::MissingKey {
                instrument: name.to_string(),
                key: "source_directory".to_string(),
            });
        }
        let raw: RawInstrumentConfig = serde_yaml::from_value(value)?;
        let source_directory = raw.source_directory.ok_or_else(|| ConfigError::MissingKey {
            instrument: name.to_string(),
            key: "source_directory".to_string(),
        })?;

        let mut attributes = BTreeMap::new();
        for (key, value) in raw.attributes {
            let key = scalar_to_string(name, "attributes", &key)?;
            if value.is_null() {
                continue;
            }
            let value = scalar_to_string(name, &key, &value)?;
            attributes.insert(key, value);
        }

        Ok(InstrumentConfig {
            name: name.to_string(),
            source_directory,
            target_directory: raw.target_directory,
            subversion_repo_url: raw.subversion_repo_url,
            username: raw.username,
            password: raw.password,
            force: raw.force,
            allow_force: raw.allow_force,
            wiski_directory: raw.wiski_directory,
            attributes,
        })
    }

    /*
     * Storage selection: a repository URL selects the version-control backend, otherwise
     * a target directory selects the filesystem backend. Neither is a configuration error.
     */
    pub fn storage_target(&self) -> Result<StorageTarget> {
        if let Some(repo_url) = &self.subversion_repo_url {
            return Ok(StorageTarget::Subversion {
                repo_url: repo_url.clone(),
                username: self.username.clone(),
                password: self.password.clone(),
            });
        }
        match &self.target_directory {
            Some(root_directory) => Ok(StorageTarget::File {
                root_directory: root_directory.clone(),
            }),
            None => Err(ConfigError::MissingKey {
                instrument: self.name.clone(),
                key: "target_directory".to_string(),
            }),
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

fn scalar_to_string(instrument: &str, key: &str, value: &serde_yaml::Value) -> Result<String> {
    match value {
        serde_yaml::Value::String(s) => Ok(s.clone()),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        _ => Err(ConfigError::InvalidValue {
            instrument: instrument.to_string(),
            key: key.to_string(),
            message: "expected a scalar value".to_string(),
        }),
    }
}

/// The parsed configuration: instrument sections in file order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SveaConfig {
    pub instruments: Vec<InstrumentConfig>,
}

impl SveaConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let document: serde_yaml::Value = serde_yaml::from_str(text)?;
        let mapping = match document {
            serde_yaml::Value::Null => return Ok(SveaConfig::default()),
            serde_yaml::Value::Mapping(mapping) => mapping,
            _ => {
                return Err(ConfigError::InvalidValue {
                    instrument: "<root>".to_string(),
                    key: "<root>".to_string(),
                    message: "expected a mapping of instrument sections".to_string(),
                });
            }
        };
        let mut instruments = Vec::with_capacity(mapping.len());
        for (key, value) in mapping {
            let name = scalar_to_string("<root>", "<section>", &key)?;
            instruments.push(InstrumentConfig::from_value(&name, value)?);
        }
        Ok(SveaConfig { instruments })
    }

    /// Reads `path`, substitutes template variables and parses the result.
    pub fn load(path: &Path, variables: &BTreeMap<String, String>) -> Result<Self> {
        log::debug!("Config: Loading configuration from {path:?}");
        let text = fs::read_to_string(path)?;
        let mut values = environment_variables();
        values.extend(variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        let config = Self::from_yaml_str(&substitute_template(&text, &values))?;
        log::info!(
            "Config: Loaded {} instrument section(s) from {path:?}",
            config.instruments.len()
        );
        Ok(config)
    }
}

/// Environment variables eligible for template substitution.
pub fn environment_variables() -> BTreeMap<String, String> {
    std::env::vars()
        .filter(|(key, _)| key.starts_with(ENV_PREFIX))
        .collect()
}

pub fn substitute_template(text: &str, values: &BTreeMap<String, String>) -> String {
    let placeholder = match Regex::new(
        r"\$(?:(?P<escaped>\$)|(?P<named>[_A-Za-z][_A-Za-z0-9]*)|\{(?P<braced>[_A-Za-z][_A-Za-z0-9]*)\})",
    ) {
        Ok(regex) => regex,
        Err(e) => {
            log::error!("Config: Template pattern failed to compile: {e}");
            return text.to_string();
        }
    };
    placeholder
        .replace_all(text, |captures: &Captures<'_>| {
            if captures.name("escaped").is_some() {
                return "$".to_string();
            }
            let name = captures
                .name("named")
                .or_else(|| captures.name("braced"))
                .map(|m| m.as_str())
                .unwrap_or_default();
            match values.get(name) {
                Some(value) => value.clone(),
                None => captures[0].to_string(),
            }
        })
        .into_owned()
}

/// Parses `KEY=VALUE` pairs given on the command line.
pub fn parse_key_value(text: &str) -> std::result::Result<(String, String), String> {
    match text.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{text}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_sections_keep_file_order_and_stringify_attributes() {
        let yaml = r#"
Ferrybox:
  source_directory: /data/ferrybox
  target_directory: /archive/ferrybox
  allow_force: true
CTD:
  source_directory: /data/ctd
  subversion_repo_url: svn://svn/ctd
  username: archiver
  force: true
  attributes:
    ship: 77SE
    cruise: 3
    calibrated: true
    comment:
"#;
        let config = SveaConfig::from_yaml_str(yaml).unwrap();
        let names: Vec<&str> = config.instruments.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["Ferrybox", "CTD"]);

        let ctd = &config.instruments[1];
        assert!(ctd.force);
        assert!(!ctd.allow_force);
        assert!(config.instruments[0].allow_force);
        assert!(!config.instruments[0].force);
        assert_eq!(ctd.attribute("ship"), Some("77SE"));
        assert_eq!(ctd.attribute("cruise"), Some("3"));
        assert_eq!(ctd.attribute("calibrated"), Some("true"));
        assert_eq!(ctd.attribute("comment"), None);
        assert_eq!(
            ctd.storage_target().unwrap(),
            StorageTarget::Subversion {
                repo_url: "svn://svn/ctd".to_string(),
                username: Some("archiver".to_string()),
                password: None,
            }
        );
        assert_eq!(
            config.instruments[0].storage_target().unwrap(),
            StorageTarget::File {
                root_directory: PathBuf::from("/archive/ferrybox")
            }
        );
    }

    #[test]
    fn test_missing_source_directory_is_fatal() {
        let result = SveaConfig::from_yaml_str("IFCB:\n  target_directory: /x\n");
        assert!(matches!(
            result,
            Err(ConfigError::MissingKey { ref key, .. }) if key == "source_directory"
        ));
        assert!(matches!(
            SveaConfig::from_yaml_str("IFCB:\n"),
            Err(ConfigError::MissingKey { .. })
        ));
    }

    #[test]
    fn test_missing_storage_is_reported() {
        let config = SveaConfig::from_yaml_str("MVP:\n  source_directory: /x\n").unwrap();
        assert!(matches!(
            config.instruments[0].storage_target(),
            Err(ConfigError::MissingKey { ref key, .. }) if key == "target_directory"
        ));
    }

    #[test]
    fn test_template_substitution() {
        let mut values = BTreeMap::new();
        values.insert("SVEA_ROOT".to_string(), "/data".to_string());
        values.insert("ship".to_string(), "77SE".to_string());
        let text = "a: $SVEA_ROOT/ctd\nb: ${ship}_x\nc: $$5\nd: $UNKNOWN and ${ALSO_UNKNOWN}\ne: $ 1";
        assert_eq!(
            substitute_template(text, &values),
            "a: /data/ctd\nb: 77SE_x\nc: $5\nd: $UNKNOWN and ${ALSO_UNKNOWN}\ne: $ 1"
        );
    }

    #[test]
    fn test_load_applies_variables() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "IFCB:\n  source_directory: $SRC\n  target_directory: ${DST}\n",
        )
        .unwrap();
        let mut vars = BTreeMap::new();
        vars.insert("SRC".to_string(), "/in".to_string());
        vars.insert("DST".to_string(), "/out".to_string());
        let config = SveaConfig::load(&path, &vars).unwrap();
        assert_eq!(config.instruments[0].source_directory, PathBuf::from("/in"));
        assert_eq!(
            config.instruments[0].target_directory,
            Some(PathBuf::from("/out"))
        );
    }

    #[test]
    fn test_empty_and_invalid_documents() {
        assert!(SveaConfig::from_yaml_str("").unwrap().instruments.is_empty());
        assert!(matches!(
            SveaConfig::from_yaml_str("- a\n- b\n"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            SveaConfig::from_yaml_str("a: [unclosed"),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("cruise=05").unwrap(),
            ("cruise".to_string(), "05".to_string())
        );
        assert_eq!(
            parse_key_value("comment=a=b").unwrap(),
            ("comment".to_string(), "a=b".to_string())
        );
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=x").is_err());
    }
}
