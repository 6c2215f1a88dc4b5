//! Loading and schema-checking of the base and profile documents.
//!
//! Parsing is pure: [`load`] takes the document text and never touches the
//! filesystem. The path helpers below read files and list profiles for the
//! CLI.

mod documents;
mod schema;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::error::BuildError;

pub use documents::{
    BaseBuild, BaseConfig, BaseGeneral, BasePackages, BridgeSection, DebianSection,
    DnsmasqSection, EthernetSection, FirewallSection, FrySection, HostapdSection,
    NetworkSection, OutputSection, ProfileBuild, ProfileConfig, ProfileGeneral,
    ProfilePackages, SystemSection, VlanSection, WifiSection,
};
pub use schema::ConfigWarning;

/// File name of the base document at the project root.
pub const BASE_CONFIG_FILENAME: &str = "base-config.toml";
/// File name of a profile document inside `profiles/<name>/`.
pub const PROFILE_CONFIG_FILENAME: &str = "profile-config.toml";

/// Raw text of one configuration document plus the name used in errors.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    name: String,
    text: String,
}

impl ConfigSource {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config '{}'", path.display()))?;
        Ok(Self::new(path.display().to_string(), text))
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Both documents after parsing, plus every unknown key that was seen.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub base: BaseConfig,
    pub profile: ProfileConfig,
    pub warnings: Vec<ConfigWarning>,
}

/// Parse and validate a base and a profile document.
pub fn load(base: &ConfigSource, profile: &ConfigSource) -> Result<LoadedConfig, BuildError> {
    let mut warnings = Vec::new();
    let base_config = parse_document(base, schema::BASE_DOCUMENT, &mut warnings)?;
    let profile_config = parse_document(profile, schema::PROFILE_DOCUMENT, &mut warnings)?;
    Ok(LoadedConfig {
        base: base_config,
        profile: profile_config,
        warnings,
    })
}

fn parse_document<T: DeserializeOwned + documents::Extensible>(
    source: &ConfigSource,
    fields: &[schema::Field],
    warnings: &mut Vec<ConfigWarning>,
) -> Result<T, BuildError> {
    let table: toml::Table = source.text.parse().map_err(|err: toml::de::Error| {
        let location = err
            .span()
            .map(|span| format!("line {}: ", line_of(&source.text, span.start)))
            .unwrap_or_default();
        BuildError::ConfigParse {
            document: source.name.clone(),
            message: format!("{}{}", location, err.message().trim()),
        }
    })?;

    let mut walker = schema::Walker::new(&source.name);
    walker.check_table(&table, fields, "")?;
    let (found, nested_extras) = walker.into_parts();
    warnings.extend(found);

    let mut document: T = toml::Value::Table(table)
        .try_into()
        .map_err(|err: toml::de::Error| BuildError::ConfigSchema {
            document: source.name.clone(),
            key_path: "<document>".to_string(),
            message: err.message().trim().to_string(),
        })?;
    document.extensions_mut().extend(nested_extras);
    Ok(document)
}

fn line_of(text: &str, offset: usize) -> usize {
    text.as_bytes()
        .iter()
        .take(offset)
        .filter(|byte| **byte == b'\n')
        .count()
        + 1
}

/// Path of a profile document under `profiles_dir`.
pub fn profile_config_path(profiles_dir: &Path, profile: &str) -> PathBuf {
    profiles_dir.join(profile).join(PROFILE_CONFIG_FILENAME)
}

/// Sorted names of every directory under `profiles_dir` holding a profile document.
pub fn list_profiles(profiles_dir: &Path) -> Result<Vec<String>> {
    if !profiles_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut profiles = Vec::new();
    for entry in fs::read_dir(profiles_dir)
        .with_context(|| format!("reading profiles directory '{}'", profiles_dir.display()))?
    {
        let entry = entry.with_context(|| {
            format!("iterating profiles directory '{}'", profiles_dir.display())
        })?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if name.starts_with('.') || !entry.path().join(PROFILE_CONFIG_FILENAME).is_file() {
            continue;
        }
        profiles.push(name);
    }
    profiles.sort();
    Ok(profiles)
}

/// Read both documents from disk and log every unknown key.
pub fn load_from_disk(base_path: &Path, profiles_dir: &Path, profile: &str) -> Result<LoadedConfig> {
    if profile.is_empty() || profile.contains(['/', '\\']) || profile.starts_with('.') {
        bail!("invalid profile name '{}'", profile);
    }
    let profile_path = profile_config_path(profiles_dir, profile);
    if !profile_path.is_file() {
        let available = list_profiles(profiles_dir)?;
        bail!(
            "profile '{}' not found at '{}' (available: {})",
            profile,
            profile_path.display(),
            if available.is_empty() {
                "none".to_string()
            } else {
                available.join(", ")
            }
        );
    }

    let loaded = load(&ConfigSource::read(base_path)?, &ConfigSource::read(&profile_path)?)?;
    for warning in &loaded.warnings {
        warn!("{}", warning);
    }
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const BASE: &str = r#"
[general]
os_name = "fry-iot"
os_version = "1.0.0"

[debian]
suite = "trixie"
mirror = "https://deb.debian.org/debian"

[packages]
core = ["curl", "systemd"]
"#;

    #[test]
    fn test_load_minimal_documents() {
        let loaded = load(
            &ConfigSource::new("base-config.toml", BASE),
            &ConfigSource::new(
                "profile-config.toml",
                "[build]\narchitecture = \"arm64\"\n[packages]\ninclude = [\"hostapd\"]\n",
            ),
        )
        .unwrap();
        assert_eq!(loaded.base.debian.suite, "trixie");
        assert_eq!(loaded.base.packages.core, vec!["curl", "systemd"]);
        assert_eq!(loaded.profile.build.architecture.as_deref(), Some("arm64"));
        assert_eq!(loaded.profile.packages.include, vec!["hostapd"]);
        assert!(loaded.warnings.is_empty());
    }

    #[test]
    fn test_syntax_error_reports_line() {
        let err = load(
            &ConfigSource::new("base-config.toml", BASE),
            &ConfigSource::new("profile-config.toml", "[build]\narchitecture = \n"),
        )
        .unwrap_err();
        match err {
            BuildError::ConfigParse { document, message } => {
                assert_eq!(document, "profile-config.toml");
                assert!(message.starts_with("line 2"), "{message}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_sections_are_kept_as_extensions() {
        let loaded = load(
            &ConfigSource::new("base-config.toml", BASE),
            &ConfigSource::new("profile-config.toml", "[telemetry]\nendpoint = \"x\"\n"),
        )
        .unwrap();
        assert_eq!(loaded.warnings.len(), 1);
        assert_eq!(loaded.warnings[0].key_path, "telemetry");
        assert!(loaded.profile.extensions.contains_key("telemetry"));
    }

    #[test]
    fn test_unknown_nested_keys_are_kept_by_path() {
        let loaded = load(
            &ConfigSource::new("base-config.toml", BASE),
            &ConfigSource::new(
                "profile-config.toml",
                "[build]\narchitecture = \"arm64\"\nboard_rev = 3\n\n\
                 [[network.vlans]]\nid = 10\ninterface = \"eth0\"\npriority = \"high\"\n",
            ),
        )
        .unwrap();
        let paths: Vec<&str> = loaded.warnings.iter().map(|w| w.key_path.as_str()).collect();
        assert_eq!(paths, vec!["build.board_rev", "network.vlans[0].priority"]);
        assert_eq!(
            loaded.profile.extensions.get("build.board_rev"),
            Some(&toml::Value::Integer(3))
        );
        assert_eq!(
            loaded.profile.extensions.get("network.vlans[0].priority"),
            Some(&toml::Value::String("high".to_string()))
        );
    }

    #[test]
    fn test_missing_core_list_is_schema_error() {
        let err = load(
            &ConfigSource::new(
                "base-config.toml",
                "[debian]\nsuite = \"trixie\"\nmirror = \"m\"\n[packages]\niot = []\n",
            ),
            &ConfigSource::new("profile-config.toml", ""),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            BuildError::ConfigSchema { ref key_path, .. } if key_path == "packages.core"
        ));
    }

    #[test]
    fn test_list_profiles_skips_dirs_without_config() {
        let temp = TempDir::new().unwrap();
        let profiles = temp.path().join("profiles");
        for name in ["rpi4", "x86-64", "notes"] {
            fs::create_dir_all(profiles.join(name)).unwrap();
        }
        fs::write(profile_config_path(&profiles, "rpi4"), "").unwrap();
        fs::write(profile_config_path(&profiles, "x86-64"), "").unwrap();

        assert_eq!(list_profiles(&profiles).unwrap(), vec!["rpi4", "x86-64"]);
    }

    #[test]
    fn test_load_from_disk_lists_available_profiles_on_miss() {
        let temp = TempDir::new().unwrap();
        let profiles = temp.path().join("profiles");
        fs::create_dir_all(profiles.join("rpi4")).unwrap();
        fs::write(profile_config_path(&profiles, "rpi4"), "").unwrap();
        let base = temp.path().join(BASE_CONFIG_FILENAME);
        fs::write(&base, BASE).unwrap();

        let err = load_from_disk(&base, &profiles, "bananapi").unwrap_err();
        assert!(err.to_string().contains("available: rpi4"));
        assert!(load_from_disk(&base, &profiles, "rpi4").is_ok());
    }
}
