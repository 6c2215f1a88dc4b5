//! On-disk project layout: one base document and a directory of profiles.
//!
//! ```text
//! <root>/
//!   base-config.toml
//!   profiles/<name>/profile-config.toml
//!   profiles/<name>/{files,systemd,network}/   (optional trees)
//!   cache/ work/ output/                        (see Workspace)
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::{list_profiles, load_from_disk, BASE_CONFIG_FILENAME};
use crate::plan::{merge, BuildPlan, Overrides};
use crate::workspace::Workspace;

const PROFILES_DIR: &str = "profiles";

#[derive(Debug, Clone)]
pub struct Project {
    root: PathBuf,
}

impl Project {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn base_config_path(&self) -> PathBuf {
        self.root.join(BASE_CONFIG_FILENAME)
    }

    pub fn profiles_dir(&self) -> PathBuf {
        self.root.join(PROFILES_DIR)
    }

    pub fn profile_dir(&self, profile: &str) -> PathBuf {
        self.profiles_dir().join(profile)
    }

    pub fn profiles(&self) -> Result<Vec<String>> {
        list_profiles(&self.profiles_dir())
    }

    /// Load both documents and merge them for `overrides.profile`.
    pub fn load_plan(&self, overrides: &Overrides) -> Result<BuildPlan> {
        let loaded = load_from_disk(
            &self.base_config_path(),
            &self.profiles_dir(),
            &overrides.profile,
        )?;
        let plan = merge(&loaded.base, &loaded.profile, overrides)
            .with_context(|| format!("resolving profile '{}'", overrides.profile))?;
        Ok(plan)
    }

    pub fn workspace(&self, plan: &BuildPlan) -> Workspace {
        Workspace::new(&self.root, plan)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::fs;

    pub(crate) const BASE: &str = r#"
[general]
os_name = "Fry IoT"
os_version = "1.0"

[debian]
suite = "trixie"
mirror = "https://deb.debian.org/debian"

[packages]
core = ["systemd", "curl"]
iot = ["hostapd"]
"#;

    /// A project under `root` with the given profiles.
    pub(crate) fn write_project(root: &Path, profiles: &[(&str, &str)]) -> Project {
        let project = Project::new(root);
        fs::write(project.base_config_path(), BASE).unwrap();
        for (name, text) in profiles {
            let dir = project.profile_dir(name);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("profile-config.toml"), text).unwrap();
        }
        project
    }
}
