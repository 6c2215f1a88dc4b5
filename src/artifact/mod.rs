//! Files produced by the generators and the disk image produced by assembly.
//!
//! - [`filesystem`] - tree copying, sizing, atomic writes
//! - [`disk`] - partition table, filesystems and bootloader for the final image

pub mod disk;
pub mod filesystem;

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Serialize;

/// A generated file, addressed relative to the root filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigArtifact {
    pub path: PathBuf,
    pub contents: String,
    pub mode: u32,
}

impl ConfigArtifact {
    pub fn file(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
            mode: 0o644,
        }
    }

    pub fn executable(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        Self {
            mode: 0o755,
            ..Self::file(path, contents)
        }
    }

    /// Owner-only file for secrets such as the hostapd passphrase.
    pub fn private(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        Self {
            mode: 0o600,
            ..Self::file(path, contents)
        }
    }

    /// Write under `root`, creating parent directories.
    pub fn write_into(&self, root: &Path) -> Result<PathBuf> {
        if self.path.is_absolute()
            || self
                .path
                .components()
                .any(|part| matches!(part, Component::ParentDir))
        {
            bail!(
                "artifact path '{}' must stay inside the target root",
                self.path.display()
            );
        }
        let target = root.join(&self.path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory '{}'", parent.display()))?;
        }
        fs::write(&target, &self.contents)
            .with_context(|| format!("writing '{}'", target.display()))?;
        fs::set_permissions(&target, fs::Permissions::from_mode(self.mode))
            .with_context(|| format!("setting mode on '{}'", target.display()))?;
        Ok(target)
    }
}

/// Write every artifact under `root`, returning the rootfs-relative paths.
pub fn write_artifacts(root: &Path, artifacts: &[ConfigArtifact]) -> Result<Vec<PathBuf>> {
    let mut written = Vec::with_capacity(artifacts.len());
    for artifact in artifacts {
        artifact.write_into(root)?;
        written.push(artifact.path.clone());
    }
    Ok(written)
}
