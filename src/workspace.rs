//! Per-profile workspace layout.
//!
//! ```text
//! <root>/cache/<profile>/                 apt archives, reused across builds
//! <root>/work/<profile>/rootfs-base/      debootstrapped tree
//! <root>/work/<profile>/overlay/          rendered configuration
//! <root>/work/<profile>/rootfs/           installed tree
//! <root>/work/<profile>/image/            assembler scratch space
//! <root>/work/<profile>/state/            stage markers and run state
//! <root>/output/<profile>-<arch>/         images, checksums, manifest
//! ```
//!
//! Each profile owns its cache, work and output subtree, so batch runs never
//! share a directory.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use time::OffsetDateTime;

use crate::plan::BuildPlan;

const LOCK_FILENAME: &str = ".lock";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
    profile: String,
    output_dir: PathBuf,
}

impl Workspace {
    pub fn new(root: &Path, plan: &BuildPlan) -> Self {
        let output_dir = match plan.output_dir() {
            Some(dir) => dir.to_path_buf(),
            None => root
                .join("output")
                .join(format!("{}-{}", plan.profile(), plan.architecture())),
        };
        Self {
            root: root.to_path_buf(),
            profile: plan.profile().to_string(),
            output_dir,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache").join(&self.profile)
    }

    pub fn work_dir(&self) -> PathBuf {
        self.root.join("work").join(&self.profile)
    }

    pub fn rootfs_base_dir(&self) -> PathBuf {
        self.work_dir().join("rootfs-base")
    }

    pub fn overlay_dir(&self) -> PathBuf {
        self.work_dir().join("overlay")
    }

    pub fn rootfs_dir(&self) -> PathBuf {
        self.work_dir().join("rootfs")
    }

    pub fn image_work_dir(&self) -> PathBuf {
        self.work_dir().join("image")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.work_dir().join("state")
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Create the cache, work, state and output directories.
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.cache_dir(),
            self.work_dir(),
            self.state_dir(),
            self.output_dir.clone(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("creating workspace directory '{}'", dir.display()))?;
        }
        Ok(())
    }

    /// Take the exclusive per-profile lock. Released when the guard drops.
    pub fn lock(&self) -> Result<WorkspaceLock> {
        let work_dir = self.work_dir();
        fs::create_dir_all(&work_dir)
            .with_context(|| format!("creating work directory '{}'", work_dir.display()))?;
        let path = work_dir.join(LOCK_FILENAME);
        // Never unlink the lock file; a second process could then lock a new inode.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("opening workspace lock '{}'", path.display()))?;
        if file.try_lock_exclusive().is_err() {
            anyhow::bail!(
                "profile '{}' is being built by another process (lock held on '{}')",
                self.profile,
                path.display()
            );
        }
        Ok(WorkspaceLock { _file: file, path })
    }
}

#[derive(Debug)]
pub struct WorkspaceLock {
    _file: File,
    path: PathBuf,
}

impl WorkspaceLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// `YYYYMMDDTHHMMSSZ` in UTC.
pub fn now_utc_compact() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}
