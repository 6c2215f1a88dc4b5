//! Build stages and the executor that drives them.
//!
//! ```text
//! bootstrap ──► package-install ──► service-inject ──► image-assemble ──► compress ──► validate
//!                                    ▲
//! configure ─────────────────────────┘
//! ```
//!
//! Stages only talk through the directories [`Workspace`] hands out. Each one
//! exposes a projection of the plan; its fingerprint hashes that projection
//! together with the fingerprints of the stages it depends on.

mod bootstrap;
pub mod compress;
mod configure;
mod executor;
mod inject;
mod install;
mod markers;

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::artifact::disk;
use crate::artifact::filesystem::{remove_path, tree_digest};
use crate::error::BuildError;
use crate::fry::{self, FryServiceOutput};
use crate::network::{self, NetworkOutput};
use crate::packages::{self, ResolvedPackages};
use crate::plan::BuildPlan;
use crate::tools::ToolRunner;
use crate::validate;
use crate::workspace::Workspace;

pub use executor::{RunSummary, StageExecutor, StageOutcome, StageState, StageStatus};
pub use markers::{RunState, RunStatus, StageMarker};
pub(crate) use configure::DEVICE_INFO_PATH;
pub(crate) use inject::{is_masked, wants_link};
pub(crate) use install::install_list;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageId {
    Bootstrap,
    Configure,
    PackageInstall,
    ServiceInject,
    ImageAssemble,
    Compress,
    Validate,
}

impl StageId {
    /// Execution order. Every stage appears after its dependencies.
    pub const ALL: [StageId; 7] = [
        StageId::Bootstrap,
        StageId::Configure,
        StageId::PackageInstall,
        StageId::ServiceInject,
        StageId::ImageAssemble,
        StageId::Compress,
        StageId::Validate,
    ];

    pub fn slug(&self) -> &'static str {
        match self {
            StageId::Bootstrap => "bootstrap",
            StageId::Configure => "configure",
            StageId::PackageInstall => "package-install",
            StageId::ServiceInject => "service-inject",
            StageId::ImageAssemble => "image-assemble",
            StageId::Compress => "compress",
            StageId::Validate => "validate",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|id| id.slug() == value)
    }

    pub fn dependencies(&self) -> &'static [StageId] {
        match self {
            StageId::Bootstrap | StageId::Configure => &[],
            StageId::PackageInstall => &[StageId::Bootstrap],
            StageId::ServiceInject => &[StageId::PackageInstall, StageId::Configure],
            StageId::ImageAssemble => &[StageId::ServiceInject],
            StageId::Compress => &[StageId::ImageAssemble],
            StageId::Validate => &[StageId::Compress],
        }
    }

    /// Stages that consume this stage's outputs, directly or transitively.
    pub fn dependents(&self) -> Vec<StageId> {
        let mut found: Vec<StageId> = Vec::new();
        for candidate in Self::ALL {
            let depends = candidate
                .dependencies()
                .iter()
                .any(|dep| dep == self || found.contains(dep));
            if depends {
                found.push(candidate);
            }
        }
        found
    }

    /// This stage and everything it needs, in execution order.
    pub fn closure(&self) -> Vec<StageId> {
        let mut needed = vec![*self];
        for candidate in Self::ALL.into_iter().rev() {
            if needed
                .iter()
                .any(|stage| stage.dependencies().contains(&candidate))
                && !needed.contains(&candidate)
            {
                needed.push(candidate);
            }
        }
        needed.sort();
        needed
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// Switches that change what a stage does without changing the plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageOptions {
    /// Boot the image in an emulator during validation.
    pub smoke_test: bool,
}

/// Everything a stage may read. Generators run once up front, so a bad
/// network section or package set fails before any tool is started.
pub struct StageContext<'a> {
    pub plan: &'a BuildPlan,
    pub workspace: &'a Workspace,
    pub tools: &'a dyn ToolRunner,
    pub packages: ResolvedPackages,
    pub network: NetworkOutput,
    pub fry: FryServiceOutput,
    /// Directory holding the profile's `files/`, `systemd/` and `network/` trees.
    pub profile_dir: Option<PathBuf>,
    pub options: StageOptions,
}

impl<'a> StageContext<'a> {
    pub fn prepare(
        plan: &'a BuildPlan,
        workspace: &'a Workspace,
        tools: &'a dyn ToolRunner,
        profile_dir: Option<&Path>,
        options: StageOptions,
    ) -> Result<Self, BuildError> {
        let packages = packages::resolve(plan);
        let network = network::generate(plan)?;
        let fry = fry::generate(plan);
        Ok(Self {
            plan,
            workspace,
            tools,
            packages,
            network,
            fry,
            profile_dir: profile_dir.map(Path::to_path_buf),
            options,
        })
    }

    /// The plan fields a stage's result depends on.
    fn projection(&self, stage: StageId) -> Result<Value> {
        let plan = self.plan;
        Ok(match stage {
            StageId::Bootstrap => json!({
                "architecture": plan.architecture(),
                "debian": plan.debian(),
            }),
            StageId::Configure => json!({
                "identity": plan.identity(),
                "architecture": plan.architecture(),
                "flavor": plan.flavor(),
                "debian": plan.debian(),
                "network": self.network.artifacts,
                "profile_tree": self.profile_tree_digest()?,
            }),
            StageId::PackageInstall => json!({
                "packages": self.packages.as_slice(),
                "kernel": plan.kernel_package(),
                "architecture": plan.architecture(),
            }),
            StageId::ServiceInject => json!({
                "fry": self.fry.artifacts,
                "enabled": self.enabled_units(),
                "disabled": self.fry.disabled_units,
            }),
            StageId::ImageAssemble => json!({
                "architecture": plan.architecture(),
                "image_size": plan.image_size().bytes(),
                "filesystem": plan.filesystem(),
                "filename": plan.image_filename(),
                "output_dir": self.workspace.output_dir(),
            }),
            StageId::Compress => json!({
                "compression": plan.compression(),
                "filename": plan.image_filename(),
                "identity": plan.identity(),
                "suite": plan.debian().suite,
            }),
            StageId::Validate => json!({}),
        })
    }

    fn profile_tree_digest(&self) -> Result<Value> {
        let Some(dir) = &self.profile_dir else {
            return Ok(Value::Null);
        };
        Ok(json!({
            "files": tree_digest(&dir.join("files"))?,
            "systemd": tree_digest(&dir.join("systemd"))?,
            "network": tree_digest(&dir.join("network"))?,
        }))
    }

    /// Network units first, then Fry units, without repeats.
    pub fn enabled_units(&self) -> Vec<String> {
        let mut units: Vec<String> = Vec::new();
        for unit in self
            .network
            .enabled_units
            .iter()
            .chain(self.fry.enabled_units.iter())
        {
            if !units.contains(unit) {
                units.push(unit.clone());
            }
        }
        units
    }

    /// Artifacts a stage guarantees on success.
    pub fn outputs(&self, stage: StageId) -> Vec<PathBuf> {
        let ws = self.workspace;
        match stage {
            StageId::Bootstrap => vec![ws.rootfs_base_dir()],
            StageId::Configure => vec![ws.overlay_dir()],
            StageId::PackageInstall => vec![ws.rootfs_dir()],
            StageId::ServiceInject => vec![inject::record_path(ws)],
            StageId::ImageAssemble => vec![
                ws.output_dir().join(self.plan.image_filename()),
                disk::record_path(ws),
            ],
            StageId::Compress => compress::outputs(self.plan, ws),
            StageId::Validate => vec![validate::report_path(ws)],
        }
    }

    fn execute(&self, stage: StageId) -> Result<()> {
        match stage {
            StageId::Bootstrap => bootstrap::run(self),
            StageId::Configure => configure::run(self),
            StageId::PackageInstall => install::run(self),
            StageId::ServiceInject => inject::run(self),
            StageId::ImageAssemble => disk::assemble(self).map(|_| ()),
            StageId::Compress => compress::run(self),
            StageId::Validate => validate::run(self),
        }
    }

    /// Remove what a failed or interrupted stage may have left behind.
    fn discard(&self, stage: StageId) -> Result<()> {
        match stage {
            StageId::ServiceInject => inject::undo(self),
            StageId::ImageAssemble => {
                remove_path(&self.workspace.image_work_dir())?;
                for path in self.outputs(stage) {
                    remove_path(&path)?;
                }
                Ok(())
            }
            // The report explains the failure; keep it.
            StageId::Validate => Ok(()),
            _ => {
                for path in self.outputs(stage) {
                    remove_path(&path)?;
                }
                Ok(())
            }
        }
    }
}

/// `sha256(slug \0 projection \0 dependency fingerprints...)`
fn fingerprint(stage: StageId, projection: &Value, dependencies: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(stage.slug().as_bytes());
    hasher.update([0u8]);
    hasher.update(projection.to_string().as_bytes());
    for dep in dependencies {
        hasher.update([0u8]);
        hasher.update(dep.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}
