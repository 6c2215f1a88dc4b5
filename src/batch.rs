//! Build every profile at once.
//!
//! Each profile gets its own plan, workspace and lock, so the runs share
//! nothing but the tool runner and are fanned out with rayon.

use std::time::Instant;

use anyhow::Result;
use rayon::prelude::*;
use tracing::{error, info, info_span};

use crate::plan::Overrides;
use crate::project::Project;
use crate::stages::{RunSummary, StageContext, StageExecutor, StageOptions};
use crate::tools::ToolRunner;

/// Result of one profile's run.
#[derive(Debug)]
pub struct ProfileOutcome {
    pub profile: String,
    pub elapsed_secs: f64,
    pub result: Result<RunSummary>,
}

impl ProfileOutcome {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

/// Full pipeline for one profile.
pub fn build_profile(
    project: &Project,
    overrides: &Overrides,
    tools: &dyn ToolRunner,
    options: StageOptions,
) -> Result<RunSummary> {
    let plan = project.load_plan(overrides)?;
    let workspace = project.workspace(&plan);
    let profile_dir = project.profile_dir(&overrides.profile);
    let ctx = StageContext::prepare(&plan, &workspace, tools, Some(&profile_dir), options)?;
    StageExecutor::new(ctx).run_all()
}

/// Build `profiles` in parallel. `template` supplies the shared overrides; an
/// explicit output directory gets one subdirectory per profile.
pub fn build_all(
    project: &Project,
    profiles: &[String],
    template: &Overrides,
    tools: &dyn ToolRunner,
    options: StageOptions,
) -> Vec<ProfileOutcome> {
    info!(count = profiles.len(), "building all profiles");
    profiles
        .par_iter()
        .map(|profile| {
            let span = info_span!("profile", name = %profile);
            let _guard = span.enter();
            let mut overrides = template.clone();
            overrides.profile = profile.clone();
            overrides.output_dir = template.output_dir.as_ref().map(|dir| dir.join(profile));

            let start = Instant::now();
            let result = build_profile(project, &overrides, tools, options);
            let elapsed_secs = start.elapsed().as_secs_f64();
            match &result {
                Ok(summary) => info!(
                    ran = summary.ran().len(),
                    skipped = summary.skipped().len(),
                    "profile built in {:.1}s",
                    elapsed_secs
                ),
                Err(err) => error!("profile failed: {:#}", err),
            }
            ProfileOutcome {
                profile: profile.clone(),
                elapsed_secs,
                result,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BuildError;
    use crate::project::testing::write_project;
    use crate::tools::testing::FakeTools;
    use tempfile::TempDir;

    const X86: &str = r#"
[build]
architecture = "amd64"
image_size = "512M"

[packages]
include = ["grub-pc"]
"#;

    const ARM_NO_GRUB: &str = r#"
[build]
architecture = "arm64"
image_size = "1G"
"#;

    #[test]
    fn test_failed_profile_does_not_stop_siblings() {
        let temp = TempDir::new().unwrap();
        let project = write_project(temp.path(), &[("x86", X86), ("arm", ARM_NO_GRUB)]);
        let tools = FakeTools::new();
        let profiles = project.profiles().unwrap();

        let outcomes = build_all(
            &project,
            &profiles,
            &Overrides::new(""),
            &tools,
            StageOptions::default(),
        );

        assert_eq!(outcomes.len(), 2);
        let arm = outcomes.iter().find(|o| o.profile == "arm").unwrap();
        let x86 = outcomes.iter().find(|o| o.profile == "x86").unwrap();
        assert!(x86.succeeded());
        let err = arm.result.as_ref().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::MissingBootloader { .. })
        ));
        assert!(temp.path().join("output/x86-amd64/SHA256SUMS").is_file());
        assert!(temp.path().join("work/x86").is_dir());
        assert!(!temp.path().join("work/arm/rootfs").exists());
    }

    #[test]
    fn test_output_override_is_split_per_profile() {
        let temp = TempDir::new().unwrap();
        let project = write_project(temp.path(), &[("x86", X86)]);
        let tools = FakeTools::new();
        let mut template = Overrides::new("");
        template.output_dir = Some(temp.path().join("dist"));

        let outcomes = build_all(
            &project,
            &["x86".to_string()],
            &template,
            &tools,
            StageOptions::default(),
        );

        assert!(outcomes[0].succeeded());
        assert!(temp.path().join("dist/x86/SHA256SUMS").is_file());
    }
}
