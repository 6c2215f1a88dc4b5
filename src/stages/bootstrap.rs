use std::fs;

use anyhow::{Context, Result};
use tracing::info;

use super::{StageContext, StageId};
use crate::artifact::filesystem::remove_path;
use crate::tools::{run_checked, ToolInvocation};

/// Debootstrap a minimal base tree with mmdebstrap.
pub(super) fn run(ctx: &StageContext<'_>) -> Result<()> {
    let ws = ctx.workspace;
    let plan = ctx.plan;
    let target = ws.rootfs_base_dir();
    let cache = ws.cache_dir().join("apt");

    remove_path(&target)?;
    fs::create_dir_all(&cache)
        .with_context(|| format!("creating apt cache '{}'", cache.display()))?;

    let debian = plan.debian();
    info!(
        suite = %debian.suite,
        architecture = %plan.architecture(),
        "bootstrapping base system"
    );
    let invocation = ToolInvocation::new("mmdebstrap")
        .arg(format!("--architectures={}", plan.architecture()))
        .arg("--variant=minbase")
        .arg(format!("--components={}", debian.components.join(",")))
        .arg(format!(
            "--aptopt=Dir::Cache::Archives \"{}\"",
            cache.display()
        ))
        .arg("--skip=essential/unlink")
        .arg(&debian.suite)
        .arg_path(&target)
        .arg(&debian.mirror);
    run_checked(ctx.tools, StageId::Bootstrap.slug(), &invocation)?;
    Ok(())
}
