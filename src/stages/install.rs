use anyhow::Result;
use tracing::{info, warn};

use super::{StageContext, StageId};
use crate::artifact::filesystem::remove_path;
use crate::tools::{run_checked, ToolInvocation};

/// Resolved packages plus the kernel, unless the profile excludes it.
pub(crate) fn install_list(ctx: &StageContext<'_>) -> Vec<String> {
    let mut list = ctx.packages.as_slice().to_vec();
    let kernel = ctx.plan.kernel_package();
    let excluded = ctx.plan.packages().exclude.iter().any(|p| p == kernel);
    if excluded {
        warn!(kernel, "kernel package is excluded; the image will not carry a kernel");
    } else if !ctx.packages.contains(kernel) {
        list.push(kernel.to_string());
    }
    list
}

/// Fresh copy of the base tree, then apt inside a chroot.
pub(super) fn run(ctx: &StageContext<'_>) -> Result<()> {
    let ws = ctx.workspace;
    let stage = StageId::PackageInstall.slug();
    let rootfs = ws.rootfs_dir();

    remove_path(&rootfs)?;
    run_checked(
        ctx.tools,
        stage,
        &ToolInvocation::new("cp")
            .arg("-a")
            .arg_path(&ws.rootfs_base_dir())
            .arg_path(&rootfs),
    )?;

    let packages = install_list(ctx);
    if packages.is_empty() {
        info!("no packages to install beyond the base system");
        return Ok(());
    }

    run_checked(
        ctx.tools,
        stage,
        &ToolInvocation::new("chroot")
            .arg_path(&rootfs)
            .args(["apt-get", "update"]),
    )?;
    info!(count = packages.len(), "installing packages");
    run_checked(
        ctx.tools,
        stage,
        &ToolInvocation::new("chroot")
            .arg_path(&rootfs)
            .args([
                "env",
                "DEBIAN_FRONTEND=noninteractive",
                "apt-get",
                "install",
                "-y",
                "--no-install-recommends",
            ])
            .args(packages.iter().cloned()),
    )?;
    run_checked(
        ctx.tools,
        stage,
        &ToolInvocation::new("chroot")
            .arg_path(&rootfs)
            .args(["apt-get", "clean"]),
    )?;
    Ok(())
}
