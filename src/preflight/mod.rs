//! Preflight checks for a build.
//!
//! Validates that the host has the tools the plan will invoke before any stage
//! starts, so a missing `sfdisk` is reported up front rather than halfway
//! through image assembly.
//!
//! # Example
//!
//! ```rust,ignore
//! use fry_builder::preflight::{check_required_tools, required_tools};
//!
//! let tools = required_tools(&plan);
//! if let Err(e) = check_required_tools(&tools) {
//!     eprintln!("{:#}", e);
//! }
//! ```

use anyhow::{bail, Result};
use tracing::warn;

use crate::artifact::disk::PartitionScheme;
use crate::plan::{Architecture, BuildPlan, Compression, Filesystem};

/// Check if a command exists on the host's PATH.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Host tools every build needs. Each tuple is (command, package).
pub const BASE_TOOLS: &[(&str, &str)] = &[
    ("mmdebstrap", "mmdebstrap"),
    ("chroot", "coreutils"),
    ("cp", "coreutils"),
    ("dd", "coreutils"),
    ("sfdisk", "fdisk"),
];

/// Tools the given plan will invoke, without repeats.
pub fn required_tools(plan: &BuildPlan) -> Vec<(&'static str, &'static str)> {
    let mut tools: Vec<(&'static str, &'static str)> = BASE_TOOLS.to_vec();

    tools.push(match plan.filesystem() {
        Filesystem::Ext4 => ("mkfs.ext4", "e2fsprogs"),
        Filesystem::Btrfs => ("mkfs.btrfs", "btrfs-progs"),
    });
    if PartitionScheme::for_architecture(plan.architecture()) == PartitionScheme::Gpt {
        tools.push(("mkfs.vfat", "dosfstools"));
        tools.push(("mmd", "mtools"));
        tools.push(("mcopy", "mtools"));
    }
    match plan.architecture() {
        Architecture::Amd64 | Architecture::Arm64 => tools.push(("grub-install", "grub2-common")),
        Architecture::Armhf => tools.push(("mkimage", "u-boot-tools")),
        Architecture::Mips | Architecture::Mipsel => {}
    }
    if plan.architecture().is_foreign() {
        tools.push(qemu_user(plan.architecture()));
    }
    match plan.compression() {
        Compression::Xz => tools.push(("xz", "xz-utils")),
        Compression::Gzip => tools.push(("gzip", "gzip")),
        Compression::Zstd | Compression::None => {}
    }

    let mut unique = Vec::with_capacity(tools.len());
    for tool in tools {
        if !unique.contains(&tool) {
            unique.push(tool);
        }
    }
    unique
}

fn qemu_user(arch: Architecture) -> (&'static str, &'static str) {
    let binary = match arch {
        Architecture::Amd64 => "qemu-x86_64-static",
        Architecture::Arm64 => "qemu-aarch64-static",
        Architecture::Armhf => "qemu-arm-static",
        Architecture::Mips => "qemu-mips-static",
        Architecture::Mipsel => "qemu-mipsel-static",
    };
    (binary, "qemu-user-static")
}

/// Check that specific tools are available.
///
/// Returns an error listing every missing tool and the package that provides it.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<&(&str, &str)> = tools.iter().filter(|(tool, _)| !command_exists(tool)).collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Full preflight for a plan. Running as non-root is only a warning because
/// the tools may be wrapped (fakeroot, unshare).
pub fn check_host(plan: &BuildPlan) -> Result<()> {
    if !is_root() {
        warn!("not running as root; mmdebstrap, chroot and grub-install usually need it");
    }
    check_required_tools(&required_tools(plan))
}

pub fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}
