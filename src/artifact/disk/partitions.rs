//! Root and EFI partition images, populated without mounting.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use super::helpers::{DiskUuids, ESP_SIZE};
use super::mtools;
use crate::plan::Filesystem;
use crate::tools::{run_checked, ToolInvocation, ToolRunner};

const STAGE: &str = "image-assemble";

/// Sparse file of `size_bytes`.
pub fn create_sparse(path: &Path, size_bytes: u64) -> Result<()> {
    let file = fs::File::create(path).with_context(|| format!("creating '{}'", path.display()))?;
    file.set_len(size_bytes)
        .with_context(|| format!("sizing '{}' to {} bytes", path.display(), size_bytes))?;
    Ok(())
}

/// Root filesystem image populated from `rootfs` (`mkfs.ext4 -d` or
/// `mkfs.btrfs --rootdir`).
pub fn create_root_partition(
    tools: &dyn ToolRunner,
    filesystem: Filesystem,
    rootfs: &Path,
    image_path: &Path,
    size_bytes: u64,
    uuids: &DiskUuids,
) -> Result<()> {
    create_sparse(image_path, size_bytes)?;
    let invocation = match filesystem {
        Filesystem::Ext4 => ToolInvocation::new("mkfs.ext4")
            .args(["-q", "-F", "-L", "root", "-U"])
            .arg(&uuids.root_fs_uuid)
            .arg("-d")
            .arg_path(rootfs)
            .arg_path(image_path),
        Filesystem::Btrfs => ToolInvocation::new("mkfs.btrfs")
            .args(["-q", "-f", "-L", "root", "-U"])
            .arg(&uuids.root_fs_uuid)
            .arg("--rootdir")
            .arg_path(rootfs)
            .arg_path(image_path),
    };
    run_checked(tools, STAGE, &invocation)?;
    Ok(())
}

/// FAT32 ESP holding whatever the bootloader staged under `staging`.
pub fn create_efi_partition(
    tools: &dyn ToolRunner,
    image_path: &Path,
    uuids: &DiskUuids,
    staging: &Path,
) -> Result<()> {
    create_sparse(image_path, ESP_SIZE)?;
    let volume_id = uuids.efi_fs_serial.replace('-', "");
    run_checked(
        tools,
        STAGE,
        &ToolInvocation::new("mkfs.vfat")
            .args(["-F", "32", "-n", "EFI", "-i"])
            .arg(volume_id)
            .arg_path(image_path),
    )?;
    mtools::mtools_copy_tree(tools, image_path, staging)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::test_plan;
    use crate::tools::testing::FakeTools;
    use tempfile::TempDir;

    #[test]
    fn test_root_partition_uses_filesystem_tool() {
        let temp = TempDir::new().unwrap();
        let uuids = DiskUuids::derive(&test_plan(""));
        let tools = FakeTools::new();
        let image = temp.path().join("root.img");

        create_root_partition(&tools, Filesystem::Btrfs, temp.path(), &image, 4 * 1024 * 1024, &uuids)
            .unwrap();

        assert_eq!(fs::metadata(&image).unwrap().len(), 4 * 1024 * 1024);
        let calls = tools.calls();
        let call = &calls[0];
        assert_eq!(call.program(), "mkfs.btrfs");
        assert!(call.arguments().contains(&"--rootdir".to_string()));
        assert!(call.arguments().contains(&uuids.root_fs_uuid));
    }

    #[test]
    fn test_efi_partition_volume_id_has_no_dash() {
        let temp = TempDir::new().unwrap();
        let uuids = DiskUuids::derive(&test_plan(""));
        let tools = FakeTools::new();
        create_efi_partition(&tools, &temp.path().join("efi.img"), &uuids, &temp.path().join("esp"))
            .unwrap();
        let calls = tools.calls();
        let call = &calls[0];
        assert_eq!(call.program(), "mkfs.vfat");
        assert!(call.arguments().iter().any(|a| a.len() == 8 && !a.contains('-')));
    }
}
