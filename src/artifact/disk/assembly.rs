//! Partition table creation and partition splicing.

use std::path::Path;

use anyhow::Result;

use super::helpers::{
    DiskUuids, PartitionScheme, ESP_SIZE, FIRST_PARTITION_OFFSET, MIB, SECTOR_SIZE,
};
use super::partitions::create_sparse;
use crate::tools::{run_checked, ToolInvocation, ToolRunner};

const STAGE: &str = "image-assemble";

/// Byte offsets of the partitions on the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskLayout {
    pub scheme: PartitionScheme,
    pub esp_offset: Option<u64>,
    pub root_offset: u64,
    pub root_size: u64,
}

impl DiskLayout {
    pub fn new(scheme: PartitionScheme, root_size: u64) -> Self {
        match scheme {
            PartitionScheme::Mbr => Self {
                scheme,
                esp_offset: None,
                root_offset: FIRST_PARTITION_OFFSET,
                root_size,
            },
            PartitionScheme::Gpt => Self {
                scheme,
                esp_offset: Some(FIRST_PARTITION_OFFSET),
                root_offset: FIRST_PARTITION_OFFSET + ESP_SIZE,
                root_size,
            },
        }
    }

    /// Script fed to `sfdisk` on stdin.
    pub fn sfdisk_script(&self, uuids: &DiskUuids) -> String {
        let sectors = |bytes: u64| bytes / SECTOR_SIZE;
        match self.scheme {
            PartitionScheme::Mbr => format!(
                "label: dos\nlabel-id: 0x{}\nstart={}, size={}, type=83, bootable\n",
                uuids.disk_id,
                sectors(self.root_offset),
                sectors(self.root_size),
            ),
            PartitionScheme::Gpt => format!(
                "label: gpt\n\
                 start={}, size={}, type=U, name=\"EFI\"\n\
                 start={}, size={}, type=L, uuid={}, name=\"root\"\n",
                sectors(FIRST_PARTITION_OFFSET),
                sectors(ESP_SIZE),
                sectors(self.root_offset),
                sectors(self.root_size),
                uuids.root_part_uuid.to_uppercase(),
            ),
        }
    }
}

/// Sparse disk of `disk_bytes` with its partition table written.
pub fn create_disk(
    tools: &dyn ToolRunner,
    disk_path: &Path,
    disk_bytes: u64,
    layout: &DiskLayout,
    uuids: &DiskUuids,
) -> Result<()> {
    create_sparse(disk_path, disk_bytes)?;
    run_checked(
        tools,
        STAGE,
        &ToolInvocation::new("sfdisk")
            .arg("--quiet")
            .arg_path(disk_path)
            .stdin(layout.sfdisk_script(uuids)),
    )?;
    Ok(())
}

/// Copy a partition image into the disk at `offset` without truncating it.
pub fn splice(tools: &dyn ToolRunner, disk_path: &Path, image: &Path, offset: u64) -> Result<()> {
    run_checked(
        tools,
        STAGE,
        &ToolInvocation::new("dd")
            .arg(format!("if={}", image.display()))
            .arg(format!("of={}", disk_path.display()))
            .args(["bs=1M", "conv=notrunc,sparse", "status=none"])
            .arg(format!("seek={}", offset / MIB)),
    )?;
    Ok(())
}
