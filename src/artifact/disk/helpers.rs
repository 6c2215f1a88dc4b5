//! Partition scheme, bootloader requirements, sizing and UUIDs.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::BuildError;
use crate::packages::ResolvedPackages;
use crate::plan::{Architecture, BuildPlan};

pub const MIB: u64 = 1024 * 1024;
pub const SECTOR_SIZE: u64 = 512;

/// First partition starts at 1 MiB.
pub const FIRST_PARTITION_OFFSET: u64 = MIB;
/// Free space required on top of the rootfs content.
pub const SIZE_MARGIN: u64 = 256 * MIB;
pub const ESP_SIZE: u64 = 256 * MIB;
/// Room for the backup GPT at the end of the disk.
pub const GPT_TRAILER: u64 = MIB;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionScheme {
    /// Single bootable root partition.
    Mbr,
    /// ESP followed by the root partition.
    Gpt,
}

impl PartitionScheme {
    pub fn for_architecture(arch: Architecture) -> Self {
        match arch {
            Architecture::Arm64 => PartitionScheme::Gpt,
            Architecture::Amd64 | Architecture::Armhf | Architecture::Mips | Architecture::Mipsel => {
                PartitionScheme::Mbr
            }
        }
    }

    fn overhead(&self) -> u64 {
        match self {
            PartitionScheme::Mbr => FIRST_PARTITION_OFFSET,
            PartitionScheme::Gpt => FIRST_PARTITION_OFFSET + ESP_SIZE + GPT_TRAILER,
        }
    }
}

/// Packages that must be installed for the architecture's boot path.
/// MIPS boards boot through the vendor loader and need none.
pub fn bootloader_packages(arch: Architecture) -> &'static [&'static str] {
    match arch {
        Architecture::Amd64 => &["grub-pc"],
        Architecture::Arm64 => &["grub-efi-arm64"],
        Architecture::Armhf => &["u-boot-tools"],
        Architecture::Mips | Architecture::Mipsel => &[],
    }
}

/// Rootfs-relative files the boot path writes.
pub fn boot_files(arch: Architecture) -> &'static [&'static str] {
    match arch {
        Architecture::Amd64 | Architecture::Arm64 => &["boot/grub/grub.cfg"],
        Architecture::Armhf => &["boot/boot.cmd", "boot/boot.scr"],
        Architecture::Mips | Architecture::Mipsel => &[],
    }
}

/// Loaded by fixed path from every generated boot configuration.
pub const KERNEL_LINKS: &[&str] = &["vmlinuz", "initrd.img"];

pub fn check_bootloader(plan: &BuildPlan, packages: &ResolvedPackages) -> Result<(), BuildError> {
    let missing: Vec<String> = bootloader_packages(plan.architecture())
        .iter()
        .filter(|name| !packages.contains(name))
        .map(|name| name.to_string())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(BuildError::MissingBootloader {
            architecture: plan.architecture().to_string(),
            packages: missing,
        })
    }
}

/// Rootfs content plus margin plus partition overhead, rounded up to a MiB.
pub fn minimum_image_size(rootfs_bytes: u64, scheme: PartitionScheme) -> u64 {
    let raw = rootfs_bytes + SIZE_MARGIN + scheme.overhead();
    raw.div_ceil(MIB) * MIB
}

/// Bytes available to the root partition on a disk of `disk_bytes`.
pub fn root_partition_size(disk_bytes: u64, scheme: PartitionScheme) -> u64 {
    (disk_bytes.saturating_sub(scheme.overhead()) / MIB) * MIB
}

/// Identifiers baked into the partition table, filesystems and fstab.
///
/// Derived from the plan so two builds of the same plan produce the same
/// fstab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskUuids {
    pub root_fs_uuid: String,
    pub root_part_uuid: String,
    /// FAT volume serial, `XXXX-XXXX`.
    pub efi_fs_serial: String,
    /// MBR disk signature, 8 hex digits.
    pub disk_id: String,
}

impl DiskUuids {
    pub fn derive(plan: &BuildPlan) -> Self {
        let seed = format!(
            "{}\0{}\0{}\0{}\0{}",
            plan.profile(),
            plan.architecture(),
            plan.filesystem().as_str(),
            plan.image_size().bytes(),
            plan.identity().codename
        );
        let digest = |label: &str| -> [u8; 32] {
            let mut hasher = Sha256::new();
            hasher.update(label.as_bytes());
            hasher.update([0u8]);
            hasher.update(seed.as_bytes());
            let mut out = [0u8; 32];
            out.copy_from_slice(&hasher.finalize());
            out
        };
        let efi = digest("efi");
        let disk = digest("disk");
        Self {
            root_fs_uuid: format_uuid(&digest("root-fs")),
            root_part_uuid: format_uuid(&digest("root-part")),
            efi_fs_serial: format!(
                "{:02X}{:02X}-{:02X}{:02X}",
                efi[0], efi[1], efi[2], efi[3]
            ),
            disk_id: format!("{:02x}{:02x}{:02x}{:02x}", disk[0], disk[1], disk[2], disk[3]),
        }
    }
}

/// RFC 4122 layout with version 4 and variant bits set.
fn format_uuid(bytes: &[u8; 32]) -> String {
    let mut b = [0u8; 16];
    b.copy_from_slice(&bytes[..16]);
    b[6] = (b[6] & 0x0f) | 0x40;
    b[8] = (b[8] & 0x3f) | 0x80;
    let hex: String = b.iter().map(|byte| format!("{:02x}", byte)).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::resolve;
    use crate::plan::test_plan;

    #[test]
    fn test_scheme_per_architecture() {
        assert_eq!(PartitionScheme::for_architecture(Architecture::Amd64), PartitionScheme::Mbr);
        assert_eq!(PartitionScheme::for_architecture(Architecture::Mipsel), PartitionScheme::Mbr);
        assert_eq!(PartitionScheme::for_architecture(Architecture::Arm64), PartitionScheme::Gpt);
    }

    #[test]
    fn test_minimum_size_adds_margin_and_esp() {
        let rootfs = 1024 * MIB;
        assert_eq!(minimum_image_size(rootfs, PartitionScheme::Mbr), 1281 * MIB);
        assert_eq!(minimum_image_size(rootfs, PartitionScheme::Gpt), 1538 * MIB);
        assert_eq!(minimum_image_size(1, PartitionScheme::Mbr), 258 * MIB);
    }

    #[test]
    fn test_uuids_are_deterministic_and_well_formed() {
        let plan = test_plan("");
        let a = DiskUuids::derive(&plan);
        let b = DiskUuids::derive(&plan);
        assert_eq!(a, b);
        assert_eq!(a.root_fs_uuid.len(), 36);
        assert_eq!(&a.root_fs_uuid[14..15], "4");
        assert_ne!(a.root_fs_uuid, a.root_part_uuid);
        assert_eq!(a.efi_fs_serial.len(), 9);
        assert_eq!(a.disk_id.len(), 8);

        let other = DiskUuids::derive(&test_plan("[build]\nimage_size = \"8G\"\n"));
        assert_ne!(a.root_fs_uuid, other.root_fs_uuid);
    }

    #[test]
    fn test_boot_files_follow_boot_path() {
        assert_eq!(boot_files(Architecture::Amd64), &["boot/grub/grub.cfg"]);
        assert_eq!(boot_files(Architecture::Armhf).len(), 2);
        assert!(boot_files(Architecture::Mipsel).is_empty());
    }

    #[test]
    fn test_bootloader_check() {
        let plan = test_plan("[build]\narchitecture = \"arm64\"\n");
        let err = check_bootloader(&plan, &resolve(&plan)).unwrap_err();
        assert_eq!(
            err,
            BuildError::MissingBootloader {
                architecture: "arm64".to_string(),
                packages: vec!["grub-efi-arm64".to_string()],
            }
        );
        let plan = test_plan("[build]\narchitecture = \"arm64\"\n[packages]\ninclude = [\"grub-efi-arm64\"]\n");
        assert!(check_bootloader(&plan, &resolve(&plan)).is_ok());
        let plan = test_plan("[build]\narchitecture = \"mips\"\n");
        assert!(check_bootloader(&plan, &resolve(&plan)).is_ok());
    }
}
