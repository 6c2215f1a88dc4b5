//! Raw disk image assembly.
//!
//! The installed rootfs is copied into scratch space, given an fstab and a
//! bootloader, packed into a filesystem image and spliced into a sparse disk
//! behind an MBR or GPT table. Nothing is mounted and no loop devices are used.

pub mod assembly;
pub mod helpers;
pub mod mtools;
pub mod partitions;

pub use helpers::{
    boot_files, bootloader_packages, check_bootloader, minimum_image_size, DiskUuids,
    PartitionScheme, KERNEL_LINKS,
};

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::artifact::filesystem::{dir_size, exists_in_root, remove_path, write_json_atomic};
use crate::error::BuildError;
use crate::plan::{Architecture, Filesystem};
use crate::stages::StageContext;
use crate::tools::{run_checked, ToolInvocation, ToolRunner};
use crate::workspace::Workspace;
use assembly::DiskLayout;
use helpers::root_partition_size;

const RECORD_FILENAME: &str = "image.json";
const STAGE: &str = "image-assemble";

/// The assembled disk image and what went into it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageArtifact {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub rootfs_bytes: u64,
    pub scheme: PartitionScheme,
    pub filesystem: String,
    pub uuids: DiskUuids,
    pub fstab: String,
    pub bootloader: Option<String>,
    /// Boot path files present in the image tree, rootfs-relative.
    #[serde(default)]
    pub boot_files: Vec<PathBuf>,
}

pub fn record_path(ws: &Workspace) -> PathBuf {
    ws.state_dir().join(RECORD_FILENAME)
}

pub fn read_record(ws: &Workspace) -> Result<Option<ImageArtifact>> {
    let path = record_path(ws);
    if !path.is_file() {
        return Ok(None);
    }
    let bytes = fs::read(&path).with_context(|| format!("reading '{}'", path.display()))?;
    let record = serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing image record '{}'", path.display()))?;
    Ok(Some(record))
}

/// Fails with [`BuildError::InsufficientSize`] before any tool runs when the
/// declared size cannot hold the rootfs plus margin.
pub fn assemble(ctx: &StageContext<'_>) -> Result<ImageArtifact> {
    let plan = ctx.plan;
    let ws = ctx.workspace;
    check_bootloader(plan, &ctx.packages)?;

    let rootfs = ws.rootfs_dir();
    let rootfs_bytes = dir_size(&rootfs)?;
    let scheme = PartitionScheme::for_architecture(plan.architecture());
    let required = minimum_image_size(rootfs_bytes, scheme);
    let declared = plan.image_size().bytes();
    if declared < required {
        return Err(BuildError::InsufficientSize { declared, required }.into());
    }

    let work = ws.image_work_dir();
    remove_path(&work)?;
    fs::create_dir_all(&work).with_context(|| format!("creating '{}'", work.display()))?;

    info!(
        scheme = ?scheme,
        rootfs_mib = rootfs_bytes / helpers::MIB,
        image = %plan.image_size(),
        "assembling disk image"
    );
    let staged = work.join("rootfs");
    run_checked(
        ctx.tools,
        STAGE,
        &ToolInvocation::new("cp")
            .arg("-a")
            .arg_path(&rootfs)
            .arg_path(&staged),
    )?;

    let uuids = DiskUuids::derive(plan);
    let fstab = render_fstab(plan.filesystem(), scheme, &uuids);
    let fstab_path = staged.join("etc/fstab");
    if let Some(parent) = fstab_path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating '{}'", parent.display()))?;
    }
    fs::write(&fstab_path, &fstab)
        .with_context(|| format!("writing '{}'", fstab_path.display()))?;

    let layout = DiskLayout::new(scheme, root_partition_size(declared, scheme));
    let disk = work.join("disk.raw");
    assembly::create_disk(ctx.tools, &disk, declared, &layout, &uuids)?;

    let esp_staging = work.join("esp");
    let bootloader = install_bootloader(
        ctx.tools,
        plan.architecture(),
        &staged,
        &disk,
        &esp_staging,
        &uuids,
    )?;

    let boot_files: Vec<PathBuf> = helpers::boot_files(plan.architecture())
        .iter()
        .map(PathBuf::from)
        .filter(|relative| exists_in_root(&staged, relative))
        .collect();

    let root_image = work.join("root.img");
    partitions::create_root_partition(
        ctx.tools,
        plan.filesystem(),
        &staged,
        &root_image,
        layout.root_size,
        &uuids,
    )?;
    if let Some(esp_offset) = layout.esp_offset {
        let efi_image = work.join("efi.img");
        partitions::create_efi_partition(ctx.tools, &efi_image, &uuids, &esp_staging)?;
        assembly::splice(ctx.tools, &disk, &efi_image, esp_offset)?;
    }
    assembly::splice(ctx.tools, &disk, &root_image, layout.root_offset)?;

    fs::create_dir_all(ws.output_dir())
        .with_context(|| format!("creating '{}'", ws.output_dir().display()))?;
    let output = ws.output_dir().join(plan.image_filename());
    move_file(&disk, &output)?;
    remove_path(&work)?;

    let artifact = ImageArtifact {
        size_bytes: fs::metadata(&output)
            .with_context(|| format!("stat '{}'", output.display()))?
            .len(),
        path: output,
        rootfs_bytes,
        scheme,
        filesystem: plan.filesystem().as_str().to_string(),
        uuids,
        fstab,
        bootloader,
        boot_files,
    };
    write_json_atomic(&record_path(ws), &artifact)?;
    info!(image = %artifact.path.display(), "disk image written");
    Ok(artifact)
}

fn render_fstab(filesystem: Filesystem, scheme: PartitionScheme, uuids: &DiskUuids) -> String {
    let options = match filesystem {
        Filesystem::Ext4 => "defaults,noatime",
        Filesystem::Btrfs => "defaults,noatime,compress=zstd",
    };
    let mut fstab = format!(
        "# <file system> <mount point> <type> <options> <dump> <pass>\n\
         UUID={} / {} {} 0 1\n",
        uuids.root_fs_uuid,
        filesystem.as_str(),
        options
    );
    if scheme == PartitionScheme::Gpt {
        fstab.push_str(&format!(
            "UUID={} /boot/efi vfat umask=0077 0 2\n",
            uuids.efi_fs_serial
        ));
    }
    fstab.push_str("tmpfs /tmp tmpfs defaults,nosuid,nodev 0 0\n");
    fstab
}

fn grub_config(uuids: &DiskUuids, console: &str) -> String {
    format!(
        "set timeout=3\n\
         set default=0\n\n\
         menuentry \"Fry IoT\" {{\n\
         \tsearch --no-floppy --fs-uuid --set=root {uuid}\n\
         \tlinux /vmlinuz root=UUID={uuid} ro console={console} console=tty0 quiet\n\
         \tinitrd /initrd.img\n\
         }}\n",
        uuid = uuids.root_fs_uuid,
        console = console,
    )
}

/// Architecture-specific boot path. Returns the bootloader name, if any.
fn install_bootloader(
    tools: &dyn ToolRunner,
    arch: Architecture,
    staged: &Path,
    disk: &Path,
    esp_staging: &Path,
    uuids: &DiskUuids,
) -> Result<Option<String>> {
    let boot = staged.join("boot");
    match arch {
        Architecture::Amd64 => {
            write_boot_file(&boot.join("grub/grub.cfg"), &grub_config(uuids, "ttyS0,115200"))?;
            run_checked(
                tools,
                STAGE,
                &ToolInvocation::new("grub-install")
                    .args(["--target=i386-pc", "--force", "--modules=part_msdos ext2 btrfs"])
                    .arg(format!("--boot-directory={}", boot.display()))
                    .arg_path(disk),
            )?;
            Ok(Some("grub-pc".to_string()))
        }
        Architecture::Arm64 => {
            write_boot_file(&boot.join("grub/grub.cfg"), &grub_config(uuids, "ttyAMA0,115200"))?;
            fs::create_dir_all(esp_staging)
                .with_context(|| format!("creating '{}'", esp_staging.display()))?;
            fs::create_dir_all(staged.join("boot/efi"))
                .with_context(|| format!("creating '{}'", staged.join("boot/efi").display()))?;
            run_checked(
                tools,
                STAGE,
                &ToolInvocation::new("grub-install")
                    .args(["--target=arm64-efi", "--removable", "--no-nvram"])
                    .arg(format!("--efi-directory={}", esp_staging.display()))
                    .arg(format!("--boot-directory={}", boot.display())),
            )?;
            Ok(Some("grub-efi-arm64".to_string()))
        }
        Architecture::Armhf => {
            let script = boot.join("boot.cmd");
            write_boot_file(
                &script,
                &format!(
                    "setenv bootargs root=UUID={} rootwait ro console=ttyS0,115200\n\
                     load ${{devtype}} ${{devnum}}:${{distro_bootpart}} ${{kernel_addr_r}} /vmlinuz\n\
                     load ${{devtype}} ${{devnum}}:${{distro_bootpart}} ${{ramdisk_addr_r}} /initrd.img\n\
                     bootz ${{kernel_addr_r}} ${{ramdisk_addr_r}}:${{filesize}} ${{fdtcontroladdr}}\n",
                    uuids.root_fs_uuid
                ),
            )?;
            run_checked(
                tools,
                STAGE,
                &ToolInvocation::new("mkimage")
                    .args(["-A", "arm", "-T", "script", "-C", "none", "-d"])
                    .arg_path(&script)
                    .arg_path(&boot.join("boot.scr")),
            )?;
            Ok(Some("u-boot".to_string()))
        }
        Architecture::Mips | Architecture::Mipsel => Ok(None),
    }
}

fn write_boot_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating '{}'", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("writing '{}'", path.display()))
}

fn move_file(from: &Path, to: &Path) -> Result<()> {
    remove_path(to)?;
    fs::rename(from, to)
        .or_else(|_| {
            // Cross-filesystem: copy then remove
            fs::copy(from, to)?;
            fs::remove_file(from)
        })
        .with_context(|| format!("moving '{}' to '{}'", from.display(), to.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{test_plan, BuildPlan};
    use crate::stages::StageOptions;
    use crate::tools::testing::FakeTools;
    use tempfile::TempDir;

    fn seeded(temp: &TempDir, plan: &BuildPlan) -> Workspace {
        let ws = Workspace::new(temp.path(), plan);
        fs::create_dir_all(ws.rootfs_dir().join("etc")).unwrap();
        fs::write(ws.rootfs_dir().join("etc/hostname"), "fry\n").unwrap();
        fs::create_dir_all(ws.state_dir()).unwrap();
        ws
    }

    #[test]
    fn test_undersized_image_fails_before_partitioning() {
        let temp = TempDir::new().unwrap();
        let plan = test_plan(
            "[build]\nimage_size = \"1G\"\n[packages]\ninclude = [\"grub-pc\"]\n",
        );
        let ws = seeded(&temp, &plan);
        // 1.25 GiB of apparent rootfs content pushes the minimum to ~1.5 GiB.
        let big = fs::File::create(ws.rootfs_dir().join("big.bin")).unwrap();
        big.set_len(1280 * helpers::MIB).unwrap();
        let tools = FakeTools::new();
        let ctx = StageContext::prepare(&plan, &ws, &tools, None, StageOptions::default()).unwrap();

        let err = assemble(&ctx).unwrap_err();
        match err.downcast_ref::<BuildError>() {
            Some(BuildError::InsufficientSize { declared, required }) => {
                assert_eq!(*declared, 1024 * helpers::MIB);
                assert!(*required > 1536 * helpers::MIB);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(tools.calls().is_empty());
    }

    #[test]
    fn test_amd64_mbr_image() {
        let temp = TempDir::new().unwrap();
        let plan = test_plan(
            "[build]\nimage_size = \"512M\"\n[packages]\ninclude = [\"grub-pc\"]\n",
        );
        let ws = seeded(&temp, &plan);
        let tools = FakeTools::new();
        let ctx = StageContext::prepare(&plan, &ws, &tools, None, StageOptions::default()).unwrap();

        let artifact = assemble(&ctx).unwrap();

        assert_eq!(artifact.scheme, PartitionScheme::Mbr);
        assert_eq!(artifact.size_bytes, 512 * helpers::MIB);
        assert_eq!(artifact.bootloader.as_deref(), Some("grub-pc"));
        assert_eq!(artifact.boot_files, vec![PathBuf::from("boot/grub/grub.cfg")]);
        assert!(artifact.path.exists());
        assert!(artifact.fstab.contains(&artifact.uuids.root_fs_uuid));
        assert!(!ws.image_work_dir().exists());
        assert_eq!(read_record(&ws).unwrap(), Some(artifact));

        let programs = tools.programs();
        let sfdisk = programs.iter().position(|p| p == "sfdisk").unwrap();
        let mkfs = programs.iter().position(|p| p == "mkfs.ext4").unwrap();
        let grub = programs.iter().position(|p| p == "grub-install").unwrap();
        assert!(sfdisk < grub && grub < mkfs);
        assert!(!programs.iter().any(|p| p == "mkfs.vfat"));
        let calls = tools.calls();
        let sfdisk_call = &calls[sfdisk];
        assert!(sfdisk_call.input().unwrap().starts_with("label: dos"));
    }

    #[test]
    fn test_arm64_gets_gpt_and_esp() {
        let temp = TempDir::new().unwrap();
        let plan = test_plan(
            "[build]\narchitecture = \"arm64\"\nimage_size = \"1G\"\n[packages]\ninclude = [\"grub-efi-arm64\"]\n",
        );
        let ws = seeded(&temp, &plan);
        let tools = FakeTools::new();
        let ctx = StageContext::prepare(&plan, &ws, &tools, None, StageOptions::default()).unwrap();

        let artifact = assemble(&ctx).unwrap();

        assert_eq!(artifact.scheme, PartitionScheme::Gpt);
        assert!(artifact.fstab.contains("/boot/efi vfat"));
        let programs = tools.programs();
        assert!(programs.iter().any(|p| p == "mkfs.vfat"));
        assert_eq!(programs.iter().filter(|p| *p == "dd").count(), 2);
    }

    #[test]
    fn test_mips_needs_no_bootloader() {
        let temp = TempDir::new().unwrap();
        let plan = test_plan("[build]\narchitecture = \"mipsel\"\nimage_size = \"512M\"\n");
        let ws = seeded(&temp, &plan);
        let tools = FakeTools::new();
        let ctx = StageContext::prepare(&plan, &ws, &tools, None, StageOptions::default()).unwrap();

        let artifact = assemble(&ctx).unwrap();
        assert_eq!(artifact.bootloader, None);
        assert!(artifact.boot_files.is_empty());
        assert!(!tools.programs().iter().any(|p| p == "grub-install"));
    }

    #[test]
    fn test_armhf_records_uboot_script() {
        let temp = TempDir::new().unwrap();
        let plan = test_plan(
            "[build]\narchitecture = \"armhf\"\nimage_size = \"512M\"\n[packages]\ninclude = [\"u-boot-tools\"]\n",
        );
        let ws = seeded(&temp, &plan);
        let tools = FakeTools::new();
        let ctx = StageContext::prepare(&plan, &ws, &tools, None, StageOptions::default()).unwrap();

        let artifact = assemble(&ctx).unwrap();
        assert_eq!(artifact.bootloader.as_deref(), Some("u-boot"));
        assert_eq!(
            artifact.boot_files,
            vec![PathBuf::from("boot/boot.cmd"), PathBuf::from("boot/boot.scr")]
        );
    }
}
