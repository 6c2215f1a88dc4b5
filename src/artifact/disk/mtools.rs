//! mtools operations on a FAT image, without mounting it.

use std::path::Path;

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::tools::{run_checked, ToolInvocation, ToolRunner};

const STAGE: &str = "image-assemble";

/// Create a directory in a FAT image using mmd.
pub fn mtools_mkdir(tools: &dyn ToolRunner, image: &Path, dir: &str) -> Result<()> {
    run_checked(
        tools,
        STAGE,
        &ToolInvocation::new("mmd")
            .arg("-i")
            .arg_path(image)
            .arg(format!("::{}", dir)),
    )?;
    Ok(())
}

/// Copy a file into a FAT image using mcopy.
pub fn mtools_copy(tools: &dyn ToolRunner, image: &Path, src: &Path, dest: &str) -> Result<()> {
    run_checked(
        tools,
        STAGE,
        &ToolInvocation::new("mcopy")
            .arg("-i")
            .arg_path(image)
            .arg_path(src)
            .arg(format!("::{}", dest)),
    )?;
    Ok(())
}

/// Mirror a directory tree into the root of a FAT image.
pub fn mtools_copy_tree(tools: &dyn ToolRunner, image: &Path, src: &Path) -> Result<()> {
    if !src.is_dir() {
        return Ok(());
    }
    for entry in WalkDir::new(src).sort_by_file_name().min_depth(1) {
        let entry = entry.with_context(|| format!("walking '{}'", src.display()))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .with_context(|| format!("relativizing '{}'", entry.path().display()))?
            .to_string_lossy()
            .into_owned();
        if entry.file_type().is_dir() {
            mtools_mkdir(tools, image, &relative)?;
        } else if entry.file_type().is_file() {
            mtools_copy(tools, image, entry.path(), &relative)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::FakeTools;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_copy_tree_creates_dirs_before_files() {
        let temp = TempDir::new().unwrap();
        let staging = temp.path().join("esp");
        fs::create_dir_all(staging.join("EFI/BOOT")).unwrap();
        fs::write(staging.join("EFI/BOOT/BOOTAA64.EFI"), "efi").unwrap();
        let tools = FakeTools::new();

        mtools_copy_tree(&tools, &temp.path().join("efi.img"), &staging).unwrap();

        let calls = tools.calls();
        let rendered: Vec<String> = calls.iter().map(|c| c.to_string()).collect();
        assert_eq!(calls.len(), 3);
        assert!(rendered[0].starts_with("mmd") && rendered[0].ends_with("::EFI"));
        assert!(rendered[1].ends_with("::EFI/BOOT"));
        assert!(rendered[2].starts_with("mcopy") && rendered[2].ends_with("::EFI/BOOT/BOOTAA64.EFI"));
    }

    #[test]
    fn test_missing_staging_is_noop() {
        let temp = TempDir::new().unwrap();
        let tools = FakeTools::new();
        mtools_copy_tree(&tools, &temp.path().join("efi.img"), &temp.path().join("none")).unwrap();
        assert!(tools.calls().is_empty());
    }
}
