//! Filesystem helpers shared by the stages.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Recursively copy a directory, preserving symlinks and file modes.
///
/// Existing files in `dst` are overwritten. Used for profile overlays, not for
/// root filesystems (those go through `cp -a` so device nodes survive).
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    if !dst.exists() {
        fs::create_dir_all(dst)
            .with_context(|| format!("Failed to create directory: {}", dst.display()))?;
    }

    for entry in fs::read_dir(src)
        .with_context(|| format!("Failed to read directory: {}", src.display()))?
    {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_symlink() {
            let target = fs::read_link(&src_path)?;
            if dst_path.exists() || dst_path.is_symlink() {
                fs::remove_file(&dst_path)?;
            }
            std::os::unix::fs::symlink(&target, &dst_path)
                .with_context(|| format!("Failed to create symlink: {}", dst_path.display()))?;
        } else if file_type.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)
                .with_context(|| format!("Failed to copy file: {}", src_path.display()))?;
        }
    }

    Ok(())
}

/// Rootfs-relative paths of every regular file and symlink under `root`, sorted.
pub fn list_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking '{}'", root.display()))?;
        if entry.file_type().is_dir() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("relativizing '{}'", entry.path().display()))?;
        files.push(relative.to_path_buf());
    }
    Ok(files)
}

/// Total apparent size of all regular files below `path`. Symlinks are not followed.
pub fn dir_size(path: &Path) -> Result<u64> {
    let mut total = 0u64;
    for entry in WalkDir::new(path) {
        let entry = entry.with_context(|| format!("walking '{}'", path.display()))?;
        if entry.file_type().is_file() {
            total += entry
                .metadata()
                .with_context(|| format!("stat '{}'", entry.path().display()))?
                .len();
        }
    }
    Ok(total)
}

/// Hex SHA-256 of a file, streamed in 1 MiB chunks.
pub fn sha256_file(path: &Path) -> Result<String> {
    let file =
        fs::File::open(path).with_context(|| format!("opening '{}' for hashing", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let read = reader
            .read(&mut buf)
            .with_context(|| format!("reading '{}' for hashing", path.display()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Hash of every file path and content below `root`; empty string hash when absent.
pub fn tree_digest(root: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    if root.is_dir() {
        for relative in list_files(root)? {
            let full = root.join(&relative);
            hasher.update(relative.to_string_lossy().as_bytes());
            hasher.update([0u8]);
            if full.is_symlink() {
                let target = fs::read_link(&full)
                    .with_context(|| format!("reading link '{}'", full.display()))?;
                hasher.update(target.to_string_lossy().as_bytes());
            } else {
                hasher.update(sha256_file(&full)?.as_bytes());
            }
            hasher.update([0u8]);
        }
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Serialize `value` as pretty JSON and move it into place atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let payload = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serializing '{}'", path.display()))?;
    write_atomic(path, &payload)
}

/// Write bytes through a temp file in the same directory, then rename.
pub fn write_atomic(path: &Path, payload: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("path without parent '{}'", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("creating parent directory '{}'", parent.display()))?;
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    fs::write(&tmp, payload).with_context(|| format!("writing temp file '{}'", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "renaming temp file '{}' to '{}'",
            tmp.display(),
            path.display()
        )
    })?;
    Ok(())
}

/// Remove a file, symlink or directory tree. Missing paths are fine.
/// Whether `relative` exists under `root`. Symlinks are resolved against
/// `root`, never against the host.
pub fn exists_in_root(root: &Path, relative: &Path) -> bool {
    let mut path = root.join(relative);
    for _ in 0..16 {
        let Ok(meta) = fs::symlink_metadata(&path) else {
            return false;
        };
        if !meta.file_type().is_symlink() {
            return true;
        }
        let Ok(target) = fs::read_link(&path) else {
            return false;
        };
        path = if target.is_absolute() {
            root.join(target.strip_prefix("/").unwrap_or(target.as_path()))
        } else {
            match path.parent() {
                Some(parent) => parent.join(target),
                None => return false,
            }
        };
    }
    false
}

pub fn remove_path(path: &Path) -> Result<()> {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return Ok(());
    };
    if meta.is_dir() {
        fs::remove_dir_all(path)
            .with_context(|| format!("removing directory '{}'", path.display()))
    } else {
        fs::remove_file(path).with_context(|| format!("removing '{}'", path.display()))
    }
}
