//! Compressed image, checksums and the release manifest for the upload tool.

use std::fs::{self, File};
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tar::Builder as TarBuilder;
use tracing::info;
use walkdir::WalkDir;

use super::{StageContext, StageId};
use crate::artifact::filesystem::{remove_path, sha256_file, write_atomic, write_json_atomic};
use crate::plan::{BuildPlan, Compression};
use crate::tools::{run_checked, ToolInvocation};
use crate::workspace::{now_utc_compact, Workspace};

pub const CHECKSUMS_FILENAME: &str = "SHA256SUMS";
pub const MANIFEST_FILENAME: &str = "manifest.json";

const ZSTD_LEVEL: i32 = 19;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestImage {
    pub filename: String,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseManifest {
    pub name: String,
    pub version: String,
    pub codename: String,
    pub architecture: String,
    pub build_date: String,
    pub suite: String,
    pub images: Vec<ManifestImage>,
}

/// The file handed to the upload tool: the compressed image, or the raw
/// image when compression is `none`.
pub fn published_image(plan: &BuildPlan, ws: &Workspace) -> PathBuf {
    let raw = ws.output_dir().join(plan.image_filename());
    match plan.compression().extension() {
        Some(ext) => ws
            .output_dir()
            .join(format!("{}.{}", plan.image_filename(), ext)),
        None => raw,
    }
}

pub(super) fn outputs(plan: &BuildPlan, ws: &Workspace) -> Vec<PathBuf> {
    let mut outputs = Vec::with_capacity(3);
    // With `none` the published file belongs to image-assemble.
    if plan.compression() != Compression::None {
        outputs.push(published_image(plan, ws));
    }
    outputs.push(ws.output_dir().join(CHECKSUMS_FILENAME));
    outputs.push(ws.output_dir().join(MANIFEST_FILENAME));
    outputs
}

pub(super) fn run(ctx: &StageContext<'_>) -> Result<()> {
    let plan = ctx.plan;
    let ws = ctx.workspace;
    let raw = ws.output_dir().join(plan.image_filename());
    let published = published_image(plan, ws);
    let stage = StageId::Compress.slug();

    match plan.compression() {
        Compression::Xz => {
            run_checked(
                ctx.tools,
                stage,
                &ToolInvocation::new("xz")
                    .args(["-k", "-f", "-9", "-T0"])
                    .arg_path(&raw),
            )?;
        }
        Compression::Gzip => {
            run_checked(
                ctx.tools,
                stage,
                &ToolInvocation::new("gzip").args(["-k", "-f", "-9"]).arg_path(&raw),
            )?;
        }
        Compression::Zstd => zstd_file(&raw, &published)?,
        Compression::None => {}
    }

    let sha256 = sha256_file(&published)?;
    let size = fs::metadata(&published)
        .with_context(|| format!("stat '{}'", published.display()))?
        .len();
    let filename = file_name(&published)?;

    write_atomic(
        &ws.output_dir().join(CHECKSUMS_FILENAME),
        format!("{}  {}\n", sha256, filename).as_bytes(),
    )?;

    let id = plan.identity();
    let manifest = ReleaseManifest {
        name: id.os_name.clone(),
        version: id.os_version.clone(),
        codename: id.codename.clone(),
        architecture: plan.architecture().to_string(),
        build_date: now_utc_compact(),
        suite: plan.debian().suite.clone(),
        images: vec![ManifestImage {
            filename: filename.clone(),
            size,
            sha256,
        }],
    };
    write_json_atomic(&ws.output_dir().join(MANIFEST_FILENAME), &manifest)?;
    info!(image = %filename, size, "published image ready");
    Ok(())
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .with_context(|| format!("no file name in '{}'", path.display()))
}

fn zstd_file(input: &Path, output: &Path) -> Result<()> {
    let source =
        File::open(input).with_context(|| format!("opening '{}'", input.display()))?;
    let tmp = output.with_extension("zst.partial");
    let target = File::create(&tmp).with_context(|| format!("creating '{}'", tmp.display()))?;
    zstd::stream::copy_encode(source, target, ZSTD_LEVEL)
        .with_context(|| format!("compressing '{}'", input.display()))?;
    fs::rename(&tmp, output)
        .with_context(|| format!("renaming '{}' to '{}'", tmp.display(), output.display()))?;
    Ok(())
}

pub fn rootfs_archive_path(plan: &BuildPlan, ws: &Workspace) -> PathBuf {
    ws.output_dir()
        .join(format!("{}-rootfs.tar.zst", plan.profile()))
}

/// Export the finished rootfs as `<profile>-rootfs.tar.zst` next to the image.
pub fn export_rootfs_archive(plan: &BuildPlan, ws: &Workspace) -> Result<PathBuf> {
    let rootfs = ws.rootfs_dir();
    anyhow::ensure!(
        rootfs.is_dir(),
        "no rootfs at '{}'; run `fry-builder rootfs` first",
        rootfs.display()
    );
    fs::create_dir_all(ws.output_dir())
        .with_context(|| format!("creating '{}'", ws.output_dir().display()))?;
    let out_path = rootfs_archive_path(plan, ws);
    let tmp = out_path.with_extension("partial");
    if let Err(err) = write_tar_zst(&rootfs, &tmp) {
        remove_path(&tmp)?;
        return Err(err);
    }
    fs::rename(&tmp, &out_path).with_context(|| {
        format!("renaming '{}' to '{}'", tmp.display(), out_path.display())
    })?;
    info!(archive = %out_path.display(), "rootfs archive written");
    Ok(out_path)
}

fn write_tar_zst(src_dir: &Path, out_path: &Path) -> Result<()> {
    let out = File::create(out_path)
        .with_context(|| format!("creating '{}'", out_path.display()))?;
    let encoder = zstd::stream::Encoder::new(out, 3)?;
    let mut builder = TarBuilder::new(encoder);

    for entry in WalkDir::new(src_dir)
        .follow_links(false)
        .sort_by_file_name()
        .min_depth(1)
    {
        let entry = entry.with_context(|| format!("walking '{}'", src_dir.display()))?;
        let path = entry.path();
        let rel = path
            .strip_prefix(src_dir)
            .with_context(|| format!("relativizing '{}'", path.display()))?;
        let md = fs::symlink_metadata(path)
            .with_context(|| format!("stat '{}'", path.display()))?;

        let mut header = tar::Header::new_gnu();
        header.set_mtime(md.mtime().max(0) as u64);
        header.set_uid(md.uid() as u64);
        header.set_gid(md.gid() as u64);
        header.set_mode(md.permissions().mode());

        if md.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_cksum();
            builder.append_data(&mut header, rel, io::empty())?;
        } else if md.file_type().is_symlink() {
            let target = fs::read_link(path)?;
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_link_name(&target)?;
            header.set_cksum();
            builder.append_data(&mut header, rel, io::empty())?;
        } else if md.is_file() {
            let mut file = File::open(path)?;
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(md.len());
            header.set_cksum();
            builder.append_data(&mut header, rel, &mut file)?;
        }
    }

    let encoder = builder
        .into_inner()
        .context("finalizing rootfs tar stream")?;
    encoder.finish()?;
    Ok(())
}
