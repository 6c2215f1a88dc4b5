//! Post-build validation.
//!
//! Inspects the installed rootfs, the image record and the published files,
//! and writes every finding to `validation.json`. Only fatal findings fail the
//! stage; warnings are logged and kept in the report.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::artifact::disk;
use crate::artifact::filesystem::{exists_in_root, sha256_file, write_json_atomic};
use crate::emulator::{self, SmokeOutcome};
use crate::error::{BuildError, ValidationFinding};
use crate::fry::{FRY_CONFIG_PATH, FRY_UNITS};
use crate::stages::compress::{published_image, CHECKSUMS_FILENAME, MANIFEST_FILENAME};
use crate::stages::{install_list, is_masked, wants_link, StageContext, DEVICE_INFO_PATH};
use crate::workspace::{now_utc_compact, Workspace};

pub const REPORT_FILENAME: &str = "validation.json";

const REQUIRED_TOP_LEVEL: &[&str] = &["bin", "etc", "lib", "usr", "var"];
const REQUIRED_FILES: &[&str] = &["etc/os-release", "etc/hostname", DEVICE_INFO_PATH];
const MANIFEST_KEYS: &[&str] = &[
    "name",
    "version",
    "codename",
    "architecture",
    "build_date",
    "suite",
    "images",
];
const SMALL_IMAGE_BYTES: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub profile: String,
    pub architecture: String,
    pub image: PathBuf,
    pub checked_at_utc: String,
    pub passed: bool,
    pub findings: Vec<ValidationFinding>,
}

impl ValidationReport {
    pub fn fatal_count(&self) -> usize {
        self.findings.iter().filter(|f| f.is_fatal()).count()
    }

    pub fn warning_count(&self) -> usize {
        self.findings.len() - self.fatal_count()
    }
}

pub fn report_path(ws: &Workspace) -> PathBuf {
    ws.output_dir().join(REPORT_FILENAME)
}

/// Run every check against the current workspace.
pub fn validate(ctx: &StageContext<'_>) -> Result<ValidationReport> {
    let plan = ctx.plan;
    let ws = ctx.workspace;
    let image = ws.output_dir().join(plan.image_filename());
    let mut findings = Vec::new();

    check_image(ctx, &image, &mut findings);
    check_rootfs(ctx, &mut findings)?;
    check_boot(ctx, &mut findings)?;
    check_units(ctx, &mut findings);
    check_checksums(ctx, &mut findings);
    check_manifest(ws, &mut findings);

    let kernel = plan.kernel_package();
    if !install_list(ctx).iter().any(|p| p == kernel) {
        findings.push(ValidationFinding::warning(
            "kernel",
            format!("kernel package `{}` is not in the installed package set", kernel),
        ));
    }

    if ctx.options.smoke_test && image.is_file() {
        match emulator::smoke_test(ctx.tools, plan.architecture(), &image)? {
            SmokeOutcome::Passed { matched } => {
                info!(matched = %matched, "smoke test passed");
            }
            SmokeOutcome::Failed { reason, tail } => {
                let mut message = reason;
                if !tail.is_empty() {
                    message.push_str("; last output: ");
                    message.push_str(&tail.join(" | "));
                }
                findings.push(ValidationFinding::fatal("smoke-test", message));
            }
            SmokeOutcome::Unsupported => findings.push(ValidationFinding::warning(
                "smoke-test",
                format!("no emulator boot path for {}", plan.architecture()),
            )),
        }
    }

    let passed = !findings.iter().any(ValidationFinding::is_fatal);
    Ok(ValidationReport {
        profile: plan.profile().to_string(),
        architecture: plan.architecture().to_string(),
        image,
        checked_at_utc: now_utc_compact(),
        passed,
        findings,
    })
}

/// Validate, write the report, and fail on any fatal finding.
pub(crate) fn run(ctx: &StageContext<'_>) -> Result<()> {
    let report = validate(ctx)?;
    for finding in &report.findings {
        if finding.is_fatal() {
            error!(check = %finding.check, "{}", finding.message);
        } else {
            warn!(check = %finding.check, "{}", finding.message);
        }
    }
    write_json_atomic(&report_path(ctx.workspace), &report)?;

    let fatal = report.fatal_count();
    if fatal > 0 {
        return Err(BuildError::ValidationFailed { fatal }.into());
    }
    info!(warnings = report.warning_count(), "validation passed");
    Ok(())
}

fn check_image(ctx: &StageContext<'_>, image: &Path, findings: &mut Vec<ValidationFinding>) {
    if !image.is_file() {
        findings.push(ValidationFinding::fatal(
            "image",
            format!("image not found at {}", image.display()),
        ));
        return;
    }
    let size = match fs::metadata(image) {
        Ok(meta) => meta.len(),
        Err(err) => {
            findings.push(ValidationFinding::fatal(
                "image-size",
                format!("cannot read size of {}: {}", image.display(), err),
            ));
            return;
        }
    };
    let declared = ctx.plan.image_size().bytes();
    if size > declared {
        findings.push(ValidationFinding::fatal(
            "image-size",
            format!("image is {} bytes, larger than the declared {} bytes", size, declared),
        ));
    } else if size < declared {
        findings.push(ValidationFinding::warning(
            "image-size",
            format!("image is {} bytes, smaller than the declared {} bytes", size, declared),
        ));
    }
    if size < SMALL_IMAGE_BYTES {
        findings.push(ValidationFinding::warning(
            "image-size",
            format!("image is only {} MiB", size / (1024 * 1024)),
        ));
    }
}

fn check_rootfs(ctx: &StageContext<'_>, findings: &mut Vec<ValidationFinding>) -> Result<()> {
    let ws = ctx.workspace;
    let rootfs = ws.rootfs_dir();
    for dir in REQUIRED_TOP_LEVEL {
        if !rootfs.join(dir).exists() {
            findings.push(ValidationFinding::fatal(
                "rootfs-layout",
                format!("/{} is missing from the root filesystem", dir),
            ));
        }
    }
    for file in REQUIRED_FILES {
        if !rootfs.join(file).is_file() {
            findings.push(ValidationFinding::fatal(
                "rootfs-files",
                format!("/{} is missing", file),
            ));
        }
    }

    // fstab only exists in the image copy; the record keeps it.
    match disk::read_record(ws).context("reading image record")? {
        Some(record) if record.fstab.lines().any(|l| l.contains(" / ")) => {}
        Some(_) => findings.push(ValidationFinding::fatal(
            "fstab",
            "/etc/fstab has no root mount",
        )),
        None => findings.push(ValidationFinding::fatal(
            "fstab",
            "no image record; /etc/fstab cannot be checked",
        )),
    }

    let config_present = rootfs.join(FRY_CONFIG_PATH).is_file();
    let mining = ctx.plan.fry().bandwidth_mining;
    if mining && !config_present {
        findings.push(ValidationFinding::fatal(
            "fry-config",
            format!("bandwidth mining is enabled but /{} is missing", FRY_CONFIG_PATH),
        ));
    } else if !mining && config_present {
        findings.push(ValidationFinding::fatal(
            "fry-config",
            format!("bandwidth mining is disabled but /{} exists", FRY_CONFIG_PATH),
        ));
    }
    Ok(())
}

/// Boot configuration recorded by assembly, and the kernel and initramfs it
/// loads. Boards booted by a vendor loader have no boot entries to check.
fn check_boot(ctx: &StageContext<'_>, findings: &mut Vec<ValidationFinding>) -> Result<()> {
    let required = disk::boot_files(ctx.plan.architecture());
    if required.is_empty() {
        return Ok(());
    }
    // A missing record is already reported by the fstab check.
    if let Some(record) = disk::read_record(ctx.workspace).context("reading image record")? {
        for file in required {
            if !record.boot_files.iter().any(|p| p == Path::new(file)) {
                findings.push(ValidationFinding::fatal(
                    "boot-entries",
                    format!("/{} was not written into the image", file),
                ));
            }
        }
    }
    let rootfs = ctx.workspace.rootfs_dir();
    for link in disk::KERNEL_LINKS {
        if !exists_in_root(&rootfs, Path::new(link)) {
            findings.push(ValidationFinding::fatal(
                "boot-entries",
                format!("/{} is missing; the boot configuration loads it", link),
            ));
        }
    }
    Ok(())
}

fn check_units(ctx: &StageContext<'_>, findings: &mut Vec<ValidationFinding>) {
    let rootfs = ctx.workspace.rootfs_dir();
    let linked = |unit: &str| wants_link(&rootfs, unit).symlink_metadata().is_ok();

    for unit in ctx.enabled_units() {
        if is_masked(&rootfs, &unit) {
            findings.push(ValidationFinding::fatal(
                "masked-units",
                format!("{} is masked and will never start", unit),
            ));
        }
    }
    for unit in &ctx.network.enabled_units {
        if !linked(unit) {
            findings.push(ValidationFinding::fatal(
                "network-units",
                format!("{} is not enabled", unit),
            ));
        }
    }
    for unit in FRY_UNITS {
        let expected = ctx.fry.enabled_units.iter().any(|u| u == unit);
        match (expected, linked(unit)) {
            (true, false) => findings.push(ValidationFinding::fatal(
                "fry-units",
                format!("{} should be enabled", unit),
            )),
            (false, true) => findings.push(ValidationFinding::fatal(
                "fry-units",
                format!("{} should be disabled", unit),
            )),
            _ => {}
        }
    }
}

fn check_checksums(ctx: &StageContext<'_>, findings: &mut Vec<ValidationFinding>) {
    let ws = ctx.workspace;
    let published = published_image(ctx.plan, ws);
    let name = published
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let sums_path = ws.output_dir().join(CHECKSUMS_FILENAME);
    let Ok(sums) = fs::read_to_string(&sums_path) else {
        findings.push(ValidationFinding::fatal(
            "checksum",
            format!("{} is missing", CHECKSUMS_FILENAME),
        ));
        return;
    };
    let recorded = sums.lines().find_map(|line| {
        let (hash, file) = line.split_once("  ")?;
        (file.trim() == name).then(|| hash.trim().to_string())
    });
    let Some(recorded) = recorded else {
        findings.push(ValidationFinding::fatal(
            "checksum",
            format!("{} does not list {}", CHECKSUMS_FILENAME, name),
        ));
        return;
    };
    match sha256_file(&published) {
        Ok(actual) if actual == recorded => {}
        Ok(actual) => findings.push(ValidationFinding::fatal(
            "checksum",
            format!("{} hashes to {}, but {} records {}", name, actual, CHECKSUMS_FILENAME, recorded),
        )),
        Err(err) => findings.push(ValidationFinding::fatal(
            "checksum",
            format!("cannot hash {}: {:#}", name, err),
        )),
    }
}

fn check_manifest(ws: &Workspace, findings: &mut Vec<ValidationFinding>) {
    let path = ws.output_dir().join(MANIFEST_FILENAME);
    let parsed = fs::read(&path)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok());
    let Some(manifest) = parsed else {
        findings.push(ValidationFinding::fatal(
            "manifest",
            format!("{} is missing or not valid JSON", MANIFEST_FILENAME),
        ));
        return;
    };
    let missing: Vec<&str> = MANIFEST_KEYS
        .iter()
        .copied()
        .filter(|key| manifest.get(key).is_none())
        .collect();
    if !missing.is_empty() {
        findings.push(ValidationFinding::fatal(
            "manifest",
            format!("{} lacks {}", MANIFEST_FILENAME, missing.join(", ")),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{plan_from, BuildPlan, Overrides, TEST_BASE};
    use crate::stages::{StageExecutor, StageId, StageOptions};
    use crate::tools::testing::FakeTools;
    use tempfile::TempDir;

    const PROFILE: &str = r#"
[general]
codename = "gateway"

[build]
architecture = "amd64"
image_size = "512M"

[packages]
include = ["grub-pc"]

[network.ethernet]
interface = "eth0"
dhcp = true

[fry]
bandwidth_mining = true
node_type = "router"
"#;

    fn base() -> String {
        format!("{}\n[output]\ncompression = \"none\"\n", TEST_BASE)
    }

    fn plan() -> BuildPlan {
        plan_from(&base(), PROFILE, &Overrides::new("gateway"))
    }

    fn build(temp: &TempDir, plan: &BuildPlan, tools: &FakeTools) -> Workspace {
        let ws = Workspace::new(temp.path(), plan);
        let ctx = StageContext::prepare(plan, &ws, tools, None, StageOptions::default()).unwrap();
        StageExecutor::new(ctx).run_through(StageId::Compress).unwrap();
        ws
    }

    #[test]
    fn test_clean_build_passes_with_warnings_only() {
        let temp = TempDir::new().unwrap();
        let plan = plan();
        let tools = FakeTools::new();
        let ws = build(&temp, &plan, &tools);
        let ctx = StageContext::prepare(&plan, &ws, &tools, None, StageOptions::default()).unwrap();

        let report = validate(&ctx).unwrap();
        assert!(report.passed, "{:?}", report.findings);
        assert_eq!(report.fatal_count(), 0);

        run(&ctx).unwrap();
        let written: Value =
            serde_json::from_slice(&fs::read(report_path(&ws)).unwrap()).unwrap();
        assert_eq!(written["passed"], Value::Bool(true));
    }

    #[test]
    fn test_tampered_image_fails_checksum() {
        let temp = TempDir::new().unwrap();
        let plan = plan();
        let tools = FakeTools::new();
        let ws = build(&temp, &plan, &tools);
        let image = ws.output_dir().join(plan.image_filename());
        fs::write(&image, b"tampered").unwrap();
        let ctx = StageContext::prepare(&plan, &ws, &tools, None, StageOptions::default()).unwrap();

        let err = run(&ctx).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::ValidationFailed { .. })
        ));
        let report = validate(&ctx).unwrap();
        assert!(report.findings.iter().any(|f| f.check == "checksum" && f.is_fatal()));
        assert!(report.findings.iter().any(|f| f.check == "image-size" && !f.is_fatal()));
        assert!(report_path(&ws).is_file());
    }

    #[test]
    fn test_stray_fry_unit_is_fatal() {
        let temp = TempDir::new().unwrap();
        let plan = plan_from(
            &base(),
            &PROFILE.replace("bandwidth_mining = true", "bandwidth_mining = false"),
            &Overrides::new("gateway"),
        );
        let tools = FakeTools::new();
        let ws = build(&temp, &plan, &tools);
        let link = wants_link(&ws.rootfs_dir(), "fry-node.service");
        fs::create_dir_all(link.parent().unwrap()).unwrap();
        std::os::unix::fs::symlink("/lib/systemd/system/fry-node.service", &link).unwrap();
        let ctx = StageContext::prepare(&plan, &ws, &tools, None, StageOptions::default()).unwrap();

        let report = validate(&ctx).unwrap();
        assert!(!report.passed);
        assert!(report
            .findings
            .iter()
            .any(|f| f.check == "fry-units" && f.message.contains("should be disabled")));
    }

    #[test]
    fn test_smoke_test_failure_is_fatal() {
        let temp = TempDir::new().unwrap();
        let plan = plan();
        let tools = FakeTools::new();
        let ws = build(&temp, &plan, &tools);
        tools.set_serial_output("Kernel panic - not syncing: VFS: Unable to mount root fs\n");
        let options = StageOptions { smoke_test: true };
        let ctx = StageContext::prepare(&plan, &ws, &tools, None, options).unwrap();

        let report = validate(&ctx).unwrap();
        assert!(report.findings.iter().any(|f| f.check == "smoke-test" && f.is_fatal()));
    }

    #[test]
    fn test_missing_kernel_link_is_fatal() {
        let temp = TempDir::new().unwrap();
        let plan = plan();
        let tools = FakeTools::new();
        let ws = build(&temp, &plan, &tools);
        fs::remove_file(ws.rootfs_dir().join("vmlinuz")).unwrap();
        let ctx = StageContext::prepare(&plan, &ws, &tools, None, StageOptions::default()).unwrap();

        let report = validate(&ctx).unwrap();
        assert!(!report.passed);
        assert!(report
            .findings
            .iter()
            .any(|f| f.check == "boot-entries" && f.message.contains("/vmlinuz")));
    }

    #[test]
    fn test_unrecorded_boot_config_is_fatal() {
        let temp = TempDir::new().unwrap();
        let plan = plan();
        let tools = FakeTools::new();
        let ws = build(&temp, &plan, &tools);
        let mut record = disk::read_record(&ws).unwrap().unwrap();
        record.boot_files.clear();
        write_json_atomic(&disk::record_path(&ws), &record).unwrap();
        let ctx = StageContext::prepare(&plan, &ws, &tools, None, StageOptions::default()).unwrap();

        let report = validate(&ctx).unwrap();
        assert!(report
            .findings
            .iter()
            .any(|f| f.check == "boot-entries" && f.message.contains("grub.cfg")));
    }

    #[test]
    fn test_masked_enabled_unit_is_fatal() {
        let temp = TempDir::new().unwrap();
        let plan = plan();
        let tools = FakeTools::new();
        let ws = build(&temp, &plan, &tools);
        let mask = ws.rootfs_dir().join("etc/systemd/system/fry-node.service");
        fs::remove_file(&mask).ok();
        std::os::unix::fs::symlink("/dev/null", &mask).unwrap();
        let ctx = StageContext::prepare(&plan, &ws, &tools, None, StageOptions::default()).unwrap();

        let report = validate(&ctx).unwrap();
        assert!(report
            .findings
            .iter()
            .any(|f| f.check == "masked-units" && f.message.contains("fry-node.service")));
    }
}
