//! Apply the overlay and Fry services to the installed tree.
//!
//! Every path written into the rootfs is recorded before it is written. A
//! rerun (or a discard after failure) removes the recorded paths first, so
//! files from an older plan never linger.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::StageContext;
use crate::artifact::filesystem::{copy_dir_recursive, list_files, remove_path, write_json_atomic};
use crate::artifact::write_artifacts;
use crate::workspace::Workspace;

const RECORD_FILENAME: &str = "service-inject.json";
const UNIT_DIR: &str = "etc/systemd/system";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct InjectionRecord {
    /// Rootfs-relative paths this stage created or overwrote.
    paths: Vec<PathBuf>,
}

pub(crate) fn record_path(ws: &Workspace) -> PathBuf {
    ws.state_dir().join(RECORD_FILENAME)
}

/// `etc/systemd/system/<target>.wants/<unit>` under `rootfs`.
pub(crate) fn wants_link(rootfs: &Path, unit: &str) -> PathBuf {
    let target = if unit.ends_with(".timer") {
        "timers.target.wants"
    } else {
        "multi-user.target.wants"
    };
    rootfs.join(UNIT_DIR).join(target).join(unit)
}

pub(super) fn run(ctx: &StageContext<'_>) -> Result<()> {
    let ws = ctx.workspace;
    let rootfs = ws.rootfs_dir();
    undo(ctx)?;

    let overlay = ws.overlay_dir();
    let enabled = ctx.enabled_units();
    let mut record = InjectionRecord::default();
    record.paths.extend(list_files(&overlay)?);
    record
        .paths
        .extend(ctx.fry.artifacts.iter().map(|a| a.path.clone()));
    for unit in &enabled {
        let link = wants_link(&rootfs, unit);
        if let Ok(relative) = link.strip_prefix(&rootfs) {
            record.paths.push(relative.to_path_buf());
        }
    }
    write_json_atomic(&record_path(ws), &record)?;

    copy_dir_recursive(&overlay, &rootfs)?;
    write_artifacts(&rootfs, &ctx.fry.artifacts)?;

    for unit in &ctx.fry.disabled_units {
        let link = wants_link(&rootfs, unit);
        if link.symlink_metadata().is_ok() {
            debug!(unit, "disabling");
            fs::remove_file(&link)
                .with_context(|| format!("removing '{}'", link.display()))?;
        }
    }
    for unit in &enabled {
        enable_unit(&rootfs, unit)?;
    }

    info!(
        files = record.paths.len(),
        units = enabled.len(),
        "services injected"
    );
    Ok(())
}

/// True when `etc/systemd/system/<unit>` is a mask link to `/dev/null`.
/// Links inside the rootfs are read, never followed onto the host.
pub(crate) fn is_masked(rootfs: &Path, unit: &str) -> bool {
    let path = rootfs.join(UNIT_DIR).join(unit);
    match path.symlink_metadata() {
        Ok(meta) if meta.file_type().is_symlink() => fs::read_link(&path)
            .map(|target| target == Path::new("/dev/null"))
            .unwrap_or(false),
        _ => false,
    }
}

fn enable_unit(rootfs: &Path, unit: &str) -> Result<()> {
    let unit_path = rootfs.join(UNIT_DIR).join(unit);
    if is_masked(rootfs, unit) {
        debug!(unit, "unmasking");
        fs::remove_file(&unit_path)
            .with_context(|| format!("unmasking '{}'", unit_path.display()))?;
    }

    let link = wants_link(rootfs, unit);
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating '{}'", parent.display()))?;
    }
    if link.symlink_metadata().is_ok() {
        fs::remove_file(&link).with_context(|| format!("removing '{}'", link.display()))?;
    }
    let target = if unit_path.symlink_metadata().is_ok() {
        format!("/{}/{}", UNIT_DIR, unit)
    } else {
        format!("/lib/systemd/system/{}", unit)
    };
    symlink(&target, &link)
        .with_context(|| format!("linking '{}' -> '{}'", link.display(), target))?;
    Ok(())
}

/// Remove everything a previous injection recorded, then the record itself.
pub(super) fn undo(ctx: &StageContext<'_>) -> Result<()> {
    let path = record_path(ctx.workspace);
    if !path.is_file() {
        return Ok(());
    }
    let bytes = fs::read(&path).with_context(|| format!("reading '{}'", path.display()))?;
    let record: InjectionRecord = serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing '{}'", path.display()))?;
    let rootfs = ctx.workspace.rootfs_dir();
    for relative in &record.paths {
        remove_path(&rootfs.join(relative))?;
    }
    debug!(removed = record.paths.len(), "previous injection removed");
    remove_path(&path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{plan_from, test_plan, Overrides, TEST_BASE};
    use crate::stages::StageOptions;
    use crate::tools::testing::FakeTools;
    use tempfile::TempDir;

    fn prepare_tree(ws: &Workspace) {
        fs::create_dir_all(ws.rootfs_dir().join("etc/systemd/system")).unwrap();
        fs::create_dir_all(ws.overlay_dir().join("etc")).unwrap();
        fs::write(ws.overlay_dir().join("etc/hostname"), "fry-test\n").unwrap();
        fs::create_dir_all(ws.state_dir()).unwrap();
    }

    const MINING: &str = "[fry]\nbandwidth_mining = true\nnode_type = \"router\"\n";

    #[test]
    fn test_mining_units_are_enabled() {
        let temp = TempDir::new().unwrap();
        let plan = test_plan(MINING);
        let ws = Workspace::new(temp.path(), &plan);
        prepare_tree(&ws);
        let tools = FakeTools::new();
        let ctx = StageContext::prepare(&plan, &ws, &tools, None, StageOptions::default()).unwrap();

        run(&ctx).unwrap();

        let rootfs = ws.rootfs_dir();
        assert!(rootfs.join("etc/hostname").exists());
        assert!(rootfs.join("etc/fry/config.json").exists());
        let link = wants_link(&rootfs, "fry-node.service");
        assert_eq!(
            fs::read_link(&link).unwrap(),
            PathBuf::from("/etc/systemd/system/fry-node.service")
        );
        assert!(wants_link(&rootfs, "fry-update.timer")
            .to_string_lossy()
            .contains("timers.target.wants"));
        assert!(wants_link(&rootfs, "fry-update.timer").symlink_metadata().is_ok());
    }

    #[test]
    fn test_rerun_without_mining_removes_stale_files() {
        let temp = TempDir::new().unwrap();
        let mining = test_plan(MINING);
        let ws = Workspace::new(temp.path(), &mining);
        prepare_tree(&ws);
        let tools = FakeTools::new();
        let ctx =
            StageContext::prepare(&mining, &ws, &tools, None, StageOptions::default()).unwrap();
        run(&ctx).unwrap();

        let idle = plan_from(
            TEST_BASE,
            "[fry]\nbandwidth_mining = false\n",
            &Overrides::new("test"),
        );
        let ctx = StageContext::prepare(&idle, &ws, &tools, None, StageOptions::default()).unwrap();
        run(&ctx).unwrap();

        let rootfs = ws.rootfs_dir();
        assert!(!rootfs.join("etc/fry/config.json").exists());
        assert!(wants_link(&rootfs, "fry-node.service")
            .symlink_metadata()
            .is_err());
        assert!(rootfs.join("etc/hostname").exists());
    }

    #[test]
    fn test_masked_unit_is_unmasked_before_enabling() {
        let temp = TempDir::new().unwrap();
        let plan = test_plan(MINING);
        let ws = Workspace::new(temp.path(), &plan);
        prepare_tree(&ws);
        let rootfs = ws.rootfs_dir();
        let mask = rootfs.join(UNIT_DIR).join("hostapd.service");
        symlink("/dev/null", &mask).unwrap();
        assert!(is_masked(&rootfs, "hostapd.service"));

        enable_unit(&rootfs, "hostapd.service").unwrap();
        assert!(!is_masked(&rootfs, "hostapd.service"));
        assert!(mask.symlink_metadata().is_err());
        assert_eq!(
            fs::read_link(wants_link(&rootfs, "hostapd.service")).unwrap(),
            PathBuf::from("/lib/systemd/system/hostapd.service")
        );
    }

    #[test]
    fn test_unit_link_in_rootfs_is_not_followed_to_host() {
        let temp = TempDir::new().unwrap();
        let plan = test_plan(MINING);
        let ws = Workspace::new(temp.path(), &plan);
        prepare_tree(&ws);
        let rootfs = ws.rootfs_dir();
        // Alias pointing at a path that only exists inside the image.
        symlink(
            "/lib/systemd/system/dnsmasq.service",
            rootfs.join(UNIT_DIR).join("dnsmasq.service"),
        )
        .unwrap();

        enable_unit(&rootfs, "dnsmasq.service").unwrap();
        assert_eq!(
            fs::read_link(wants_link(&rootfs, "dnsmasq.service")).unwrap(),
            PathBuf::from("/etc/systemd/system/dnsmasq.service")
        );
    }

    #[test]
    fn test_undo_removes_recorded_paths() {
        let temp = TempDir::new().unwrap();
        let plan = test_plan(MINING);
        let ws = Workspace::new(temp.path(), &plan);
        prepare_tree(&ws);
        let tools = FakeTools::new();
        let ctx = StageContext::prepare(&plan, &ws, &tools, None, StageOptions::default()).unwrap();
        run(&ctx).unwrap();

        undo(&ctx).unwrap();
        assert!(!record_path(&ws).exists());
        assert!(!ws.rootfs_dir().join("usr/local/bin/fry-status").exists());
    }
}
