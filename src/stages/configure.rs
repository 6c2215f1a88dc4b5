//! Render the configuration overlay. Needs no rootfs and runs no tools.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{debug, info};

use super::StageContext;
use crate::artifact::filesystem::{copy_dir_recursive, remove_path};
use crate::artifact::{write_artifacts, ConfigArtifact};
use crate::plan::BuildPlan;

pub const DEVICE_INFO_PATH: &str = "etc/fry-iot/device.json";

const FRY_APT_SOURCE: &str = "# Fry Networks repository\n\
deb [signed-by=/usr/share/keyrings/fry-archive-keyring.gpg] https://apt.fry.network/debian trixie main\n";

pub(super) fn run(ctx: &StageContext<'_>) -> Result<()> {
    let overlay = ctx.workspace.overlay_dir();
    remove_path(&overlay)?;
    fs::create_dir_all(&overlay)
        .with_context(|| format!("creating overlay '{}'", overlay.display()))?;

    let mut artifacts = identity_artifacts(ctx.plan);
    artifacts.extend(ctx.network.artifacts.iter().cloned());
    let written = write_artifacts(&overlay, &artifacts)?;
    for path in &written {
        debug!("rendered {}", path.display());
    }

    if let Some(profile_dir) = &ctx.profile_dir {
        copy_profile_trees(profile_dir, &overlay)?;
    }
    info!(files = written.len(), "overlay rendered");
    Ok(())
}

/// os-release `ID`-style token: lowercase `a-z`, `0-9`, `.`, `_` and `-`.
fn os_release_id(value: &str) -> String {
    let token: String = value
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '-',
        })
        .collect();
    let token = token.trim_matches('-');
    if token.is_empty() {
        "fry-iot".to_string()
    } else {
        token.to_string()
    }
}

fn identity_artifacts(plan: &BuildPlan) -> Vec<ConfigArtifact> {
    let id = plan.identity();
    let debian = plan.debian();
    let components = debian.components.join(" ");

    let os_release = format!(
        "PRETTY_NAME=\"{os_name} {version} ({codename})\"\n\
         NAME=\"{os_name}\"\n\
         VERSION_ID=\"{version}\"\n\
         VERSION=\"{version} ({suite})\"\n\
         ID={os_id}\n\
         ID_LIKE=debian\n\
         VARIANT_ID={variant_id}\n\
         HOME_URL=\"https://fry.network/\"\n\
         DOCUMENTATION_URL=\"https://docs.fry.network/\"\n",
        os_name = id.os_name.replace('"', "'"),
        version = id.os_version,
        codename = id.codename,
        suite = debian.suite,
        os_id = os_release_id(plan.image_prefix()),
        variant_id = os_release_id(&id.codename),
    );

    let device = json!({
        "name": id.codename,
        "brand": id.brand,
        "model": id.model,
        "version": id.os_version,
        "architecture": plan.architecture(),
        "flavor": plan.flavor(),
        "hostname": id.hostname,
    });

    let motd = format!(
        "\n Fry IoT v{} - {} ({})\n Debian {} based Linux for IoT devices\n\n \
         Contribute to Fry Networks: https://fry.network/\n \
         Documentation: https://docs.fry.network/\n\n",
        id.os_version,
        id.codename,
        plan.architecture(),
        debian.suite,
    );

    let sources = format!(
        "# Fry IoT - Debian {suite} sources\n\
         deb {mirror} {suite} {components}\n\
         deb {mirror} {suite}-updates {components}\n\
         deb {security} {suite}-security {components}\n",
        suite = debian.suite,
        mirror = debian.mirror,
        security = debian.security_mirror,
        components = components,
    );

    vec![
        ConfigArtifact::file("etc/hostname", format!("{}\n", id.hostname)),
        ConfigArtifact::file(
            "etc/hosts",
            format!(
                "127.0.0.1\tlocalhost\n127.0.1.1\t{}\n::1\t\tlocalhost ip6-localhost ip6-loopback\n",
                id.hostname
            ),
        ),
        ConfigArtifact::file("etc/os-release", os_release),
        ConfigArtifact::file("etc/motd", motd),
        ConfigArtifact::file(
            DEVICE_INFO_PATH,
            serde_json::to_string_pretty(&device).unwrap_or_default() + "\n",
        ),
        ConfigArtifact::file("etc/apt/sources.list", sources),
        ConfigArtifact::file("etc/apt/sources.list.d/fry.list", FRY_APT_SOURCE),
    ]
}

/// `files/` lands at the root, `systemd/*.service|*.timer` in
/// `etc/systemd/system`, `network/*.network` in `etc/systemd/network`.
fn copy_profile_trees(profile_dir: &Path, overlay: &Path) -> Result<()> {
    let files = profile_dir.join("files");
    if files.is_dir() {
        copy_dir_recursive(&files, overlay)?;
    }
    copy_matching(
        &profile_dir.join("systemd"),
        &overlay.join("etc/systemd/system"),
        &["service", "timer"],
    )?;
    copy_matching(
        &profile_dir.join("network"),
        &overlay.join("etc/systemd/network"),
        &["network"],
    )?;
    Ok(())
}

fn copy_matching(src: &Path, dst: &Path, extensions: &[&str]) -> Result<()> {
    if !src.is_dir() {
        return Ok(());
    }
    let mut entries: Vec<_> = fs::read_dir(src)
        .with_context(|| format!("reading '{}'", src.display()))?
        .collect::<std::io::Result<_>>()
        .with_context(|| format!("reading '{}'", src.display()))?;
    entries.sort_by_key(|entry| entry.file_name());
    for entry in entries {
        let path = entry.path();
        let wanted = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| extensions.contains(&ext));
        if !wanted || !path.is_file() {
            continue;
        }
        fs::create_dir_all(dst).with_context(|| format!("creating '{}'", dst.display()))?;
        let target = dst.join(entry.file_name());
        fs::copy(&path, &target).with_context(|| {
            format!("copying '{}' -> '{}'", path.display(), target.display())
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::test_plan;
    use crate::stages::StageOptions;
    use crate::tools::testing::FakeTools;
    use crate::workspace::Workspace;
    use tempfile::TempDir;

    #[test]
    fn test_overlay_contains_identity_and_network() {
        let temp = TempDir::new().unwrap();
        let plan = test_plan(
            "[general]\ncodename = \"rpi4\"\n\n[network.ethernet]\ninterface = \"eth0\"\ndhcp = true\n",
        );
        let ws = Workspace::new(temp.path(), &plan);
        let tools = FakeTools::new();
        let ctx = StageContext::prepare(&plan, &ws, &tools, None, StageOptions::default()).unwrap();

        run(&ctx).unwrap();

        let overlay = ws.overlay_dir();
        assert_eq!(fs::read_to_string(overlay.join("etc/hostname")).unwrap(), "fry-rpi4\n");
        let device: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(overlay.join(DEVICE_INFO_PATH)).unwrap())
                .unwrap();
        assert_eq!(device["name"], "rpi4");
        assert!(overlay.join("etc/systemd/network/10-ethernet.network").exists());
        let sources = fs::read_to_string(overlay.join("etc/apt/sources.list")).unwrap();
        assert!(sources.contains("trixie-security"));
        assert!(tools.calls().is_empty());
    }

    #[test]
    fn test_profile_trees_are_copied_by_kind() {
        let temp = TempDir::new().unwrap();
        let profile_dir = temp.path().join("profiles/test");
        fs::create_dir_all(profile_dir.join("files/etc/fry")).unwrap();
        fs::write(profile_dir.join("files/etc/fry/extra.conf"), "x=1\n").unwrap();
        fs::create_dir_all(profile_dir.join("systemd")).unwrap();
        fs::write(profile_dir.join("systemd/led.service"), "[Unit]\n").unwrap();
        fs::write(profile_dir.join("systemd/README"), "ignored").unwrap();
        fs::create_dir_all(profile_dir.join("network")).unwrap();
        fs::write(profile_dir.join("network/30-lan.network"), "[Match]\n").unwrap();

        let plan = test_plan("");
        let ws = Workspace::new(temp.path(), &plan);
        let tools = FakeTools::new();
        let ctx = StageContext::prepare(
            &plan,
            &ws,
            &tools,
            Some(profile_dir.as_path()),
            StageOptions::default(),
        )
        .unwrap();

        run(&ctx).unwrap();

        let overlay = ws.overlay_dir();
        assert!(overlay.join("etc/fry/extra.conf").exists());
        assert!(overlay.join("etc/systemd/system/led.service").exists());
        assert!(!overlay.join("etc/systemd/system/README").exists());
        assert!(overlay.join("etc/systemd/network/30-lan.network").exists());
    }

    #[test]
    fn test_os_release_id_is_a_token() {
        let base = format!(
            "{}\n[general]\nos_name = \"Fry IoT\"\n\n[output]\nimage_prefix = \"fry-iot\"\n",
            crate::plan::TEST_BASE
        );
        let plan = crate::plan::plan_from(
            &base,
            "[general]\ncodename = \"RPi4\"\n",
            &crate::plan::Overrides::new("test"),
        );
        let release = identity_artifacts(&plan)
            .into_iter()
            .find(|a| a.path == Path::new("etc/os-release"))
            .unwrap()
            .contents;
        assert!(release.contains("\nID=fry-iot\n"));
        assert!(release.contains("NAME=\"Fry IoT\"\n"));
        assert!(release.contains("VARIANT_ID=rpi4\n"));
        assert_eq!(os_release_id("  Fry IoT!  "), "fry-iot");
        assert_eq!(os_release_id("***"), "fry-iot");
    }
}
