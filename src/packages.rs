//! Final package set for a plan: base lists, flavor bundle and profile
//! includes, minus every exclude.

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::BuildError;
use crate::plan::BuildPlan;

/// XFCE desktop bundle added by the `desktop` flavor.
pub const DESKTOP_BUNDLE: &[&str] = &["xfce4", "xfce4-terminal", "lightdm", "xserver-xorg"];

/// Container runtime bundle added by the `server` flavor.
pub const SERVER_BUNDLE: &[&str] = &["docker.io", "podman", "containerd"];

/// Package-bundle preset selected by `build.flavor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Flavor {
    Minimal,
    Desktop,
    Server,
}

impl Flavor {
    pub fn parse(value: &str) -> Result<Self, BuildError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "minimal" => Ok(Flavor::Minimal),
            "desktop" => Ok(Flavor::Desktop),
            "server" => Ok(Flavor::Server),
            _ => Err(BuildError::UnknownFlavor(value.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Flavor::Minimal => "minimal",
            Flavor::Desktop => "desktop",
            Flavor::Server => "server",
        }
    }
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bundle for `flavor`, extended by the base document's list of the same name.
pub fn flavor_preset(plan: &BuildPlan) -> Vec<String> {
    let (bundle, extra) = match plan.flavor() {
        Flavor::Minimal => (&[] as &[&str], &[] as &[String]),
        Flavor::Desktop => (DESKTOP_BUNDLE, plan.packages().desktop.as_slice()),
        Flavor::Server => (SERVER_BUNDLE, plan.packages().server.as_slice()),
    };
    bundle
        .iter()
        .map(|name| name.to_string())
        .chain(extra.iter().cloned())
        .collect()
}

/// Package names in install order, without duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ResolvedPackages(Vec<String>);

impl ResolvedPackages {
    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|package| package == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

/// Union of core, IoT, flavor and profile includes, then every exclude removed.
///
/// An empty result is legal; it is logged so the operator sees it.
pub fn resolve(plan: &BuildPlan) -> ResolvedPackages {
    let lists = plan.packages();
    let preset = flavor_preset(plan);
    let excluded: HashSet<&str> = lists.exclude.iter().map(String::as_str).collect();

    let mut seen = HashSet::new();
    let mut resolved = Vec::new();
    for name in lists
        .core
        .iter()
        .chain(&lists.iot)
        .chain(&preset)
        .chain(&lists.include)
    {
        if excluded.contains(name.as_str()) || !seen.insert(name.as_str()) {
            continue;
        }
        resolved.push(name.clone());
    }

    if resolved.is_empty() {
        warn!(
            profile = plan.profile(),
            "resolved package set is empty after exclusions; continuing with a bare bootstrap"
        );
    } else {
        info!(
            profile = plan.profile(),
            flavor = %plan.flavor(),
            "resolved {} package(s)",
            resolved.len()
        );
    }
    ResolvedPackages(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::test_plan;

    #[test]
    fn test_minimal_flavor_example() {
        let plan = test_plan(
            r#"
[build]
flavor = "minimal"
[packages]
include = ["hostapd", "dnsmasq"]
exclude = ["podman"]
"#,
        );
        let resolved = resolve(&plan);
        let names: Vec<&str> = resolved.iter().collect();
        assert_eq!(names, vec!["curl", "systemd", "hostapd", "dnsmasq"]);
        assert!(!resolved.contains("podman"));
    }

    #[test]
    fn test_exclude_beats_flavor_preset() {
        let plan = test_plan(
            r#"
[build]
flavor = "server"
[packages]
include = ["podman"]
exclude = ["podman"]
"#,
        );
        let resolved = resolve(&plan);
        assert!(resolved.contains("docker.io"));
        assert!(!resolved.contains("podman"));
    }

    #[test]
    fn test_duplicates_keep_first_position() {
        let plan = test_plan("[packages]\ninclude = [\"systemd\", \"vim\", \"vim\"]\n");
        let resolved = resolve(&plan);
        let names: Vec<&str> = resolved.iter().collect();
        assert_eq!(names, vec!["curl", "systemd", "vim"]);
    }

    #[test]
    fn test_everything_excluded_is_allowed() {
        let plan = test_plan("[packages]\nexclude = [\"curl\", \"systemd\"]\n");
        assert!(resolve(&plan).is_empty());
    }

    #[test]
    fn test_unknown_flavor() {
        assert_eq!(
            Flavor::parse("kiosk").unwrap_err(),
            BuildError::UnknownFlavor("kiosk".to_string())
        );
    }
}
