//! The resolved build plan and the merge that produces it.
//!
//! Precedence for scalars is forced override, then profile, then base, then
//! the fallback defaults carried by [`Overrides`]. Package lists concatenate
//! and deduplicate. The network, hostapd, dnsmasq and fry sections are taken
//! whole from the profile when present, otherwise whole from the base.

mod types;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::{
    BaseConfig, DnsmasqSection, FrySection, HostapdSection, NetworkSection, ProfileConfig,
};
use crate::error::BuildError;
use crate::fry::NodeType;
use crate::packages::Flavor;

pub use types::{Architecture, Compression, Filesystem, ImageSize};

/// Port of the on-device Fry dashboard. Not configurable per profile.
pub const DASHBOARD_PORT: u16 = 8080;

const DEFAULT_COMPONENTS: &[&str] = &["main", "contrib", "non-free", "non-free-firmware"];
const DEFAULT_SECURITY_MIRROR: &str = "https://security.debian.org/debian-security";

/// Values supplied by the caller rather than by either document.
#[derive(Debug, Clone)]
pub struct Overrides {
    pub profile: String,
    /// Beats both documents.
    pub image_size: Option<String>,
    /// Beats the workspace default output directory.
    pub output_dir: Option<PathBuf>,
    /// Used only when neither document sets the value.
    pub fallback: Fallbacks,
}

impl Overrides {
    pub fn new(profile: impl Into<String>) -> Self {
        Self {
            profile: profile.into(),
            image_size: None,
            output_dir: None,
            fallback: Fallbacks::builtin(),
        }
    }
}

/// Last-resort values for optional scalars.
#[derive(Debug, Clone, Default)]
pub struct Fallbacks {
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub architecture: Option<String>,
    pub flavor: Option<String>,
    pub image_size: Option<String>,
    pub filesystem: Option<String>,
    pub compression: Option<String>,
    pub image_prefix: Option<String>,
    pub node_type: Option<String>,
    pub api_endpoint: Option<String>,
    pub bandwidth_mining: Option<bool>,
}

impl Fallbacks {
    pub fn builtin() -> Self {
        Self {
            os_name: Some("fry-iot".to_string()),
            os_version: Some("1.0.0".to_string()),
            architecture: Some("amd64".to_string()),
            flavor: Some("minimal".to_string()),
            image_size: Some("4G".to_string()),
            filesystem: Some("ext4".to_string()),
            compression: Some("xz".to_string()),
            image_prefix: Some("fry-iot".to_string()),
            node_type: Some("router".to_string()),
            api_endpoint: Some("https://api.fry.network".to_string()),
            bandwidth_mining: Some(true),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemIdentity {
    pub os_name: String,
    pub os_version: String,
    pub codename: String,
    pub brand: String,
    pub model: String,
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DebianSource {
    pub suite: String,
    pub mirror: String,
    pub security_mirror: String,
    pub components: Vec<String>,
}

/// Package lists after concatenation and deduplication, before resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageLists {
    pub core: Vec<String>,
    pub iot: Vec<String>,
    pub desktop: Vec<String>,
    pub server: Vec<String>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FryPlan {
    pub bandwidth_mining: bool,
    pub node_type: NodeType,
    pub api_endpoint: String,
}

/// Fully resolved configuration for one build run.
///
/// Only [`merge`] constructs it and nothing hands out a mutable reference, so
/// every stage sees the same values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildPlan {
    profile: String,
    identity: SystemIdentity,
    debian: DebianSource,
    architecture: Architecture,
    flavor: Flavor,
    image_size: ImageSize,
    filesystem: Filesystem,
    compression: Compression,
    image_prefix: String,
    kernel_package: String,
    packages: PackageLists,
    network: Option<NetworkSection>,
    hostapd: Option<HostapdSection>,
    dnsmasq: Option<DnsmasqSection>,
    fry: FryPlan,
    output_dir: Option<PathBuf>,
}

impl BuildPlan {
    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn identity(&self) -> &SystemIdentity {
        &self.identity
    }

    pub fn debian(&self) -> &DebianSource {
        &self.debian
    }

    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    pub fn flavor(&self) -> Flavor {
        self.flavor
    }

    pub fn image_size(&self) -> ImageSize {
        self.image_size
    }

    pub fn filesystem(&self) -> Filesystem {
        self.filesystem
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn image_prefix(&self) -> &str {
        &self.image_prefix
    }

    pub fn kernel_package(&self) -> &str {
        &self.kernel_package
    }

    pub fn packages(&self) -> &PackageLists {
        &self.packages
    }

    pub fn network(&self) -> Option<&NetworkSection> {
        self.network.as_ref()
    }

    pub fn hostapd(&self) -> Option<&HostapdSection> {
        self.hostapd.as_ref()
    }

    pub fn dnsmasq(&self) -> Option<&DnsmasqSection> {
        self.dnsmasq.as_ref()
    }

    pub fn fry(&self) -> &FryPlan {
        &self.fry
    }

    pub fn output_dir(&self) -> Option<&Path> {
        self.output_dir.as_deref()
    }

    pub fn dashboard_port(&self) -> u16 {
        DASHBOARD_PORT
    }

    /// `<prefix>-<profile>-<arch>.img`
    pub fn image_filename(&self) -> String {
        format!(
            "{}-{}-{}.img",
            self.image_prefix, self.profile, self.architecture
        )
    }

    /// Stable pretty JSON. Two plans built from the same inputs serialize identically.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

struct Resolver<'a> {
    document: String,
    fallback: &'a Fallbacks,
}

impl Resolver<'_> {
    fn required(&self, key_path: &str, layers: &[Option<&str>]) -> Result<String, BuildError> {
        layers
            .iter()
            .flatten()
            .next()
            .map(|value| value.to_string())
            .ok_or_else(|| BuildError::ConfigSchema {
                document: self.document.clone(),
                key_path: key_path.to_string(),
                message: "no value in the profile, the base config or the defaults".to_string(),
            })
    }

    fn invalid(&self, key_path: &str, message: String) -> BuildError {
        BuildError::ConfigSchema {
            document: self.document.clone(),
            key_path: key_path.to_string(),
            message,
        }
    }
}

/// Resolve base, profile and overrides into one plan.
pub fn merge(
    base: &BaseConfig,
    profile: &ProfileConfig,
    overrides: &Overrides,
) -> Result<BuildPlan, BuildError> {
    let fb = &overrides.fallback;
    let r = Resolver {
        document: format!("profile '{}'", overrides.profile),
        fallback: fb,
    };

    let architecture = Architecture::parse(&r.required(
        "build.architecture",
        &[profile.build.architecture.as_deref(), fb.architecture.as_deref()],
    )?)?;

    let flavor = Flavor::parse(&r.required(
        "build.flavor",
        &[profile.build.flavor.as_deref(), fb.flavor.as_deref()],
    )?)?;

    let image_size_text = r.required(
        "build.image_size",
        &[
            overrides.image_size.as_deref(),
            profile.build.image_size.as_deref(),
            base.build.image_size.as_deref(),
            fb.image_size.as_deref(),
        ],
    )?;
    let image_size = ImageSize::parse(&image_size_text).ok_or_else(|| {
        r.invalid(
            "build.image_size",
            format!(
                "`{}` is not a size like 4G, 1.5G or 512M (at most 16T)",
                image_size_text
            ),
        )
    })?;

    let filesystem_text = r.required(
        "build.filesystem",
        &[
            profile.build.filesystem.as_deref(),
            base.build.filesystem.as_deref(),
            fb.filesystem.as_deref(),
        ],
    )?;
    let filesystem = Filesystem::parse(&filesystem_text).ok_or_else(|| {
        r.invalid(
            "build.filesystem",
            format!("`{}` is not one of ext4, btrfs", filesystem_text),
        )
    })?;

    let compression_text = r.required(
        "output.compression",
        &[base.output.compression.as_deref(), fb.compression.as_deref()],
    )?;
    let compression = Compression::parse(&compression_text).ok_or_else(|| {
        r.invalid(
            "output.compression",
            format!("`{}` is not one of xz, gzip, zstd, none", compression_text),
        )
    })?;

    let codename = profile
        .general
        .codename
        .clone()
        .unwrap_or_else(|| overrides.profile.clone());
    let hostname = profile
        .system
        .hostname
        .clone()
        .unwrap_or_else(|| format!("fry-{}", codename));
    if !is_valid_hostname(&hostname) {
        return Err(r.invalid(
            "system.hostname",
            format!("`{}` is not a valid hostname", hostname),
        ));
    }

    let identity = SystemIdentity {
        os_name: r.required(
            "general.os_name",
            &[base.general.os_name.as_deref(), fb.os_name.as_deref()],
        )?,
        os_version: r.required(
            "general.os_version",
            &[base.general.os_version.as_deref(), fb.os_version.as_deref()],
        )?,
        brand: profile
            .general
            .brand
            .clone()
            .unwrap_or_else(|| "Fry".to_string()),
        model: profile
            .general
            .model
            .clone()
            .unwrap_or_else(|| codename.clone()),
        codename,
        hostname,
    };

    let debian = DebianSource {
        suite: base.debian.suite.clone(),
        mirror: base.debian.mirror.clone(),
        security_mirror: base
            .debian
            .security_mirror
            .clone()
            .unwrap_or_else(|| DEFAULT_SECURITY_MIRROR.to_string()),
        components: base.debian.components.clone().unwrap_or_else(|| {
            DEFAULT_COMPONENTS.iter().map(|c| c.to_string()).collect()
        }),
    };

    let packages = PackageLists {
        core: dedup(&[&base.packages.core]),
        iot: dedup(&[&base.packages.iot]),
        desktop: dedup(&[&base.packages.desktop]),
        server: dedup(&[&base.packages.server]),
        include: dedup(&[&profile.packages.include]),
        exclude: dedup(&[&base.packages.exclude, &profile.packages.exclude]),
    };

    let fry_section = profile.fry.as_ref().or(base.fry.as_ref());
    let fry = resolve_fry(&r, fry_section)?;

    Ok(BuildPlan {
        profile: overrides.profile.clone(),
        identity,
        debian,
        architecture,
        flavor,
        image_size,
        filesystem,
        compression,
        image_prefix: r.required(
            "output.image_prefix",
            &[base.output.image_prefix.as_deref(), fb.image_prefix.as_deref()],
        )?,
        kernel_package: profile
            .build
            .kernel_package
            .clone()
            .unwrap_or_else(|| architecture.default_kernel_package().to_string()),
        packages,
        network: profile
            .network
            .clone()
            .or_else(|| base.network.clone())
            .map(drop_disabled_interfaces),
        hostapd: profile
            .hostapd
            .clone()
            .or_else(|| base.hostapd.clone())
            .filter(|s| is_enabled(s.enabled)),
        dnsmasq: profile
            .dnsmasq
            .clone()
            .or_else(|| base.dnsmasq.clone())
            .filter(|s| is_enabled(s.enabled)),
        fry,
        output_dir: overrides.output_dir.clone(),
    })
}

fn resolve_fry(r: &Resolver<'_>, section: Option<&FrySection>) -> Result<FryPlan, BuildError> {
    let empty = FrySection::default();
    let section = section.unwrap_or(&empty);
    let node_type_text = r.required(
        "fry.node_type",
        &[section.node_type.as_deref(), r.fallback.node_type.as_deref()],
    )?;
    let node_type = NodeType::parse(&node_type_text).ok_or_else(|| {
        r.invalid(
            "fry.node_type",
            format!("`{}` is not one of router, generic", node_type_text),
        )
    })?;
    let bandwidth_mining = section
        .bandwidth_mining
        .or(r.fallback.bandwidth_mining)
        .ok_or_else(|| {
            r.invalid(
                "fry.bandwidth_mining",
                "no value in the profile, the base config or the defaults".to_string(),
            )
        })?;
    Ok(FryPlan {
        bandwidth_mining,
        node_type,
        api_endpoint: r.required(
            "fry.api_endpoint",
            &[section.api_endpoint.as_deref(), r.fallback.api_endpoint.as_deref()],
        )?,
    })
}

fn is_enabled(flag: Option<bool>) -> bool {
    flag != Some(false)
}

fn drop_disabled_interfaces(mut network: NetworkSection) -> NetworkSection {
    network.wifi = network.wifi.filter(|s| is_enabled(s.enabled));
    network.bridge = network.bridge.filter(|s| is_enabled(s.enabled));
    network
}

fn dedup(lists: &[&Vec<String>]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for name in lists.iter().flat_map(|list| list.iter()) {
        if seen.insert(name.as_str()) {
            merged.push(name.clone());
        }
    }
    merged
}

fn is_valid_hostname(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && !name.starts_with('-')
        && !name.ends_with('-')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

#[cfg(test)]
pub(crate) const TEST_BASE: &str = r#"
[debian]
suite = "trixie"
mirror = "https://deb.debian.org/debian"

[packages]
core = ["curl", "systemd"]
"#;

#[cfg(test)]
pub(crate) fn plan_from(base: &str, profile: &str, overrides: &Overrides) -> BuildPlan {
    use crate::config::{load, ConfigSource};
    let loaded = load(
        &ConfigSource::new("base-config.toml", base),
        &ConfigSource::new("profile-config.toml", profile),
    )
    .unwrap();
    merge(&loaded.base, &loaded.profile, overrides).unwrap()
}

#[cfg(test)]
pub(crate) fn test_plan(profile: &str) -> BuildPlan {
    plan_from(TEST_BASE, profile, &Overrides::new("test"))
}
