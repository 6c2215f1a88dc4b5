//! Typed views of `base-config.toml` and `profile-config.toml`.
//!
//! Section types that survive into the build plan (network, hostapd, dnsmasq,
//! fry) also derive `Serialize` so the plan can be fingerprinted.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A document that keeps the keys the schema does not recognize.
pub(crate) trait Extensible {
    fn extensions_mut(&mut self) -> &mut BTreeMap<String, toml::Value>;
}

impl Extensible for BaseConfig {
    fn extensions_mut(&mut self) -> &mut BTreeMap<String, toml::Value> {
        &mut self.extensions
    }
}

impl Extensible for ProfileConfig {
    fn extensions_mut(&mut self) -> &mut BTreeMap<String, toml::Value> {
        &mut self.extensions
    }
}

/// Global defaults shared by every profile.
#[derive(Debug, Clone, Deserialize)]
pub struct BaseConfig {
    #[serde(default)]
    pub general: BaseGeneral,
    pub debian: DebianSection,
    pub packages: BasePackages,
    #[serde(default)]
    pub build: BaseBuild,
    #[serde(default)]
    pub output: OutputSection,
    pub fry: Option<FrySection>,
    pub network: Option<NetworkSection>,
    pub hostapd: Option<HostapdSection>,
    pub dnsmasq: Option<DnsmasqSection>,
    /// Keys this builder does not know about: top-level tables by name,
    /// nested keys by dotted path (`build.foo`).
    #[serde(flatten)]
    pub extensions: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BaseGeneral {
    pub os_name: Option<String>,
    pub os_version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DebianSection {
    pub suite: String,
    pub mirror: String,
    pub security_mirror: Option<String>,
    pub components: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BasePackages {
    pub core: Vec<String>,
    #[serde(default)]
    pub iot: Vec<String>,
    #[serde(default)]
    pub desktop: Vec<String>,
    #[serde(default)]
    pub server: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BaseBuild {
    pub image_size: Option<String>,
    pub filesystem: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputSection {
    pub compression: Option<String>,
    pub image_prefix: Option<String>,
}

/// Per-device overrides for one profile.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileConfig {
    #[serde(default)]
    pub general: ProfileGeneral,
    #[serde(default)]
    pub build: ProfileBuild,
    #[serde(default)]
    pub system: SystemSection,
    #[serde(default)]
    pub packages: ProfilePackages,
    pub network: Option<NetworkSection>,
    pub hostapd: Option<HostapdSection>,
    pub dnsmasq: Option<DnsmasqSection>,
    pub fry: Option<FrySection>,
    /// Same layout as [`BaseConfig::extensions`].
    #[serde(flatten)]
    pub extensions: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileGeneral {
    pub codename: Option<String>,
    pub brand: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileBuild {
    pub architecture: Option<String>,
    pub flavor: Option<String>,
    pub image_size: Option<String>,
    pub filesystem: Option<String>,
    pub kernel_package: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SystemSection {
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfilePackages {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSection {
    pub ethernet: Option<EthernetSection>,
    pub wifi: Option<WifiSection>,
    pub bridge: Option<BridgeSection>,
    #[serde(default)]
    pub vlans: Vec<VlanSection>,
    pub firewall: Option<FirewallSection>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EthernetSection {
    pub interface: Option<String>,
    pub dhcp: Option<bool>,
    pub address: Option<String>,
    pub gateway: Option<String>,
    #[serde(default)]
    pub dns: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiSection {
    /// `false` drops the section as if it were absent.
    pub enabled: Option<bool>,
    pub interface: Option<String>,
    pub ap_mode: Option<bool>,
    pub dhcp: Option<bool>,
    pub address: Option<String>,
    pub gateway: Option<String>,
    #[serde(default)]
    pub dns: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeSection {
    /// `false` drops the section as if it were absent.
    pub enabled: Option<bool>,
    pub name: Option<String>,
    #[serde(default)]
    pub members: Vec<String>,
    pub dhcp: Option<bool>,
    pub address: Option<String>,
    pub gateway: Option<String>,
    #[serde(default)]
    pub dns: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlanSection {
    pub id: Option<u16>,
    pub interface: Option<String>,
    pub name: Option<String>,
    pub dhcp: Option<bool>,
    pub address: Option<String>,
    pub gateway: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallSection {
    #[serde(default)]
    pub allow_ports: Vec<u16>,
    pub masquerade: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostapdSection {
    /// `false` drops the section as if it were absent.
    pub enabled: Option<bool>,
    pub interface: Option<String>,
    pub ssid: Option<String>,
    pub password: Option<String>,
    pub channel: Option<u8>,
    pub hw_mode: Option<String>,
    pub country_code: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsmasqSection {
    /// `false` drops the section as if it were absent.
    pub enabled: Option<bool>,
    pub interface: Option<String>,
    pub dhcp_range: Option<String>,
    pub gateway: Option<String>,
    #[serde(default)]
    pub dns: Vec<String>,
    pub domain: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrySection {
    pub bandwidth_mining: Option<bool>,
    pub node_type: Option<String>,
    pub api_endpoint: Option<String>,
}
