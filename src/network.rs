//! systemd-networkd, hostapd, dnsmasq and nftables configuration derived from
//! the plan's network sections.
//!
//! Every interface section is checked on its own before anything is
//! rendered. Anything ambiguous (DHCP plus a static address, a bridged port
//! with its own addressing, an access point without hostapd) is rejected.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::net::IpAddr;

use crate::artifact::ConfigArtifact;
use crate::config::{DnsmasqSection, HostapdSection, NetworkSection};
use crate::error::BuildError;
use crate::plan::BuildPlan;

const NETWORKD_DIR: &str = "etc/systemd/network";
pub const HOSTAPD_CONF: &str = "etc/hostapd/hostapd.conf";
pub const DNSMASQ_CONF: &str = "etc/dnsmasq.d/fry-iot.conf";
pub const NFTABLES_CONF: &str = "etc/nftables.conf";

/// Rendered files plus the units they need enabled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkOutput {
    pub artifacts: Vec<ConfigArtifact>,
    pub enabled_units: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Addressing {
    Dhcp,
    Static {
        address: String,
        gateway: Option<String>,
        dns: Vec<String>,
    },
}

impl Addressing {
    fn render(&self, out: &mut String) {
        match self {
            Addressing::Dhcp => out.push_str("DHCP=yes\n"),
            Addressing::Static {
                address,
                gateway,
                dns,
            } => {
                let _ = writeln!(out, "Address={}", address);
                if let Some(gateway) = gateway {
                    let _ = writeln!(out, "Gateway={}", gateway);
                }
                for server in dns {
                    let _ = writeln!(out, "DNS={}", server);
                }
            }
        }
    }
}

fn network_error(section: &str, message: impl Into<String>) -> BuildError {
    BuildError::NetworkConfig {
        section: section.to_string(),
        message: message.into(),
    }
}

fn require_interface<'a>(section: &str, value: Option<&'a str>) -> Result<&'a str, BuildError> {
    match value.map(str::trim) {
        Some(name) if !name.is_empty() => {
            if name.len() > 15 || name.contains(['/', ' ']) {
                return Err(network_error(
                    section,
                    format!("`{}` is not a valid interface name", name),
                ));
            }
            Ok(name)
        }
        _ => Err(network_error(section, "missing required `interface` name")),
    }
}

fn addressing(
    section: &str,
    dhcp: Option<bool>,
    address: Option<&str>,
    gateway: Option<&str>,
    dns: &[String],
) -> Result<Addressing, BuildError> {
    match (dhcp, address) {
        (Some(true), Some(address)) => Err(network_error(
            section,
            format!(
                "`dhcp = true` and static `address = \"{}\"` are mutually exclusive",
                address
            ),
        )),
        (Some(false), None) => Err(network_error(
            section,
            "`dhcp = false` requires a static `address`",
        )),
        (_, Some(address)) => {
            check_cidr(section, address)?;
            Ok(Addressing::Static {
                address: address.to_string(),
                gateway: gateway.map(str::to_string),
                dns: dns.to_vec(),
            })
        }
        (_, None) => {
            if gateway.is_some() {
                return Err(network_error(
                    section,
                    "`gateway` only applies to a static `address`",
                ));
            }
            Ok(Addressing::Dhcp)
        }
    }
}

fn check_cidr(section: &str, address: &str) -> Result<(), BuildError> {
    let invalid = || {
        network_error(
            section,
            format!("`{}` is not an address in CIDR form like 192.168.4.1/24", address),
        )
    };
    let (host, prefix) = address.split_once('/').ok_or_else(invalid)?;
    let host: IpAddr = host.parse().map_err(|_| invalid())?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
    let max = if host.is_ipv4() { 32 } else { 128 };
    if prefix > max {
        return Err(invalid());
    }
    Ok(())
}

/// Bridged ports carry no addressing of their own.
fn reject_bridged_addressing(
    section: &str,
    bridge: &str,
    dhcp: Option<bool>,
    address: Option<&str>,
) -> Result<(), BuildError> {
    if dhcp.is_some() || address.is_some() {
        return Err(network_error(
            section,
            format!(
                "interface is a member of bridge `{}`; configure addressing on the bridge instead",
                bridge
            ),
        ));
    }
    Ok(())
}

/// Name of the bridge `interface` belongs to, if any.
fn bridge_of<'b>(bridge: &'b Option<(String, Vec<String>)>, interface: &str) -> Option<&'b str> {
    bridge
        .as_ref()
        .filter(|(_, members)| members.iter().any(|m| m == interface))
        .map(|(name, _)| name.as_str())
}

struct NetworkFile {
    path: String,
    name: String,
    body: String,
    vlans: Vec<String>,
}

impl NetworkFile {
    fn new(file_name: String, interface: &str) -> Self {
        Self {
            path: format!("{}/{}", NETWORKD_DIR, file_name),
            name: interface.to_string(),
            body: String::new(),
            vlans: Vec::new(),
        }
    }

    fn into_artifact(self) -> ConfigArtifact {
        let mut out = format!("[Match]\nName={}\n\n[Network]\n", self.name);
        out.push_str(&self.body);
        for vlan in &self.vlans {
            let _ = writeln!(out, "VLAN={}", vlan);
        }
        ConfigArtifact::file(self.path, out)
    }
}

/// Validate and render every network-related file for the plan.
pub fn generate(plan: &BuildPlan) -> Result<NetworkOutput, BuildError> {
    let empty = NetworkSection::default();
    let network = plan.network().unwrap_or(&empty);
    let mut files: Vec<NetworkFile> = Vec::new();
    let mut netdevs: Vec<ConfigArtifact> = Vec::new();
    let mut output = NetworkOutput::default();

    let bridge = match &network.bridge {
        Some(section) => {
            let name = section.name.as_deref().unwrap_or("br0");
            require_interface("network.bridge", Some(name))?;
            if section.members.is_empty() {
                return Err(network_error("network.bridge", "`members` must list at least one interface"));
            }
            let addressing = addressing(
                "network.bridge",
                section.dhcp,
                section.address.as_deref(),
                section.gateway.as_deref(),
                &section.dns,
            )?;
            netdevs.push(ConfigArtifact::file(
                format!("{}/05-{}.netdev", NETWORKD_DIR, name),
                format!("[NetDev]\nName={}\nKind=bridge\n", name),
            ));
            let mut file = NetworkFile::new(format!("15-{}.network", name), name);
            addressing.render(&mut file.body);
            files.push(file);
            for member in &section.members {
                let member = require_interface("network.bridge", Some(member.as_str()))?;
                let mut file = NetworkFile::new(format!("16-{}-bridge.network", member), member);
                let _ = writeln!(file.body, "Bridge={}", name);
                files.push(file);
            }
            Some((name.to_string(), section.members.clone()))
        }
        None => None,
    };

    if let Some(ethernet) = &network.ethernet {
        let interface = require_interface("network.ethernet", ethernet.interface.as_deref())?;
        if let Some(bridge_name) = bridge_of(&bridge, interface) {
            reject_bridged_addressing(
                "network.ethernet",
                bridge_name,
                ethernet.dhcp,
                ethernet.address.as_deref(),
            )?;
        } else {
            let addressing = addressing(
                "network.ethernet",
                ethernet.dhcp,
                ethernet.address.as_deref(),
                ethernet.gateway.as_deref(),
                &ethernet.dns,
            )?;
            let mut file = NetworkFile::new("10-ethernet.network".to_string(), interface);
            addressing.render(&mut file.body);
            files.push(file);
        }
    }

    let mut ap_interface = None;
    if let Some(wifi) = &network.wifi {
        let interface = require_interface("network.wifi", wifi.interface.as_deref())?;
        let ap_mode = wifi
            .ap_mode
            .ok_or_else(|| network_error("network.wifi", "missing required `ap_mode` flag"))?;
        match (ap_mode, plan.hostapd()) {
            (true, None) => {
                return Err(network_error(
                    "network.wifi",
                    "`ap_mode = true` requires a [hostapd] section",
                ))
            }
            (false, Some(_)) => {
                return Err(network_error(
                    "network.wifi",
                    "`ap_mode = false` conflicts with the [hostapd] section",
                ))
            }
            _ => {}
        }
        if let Some(bridge_name) = bridge_of(&bridge, interface) {
            reject_bridged_addressing("network.wifi", bridge_name, wifi.dhcp, wifi.address.as_deref())?;
        } else {
            let addressing = addressing(
                "network.wifi",
                wifi.dhcp,
                wifi.address.as_deref(),
                wifi.gateway.as_deref(),
                &wifi.dns,
            )?;
            if ap_mode && addressing == Addressing::Dhcp {
                return Err(network_error(
                    "network.wifi",
                    "an access point needs a static `address` or bridge membership",
                ));
            }
            let mut file = NetworkFile::new("20-wireless.network".to_string(), interface);
            addressing.render(&mut file.body);
            files.push(file);
        }
        if ap_mode {
            ap_interface = Some(interface.to_string());
        }
    } else if plan.hostapd().is_some() {
        return Err(network_error(
            "hostapd",
            "a [hostapd] section needs a [network.wifi] section with `ap_mode = true`",
        ));
    }

    let mut vlan_names: BTreeMap<String, u16> = BTreeMap::new();
    for (index, vlan) in network.vlans.iter().enumerate() {
        let section = format!("network.vlans[{}]", index);
        let id = vlan
            .id
            .ok_or_else(|| network_error(&section, "missing required `id`"))?;
        let parent = require_interface(&section, vlan.interface.as_deref())?;
        let name = vlan.name.clone().unwrap_or_else(|| format!("vlan{}", id));
        require_interface(&section, Some(name.as_str()))?;
        if vlan_names.values().any(|existing| *existing == id) {
            return Err(network_error(&section, format!("VLAN id {} is declared twice", id)));
        }
        if vlan_names.insert(name.clone(), id).is_some() {
            return Err(network_error(&section, format!("VLAN name `{}` is declared twice", name)));
        }
        let addressing = addressing(
            &section,
            vlan.dhcp,
            vlan.address.as_deref(),
            vlan.gateway.as_deref(),
            &[],
        )?;

        netdevs.push(ConfigArtifact::file(
            format!("{}/05-{}.netdev", NETWORKD_DIR, name),
            format!("[NetDev]\nName={}\nKind=vlan\n\n[VLAN]\nId={}\n", name, id),
        ));
        let mut file = NetworkFile::new(format!("20-{}.network", name), &name);
        addressing.render(&mut file.body);
        files.push(file);

        match files.iter().position(|file| file.name == parent) {
            Some(pos) => files[pos].vlans.push(name),
            None => {
                let mut carrier = NetworkFile::new(format!("19-{}-vlans.network", parent), parent);
                carrier.body.push_str("LinkLocalAddressing=no\n");
                carrier.vlans.push(name);
                files.push(carrier);
            }
        }
    }

    let configured = !files.is_empty();
    output.artifacts.extend(netdevs);
    output
        .artifacts
        .extend(files.into_iter().map(NetworkFile::into_artifact));
    if configured {
        output.enabled_units.push("systemd-networkd.service".to_string());
    }

    if let Some(hostapd) = plan.hostapd() {
        let ap_interface = ap_interface.as_deref().unwrap_or_default();
        output.artifacts.push(render_hostapd(hostapd, ap_interface, bridge_of(&bridge, ap_interface))?);
        output.enabled_units.push("hostapd.service".to_string());
    }

    if let Some(dnsmasq) = plan.dnsmasq() {
        output.artifacts.push(render_dnsmasq(dnsmasq)?);
        output.enabled_units.push("dnsmasq.service".to_string());
    }

    if let Some(firewall) = &network.firewall {
        let mut ports = vec![22u16];
        if plan.fry().bandwidth_mining {
            ports.push(plan.dashboard_port());
        }
        ports.extend(firewall.allow_ports.iter().copied());
        ports.sort_unstable();
        ports.dedup();

        let lan = plan.dnsmasq().and_then(|d| d.interface.as_deref());
        let wan = match firewall.masquerade.as_deref() {
            Some(wan) => Some(require_interface("network.firewall", Some(wan))?),
            None => None,
        };
        output
            .artifacts
            .push(ConfigArtifact::file(NFTABLES_CONF, render_nftables(&ports, lan, wan)));
        if wan.is_some() {
            output.artifacts.push(ConfigArtifact::file(
                "etc/sysctl.d/90-fry-forwarding.conf",
                "net.ipv4.ip_forward=1\nnet.ipv6.conf.all.forwarding=1\n",
            ));
        }
        output.enabled_units.push("nftables.service".to_string());
    }

    Ok(output)
}

fn render_hostapd(
    section: &HostapdSection,
    wifi_interface: &str,
    bridge: Option<&str>,
) -> Result<ConfigArtifact, BuildError> {
    let interface = section.interface.as_deref().unwrap_or(wifi_interface);
    if interface != wifi_interface {
        return Err(network_error(
            "hostapd",
            format!(
                "`interface = \"{}\"` does not match the access point interface `{}`",
                interface, wifi_interface
            ),
        ));
    }
    let ssid = section
        .ssid
        .as_deref()
        .filter(|ssid| !ssid.is_empty() && ssid.len() <= 32)
        .ok_or_else(|| network_error("hostapd", "`ssid` must be 1 to 32 characters"))?;
    let password = section
        .password
        .as_deref()
        .filter(|password| (8..=63).contains(&password.len()))
        .ok_or_else(|| network_error("hostapd", "`password` must be 8 to 63 characters"))?;
    let hw_mode = section.hw_mode.as_deref().unwrap_or("g");
    if !matches!(hw_mode, "a" | "b" | "g") {
        return Err(network_error(
            "hostapd",
            format!("`hw_mode = \"{}\"` is not one of a, b, g", hw_mode),
        ));
    }

    let mut out = String::new();
    let _ = writeln!(out, "interface={}", interface);
    if let Some(bridge) = bridge {
        let _ = writeln!(out, "bridge={}", bridge);
    }
    out.push_str("driver=nl80211\n");
    let _ = writeln!(out, "ssid={}", ssid);
    let _ = writeln!(out, "hw_mode={}", hw_mode);
    let _ = writeln!(out, "channel={}", section.channel.unwrap_or(6));
    if let Some(country) = &section.country_code {
        let _ = writeln!(out, "country_code={}", country);
        out.push_str("ieee80211d=1\n");
    }
    out.push_str(
        "ieee80211n=1\n\
         wmm_enabled=1\n\
         auth_algs=1\n\
         ignore_broadcast_ssid=0\n\
         wpa=2\n",
    );
    let _ = writeln!(out, "wpa_passphrase={}", password);
    out.push_str("wpa_key_mgmt=WPA-PSK\nrsn_pairwise=CCMP\n");
    Ok(ConfigArtifact::private(HOSTAPD_CONF, out))
}

fn render_dnsmasq(section: &DnsmasqSection) -> Result<ConfigArtifact, BuildError> {
    let interface = require_interface("dnsmasq", section.interface.as_deref())?;
    let mut out = String::new();
    let _ = writeln!(out, "interface={}", interface);
    out.push_str("bind-interfaces\n");
    if let Some(range) = &section.dhcp_range {
        let _ = writeln!(out, "dhcp-range={}", range);
    }
    if let Some(gateway) = &section.gateway {
        let _ = writeln!(out, "dhcp-option=option:router,{}", gateway);
    }
    if !section.dns.is_empty() {
        let _ = writeln!(out, "dhcp-option=option:dns-server,{}", section.dns.join(","));
    }
    if let Some(domain) = &section.domain {
        let _ = writeln!(out, "domain={}", domain);
        out.push_str("local=/");
        out.push_str(domain);
        out.push_str("/\n");
    }
    Ok(ConfigArtifact::file(DNSMASQ_CONF, out))
}

fn render_nftables(ports: &[u16], lan: Option<&str>, wan: Option<&str>) -> String {
    let port_list = ports
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    let mut out = String::from("#!/usr/sbin/nft -f\nflush ruleset\n\ntable inet filter {\n");
    out.push_str("    chain input {\n        type filter hook input priority 0; policy drop;\n");
    out.push_str("        ct state established,related accept\n");
    out.push_str("        iif \"lo\" accept\n");
    out.push_str("        meta l4proto { icmp, ipv6-icmp } accept\n");
    let _ = writeln!(out, "        tcp dport {{ {} }} accept", port_list);
    if let Some(lan) = lan {
        let _ = writeln!(out, "        iifname \"{}\" udp dport {{ 53, 67 }} accept", lan);
        let _ = writeln!(out, "        iifname \"{}\" tcp dport 53 accept", lan);
    }
    out.push_str("    }\n\n    chain forward {\n        type filter hook forward priority 0; policy drop;\n");
    if let Some(wan) = wan {
        out.push_str("        ct state established,related accept\n");
        let _ = writeln!(out, "        oifname \"{}\" accept", wan);
    }
    out.push_str("    }\n\n    chain output {\n        type filter hook output priority 0; policy accept;\n    }\n}\n");
    if let Some(wan) = wan {
        out.push_str("\ntable ip nat {\n    chain postrouting {\n        type nat hook postrouting priority 100;\n");
        let _ = writeln!(out, "        oifname \"{}\" masquerade", wan);
        out.push_str("    }\n}\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::test_plan;

    fn artifact<'a>(output: &'a NetworkOutput, path: &str) -> &'a ConfigArtifact {
        output
            .artifacts
            .iter()
            .find(|a| a.path.to_str() == Some(path))
            .unwrap_or_else(|| panic!("missing artifact {path}"))
    }

    fn section_of(err: BuildError) -> String {
        match err {
            BuildError::NetworkConfig { section, .. } => section,
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_dhcp_and_static_address_is_rejected() {
        let plan = test_plan(
            "[network.ethernet]\ninterface = \"eth0\"\ndhcp = true\naddress = \"10.0.0.2/24\"\n",
        );
        assert_eq!(section_of(generate(&plan).unwrap_err()), "network.ethernet");
    }

    #[test]
    fn test_missing_interface_names_section() {
        let plan = test_plan("[network.ethernet]\ndhcp = true\n");
        let err = generate(&plan).unwrap_err();
        assert_eq!(
            err,
            BuildError::NetworkConfig {
                section: "network.ethernet".to_string(),
                message: "missing required `interface` name".to_string(),
            }
        );
    }

    #[test]
    fn test_ethernet_defaults_to_dhcp() {
        let plan = test_plan("[network.ethernet]\ninterface = \"eth0\"\n");
        let output = generate(&plan).unwrap();
        let file = artifact(&output, "etc/systemd/network/10-ethernet.network");
        assert_eq!(file.contents, "[Match]\nName=eth0\n\n[Network]\nDHCP=yes\n");
        assert_eq!(output.enabled_units, vec!["systemd-networkd.service"]);
    }

    #[test]
    fn test_wifi_requires_ap_mode_flag() {
        let plan = test_plan("[network.wifi]\ninterface = \"wlan0\"\n");
        let err = generate(&plan).unwrap_err();
        assert!(matches!(err, BuildError::NetworkConfig { ref message, .. } if message.contains("ap_mode")));
    }

    #[test]
    fn test_ap_mode_must_agree_with_hostapd() {
        let without = test_plan(
            "[network.wifi]\ninterface = \"wlan0\"\nap_mode = true\naddress = \"192.168.4.1/24\"\n",
        );
        assert_eq!(section_of(generate(&without).unwrap_err()), "network.wifi");

        let stray = test_plan(
            "[network.wifi]\ninterface = \"wlan0\"\nap_mode = false\n[hostapd]\nssid = \"x\"\npassword = \"12345678\"\n",
        );
        assert_eq!(section_of(generate(&stray).unwrap_err()), "network.wifi");

        let orphan = test_plan("[hostapd]\nssid = \"x\"\npassword = \"12345678\"\n");
        assert_eq!(section_of(generate(&orphan).unwrap_err()), "hostapd");
    }

    #[test]
    fn test_router_profile_renders_ap_stack() {
        let plan = test_plan(
            r#"
[network.ethernet]
interface = "eth0"

[network.wifi]
interface = "wlan0"
ap_mode = true
address = "192.168.4.1/24"

[network.firewall]
allow_ports = [443]
masquerade = "eth0"

[hostapd]
ssid = "FryNet"
password = "fry-secret"
channel = 11
country_code = "DE"

[dnsmasq]
interface = "wlan0"
dhcp_range = "192.168.4.10,192.168.4.100,12h"
gateway = "192.168.4.1"
dns = ["1.1.1.1", "9.9.9.9"]

[fry]
bandwidth_mining = true
"#,
        );
        let output = generate(&plan).unwrap();

        let hostapd = artifact(&output, HOSTAPD_CONF);
        assert_eq!(hostapd.mode, 0o600);
        assert!(hostapd.contents.contains("interface=wlan0\n"));
        assert!(hostapd.contents.contains("channel=11\n"));
        assert!(hostapd.contents.contains("wpa_passphrase=fry-secret\n"));

        let dnsmasq = artifact(&output, DNSMASQ_CONF);
        assert!(dnsmasq
            .contents
            .contains("dhcp-option=option:dns-server,1.1.1.1,9.9.9.9\n"));

        let nft = artifact(&output, NFTABLES_CONF);
        assert!(nft.contents.contains("tcp dport { 22, 443, 8080 } accept"));
        assert!(nft.contents.contains("oifname \"eth0\" masquerade"));
        assert!(nft.contents.contains("iifname \"wlan0\" udp dport { 53, 67 } accept"));

        assert_eq!(
            output.enabled_units,
            vec![
                "systemd-networkd.service",
                "hostapd.service",
                "dnsmasq.service",
                "nftables.service"
            ]
        );
    }

    #[test]
    fn test_vlans_attach_to_parent_interface() {
        let plan = test_plan(
            r#"
[network.ethernet]
interface = "eth0"

[[network.vlans]]
id = 10
interface = "eth0"
address = "10.10.0.1/24"

[[network.vlans]]
id = 20
name = "iot"
interface = "eth1"
"#,
        );
        let output = generate(&plan).unwrap();
        let parent = artifact(&output, "etc/systemd/network/10-ethernet.network");
        assert!(parent.contents.ends_with("DHCP=yes\nVLAN=vlan10\n"));
        let netdev = artifact(&output, "etc/systemd/network/05-vlan10.netdev");
        assert!(netdev.contents.contains("Id=10"));
        let carrier = artifact(&output, "etc/systemd/network/19-eth1-vlans.network");
        assert!(carrier.contents.contains("VLAN=iot"));
    }

    #[test]
    fn test_duplicate_vlan_id_is_rejected() {
        let plan = test_plan(
            "[[network.vlans]]\nid = 10\ninterface = \"eth0\"\n[[network.vlans]]\nid = 10\nname = \"b\"\ninterface = \"eth0\"\n",
        );
        assert_eq!(section_of(generate(&plan).unwrap_err()), "network.vlans[1]");
    }

    #[test]
    fn test_bridge_member_cannot_carry_addressing() {
        let plan = test_plan(
            r#"
[network.ethernet]
interface = "eth0"
dhcp = true

[network.bridge]
members = ["eth0", "eth1"]
address = "192.168.1.1/24"
"#,
        );
        assert_eq!(section_of(generate(&plan).unwrap_err()), "network.ethernet");
    }

    #[test]
    fn test_bridge_renders_netdev_and_members() {
        let plan = test_plan(
            "[network.bridge]\nname = \"lan\"\nmembers = [\"eth1\", \"eth2\"]\naddress = \"192.168.1.1/24\"\n",
        );
        let output = generate(&plan).unwrap();
        assert!(artifact(&output, "etc/systemd/network/05-lan.netdev")
            .contents
            .contains("Kind=bridge"));
        assert!(artifact(&output, "etc/systemd/network/16-eth2-bridge.network")
            .contents
            .contains("Bridge=lan"));
        assert!(artifact(&output, "etc/systemd/network/15-lan.network")
            .contents
            .contains("Address=192.168.1.1/24"));
    }

    #[test]
    fn test_static_address_needs_cidr() {
        let plan = test_plan("[network.ethernet]\ninterface = \"eth0\"\naddress = \"10.0.0.2\"\n");
        assert_eq!(section_of(generate(&plan).unwrap_err()), "network.ethernet");
    }

    #[test]
    fn test_no_network_section_renders_nothing() {
        let output = generate(&test_plan("")).unwrap();
        assert!(output.artifacts.is_empty());
        assert!(output.enabled_units.is_empty());
    }

    #[test]
    fn test_disabled_dnsmasq_is_not_rendered() {
        let plan = test_plan(
            "[network.ethernet]\ninterface = \"eth0\"\ndhcp = true\n\n\
             [dnsmasq]\nenabled = false\ninterface = \"eth0\"\n",
        );
        let output = generate(&plan).unwrap();
        assert!(!output.enabled_units.iter().any(|u| u == "dnsmasq.service"));
        assert!(!output
            .artifacts
            .iter()
            .any(|a| a.path.to_string_lossy().contains("dnsmasq")));
    }
}
