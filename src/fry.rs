//! Fry node agent, bandwidth miner and dashboard services.
//!
//! With mining enabled every artifact below is emitted and the units are
//! queued for enablement. With mining disabled nothing is emitted and the
//! same units are reported as disabled so stale links get removed.

use std::fmt;

use serde::Serialize;
use serde_json::json;

use crate::artifact::ConfigArtifact;
use crate::plan::{BuildPlan, DASHBOARD_PORT};

pub const FRY_CONFIG_PATH: &str = "etc/fry/config.json";
pub const NODE_AGENT_UNIT: &str = "fry-node.service";

/// Units owned by the Fry integration, in enablement order.
pub const FRY_UNITS: &[&str] = &[
    NODE_AGENT_UNIT,
    "bandwidth-miner.service",
    "fry-dashboard.service",
    "fry-update.timer",
    "fry-first-boot.service",
];

const UNIT_DIR: &str = "etc/systemd/system";

/// Role the node registers with on the Fry network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Router,
    Generic,
}

impl NodeType {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "router" => Some(NodeType::Router),
            "generic" => Some(NodeType::Generic),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Router => "router",
            NodeType::Generic => "generic",
        }
    }

    /// Routers forward traffic for the network; generic nodes only share uplink.
    fn max_share_percent(&self) -> u8 {
        match self {
            NodeType::Router => 50,
            NodeType::Generic => 25,
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FryServiceOutput {
    pub artifacts: Vec<ConfigArtifact>,
    pub enabled_units: Vec<String>,
    pub disabled_units: Vec<String>,
    pub node_agent_enabled: bool,
}

pub fn generate(plan: &BuildPlan) -> FryServiceOutput {
    let fry = plan.fry();
    if !fry.bandwidth_mining {
        return FryServiceOutput {
            disabled_units: FRY_UNITS.iter().map(|unit| unit.to_string()).collect(),
            ..FryServiceOutput::default()
        };
    }

    let config = json!({
        "api_endpoint": fry.api_endpoint,
        "node_type": fry.node_type,
        "device": {
            "codename": plan.identity().codename,
            "architecture": plan.architecture(),
        },
        "bandwidth_mining": true,
        "auto_register": true,
        "telemetry": true,
        "dashboard": { "port": DASHBOARD_PORT },
        "bandwidth": {
            "max_share_percent": fry.node_type.max_share_percent(),
            "min_bandwidth_mbps": 1,
        },
        "network": {
            "upnp": fry.node_type == NodeType::Router,
            "nat_pmp": fry.node_type == NodeType::Router,
            "stun_servers": ["stun.l.google.com:19302", "stun1.l.google.com:19302"],
        },
    });
    // serde_json::Value pretty-printing cannot fail.
    let config = serde_json::to_string_pretty(&config).unwrap_or_default() + "\n";

    let artifacts = vec![
        ConfigArtifact::file(FRY_CONFIG_PATH, config),
        unit(
            NODE_AGENT_UNIT,
            "Fry Network node agent",
            "After=network-online.target\nWants=network-online.target",
            "Type=simple\nExecStart=/usr/local/bin/fry-node --config /etc/fry/config.json\nRestart=always\nRestartSec=10",
            "multi-user.target",
        ),
        unit(
            "bandwidth-miner.service",
            "Fry bandwidth miner",
            "After=fry-node.service\nRequires=fry-node.service",
            "Type=simple\nExecStart=/usr/local/bin/bandwidth-miner --config /etc/fry/config.json\nRestart=always\nRestartSec=10",
            "multi-user.target",
        ),
        unit(
            "fry-dashboard.service",
            "Fry contribution dashboard",
            "After=fry-node.service",
            &format!(
                "Type=simple\nExecStart=/usr/local/bin/fry-dashboard --port {}\nRestart=on-failure",
                DASHBOARD_PORT
            ),
            "multi-user.target",
        ),
        unit(
            "fry-update.service",
            "Fry agent update check",
            "After=network-online.target\nWants=network-online.target",
            "Type=oneshot\nExecStart=/usr/local/bin/fry-node --self-update",
            "",
        ),
        ConfigArtifact::file(
            format!("{}/fry-update.timer", UNIT_DIR),
            "[Unit]\nDescription=Daily Fry agent update check\n\n\
             [Timer]\nOnBootSec=15min\nOnUnitActiveSec=1d\nRandomizedDelaySec=1h\n\n\
             [Install]\nWantedBy=timers.target\n",
        ),
        unit(
            "fry-first-boot.service",
            "Fry first boot registration",
            "After=network-online.target\nWants=network-online.target\nConditionPathExists=!/var/lib/fry/.registered",
            "Type=oneshot\nExecStart=/usr/local/bin/fry-first-boot.sh\nRemainAfterExit=yes",
            "multi-user.target",
        ),
        ConfigArtifact::executable("usr/local/bin/fry-first-boot.sh", first_boot_script(plan)),
        ConfigArtifact::executable("usr/local/bin/fry-status", STATUS_SCRIPT),
    ];

    FryServiceOutput {
        artifacts,
        enabled_units: FRY_UNITS.iter().map(|unit| unit.to_string()).collect(),
        disabled_units: Vec::new(),
        node_agent_enabled: true,
    }
}

fn unit(name: &str, description: &str, ordering: &str, service: &str, wanted_by: &str) -> ConfigArtifact {
    let mut text = format!(
        "[Unit]\nDescription={}\n{}\n\n[Service]\n{}\n",
        description, ordering, service
    );
    if !wanted_by.is_empty() {
        text.push_str(&format!("\n[Install]\nWantedBy={}\n", wanted_by));
    }
    ConfigArtifact::file(format!("{}/{}", UNIT_DIR, name), text)
}

fn first_boot_script(plan: &BuildPlan) -> String {
    format!(
        r#"#!/bin/sh
set -eu
mkdir -p /var/lib/fry
if [ ! -s /etc/machine-id ]; then
    systemd-machine-id-setup
fi
/usr/local/bin/fry-node --config /etc/fry/config.json --register \
    --node-type {node_type} --codename {codename}
touch /var/lib/fry/.registered
"#,
        node_type = plan.fry().node_type,
        codename = plan.identity().codename,
    )
}

const STATUS_SCRIPT: &str = r#"#!/bin/sh
for unit in fry-node bandwidth-miner fry-dashboard; do
    printf '%-18s %s\n' "$unit" "$(systemctl is-active "$unit" 2>/dev/null || true)"
done
printf 'dashboard          http://%s:8080\n' "$(hostname -I 2>/dev/null | cut -d' ' -f1)"
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::test_plan;

    #[test]
    fn test_router_mining_emits_agent_config() {
        let plan = test_plan("[fry]\nbandwidth_mining = true\nnode_type = \"router\"\n");
        let output = generate(&plan);
        assert!(output.node_agent_enabled);
        assert!(output.enabled_units.iter().any(|u| u == NODE_AGENT_UNIT));
        assert!(output.disabled_units.is_empty());

        let config = output
            .artifacts
            .iter()
            .find(|a| a.path.to_str() == Some(FRY_CONFIG_PATH))
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&config.contents).unwrap();
        assert_eq!(value["node_type"], "router");
        assert_eq!(value["dashboard"]["port"], 8080);
        assert_eq!(value["network"]["upnp"], true);
        assert_eq!(value["bandwidth"]["max_share_percent"], 50);
    }

    #[test]
    fn test_mining_disabled_emits_nothing() {
        let plan = test_plan("[fry]\nbandwidth_mining = false\nnode_type = \"router\"\n");
        let output = generate(&plan);
        assert!(output.artifacts.is_empty());
        assert!(output.enabled_units.is_empty());
        assert!(!output.node_agent_enabled);
        assert!(output.disabled_units.iter().any(|u| u == NODE_AGENT_UNIT));
    }

    #[test]
    fn test_dashboard_unit_uses_fixed_port() {
        let plan = test_plan("[fry]\nbandwidth_mining = true\nnode_type = \"generic\"\n");
        let output = generate(&plan);
        let dashboard = output
            .artifacts
            .iter()
            .find(|a| a.path.ends_with("fry-dashboard.service"))
            .unwrap();
        assert!(dashboard.contents.contains("--port 8080"));
        let miner = output
            .artifacts
            .iter()
            .find(|a| a.path.ends_with("bandwidth-miner.service"))
            .unwrap();
        assert!(miner.contents.contains("Requires=fry-node.service"));
    }

    #[test]
    fn test_node_type_parse() {
        assert_eq!(NodeType::parse("Router"), Some(NodeType::Router));
        assert_eq!(NodeType::parse("miner"), None);
    }
}
