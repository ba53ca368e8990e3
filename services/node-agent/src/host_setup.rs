//! Host preparation: packet filter rules, IPv4 forwarding and the plugin
//! configuration file.

use std::fs;
use std::path::Path;
use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use vxnet_networking::{NetworkError, PodCidr};

/// Kernel switch for IPv4 forwarding.
pub const IP_FORWARD_PATH: &str = "/proc/sys/net/ipv4/ip_forward";

/// CNI version written into the generated plugin configuration.
pub const PLUGIN_CNI_VERSION: &str = "0.3.1";

/// Network and plugin type name.
pub const PLUGIN_NAME: &str = "vxnet";

/// Contents of the generated plugin configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginConfig {
    pub cni_version: String,
    pub name: String,
    #[serde(rename = "type")]
    pub plugin_type: String,
    #[serde(rename = "podcidr")]
    pub pod_cidr: String,
}

impl PluginConfig {
    pub fn for_cidr(cidr: &PodCidr) -> Self {
        Self {
            cni_version: PLUGIN_CNI_VERSION.to_string(),
            name: PLUGIN_NAME.to_string(),
            plugin_type: PLUGIN_NAME.to_string(),
            pod_cidr: cidr.to_string(),
        }
    }
}

/// Write the plugin configuration for `cidr` to `path`.
pub fn write_plugin_config(path: &Path, cidr: &PodCidr) -> Result<(), NetworkError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(&PluginConfig::for_cidr(cidr))
        .map_err(|e| NetworkError::Configuration(format!("failed to encode plugin config: {}", e)))?;

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    fs::write(&tmp_name, json)?;
    fs::rename(&tmp_name, path)?;

    info!(path = %path.display(), pod_cidr = %cidr, "Wrote plugin configuration");
    Ok(())
}

/// One `iptables` rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRule {
    pub table: &'static str,
    pub chain: &'static str,
    pub spec: Vec<String>,
}

impl FilterRule {
    fn new(table: &'static str, chain: &'static str, spec: &[&str]) -> Self {
        Self {
            table,
            chain,
            spec: spec.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn args<'a>(&'a self, verb: &'a str) -> Vec<&'a str> {
        let mut args = vec!["-t", self.table, verb, self.chain];
        args.extend(self.spec.iter().map(String::as_str));
        args
    }
}

/// Rules that let pod traffic cross the node and reach the outside.
pub fn forward_rules(cidr: &PodCidr) -> Vec<FilterRule> {
    let cluster = cidr.cluster_range().to_string();
    let pods = cidr.to_string();
    vec![
        FilterRule::new("filter", "FORWARD", &["-s", cluster.as_str(), "-j", "ACCEPT"]),
        FilterRule::new("filter", "FORWARD", &["-d", cluster.as_str(), "-j", "ACCEPT"]),
        FilterRule::new("nat", "POSTROUTING", &["-s", pods.as_str(), "-j", "MASQUERADE"]),
    ]
}

/// Install the forwarding rules, set the FORWARD policy to ACCEPT and
/// enable IPv4 forwarding.
pub fn prepare_host(cidr: &PodCidr) -> Result<(), NetworkError> {
    for rule in forward_rules(cidr) {
        ensure_rule(&rule)?;
    }

    run_iptables(&["--policy", "FORWARD", "ACCEPT"])?;
    enable_ip_forward(Path::new(IP_FORWARD_PATH))?;

    info!(pod_cidr = %cidr, "Host prepared for pod forwarding");
    Ok(())
}

/// Turn on IPv4 forwarding through the given sysctl file.
pub fn enable_ip_forward(path: &Path) -> Result<(), NetworkError> {
    fs::write(path, "1")?;
    debug!(path = %path.display(), "Enabled IPv4 forwarding");
    Ok(())
}

/// Append `rule` unless an identical one exists.
fn ensure_rule(rule: &FilterRule) -> Result<(), NetworkError> {
    let present = Command::new("iptables")
        .args(rule.args("-C"))
        .output()?
        .status
        .success();

    if present {
        debug!(table = rule.table, chain = rule.chain, rule = ?rule.spec, "Rule already present");
        return Ok(());
    }

    run_iptables(&rule.args("-A"))?;
    debug!(table = rule.table, chain = rule.chain, rule = ?rule.spec, "Appended rule");
    Ok(())
}

fn run_iptables(args: &[&str]) -> Result<(), NetworkError> {
    let output = Command::new("iptables").args(args).output()?;

    if !output.status.success() {
        return Err(NetworkError::Command {
            command: format!("iptables {}", args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(())
}
