//! Configuration for the vxnet daemon.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;

/// Default location of the generated plugin configuration.
pub const DEFAULT_CNI_CONFIG_PATH: &str = "/etc/cni/net.d/00-vxnet.conf";

/// Daemon configuration.
///
/// Every option can also be set through its environment variable, which is
/// how the DaemonSet manifest passes the downward-API node name in.
#[derive(Debug, Clone, Parser)]
#[command(name = "vxnetd", version, about = "vxnet VXLAN overlay node daemon")]
pub struct Config {
    /// Name of the node this daemon runs on.
    #[arg(long, env = "NODE_NAME")]
    pub node_name: Option<String>,

    /// Name of the daemon's own pod, used to resolve the node when
    /// `NODE_NAME` is not set.
    #[arg(long, env = "POD_NAME")]
    pub pod_name: Option<String>,

    /// Namespace of the daemon's own pod.
    #[arg(long, env = "POD_NAMESPACE")]
    pub pod_namespace: Option<String>,

    /// Where to write the plugin configuration file.
    #[arg(long, env = "VXNET_CNI_CONFIG_PATH", default_value = DEFAULT_CNI_CONFIG_PATH)]
    pub cni_config_path: PathBuf,

    /// How long to wait for the initial node list before giving up.
    #[arg(long, env = "VXNET_SYNC_TIMEOUT_SECS", default_value_t = 60)]
    pub sync_timeout_secs: u64,

    /// Skip packet filter and forwarding setup.
    #[arg(long, env = "VXNET_SKIP_HOST_SETUP")]
    pub skip_host_setup: bool,
}

/// How the daemon finds out which node it is on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeSource {
    /// Node name given directly.
    Named(String),
    /// Look up `spec.nodeName` of the daemon's own pod.
    Pod { name: String, namespace: String },
}

impl Config {
    /// Load configuration from command-line arguments and environment variables.
    pub fn from_env() -> Result<Self> {
        let config = Self::try_parse()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations clap cannot express.
    pub fn validate(&self) -> Result<()> {
        self.node_source()?;
        if self.sync_timeout_secs == 0 {
            bail!("VXNET_SYNC_TIMEOUT_SECS must be greater than zero");
        }
        Ok(())
    }

    /// Resolve the node identity source. `NODE_NAME` wins over the pod lookup.
    pub fn node_source(&self) -> Result<NodeSource> {
        if let Some(name) = self.node_name.as_ref().filter(|n| !n.is_empty()) {
            return Ok(NodeSource::Named(name.clone()));
        }

        match (&self.pod_name, &self.pod_namespace) {
            (Some(name), Some(namespace)) if !name.is_empty() && !namespace.is_empty() => {
                Ok(NodeSource::Pod {
                    name: name.clone(),
                    namespace: namespace.clone(),
                })
            }
            _ => bail!("either NODE_NAME or both POD_NAME and POD_NAMESPACE must be set"),
        }
    }

    /// Initial sync timeout.
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        Config::try_parse_from(std::iter::once("vxnetd").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_node_name_wins() {
        let config = parse(&[
            "--node-name",
            "worker-1",
            "--pod-name",
            "vxnet-abcde",
            "--pod-namespace",
            "kube-system",
        ]);

        assert_eq!(
            config.node_source().unwrap(),
            NodeSource::Named("worker-1".to_string())
        );
    }

    #[test]
    fn test_pod_lookup() {
        let config = parse(&["--pod-name", "vxnet-abcde", "--pod-namespace", "kube-system"]);

        assert_eq!(
            config.node_source().unwrap(),
            NodeSource::Pod {
                name: "vxnet-abcde".to_string(),
                namespace: "kube-system".to_string(),
            }
        );
    }

    #[test]
    fn test_pod_name_without_namespace_is_rejected() {
        let config = Config {
            node_name: None,
            pod_name: Some("vxnet-abcde".to_string()),
            pod_namespace: None,
            cni_config_path: PathBuf::from(DEFAULT_CNI_CONFIG_PATH),
            sync_timeout_secs: 60,
            skip_host_setup: false,
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_defaults() {
        let config = parse(&["--node-name", "worker-1"]);

        assert_eq!(config.cni_config_path, PathBuf::from(DEFAULT_CNI_CONFIG_PATH));
        assert_eq!(config.sync_timeout(), Duration::from_secs(60));
        assert!(!config.skip_host_setup);
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let config = parse(&["--node-name", "worker-1", "--sync-timeout-secs", "0"]);
        assert!(config.validate().is_err());
    }
}
