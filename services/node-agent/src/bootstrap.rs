//! Daemon startup sequence.
//!
//! ```text
//! connect -> resolve node -> watch nodes -> wait for sync -> fetch node
//!   -> plugin config -> host setup -> tunnel device -> publish identity
//! ```
//!
//! Any failure aborts startup; the caller decides how to exit.

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use tokio::sync::mpsc;
use tracing::{info, warn};
use vxnet_networking::{HostNetwork, PodCidr};

use crate::cluster::{ClusterContext, PeerEvent};
use crate::config::Config;
use crate::device::{ensure_device, OverlayDevice};
use crate::host_setup::{prepare_host, write_plugin_config};
use crate::metadata::{self, pod_cidr_of, KubeNodeRegistry, NodeRegistry};
use crate::sync::PeerReconciler;

/// Everything the steady-state loop needs.
pub struct Bootstrap<H: HostNetwork> {
    pub context: ClusterContext,
    pub node_name: String,
    pub pod_cidr: PodCidr,
    pub reconciler: PeerReconciler<H>,
    pub events: mpsc::UnboundedReceiver<PeerEvent>,
}

/// Bring the node up against the live cluster.
pub async fn bootstrap<H: HostNetwork>(config: &Config, host: H) -> Result<Bootstrap<H>> {
    let source = config.node_source()?;

    let mut context = ClusterContext::connect().await?;
    let node_name = context.resolve_node_name(&source).await?;
    info!(node = %node_name, "Resolved current node");

    let events = context.start_watch(&node_name)?;
    context.wait_for_sync(config.sync_timeout()).await?;

    let node = context.get_node(&node_name).await?;
    let registry = KubeNodeRegistry::new(context.client());
    let (pod_cidr, device) = prepare_node(config, &host, &registry, &node).await?;

    Ok(Bootstrap {
        context,
        node_name,
        pod_cidr,
        reconciler: PeerReconciler::new(host, device),
        events,
    })
}

/// Local setup for `node`: plugin config, host preparation, tunnel device and
/// identity publication.
pub async fn prepare_node<H, R>(
    config: &Config,
    host: &H,
    registry: &R,
    node: &Node,
) -> Result<(PodCidr, OverlayDevice)>
where
    H: HostNetwork,
    R: NodeRegistry + ?Sized,
{
    let node_name = node.name_any();
    let pod_cidr = pod_cidr_of(node)
        .with_context(|| format!("node {} has no usable pod CIDR", node_name))?;
    info!(node = %node_name, pod_cidr = %pod_cidr, "Node pod CIDR");

    write_plugin_config(&config.cni_config_path, &pod_cidr)
        .context("failed to write plugin configuration")?;

    if config.skip_host_setup {
        info!("Skipping host setup");
    } else if let Err(e) = prepare_host(&pod_cidr) {
        // Forwarding rules are best effort; the overlay itself still works.
        warn!(error = %e, "Host setup incomplete");
    }

    let device = ensure_device(host, &pod_cidr).context("failed to set up tunnel device")?;
    info!(
        device = %device.name,
        index = device.index,
        mac = %device.mac,
        source_ip = %device.source_ip,
        mtu = device.mtu,
        "Tunnel device ready"
    );

    metadata::publish(registry, &node_name, &device)
        .await
        .context("failed to publish tunnel identity")?;

    Ok((pod_cidr, device))
}
