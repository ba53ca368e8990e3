//! Node metadata: publishing and reading tunnel identities.
//!
//! Each node advertises its tunnel endpoint through two annotations on its
//! own `Node` object. Peers combine them with `spec.podCIDR` into a
//! [`PeerIdentity`].

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::{json, Value};
use tracing::{debug, info};
use vxnet_networking::{MacAddr, NetworkError, PodCidr};

use crate::device::OverlayDevice;

/// Annotation carrying the tunnel device hardware address.
pub const VTEP_MAC_ANNOTATION: &str = "vxnet.io/vtep-mac";

/// Annotation carrying the tunnel endpoint address.
pub const HOST_IP_ANNOTATION: &str = "vxnet.io/host-ip";

/// Tunnel identity of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub name: String,
    pub pod_cidr: PodCidr,
    pub vtep_mac: MacAddr,
    pub host_ip: Ipv4Addr,
}

/// Read access to a node's pod block.
pub fn pod_cidr_of(node: &Node) -> Result<PodCidr, NetworkError> {
    let raw = node
        .spec
        .as_ref()
        .and_then(|s| s.pod_cidr.as_deref())
        .filter(|c| !c.is_empty())
        .ok_or_else(|| {
            NetworkError::Configuration(format!("node {} has no podCIDR", node.name_any()))
        })?;
    PodCidr::parse(raw)
}

/// Value of an annotation, if present.
pub fn annotation<'a>(node: &'a Node, key: &str) -> Option<&'a str> {
    node.annotations().get(key).map(String::as_str)
}

/// Parse the tunnel identity a node advertises.
pub fn identity_of(node: &Node) -> Result<PeerIdentity, NetworkError> {
    let name = node.name_any();
    let sync_err = |what: String| NetworkError::Sync(format!("node {}: {}", name, what));

    let pod_cidr = pod_cidr_of(node).map_err(|e| sync_err(e.to_string()))?;

    let vtep_mac = annotation(node, VTEP_MAC_ANNOTATION)
        .ok_or_else(|| sync_err(format!("missing {}", VTEP_MAC_ANNOTATION)))?
        .parse::<MacAddr>()
        .map_err(|e| sync_err(e.to_string()))?;

    let host_ip = annotation(node, HOST_IP_ANNOTATION)
        .ok_or_else(|| sync_err(format!("missing {}", HOST_IP_ANNOTATION)))?
        .parse::<Ipv4Addr>()
        .map_err(|e| sync_err(format!("invalid {}: {}", HOST_IP_ANNOTATION, e)))?;

    Ok(PeerIdentity {
        name,
        pod_cidr,
        vtep_mac,
        host_ip,
    })
}

/// Annotations a node with `device` should carry.
pub fn desired_annotations(device: &OverlayDevice) -> BTreeMap<String, String> {
    BTreeMap::from([
        (VTEP_MAC_ANNOTATION.to_string(), device.mac.to_string()),
        (HOST_IP_ANNOTATION.to_string(), device.source_ip.to_string()),
    ])
}

/// Merge patch setting the changed keys of `desired` on `node`.
///
/// The patch carries the node's resource version so the API server rejects
/// it if the node changed in between. Returns `None` when nothing changed.
pub fn annotation_patch(node: &Node, desired: &BTreeMap<String, String>) -> Option<Value> {
    let current = node.annotations();
    let changed: serde_json::Map<String, Value> = desired
        .iter()
        .filter(|(k, v)| current.get(*k) != Some(*v))
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();

    if changed.is_empty() {
        return None;
    }

    Some(json!({
        "metadata": {
            "resourceVersion": node.resource_version(),
            "annotations": changed,
        }
    }))
}

/// Node lookups and updates.
#[async_trait]
pub trait NodeRegistry: Send + Sync {
    /// Fetch a node by name.
    async fn get_node(&self, name: &str) -> Result<Node, NetworkError>;

    /// Apply a JSON merge patch to a node.
    async fn patch_node(&self, name: &str, patch: &Value) -> Result<Node, NetworkError>;
}

/// Publish this node's tunnel identity.
///
/// Returns `true` if a patch was sent. A conflicting concurrent update is
/// reported as an error, not retried.
pub async fn publish<R>(
    registry: &R,
    node_name: &str,
    device: &OverlayDevice,
) -> Result<bool, NetworkError>
where
    R: NodeRegistry + ?Sized,
{
    let node = registry.get_node(node_name).await?;
    let desired = desired_annotations(device);

    let Some(patch) = annotation_patch(&node, &desired) else {
        debug!(node = node_name, "Tunnel identity already published");
        return Ok(false);
    };

    registry.patch_node(node_name, &patch).await?;

    info!(
        node = node_name,
        vtep_mac = %device.mac,
        host_ip = %device.source_ip,
        "Published tunnel identity"
    );
    Ok(true)
}

/// Fetch and parse a node's tunnel identity.
pub async fn read<R>(registry: &R, name: &str) -> Result<PeerIdentity, NetworkError>
where
    R: NodeRegistry + ?Sized,
{
    let node = registry.get_node(name).await?;
    identity_of(&node)
}

/// [`NodeRegistry`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeNodeRegistry {
    api: Api<Node>,
}

impl KubeNodeRegistry {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl NodeRegistry for KubeNodeRegistry {
    async fn get_node(&self, name: &str) -> Result<Node, NetworkError> {
        self.api
            .get(name)
            .await
            .map_err(|e| NetworkError::Sync(format!("failed to get node {}: {}", name, e)))
    }

    async fn patch_node(&self, name: &str, patch: &Value) -> Result<Node, NetworkError> {
        self.api
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| NetworkError::Sync(format!("failed to patch node {}: {}", name, e)))
    }
}

/// In-memory [`NodeRegistry`] for tests and development.
///
/// Patches merge annotations, honor the `resourceVersion` precondition and
/// bump the version on every write.
#[derive(Debug, Default)]
pub struct MemoryNodeRegistry {
    nodes: Mutex<HashMap<String, Node>>,
    patches: Mutex<Vec<Value>>,
}

impl MemoryNodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a node.
    pub fn insert(&self, node: Node) {
        self.lock_nodes().insert(node.name_any(), node);
    }

    /// Patches received so far.
    pub fn patches(&self) -> Vec<Value> {
        self.patches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn lock_nodes(&self) -> std::sync::MutexGuard<'_, HashMap<String, Node>> {
        self.nodes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl NodeRegistry for MemoryNodeRegistry {
    async fn get_node(&self, name: &str) -> Result<Node, NetworkError> {
        self.lock_nodes()
            .get(name)
            .cloned()
            .ok_or_else(|| NetworkError::NotFound(format!("node {}", name)))
    }

    async fn patch_node(&self, name: &str, patch: &Value) -> Result<Node, NetworkError> {
        let mut nodes = self.lock_nodes();
        let node = nodes
            .get_mut(name)
            .ok_or_else(|| NetworkError::NotFound(format!("node {}", name)))?;

        let metadata = &patch["metadata"];
        if let Some(expected) = metadata["resourceVersion"].as_str() {
            if node.resource_version().as_deref() != Some(expected) {
                return Err(NetworkError::Sync(format!(
                    "conflict patching node {}: resource version {} is stale",
                    name, expected
                )));
            }
        }

        if let Some(annotations) = metadata["annotations"].as_object() {
            let target = node.annotations_mut();
            for (key, value) in annotations {
                match value.as_str() {
                    Some(v) => {
                        target.insert(key.clone(), v.to_string());
                    }
                    None => {
                        target.remove(key);
                    }
                }
            }
        }

        let next = node
            .resource_version()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        node.metadata.resource_version = Some(next.to_string());

        self.patches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(patch.clone());
        Ok(node.clone())
    }
}
