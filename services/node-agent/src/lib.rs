//! vxnet node daemon library.
//!
//! The daemon runs on every node of the cluster and keeps a VXLAN mesh
//! between them:
//!
//! - **Device**: creates the node's tunnel device on the uplink
//! - **Metadata**: publishes the tunnel identity as node annotations
//! - **Cluster**: watches nodes and turns changes into peer events
//! - **Sync**: installs ARP, FDB and route entries for every peer
//! - **Host setup**: forwarding rules and the plugin configuration file

pub mod bootstrap;
pub mod cluster;
pub mod config;
pub mod device;
pub mod host_setup;
pub mod metadata;
pub mod sync;

pub use bootstrap::{bootstrap, prepare_node, Bootstrap};
pub use cluster::{ClusterContext, NodeCache, PeerEvent};
pub use device::{ensure_device, OverlayDevice};
pub use metadata::{identity_of, KubeNodeRegistry, MemoryNodeRegistry, NodeRegistry, PeerIdentity};
pub use sync::PeerReconciler;
