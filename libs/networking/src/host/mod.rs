//! Host network state access.
//!
//! The [`HostNetwork`] trait abstracts the kernel objects vxnet manipulates:
//! - Links (bridge, VXLAN, veth) and their up/master state
//! - IPv4 addresses
//! - Routes
//! - ARP neighbors and bridge FDB entries on the tunnel device
//! - Network namespace entry
//!
//! [`IpRoute2`] drives the real kernel through `ip(8)` and `bridge(8)`.
//! [`MockHostNetwork`] keeps everything in memory for tests.

use std::net::Ipv4Addr;
use std::path::Path;

use ipnetwork::Ipv4Network;

use crate::{MacAddr, NetworkError};

mod iproute2;
mod mock;
mod netns;

pub use iproute2::IpRoute2;
pub use mock::{MockHostNetwork, MOCK_HOST_NAMESPACE};
pub use netns::NamespaceGuard;

/// Kind of a network link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    Bridge,
    Vxlan,
    Veth,
    /// Physical or otherwise untyped device.
    Device,
    Other(String),
}

impl LinkKind {
    /// Map a kernel `info_kind` string to a link kind.
    pub fn from_info_kind(kind: Option<&str>) -> Self {
        match kind {
            None => Self::Device,
            Some("bridge") => Self::Bridge,
            Some("vxlan") => Self::Vxlan,
            Some("veth") => Self::Veth,
            Some(other) => Self::Other(other.to_string()),
        }
    }
}

/// A network link as seen in the current namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    /// Kernel interface index.
    pub index: u32,
    /// Interface name.
    pub name: String,
    /// Link kind.
    pub kind: LinkKind,
    /// MTU.
    pub mtu: u32,
    /// Hardware address, if the link has one.
    pub mac: Option<MacAddr>,
    /// Name of the master device (bridge), if enslaved.
    pub master: Option<String>,
    /// Administrative up flag.
    pub up: bool,
    /// Tunnel source address, for VXLAN links bound to one.
    pub local: Option<Ipv4Addr>,
}

/// Parameters for creating a VXLAN device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VxlanSpec {
    /// Device name.
    pub name: String,
    /// VXLAN network identifier.
    pub vni: u32,
    /// Destination UDP port.
    pub port: u16,
    /// Local tunnel source address.
    pub local: Ipv4Addr,
    /// Device MTU.
    pub mtu: u32,
    /// Dynamic MAC learning.
    pub learning: bool,
    /// UDP checksum on transmit.
    pub udp_checksum: bool,
}

/// IPv4 route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Destination network.
    pub destination: Ipv4Network,
    /// Outbound device.
    pub device: String,
    /// Next hop, if any.
    pub gateway: Option<Ipv4Addr>,
    /// Next hop is reachable on the link without a covering route.
    pub onlink: bool,
}

impl Route {
    /// Directly connected route through a device.
    pub fn via_device(destination: Ipv4Network, device: &str) -> Self {
        Self {
            destination,
            device: device.to_string(),
            gateway: None,
            onlink: false,
        }
    }

    /// Route through a gateway on a device.
    pub fn via_gateway(destination: Ipv4Network, device: &str, gateway: Ipv4Addr) -> Self {
        Self {
            destination,
            device: device.to_string(),
            gateway: Some(gateway),
            onlink: false,
        }
    }

    /// Mark the next hop as on-link.
    pub fn with_onlink(mut self) -> Self {
        self.onlink = true;
        self
    }

    /// Default route (0.0.0.0/0) through a gateway.
    pub fn default_via(gateway: Ipv4Addr, device: &str) -> Self {
        Self::via_gateway(default_destination(), device, gateway)
    }

    /// Returns true if this is the default route.
    pub fn is_default(&self) -> bool {
        self.destination.prefix() == 0
    }
}

/// The `0.0.0.0/0` destination.
pub fn default_destination() -> Ipv4Network {
    Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0).expect("zero prefix is valid")
}

/// Permanent ARP entry on a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbor {
    /// Device the entry lives on.
    pub device: String,
    /// Resolved protocol address.
    pub address: Ipv4Addr,
    /// Hardware address it resolves to.
    pub mac: MacAddr,
}

/// Permanent forwarding-database entry on a VXLAN device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FdbEntry {
    /// VXLAN device.
    pub device: String,
    /// Remote tunnel hardware address (the key).
    pub mac: MacAddr,
    /// Remote tunnel endpoint address.
    pub destination: Ipv4Addr,
}

/// Access to host link, address, route and neighbor state.
///
/// All methods act on the network namespace the calling thread is in.
/// Mutations named `replace_*` are idempotent and overwrite any entry with
/// the same key.
pub trait HostNetwork: Send + Sync {
    /// Look up a link by name. Returns `None` if it does not exist.
    fn link(&self, name: &str) -> Result<Option<Link>, NetworkError>;

    /// Look up a link by kernel index.
    fn link_by_index(&self, index: u32) -> Result<Option<Link>, NetworkError>;

    /// Create a bridge device.
    fn add_bridge(&self, name: &str, mtu: u32) -> Result<(), NetworkError>;

    /// Create a VXLAN device.
    fn add_vxlan(&self, spec: &VxlanSpec) -> Result<(), NetworkError>;

    /// Create a veth pair named `name` <-> `peer`.
    fn add_veth_pair(&self, name: &str, peer: &str, mtu: u32) -> Result<(), NetworkError>;

    /// Move a link into the network namespace at `netns`.
    fn move_link(&self, name: &str, netns: &Path) -> Result<(), NetworkError>;

    /// Bring a link administratively up.
    fn set_link_up(&self, name: &str) -> Result<(), NetworkError>;

    /// Enslave a link to a master device.
    fn set_link_master(&self, name: &str, master: &str) -> Result<(), NetworkError>;

    /// List IPv4 addresses bound to a link.
    fn addresses(&self, link: &str) -> Result<Vec<Ipv4Network>, NetworkError>;

    /// Bind an IPv4 address to a link.
    fn add_address(&self, link: &str, address: Ipv4Network) -> Result<(), NetworkError>;

    /// Find the IPv4 default route, if any.
    fn default_route(&self) -> Result<Option<Route>, NetworkError>;

    /// List IPv4 routes through a device.
    fn routes(&self, device: &str) -> Result<Vec<Route>, NetworkError>;

    /// Add a route, failing if one exists for the destination.
    fn add_route(&self, route: &Route) -> Result<(), NetworkError>;

    /// Add or replace the route for a destination.
    fn replace_route(&self, route: &Route) -> Result<(), NetworkError>;

    /// Delete a route.
    fn delete_route(&self, route: &Route) -> Result<(), NetworkError>;

    /// List permanent ARP entries on a device.
    fn neighbors(&self, device: &str) -> Result<Vec<Neighbor>, NetworkError>;

    /// Add or replace a permanent ARP entry.
    fn replace_neighbor(&self, neighbor: &Neighbor) -> Result<(), NetworkError>;

    /// Delete an ARP entry.
    fn delete_neighbor(&self, neighbor: &Neighbor) -> Result<(), NetworkError>;

    /// List FDB entries on a device.
    fn fdb_entries(&self, device: &str) -> Result<Vec<FdbEntry>, NetworkError>;

    /// Add or replace a permanent FDB entry.
    fn replace_fdb(&self, entry: &FdbEntry) -> Result<(), NetworkError>;

    /// Delete an FDB entry.
    fn delete_fdb(&self, entry: &FdbEntry) -> Result<(), NetworkError>;

    /// Run `f` with the calling thread inside the namespace at `netns`.
    ///
    /// `f` receives a path that refers to the namespace the thread came from,
    /// usable as a [`HostNetwork::move_link`] target. The original namespace is
    /// restored before returning, whether `f` succeeds or not.
    fn in_namespace<R, F>(&self, netns: &Path, f: F) -> Result<R, NetworkError>
    where
        Self: Sized,
        F: FnOnce(&Path) -> Result<R, NetworkError>;
}
