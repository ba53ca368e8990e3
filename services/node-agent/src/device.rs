//! VXLAN tunnel device lifecycle.
//!
//! Each node has exactly one tunnel device. It is bound to the address of the
//! interface carrying the default route, owns the `/32` of the node's pod
//! block network address, and routes the whole cluster range.

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use tracing::{debug, info};
use vxnet_networking::{
    calculate_inner_mtu, HostNetwork, Link, LinkKind, MacAddr, NetworkError, PodCidr, Route,
    VxlanSpec, VXLAN_OVERHEAD,
};

/// Tunnel device name.
pub const DEVICE_NAME: &str = "vxnet.1";

/// VXLAN network identifier.
pub const VNI: u32 = 1;

/// VXLAN UDP port (Linux legacy default).
pub const VXLAN_PORT: u16 = 8472;

/// The node's tunnel device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayDevice {
    pub name: String,
    pub index: u32,
    pub mtu: u32,
    /// Local tunnel endpoint the device is bound to.
    pub source_ip: Ipv4Addr,
    pub mac: MacAddr,
    pub vni: u32,
    pub port: u16,
}

/// Interface carrying the default route.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Uplink {
    name: String,
    address: Ipv4Addr,
    mtu: u32,
}

/// Get or create the tunnel device for `cidr`.
///
/// An existing device is completed (address, link state, cluster route) but
/// never recreated, and keeps the source address it was bound to. The uplink
/// is only consulted when the device has to be created. Calling this on a
/// configured host changes nothing.
pub fn ensure_device<H: HostNetwork>(host: &H, cidr: &PodCidr) -> Result<OverlayDevice, NetworkError> {
    let (link, source_ip) = match host.link(DEVICE_NAME)? {
        Some(link) => {
            debug!(device = DEVICE_NAME, index = link.index, "Tunnel device already present");
            require_vxlan(&link)?;
            let source_ip = match link.local {
                Some(local) => local,
                None => discover_uplink(host)?.address,
            };
            (link, source_ip)
        }
        None => {
            let uplink = discover_uplink(host)?;
            let link = create(host, &uplink)?;
            require_vxlan(&link)?;
            let source_ip = link.local.unwrap_or(uplink.address);
            (link, source_ip)
        }
    };

    configure(host, &link, cidr)?;

    let mac = link.mac.ok_or_else(|| {
        NetworkError::Device(format!("{} has no hardware address", DEVICE_NAME))
    })?;

    Ok(OverlayDevice {
        name: link.name,
        index: link.index,
        mtu: link.mtu,
        source_ip,
        mac,
        vni: VNI,
        port: VXLAN_PORT,
    })
}

fn require_vxlan(link: &Link) -> Result<(), NetworkError> {
    if link.kind != LinkKind::Vxlan {
        return Err(NetworkError::Device(format!(
            "{} exists but is a {:?}, not a vxlan device",
            DEVICE_NAME, link.kind
        )));
    }
    Ok(())
}

fn discover_uplink<H: HostNetwork>(host: &H) -> Result<Uplink, NetworkError> {
    let route = host
        .default_route()?
        .ok_or_else(|| NetworkError::Device("no default route on host".to_string()))?;

    let address = host
        .addresses(&route.device)?
        .first()
        .map(|a| a.ip())
        .ok_or_else(|| {
            NetworkError::Device(format!("uplink {} has no IPv4 address", route.device))
        })?;

    let link = host.link(&route.device)?.ok_or_else(|| {
        NetworkError::Device(format!("uplink {} disappeared", route.device))
    })?;

    debug!(uplink = %link.name, address = %address, mtu = link.mtu, "Discovered uplink");

    Ok(Uplink {
        name: link.name,
        address,
        mtu: link.mtu,
    })
}

fn create<H: HostNetwork>(host: &H, uplink: &Uplink) -> Result<Link, NetworkError> {
    let spec = VxlanSpec {
        name: DEVICE_NAME.to_string(),
        vni: VNI,
        port: VXLAN_PORT,
        local: uplink.address,
        mtu: calculate_inner_mtu(uplink.mtu, VXLAN_OVERHEAD)?,
        learning: false,
        udp_checksum: true,
    };

    match host.add_vxlan(&spec) {
        Ok(()) => {
            info!(
                device = DEVICE_NAME,
                vni = VNI,
                port = VXLAN_PORT,
                local = %uplink.address,
                uplink = %uplink.name,
                mtu = spec.mtu,
                "Created tunnel device"
            );
        }
        Err(e) if e.is_already_exists() => {
            debug!(device = DEVICE_NAME, "Tunnel device created concurrently, re-fetching");
        }
        Err(e) => {
            return Err(NetworkError::Device(format!(
                "failed to create {}: {}",
                DEVICE_NAME, e
            )))
        }
    }

    host.link(DEVICE_NAME)?.ok_or_else(|| {
        NetworkError::Device(format!("{} missing after creation", DEVICE_NAME))
    })
}

fn configure<H: HostNetwork>(host: &H, link: &Link, cidr: &PodCidr) -> Result<(), NetworkError> {
    if host.addresses(&link.name)?.is_empty() {
        let address = Ipv4Network::new(cidr.network_address(), 32)
            .map_err(|e| NetworkError::Configuration(e.to_string()))?;
        host.add_address(&link.name, address)?;
        debug!(device = %link.name, address = %address, "Assigned tunnel address");
    }

    if !link.up {
        host.set_link_up(&link.name)?;
    }

    let cluster = cidr.cluster_range();
    let installed = host
        .routes(&link.name)?
        .iter()
        .any(|r| r.destination == cluster && r.gateway.is_none());
    if !installed {
        host.replace_route(&Route::via_device(cluster, &link.name))?;
        debug!(device = %link.name, destination = %cluster, "Installed cluster route");
    }

    Ok(())
}
