//! Container veth plumbing.

use std::net::Ipv4Addr;
use std::path::Path;

use ipnetwork::Ipv4Network;
use tracing::{debug, info};
use vxnet_networking::{HostNetwork, MacAddr, NetworkError, Route};

use crate::bridge::LocalBridge;

/// Attempts at finding an unused host-side name.
const NAME_ATTEMPTS: usize = 8;

/// What to build inside the container namespace.
#[derive(Debug, Clone)]
pub struct VethRequest<'a> {
    pub netns: &'a Path,
    pub if_name: &'a str,
    pub address: Ipv4Network,
    pub gateway: Ipv4Addr,
    pub mtu: u32,
}

/// A wired-up veth pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VethPair {
    /// Interface name inside the container.
    pub container_name: String,
    /// Container-side hardware address.
    pub container_mac: Option<MacAddr>,
    /// Host-side interface name.
    pub host_name: String,
}

/// Random host-side interface name (`veth` plus 8 hex digits).
pub fn host_veth_name() -> String {
    format!("veth{:08x}", rand::random::<u32>())
}

/// Create a veth pair, configure the container end and attach the host end
/// to `bridge`.
///
/// The pair is created inside the container namespace and the host end is
/// moved back out, so a name clash on the host cannot leave a half-built
/// pair behind in the container.
pub fn setup_veth<H: HostNetwork>(
    host: &H,
    bridge: &LocalBridge,
    req: &VethRequest<'_>,
) -> Result<VethPair, NetworkError> {
    let pair = host.in_namespace(req.netns, |origin| {
        if host.link(req.if_name)?.is_some() {
            return Err(NetworkError::Device(format!(
                "container interface {} already exists",
                req.if_name
            )));
        }

        let host_name = create_pair(host, req.if_name, req.mtu)?;
        host.move_link(&host_name, origin)?;

        host.add_address(req.if_name, req.address)?;
        host.set_link_up(req.if_name)?;
        host.add_route(&Route::default_via(req.gateway, req.if_name))?;

        let container_mac = host.link(req.if_name)?.and_then(|l| l.mac);

        debug!(
            netns = %req.netns.display(),
            interface = req.if_name,
            address = %req.address,
            "Configured container interface"
        );

        Ok(VethPair {
            container_name: req.if_name.to_string(),
            container_mac,
            host_name,
        })
    })?;

    if host.link(&pair.host_name)?.is_none() {
        return Err(NetworkError::Device(format!(
            "host end {} missing after move",
            pair.host_name
        )));
    }
    host.set_link_up(&pair.host_name)?;
    host.set_link_master(&pair.host_name, &bridge.name)?;

    info!(
        host_veth = %pair.host_name,
        bridge = %bridge.name,
        address = %req.address,
        "Attached container to bridge"
    );

    Ok(pair)
}

fn create_pair<H: HostNetwork>(host: &H, if_name: &str, mtu: u32) -> Result<String, NetworkError> {
    let mut last_err = None;
    for _ in 0..NAME_ATTEMPTS {
        let host_name = host_veth_name();
        match host.add_veth_pair(if_name, &host_name, mtu) {
            Ok(()) => return Ok(host_name),
            Err(e) if e.is_already_exists() => last_err = Some(e),
            Err(e) => return Err(e),
        }
    }

    Err(last_err.unwrap_or_else(|| {
        NetworkError::Device("could not pick a free veth name".to_string())
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::ensure_bridge;
    use vxnet_networking::{LinkKind, MockHostNetwork, PodCidr, MOCK_HOST_NAMESPACE};

    const NETNS: &str = "/var/run/netns/pod-a";

    fn setup() -> (MockHostNetwork, LocalBridge) {
        let host = MockHostNetwork::new();
        host.add_namespace(NETNS);
        let cidr = PodCidr::parse("10.244.3.0/24").unwrap();
        let bridge = ensure_bridge(&host, &cidr, 1500).unwrap();
        (host, bridge)
    }

    fn request(if_name: &str) -> VethRequest<'_> {
        VethRequest {
            netns: Path::new(NETNS),
            if_name,
            address: "10.244.3.2/24".parse().unwrap(),
            gateway: "10.244.3.1".parse().unwrap(),
            mtu: 1500,
        }
    }

    #[test]
    fn test_host_veth_name_shape() {
        let name = host_veth_name();
        assert_eq!(name.len(), 12);
        assert!(name.starts_with("veth"));
        assert!(name[4..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_setup_veth_wires_both_ends() {
        let (host, bridge) = setup();

        let pair = setup_veth(&host, &bridge, &request("eth0")).unwrap();

        assert_eq!(host.current_namespace(), Path::new(MOCK_HOST_NAMESPACE));
        assert_eq!(host.links_in(NETNS), vec!["eth0".to_string()]);

        let host_end = host.link(&pair.host_name).unwrap().unwrap();
        assert_eq!(host_end.kind, LinkKind::Veth);
        assert_eq!(host_end.master.as_deref(), Some("vxnet0"));
        assert!(host_end.up);

        host.in_namespace(Path::new(NETNS), |_| {
            assert_eq!(
                host.addresses("eth0")?,
                vec!["10.244.3.2/24".parse().unwrap()]
            );
            let default = host.default_route()?.unwrap();
            assert_eq!(default.gateway, Some("10.244.3.1".parse().unwrap()));
            assert!(host.link("eth0")?.unwrap().up);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_existing_container_interface_is_rejected() {
        let (host, bridge) = setup();
        setup_veth(&host, &bridge, &request("eth0")).unwrap();

        let err = setup_veth(&host, &bridge, &request("eth0")).unwrap_err();
        assert!(matches!(err, NetworkError::Device(_)));
        assert_eq!(host.current_namespace(), Path::new(MOCK_HOST_NAMESPACE));
    }

    #[test]
    fn test_missing_namespace() {
        let (host, bridge) = setup();
        let mut req = request("eth0");
        req.netns = Path::new("/var/run/netns/gone");

        let err = setup_veth(&host, &bridge, &req).unwrap_err();
        assert!(err.is_namespace_not_found());
    }
}
