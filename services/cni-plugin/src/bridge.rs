//! Node-local bridge that all container veths attach to.

use tracing::{debug, info, warn};
use vxnet_networking::{HostNetwork, LinkKind, NetworkError, PodCidr, Route};

/// Bridge device name.
pub const BRIDGE_NAME: &str = "vxnet0";

/// The bridge as configured on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalBridge {
    pub name: String,
    pub index: u32,
    pub mtu: u32,
    /// Pod block served by this bridge.
    pub cidr: PodCidr,
}

/// Get or create the bridge for `cidr`.
///
/// A fresh bridge gets the gateway address and a route for the pod block.
/// Failures there are logged and do not fail the call. Calling this again on
/// a configured host changes nothing.
pub fn ensure_bridge<H: HostNetwork>(
    host: &H,
    cidr: &PodCidr,
    mtu: u32,
) -> Result<LocalBridge, NetworkError> {
    if let Some(bridge) = existing_bridge(host, cidr)? {
        debug!(bridge = BRIDGE_NAME, index = bridge.index, "Bridge already present");
        return Ok(bridge);
    }

    match host.add_bridge(BRIDGE_NAME, mtu) {
        Ok(()) => {}
        // Another invocation won the race.
        Err(e) if e.is_already_exists() => {
            debug!(bridge = BRIDGE_NAME, "Bridge created concurrently, re-fetching");
            return existing_bridge(host, cidr)?.ok_or_else(|| {
                NetworkError::Device(format!(
                    "{} reported as existing but not found",
                    BRIDGE_NAME
                ))
            });
        }
        Err(e) => {
            return Err(NetworkError::Device(format!(
                "failed to create {}: {}",
                BRIDGE_NAME, e
            )))
        }
    }

    host.set_link_up(BRIDGE_NAME).map_err(|e| {
        NetworkError::Device(format!("failed to bring {} up: {}", BRIDGE_NAME, e))
    })?;

    let gateway = cidr.gateway_cidr();
    if let Err(e) = host.add_address(BRIDGE_NAME, gateway) {
        warn!(bridge = BRIDGE_NAME, address = %gateway, error = %e, "Failed to assign gateway address");
    }

    if let Err(e) = host.replace_route(&Route::via_device(cidr.network(), BRIDGE_NAME)) {
        warn!(bridge = BRIDGE_NAME, cidr = %cidr, error = %e, "Failed to install pod block route");
    }

    let link = host.link(BRIDGE_NAME)?.ok_or_else(|| {
        NetworkError::Device(format!("{} vanished after creation", BRIDGE_NAME))
    })?;

    info!(bridge = BRIDGE_NAME, index = link.index, gateway = %gateway, mtu, "Created bridge");

    Ok(LocalBridge {
        name: link.name,
        index: link.index,
        mtu: link.mtu,
        cidr: *cidr,
    })
}

fn existing_bridge<H: HostNetwork>(
    host: &H,
    cidr: &PodCidr,
) -> Result<Option<LocalBridge>, NetworkError> {
    let Some(link) = host.link(BRIDGE_NAME)? else {
        return Ok(None);
    };
    if link.kind != LinkKind::Bridge {
        return Err(NetworkError::Device(format!(
            "{} exists but is a {:?}, not a bridge",
            BRIDGE_NAME, link.kind
        )));
    }
    Ok(Some(LocalBridge {
        name: link.name,
        index: link.index,
        mtu: link.mtu,
        cidr: *cidr,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vxnet_networking::MockHostNetwork;

    fn cidr() -> PodCidr {
        PodCidr::parse("10.244.3.0/24").unwrap()
    }

    #[test]
    fn test_creates_bridge_with_gateway() {
        let host = MockHostNetwork::new();

        let bridge = ensure_bridge(&host, &cidr(), 1500).unwrap();

        assert_eq!(bridge.name, BRIDGE_NAME);
        assert_eq!(bridge.mtu, 1500);
        let link = host.link(BRIDGE_NAME).unwrap().unwrap();
        assert!(link.up);
        assert_eq!(
            host.addresses(BRIDGE_NAME).unwrap(),
            vec!["10.244.3.1/24".parse().unwrap()]
        );
        assert!(host
            .routes(BRIDGE_NAME)
            .unwrap()
            .iter()
            .any(|r| r.destination == cidr().network()));
    }

    #[test]
    fn test_existing_bridge_is_untouched() {
        let host = MockHostNetwork::new();
        let first = ensure_bridge(&host, &cidr(), 1500).unwrap();
        let mutations = host.mutation_count();

        let second = ensure_bridge(&host, &cidr(), 1500).unwrap();

        assert_eq!(first, second);
        assert_eq!(host.mutation_count(), mutations);
    }

    #[test]
    fn test_wrong_kind_is_rejected() {
        let host = MockHostNetwork::new();
        host.add_vxlan(&vxnet_networking::VxlanSpec {
            name: BRIDGE_NAME.to_string(),
            vni: 1,
            port: 8472,
            local: "192.168.1.10".parse().unwrap(),
            mtu: 1450,
            learning: false,
            udp_checksum: false,
        })
        .unwrap();

        let err = ensure_bridge(&host, &cidr(), 1500).unwrap_err();
        assert!(matches!(err, NetworkError::Device(_)));
    }

    #[test]
    fn test_address_failure_does_not_abort() {
        let host = MockHostNetwork::new();
        host.fail_on("add_address");

        let bridge = ensure_bridge(&host, &cidr(), 1500).unwrap();

        assert_eq!(bridge.name, BRIDGE_NAME);
        assert!(host.addresses(BRIDGE_NAME).unwrap().is_empty());
    }

    #[test]
    fn test_create_conflict_without_bridge_is_an_error() {
        let host = MockHostNetwork::new();
        host.conflict_on("add_bridge");

        let err = ensure_bridge(&host, &cidr(), 1500).unwrap_err();

        assert!(matches!(err, NetworkError::Device(_)));
        assert!(host.link(BRIDGE_NAME).unwrap().is_none());
    }

    #[test]
    fn test_create_failure_is_fatal() {
        let host = MockHostNetwork::new();
        host.fail_on("add_bridge");

        assert!(matches!(
            ensure_bridge(&host, &cidr(), 1500),
            Err(NetworkError::Device(_))
        ));
    }
}
