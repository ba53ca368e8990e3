//! ADD, DEL, CHECK and VERSION handlers.

use std::path::Path;

use tracing::info;
use vxnet_networking::{HostNetwork, LinkKind, NetworkError, ProtocolFault};

use crate::bridge::ensure_bridge;
use crate::ipam::Ledger;
use crate::protocol::{
    AddResult, CniArgs, Command, NetConf, ResultInterface, VersionResult, FALLBACK_VERSION,
};
use crate::veth::{setup_veth, VethRequest};

/// The plugin bound to a host network and an address ledger.
pub struct Plugin<H: HostNetwork> {
    host: H,
    ledger: Ledger,
}

impl<H: HostNetwork> Plugin<H> {
    pub fn new(host: H, ledger: Ledger) -> Self {
        Self { host, ledger }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Dispatch on `CNI_COMMAND`. Returns the JSON document for stdout, if
    /// the command produces one.
    pub fn run(&self, args: &CniArgs, stdin: &[u8]) -> Result<Option<String>, NetworkError> {
        let output = match args.command {
            Command::Add => Some(to_json(&self.add(args, stdin)?)?),
            Command::Del => {
                self.del(args, stdin)?;
                None
            }
            Command::Check => {
                self.check(args, stdin)?;
                None
            }
            Command::Version => {
                let version = NetConf::peek_version(stdin)
                    .unwrap_or_else(|| FALLBACK_VERSION.to_string());
                Some(to_json(&VersionResult::new(&version))?)
            }
        };
        Ok(output)
    }

    /// Attach a container: bridge, address, veth.
    pub fn add(&self, args: &CniArgs, stdin: &[u8]) -> Result<AddResult, NetworkError> {
        // Everything that can be rejected is rejected before touching the host.
        let conf = NetConf::parse(stdin)?;
        let cidr = conf.pod_cidr()?;
        let netns = args
            .netns
            .as_deref()
            .ok_or_else(|| {
                NetworkError::protocol(ProtocolFault::InvalidEnvironment, "CNI_NETNS is not set")
            })?;

        let bridge = ensure_bridge(&self.host, &cidr, conf.mtu())?;
        let allocation = self.ledger.allocate(&cidr)?;

        let request = VethRequest {
            netns,
            if_name: &args.if_name,
            address: allocation.address,
            gateway: allocation.gateway,
            mtu: conf.mtu(),
        };

        // A failed setup keeps the reservation. The runtime follows a failed
        // ADD with DEL, which releases whatever ended up on the interface.
        let pair = setup_veth(&self.host, &bridge, &request)?;

        info!(
            container_id = %args.container_id,
            pod_namespace = args.arg("K8S_POD_NAMESPACE").unwrap_or_default(),
            pod = args.arg("K8S_POD_NAME").unwrap_or_default(),
            interface = %pair.container_name,
            host_veth = %pair.host_name,
            address = %allocation.address,
            "Container attached"
        );

        Ok(AddResult::single(
            &conf.cni_version,
            ResultInterface {
                name: pair.container_name,
                mac: pair.container_mac.map(|m| m.to_string()),
                sandbox: Some(netns.display().to_string()),
            },
            allocation.address,
            allocation.gateway,
        ))
    }

    /// Release the container's address.
    ///
    /// The veth pair goes away with the namespace, so only the ledger entry
    /// needs cleaning up. A namespace or interface that is already gone counts
    /// as success.
    pub fn del(&self, args: &CniArgs, stdin: &[u8]) -> Result<(), NetworkError> {
        NetConf::parse(stdin)?;

        let Some(netns) = args.netns.as_deref() else {
            info!(container_id = %args.container_id, "No namespace given, nothing to release");
            return Ok(());
        };

        let address = match self.container_address(netns, &args.if_name) {
            Ok(Some(address)) => address,
            Ok(None) => {
                info!(
                    container_id = %args.container_id,
                    interface = %args.if_name,
                    "Interface already gone, nothing to release"
                );
                return Ok(());
            }
            Err(e) if e.is_namespace_not_found() => {
                info!(container_id = %args.container_id, error = %e, "Namespace already gone, nothing to release");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.ledger.release(address.ip())?;

        info!(
            container_id = %args.container_id,
            address = %address,
            "Container detached"
        );
        Ok(())
    }

    /// Validate the request. Interface state is not verified.
    pub fn check(&self, args: &CniArgs, stdin: &[u8]) -> Result<(), NetworkError> {
        NetConf::parse(stdin)?;
        info!(container_id = %args.container_id, "CHECK requested");
        Ok(())
    }

    /// The single IPv4 address on the container interface, or `None` if the
    /// interface does not exist.
    fn container_address(
        &self,
        netns: &Path,
        if_name: &str,
    ) -> Result<Option<ipnetwork::Ipv4Network>, NetworkError> {
        self.host.in_namespace(netns, |_| {
            let Some(link) = self.host.link(if_name)? else {
                return Ok(None);
            };
            if link.kind != LinkKind::Veth {
                return Err(NetworkError::UnexpectedInterfaceState(format!(
                    "{} is a {:?}, expected veth",
                    if_name, link.kind
                )));
            }

            let addresses = self.host.addresses(if_name)?;
            match addresses.as_slice() {
                [address] => Ok(Some(*address)),
                other => Err(NetworkError::UnexpectedInterfaceState(format!(
                    "expected exactly one address on {}, found {}",
                    if_name,
                    other.len()
                ))),
            }
        })
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, NetworkError> {
    serde_json::to_string(value)
        .map_err(|e| {
            NetworkError::protocol(ProtocolFault::Decode, format!("failed to encode result: {}", e))
        })
}
