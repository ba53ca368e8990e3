//! Networking primitives shared by the vxnet daemon and CNI plugin.
//!
//! This library provides:
//! - The error taxonomy used across components
//! - Pod CIDR math (gateway, cluster range, usable host enumeration)
//! - Hardware address parsing
//! - MTU helpers for encapsulated links
//! - Host link/address/route/neighbor access (see [`host`])

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnetwork::Ipv4Network;
use thiserror::Error;

pub mod host;

pub use host::{
    FdbEntry, HostNetwork, IpRoute2, Link, LinkKind, MockHostNetwork, NamespaceGuard, Neighbor,
    Route, VxlanSpec, MOCK_HOST_NAMESPACE,
};

/// Networking errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Missing or invalid configuration (CIDR, identity inputs).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Device create/attach/lookup failure.
    #[error("device error: {0}")]
    Device(String),

    /// Address pool exhausted.
    #[error("address pool exhausted: {0}")]
    Allocation(String),

    /// Release of an address that is not reserved.
    #[error("address {0} is not reserved")]
    NotReserved(String),

    /// Malformed or conflicting peer metadata.
    #[error("sync error: {0}")]
    Sync(String),

    /// Malformed or unsupported plugin input.
    #[error("protocol error: {msg}")]
    Protocol { fault: ProtocolFault, msg: String },

    /// Interface found in a state the caller cannot act on.
    #[error("unexpected interface state: {0}")]
    UnexpectedInterfaceState(String),

    /// Object already exists (lost a create race, duplicate entry).
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Object does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// Network namespace could not be entered or restored.
    #[error("namespace error: {0}")]
    Namespace(String),

    /// Network namespace path does not exist.
    #[error("namespace {0} does not exist")]
    NamespaceNotFound(String),

    /// External command failed.
    #[error("{command} failed: {stderr}")]
    Command { command: String, stderr: String },

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// What was wrong with plugin input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolFault {
    /// Input could not be decoded or encoded.
    Decode,
    /// `cniVersion` is not one this plugin speaks.
    IncompatibleVersion,
    /// A required environment variable is missing.
    InvalidEnvironment,
    /// `CNI_COMMAND` names an unknown operation.
    UnknownCommand,
}

impl NetworkError {
    /// Protocol error of the given kind.
    pub fn protocol(fault: ProtocolFault, msg: impl Into<String>) -> Self {
        NetworkError::Protocol {
            fault,
            msg: msg.into(),
        }
    }

    /// Stable reason code for logs and protocol error payloads.
    pub fn reason_code(&self) -> &'static str {
        match self {
            NetworkError::Configuration(_) => "configuration_error",
            NetworkError::Device(_) => "device_error",
            NetworkError::Allocation(_) => "allocation_error",
            NetworkError::NotReserved(_) => "not_reserved",
            NetworkError::Sync(_) => "sync_error",
            NetworkError::Protocol { .. } => "protocol_error",
            NetworkError::UnexpectedInterfaceState(_) => "unexpected_interface_state",
            NetworkError::AlreadyExists(_) => "already_exists",
            NetworkError::NotFound(_) => "not_found",
            NetworkError::Namespace(_) => "namespace_error",
            NetworkError::NamespaceNotFound(_) => "namespace_not_found",
            NetworkError::Command { .. } => "command_failed",
            NetworkError::Io(_) => "io_error",
        }
    }

    /// Returns true if the error reports an object that already exists.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, NetworkError::AlreadyExists(_))
    }

    /// Returns true if the error reports a namespace that does not exist.
    pub fn is_namespace_not_found(&self) -> bool {
        matches!(self, NetworkError::NamespaceNotFound(_))
    }

    /// Returns true if the error reports a missing object.
    pub fn is_not_found(&self) -> bool {
        matches!(self, NetworkError::NotFound(_))
    }
}

// ============================================================================
// Pod CIDR
// ============================================================================

/// Prefix length of a per-node pod block.
pub const POD_PREFIX_LEN: u8 = 24;

/// Prefix length of the cluster-wide pod range.
pub const CLUSTER_PREFIX_LEN: u8 = 16;

/// Per-node IPv4 pod block (always a `/24`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PodCidr(Ipv4Network);

impl PodCidr {
    /// Create from a network, normalizing host bits away.
    pub fn new(network: Ipv4Network) -> Result<Self, NetworkError> {
        if network.prefix() != POD_PREFIX_LEN {
            return Err(NetworkError::Configuration(format!(
                "pod CIDR {} must be a /{} block",
                network, POD_PREFIX_LEN
            )));
        }

        let normalized = Ipv4Network::new(network.network(), POD_PREFIX_LEN)
            .map_err(|e| NetworkError::Configuration(e.to_string()))?;
        Ok(Self(normalized))
    }

    /// Parse from CIDR notation (e.g., "10.244.3.0/24").
    pub fn parse(s: &str) -> Result<Self, NetworkError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(NetworkError::Configuration("pod CIDR is empty".to_string()));
        }
        if !s.contains('/') {
            return Err(NetworkError::Configuration(format!(
                "missing '/' in pod CIDR: {}",
                s
            )));
        }

        let network = Ipv4Network::from_str(s)
            .map_err(|e| NetworkError::Configuration(format!("invalid pod CIDR {}: {}", s, e)))?;
        Self::new(network)
    }

    /// The `/24` network.
    pub fn network(&self) -> Ipv4Network {
        self.0
    }

    /// Network address (e.g., 10.244.3.0).
    pub fn network_address(&self) -> Ipv4Addr {
        self.0.network()
    }

    /// Broadcast address (e.g., 10.244.3.255).
    pub fn broadcast_address(&self) -> Ipv4Addr {
        self.0.broadcast()
    }

    /// Gateway address: the first usable host.
    pub fn gateway(&self) -> Ipv4Addr {
        offset(self.network_address(), 1)
    }

    /// Gateway with the pod prefix (e.g., 10.244.3.1/24).
    pub fn gateway_cidr(&self) -> Ipv4Network {
        self.host_cidr(self.gateway())
    }

    /// The `/16` cluster range containing this block.
    pub fn cluster_range(&self) -> Ipv4Network {
        let mask = u32::MAX << (32 - CLUSTER_PREFIX_LEN);
        let base = Ipv4Addr::from(u32::from(self.network_address()) & mask);
        Ipv4Network::new(base, CLUSTER_PREFIX_LEN).expect("cluster prefix length is valid")
    }

    /// Usable hosts in ascending order (network and broadcast excluded).
    pub fn usable_hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let first = u32::from(self.network_address()) + 1;
        let last = u32::from(self.broadcast_address());
        (first..last).map(Ipv4Addr::from)
    }

    /// Check if an address is within this block.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.0.contains(addr)
    }

    /// Address with the pod prefix (e.g., 10.244.3.7/24).
    pub fn host_cidr(&self, addr: Ipv4Addr) -> Ipv4Network {
        Ipv4Network::new(addr, POD_PREFIX_LEN).expect("pod prefix length is valid")
    }
}

impl FromStr for PodCidr {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PodCidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn offset(addr: Ipv4Addr, n: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(addr).wrapping_add(n))
}

// ============================================================================
// Hardware addresses
// ============================================================================

/// Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    /// Create from raw octets.
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Get the raw octets.
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for MacAddr {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || NetworkError::Sync(format!("invalid hardware address: {:?}", s));

        let parts: Vec<&str> = s.split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(invalid());
        }

        let mut octets = [0u8; 6];
        for (octet, part) in octets.iter_mut().zip(&parts) {
            if part.len() != 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }

        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a, b, c, d, e, g
        )
    }
}

// ============================================================================
// MTU Configuration
// ============================================================================

/// Minimum MTU for IPv4.
pub const MTU_MIN_IPV4: u32 = 68;

/// Maximum MTU for jumbo frames.
pub const MTU_MAX_JUMBO: u32 = 9000;

/// Default MTU for Ethernet.
pub const MTU_DEFAULT_ETHERNET: u32 = 1500;

/// VXLAN encapsulation overhead (outer IPv4 + UDP + VXLAN + inner Ethernet).
pub const VXLAN_OVERHEAD: u32 = 50;

/// Validate an MTU value.
pub fn validate_mtu(mtu: u32) -> Result<u32, NetworkError> {
    if !(MTU_MIN_IPV4..=MTU_MAX_JUMBO).contains(&mtu) {
        return Err(NetworkError::Device(format!(
            "invalid MTU: {} (must be between {} and {})",
            mtu, MTU_MIN_IPV4, MTU_MAX_JUMBO
        )));
    }
    Ok(mtu)
}

/// Calculate MTU for encapsulated traffic.
///
/// Returns the inner MTU given an outer MTU and overhead.
pub fn calculate_inner_mtu(outer_mtu: u32, overhead: u32) -> Result<u32, NetworkError> {
    let inner = outer_mtu.saturating_sub(overhead);
    validate_mtu(inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_pod_cidr_derived_addresses() {
        let cidr = PodCidr::parse("10.244.3.0/24").unwrap();
        assert_eq!(cidr.network_address(), Ipv4Addr::new(10, 244, 3, 0));
        assert_eq!(cidr.gateway(), Ipv4Addr::new(10, 244, 3, 1));
        assert_eq!(cidr.broadcast_address(), Ipv4Addr::new(10, 244, 3, 255));
        assert_eq!(cidr.gateway_cidr().to_string(), "10.244.3.1/24");
        assert_eq!(cidr.cluster_range().to_string(), "10.244.0.0/16");
    }

    #[test]
    fn test_pod_cidr_normalizes_host_bits() {
        let cidr = PodCidr::parse("10.244.3.77/24").unwrap();
        assert_eq!(cidr.to_string(), "10.244.3.0/24");
    }

    #[rstest]
    #[case("")]
    #[case("10.244.3.0")]
    #[case("10.244.0.0/16")]
    #[case("10.244.3.0/25")]
    #[case("not-a-cidr/24")]
    fn test_pod_cidr_rejects(#[case] input: &str) {
        let err = PodCidr::parse(input).unwrap_err();
        assert!(matches!(err, NetworkError::Configuration(_)));
    }

    #[test]
    fn test_usable_hosts_excludes_network_and_broadcast() {
        let cidr = PodCidr::parse("10.244.3.0/24").unwrap();
        let hosts: Vec<Ipv4Addr> = cidr.usable_hosts().collect();

        assert_eq!(hosts.len(), 254);
        assert_eq!(hosts[0], Ipv4Addr::new(10, 244, 3, 1));
        assert_eq!(hosts[253], Ipv4Addr::new(10, 244, 3, 254));
        assert!(!hosts.contains(&cidr.network_address()));
        assert!(!hosts.contains(&cidr.broadcast_address()));
    }

    #[test]
    fn test_mac_roundtrip_display() {
        let mac: MacAddr = "AA:bb:0c:dd:ee:0F".parse().unwrap();
        assert_eq!(mac.to_string(), "aa:bb:0c:dd:ee:0f");
        assert_eq!(mac.octets(), [0xaa, 0xbb, 0x0c, 0xdd, 0xee, 0x0f]);
    }

    #[rstest]
    #[case("")]
    #[case("aa:bb:cc:dd:ee")]
    #[case("aa:bb:cc:dd:ee:zz")]
    #[case("aabb:cc:dd:ee:ff:00")]
    fn test_mac_rejects(#[case] input: &str) {
        assert!(input.parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_mtu_validation() {
        assert!(validate_mtu(68).is_ok());
        assert!(validate_mtu(1500).is_ok());
        assert!(validate_mtu(9000).is_ok());

        assert!(validate_mtu(67).is_err());
        assert!(validate_mtu(9001).is_err());
    }

    #[test]
    fn test_inner_mtu() {
        let inner = calculate_inner_mtu(1500, VXLAN_OVERHEAD).unwrap();
        assert_eq!(inner, 1450);
    }
}
