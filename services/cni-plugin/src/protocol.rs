//! CNI wire protocol: environment arguments, network configuration on stdin,
//! and the JSON documents written to stdout.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use vxnet_networking::{NetworkError, PodCidr, ProtocolFault, MTU_DEFAULT_ETHERNET};

/// CNI versions this plugin can speak.
pub const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0"];

/// Version used for error documents when the request carries none.
pub const FALLBACK_VERSION: &str = "1.0.0";

// Well-known CNI error codes.
const CODE_INCOMPATIBLE_VERSION: u32 = 1;
const CODE_UNSUPPORTED_FIELD: u32 = 2;
const CODE_INVALID_ENVIRONMENT: u32 = 4;
const CODE_IO_FAILURE: u32 = 5;
const CODE_DECODE_FAILURE: u32 = 6;
const CODE_INVALID_NETWORK_CONFIG: u32 = 7;

/// Plugin-specific codes (100 and up).
const CODE_DEVICE: u32 = 100;
const CODE_ALLOCATION: u32 = 101;
const CODE_NAMESPACE: u32 = 102;
const CODE_INTERFACE_STATE: u32 = 103;
const CODE_INTERNAL: u32 = 199;

/// Operation requested by the container runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Add,
    Del,
    Check,
    Version,
}

impl FromStr for Command {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ADD" => Ok(Command::Add),
            "DEL" => Ok(Command::Del),
            "CHECK" => Ok(Command::Check),
            "VERSION" => Ok(Command::Version),
            other => Err(NetworkError::protocol(
                ProtocolFault::UnknownCommand,
                format!("unknown CNI_COMMAND: {}", other),
            )),
        }
    }
}

/// Invocation arguments passed through the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CniArgs {
    pub command: Command,
    pub container_id: String,
    /// Target namespace path. May be empty for DEL.
    pub netns: Option<PathBuf>,
    pub if_name: String,
    pub args: Option<String>,
}

impl CniArgs {
    /// Read arguments from the process environment.
    pub fn from_env() -> Result<Self, NetworkError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read arguments through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, NetworkError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let command: Command = get("CNI_COMMAND")
            .ok_or_else(|| missing_env("CNI_COMMAND"))?
            .parse()?;

        if command == Command::Version {
            return Ok(Self {
                command,
                container_id: String::new(),
                netns: None,
                if_name: String::new(),
                args: None,
            });
        }

        let container_id = get("CNI_CONTAINERID")
            .ok_or_else(|| missing_env("CNI_CONTAINERID"))?;
        let if_name = get("CNI_IFNAME")
            .ok_or_else(|| missing_env("CNI_IFNAME"))?;
        let netns = get("CNI_NETNS").map(PathBuf::from);

        if netns.is_none() && command != Command::Del {
            return Err(missing_env("CNI_NETNS"));
        }

        Ok(Self {
            command,
            container_id,
            netns,
            if_name,
            args: get("CNI_ARGS"),
        })
    }

    /// Look up a `K=V` pair in `CNI_ARGS`.
    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args.as_deref()?.split(';').find_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            (k == key).then_some(v)
        })
    }
}

fn missing_env(key: &str) -> NetworkError {
    NetworkError::protocol(ProtocolFault::InvalidEnvironment, format!("{} is not set", key))
}

/// Network configuration read from stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetConf {
    pub cni_version: String,
    pub name: String,
    #[serde(rename = "type")]
    pub plugin_type: String,
    /// This node's pod block.
    #[serde(rename = "podcidr", default, skip_serializing_if = "Option::is_none")]
    pub pod_cidr: Option<String>,
    /// Container interface MTU.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
}

impl NetConf {
    /// Decode and validate a configuration document.
    pub fn parse(stdin: &[u8]) -> Result<Self, NetworkError> {
        let conf: NetConf = serde_json::from_slice(stdin)
            .map_err(|e| {
                NetworkError::protocol(
                    ProtocolFault::Decode,
                    format!("invalid network configuration: {}", e),
                )
            })?;

        if !SUPPORTED_VERSIONS.contains(&conf.cni_version.as_str()) {
            return Err(NetworkError::protocol(
                ProtocolFault::IncompatibleVersion,
                format!("unsupported cniVersion {}", conf.cni_version),
            ));
        }

        Ok(conf)
    }

    /// Best-effort extraction of `cniVersion` for error reporting.
    pub fn peek_version(stdin: &[u8]) -> Option<String> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct VersionOnly {
            cni_version: String,
        }

        serde_json::from_slice::<VersionOnly>(stdin)
            .ok()
            .map(|v| v.cni_version)
    }

    /// The configured pod block.
    pub fn pod_cidr(&self) -> Result<PodCidr, NetworkError> {
        let raw = self.pod_cidr.as_deref().ok_or_else(|| {
            NetworkError::Configuration("podcidr missing from network configuration".to_string())
        })?;
        PodCidr::parse(raw)
    }

    /// Container interface MTU.
    pub fn mtu(&self) -> u32 {
        self.mtu.unwrap_or(MTU_DEFAULT_ETHERNET)
    }
}

/// Interface entry in an ADD result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultInterface {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

/// IP entry in an ADD result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultIp {
    /// Present only for pre-1.0 result formats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub address: String,
    pub gateway: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
}

/// Successful ADD result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddResult {
    pub cni_version: String,
    pub interfaces: Vec<ResultInterface>,
    pub ips: Vec<ResultIp>,
}

impl AddResult {
    /// Result for a single container interface with one IPv4 address.
    pub fn single(
        cni_version: &str,
        interface: ResultInterface,
        address: Ipv4Network,
        gateway: Ipv4Addr,
    ) -> Self {
        let version = cni_version.starts_with("0.").then(|| "4".to_string());
        Self {
            cni_version: cni_version.to_string(),
            interfaces: vec![interface],
            ips: vec![ResultIp {
                version,
                address: address.to_string(),
                gateway: gateway.to_string(),
                interface: Some(0),
            }],
        }
    }
}

/// VERSION result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionResult {
    pub cni_version: String,
    pub supported_versions: Vec<String>,
}

impl VersionResult {
    pub fn new(cni_version: &str) -> Self {
        Self {
            cni_version: cni_version.to_string(),
            supported_versions: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
        }
    }
}

/// Error document written to stdout on failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResult {
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
}

impl ErrorResult {
    pub fn from_error(err: &NetworkError, cni_version: &str) -> Self {
        Self {
            cni_version: cni_version.to_string(),
            code: error_code(err),
            msg: err.reason_code().to_string(),
            details: err.to_string(),
        }
    }
}

/// Map an error to its CNI error code.
pub fn error_code(err: &NetworkError) -> u32 {
    match err {
        NetworkError::Protocol { fault, .. } => match fault {
            ProtocolFault::IncompatibleVersion => CODE_INCOMPATIBLE_VERSION,
            ProtocolFault::InvalidEnvironment => CODE_INVALID_ENVIRONMENT,
            ProtocolFault::UnknownCommand => CODE_UNSUPPORTED_FIELD,
            ProtocolFault::Decode => CODE_DECODE_FAILURE,
        },
        NetworkError::Configuration(_) => CODE_INVALID_NETWORK_CONFIG,
        NetworkError::Io(_) => CODE_IO_FAILURE,
        NetworkError::Device(_) | NetworkError::Command { .. } => CODE_DEVICE,
        NetworkError::Allocation(_) | NetworkError::NotReserved(_) => CODE_ALLOCATION,
        NetworkError::Namespace(_) | NetworkError::NamespaceNotFound(_) => CODE_NAMESPACE,
        NetworkError::UnexpectedInterfaceState(_) => CODE_INTERFACE_STATE,
        NetworkError::AlreadyExists(_) | NetworkError::NotFound(_) | NetworkError::Sync(_) => {
            CODE_INTERNAL
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_args_add() {
        let args = CniArgs::from_lookup(lookup(&[
            ("CNI_COMMAND", "ADD"),
            ("CNI_CONTAINERID", "abc123"),
            ("CNI_NETNS", "/var/run/netns/abc"),
            ("CNI_IFNAME", "eth0"),
            ("CNI_ARGS", "IgnoreUnknown=1;K8S_POD_NAME=web-0"),
        ]))
        .unwrap();

        assert_eq!(args.command, Command::Add);
        assert_eq!(args.netns, Some(PathBuf::from("/var/run/netns/abc")));
        assert_eq!(args.arg("K8S_POD_NAME"), Some("web-0"));
        assert_eq!(args.arg("MISSING"), None);
    }

    #[test]
    fn test_args_del_without_netns() {
        let args = CniArgs::from_lookup(lookup(&[
            ("CNI_COMMAND", "DEL"),
            ("CNI_CONTAINERID", "abc123"),
            ("CNI_NETNS", ""),
            ("CNI_IFNAME", "eth0"),
        ]))
        .unwrap();

        assert_eq!(args.command, Command::Del);
        assert!(args.netns.is_none());
    }

    #[test]
    fn test_args_add_requires_netns() {
        let err = CniArgs::from_lookup(lookup(&[
            ("CNI_COMMAND", "ADD"),
            ("CNI_CONTAINERID", "abc123"),
            ("CNI_IFNAME", "eth0"),
        ]))
        .unwrap_err();

        assert!(matches!(
            err,
            NetworkError::Protocol {
                fault: ProtocolFault::InvalidEnvironment,
                ..
            }
        ));
        assert_eq!(error_code(&err), CODE_INVALID_ENVIRONMENT);
    }

    #[test]
    fn test_args_version_needs_nothing_else() {
        let args = CniArgs::from_lookup(lookup(&[("CNI_COMMAND", "VERSION")])).unwrap();
        assert_eq!(args.command, Command::Version);
    }

    #[test]
    fn test_args_unknown_command() {
        let err = CniArgs::from_lookup(lookup(&[("CNI_COMMAND", "GC")])).unwrap_err();
        assert_eq!(error_code(&err), CODE_UNSUPPORTED_FIELD);
    }

    #[test]
    fn test_netconf_parse() {
        let conf = NetConf::parse(
            br#"{"cniVersion":"0.3.1","name":"vxnet","type":"vxnet","podcidr":"10.244.3.0/24"}"#,
        )
        .unwrap();

        assert_eq!(conf.name, "vxnet");
        assert_eq!(conf.plugin_type, "vxnet");
        assert_eq!(conf.pod_cidr().unwrap().to_string(), "10.244.3.0/24");
        assert_eq!(conf.mtu(), MTU_DEFAULT_ETHERNET);
    }

    #[rstest]
    #[case(b"not json".as_slice(), CODE_DECODE_FAILURE)]
    #[case(br#"{"name":"vxnet"}"#.as_slice(), CODE_DECODE_FAILURE)]
    #[case(
        br#"{"cniVersion":"2.0.0","name":"vxnet","type":"vxnet"}"#.as_slice(),
        CODE_INCOMPATIBLE_VERSION
    )]
    fn test_netconf_rejects(#[case] input: &[u8], #[case] code: u32) {
        let err = NetConf::parse(input).unwrap_err();
        assert!(matches!(err, NetworkError::Protocol { .. }));
        assert_eq!(error_code(&err), code);
    }

    #[test]
    fn test_error_code_ignores_message_wording() {
        let err = NetworkError::protocol(ProtocolFault::InvalidEnvironment, "unknown CNI_COMMAND");
        assert_eq!(error_code(&err), CODE_INVALID_ENVIRONMENT);

        let err = NetworkError::protocol(ProtocolFault::Decode, "CNI_IFNAME is not set");
        assert_eq!(error_code(&err), CODE_DECODE_FAILURE);
    }

    #[test]
    fn test_netconf_missing_pod_cidr() {
        let conf =
            NetConf::parse(br#"{"cniVersion":"1.0.0","name":"vxnet","type":"vxnet"}"#).unwrap();
        assert!(matches!(
            conf.pod_cidr(),
            Err(NetworkError::Configuration(_))
        ));
    }

    #[test]
    fn test_peek_version() {
        assert_eq!(
            NetConf::peek_version(br#"{"cniVersion":"0.4.0"}"#),
            Some("0.4.0".to_string())
        );
        assert_eq!(NetConf::peek_version(b"garbage"), None);
    }

    #[rstest]
    #[case("0.3.1", Some("4"))]
    #[case("0.4.0", Some("4"))]
    #[case("1.0.0", None)]
    fn test_add_result_ip_version(#[case] cni_version: &str, #[case] expected: Option<&str>) {
        let result = AddResult::single(
            cni_version,
            ResultInterface {
                name: "eth0".to_string(),
                mac: None,
                sandbox: None,
            },
            "10.244.3.2/24".parse().unwrap(),
            "10.244.3.1".parse().unwrap(),
        );

        assert_eq!(result.ips[0].version.as_deref(), expected);

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["cniVersion"], cni_version);
        assert_eq!(json["ips"][0]["address"], "10.244.3.2/24");
        assert_eq!(json["ips"][0]["gateway"], "10.244.3.1");
    }

    #[test]
    fn test_error_result_shape() {
        let err = NetworkError::UnexpectedInterfaceState("2 addresses on eth0".to_string());
        let json = serde_json::to_value(ErrorResult::from_error(&err, "1.0.0")).unwrap();

        assert_eq!(json["cniVersion"], "1.0.0");
        assert_eq!(json["code"], CODE_INTERFACE_STATE);
        assert!(json["details"].as_str().unwrap().contains("2 addresses"));
    }

    #[test]
    fn test_version_result_lists_supported() {
        let json = serde_json::to_value(VersionResult::new("1.0.0")).unwrap();
        assert_eq!(json["supportedVersions"].as_array().unwrap().len(), 4);
    }
}
