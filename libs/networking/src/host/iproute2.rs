//! [`HostNetwork`] backed by the `ip(8)` and `bridge(8)` tools.
//!
//! Queries use JSON output (`-j`); mutations use `replace` verbs where the
//! kernel supports them so that repeated calls converge.

use std::net::Ipv4Addr;
use std::path::Path;
use std::process::Command;
use std::str::FromStr;

use ipnetwork::Ipv4Network;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, trace};

use super::netns::NamespaceGuard;
use super::{default_destination, FdbEntry, HostNetwork, Link, LinkKind, Neighbor, Route, VxlanSpec};
use crate::{MacAddr, NetworkError};

/// Host network access through iproute2.
#[derive(Debug, Clone, Default)]
pub struct IpRoute2 {
    _private: (),
}

impl IpRoute2 {
    /// Create a new iproute2 backend.
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Deserialize)]
struct IpLink {
    ifindex: u32,
    ifname: String,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    mtu: u32,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    master: Option<String>,
    #[serde(default)]
    linkinfo: Option<IpLinkInfo>,
}

#[derive(Debug, Deserialize)]
struct IpLinkInfo {
    #[serde(default)]
    info_kind: Option<String>,
    #[serde(default)]
    info_data: Option<IpLinkInfoData>,
}

#[derive(Debug, Deserialize)]
struct IpLinkInfoData {
    #[serde(default)]
    local: Option<String>,
}

impl IpLink {
    fn into_link(self) -> Link {
        let info = self.linkinfo.as_ref();
        let kind = LinkKind::from_info_kind(info.and_then(|i| i.info_kind.as_deref()));
        let local = info
            .and_then(|i| i.info_data.as_ref())
            .and_then(|d| d.local.as_deref())
            .and_then(|a| Ipv4Addr::from_str(a).ok());
        Link {
            index: self.ifindex,
            up: self.flags.iter().any(|f| f == "UP"),
            mac: self.address.as_deref().and_then(|a| MacAddr::from_str(a).ok()),
            name: self.ifname,
            kind,
            mtu: self.mtu,
            master: self.master,
            local,
        }
    }
}

#[derive(Debug, Deserialize)]
struct IpAddrEntry {
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Debug, Deserialize)]
struct IpAddrInfo {
    #[serde(default)]
    family: Option<String>,
    local: String,
    prefixlen: u8,
}

#[derive(Debug, Deserialize)]
struct IpRoute {
    dst: String,
    #[serde(default)]
    gateway: Option<String>,
    #[serde(default)]
    dev: Option<String>,
    #[serde(default)]
    flags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct IpNeigh {
    dst: String,
    #[serde(default)]
    lladdr: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BridgeFdb {
    mac: String,
    #[serde(default)]
    dst: Option<String>,
}

/// Run a command, returning stdout on success.
fn run(program: &str, args: &[&str]) -> Result<String, NetworkError> {
    trace!(program, args = %args.join(" "), "running command");

    let output = Command::new(program).args(args).output().map_err(|e| {
        NetworkError::Command {
            command: program.to_string(),
            stderr: format!("failed to execute: {}", e),
        }
    })?;

    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let command = format!("{} {}", program, args.join(" "));
    Err(classify_failure(command, stderr))
}

/// Map well-known kernel error strings onto error variants.
fn classify_failure(command: String, stderr: String) -> NetworkError {
    if stderr.contains("File exists") {
        NetworkError::AlreadyExists(command)
    } else if stderr.contains("does not exist")
        || stderr.contains("Cannot find device")
        || stderr.contains("No such file or directory")
        || stderr.contains("No such process")
    {
        NetworkError::NotFound(command)
    } else {
        NetworkError::Command { command, stderr }
    }
}

fn ip(args: &[&str]) -> Result<String, NetworkError> {
    run("ip", args)
}

fn bridge(args: &[&str]) -> Result<String, NetworkError> {
    run("bridge", args)
}

/// Parse a JSON array from command output; empty output is an empty list.
fn parse_json<T: DeserializeOwned>(stdout: &str) -> Result<Vec<T>, NetworkError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(trimmed).map_err(|e| NetworkError::Command {
        command: "ip -j".to_string(),
        stderr: format!("unparseable JSON output: {}", e),
    })
}

fn parse_destination(dst: &str) -> Result<Ipv4Network, NetworkError> {
    if dst == "default" {
        return Ok(default_destination());
    }
    let unparseable = |e: String| NetworkError::Command {
        command: "ip route".to_string(),
        stderr: format!("unparseable destination {}: {}", dst, e),
    };
    if dst.contains('/') {
        Ipv4Network::from_str(dst).map_err(|e| unparseable(e.to_string()))
    } else {
        let addr = Ipv4Addr::from_str(dst).map_err(|e| unparseable(e.to_string()))?;
        Ipv4Network::new(addr, 32).map_err(|e| unparseable(e.to_string()))
    }
}

fn route_args<'a>(verb: &'a str, route: &'a Route, dst: &'a str, gw: &'a Option<String>) -> Vec<&'a str> {
    let mut args = vec!["route", verb, dst];
    if let Some(gw) = gw {
        args.extend(["via", gw.as_str()]);
    }
    args.extend(["dev", route.device.as_str()]);
    if route.onlink {
        args.push("onlink");
    }
    args
}

impl HostNetwork for IpRoute2 {
    fn link(&self, name: &str) -> Result<Option<Link>, NetworkError> {
        let stdout = match ip(&["-j", "-d", "link", "show", "dev", name]) {
            Ok(stdout) => stdout,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        let links: Vec<IpLink> = parse_json(&stdout)?;
        Ok(links.into_iter().next().map(IpLink::into_link))
    }

    fn link_by_index(&self, index: u32) -> Result<Option<Link>, NetworkError> {
        let links: Vec<IpLink> = parse_json(&ip(&["-j", "-d", "link", "show"])?)?;
        Ok(links
            .into_iter()
            .find(|l| l.ifindex == index)
            .map(IpLink::into_link))
    }

    fn add_bridge(&self, name: &str, mtu: u32) -> Result<(), NetworkError> {
        let mtu = mtu.to_string();
        debug!(name, mtu = %mtu, "ip link add type bridge");
        ip(&["link", "add", "name", name, "mtu", &mtu, "type", "bridge"])?;
        Ok(())
    }

    fn add_vxlan(&self, spec: &VxlanSpec) -> Result<(), NetworkError> {
        let mtu = spec.mtu.to_string();
        let vni = spec.vni.to_string();
        let local = spec.local.to_string();
        let port = spec.port.to_string();
        let learning = if spec.learning { "learning" } else { "nolearning" };
        let csum = if spec.udp_checksum { "udpcsum" } else { "noudpcsum" };

        debug!(name = %spec.name, vni = spec.vni, local = %local, "ip link add type vxlan");
        ip(&[
            "link", "add", &spec.name, "mtu", &mtu, "type", "vxlan", "id", &vni, "local", &local,
            "dstport", &port, learning, csum,
        ])?;
        Ok(())
    }

    fn add_veth_pair(&self, name: &str, peer: &str, mtu: u32) -> Result<(), NetworkError> {
        let mtu = mtu.to_string();
        debug!(name, peer, "ip link add type veth");
        ip(&[
            "link", "add", name, "mtu", &mtu, "type", "veth", "peer", "name", peer, "mtu", &mtu,
        ])?;
        Ok(())
    }

    fn move_link(&self, name: &str, netns: &Path) -> Result<(), NetworkError> {
        let target = netns.to_string_lossy();
        ip(&["link", "set", "dev", name, "netns", &target])?;
        Ok(())
    }

    fn set_link_up(&self, name: &str) -> Result<(), NetworkError> {
        ip(&["link", "set", "dev", name, "up"])?;
        Ok(())
    }

    fn set_link_master(&self, name: &str, master: &str) -> Result<(), NetworkError> {
        ip(&["link", "set", "dev", name, "master", master])?;
        Ok(())
    }

    fn addresses(&self, link: &str) -> Result<Vec<Ipv4Network>, NetworkError> {
        let entries: Vec<IpAddrEntry> = parse_json(&ip(&["-j", "-4", "addr", "show", "dev", link])?)?;

        let mut addresses = Vec::new();
        for info in entries.into_iter().flat_map(|e| e.addr_info) {
            if info.family.as_deref().is_some_and(|f| f != "inet") {
                continue;
            }
            let addr = Ipv4Addr::from_str(&info.local).map_err(|e| NetworkError::Command {
                command: "ip addr".to_string(),
                stderr: format!("unparseable address {}: {}", info.local, e),
            })?;
            let network = Ipv4Network::new(addr, info.prefixlen).map_err(|e| NetworkError::Command {
                command: "ip addr".to_string(),
                stderr: e.to_string(),
            })?;
            addresses.push(network);
        }
        Ok(addresses)
    }

    fn add_address(&self, link: &str, address: Ipv4Network) -> Result<(), NetworkError> {
        let cidr = address.to_string();
        ip(&["addr", "add", &cidr, "dev", link])?;
        Ok(())
    }

    fn default_route(&self) -> Result<Option<Route>, NetworkError> {
        let routes: Vec<IpRoute> = parse_json(&ip(&["-j", "-4", "route", "show", "default"])?)?;

        for route in routes {
            let Some(dev) = route.dev else {
                continue;
            };
            let gateway = route.gateway.as_deref().and_then(|g| Ipv4Addr::from_str(g).ok());
            return Ok(Some(Route {
                destination: default_destination(),
                device: dev,
                gateway,
                onlink: route.flags.iter().any(|f| f == "onlink"),
            }));
        }
        Ok(None)
    }

    fn routes(&self, device: &str) -> Result<Vec<Route>, NetworkError> {
        let routes: Vec<IpRoute> = parse_json(&ip(&["-j", "-4", "route", "show", "dev", device])?)?;

        routes
            .into_iter()
            .map(|r| {
                Ok(Route {
                    destination: parse_destination(&r.dst)?,
                    device: r.dev.unwrap_or_else(|| device.to_string()),
                    gateway: r.gateway.as_deref().and_then(|g| Ipv4Addr::from_str(g).ok()),
                    onlink: r.flags.iter().any(|f| f == "onlink"),
                })
            })
            .collect()
    }

    fn add_route(&self, route: &Route) -> Result<(), NetworkError> {
        let dst = route.destination.to_string();
        let gw = route.gateway.map(|g| g.to_string());
        ip(&route_args("add", route, &dst, &gw))?;
        Ok(())
    }

    fn replace_route(&self, route: &Route) -> Result<(), NetworkError> {
        let dst = route.destination.to_string();
        let gw = route.gateway.map(|g| g.to_string());
        ip(&route_args("replace", route, &dst, &gw))?;
        Ok(())
    }

    fn delete_route(&self, route: &Route) -> Result<(), NetworkError> {
        let dst = route.destination.to_string();
        let gw = route.gateway.map(|g| g.to_string());
        ip(&route_args("del", route, &dst, &gw))?;
        Ok(())
    }

    fn neighbors(&self, device: &str) -> Result<Vec<Neighbor>, NetworkError> {
        let entries: Vec<IpNeigh> = parse_json(&ip(&[
            "-j", "-4", "neigh", "show", "dev", device, "nud", "permanent",
        ])?)?;

        Ok(entries
            .into_iter()
            .filter_map(|n| {
                let address = Ipv4Addr::from_str(&n.dst).ok()?;
                let mac = MacAddr::from_str(n.lladdr.as_deref()?).ok()?;
                Some(Neighbor {
                    device: device.to_string(),
                    address,
                    mac,
                })
            })
            .collect())
    }

    fn replace_neighbor(&self, neighbor: &Neighbor) -> Result<(), NetworkError> {
        let addr = neighbor.address.to_string();
        let mac = neighbor.mac.to_string();
        ip(&[
            "neigh", "replace", &addr, "lladdr", &mac, "dev", &neighbor.device, "nud", "permanent",
        ])?;
        Ok(())
    }

    fn delete_neighbor(&self, neighbor: &Neighbor) -> Result<(), NetworkError> {
        let addr = neighbor.address.to_string();
        ip(&["neigh", "del", &addr, "dev", &neighbor.device])?;
        Ok(())
    }

    fn fdb_entries(&self, device: &str) -> Result<Vec<FdbEntry>, NetworkError> {
        let entries: Vec<BridgeFdb> = parse_json(&bridge(&["-j", "fdb", "show", "dev", device])?)?;

        Ok(entries
            .into_iter()
            .filter_map(|e| {
                let destination = Ipv4Addr::from_str(e.dst.as_deref()?).ok()?;
                let mac = MacAddr::from_str(&e.mac).ok()?;
                Some(FdbEntry {
                    device: device.to_string(),
                    mac,
                    destination,
                })
            })
            .collect())
    }

    fn replace_fdb(&self, entry: &FdbEntry) -> Result<(), NetworkError> {
        let mac = entry.mac.to_string();
        let dst = entry.destination.to_string();
        bridge(&[
            "fdb", "replace", &mac, "dev", &entry.device, "dst", &dst, "self", "permanent",
        ])?;
        Ok(())
    }

    fn delete_fdb(&self, entry: &FdbEntry) -> Result<(), NetworkError> {
        let mac = entry.mac.to_string();
        let dst = entry.destination.to_string();
        bridge(&["fdb", "del", &mac, "dev", &entry.device, "dst", &dst, "self"])?;
        Ok(())
    }

    fn in_namespace<R, F>(&self, netns: &Path, f: F) -> Result<R, NetworkError>
    where
        F: FnOnce(&Path) -> Result<R, NetworkError>,
    {
        let guard = NamespaceGuard::enter(netns)?;
        let origin = guard.origin_path();
        let result = f(&origin);
        drop(guard);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_link_json() {
        let json = r#"[{"ifindex":7,"ifname":"vxnet.1","flags":["BROADCAST","MULTICAST","UP","LOWER_UP"],
            "mtu":1450,"operstate":"UNKNOWN","link_type":"ether","address":"6e:1f:aa:02:9c:41",
            "linkinfo":{"info_kind":"vxlan","info_data":{"id":1,"local":"192.168.1.10","port":8472}}}]"#;

        let links: Vec<IpLink> = parse_json(json).unwrap();
        let link = links.into_iter().next().unwrap().into_link();

        assert_eq!(link.index, 7);
        assert_eq!(link.kind, LinkKind::Vxlan);
        assert_eq!(link.mtu, 1450);
        assert!(link.up);
        assert_eq!(link.mac.unwrap().to_string(), "6e:1f:aa:02:9c:41");
        assert_eq!(link.local, Some(Ipv4Addr::new(192, 168, 1, 10)));
    }

    #[test]
    fn test_parse_plain_device_has_device_kind() {
        let json = r#"[{"ifindex":2,"ifname":"eth0","flags":["UP"],"mtu":1500,"address":"52:54:00:12:34:56"}]"#;
        let links: Vec<IpLink> = parse_json(json).unwrap();
        let link = links.into_iter().next().unwrap().into_link();
        assert_eq!(link.kind, LinkKind::Device);
        assert_eq!(link.local, None);
    }

    #[test]
    fn test_parse_addr_json() {
        let json = r#"[{"ifindex":2,"ifname":"eth0","addr_info":[
            {"family":"inet","local":"192.168.1.10","prefixlen":24,"scope":"global"}]}]"#;
        let entries: Vec<IpAddrEntry> = parse_json(json).unwrap();
        let info = &entries[0].addr_info[0];
        assert_eq!(info.local, "192.168.1.10");
        assert_eq!(info.prefixlen, 24);
    }

    #[test]
    fn test_parse_destination() {
        assert_eq!(parse_destination("default").unwrap().prefix(), 0);
        assert_eq!(
            parse_destination("10.244.1.0/24").unwrap().to_string(),
            "10.244.1.0/24"
        );
        assert_eq!(parse_destination("10.0.0.1").unwrap().prefix(), 32);
        assert!(parse_destination("garbage").is_err());
    }

    #[test]
    fn test_empty_output_is_empty_list() {
        let routes: Vec<IpRoute> = parse_json("\n").unwrap();
        assert!(routes.is_empty());
    }

    #[test]
    fn test_classify_failure() {
        let err = classify_failure("ip link add".into(), "RTNETLINK answers: File exists".into());
        assert!(err.is_already_exists());

        let err = classify_failure("ip link show".into(), "Device \"x\" does not exist.".into());
        assert!(err.is_not_found());

        let err = classify_failure("ip link add".into(), "Operation not permitted".into());
        assert!(matches!(err, NetworkError::Command { .. }));
    }

    #[test]
    fn test_route_args_onlink_gateway() {
        let route = Route::via_gateway(
            "10.244.1.0/24".parse().unwrap(),
            "vxnet.1",
            Ipv4Addr::new(10, 244, 1, 0),
        )
        .with_onlink();
        let dst = route.destination.to_string();
        let gw = route.gateway.map(|g| g.to_string());

        assert_eq!(
            route_args("replace", &route, &dst, &gw),
            vec![
                "route", "replace", "10.244.1.0/24", "via", "10.244.1.0", "dev", "vxnet.1", "onlink"
            ]
        );
    }
}
