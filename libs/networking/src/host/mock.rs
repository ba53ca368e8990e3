//! In-memory [`HostNetwork`] for tests and development.
//!
//! Each namespace holds its own links, addresses, routes, ARP and FDB
//! tables. Failures can be injected per operation name.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use ipnetwork::Ipv4Network;
use tracing::debug;

use super::{FdbEntry, HostNetwork, Link, LinkKind, Neighbor, Route, VxlanSpec};
use crate::{MacAddr, NetworkError};

/// Key of the namespace the mock starts in.
pub const MOCK_HOST_NAMESPACE: &str = "/proc/1/ns/net";

#[derive(Debug, Default)]
struct Namespace {
    links: BTreeMap<String, Link>,
    addresses: BTreeMap<String, Vec<Ipv4Network>>,
    routes: Vec<Route>,
    neighbors: Vec<Neighbor>,
    fdb: Vec<FdbEntry>,
    vxlans: BTreeMap<String, VxlanSpec>,
}

impl Namespace {
    fn require_link(&self, name: &str) -> Result<&Link, NetworkError> {
        self.links
            .get(name)
            .ok_or_else(|| NetworkError::NotFound(format!("link {}", name)))
    }
}

#[derive(Debug)]
struct State {
    namespaces: HashMap<PathBuf, Namespace>,
    current: PathBuf,
    next_index: u32,
    next_mac: u16,
    failures: HashSet<String>,
    conflicts: HashSet<String>,
    mutations: u64,
}

impl State {
    fn ns(&self) -> &Namespace {
        self.namespaces
            .get(&self.current)
            .expect("current namespace is always registered")
    }

    fn ns_mut(&mut self) -> &mut Namespace {
        let current = self.current.clone();
        self.namespaces
            .get_mut(&current)
            .expect("current namespace is always registered")
    }

    fn new_link(&mut self, name: &str, kind: LinkKind, mtu: u32) -> Link {
        self.next_index += 1;
        self.next_mac += 1;
        let [hi, lo] = self.next_mac.to_be_bytes();
        Link {
            index: self.next_index,
            name: name.to_string(),
            kind,
            mtu,
            mac: Some(MacAddr::new([0x02, 0x42, 0x00, 0x00, hi, lo])),
            master: None,
            up: false,
            local: None,
        }
    }

    fn insert_new_link(&mut self, name: &str, kind: LinkKind, mtu: u32) -> Result<(), NetworkError> {
        if self.ns().links.contains_key(name) {
            return Err(NetworkError::AlreadyExists(format!("link {}", name)));
        }
        let link = self.new_link(name, kind, mtu);
        self.ns_mut().links.insert(name.to_string(), link);
        Ok(())
    }
}

/// Mock host network for testing.
#[derive(Debug)]
pub struct MockHostNetwork {
    state: Mutex<State>,
}

impl MockHostNetwork {
    /// Create a mock with an empty host namespace (loopback only).
    pub fn new() -> Self {
        let host = PathBuf::from(MOCK_HOST_NAMESPACE);
        let mut state = State {
            namespaces: HashMap::from([(host.clone(), Namespace::default())]),
            current: host,
            next_index: 0,
            next_mac: 0,
            failures: HashSet::new(),
            conflicts: HashSet::new(),
            mutations: 0,
        };
        let lo = state.new_link("lo", LinkKind::Device, 65536);
        state.ns_mut().links.insert("lo".to_string(), lo);

        Self {
            state: Mutex::new(state),
        }
    }

    /// Add an uplink device carrying the default route.
    pub fn with_uplink(self, name: &str, address: Ipv4Network, gateway: Ipv4Addr, mtu: u32) -> Self {
        {
            let mut state = self.lock();
            let mut link = state.new_link(name, LinkKind::Device, mtu);
            link.up = true;
            let ns = state.ns_mut();
            ns.links.insert(name.to_string(), link);
            ns.addresses.insert(name.to_string(), vec![address]);
            ns.routes.push(Route::default_via(gateway, name));
        }
        self
    }

    /// Register a network namespace reachable at `path`.
    pub fn add_namespace(&self, path: impl AsRef<Path>) {
        let mut state = self.lock();
        state
            .namespaces
            .entry(path.as_ref().to_path_buf())
            .or_default();
    }

    /// Make every subsequent call of the named operation fail.
    pub fn fail_on(&self, operation: &str) {
        self.lock().failures.insert(operation.to_string());
    }

    /// Make every subsequent call of the named operation report that its
    /// object already exists, without creating anything.
    pub fn conflict_on(&self, operation: &str) {
        self.lock().conflicts.insert(operation.to_string());
    }

    /// Stop failing the named operation.
    pub fn clear_failure(&self, operation: &str) {
        let mut state = self.lock();
        state.failures.remove(operation);
        state.conflicts.remove(operation);
    }

    /// Number of successful mutating calls so far.
    pub fn mutation_count(&self) -> u64 {
        self.lock().mutations
    }

    /// Namespace the calling code is currently in.
    pub fn current_namespace(&self) -> PathBuf {
        self.lock().current.clone()
    }

    /// Parameters a VXLAN device was created with.
    pub fn vxlan_spec(&self, name: &str) -> Option<VxlanSpec> {
        self.lock().ns().vxlans.get(name).cloned()
    }

    /// Names of links in the namespace at `path`.
    pub fn links_in(&self, path: impl AsRef<Path>) -> Vec<String> {
        self.lock()
            .namespaces
            .get(path.as_ref())
            .map(|ns| ns.links.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(&self, operation: &str) -> Result<MutexGuard<'_, State>, NetworkError> {
        let state = self.lock();
        if state.failures.contains(operation) {
            return Err(NetworkError::Command {
                command: operation.to_string(),
                stderr: "injected failure".to_string(),
            });
        }
        if state.conflicts.contains(operation) {
            return Err(NetworkError::AlreadyExists(operation.to_string()));
        }
        Ok(state)
    }

    fn mutate(&self, operation: &str) -> Result<MutexGuard<'_, State>, NetworkError> {
        let state = self.check(operation)?;
        debug!(operation, netns = %state.current.display(), "[MOCK] host network mutation");
        Ok(state)
    }
}

impl Default for MockHostNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// Restores the mock's current namespace when dropped.
struct RestoreNamespace<'a> {
    mock: &'a MockHostNetwork,
    previous: PathBuf,
}

impl Drop for RestoreNamespace<'_> {
    fn drop(&mut self) {
        self.mock.lock().current = self.previous.clone();
    }
}

impl HostNetwork for MockHostNetwork {
    fn link(&self, name: &str) -> Result<Option<Link>, NetworkError> {
        let state = self.check("link")?;
        Ok(state.ns().links.get(name).cloned())
    }

    fn link_by_index(&self, index: u32) -> Result<Option<Link>, NetworkError> {
        let state = self.check("link_by_index")?;
        Ok(state.ns().links.values().find(|l| l.index == index).cloned())
    }

    fn add_bridge(&self, name: &str, mtu: u32) -> Result<(), NetworkError> {
        let mut state = self.mutate("add_bridge")?;
        state.insert_new_link(name, LinkKind::Bridge, mtu)?;
        state.mutations += 1;
        Ok(())
    }

    fn add_vxlan(&self, spec: &VxlanSpec) -> Result<(), NetworkError> {
        let mut state = self.mutate("add_vxlan")?;
        state.insert_new_link(&spec.name, LinkKind::Vxlan, spec.mtu)?;
        let ns = state.ns_mut();
        if let Some(link) = ns.links.get_mut(&spec.name) {
            link.local = Some(spec.local);
        }
        ns.vxlans.insert(spec.name.clone(), spec.clone());
        state.mutations += 1;
        Ok(())
    }

    fn add_veth_pair(&self, name: &str, peer: &str, mtu: u32) -> Result<(), NetworkError> {
        let mut state = self.mutate("add_veth_pair")?;
        if state.ns().links.contains_key(peer) {
            return Err(NetworkError::AlreadyExists(format!("link {}", peer)));
        }
        state.insert_new_link(name, LinkKind::Veth, mtu)?;
        state.insert_new_link(peer, LinkKind::Veth, mtu)?;
        state.mutations += 1;
        Ok(())
    }

    fn move_link(&self, name: &str, netns: &Path) -> Result<(), NetworkError> {
        let mut state = self.mutate("move_link")?;
        match state.namespaces.get(netns) {
            None => {
                return Err(NetworkError::NotFound(format!(
                    "namespace {}",
                    netns.display()
                )))
            }
            Some(target) if target.links.contains_key(name) => {
                return Err(NetworkError::AlreadyExists(format!(
                    "link {} in {}",
                    name,
                    netns.display()
                )))
            }
            Some(_) => {}
        }

        let ns = state.ns_mut();
        let mut link = ns
            .links
            .remove(name)
            .ok_or_else(|| NetworkError::NotFound(format!("link {}", name)))?;
        ns.addresses.remove(name);
        ns.routes.retain(|r| r.device != name);

        // The kernel may renumber a link when it changes namespace
        state.next_index += 1;
        link.index = state.next_index;
        link.up = false;
        link.master = None;

        let target = state
            .namespaces
            .get_mut(netns)
            .expect("namespace presence checked above");
        target.links.insert(name.to_string(), link);
        state.mutations += 1;
        Ok(())
    }

    fn set_link_up(&self, name: &str) -> Result<(), NetworkError> {
        let mut state = self.mutate("set_link_up")?;
        let link = state
            .ns_mut()
            .links
            .get_mut(name)
            .ok_or_else(|| NetworkError::NotFound(format!("link {}", name)))?;
        link.up = true;
        state.mutations += 1;
        Ok(())
    }

    fn set_link_master(&self, name: &str, master: &str) -> Result<(), NetworkError> {
        let mut state = self.mutate("set_link_master")?;
        let master_kind = state.ns().require_link(master)?.kind.clone();
        if master_kind != LinkKind::Bridge {
            return Err(NetworkError::Device(format!("{} is not a bridge", master)));
        }
        let link = state
            .ns_mut()
            .links
            .get_mut(name)
            .ok_or_else(|| NetworkError::NotFound(format!("link {}", name)))?;
        link.master = Some(master.to_string());
        state.mutations += 1;
        Ok(())
    }

    fn addresses(&self, link: &str) -> Result<Vec<Ipv4Network>, NetworkError> {
        let state = self.check("addresses")?;
        let ns = state.ns();
        ns.require_link(link)?;
        Ok(ns.addresses.get(link).cloned().unwrap_or_default())
    }

    fn add_address(&self, link: &str, address: Ipv4Network) -> Result<(), NetworkError> {
        let mut state = self.mutate("add_address")?;
        state.ns().require_link(link)?;
        let addresses = state.ns_mut().addresses.entry(link.to_string()).or_default();
        if addresses.iter().any(|a| a.ip() == address.ip()) {
            return Err(NetworkError::AlreadyExists(format!("address {} on {}", address, link)));
        }
        addresses.push(address);
        state.mutations += 1;
        Ok(())
    }

    fn default_route(&self) -> Result<Option<Route>, NetworkError> {
        let state = self.check("default_route")?;
        Ok(state.ns().routes.iter().find(|r| r.is_default()).cloned())
    }

    fn routes(&self, device: &str) -> Result<Vec<Route>, NetworkError> {
        let state = self.check("routes")?;
        Ok(state
            .ns()
            .routes
            .iter()
            .filter(|r| r.device == device)
            .cloned()
            .collect())
    }

    fn add_route(&self, route: &Route) -> Result<(), NetworkError> {
        let mut state = self.mutate("add_route")?;
        state.ns().require_link(&route.device)?;
        if state
            .ns()
            .routes
            .iter()
            .any(|r| r.destination == route.destination)
        {
            return Err(NetworkError::AlreadyExists(format!("route {}", route.destination)));
        }
        state.ns_mut().routes.push(route.clone());
        state.mutations += 1;
        Ok(())
    }

    fn replace_route(&self, route: &Route) -> Result<(), NetworkError> {
        let mut state = self.mutate("replace_route")?;
        state.ns().require_link(&route.device)?;
        let routes = &mut state.ns_mut().routes;
        routes.retain(|r| r.destination != route.destination);
        routes.push(route.clone());
        state.mutations += 1;
        Ok(())
    }

    fn delete_route(&self, route: &Route) -> Result<(), NetworkError> {
        let mut state = self.mutate("delete_route")?;
        let routes = &mut state.ns_mut().routes;
        let before = routes.len();
        routes.retain(|r| !(r.destination == route.destination && r.device == route.device));
        if routes.len() == before {
            return Err(NetworkError::NotFound(format!("route {}", route.destination)));
        }
        state.mutations += 1;
        Ok(())
    }

    fn neighbors(&self, device: &str) -> Result<Vec<Neighbor>, NetworkError> {
        let state = self.check("neighbors")?;
        Ok(state
            .ns()
            .neighbors
            .iter()
            .filter(|n| n.device == device)
            .cloned()
            .collect())
    }

    fn replace_neighbor(&self, neighbor: &Neighbor) -> Result<(), NetworkError> {
        let mut state = self.mutate("replace_neighbor")?;
        state.ns().require_link(&neighbor.device)?;
        let neighbors = &mut state.ns_mut().neighbors;
        neighbors.retain(|n| !(n.device == neighbor.device && n.address == neighbor.address));
        neighbors.push(neighbor.clone());
        state.mutations += 1;
        Ok(())
    }

    fn delete_neighbor(&self, neighbor: &Neighbor) -> Result<(), NetworkError> {
        let mut state = self.mutate("delete_neighbor")?;
        let neighbors = &mut state.ns_mut().neighbors;
        let before = neighbors.len();
        neighbors.retain(|n| !(n.device == neighbor.device && n.address == neighbor.address));
        if neighbors.len() == before {
            return Err(NetworkError::NotFound(format!("neighbor {}", neighbor.address)));
        }
        state.mutations += 1;
        Ok(())
    }

    fn fdb_entries(&self, device: &str) -> Result<Vec<FdbEntry>, NetworkError> {
        let state = self.check("fdb_entries")?;
        Ok(state
            .ns()
            .fdb
            .iter()
            .filter(|e| e.device == device)
            .cloned()
            .collect())
    }

    fn replace_fdb(&self, entry: &FdbEntry) -> Result<(), NetworkError> {
        let mut state = self.mutate("replace_fdb")?;
        state.ns().require_link(&entry.device)?;
        let fdb = &mut state.ns_mut().fdb;
        fdb.retain(|e| !(e.device == entry.device && e.mac == entry.mac));
        fdb.push(entry.clone());
        state.mutations += 1;
        Ok(())
    }

    fn delete_fdb(&self, entry: &FdbEntry) -> Result<(), NetworkError> {
        let mut state = self.mutate("delete_fdb")?;
        let fdb = &mut state.ns_mut().fdb;
        let before = fdb.len();
        fdb.retain(|e| !(e.device == entry.device && e.mac == entry.mac));
        if fdb.len() == before {
            return Err(NetworkError::NotFound(format!("fdb entry {}", entry.mac)));
        }
        state.mutations += 1;
        Ok(())
    }

    fn in_namespace<R, F>(&self, netns: &Path, f: F) -> Result<R, NetworkError>
    where
        F: FnOnce(&Path) -> Result<R, NetworkError>,
    {
        let previous = {
            let mut state = self
                .check("in_namespace")
                .map_err(|e| NetworkError::Namespace(e.to_string()))?;
            if !state.namespaces.contains_key(netns) {
                return Err(NetworkError::NamespaceNotFound(netns.display().to_string()));
            }
            std::mem::replace(&mut state.current, netns.to_path_buf())
        };

        let _restore = RestoreNamespace {
            mock: self,
            previous: previous.clone(),
        };
        f(&previous)
    }
}
