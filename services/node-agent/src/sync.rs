//! Peer forwarding state synchronization.
//!
//! For every ready peer the tunnel device carries three entries:
//! - ARP: peer pod network address -> peer tunnel MAC
//! - FDB: peer tunnel MAC -> peer host IP
//! - route: peer pod block via the peer pod network address, on-link
//!
//! Together they let the kernel encapsulate traffic for any remote pod without
//! multicast or dynamic learning.

use std::collections::HashMap;

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use vxnet_networking::{FdbEntry, HostNetwork, Neighbor, NetworkError, Route};

use crate::cluster::PeerEvent;
use crate::device::OverlayDevice;
use crate::metadata::{annotation, identity_of, PeerIdentity, VTEP_MAC_ANNOTATION};

/// Applies peer membership events to the tunnel device.
pub struct PeerReconciler<H: HostNetwork> {
    host: H,
    device: OverlayDevice,
    installed: HashMap<String, PeerIdentity>,
}

impl<H: HostNetwork> PeerReconciler<H> {
    pub fn new(host: H, device: OverlayDevice) -> Self {
        Self {
            host,
            device,
            installed: HashMap::new(),
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn device(&self) -> &OverlayDevice {
        &self.device
    }

    /// Identity currently installed for a peer.
    pub fn installed(&self, peer: &str) -> Option<&PeerIdentity> {
        self.installed.get(peer)
    }

    /// Number of peers with installed entries.
    pub fn peer_count(&self) -> usize {
        self.installed.len()
    }

    /// Install entries for a peer. Peers that have not published a complete
    /// identity yet are skipped.
    pub fn on_peer_added(&mut self, node: &Node) -> Result<(), NetworkError> {
        let identity = match identity_of(node) {
            Ok(identity) => identity,
            Err(e) => {
                debug!(peer = %node.name_any(), error = %e, "Peer not ready, skipping");
                return Ok(());
            }
        };

        self.install(identity)
    }

    /// Re-install a peer if its tunnel identity changed.
    pub fn on_peer_updated(&mut self, old: &Node, new: &Node) -> Result<(), NetworkError> {
        let name = new.name_any();
        let mac_changed =
            annotation(old, VTEP_MAC_ANNOTATION) != annotation(new, VTEP_MAC_ANNOTATION);
        let identity_changed = match identity_of(new) {
            Ok(identity) => self.installed.get(&name) != Some(&identity),
            Err(_) => false,
        };

        if !mac_changed && !identity_changed {
            debug!(peer = %name, "Peer update does not touch tunnel identity");
            return Ok(());
        }

        self.on_peer_added(new)
    }

    /// Remove a peer's entries. Every deletion is attempted; failures are
    /// reported together.
    pub fn on_peer_removed(&mut self, node: &Node) -> Result<(), NetworkError> {
        let name = node.name_any();
        let identity = match self.installed.remove(&name) {
            Some(identity) => identity,
            None => match identity_of(node) {
                Ok(identity) => identity,
                Err(_) => {
                    debug!(peer = %name, "Removed peer had no tunnel identity");
                    return Ok(());
                }
            },
        };

        let failures = self.remove_entries(&identity, true, true);
        if !failures.is_empty() {
            return Err(NetworkError::Sync(format!(
                "peer {}: {}",
                name,
                failures.join("; ")
            )));
        }

        info!(peer = %name, pod_cidr = %identity.pod_cidr, "Removed peer");
        Ok(())
    }

    /// Dispatch a single event.
    pub fn handle(&mut self, event: &PeerEvent) -> Result<(), NetworkError> {
        match event {
            PeerEvent::Added(node) => self.on_peer_added(node),
            PeerEvent::Updated { old, new } => self.on_peer_updated(old, new),
            PeerEvent::Removed(node) => self.on_peer_removed(node),
        }
    }

    /// Process events one at a time until the stream closes or shutdown is
    /// signalled.
    pub async fn run(
        &mut self,
        mut events: mpsc::UnboundedReceiver<PeerEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(device = %self.device.name, "Starting peer synchronization");

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.handle(&event) {
                            error!(
                                peer = %event.node_name(),
                                error = %e,
                                reason = e.reason_code(),
                                "Peer synchronization failed"
                            );
                        }
                    }
                    None => {
                        warn!("Peer event stream closed");
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Peer synchronization shutting down");
                        break;
                    }
                }
            }
        }
    }

    fn install(&mut self, identity: PeerIdentity) -> Result<(), NetworkError> {
        if let Some(previous) = self.installed.get(&identity.name).cloned() {
            if previous == identity {
                debug!(peer = %identity.name, "Peer entries already installed");
            } else {
                // Entries are keyed by MAC (FDB) and pod network (ARP, route);
                // only keys that changed leave stale state behind.
                let mac_changed = previous.vtep_mac != identity.vtep_mac;
                let cidr_changed = previous.pod_cidr != identity.pod_cidr;
                for failure in self.remove_entries(&previous, mac_changed, cidr_changed) {
                    warn!(peer = %identity.name, error = %failure, "Failed to remove stale entry");
                }
            }
        }

        let sync_err = |what: &str, e: NetworkError| {
            NetworkError::Sync(format!("peer {}: {}: {}", identity.name, what, e))
        };

        self.host
            .replace_neighbor(&self.neighbor(&identity))
            .map_err(|e| sync_err("arp", e))?;
        self.host
            .replace_fdb(&self.fdb(&identity))
            .map_err(|e| sync_err("fdb", e))?;
        self.host
            .replace_route(&self.route(&identity))
            .map_err(|e| sync_err("route", e))?;

        info!(
            peer = %identity.name,
            pod_cidr = %identity.pod_cidr,
            vtep_mac = %identity.vtep_mac,
            host_ip = %identity.host_ip,
            "Installed peer"
        );

        self.installed.insert(identity.name.clone(), identity);
        Ok(())
    }

    /// Delete the selected entries for `identity`. Entries that are already
    /// gone are not failures.
    fn remove_entries(&self, identity: &PeerIdentity, fdb: bool, cidr_keyed: bool) -> Vec<String> {
        let mut failures = Vec::new();
        let mut record = |what: &str, result: Result<(), NetworkError>| match result {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(peer = %identity.name, entry = what, "Entry already gone");
            }
            Err(e) => failures.push(format!("{}: {}", what, e)),
        };

        if cidr_keyed {
            record("arp", self.host.delete_neighbor(&self.neighbor(identity)));
        }
        if fdb {
            record("fdb", self.host.delete_fdb(&self.fdb(identity)));
        }
        if cidr_keyed {
            record("route", self.host.delete_route(&self.route(identity)));
        }

        failures
    }

    fn neighbor(&self, identity: &PeerIdentity) -> Neighbor {
        Neighbor {
            device: self.device.name.clone(),
            address: identity.pod_cidr.network_address(),
            mac: identity.vtep_mac,
        }
    }

    fn fdb(&self, identity: &PeerIdentity) -> FdbEntry {
        FdbEntry {
            device: self.device.name.clone(),
            mac: identity.vtep_mac,
            destination: identity.host_ip,
        }
    }

    fn route(&self, identity: &PeerIdentity) -> Route {
        Route::via_gateway(
            identity.pod_cidr.network(),
            &self.device.name,
            identity.pod_cidr.network_address(),
        )
        .with_onlink()
    }
}

impl<H: HostNetwork + 'static> PeerReconciler<H> {
    /// Run [`PeerReconciler::run`] on a blocking thread and hand the
    /// reconciler back when it stops.
    ///
    /// Every host call waits on an `ip` or `bridge` child process, which must
    /// not happen on an async worker.
    pub fn spawn(
        mut self,
        events: mpsc::UnboundedReceiver<PeerEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<Self> {
        let runtime = Handle::current();
        tokio::task::spawn_blocking(move || {
            runtime.block_on(self.run(events, shutdown));
            self
        })
    }
}
