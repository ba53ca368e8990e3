//! Peer synchronization tests against the in-memory host network.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Node, NodeSpec};
use kube::api::ObjectMeta;
use tokio::sync::{mpsc, watch};
use vxnet_networking::{HostNetwork, MacAddr, MockHostNetwork, PodCidr};
use vxnet_node_agent::device::DEVICE_NAME;
use vxnet_node_agent::metadata::{HOST_IP_ANNOTATION, VTEP_MAC_ANNOTATION};
use vxnet_node_agent::{ensure_device, PeerEvent, PeerReconciler};

fn local_host() -> MockHostNetwork {
    MockHostNetwork::new().with_uplink(
        "eth0",
        "192.168.1.10/24".parse().unwrap(),
        "192.168.1.1".parse().unwrap(),
        1500,
    )
}

fn reconciler() -> PeerReconciler<MockHostNetwork> {
    let host = local_host();
    let device = ensure_device(&host, &PodCidr::parse("10.244.3.0/24").unwrap()).unwrap();
    PeerReconciler::new(host, device)
}

fn peer(name: &str, version: &str, cidr: Option<&str>, mac: Option<&str>, ip: Option<&str>) -> Node {
    let mut annotations = BTreeMap::new();
    if let Some(mac) = mac {
        annotations.insert(VTEP_MAC_ANNOTATION.to_string(), mac.to_string());
    }
    if let Some(ip) = ip {
        annotations.insert(HOST_IP_ANNOTATION.to_string(), ip.to_string());
    }

    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            resource_version: Some(version.to_string()),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            pod_cidr: cidr.map(str::to_string),
            ..Default::default()
        }),
        status: None,
    }
}

fn ready(name: &str, cidr: &str, mac: &str, ip: &str) -> Node {
    peer(name, "1", Some(cidr), Some(mac), Some(ip))
}

fn mac(s: &str) -> MacAddr {
    s.parse().unwrap()
}

fn ip(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

/// (ARP, FDB, non-cluster routes) on the tunnel device.
fn entry_counts(r: &PeerReconciler<MockHostNetwork>) -> (usize, usize, usize) {
    let host = r.host();
    let peer_routes = host
        .routes(DEVICE_NAME)
        .unwrap()
        .into_iter()
        .filter(|route| route.gateway.is_some())
        .count();
    (
        host.neighbors(DEVICE_NAME).unwrap().len(),
        host.fdb_entries(DEVICE_NAME).unwrap().len(),
        peer_routes,
    )
}

#[test]
fn test_two_peers_are_synchronized() {
    let mut r = reconciler();

    r.on_peer_added(&ready("node-1", "10.244.1.0/24", "aa:aa:aa:aa:aa:01", "192.168.1.21"))
        .unwrap();
    r.on_peer_added(&ready("node-2", "10.244.2.0/24", "aa:aa:aa:aa:aa:02", "192.168.1.22"))
        .unwrap();

    let host = r.host();

    let neighbors = host.neighbors(DEVICE_NAME).unwrap();
    assert!(neighbors
        .iter()
        .any(|n| n.address == ip("10.244.1.0") && n.mac == mac("aa:aa:aa:aa:aa:01")));
    assert!(neighbors
        .iter()
        .any(|n| n.address == ip("10.244.2.0") && n.mac == mac("aa:aa:aa:aa:aa:02")));

    let fdb = host.fdb_entries(DEVICE_NAME).unwrap();
    assert!(fdb
        .iter()
        .any(|e| e.mac == mac("aa:aa:aa:aa:aa:01") && e.destination == ip("192.168.1.21")));
    assert!(fdb
        .iter()
        .any(|e| e.mac == mac("aa:aa:aa:aa:aa:02") && e.destination == ip("192.168.1.22")));

    let routes = host.routes(DEVICE_NAME).unwrap();
    for cidr in ["10.244.1.0/24", "10.244.2.0/24"] {
        let route = routes
            .iter()
            .find(|r| r.destination == cidr.parse().unwrap())
            .unwrap_or_else(|| panic!("missing route for {}", cidr));
        assert_eq!(route.device, DEVICE_NAME);
        assert!(route.onlink);
    }

    assert_eq!(r.peer_count(), 2);
}

#[test]
fn test_add_then_remove_leaves_no_residue() {
    let mut r = reconciler();
    let node = ready("node-1", "10.244.1.0/24", "aa:aa:aa:aa:aa:01", "192.168.1.21");

    r.on_peer_added(&node).unwrap();
    assert_eq!(entry_counts(&r), (1, 1, 1));

    r.on_peer_removed(&node).unwrap();

    assert_eq!(entry_counts(&r), (0, 0, 0));
    assert!(r.installed("node-1").is_none());
    // The cluster route stays.
    assert_eq!(r.host().routes(DEVICE_NAME).unwrap().len(), 1);
}

#[test]
fn test_not_ready_peer_is_picked_up_later() {
    let mut r = reconciler();
    let bare = peer("node-1", "1", Some("10.244.1.0/24"), None, None);

    r.on_peer_added(&bare).unwrap();
    assert_eq!(entry_counts(&r), (0, 0, 0));

    let annotated = peer(
        "node-1",
        "2",
        Some("10.244.1.0/24"),
        Some("aa:aa:aa:aa:aa:01"),
        Some("192.168.1.21"),
    );
    r.on_peer_updated(&bare, &annotated).unwrap();

    assert_eq!(entry_counts(&r), (1, 1, 1));
}

#[test]
fn test_mac_change_replaces_fdb_entry() {
    let mut r = reconciler();
    let old = ready("node-1", "10.244.1.0/24", "aa:aa:aa:aa:aa:01", "192.168.1.21");
    let new = peer(
        "node-1",
        "2",
        Some("10.244.1.0/24"),
        Some("aa:aa:aa:aa:aa:99"),
        Some("192.168.1.21"),
    );
    r.on_peer_added(&old).unwrap();

    r.on_peer_updated(&old, &new).unwrap();

    let fdb = r.host().fdb_entries(DEVICE_NAME).unwrap();
    assert_eq!(fdb.len(), 1);
    assert_eq!(fdb[0].mac, mac("aa:aa:aa:aa:aa:99"));

    let neighbors = r.host().neighbors(DEVICE_NAME).unwrap();
    assert_eq!(neighbors.len(), 1);
    assert_eq!(neighbors[0].mac, mac("aa:aa:aa:aa:aa:99"));
}

#[test]
fn test_unrelated_update_is_ignored() {
    let mut r = reconciler();
    let old = ready("node-1", "10.244.1.0/24", "aa:aa:aa:aa:aa:01", "192.168.1.21");
    r.on_peer_added(&old).unwrap();
    let mutations = r.host().mutation_count();

    let mut new = old.clone();
    new.metadata.resource_version = Some("2".to_string());
    new.metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert("topology.kubernetes.io/zone".to_string(), "b".to_string());

    r.on_peer_updated(&old, &new).unwrap();

    assert_eq!(r.host().mutation_count(), mutations);
}

#[test]
fn test_cidr_change_moves_entries() {
    let mut r = reconciler();
    let old = ready("node-1", "10.244.1.0/24", "aa:aa:aa:aa:aa:01", "192.168.1.21");
    let new = peer(
        "node-1",
        "2",
        Some("10.244.7.0/24"),
        Some("aa:aa:aa:aa:aa:01"),
        Some("192.168.1.21"),
    );
    r.on_peer_added(&old).unwrap();

    r.on_peer_updated(&old, &new).unwrap();

    assert_eq!(entry_counts(&r), (1, 1, 1));
    let neighbors = r.host().neighbors(DEVICE_NAME).unwrap();
    assert_eq!(neighbors[0].address, ip("10.244.7.0"));
    assert!(r
        .host()
        .routes(DEVICE_NAME)
        .unwrap()
        .iter()
        .any(|route| route.destination == "10.244.7.0/24".parse().unwrap()));
}

#[test]
fn test_remove_reports_all_failures_and_continues() {
    let mut r = reconciler();
    let node = ready("node-1", "10.244.1.0/24", "aa:aa:aa:aa:aa:01", "192.168.1.21");
    r.on_peer_added(&node).unwrap();
    r.host().fail_on("delete_neighbor");
    r.host().fail_on("delete_route");

    let err = r.on_peer_removed(&node).unwrap_err().to_string();

    assert!(err.contains("arp"));
    assert!(err.contains("route"));
    // The FDB deletion still ran.
    assert_eq!(entry_counts(&r), (1, 0, 1));
}

#[test]
fn test_remove_of_unknown_peer_without_identity() {
    let mut r = reconciler();
    r.on_peer_removed(&peer("node-9", "1", None, None, None))
        .unwrap();
}

#[tokio::test]
async fn test_run_processes_events_until_shutdown() {
    let mut r = reconciler();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let node = ready("node-1", "10.244.1.0/24", "aa:aa:aa:aa:aa:01", "192.168.1.21");
    events_tx.send(PeerEvent::Added(node.clone())).unwrap();
    // A failing event must not stop the loop.
    events_tx
        .send(PeerEvent::Added(ready(
            "node-2",
            "10.244.2.0/24",
            "aa:aa:aa:aa:aa:02",
            "192.168.1.22",
        )))
        .unwrap();
    events_tx.send(PeerEvent::Removed(node)).unwrap();

    r.host().fail_on("replace_fdb");
    let handle = tokio::spawn(async move {
        r.run(events_rx, shutdown_rx).await;
        r
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown_tx.send(true).unwrap();

    let r = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(r.peer_count(), 0);
}

#[tokio::test]
async fn test_run_stops_when_stream_closes() {
    let mut r = reconciler();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    events_tx
        .send(PeerEvent::Added(ready(
            "node-1",
            "10.244.1.0/24",
            "aa:aa:aa:aa:aa:01",
            "192.168.1.21",
        )))
        .unwrap();
    drop(events_tx);

    tokio::time::timeout(Duration::from_secs(5), r.run(events_rx, shutdown_rx))
        .await
        .unwrap();

    assert_eq!(r.peer_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_spawned_loop_returns_reconciler() {
    let r = reconciler();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = r.spawn(events_rx, shutdown_rx);
    events_tx
        .send(PeerEvent::Added(ready(
            "node-1",
            "10.244.1.0/24",
            "aa:aa:aa:aa:aa:01",
            "192.168.1.21",
        )))
        .unwrap();
    drop(events_tx);

    let r = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(r.peer_count(), 1);
    assert_eq!(entry_counts(&r), (1, 1, 1));
}
