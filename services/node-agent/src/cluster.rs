//! Cluster access and node membership events.
//!
//! [`ClusterContext`] owns the API client and the node watch task. The watch
//! task keeps its own copy of every peer node and turns raw watcher events
//! into [`PeerEvent`]s carrying both the old and new object on updates.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures_util::StreamExt;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::Api;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::NodeSource;

/// Membership change for a peer node.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    Added(Node),
    Updated { old: Node, new: Node },
    Removed(Node),
}

impl PeerEvent {
    /// Name of the node the event is about.
    pub fn node_name(&self) -> String {
        match self {
            PeerEvent::Added(node) | PeerEvent::Removed(node) => node.name_any(),
            PeerEvent::Updated { new, .. } => new.name_any(),
        }
    }
}

/// Last known state of every peer node.
///
/// Events about the local node are dropped. A relist (`Init` ... `InitDone`)
/// is diffed against the cache so nodes deleted while the watch was down
/// still produce a removal.
#[derive(Debug)]
pub struct NodeCache {
    self_name: String,
    nodes: HashMap<String, Node>,
    relist: Option<HashMap<String, Node>>,
    synced: bool,
}

impl NodeCache {
    pub fn new(self_name: impl Into<String>) -> Self {
        Self {
            self_name: self_name.into(),
            nodes: HashMap::new(),
            relist: None,
            synced: false,
        }
    }

    /// True once the first full listing has been processed.
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Number of peers currently known.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Fold a watcher event into the cache and return the resulting peer events.
    pub fn apply(&mut self, event: watcher::Event<Node>) -> Vec<PeerEvent> {
        match event {
            watcher::Event::Init => {
                self.relist = Some(HashMap::new());
                Vec::new()
            }
            watcher::Event::InitApply(node) => {
                if self.is_self(&node) {
                    return Vec::new();
                }
                match self.relist.as_mut() {
                    Some(relist) => {
                        relist.insert(node.name_any(), node);
                        Vec::new()
                    }
                    // InitApply outside a relist; treat as a plain apply.
                    None => self.upsert(node).into_iter().collect(),
                }
            }
            watcher::Event::InitDone => {
                let relist = self.relist.take().unwrap_or_default();
                let mut events = Vec::new();

                let gone: Vec<String> = self
                    .nodes
                    .keys()
                    .filter(|name| !relist.contains_key(*name))
                    .cloned()
                    .collect();
                for name in gone {
                    if let Some(old) = self.nodes.remove(&name) {
                        events.push(PeerEvent::Removed(old));
                    }
                }

                for node in relist.into_values() {
                    events.extend(self.upsert(node));
                }

                self.synced = true;
                events
            }
            watcher::Event::Apply(node) => {
                if self.is_self(&node) {
                    return Vec::new();
                }
                self.upsert(node).into_iter().collect()
            }
            watcher::Event::Delete(node) => {
                if self.is_self(&node) {
                    return Vec::new();
                }
                let old = self.nodes.remove(&node.name_any());
                vec![PeerEvent::Removed(old.unwrap_or(node))]
            }
        }
    }

    fn is_self(&self, node: &Node) -> bool {
        node.name_any() == self.self_name
    }

    fn upsert(&mut self, node: Node) -> Option<PeerEvent> {
        let name = node.name_any();
        match self.nodes.insert(name, node.clone()) {
            None => Some(PeerEvent::Added(node)),
            Some(old) if old.resource_version() == node.resource_version() => None,
            Some(old) => Some(PeerEvent::Updated { old, new: node }),
        }
    }
}

/// Handle on the cluster API and the node watch.
pub struct ClusterContext {
    client: Client,
    stop_tx: watch::Sender<bool>,
    synced_rx: Option<watch::Receiver<bool>>,
    watch_task: Option<JoinHandle<()>>,
}

impl ClusterContext {
    /// Connect using in-cluster or kubeconfig credentials.
    pub async fn connect() -> Result<Self> {
        let client = Client::try_default()
            .await
            .context("failed to create cluster client")?;
        info!("Connected to cluster API");
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Client) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            client,
            stop_tx,
            synced_rx: None,
            watch_task: None,
        }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Name of the node this process runs on.
    pub async fn resolve_node_name(&self, source: &NodeSource) -> Result<String> {
        match source {
            NodeSource::Named(name) => Ok(name.clone()),
            NodeSource::Pod { name, namespace } => {
                let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
                let pod = pods
                    .get(name)
                    .await
                    .with_context(|| format!("failed to get pod {}/{}", namespace, name))?;
                pod.spec
                    .and_then(|s| s.node_name)
                    .ok_or_else(|| anyhow!("pod {}/{} is not scheduled", namespace, name))
            }
        }
    }

    /// Fetch a node by name.
    pub async fn get_node(&self, name: &str) -> Result<Node> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        nodes
            .get(name)
            .await
            .with_context(|| format!("failed to get node {}", name))
    }

    /// Start watching nodes. Events about `self_name` are not delivered.
    pub fn start_watch(&mut self, self_name: &str) -> Result<mpsc::UnboundedReceiver<PeerEvent>> {
        if self.watch_task.is_some() {
            return Err(anyhow!("node watch already running"));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (synced_tx, synced_rx) = watch::channel(false);
        let mut stop_rx = self.stop_tx.subscribe();
        let api: Api<Node> = Api::all(self.client.clone());
        let mut cache = NodeCache::new(self_name);

        let task = tokio::spawn(async move {
            let stream = watcher(api, watcher::Config::default()).default_backoff();
            let mut stream = std::pin::pin!(stream);

            loop {
                tokio::select! {
                    next = stream.next() => match next {
                        Some(Ok(event)) => {
                            for peer_event in cache.apply(event) {
                                debug!(node = %peer_event.node_name(), "Node event");
                                if events_tx.send(peer_event).is_err() {
                                    debug!("Event receiver dropped, stopping node watch");
                                    return;
                                }
                            }
                            if cache.is_synced() && !*synced_tx.borrow() {
                                info!(peers = cache.len(), "Node cache synced");
                                let _ = synced_tx.send(true);
                            }
                        }
                        Some(Err(e)) => warn!(error = %e, "Node watch error"),
                        None => {
                            warn!("Node watch stream ended");
                            return;
                        }
                    },
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            debug!("Node watch stopping");
                            return;
                        }
                    }
                }
            }
        });

        self.synced_rx = Some(synced_rx);
        self.watch_task = Some(task);
        info!(node = self_name, "Started node watch");
        Ok(events_rx)
    }

    /// Wait until the first full node listing has been delivered.
    pub async fn wait_for_sync(&self, timeout: Duration) -> Result<()> {
        let mut synced = self
            .synced_rx
            .clone()
            .ok_or_else(|| anyhow!("node watch not started"))?;

        tokio::time::timeout(timeout, synced.wait_for(|s| *s))
            .await
            .with_context(|| format!("node cache did not sync within {:?}", timeout))?
            .context("node watch ended before syncing")?;
        Ok(())
    }

    /// Stop the watch task.
    pub async fn stop(&mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(task) = self.watch_task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Node watch task failed");
            }
        }
        info!("Cluster context stopped");
    }
}
