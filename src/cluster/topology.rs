//! Topology Registry: the versioned, ordered view of cluster members.
//!
//! The registry is the single serialization point for membership. Each admitted
//! join or leave publishes exactly one new [`TopologyVersion`] together with an
//! immutable [`TopologySnapshot`]. Consumers observe versions through a
//! `tokio::sync::watch` channel and can replay any version still held in the
//! bounded history, so no consumer ever needs to skip a version.
//!
//! Snapshots do not own their nodes. They list member identities in join order
//! and resolve them through a [`NodeTable`] shared with neighboring versions.
//! A departed node stays reachable only through the retained snapshots that
//! still list it, so memory follows the live cluster and the history bound.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::ClusterConfig;
use super::error::{ClusterError, ClusterResult};
use super::metrics;
use super::node::{DiscoveryEvent, Node, NodeSpec};
use crate::types::{JoinOrder, NodeId, TopologyVersion};

/// Live nodes at one or more consecutive versions, keyed by identity.
///
/// Each join or leave builds a new table from the previous one; snapshots keep
/// whichever table was current when they were published.
#[derive(Debug, Default)]
pub struct NodeTable {
    nodes: HashMap<NodeId, Arc<Node>>,
}

impl NodeTable {
    pub fn get(&self, id: &NodeId) -> Option<&Arc<Node>> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn with_node(&self, node: Node) -> Self {
        let mut nodes = self.nodes.clone();
        nodes.insert(node.id(), Arc::new(node));
        Self { nodes }
    }

    fn without_node(&self, id: &NodeId) -> Self {
        let nodes = self
            .nodes
            .iter()
            .filter(|(n, _)| *n != id)
            .map(|(n, node)| (*n, node.clone()))
            .collect();
        Self { nodes }
    }
}

/// Immutable membership at one topology version.
#[derive(Debug)]
pub struct TopologySnapshot {
    version: TopologyVersion,
    /// Live members sorted by join order.
    members: Vec<NodeId>,
    positions: HashMap<NodeId, usize>,
    table: Arc<NodeTable>,
}

impl TopologySnapshot {
    /// The empty topology at version 0.
    pub fn empty() -> Self {
        Self::build(TopologyVersion::INITIAL, Vec::new(), Arc::default())
    }

    fn build(version: TopologyVersion, members: Vec<NodeId>, table: Arc<NodeTable>) -> Self {
        let positions = members.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        Self {
            version,
            members,
            positions,
            table,
        }
    }

    #[inline]
    pub fn version(&self) -> TopologyVersion {
        self.version
    }

    /// Live member identities in join order.
    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Whether the node is live at this version.
    pub fn contains(&self, id: &NodeId) -> bool {
        self.positions.contains_key(id)
    }

    /// Look up a live member.
    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        if self.contains(id) {
            self.table.get(id).map(|n| n.as_ref())
        } else {
            None
        }
    }

    /// Live members in join order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> + '_ {
        self.members
            .iter()
            .filter_map(move |id| self.table.get(id).map(|n| n.as_ref()))
    }

    /// Live server members in join order.
    pub fn servers(&self) -> impl Iterator<Item = &Node> + '_ {
        self.nodes().filter(|n| n.is_server())
    }

    /// Live client members in join order.
    pub fn clients(&self) -> impl Iterator<Item = &Node> + '_ {
        self.nodes().filter(|n| !n.is_server())
    }

    pub fn server_count(&self) -> usize {
        self.servers().count()
    }

    /// Table that resolves the members of this snapshot.
    pub fn table(&self) -> &Arc<NodeTable> {
        &self.table
    }
}

struct RegistryState {
    table: Arc<NodeTable>,
    current: Arc<TopologySnapshot>,
    /// Every identity ever admitted, so a departed id is never reused.
    admitted: HashSet<NodeId>,
}

/// Owner of cluster membership and topology versions.
///
/// Mutations are serialized by an async mutex, so concurrent joins are ordered
/// by their arrival at the registry. Reads never take that lock.
pub struct TopologyRegistry {
    state: Mutex<RegistryState>,
    next_order: AtomicU64,
    sender: watch::Sender<Arc<TopologySnapshot>>,
    history: DashMap<TopologyVersion, Arc<TopologySnapshot>>,
    history_capacity: usize,
}

impl TopologyRegistry {
    /// Create a registry holding the empty topology at version 0.
    pub fn new(history_capacity: usize) -> Self {
        let initial = Arc::new(TopologySnapshot::empty());
        let (sender, _) = watch::channel(initial.clone());
        let history = DashMap::new();
        history.insert(TopologyVersion::INITIAL, initial.clone());

        Self {
            state: Mutex::new(RegistryState {
                table: initial.table.clone(),
                current: initial,
                admitted: HashSet::new(),
            }),
            next_order: AtomicU64::new(0),
            sender,
            history,
            history_capacity: history_capacity.max(1),
        }
    }

    pub fn from_config(config: &ClusterConfig) -> Self {
        Self::new(config.topology_history_capacity)
    }

    /// Latest published snapshot.
    pub fn current(&self) -> Arc<TopologySnapshot> {
        self.sender.borrow().clone()
    }

    /// Latest published version.
    pub fn version(&self) -> TopologyVersion {
        self.sender.borrow().version()
    }

    /// Receive every subsequently published snapshot.
    ///
    /// A watch receiver only keeps the latest value; consumers that must see
    /// every version use [`TopologyRegistry::snapshots_since`] to fill gaps.
    pub fn subscribe(&self) -> watch::Receiver<Arc<TopologySnapshot>> {
        self.sender.subscribe()
    }

    /// Admit a node and publish the next version.
    ///
    /// Identities are never reused: a node that left must rejoin under a new id.
    pub async fn join(&self, spec: NodeSpec) -> ClusterResult<Arc<TopologySnapshot>> {
        let mut state = self.state.lock().await;

        if state.admitted.contains(&spec.id) {
            metrics::record_discovery_event("join", "duplicate");
            return Err(ClusterError::DuplicateNode { node: spec.id });
        }

        let order = JoinOrder::new(self.next_order.fetch_add(1, Ordering::SeqCst) + 1);
        let node = Node::admit(spec, order);
        let id = node.id();
        let role = node.role();

        state.admitted.insert(id);
        let table = Arc::new(state.table.with_node(node));
        // Join orders only grow, so appending keeps members sorted.
        let mut members = state.current.members.clone();
        members.push(id);

        let snapshot = self.publish(&mut state, members, table);
        metrics::record_discovery_event("join", "admitted");
        info!(
            node = %id,
            order = %order,
            %role,
            version = %snapshot.version(),
            members = snapshot.len(),
            "Node joined topology"
        );
        Ok(snapshot)
    }

    /// Remove a live node and publish the next version.
    ///
    /// Returns `None` when the node is unknown or already departed; such events
    /// are ignored.
    pub async fn leave(&self, id: NodeId) -> Option<Arc<TopologySnapshot>> {
        let mut state = self.state.lock().await;

        if !state.current.contains(&id) {
            metrics::record_discovery_event("leave", "ignored");
            debug!(node = %id, "Ignoring leave for node that is not live");
            return None;
        }

        let members: Vec<NodeId> = state
            .current
            .members
            .iter()
            .copied()
            .filter(|m| *m != id)
            .collect();
        let table = Arc::new(state.table.without_node(&id));

        let snapshot = self.publish(&mut state, members, table);
        metrics::record_discovery_event("leave", "removed");
        info!(
            node = %id,
            version = %snapshot.version(),
            members = snapshot.len(),
            "Node left topology"
        );
        Some(snapshot)
    }

    /// Apply a discovery event. `Ok(None)` means the event was ignored.
    pub async fn apply(&self, event: DiscoveryEvent) -> ClusterResult<Option<Arc<TopologySnapshot>>> {
        match event {
            DiscoveryEvent::Join(spec) => self.join(spec).await.map(Some),
            DiscoveryEvent::Leave { id } => Ok(self.leave(id).await),
        }
    }

    fn publish(
        &self,
        state: &mut RegistryState,
        members: Vec<NodeId>,
        table: Arc<NodeTable>,
    ) -> Arc<TopologySnapshot> {
        let version = state.current.version().next();
        let snapshot = Arc::new(TopologySnapshot::build(version, members, table.clone()));

        self.history.insert(version, snapshot.clone());
        if let Some(evicted) = version.value().checked_sub(self.history_capacity as u64) {
            self.history.remove(&TopologyVersion::new(evicted));
        }

        state.table = table;
        state.current = snapshot.clone();
        self.sender.send_replace(snapshot.clone());

        let servers = snapshot.server_count();
        metrics::record_topology_published(version.value(), servers, snapshot.len() - servers);
        snapshot
    }

    /// Snapshot published at `version`.
    ///
    /// `Ok(None)` if that version has not been published yet.
    pub fn snapshot_at(
        &self,
        version: TopologyVersion,
    ) -> ClusterResult<Option<Arc<TopologySnapshot>>> {
        if version > self.version() {
            return Ok(None);
        }
        self.history
            .get(&version)
            .map(|s| Some(s.value().clone()))
            .ok_or(ClusterError::HistoryPruned { version })
    }

    /// Every snapshot published after `version`, in version order.
    pub fn snapshots_since(
        &self,
        version: TopologyVersion,
    ) -> ClusterResult<Vec<Arc<TopologySnapshot>>> {
        let current = self.version();
        let mut out = Vec::new();
        let mut v = version.next();
        while v <= current {
            match self.history.get(&v) {
                Some(s) => out.push(s.value().clone()),
                None => return Err(ClusterError::HistoryPruned { version: v }),
            }
            v = v.next();
        }
        Ok(out)
    }

    /// Wait until at least `version` has been published.
    pub async fn wait_for_version(&self, version: TopologyVersion) -> Arc<TopologySnapshot> {
        let mut rx = self.subscribe();
        match rx.wait_for(|s| s.version() >= version).await {
            Ok(s) => s.clone(),
            // The sender lives as long as self, so the channel cannot close here.
            Err(_) => self.current(),
        }
    }

    /// Consume discovery events on a background task until the channel closes.
    pub fn spawn_discovery_listener(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<DiscoveryEvent>,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let node = event.node_id();
                if let Err(e) = registry.apply(event).await {
                    warn!(node = %node, error = %e, "Rejected discovery event");
                }
            }
            info!(
                version = %registry.version(),
                "Discovery channel closed, listener stopping"
            );
        })
    }
}

impl std::fmt::Debug for TopologyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyRegistry")
            .field("version", &self.version())
            .field("history_capacity", &self.history_capacity)
            .finish()
    }
}
