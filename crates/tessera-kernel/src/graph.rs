//! The replicated graph as shared by sessions, the coordinator and the UI.
//!
//! # Concurrency Model
//!
//! - One `parking_lot::RwLock` around the [`GraphStore`]; writers hold it
//!   only for the synchronous store call, never across an await
//! - Every successful mutation publishes a [`GraphFlow`] after the lock drops
//! - Every public write snapshots the graph when it was loaded from a store.
//!   Session deltas go through `stream_update`, which leaves snapshotting
//!   to the session's checkpoint cadence
//! - Snapshots are serialized by `persist_lock`, so a slow writer never
//!   saves an older state over a newer one

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use tessera_crdt::{
    Edge, EdgeId, GraphState, GraphStore, KindRegistry, MergeReport, Node, NodeId, NodePatch,
    NodeSnapshot, ReplicaId, Result, Stamp,
};

use crate::checkpoint::SessionPhase;
use crate::flows::{FlowBus, GraphFlow, OpSource};
use crate::persist::{GraphSnapshots, PersistError};

/// Snapshot name used when none is given.
pub const DEFAULT_GRAPH: &str = "main";

pub struct SharedGraph {
    store: RwLock<GraphStore>,
    flows: FlowBus,
    snapshots: Option<(GraphSnapshots, String)>,
    persist_lock: Mutex<()>,
}

impl SharedGraph {
    /// In-memory graph with no persistence.
    pub fn new(store: GraphStore, flows: FlowBus) -> Self {
        Self {
            store: RwLock::new(store),
            flows,
            snapshots: None,
            persist_lock: Mutex::new(()),
        }
    }

    /// Load the named snapshot (or start empty) and persist back to it.
    pub fn load(
        snapshots: GraphSnapshots,
        name: impl Into<String>,
        replica: ReplicaId,
        kinds: Arc<KindRegistry>,
        flows: FlowBus,
    ) -> std::result::Result<Self, PersistError> {
        let name = name.into();
        let state = snapshots.load(&name)?.unwrap_or_default();
        tracing::info!(
            graph = %name,
            nodes = state.nodes.len(),
            edges = state.edges.len(),
            "loaded graph snapshot"
        );
        Ok(Self {
            store: RwLock::new(GraphStore::from_state(replica, state, kinds)),
            flows,
            snapshots: Some((snapshots, name)),
            persist_lock: Mutex::new(()),
        })
    }

    pub fn flows(&self) -> &FlowBus {
        &self.flows
    }

    /// Run a read-only closure against the store.
    pub fn read<R>(&self, f: impl FnOnce(&GraphStore) -> R) -> R {
        f(&*self.store.read())
    }

    pub fn node(&self, id: &NodeId) -> Option<Node> {
        self.store.read().node(id).cloned()
    }

    pub fn snapshot(&self, id: &NodeId) -> Option<NodeSnapshot> {
        self.store.read().snapshot(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.store.read().contains(id)
    }

    /// Clone of the raw replicated state (for shipping to a peer).
    pub fn state(&self) -> GraphState {
        self.store.read().state().clone()
    }

    // =========================================================================
    // Writes
    // =========================================================================

    pub fn add_node(&self, node: Node) -> Result<Stamp> {
        let id = node.id;
        let (stamp, snapshot) = {
            let mut store = self.store.write();
            let stamp = store.add_node(node)?;
            (stamp, store.snapshot(&id))
        };
        self.publish_node(snapshot, OpSource::Local);
        self.persist_quietly();
        Ok(stamp)
    }

    pub fn add_edge(&self, edge: Edge) -> Result<Stamp> {
        let stamp = self.store.write().add_edge(edge.clone())?;
        self.flows.publish(GraphFlow::EdgeChanged {
            edge: Edge { stamp, ..edge },
            source: OpSource::Local,
        });
        self.persist_quietly();
        Ok(stamp)
    }

    pub fn update_node(&self, id: &NodeId, patch: &NodePatch) -> Result<Stamp> {
        let stamp = self.stream_update(id, patch)?;
        self.persist_quietly();
        Ok(stamp)
    }

    /// [`update_node`](Self::update_node) without the snapshot.
    pub(crate) fn stream_update(&self, id: &NodeId, patch: &NodePatch) -> Result<Stamp> {
        let (stamp, snapshot) = {
            let mut store = self.store.write();
            let stamp = store.update_node(id, patch)?;
            (stamp, store.snapshot(id))
        };
        self.publish_node(snapshot, OpSource::Local);
        Ok(stamp)
    }

    pub fn remove_node(&self, id: &NodeId) -> Result<Vec<EdgeId>> {
        let edges = self.store.write().remove_node(id)?;
        self.flows.publish(GraphFlow::NodeRemoved {
            node_id: *id,
            edges: edges.clone(),
            source: OpSource::Local,
        });
        self.persist_quietly();
        Ok(edges)
    }

    pub fn remove_edge(&self, id: &EdgeId) -> Result<()> {
        self.store.write().remove_edge(id)?;
        self.flows.publish(GraphFlow::EdgeRemoved {
            edge_id: *id,
            source: OpSource::Local,
        });
        self.persist_quietly();
        Ok(())
    }

    /// Merge remote state and announce what became visible or went away.
    pub fn merge(&self, remote: &GraphState) -> MergeReport {
        let (report, changed, removed, edges_in, edges_out) = {
            let mut store = self.store.write();
            let report = store.merge(remote);
            let mut changed = Vec::new();
            let mut removed = Vec::new();
            for id in &report.touched_nodes {
                match store.snapshot(id) {
                    Some(snapshot) => changed.push(snapshot),
                    None => removed.push(*id),
                }
            }
            let mut edges_in = Vec::new();
            let mut edges_out = Vec::new();
            for id in &report.touched_edges {
                match store.edge(id) {
                    Some(edge) => edges_in.push(edge.clone()),
                    None => edges_out.push(*id),
                }
            }
            (report, changed, removed, edges_in, edges_out)
        };

        for node in changed {
            self.flows.publish(GraphFlow::NodeChanged {
                node,
                source: OpSource::Remote,
            });
        }
        for node_id in removed {
            self.flows.publish(GraphFlow::NodeRemoved {
                node_id,
                edges: Vec::new(),
                source: OpSource::Remote,
            });
        }
        for edge in edges_in {
            self.flows.publish(GraphFlow::EdgeChanged {
                edge,
                source: OpSource::Remote,
            });
        }
        for edge_id in edges_out {
            self.flows.publish(GraphFlow::EdgeRemoved {
                edge_id,
                source: OpSource::Remote,
            });
        }
        if !report.is_empty() {
            self.flows.publish(GraphFlow::Merged {
                report: report.clone(),
            });
            self.persist_quietly();
        }
        report
    }

    pub fn compact_tombstones(&self, before_revision: u64) -> usize {
        let dropped = self.store.write().compact_tombstones(before_revision);
        if dropped > 0 {
            self.persist_quietly();
        }
        dropped
    }

    /// Announce a session phase change.
    pub fn publish_session(&self, node_id: NodeId, phase: SessionPhase, resumable: bool) {
        self.flows.publish(GraphFlow::SessionChanged {
            node_id,
            phase,
            resumable,
        });
    }

    /// Write the current state to the configured snapshot, if any.
    pub fn persist(&self) -> std::result::Result<(), PersistError> {
        if let Some((snapshots, name)) = &self.snapshots {
            let _saving = self.persist_lock.lock();
            let state = self.state();
            snapshots.save(name, &state)?;
            tracing::debug!(graph = %name, "persisted graph snapshot");
        }
        Ok(())
    }

    /// The write already happened in memory; a failed snapshot is retried
    /// by the next one.
    fn persist_quietly(&self) {
        if let Err(e) = self.persist() {
            tracing::warn!(error = %e, "failed to persist graph snapshot");
        }
    }

    fn publish_node(&self, snapshot: Option<NodeSnapshot>, source: OpSource) {
        if let Some(node) = snapshot {
            self.flows.publish(GraphFlow::NodeChanged { node, source });
        }
    }
}

impl std::fmt::Debug for SharedGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedGraph")
            .field("persisted_as", &self.snapshots.as_ref().map(|(_, n)| n))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::{MemoryKv, SharedKv};
    use tessera_crdt::{NodeKind, NodeStatus};

    fn graph() -> SharedGraph {
        SharedGraph::new(GraphStore::new(ReplicaId::new()), FlowBus::new(64))
    }

    #[test]
    fn test_writes_publish_flows() {
        let graph = graph();
        let mut nodes = graph.flows().subscribe("node.*");
        let mut edges = graph.flows().subscribe("edge.*");

        let a = Node::new(NodeKind::HumanInput).content("q");
        let b = Node::new(NodeKind::AssistantOutput);
        let (a_id, b_id) = (a.id, b.id);
        graph.add_node(a).unwrap();
        graph.add_node(b).unwrap();
        graph.add_edge(Edge::reply(a_id, b_id)).unwrap();
        graph
            .update_node(&b_id, &NodePatch::new().append("hi").status(NodeStatus::Streaming))
            .unwrap();

        assert_eq!(nodes.try_recv().unwrap().payload.node_id(), Some(a_id));
        assert_eq!(nodes.try_recv().unwrap().payload.node_id(), Some(b_id));
        match nodes.try_recv().unwrap().payload {
            GraphFlow::NodeChanged { node, source } => {
                assert_eq!(node.node.content, "hi");
                assert_eq!(node.parent_refs.len(), 1);
                assert_eq!(source, OpSource::Local);
            }
            other => panic!("unexpected flow: {other:?}"),
        }
        assert!(matches!(
            edges.try_recv().unwrap().payload,
            GraphFlow::EdgeChanged { .. }
        ));

        let removed = graph.remove_node(&a_id).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(nodes.try_recv().unwrap().subject, "node.removed");
    }

    #[test]
    fn test_merge_publishes_remote_changes() {
        let local = graph();
        let remote = graph();
        let node = Node::new(NodeKind::Note).content("from remote");
        let id = node.id;
        remote.add_node(node).unwrap();

        let mut all = local.flows().subscribe(">");
        let report = local.merge(&remote.state());
        assert_eq!(report.nodes_added, 1);

        let first = all.try_recv().unwrap();
        assert_eq!(first.payload.node_id(), Some(id));
        assert!(first.payload.is_remote());
        assert_eq!(all.try_recv().unwrap().subject, "graph.merged");

        // Nothing new the second time.
        local.merge(&remote.state());
        assert!(all.try_recv().is_none());
    }

    #[test]
    fn test_persist_and_reload() {
        let kv: SharedKv = Arc::new(MemoryKv::new());
        let replica = ReplicaId::new();
        let kinds = Arc::new(KindRegistry::new());

        let graph = SharedGraph::load(
            GraphSnapshots::new(kv.clone()),
            DEFAULT_GRAPH,
            replica,
            kinds.clone(),
            FlowBus::new(8),
        )
        .unwrap();
        let node = Node::new(NodeKind::Note).content("kept");
        let id = node.id;
        graph.add_node(node).unwrap();
        graph.persist().unwrap();

        let reloaded = SharedGraph::load(
            GraphSnapshots::new(kv),
            DEFAULT_GRAPH,
            replica,
            kinds,
            FlowBus::new(8),
        )
        .unwrap();
        assert_eq!(reloaded.node(&id).unwrap().content, "kept");
        assert!(reloaded.read(|s| s.revision()) >= 1);
    }

    #[test]
    fn test_writes_persist_without_explicit_call() {
        let kv: SharedKv = Arc::new(MemoryKv::new());
        let kinds = Arc::new(KindRegistry::new());
        let load = || {
            SharedGraph::load(
                GraphSnapshots::new(kv.clone()),
                DEFAULT_GRAPH,
                ReplicaId::new(),
                kinds.clone(),
                FlowBus::new(8),
            )
            .unwrap()
        };

        let graph = load();
        let a = Node::new(NodeKind::HumanInput).content("q");
        let b = Node::new(NodeKind::Note);
        let c = Node::new(NodeKind::Note);
        let (a_id, b_id, c_id) = (a.id, b.id, c.id);
        graph.add_node(a).unwrap();
        graph.add_node(b).unwrap();
        graph.add_node(c).unwrap();
        let edge = Edge::reply(a_id, b_id);
        let edge_id = edge.id;
        graph.add_edge(edge).unwrap();
        graph
            .update_node(&b_id, &NodePatch::new().append("answer"))
            .unwrap();
        graph.remove_node(&c_id).unwrap();
        drop(graph);

        let reloaded = load();
        assert_eq!(reloaded.node(&a_id).unwrap().content, "q");
        assert_eq!(reloaded.node(&b_id).unwrap().content, "answer");
        assert!(reloaded.read(|s| s.edge(&edge_id).is_some()));
        assert!(!reloaded.contains(&c_id));
        assert!(reloaded.read(|s| s.is_deleted(&c_id)));
    }

    #[test]
    fn test_stream_update_defers_snapshot() {
        let kv: SharedKv = Arc::new(MemoryKv::new());
        let graph = SharedGraph::load(
            GraphSnapshots::new(kv.clone()),
            DEFAULT_GRAPH,
            ReplicaId::new(),
            Arc::new(KindRegistry::new()),
            FlowBus::new(8),
        )
        .unwrap();
        let node = Node::new(NodeKind::Note);
        let id = node.id;
        graph.add_node(node).unwrap();
        graph
            .stream_update(&id, &NodePatch::new().append("delta"))
            .unwrap();

        let saved = GraphSnapshots::new(kv.clone())
            .load(DEFAULT_GRAPH)
            .unwrap()
            .unwrap();
        assert!(saved.is_node_live(&id));
        let stored = GraphStore::from_state(ReplicaId::new(), saved, Arc::new(KindRegistry::new()));
        assert_eq!(stored.node(&id).unwrap().content, "");

        graph.persist().unwrap();
        let saved = GraphSnapshots::new(kv).load(DEFAULT_GRAPH).unwrap().unwrap();
        let stored = GraphStore::from_state(ReplicaId::new(), saved, Arc::new(KindRegistry::new()));
        assert_eq!(stored.node(&id).unwrap().content, "delta");
    }
}
