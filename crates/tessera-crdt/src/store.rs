//! The replicated graph store.
//!
//! One `GraphStore` per replica. Local writes stamp themselves from the
//! replica's Lamport clock; remote state arrives through [`GraphStore::merge`].
//! Readers only ever see the admitted view (see [`DagIndex`]), which is
//! acyclic by construction.

use std::sync::Arc;

use tessera_types::{
    Edge, EdgeId, LamportClock, Node, NodeId, NodePatch, NodeSnapshot, ReplicaId, Stamp,
};

use crate::dag::DagIndex;
use crate::registry::KindRegistry;
use crate::state::{Entry, GraphState, MergeReport};
use crate::{GraphError, Result};

/// CRDT-backed node/edge store for one replica.
#[derive(Debug)]
pub struct GraphStore {
    clock: LamportClock,
    state: GraphState,
    index: DagIndex,
    kinds: Arc<KindRegistry>,
}

impl GraphStore {
    /// Empty store for `replica` with no custom kinds.
    pub fn new(replica: ReplicaId) -> Self {
        Self::with_kinds(replica, Arc::new(KindRegistry::new()))
    }

    pub fn with_kinds(replica: ReplicaId, kinds: Arc<KindRegistry>) -> Self {
        Self {
            clock: LamportClock::new(replica),
            state: GraphState::new(),
            index: DagIndex::default(),
            kinds,
        }
    }

    /// Rehydrate from a snapshot. The clock resumes past every stored revision.
    pub fn from_state(replica: ReplicaId, state: GraphState, kinds: Arc<KindRegistry>) -> Self {
        let clock = LamportClock::starting_at(replica, state.max_revision());
        let index = DagIndex::build(&state);
        Self {
            clock,
            state,
            index,
            kinds,
        }
    }

    pub fn replica(&self) -> ReplicaId {
        self.clock.replica()
    }

    /// Current logical time of this replica.
    pub fn revision(&self) -> u64 {
        self.clock.current()
    }

    /// The raw replicated state (what gets persisted and shipped to peers).
    pub fn state(&self) -> &GraphState {
        &self.state
    }

    pub fn dag(&self) -> &DagIndex {
        &self.index
    }

    pub fn kinds(&self) -> &KindRegistry {
        &self.kinds
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Insert a node.
    ///
    /// An unstamped node (`Stamp::zero()`) is a creation: it gets a fresh
    /// stamp, fails with `DuplicateId` if the id is already live and with
    /// `Deleted` if the id was removed. Removed ids stay dead. A stamped
    /// node follows the merge rule: it overwrites an older entry, is a no-op
    /// against an identical one, and fails with `DuplicateId` / `Deleted`
    /// against a newer live entry / tombstone.
    pub fn add_node(&mut self, mut node: Node) -> Result<Stamp> {
        if !self.kinds.allows(&node.kind) {
            return Err(GraphError::UnknownKind(node.kind.to_string()));
        }

        let existing = self.state.nodes.get(&node.id);
        if node.stamp == Stamp::zero() {
            match existing {
                Some(Entry::Live(current)) => {
                    return Err(GraphError::DuplicateId {
                        id: node.id.to_string(),
                        existing: current.stamp,
                    });
                }
                Some(Entry::Tombstone(tombstone)) => {
                    return Err(GraphError::Deleted {
                        id: node.id.to_string(),
                        tombstone: *tombstone,
                    });
                }
                None => {}
            }
            node.stamp = self.clock.tick();
        } else {
            self.clock.observe(node.stamp.revision);
            match existing {
                Some(Entry::Tombstone(tombstone)) if *tombstone >= node.stamp => {
                    return Err(GraphError::Deleted {
                        id: node.id.to_string(),
                        tombstone: *tombstone,
                    });
                }
                Some(Entry::Live(current)) if current.stamp > node.stamp => {
                    return Err(GraphError::DuplicateId {
                        id: node.id.to_string(),
                        existing: current.stamp,
                    });
                }
                Some(Entry::Live(current)) if current.stamp == node.stamp => {
                    return Ok(node.stamp);
                }
                _ => {}
            }
        }

        let stamp = node.stamp;
        let was_live = self.state.is_node_live(&node.id);
        tracing::debug!(node = %node.id, kind = %node.kind, %stamp, "add_node");
        self.state.nodes.insert(node.id, Entry::Live(node));
        if !was_live {
            // Edges that arrived before this node may now be admissible.
            self.reindex();
        }
        Ok(stamp)
    }

    /// Insert an edge, rejecting anything that would close a cycle.
    ///
    /// On `Cycle` the graph is left unchanged.
    pub fn add_edge(&mut self, mut edge: Edge) -> Result<Stamp> {
        for endpoint in [edge.source, edge.target] {
            if !self.state.is_node_live(&endpoint) {
                return Err(GraphError::NotFound(endpoint));
            }
        }

        match self.state.edges.get(&edge.id) {
            Some(Entry::Tombstone(tombstone))
                if edge.stamp == Stamp::zero() || *tombstone >= edge.stamp =>
            {
                return Err(GraphError::Deleted {
                    id: edge.id.to_string(),
                    tombstone: *tombstone,
                });
            }
            Some(Entry::Live(current)) if edge.stamp == Stamp::zero() || current.stamp > edge.stamp => {
                return Err(GraphError::DuplicateId {
                    id: edge.id.to_string(),
                    existing: current.stamp,
                });
            }
            Some(Entry::Live(current)) if current.stamp == edge.stamp => return Ok(edge.stamp),
            _ => {}
        }

        if self.index.would_cycle(&edge.source, &edge.target) {
            return Err(GraphError::Cycle {
                edge: edge.id,
                from: edge.source,
                to: edge.target,
            });
        }

        if edge.stamp == Stamp::zero() {
            edge.stamp = self.clock.tick();
        } else {
            self.clock.observe(edge.stamp.revision);
        }

        let stamp = edge.stamp;
        tracing::debug!(edge = %edge.id, source = %edge.source, target = %edge.target, %stamp, "add_edge");
        let replaced = self.state.edges.insert(edge.id, Entry::Live(edge.clone())).is_some();
        if replaced || !self.index.admit(&edge) {
            self.reindex();
        }
        Ok(stamp)
    }

    /// Apply a partial update as a new stamped write.
    pub fn update_node(&mut self, id: &NodeId, patch: &NodePatch) -> Result<Stamp> {
        let current = self
            .state
            .live_node(id)
            .ok_or(GraphError::NotFound(*id))?;

        if let Some(to) = patch.status
            && !current.status.can_transition(to, patch.resume)
        {
            return Err(GraphError::InvalidTransition {
                node: *id,
                from: current.status,
                to,
            });
        }
        if patch.is_empty() {
            return Ok(current.stamp);
        }

        let mut node = current.clone();
        patch.apply_to(&mut node);
        node.stamp = self.clock.tick_above(current.stamp.revision);

        let stamp = node.stamp;
        self.state.nodes.insert(*id, Entry::Live(node));
        Ok(stamp)
    }

    /// Tombstone a node and every edge touching it.
    ///
    /// Descendants stay; they simply lose the edge. Returns the removed edges.
    pub fn remove_node(&mut self, id: &NodeId) -> Result<Vec<EdgeId>> {
        let current = self
            .state
            .live_node(id)
            .ok_or(GraphError::NotFound(*id))?;
        let tombstone = self.clock.tick_above(current.stamp.revision);
        self.state.nodes.insert(*id, Entry::Tombstone(tombstone));

        let touching: Vec<(EdgeId, Stamp)> = self
            .state
            .edges
            .values()
            .filter_map(|e| e.live())
            .filter(|e| e.touches(id))
            .map(|e| (e.id, e.stamp))
            .collect();
        let mut removed = Vec::with_capacity(touching.len());
        for (edge_id, stamp) in touching {
            let tombstone = self.clock.tick_above(stamp.revision);
            self.state.edges.insert(edge_id, Entry::Tombstone(tombstone));
            removed.push(edge_id);
        }

        tracing::debug!(node = %id, edges = removed.len(), %tombstone, "remove_node");
        self.reindex();
        Ok(removed)
    }

    /// Tombstone one edge.
    pub fn remove_edge(&mut self, id: &EdgeId) -> Result<()> {
        let current = self
            .state
            .live_edge(id)
            .ok_or(GraphError::EdgeNotFound(*id))?;
        let tombstone = self.clock.tick_above(current.stamp.revision);
        self.state.edges.insert(*id, Entry::Tombstone(tombstone));
        self.reindex();
        Ok(())
    }

    /// Join remote state into this replica.
    ///
    /// Never fails: conflicts resolve by last-writer-wins on stamps, and
    /// live edges that would close a cycle are kept out of the admitted view
    /// and listed in the report.
    pub fn merge(&mut self, remote: &GraphState) -> MergeReport {
        self.clock.observe(remote.max_revision());
        let mut report = self.state.join(remote);
        self.reindex();
        report.suppressed_edges = self.index.suppressed().to_vec();
        tracing::info!(
            nodes_added = report.nodes_added,
            nodes_updated = report.nodes_updated,
            nodes_removed = report.nodes_removed,
            edges_added = report.edges_added,
            edges_removed = report.edges_removed,
            suppressed = report.suppressed_edges.len(),
            "merged remote graph state"
        );
        report
    }

    /// Drop tombstones older than `before_revision` (external retention policy).
    pub fn compact_tombstones(&mut self, before_revision: u64) -> usize {
        self.state.compact_tombstones(before_revision)
    }

    fn reindex(&mut self) {
        self.index = DagIndex::build(&self.state);
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.state.live_node(id)
    }

    /// Whether an admitted edge with this id exists.
    pub fn edge(&self, id: &EdgeId) -> Option<&Edge> {
        self.state
            .live_edge(id)
            .filter(|_| self.index.is_admitted(id))
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.state.is_node_live(id)
    }

    pub fn is_deleted(&self, id: &NodeId) -> bool {
        matches!(self.state.nodes.get(id), Some(Entry::Tombstone(_)))
    }

    /// Read view of one node with its derived parent refs.
    pub fn snapshot(&self, id: &NodeId) -> Option<NodeSnapshot> {
        self.node(id).map(|node| NodeSnapshot {
            node: node.clone(),
            parent_refs: self.index.incoming(id),
        })
    }

    /// Live nodes in creation order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.state.nodes.values().filter_map(Entry::live)
    }

    /// Read views of every live node, in creation order.
    pub fn snapshots(&self) -> Vec<NodeSnapshot> {
        self.nodes()
            .map(|node| NodeSnapshot {
                node: node.clone(),
                parent_refs: self.index.incoming(&node.id),
            })
            .collect()
    }

    /// Admitted edges.
    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.state
            .edges
            .values()
            .filter_map(Entry::live)
            .filter(|e| self.index.is_admitted(&e.id))
    }

    pub fn node_count(&self) -> usize {
        self.nodes().count()
    }

    pub fn edge_count(&self) -> usize {
        self.index.admitted_count()
    }

    /// Nodes with no admitted incoming edge, in creation order.
    pub fn roots(&self) -> Vec<NodeId> {
        self.nodes()
            .map(|n| n.id)
            .filter(|id| !self.index.has_parents(id))
            .collect()
    }

    pub fn children(&self, id: &NodeId) -> Vec<NodeId> {
        self.index.children(id)
    }

    pub fn parents(&self, id: &NodeId) -> Vec<NodeId> {
        self.index.parents(id)
    }

    /// Whole graph in depth-first order from the roots.
    pub fn iter_dfs(&self) -> Vec<(usize, NodeId)> {
        self.index.dfs(&self.roots())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_types::{EdgeKind, NodeKind, NodeStatus};

    fn store() -> GraphStore {
        GraphStore::new(ReplicaId::new())
    }

    fn add(store: &mut GraphStore, kind: NodeKind) -> NodeId {
        let node = Node::new(kind);
        let id = node.id;
        store.add_node(node).unwrap();
        id
    }

    #[test]
    fn test_add_and_read() {
        let mut s = store();
        let a = add(&mut s, NodeKind::HumanInput);
        let b = add(&mut s, NodeKind::AssistantOutput);
        let e = Edge::reply(a, b);
        let eid = e.id;
        s.add_edge(e).unwrap();

        assert_eq!(s.roots(), vec![a]);
        assert_eq!(s.children(&a), vec![b]);
        assert_eq!(s.snapshot(&b).unwrap().parent_refs, vec![eid]);
        assert_eq!(s.edge_count(), 1);
    }

    #[test]
    fn test_unstamped_duplicate_rejected() {
        let mut s = store();
        let node = Node::new(NodeKind::Note);
        s.add_node(node.clone()).unwrap();
        assert!(matches!(s.add_node(node), Err(GraphError::DuplicateId { .. })));
    }

    #[test]
    fn test_stamped_add_follows_merge_rule() {
        let mut s = store();
        let r = ReplicaId::new();
        let id = NodeId::new();

        let v6 = Node::with_id(id, NodeKind::Note).content("six").stamped(Stamp::new(6, r));
        let v5 = Node::with_id(id, NodeKind::Note).content("five").stamped(Stamp::new(5, r));

        s.add_node(v6.clone()).unwrap();
        assert!(matches!(s.add_node(v5), Err(GraphError::DuplicateId { .. })));
        assert_eq!(s.add_node(v6).unwrap(), Stamp::new(6, r));
        assert_eq!(s.node(&id).unwrap().content, "six");
        assert!(s.revision() >= 6);
    }

    #[test]
    fn test_unknown_custom_kind_rejected() {
        let mut s = store();
        let err = s.add_node(Node::new(NodeKind::Custom("matrix".into()))).unwrap_err();
        assert_eq!(err, GraphError::UnknownKind("matrix".into()));

        let kinds = Arc::new(KindRegistry::new().with("matrix").unwrap());
        let mut s = GraphStore::with_kinds(ReplicaId::new(), kinds);
        assert!(s.add_node(Node::new(NodeKind::Custom("matrix".into()))).is_ok());
    }

    #[test]
    fn test_cycle_rejected_and_graph_unchanged() {
        let mut s = store();
        let ids: Vec<NodeId> = (0..5).map(|_| add(&mut s, NodeKind::Note)).collect();
        for w in ids.windows(2) {
            s.add_edge(Edge::new(w[0], w[1], EdgeKind::BranchFrom)).unwrap();
        }
        let before = s.state().clone();

        let err = s.add_edge(Edge::reply(ids[4], ids[0])).unwrap_err();
        assert!(matches!(err, GraphError::Cycle { .. }));
        assert_eq!(s.state(), &before);

        assert!(matches!(
            s.add_edge(Edge::reply(ids[2], ids[2])),
            Err(GraphError::Cycle { .. })
        ));
    }

    #[test]
    fn test_edge_needs_live_endpoints() {
        let mut s = store();
        let a = add(&mut s, NodeKind::Note);
        let ghost = NodeId::new();
        assert_eq!(
            s.add_edge(Edge::reply(a, ghost)).unwrap_err(),
            GraphError::NotFound(ghost)
        );
    }

    #[test]
    fn test_update_bumps_revision_and_appends() {
        let mut s = store();
        let id = add(&mut s, NodeKind::AssistantOutput);
        let r0 = s.node(&id).unwrap().revision();

        s.update_node(&id, &NodePatch::new().status(NodeStatus::Streaming)).unwrap();
        s.update_node(&id, &NodePatch::new().append("AB")).unwrap();
        s.update_node(&id, &NodePatch::new().append("CD")).unwrap();

        let node = s.node(&id).unwrap();
        assert_eq!(node.content, "ABCD");
        assert!(node.revision() > r0 + 2);
    }

    #[test]
    fn test_update_rejects_illegal_transition() {
        let mut s = store();
        let id = add(&mut s, NodeKind::AssistantOutput);
        s.update_node(&id, &NodePatch::new().status(NodeStatus::Streaming)).unwrap();
        s.update_node(&id, &NodePatch::new().status(NodeStatus::Completed)).unwrap();

        let err = s
            .update_node(&id, &NodePatch::new().status(NodeStatus::Streaming))
            .unwrap_err();
        assert!(matches!(err, GraphError::InvalidTransition { .. }));

        s.update_node(&id, &NodePatch::new().status(NodeStatus::Streaming).resuming())
            .unwrap();
    }

    #[test]
    fn test_update_missing_node() {
        let mut s = store();
        let id = NodeId::new();
        assert_eq!(
            s.update_node(&id, &NodePatch::new().append("x")).unwrap_err(),
            GraphError::NotFound(id)
        );
    }

    #[test]
    fn test_remove_node_keeps_descendants() {
        let mut s = store();
        let a = add(&mut s, NodeKind::HumanInput);
        let b = add(&mut s, NodeKind::AssistantOutput);
        let c = add(&mut s, NodeKind::AssistantOutput);
        s.add_edge(Edge::reply(a, b)).unwrap();
        s.add_edge(Edge::reply(b, c)).unwrap();

        let removed = s.remove_node(&b).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(s.is_deleted(&b));
        assert!(s.contains(&a));
        assert!(s.contains(&c));
        assert_eq!(s.edge_count(), 0);
        assert_eq!(s.roots(), vec![a, c]);
    }

    #[test]
    fn test_stale_add_after_delete_is_rejected() {
        let mut s = store();
        let r = ReplicaId::new();
        let id = NodeId::new();
        s.add_node(Node::with_id(id, NodeKind::Note).stamped(Stamp::new(3, r)))
            .unwrap();
        s.remove_node(&id).unwrap();

        let stale = Node::with_id(id, NodeKind::Note).stamped(Stamp::new(3, r));
        assert!(matches!(s.add_node(stale), Err(GraphError::Deleted { .. })));
        assert!(!s.contains(&id));
    }

    #[test]
    fn test_unstamped_readd_after_delete_is_rejected() {
        let mut s = store();
        let node = Node::new(NodeKind::Note).content("first");
        let id = node.id;
        s.add_node(node.clone()).unwrap();
        s.remove_node(&id).unwrap();
        let revision = s.revision();

        let err = s.add_node(node.content("again")).unwrap_err();
        assert!(matches!(err, GraphError::Deleted { .. }));
        assert!(!s.contains(&id));
        assert!(s.is_deleted(&id));
        assert_eq!(s.revision(), revision);
    }

    #[test]
    fn test_remove_edge_is_tombstoned() {
        let mut s = store();
        let a = add(&mut s, NodeKind::Note);
        let b = add(&mut s, NodeKind::Note);
        let edge = Edge::reply(a, b);
        let eid = edge.id;
        s.add_edge(edge.clone()).unwrap();
        s.remove_edge(&eid).unwrap();

        assert!(s.edge(&eid).is_none());
        assert!(matches!(s.add_edge(edge), Err(GraphError::Deleted { .. })));
        assert_eq!(s.remove_edge(&eid).unwrap_err(), GraphError::EdgeNotFound(eid));
    }

    #[test]
    fn test_from_state_resumes_clock() {
        let mut s = store();
        let id = add(&mut s, NodeKind::Note);
        for _ in 0..5 {
            s.update_node(&id, &NodePatch::new().append(".")).unwrap();
        }
        let max = s.state().max_revision();

        let restored = GraphStore::from_state(ReplicaId::new(), s.state().clone(), Arc::new(KindRegistry::new()));
        assert_eq!(restored.revision(), max);
        assert_eq!(restored.node(&id).unwrap().content, ".....");
    }
}
