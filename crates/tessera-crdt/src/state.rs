//! Replicated state: two last-writer-wins maps with tombstones.
//!
//! `GraphState` is both the in-memory source of truth and the wire/snapshot
//! form exchanged between tabs. Joining two states takes the entry with the
//! greater [`Stamp`] per key, which is commutative, idempotent, and
//! associative.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tessera_types::{Edge, EdgeId, Node, NodeId, Stamp};

/// Anything carrying the stamp of its last write.
pub trait Stamped {
    fn stamp(&self) -> Stamp;
}

impl Stamped for Node {
    fn stamp(&self) -> Stamp {
        self.stamp
    }
}

impl Stamped for Edge {
    fn stamp(&self) -> Stamp {
        self.stamp
    }
}

/// A slot in an LWW map: the live value or a deletion marker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "lowercase")]
pub enum Entry<T> {
    Live(T),
    Tombstone(Stamp),
}

impl<T: Stamped> Entry<T> {
    pub fn stamp(&self) -> Stamp {
        match self {
            Entry::Live(value) => value.stamp(),
            Entry::Tombstone(stamp) => *stamp,
        }
    }

    pub fn live(&self) -> Option<&T> {
        match self {
            Entry::Live(value) => Some(value),
            Entry::Tombstone(_) => None,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Entry::Live(_))
    }

    /// Whether `incoming` should replace `self` under last-writer-wins.
    ///
    /// Equal stamps only arise from the same write seen twice; a tombstone
    /// wins that tie so a replayed delete never loses to its own target.
    pub fn loses_to(&self, incoming: &Entry<T>) -> bool {
        let (ours, theirs) = (self.stamp(), incoming.stamp());
        theirs > ours || (theirs == ours && self.is_live() && !incoming.is_live())
    }
}

/// Counts of what a merge changed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    pub nodes_added: usize,
    pub nodes_updated: usize,
    pub nodes_removed: usize,
    pub edges_added: usize,
    pub edges_removed: usize,
    /// Tombstones learned for entities this replica never saw live.
    pub tombstones_recorded: usize,
    /// Remote entries that lost to newer local writes.
    pub stale_ignored: usize,
    /// Live edges kept out of the admitted graph because they close a cycle.
    pub suppressed_edges: Vec<EdgeId>,
    /// Nodes whose visible state changed (for change notification).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub touched_nodes: Vec<NodeId>,
    /// Edges whose visible state changed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub touched_edges: Vec<EdgeId>,
}

impl MergeReport {
    /// True when the merge left local state untouched.
    pub fn is_empty(&self) -> bool {
        self.nodes_added == 0
            && self.nodes_updated == 0
            && self.nodes_removed == 0
            && self.edges_added == 0
            && self.edges_removed == 0
            && self.tombstones_recorded == 0
    }
}

/// The full replicated graph.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphState {
    #[serde(default)]
    pub nodes: BTreeMap<NodeId, Entry<Node>>,
    #[serde(default)]
    pub edges: BTreeMap<EdgeId, Entry<Edge>>,
}

impl GraphState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest revision of any entry (live or tombstone).
    pub fn max_revision(&self) -> u64 {
        let nodes = self.nodes.values().map(|e| e.stamp().revision);
        let edges = self.edges.values().map(|e| e.stamp().revision);
        nodes.chain(edges).max().unwrap_or(0)
    }

    pub fn live_node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id).and_then(Entry::live)
    }

    pub fn live_edge(&self, id: &EdgeId) -> Option<&Edge> {
        self.edges.get(id).and_then(Entry::live)
    }

    pub fn is_node_live(&self, id: &NodeId) -> bool {
        self.live_node(id).is_some()
    }

    pub fn tombstone_count(&self) -> usize {
        let nodes = self.nodes.values().filter(|e| !e.is_live()).count();
        let edges = self.edges.values().filter(|e| !e.is_live()).count();
        nodes + edges
    }

    /// Join `remote` into `self`, returning what changed.
    ///
    /// `suppressed_edges` is left empty; the store fills it after reindexing.
    pub fn join(&mut self, remote: &GraphState) -> MergeReport {
        let mut report = MergeReport::default();

        for (id, incoming) in &remote.nodes {
            match self.nodes.get(id) {
                None => {
                    match incoming {
                        Entry::Live(_) => {
                            report.nodes_added += 1;
                            report.touched_nodes.push(*id);
                        }
                        Entry::Tombstone(_) => report.tombstones_recorded += 1,
                    }
                    self.nodes.insert(*id, incoming.clone());
                }
                Some(current) if current.loses_to(incoming) => {
                    match (current.is_live(), incoming.is_live()) {
                        (true, true) => report.nodes_updated += 1,
                        (false, true) => report.nodes_added += 1,
                        (true, false) => report.nodes_removed += 1,
                        (false, false) => report.tombstones_recorded += 1,
                    }
                    if current.is_live() || incoming.is_live() {
                        report.touched_nodes.push(*id);
                    }
                    self.nodes.insert(*id, incoming.clone());
                }
                Some(current) => {
                    if current != incoming {
                        report.stale_ignored += 1;
                    }
                }
            }
        }

        for (id, incoming) in &remote.edges {
            match self.edges.get(id) {
                None => {
                    match incoming {
                        Entry::Live(_) => {
                            report.edges_added += 1;
                            report.touched_edges.push(*id);
                        }
                        Entry::Tombstone(_) => report.tombstones_recorded += 1,
                    }
                    self.edges.insert(*id, incoming.clone());
                }
                Some(current) if current.loses_to(incoming) => {
                    match (current.is_live(), incoming.is_live()) {
                        (false, true) => report.edges_added += 1,
                        (true, false) => report.edges_removed += 1,
                        (false, false) => report.tombstones_recorded += 1,
                        // Edges are immutable; a newer live copy is a re-stamp.
                        (true, true) => {}
                    }
                    report.touched_edges.push(*id);
                    self.edges.insert(*id, incoming.clone());
                }
                Some(current) => {
                    if current != incoming {
                        report.stale_ignored += 1;
                    }
                }
            }
        }

        report
    }

    /// Drop tombstones older than `before_revision`.
    ///
    /// Only safe once every replica has seen the deletions; that policy lives
    /// outside the core.
    pub fn compact_tombstones(&mut self, before_revision: u64) -> usize {
        let before = self.tombstone_count();
        self.nodes
            .retain(|_, e| e.is_live() || e.stamp().revision >= before_revision);
        self.edges
            .retain(|_, e| e.is_live() || e.stamp().revision >= before_revision);
        before - self.tombstone_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_types::{NodeKind, ReplicaId};

    fn node_at(id: NodeId, revision: u64, replica: ReplicaId, content: &str) -> Node {
        Node::with_id(id, NodeKind::Note)
            .content(content)
            .stamped(Stamp::new(revision, replica))
    }

    #[test]
    fn test_newer_stamp_wins() {
        let r = ReplicaId::new();
        let id = NodeId::new();
        let old = Entry::Live(node_at(id, 1, r, "old"));
        let new = Entry::Live(node_at(id, 2, r, "new"));
        assert!(old.loses_to(&new));
        assert!(!new.loses_to(&old));
    }

    #[test]
    fn test_tombstone_wins_equal_stamp() {
        let r = ReplicaId::new();
        let id = NodeId::new();
        let live = Entry::Live(node_at(id, 3, r, "x"));
        let dead: Entry<Node> = Entry::Tombstone(Stamp::new(3, r));
        assert!(live.loses_to(&dead));
        assert!(!dead.loses_to(&live));
    }

    #[test]
    fn test_join_counts_changes() {
        let r = ReplicaId::new();
        let (a, b) = (NodeId::new(), NodeId::new());

        let mut local = GraphState::new();
        local.nodes.insert(a, Entry::Live(node_at(a, 1, r, "a1")));

        let mut remote = GraphState::new();
        remote.nodes.insert(a, Entry::Live(node_at(a, 4, r, "a4")));
        remote.nodes.insert(b, Entry::Live(node_at(b, 2, r, "b2")));

        let report = local.join(&remote);
        assert_eq!(report.nodes_updated, 1);
        assert_eq!(report.nodes_added, 1);
        assert_eq!(local.live_node(&a).unwrap().content, "a4");

        let again = local.join(&remote);
        assert!(again.is_empty());
        assert_eq!(again.stale_ignored, 0);
    }

    #[test]
    fn test_compact_tombstones() {
        let r = ReplicaId::new();
        let mut state = GraphState::new();
        state.nodes.insert(NodeId::new(), Entry::Tombstone(Stamp::new(2, r)));
        state.nodes.insert(NodeId::new(), Entry::Tombstone(Stamp::new(9, r)));
        assert_eq!(state.compact_tombstones(5), 1);
        assert_eq!(state.tombstone_count(), 1);
    }

    #[test]
    fn test_state_json_roundtrip() {
        let r = ReplicaId::new();
        let id = NodeId::new();
        let mut state = GraphState::new();
        state.nodes.insert(id, Entry::Live(node_at(id, 1, r, "hello")));
        state.edges.insert(EdgeId::new(), Entry::Tombstone(Stamp::new(2, r)));

        let json = serde_json::to_string(&state).unwrap();
        let back: GraphState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
