//! Computed DAG index over the admitted edges of a [`GraphState`].
//!
//! Raw replicated state may hold live edges that together close a cycle
//! (two tabs each added one half). The index admits live edges whose
//! endpoints are both live, in stamp order, skipping any edge that would
//! close a cycle. Since admission depends only on the merged state, every
//! replica that has merged the same writes admits the same edges.

use std::collections::{HashMap, HashSet, VecDeque};

use tessera_types::{Edge, EdgeId, NodeId, Stamp};

use crate::state::GraphState;

/// Maximum expected traversal size. Traversal code uses this as a circuit breaker.
///
/// Branching conversations rarely exceed a few hundred nodes on one path;
/// exceeding this likely indicates corruption.
pub const MAX_DAG_DEPTH: usize = 4096;

/// Admitted adjacency for one graph state.
#[derive(Debug, Clone, Default)]
pub struct DagIndex {
    /// Outgoing admitted edges by source, in stamp order.
    children: HashMap<NodeId, Vec<(EdgeId, NodeId)>>,
    /// Incoming admitted edges by target, in stamp order.
    parents: HashMap<NodeId, Vec<(EdgeId, NodeId)>>,
    admitted: HashSet<EdgeId>,
    /// Live edges kept out because they would close a cycle.
    suppressed: Vec<EdgeId>,
    /// Highest stamp admitted so far (incremental admission must stay above it).
    high_water: Stamp,
}

impl DagIndex {
    /// Build the admitted view of `state`.
    pub fn build(state: &GraphState) -> Self {
        let mut candidates: Vec<&Edge> = state
            .edges
            .values()
            .filter_map(|e| e.live())
            .filter(|e| state.is_node_live(&e.source) && state.is_node_live(&e.target))
            .collect();
        candidates.sort_by(|a, b| a.stamp.cmp(&b.stamp).then_with(|| a.id.cmp(&b.id)));

        let mut index = Self::default();
        for edge in candidates {
            if index.would_cycle(&edge.source, &edge.target) {
                tracing::warn!(
                    edge = %edge.id,
                    source = %edge.source,
                    target = %edge.target,
                    "suppressing edge that closes a cycle"
                );
                index.suppressed.push(edge.id);
            } else {
                index.insert(edge);
            }
        }
        index
    }

    /// Whether adding `source -> target` would close a cycle.
    ///
    /// Full reachability: walks every admitted path out of `target` looking
    /// for `source`, because branch/fan-out chains can be arbitrarily deep.
    pub fn would_cycle(&self, source: &NodeId, target: &NodeId) -> bool {
        source == target || self.reaches(target, source)
    }

    /// Whether `to` is reachable from `from` along admitted edges.
    pub fn reaches(&self, from: &NodeId, to: &NodeId) -> bool {
        let mut stack = vec![*from];
        let mut visited = HashSet::new();

        while let Some(id) = stack.pop() {
            if &id == to {
                return true;
            }
            if !visited.insert(id) {
                continue;
            }
            if let Some(children) = self.children.get(&id) {
                stack.extend(children.iter().map(|(_, child)| *child));
            }
        }
        false
    }

    /// Admit a freshly checked edge.
    ///
    /// Returns `false` if the edge is older than what is already admitted,
    /// in which case the caller must rebuild to keep stamp-order admission.
    pub fn admit(&mut self, edge: &Edge) -> bool {
        if edge.stamp < self.high_water {
            return false;
        }
        self.insert(edge);
        true
    }

    fn insert(&mut self, edge: &Edge) {
        self.children
            .entry(edge.source)
            .or_default()
            .push((edge.id, edge.target));
        self.parents
            .entry(edge.target)
            .or_default()
            .push((edge.id, edge.source));
        self.admitted.insert(edge.id);
        self.high_water = self.high_water.max(edge.stamp);
    }

    pub fn is_admitted(&self, id: &EdgeId) -> bool {
        self.admitted.contains(id)
    }

    pub fn admitted_count(&self) -> usize {
        self.admitted.len()
    }

    pub fn suppressed(&self) -> &[EdgeId] {
        &self.suppressed
    }

    /// Direct children, in edge stamp order.
    pub fn children(&self, id: &NodeId) -> Vec<NodeId> {
        self.children
            .get(id)
            .map(|v| v.iter().map(|(_, n)| *n).collect())
            .unwrap_or_default()
    }

    /// Direct parents, in edge stamp order.
    pub fn parents(&self, id: &NodeId) -> Vec<NodeId> {
        self.parents
            .get(id)
            .map(|v| v.iter().map(|(_, n)| *n).collect())
            .unwrap_or_default()
    }

    /// Admitted incoming edge ids, in stamp order.
    pub fn incoming(&self, id: &NodeId) -> Vec<EdgeId> {
        self.parents
            .get(id)
            .map(|v| v.iter().map(|(e, _)| *e).collect())
            .unwrap_or_default()
    }

    /// Admitted outgoing edge ids, in stamp order.
    pub fn outgoing(&self, id: &NodeId) -> Vec<EdgeId> {
        self.children
            .get(id)
            .map(|v| v.iter().map(|(e, _)| *e).collect())
            .unwrap_or_default()
    }

    pub fn has_parents(&self, id: &NodeId) -> bool {
        self.parents.get(id).is_some_and(|v| !v.is_empty())
    }

    /// All nodes reachable from `root` (excluding it), breadth-first.
    ///
    /// Circuit-breaks at `MAX_DAG_DEPTH` visited nodes.
    pub fn descendants(&self, root: &NodeId) -> Vec<NodeId> {
        self.walk(root, &self.children)
    }

    /// All nodes that reach `node` (excluding it), breadth-first.
    ///
    /// Circuit-breaks at `MAX_DAG_DEPTH` visited nodes.
    pub fn ancestors(&self, node: &NodeId) -> Vec<NodeId> {
        self.walk(node, &self.parents)
    }

    fn walk(&self, start: &NodeId, adjacency: &HashMap<NodeId, Vec<(EdgeId, NodeId)>>) -> Vec<NodeId> {
        let mut result = Vec::new();
        let mut visited = HashSet::from([*start]);
        let mut queue = VecDeque::from([*start]);

        while let Some(id) = queue.pop_front() {
            if let Some(next) = adjacency.get(&id) {
                for (_, n) in next {
                    if visited.insert(*n) {
                        if result.len() >= MAX_DAG_DEPTH {
                            tracing::warn!("walk hit MAX_DAG_DEPTH ({MAX_DAG_DEPTH}), truncating");
                            return result;
                        }
                        result.push(*n);
                        queue.push_back(*n);
                    }
                }
            }
        }
        result
    }

    /// Depth-first order from the given roots as `(depth, node)` pairs.
    ///
    /// A node reachable along several paths is visited once, at its first
    /// discovery. Circuit-breaks at `MAX_DAG_DEPTH` visited nodes.
    pub fn dfs(&self, roots: &[NodeId]) -> Vec<(usize, NodeId)> {
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        let mut stack: Vec<(usize, NodeId)> = roots.iter().rev().map(|id| (0, *id)).collect();

        while let Some((depth, id)) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            if visited.len() > MAX_DAG_DEPTH {
                tracing::warn!("dfs hit MAX_DAG_DEPTH ({MAX_DAG_DEPTH}), stopping");
                break;
            }
            out.push((depth, id));
            if let Some(children) = self.children.get(&id) {
                for (_, child) in children.iter().rev() {
                    stack.push((depth + 1, *child));
                }
            }
        }
        out
    }
}
