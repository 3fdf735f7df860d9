//! Property-based tests for graph merge.
//!
//! Properties:
//! - merge is idempotent: merging the same remote twice changes nothing
//! - merge is commutative: R1 then R2 equals R2 then R1
//! - the admitted graph is acyclic after any interleaving of edits and merges
//! - a deletion is never undone by merging stale state

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use proptest::prelude::*;
use tessera_crdt::{
    Edge, EdgeKind, GraphStore, KindRegistry, Node, NodeId, NodeKind, NodePatch, ReplicaId,
};

const POOL: usize = 6;

#[derive(Debug, Clone)]
enum Op {
    AddNode,
    AddEdge(usize, usize),
    Append(usize, String),
    RemoveNode(usize),
    RemoveEdge(usize),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::AddNode),
        (0..POOL, 0..POOL).prop_map(|(a, b)| Op::AddEdge(a, b)),
        (0..POOL, "[a-z]{1,4}").prop_map(|(i, s)| Op::Append(i, s)),
        (0..POOL).prop_map(Op::RemoveNode),
        (0..16usize).prop_map(Op::RemoveEdge),
    ]
}

fn base() -> (GraphStore, Vec<NodeId>) {
    let mut store = GraphStore::new(ReplicaId::new());
    let ids = (0..POOL)
        .map(|_| {
            let node = Node::new(NodeKind::Note);
            let id = node.id;
            store.add_node(node).unwrap();
            id
        })
        .collect();
    (store, ids)
}

fn fork(store: &GraphStore) -> GraphStore {
    GraphStore::from_state(ReplicaId::new(), store.state().clone(), Arc::new(KindRegistry::new()))
}

/// Apply ops, ignoring rejections (cycles, missing nodes) like a UI would.
fn apply(store: &mut GraphStore, pool: &[NodeId], ops: &[Op]) {
    for op in ops {
        let _ = match op {
            Op::AddNode => store.add_node(Node::new(NodeKind::Note)).map(|_| ()),
            Op::AddEdge(a, b) => store
                .add_edge(Edge::new(pool[*a], pool[*b], EdgeKind::ReplyTo))
                .map(|_| ()),
            Op::Append(i, s) => store.update_node(&pool[*i], &NodePatch::new().append(s)).map(|_| ()),
            Op::RemoveNode(i) => store.remove_node(&pool[*i]).map(|_| ()),
            Op::RemoveEdge(n) => {
                let ids: Vec<_> = store.edges().map(|e| e.id).collect();
                match ids.get(n % ids.len().max(1)) {
                    Some(id) => store.remove_edge(id),
                    None => Ok(()),
                }
            }
        };
    }
}

/// Kahn's algorithm over the admitted view.
fn is_acyclic(store: &GraphStore) -> bool {
    let mut indegree: HashMap<NodeId, usize> = store.nodes().map(|n| (n.id, 0)).collect();
    for edge in store.edges() {
        *indegree.get_mut(&edge.target).expect("admitted edge endpoints are live") += 1;
    }
    let mut queue: VecDeque<NodeId> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut seen = 0;
    while let Some(id) = queue.pop_front() {
        seen += 1;
        for child in store.children(&id) {
            let d = indegree.get_mut(&child).unwrap();
            *d -= 1;
            if *d == 0 {
                queue.push_back(child);
            }
        }
    }
    seen == indegree.len()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn merge_is_idempotent(ops in prop::collection::vec(arb_op(), 0..24)) {
        let (origin, pool) = base();
        let mut local = fork(&origin);
        let mut remote = fork(&origin);
        apply(&mut remote, &pool, &ops);

        local.merge(remote.state());
        let once = local.state().clone();
        let report = local.merge(remote.state());

        prop_assert!(report.is_empty());
        prop_assert_eq!(local.state(), &once);
    }

    #[test]
    fn merge_is_commutative(
        ops1 in prop::collection::vec(arb_op(), 0..24),
        ops2 in prop::collection::vec(arb_op(), 0..24),
    ) {
        let (origin, pool) = base();
        let mut r1 = fork(&origin);
        let mut r2 = fork(&origin);
        apply(&mut r1, &pool, &ops1);
        apply(&mut r2, &pool, &ops2);

        let mut x = fork(&origin);
        x.merge(r1.state());
        x.merge(r2.state());

        let mut y = fork(&origin);
        y.merge(r2.state());
        y.merge(r1.state());

        prop_assert_eq!(x.state(), y.state());
        let xe: Vec<_> = x.edges().map(|e| e.id).collect();
        let ye: Vec<_> = y.edges().map(|e| e.id).collect();
        prop_assert_eq!(xe, ye);
    }

    #[test]
    fn admitted_graph_stays_acyclic(
        ops1 in prop::collection::vec(arb_op(), 0..32),
        ops2 in prop::collection::vec(arb_op(), 0..32),
        ops3 in prop::collection::vec(arb_op(), 0..16),
    ) {
        let (origin, pool) = base();
        let mut r1 = fork(&origin);
        let mut r2 = fork(&origin);
        apply(&mut r1, &pool, &ops1);
        apply(&mut r2, &pool, &ops2);

        r1.merge(r2.state());
        prop_assert!(is_acyclic(&r1));

        // Keep editing on top of the merged view.
        apply(&mut r1, &pool, &ops3);
        prop_assert!(is_acyclic(&r1));

        r2.merge(r1.state());
        prop_assert!(is_acyclic(&r2));
    }

    #[test]
    fn deletions_survive_stale_merges(
        victim in 0..POOL,
        ops in prop::collection::vec(arb_op(), 0..16),
    ) {
        let (origin, pool) = base();
        let mut stale = fork(&origin);
        apply(&mut stale, &pool, &ops);
        prop_assume!(stale.contains(&pool[victim]));

        // Local has seen everything `stale` wrote, then deletes.
        let mut local = fork(&stale);
        local.remove_node(&pool[victim]).unwrap();

        local.merge(stale.state());
        prop_assert!(!local.contains(&pool[victim]));
        local.merge(origin.state());
        prop_assert!(!local.contains(&pool[victim]));
    }
}
