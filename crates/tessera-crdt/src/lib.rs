//! Replicated conversation graph for Tessera.
//!
//! Nodes and edges live in two last-writer-wins maps keyed by id, with
//! tombstones for deletion. Merging a remote copy (another tab, a reloaded
//! snapshot, an imported file) is a per-entry max by [`Stamp`], so merges
//! compose in any order without a central sequencer.
//!
//! # CRDT Semantics
//!
//! - **Entries**: Last-Writer-Wins by stamp (revision, then replica id)
//! - **Deletes**: tombstones retained until an external retention policy
//!   compacts them, so a late stale write never resurrects a node
//! - **Structure**: readers see an admitted view that is acyclic by
//!   construction; local `add_edge` rejects cycles outright

mod dag;
mod error;
mod registry;
mod state;
mod store;

pub use dag::{DagIndex, MAX_DAG_DEPTH};
pub use error::GraphError;
pub use registry::KindRegistry;
pub use state::{Entry, GraphState, MergeReport, Stamped};
pub use store::GraphStore;

pub use tessera_types::{
    ContentUpdate, Edge, EdgeId, EdgeKind, Node, NodeId, NodeKind, NodePatch, NodeSnapshot,
    NodeStatus, Position, ReplicaId, Stamp, meta, now_millis,
};

/// Result type for graph operations.
pub type Result<T> = std::result::Result<T, GraphError>;
