//! Error types for graph store operations.

use thiserror::Error;

use tessera_types::{EdgeId, NodeId, NodeStatus, Stamp};

/// Errors returned at the graph store boundary.
///
/// All are synchronous and local: nothing here ever reaches the user as a
/// merge conflict, since merge itself cannot fail.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Edge rejected: it would make the graph cyclic.
    #[error("edge {edge:?} ({from:?} -> {to:?}) would create a cycle")]
    Cycle { edge: EdgeId, from: NodeId, to: NodeId },

    /// An entity with this id already exists with a newer (or no) stamp.
    #[error("{id} already exists at {existing}")]
    DuplicateId { id: String, existing: Stamp },

    /// Node not found (or not live).
    #[error("node not found: {0:?}")]
    NotFound(NodeId),

    /// Edge not found (or not live).
    #[error("edge not found: {0:?}")]
    EdgeNotFound(EdgeId),

    /// The id was deleted at a stamp at least as new as the write.
    #[error("{id} was deleted at {tombstone}")]
    Deleted { id: String, tombstone: Stamp },

    /// Status change not allowed by the generation state machine.
    #[error("node {node:?}: cannot move from {from} to {to}")]
    InvalidTransition {
        node: NodeId,
        from: NodeStatus,
        to: NodeStatus,
    },

    /// Custom node kind that nobody registered.
    #[error("unknown node kind: {0}")]
    UnknownKind(String),
}
