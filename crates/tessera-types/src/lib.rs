//! Shared identity, clock, and graph types for Tessera.
//!
//! This crate is the leaf of the workspace: typed IDs, the Lamport clock and
//! write stamps used for conflict resolution, and the node/edge data model.
//! It has **no internal tessera dependencies**.
//!
//! # Key Types
//!
//! |-------------------|----------------------------------------------|
//! | Type              | Purpose                                      |
//! |-------------------|----------------------------------------------|
//! | [`NodeId`]        | Vertex identity (UUIDv7, creation-ordered)   |
//! | [`EdgeId`]        | Relation identity (UUIDv7)                   |
//! | [`ReplicaId`]     | Which tab/device/process wrote a change      |
//! | [`Stamp`]         | Revision + writer, totally ordered           |
//! | [`LamportClock`]  | Per-replica logical clock                    |
//! | [`Node`]          | Stored vertex                                |
//! | [`NodePatch`]     | Partial update for `update_node`             |
//! | [`NodeSnapshot`]  | Read view with derived parent refs           |
//! | [`Edge`]          | Directed, kinded relation                    |
//! |-------------------|----------------------------------------------|

pub mod clock;
pub mod edge;
pub mod ids;
pub mod node;

pub use clock::{LamportClock, Stamp, now_millis};
pub use edge::{Edge, EdgeKind};
pub use ids::{EdgeId, NodeId, PrefixError, ReplicaId, resolve_node_prefix};
pub use node::{
    ContentUpdate, Node, NodeKind, NodePatch, NodeSnapshot, NodeStatus, Position, meta,
};
