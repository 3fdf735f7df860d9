//! Graph edges: first-class relations between two nodes.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::EnumString;

use crate::clock::Stamp;
use crate::ids::{EdgeId, NodeId};

/// How two nodes relate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum EdgeKind {
    /// Target answers or continues the source.
    #[default]
    #[strum(serialize = "reply_to", serialize = "reply")]
    ReplyTo,
    /// Target is an alternative branch forked from the source.
    #[strum(serialize = "branch_from", serialize = "branch")]
    BranchFrom,
    /// Target cites or builds on the source without a conversational link.
    #[strum(serialize = "reference", serialize = "ref")]
    Reference,
}

impl EdgeKind {
    /// Parse from string (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::ReplyTo => "reply_to",
            EdgeKind::BranchFrom => "branch_from",
            EdgeKind::Reference => "reference",
        }
    }
}

impl std::fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Directed relation `source -> target`.
///
/// Edges are immutable once created; they only ever exist or are tombstoned.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub source: NodeId,
    pub target: NodeId,
    pub kind: EdgeKind,
    pub stamp: Stamp,
}

impl Edge {
    /// New edge with a fresh id. The stamp is assigned by the store.
    pub fn new(source: NodeId, target: NodeId, kind: EdgeKind) -> Self {
        Self {
            id: EdgeId::new(),
            source,
            target,
            kind,
            stamp: Stamp::zero(),
        }
    }

    pub fn reply(source: NodeId, target: NodeId) -> Self {
        Self::new(source, target, EdgeKind::ReplyTo)
    }

    pub fn branch(source: NodeId, target: NodeId) -> Self {
        Self::new(source, target, EdgeKind::BranchFrom)
    }

    pub fn stamped(mut self, stamp: Stamp) -> Self {
        self.stamp = stamp;
        self
    }

    /// Whether `node` is either endpoint.
    pub fn touches(&self, node: &NodeId) -> bool {
        &self.source == node || &self.target == node
    }
}
