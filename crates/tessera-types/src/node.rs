//! Graph vertices: kinds, generation status, and partial updates.
//!
//! ## Design: closed kinds + registered extensions
//!
//! `NodeKind` names the kinds the core knows about. Collaborators that need
//! more (a plugin's custom card type, say) use `NodeKind::Custom`, which the
//! graph store only accepts locally once the name is registered. Rendering
//! behavior never lives here.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::EnumString;

use crate::clock::{Stamp, now_millis};
use crate::ids::{EdgeId, NodeId};

/// Well-known metadata keys.
pub mod meta {
    /// Durable task id issued by the generation backend.
    pub const UPSTREAM_TASK_ID: &str = "upstream_task_id";
    /// Process-local task handle (not queryable after a backend restart).
    pub const LOCAL_TASK_ID: &str = "local_task_id";
    /// Generation pipeline that owns the node's content.
    pub const FEATURE_ID: &str = "feature_id";
    /// Model that produced the content.
    pub const MODEL: &str = "model";
    /// De-duplicated citation list.
    pub const SOURCES: &str = "sources";
    /// Latest upstream status line ("searching", "reading 3 sources", ...).
    pub const STATUS_MESSAGE: &str = "status_message";
    /// Failure reason for `Failed` nodes.
    pub const ERROR: &str = "error";
    /// Whether a `Failed` node can be continued.
    pub const RESUMABLE: &str = "resumable";
    /// Set when the user stopped generation; cleared on continue.
    pub const STOPPED: &str = "stopped";
}

/// What a node *is*.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default, EnumString, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
#[strum(ascii_case_insensitive)]
pub enum NodeKind {
    /// Text typed by the user.
    #[default]
    #[strum(serialize = "human", serialize = "human_input", serialize = "user")]
    HumanInput,
    /// Model response.
    #[strum(serialize = "ai", serialize = "assistant_output", serialize = "assistant")]
    AssistantOutput,
    /// Multi-step research task (long running, usually durable upstream).
    #[strum(serialize = "research", serialize = "research_task")]
    ResearchTask,
    /// A single search hit.
    #[strum(serialize = "search", serialize = "search_result")]
    SearchResult,
    /// Free-form note.
    Note,
    /// Image payload.
    Image,
    /// Kind registered by an external collaborator.
    #[strum(default)]
    Custom(String),
}

impl NodeKind {
    /// Parse from string (case-insensitive). Unknown names become `Custom`.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Self {
        <Self as FromStr>::from_str(s).unwrap_or_else(|_| NodeKind::Custom(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        match self {
            NodeKind::HumanInput => "human",
            NodeKind::AssistantOutput => "ai",
            NodeKind::ResearchTask => "research",
            NodeKind::SearchResult => "search",
            NodeKind::Note => "note",
            NodeKind::Image => "image",
            NodeKind::Custom(name) => name,
        }
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, NodeKind::Custom(_))
    }

    /// Whether nodes of this kind are normally filled by a generation pipeline.
    pub fn is_generated(&self) -> bool {
        matches!(
            self,
            NodeKind::AssistantOutput | NodeKind::ResearchTask | NodeKind::SearchResult
        )
    }
}

impl From<String> for NodeKind {
    fn from(s: String) -> Self {
        NodeKind::from_str(&s)
    }
}

impl From<NodeKind> for String {
    fn from(kind: NodeKind) -> Self {
        kind.as_str().to_string()
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Generation status of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum NodeStatus {
    /// Created, generation not started.
    #[default]
    Pending,
    /// Receiving content from an active session.
    #[strum(serialize = "streaming", serialize = "running")]
    Streaming,
    /// Stopped by the user; partial content retained, continue available.
    Stopped,
    /// Finished successfully.
    #[strum(serialize = "completed", serialize = "done", serialize = "complete")]
    Completed,
    /// Transport or upstream failure.
    #[strum(serialize = "failed", serialize = "error")]
    Failed,
}

impl NodeStatus {
    /// Parse from string (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Streaming => "streaming",
            NodeStatus::Stopped => "stopped",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed => "failed",
        }
    }

    /// `Completed` or `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::Completed | NodeStatus::Failed)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, NodeStatus::Streaming)
    }

    /// Whether a local write may move a node from `self` to `to`.
    ///
    /// `resume` is explicit resume authority: continuing a resumable failure,
    /// or the resume coordinator reopening / finishing a task it found
    /// upstream. Without it, `Completed` and `Failed` never go back to
    /// `Streaming`, and nothing ever returns to `Pending`.
    pub fn can_transition(self, to: NodeStatus, resume: bool) -> bool {
        use NodeStatus::*;

        if self == to {
            return true;
        }
        match (self, to) {
            (Pending, Streaming | Stopped | Completed | Failed) => true,
            (Streaming, Completed | Stopped | Failed) => true,
            (Stopped, Streaming) => true,
            (Stopped, Completed | Failed) => resume,
            (Failed, Streaming | Completed) => resume,
            (Completed, Streaming | Failed) => resume,
            _ => false,
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Layout hint owned by the rendering collaborator.
#[derive(Clone, Copy, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// A graph vertex as stored in the replicated graph.
///
/// Incoming edges are not stored here. They are first-class entities in the
/// store and surface as [`NodeSnapshot::parent_refs`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Stamp of the last write (revision + writer).
    pub stamp: Stamp,
    /// Creation time (Unix millis).
    pub created_at: u64,
}

impl Node {
    /// New node with a fresh id. The stamp is assigned by the store.
    pub fn new(kind: NodeKind) -> Self {
        Self::with_id(NodeId::new(), kind)
    }

    pub fn with_id(id: NodeId, kind: NodeKind) -> Self {
        Self {
            id,
            kind,
            content: String::new(),
            status: NodeStatus::Pending,
            position: None,
            metadata: BTreeMap::new(),
            stamp: Stamp::zero(),
            created_at: now_millis(),
        }
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn status(mut self, status: NodeStatus) -> Self {
        self.status = status;
        self
    }

    pub fn position(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn stamped(mut self, stamp: Stamp) -> Self {
        self.stamp = stamp;
        self
    }

    /// Logical revision of the last write.
    pub fn revision(&self) -> u64 {
        self.stamp.revision
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    /// Durable upstream task id, if the node carries one.
    pub fn upstream_task_id(&self) -> Option<&str> {
        self.meta_str(meta::UPSTREAM_TASK_ID)
    }

    /// Whether a `Failed` node was annotated as continuable.
    pub fn is_resumable(&self) -> bool {
        self.metadata
            .get(meta::RESUMABLE)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// How a patch changes content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentUpdate {
    /// Append to the current content (streaming increments).
    Append(String),
    /// Replace the content outright (finalize, user edit).
    Replace(String),
}

/// Partial update applied by `updateNode`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodePatch {
    pub content: Option<ContentUpdate>,
    pub status: Option<NodeStatus>,
    pub position: Option<Position>,
    pub set_meta: BTreeMap<String, serde_json::Value>,
    pub remove_meta: Vec<String>,
    /// Explicit resume authority for status transitions.
    pub resume: bool,
}

impl NodePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(mut self, text: impl Into<String>) -> Self {
        self.content = Some(ContentUpdate::Append(text.into()));
        self
    }

    pub fn replace(mut self, text: impl Into<String>) -> Self {
        self.content = Some(ContentUpdate::Replace(text.into()));
        self
    }

    pub fn status(mut self, status: NodeStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn position(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.set_meta.insert(key.into(), value.into());
        self
    }

    pub fn unset(mut self, key: impl Into<String>) -> Self {
        self.remove_meta.push(key.into());
        self
    }

    pub fn resuming(mut self) -> Self {
        self.resume = true;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.status.is_none()
            && self.position.is_none()
            && self.set_meta.is_empty()
            && self.remove_meta.is_empty()
    }

    /// Apply to a node in place. Status legality is the caller's job.
    pub fn apply_to(&self, node: &mut Node) {
        match &self.content {
            Some(ContentUpdate::Append(text)) => node.content.push_str(text),
            Some(ContentUpdate::Replace(text)) => node.content = text.clone(),
            None => {}
        }
        if let Some(status) = self.status {
            node.status = status;
        }
        if let Some(position) = self.position {
            node.position = Some(position);
        }
        for key in &self.remove_meta {
            node.metadata.remove(key);
        }
        for (key, value) in &self.set_meta {
            node.metadata.insert(key.clone(), value.clone());
        }
    }
}

/// Read-only view of a node handed to collaborators.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    #[serde(flatten)]
    pub node: Node,
    /// Admitted incoming edges, in stamp order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parent_refs: Vec<EdgeId>,
}

impl NodeSnapshot {
    pub fn is_root(&self) -> bool {
        self.parent_refs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip_and_aliases() {
        assert_eq!(NodeKind::from_str("assistant"), NodeKind::AssistantOutput);
        assert_eq!(NodeKind::from_str("RESEARCH"), NodeKind::ResearchTask);
        assert_eq!(
            NodeKind::from_str("matrix"),
            NodeKind::Custom("matrix".to_string())
        );

        let json = serde_json::to_string(&NodeKind::SearchResult).unwrap();
        assert_eq!(json, "\"search\"");
        let back: NodeKind = serde_json::from_str("\"matrix\"").unwrap();
        assert!(back.is_custom());
    }

    #[test]
    fn test_forward_transitions() {
        use NodeStatus::*;
        assert!(Pending.can_transition(Streaming, false));
        assert!(Streaming.can_transition(Completed, false));
        assert!(Streaming.can_transition(Stopped, false));
        assert!(Streaming.can_transition(Failed, false));
        assert!(Stopped.can_transition(Streaming, false));
    }

    #[test]
    fn test_terminal_states_need_resume() {
        use NodeStatus::*;
        assert!(!Completed.can_transition(Streaming, false));
        assert!(!Failed.can_transition(Streaming, false));
        assert!(Completed.can_transition(Streaming, true));
        assert!(Failed.can_transition(Streaming, true));
        assert!(!Streaming.can_transition(Pending, true));
    }

    #[test]
    fn test_patch_applies_in_order() {
        let mut node = Node::new(NodeKind::AssistantOutput)
            .content("AB")
            .meta(meta::STOPPED, true);

        NodePatch::new()
            .append("CD")
            .status(NodeStatus::Streaming)
            .unset(meta::STOPPED)
            .meta(meta::MODEL, "sonar")
            .apply_to(&mut node);

        assert_eq!(node.content, "ABCD");
        assert_eq!(node.status, NodeStatus::Streaming);
        assert!(!node.metadata.contains_key(meta::STOPPED));
        assert_eq!(node.meta_str(meta::MODEL), Some("sonar"));
    }

    #[test]
    fn test_snapshot_serializes_flat() {
        let snap = NodeSnapshot {
            node: Node::new(NodeKind::Note).content("hi"),
            parent_refs: vec![],
        };
        let value = serde_json::to_value(&snap).unwrap();
        assert_eq!(value["content"], "hi");
        assert_eq!(value["kind"], "note");
        assert!(value.get("parent_refs").is_none());
    }
}
