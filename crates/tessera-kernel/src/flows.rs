//! FlowBus pub/sub for graph and session change notification.
//!
//! The rendering collaborator subscribes here instead of polling the store.
//! Subscriptions filter by subject pattern: `*` matches one token and a
//! trailing `>` matches one or more.
//!
//! # Subjects
//!
//! | Subject         | Payload                              |
//! |-----------------|--------------------------------------|
//! | `node.changed`  | [`GraphFlow::NodeChanged`]           |
//! | `node.removed`  | [`GraphFlow::NodeRemoved`]           |
//! | `edge.changed`  | [`GraphFlow::EdgeChanged`]           |
//! | `edge.removed`  | [`GraphFlow::EdgeRemoved`]           |
//! | `session.state` | [`GraphFlow::SessionChanged`]        |
//! | `graph.merged`  | [`GraphFlow::Merged`]                |

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use tessera_crdt::{Edge, EdgeId, MergeReport, NodeId, NodeSnapshot};

use crate::checkpoint::SessionPhase;

/// Where a change came from.
///
/// Remote changes arrived through merge and should not be echoed back to the
/// peer they came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OpSource {
    /// Local user action or session write.
    #[default]
    Local,
    /// Learned from a merge.
    Remote,
}

/// Whether `subject` matches a dot-separated `pattern`.
pub fn matches_pattern(pattern: &str, subject: &str) -> bool {
    let mut subject = subject.split('.');
    for token in pattern.split('.') {
        match (token, subject.next()) {
            // Tail wildcard; needs at least one token left.
            (">", Some(_)) => return true,
            (_, None) => return false,
            ("*", Some(_)) => {}
            (want, Some(got)) if want == got => {}
            _ => return false,
        }
    }
    subject.next().is_none()
}

/// One published change, tagged with its subject.
#[derive(Clone, Debug)]
pub struct FlowEvent {
    pub subject: &'static str,
    pub payload: GraphFlow,
}

/// Graph and session change events.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum GraphFlow {
    /// A node was created or its fields changed.
    NodeChanged {
        node: NodeSnapshot,
        #[serde(default)]
        source: OpSource,
    },

    /// A node was tombstoned along with its incident edges.
    NodeRemoved {
        node_id: NodeId,
        edges: Vec<EdgeId>,
        #[serde(default)]
        source: OpSource,
    },

    /// An edge entered the admitted graph.
    EdgeChanged {
        edge: Edge,
        #[serde(default)]
        source: OpSource,
    },

    /// An edge left the admitted graph.
    EdgeRemoved {
        edge_id: EdgeId,
        #[serde(default)]
        source: OpSource,
    },

    /// A streaming session changed phase.
    SessionChanged {
        node_id: NodeId,
        phase: SessionPhase,
        /// For `Failed`: whether continue is available.
        #[serde(default)]
        resumable: bool,
    },

    /// A remote state was merged.
    Merged { report: MergeReport },
}

impl GraphFlow {
    pub fn subject(&self) -> &'static str {
        match self {
            Self::NodeChanged { .. } => "node.changed",
            Self::NodeRemoved { .. } => "node.removed",
            Self::EdgeChanged { .. } => "edge.changed",
            Self::EdgeRemoved { .. } => "edge.removed",
            Self::SessionChanged { .. } => "session.state",
            Self::Merged { .. } => "graph.merged",
        }
    }

    /// Node this event is about, if any.
    pub fn node_id(&self) -> Option<NodeId> {
        match self {
            Self::NodeChanged { node, .. } => Some(node.node.id),
            Self::NodeRemoved { node_id, .. } | Self::SessionChanged { node_id, .. } => {
                Some(*node_id)
            }
            _ => None,
        }
    }

    pub fn source(&self) -> OpSource {
        match self {
            Self::NodeChanged { source, .. }
            | Self::NodeRemoved { source, .. }
            | Self::EdgeChanged { source, .. }
            | Self::EdgeRemoved { source, .. } => *source,
            Self::SessionChanged { .. } => OpSource::Local,
            Self::Merged { .. } => OpSource::Remote,
        }
    }

    pub fn is_remote(&self) -> bool {
        self.source() == OpSource::Remote
    }
}

/// Broadcast bus for [`GraphFlow`]s. Cloning shares the channel.
#[derive(Debug, Clone)]
pub struct FlowBus {
    tx: broadcast::Sender<FlowEvent>,
}

impl FlowBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns how many subscribers were listening.
    pub fn publish(&self, payload: GraphFlow) -> usize {
        let event = FlowEvent {
            subject: payload.subject(),
            payload,
        };
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self, pattern: &str) -> Subscription {
        Subscription {
            pattern: pattern.to_string(),
            rx: self.tx.subscribe(),
        }
    }
}

/// A pattern-filtered receiver. Lagging drops the oldest events with a warning.
#[derive(Debug)]
pub struct Subscription {
    pattern: String,
    rx: broadcast::Receiver<FlowEvent>,
}

impl Subscription {
    /// Next matching event. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<FlowEvent> {
        loop {
            let received = match self.rx.recv().await {
                Ok(event) => Some(event),
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.lagged(n);
                    None
                }
            };
            if let Some(event) = received.filter(|e| matches_pattern(&self.pattern, e.subject)) {
                return Some(event);
            }
        }
    }

    /// Next matching event already queued.
    pub fn try_recv(&mut self) -> Option<FlowEvent> {
        use broadcast::error::TryRecvError;
        loop {
            let received = match self.rx.try_recv() {
                Ok(event) => Some(event),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
                Err(TryRecvError::Lagged(n)) => {
                    self.lagged(n);
                    None
                }
            };
            if let Some(event) = received.filter(|e| matches_pattern(&self.pattern, e.subject)) {
                return Some(event);
            }
        }
    }

    fn lagged(&self, skipped: u64) {
        tracing::warn!(pattern = %self.pattern, skipped, "flow subscription lagged");
    }
}
