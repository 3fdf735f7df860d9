//! Resumable session state.

use serde::{Deserialize, Serialize};
use tessera_types::{NodeId, now_millis};

use crate::backend::{GenerationRequest, TaskHandle};

/// Where a session is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    /// Driving a stream.
    Active,
    /// Stopped by the user, checkpoint retained for continue.
    Stopped,
    /// Failed with a durable task id; continue may reattach.
    Failed,
    /// Finished. Never persisted for long; the checkpoint is deleted.
    Completed,
    /// Dropped without finishing (discard, node removed, expired).
    Discarded,
}

impl SessionPhase {
    pub fn is_active(&self) -> bool {
        matches!(self, SessionPhase::Active)
    }

    /// Whether `continue` can pick this session up.
    pub fn is_continuable(&self) -> bool {
        matches!(self, SessionPhase::Stopped | SessionPhase::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Active => "active",
            SessionPhase::Stopped => "stopped",
            SessionPhase::Failed => "failed",
            SessionPhase::Completed => "completed",
            SessionPhase::Discarded => "discarded",
        }
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to continue a generation later, possibly in another
/// process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub node_id: NodeId,
    pub feature_id: String,
    pub request: GenerationRequest,
    /// Content accumulated so far.
    #[serde(default)]
    pub content: String,
    /// Durable id issued by the backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_task_id: Option<String>,
    /// Process-local task handle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_task_id: Option<String>,
    pub phase: SessionPhase,
    /// Deltas applied since the session started.
    #[serde(default)]
    pub deltas: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Checkpoint {
    pub fn new(node_id: NodeId, feature_id: impl Into<String>, request: GenerationRequest) -> Self {
        let now = now_millis();
        Self {
            node_id,
            feature_id: feature_id.into(),
            request,
            content: String::new(),
            upstream_task_id: None,
            local_task_id: None,
            phase: SessionPhase::Active,
            deltas: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record the backend handle, durable ids in preference to local ones.
    pub fn bind(&mut self, handle: &TaskHandle) {
        if handle.durable {
            self.upstream_task_id = Some(handle.id.clone());
        } else {
            self.local_task_id = Some(handle.id.clone());
        }
    }

    /// The handle to query on resume: durable first, then local.
    pub fn handle(&self) -> Option<TaskHandle> {
        self.upstream_task_id
            .as_deref()
            .map(TaskHandle::durable)
            .or_else(|| self.local_task_id.as_deref().map(TaskHandle::local))
    }

    pub fn is_durable(&self) -> bool {
        self.upstream_task_id.is_some()
    }

    pub fn touch(&mut self) {
        self.updated_at = now_millis();
    }

    /// Milliseconds since the last update, saturating at zero.
    pub fn age_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.updated_at)
    }
}
