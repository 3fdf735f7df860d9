//! Provider-agnostic generation backend.
//!
//! The kernel speaks to whatever produces content (an LLM proxy, a deep
//! research service, a local model) through [`GenerationBackend`]. Providers
//! convert their native stream into [`GenerationEvent`]s; the session
//! controller consumes nothing else.
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ chat proxy   │   │ research API │   │ local model  │
//! └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!        ▼                  ▼                  ▼
//!        ┌──────────────────────────────────────┐
//!        │  GenerationEvent (common enum)       │
//!        │  delta / status / sources / error /  │
//!        │  done                                │
//!        └──────────────────┬───────────────────┘
//!                           ▼
//!                  SessionController
//! ```

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::checkpoint::Checkpoint;
use crate::sources::Source;

/// Events a backend stream yields, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GenerationEvent {
    /// Incremental content, appended to the node.
    ContentDelta(String),

    /// Human-readable progress line ("searching", "reading 3 pages").
    Status(String),

    /// Citations discovered so far.
    Sources(Vec<Source>),

    /// Upstream reported failure. Terminal.
    Error(String),

    /// Generation finished. `content`, when present, is the authoritative
    /// final text and replaces what streamed.
    Done { content: Option<String> },
}

impl GenerationEvent {
    pub fn delta(text: impl Into<String>) -> Self {
        Self::ContentDelta(text.into())
    }

    pub fn done() -> Self {
        Self::Done { content: None }
    }

    /// Check if this is a terminal event (Done or Error).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error(_))
    }

    pub fn as_delta(&self) -> Option<&str> {
        match self {
            Self::ContentDelta(s) => Some(s),
            _ => None,
        }
    }
}

/// What the kernel asks a backend to generate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Feature (pipeline) id, see [`FeatureRegistry`](crate::FeatureRegistry).
    pub feature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub prompt: String,
    /// Provider-specific parameters, opaque to the kernel.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl GenerationRequest {
    pub fn new(feature: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            feature: feature.into(),
            model: None,
            prompt: prompt.into(),
            params: serde_json::Value::Null,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}

/// Reference to a task running on the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskHandle {
    pub id: String,
    /// Durable handles stay queryable after the local process restarts.
    pub durable: bool,
}

impl TaskHandle {
    pub fn durable(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            durable: true,
        }
    }

    pub fn local(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            durable: false,
        }
    }
}

/// Result of a status-by-handle query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpstreamStatus {
    InProgress,
    Completed,
    Failed(String),
    NotFound,
}

/// Finalized output of a completed task.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FinalizedTask {
    pub content: String,
    #[serde(default)]
    pub sources: Vec<Source>,
}

/// Transport and upstream failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("no event within {0:?}")]
    Timeout(Duration),

    #[error("upstream task failed: {0}")]
    Upstream(String),

    #[error("task not found: {0}")]
    NotFound(String),
}

/// Ordered event stream for one task.
pub type EventStream = BoxStream<'static, Result<GenerationEvent, BackendError>>;

/// The external generation service.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Start a new task.
    async fn start(&self, request: &GenerationRequest) -> Result<TaskHandle, BackendError>;

    /// Continue from a checkpoint. The returned handle's stream yields only
    /// content produced after `checkpoint.content`. Backends with a durable
    /// task id in the checkpoint reattach to that task; others re-issue the
    /// original request with the accumulated content as context.
    async fn resume(&self, checkpoint: &Checkpoint) -> Result<TaskHandle, BackendError>;

    /// Open the event stream for a handle.
    async fn stream(&self, handle: &TaskHandle) -> Result<EventStream, BackendError>;

    async fn status(&self, handle: &TaskHandle) -> Result<UpstreamStatus, BackendError>;

    /// Fetch the completed result of a finished task.
    async fn finalize(&self, handle: &TaskHandle) -> Result<FinalizedTask, BackendError>;
}
