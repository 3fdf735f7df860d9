//! Reconcile persisted checkpoints after a restart.
//!
//! Runs once at startup, before any new generation begins. Each checkpoint
//! is either reattached to its still-running task, finished from the
//! upstream result, restored as a paused session, or dropped.

use serde::{Deserialize, Serialize};

use tessera_crdt::{NodeId, NodePatch, NodeStatus, meta};
use tessera_types::now_millis;

use crate::backend::{BackendError, TaskHandle, UpstreamStatus};
use crate::checkpoint::{Checkpoint, SessionPhase};
use crate::session::{Result, SessionController};
use crate::sources::SourceSet;

/// What [`ResumeCoordinator::reconcile`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeReport {
    /// Streams reopened on a task still running upstream.
    pub reattached: usize,
    /// Tasks that finished while we were away.
    pub completed: usize,
    pub failed: usize,
    /// Stale, orphaned, or already finished checkpoints.
    pub discarded: usize,
    /// Stopped sessions made available for continue again.
    pub restored_stopped: usize,
    /// Undecodable entries purged from the store.
    pub corrupt: usize,
    /// Checkpoints left untouched because reconciling them errored.
    pub errors: usize,
    /// Checkpoints owned by a session registered in this process.
    pub skipped: usize,
}

impl ResumeReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

enum Verdict {
    Reattached,
    Completed,
    Failed,
    Discarded,
    RestoredStopped,
}

pub struct ResumeCoordinator {
    sessions: SessionController,
}

impl ResumeCoordinator {
    pub fn new(sessions: SessionController) -> Self {
        Self { sessions }
    }

    #[tracing::instrument(skip(self), name = "resume.reconcile")]
    pub async fn reconcile(&self) -> Result<ResumeReport> {
        let (checkpoints, corrupt) = self.sessions.checkpoints().list()?;
        let mut report = ResumeReport::default();

        for error in corrupt {
            if let crate::persist::PersistError::Corrupt { key, .. } = &error {
                match self.sessions.checkpoints().purge_key(key) {
                    Ok(()) => report.corrupt += 1,
                    Err(e) => tracing::warn!(%key, error = %e, "failed to purge corrupt checkpoint"),
                }
            }
        }

        let now = now_millis();
        for checkpoint in checkpoints {
            let node = checkpoint.node_id;
            if self.sessions.phase(&node).is_some() {
                tracing::debug!(%node, "checkpoint belongs to a live session, skipping");
                report.skipped += 1;
                continue;
            }
            match self.reconcile_one(checkpoint, now).await {
                Ok(Verdict::Reattached) => report.reattached += 1,
                Ok(Verdict::Completed) => report.completed += 1,
                Ok(Verdict::Failed) => report.failed += 1,
                Ok(Verdict::Discarded) => report.discarded += 1,
                Ok(Verdict::RestoredStopped) => report.restored_stopped += 1,
                Err(e) => {
                    tracing::warn!(%node, error = %e, "failed to reconcile checkpoint");
                    report.errors += 1;
                }
            }
        }

        if let Err(e) = self.sessions.graph().persist() {
            tracing::warn!(error = %e, "failed to persist graph after resume");
        }
        tracing::info!(
            reattached = report.reattached,
            completed = report.completed,
            failed = report.failed,
            discarded = report.discarded,
            restored_stopped = report.restored_stopped,
            skipped = report.skipped,
            "resume reconciled"
        );
        Ok(report)
    }

    async fn reconcile_one(&self, checkpoint: Checkpoint, now: u64) -> Result<Verdict> {
        let node_id = checkpoint.node_id;
        let checkpoints = self.sessions.checkpoints();

        if checkpoint.phase == SessionPhase::Completed
            || checkpoint.phase == SessionPhase::Discarded
        {
            checkpoints.delete(&node_id)?;
            return Ok(Verdict::Discarded);
        }

        let Some(node) = self.sessions.graph().node(&node_id) else {
            tracing::warn!(node = %node_id, "checkpoint for missing node, discarding");
            checkpoints.delete(&node_id)?;
            return Ok(Verdict::Discarded);
        };
        if node.status == NodeStatus::Completed {
            checkpoints.delete(&node_id)?;
            return Ok(Verdict::Discarded);
        }

        let window = self.sessions.config().staleness_window();
        if u128::from(checkpoint.age_ms(now)) > window.as_millis() {
            tracing::warn!(node = %node_id, age_ms = checkpoint.age_ms(now), "stale checkpoint, discarding");
            checkpoints.delete(&node_id)?;
            if node.status == NodeStatus::Streaming {
                self.mark_failed(&node_id, "abandoned: no progress within staleness window", false)?;
            } else {
                self.sessions.clear_continue_markers(&node_id)?;
            }
            return Ok(Verdict::Discarded);
        }

        if checkpoint.phase == SessionPhase::Stopped {
            self.sessions.restore(checkpoint)?;
            tracing::debug!(node = %node_id, "restored stopped session");
            return Ok(Verdict::RestoredStopped);
        }

        let Some(handle) = checkpoint.handle() else {
            tracing::warn!(node = %node_id, "checkpoint has no task handle");
            checkpoints.delete(&node_id)?;
            self.mark_failed(&node_id, "interrupted before the task started", false)?;
            return Ok(Verdict::Failed);
        };

        match self.sessions.backend().status(&handle).await {
            Ok(UpstreamStatus::InProgress) => {
                self.sessions.reattach(checkpoint)?;
                tracing::info!(node = %node_id, task = %handle.id, "reattached to running task");
                Ok(Verdict::Reattached)
            }
            Ok(UpstreamStatus::Completed) => self.complete(checkpoint, &handle).await,
            Ok(UpstreamStatus::Failed(reason)) => {
                checkpoints.delete(&node_id)?;
                self.mark_failed(&node_id, &BackendError::Upstream(reason).to_string(), false)?;
                Ok(Verdict::Failed)
            }
            Ok(UpstreamStatus::NotFound) => {
                checkpoints.delete(&node_id)?;
                self.mark_failed(&node_id, &BackendError::NotFound(handle.id).to_string(), false)?;
                Ok(Verdict::Failed)
            }
            Err(e) => self.unreachable(checkpoint, e),
        }
    }

    async fn complete(&self, checkpoint: Checkpoint, handle: &TaskHandle) -> Result<Verdict> {
        let node_id = checkpoint.node_id;
        let finalized = match self.sessions.backend().finalize(handle).await {
            Ok(finalized) => finalized,
            Err(BackendError::NotFound(id)) => {
                self.sessions.checkpoints().delete(&node_id)?;
                self.mark_failed(&node_id, &BackendError::NotFound(id).to_string(), false)?;
                return Ok(Verdict::Failed);
            }
            Err(e) => return self.unreachable(checkpoint, e),
        };

        let mut patch = NodePatch::new()
            .replace(finalized.content)
            .status(NodeStatus::Completed)
            .unset(meta::STOPPED)
            .unset(meta::ERROR)
            .unset(meta::RESUMABLE)
            .unset(meta::STATUS_MESSAGE)
            .resuming();
        if !finalized.sources.is_empty() {
            let current = self.sessions.graph().node(&node_id);
            let mut sources =
                SourceSet::from_value(current.as_ref().and_then(|n| n.metadata.get(meta::SOURCES)));
            sources.extend(finalized.sources);
            patch = patch.meta(meta::SOURCES, sources.to_value());
        }
        self.sessions.graph().update_node(&node_id, &patch)?;
        self.sessions.checkpoints().delete(&node_id)?;
        self.sessions
            .graph()
            .publish_session(node_id, SessionPhase::Completed, false);
        tracing::info!(node = %node_id, task = %handle.id, "finished from upstream result");
        Ok(Verdict::Completed)
    }

    /// The backend could not be asked. A durable task may still be fine, so
    /// keep it continuable; a local one is gone with the old process.
    fn unreachable(&self, mut checkpoint: Checkpoint, error: BackendError) -> Result<Verdict> {
        let node_id = checkpoint.node_id;
        let resumable = checkpoint.is_durable()
            && self
                .sessions
                .features()
                .get(&checkpoint.feature_id)
                .is_some_and(|f| f.resumable);
        tracing::warn!(node = %node_id, error = %error, resumable, "upstream unreachable during resume");

        self.mark_failed(&node_id, &error.to_string(), resumable)?;
        if resumable {
            checkpoint.phase = SessionPhase::Failed;
            checkpoint.touch();
            self.sessions.checkpoints().save(&checkpoint)?;
            self.sessions.restore(checkpoint)?;
        } else {
            self.sessions.checkpoints().delete(&node_id)?;
        }
        Ok(Verdict::Failed)
    }

    fn mark_failed(&self, node: &NodeId, reason: &str, resumable: bool) -> Result<()> {
        self.sessions.graph().update_node(
            node,
            &NodePatch::new()
                .status(NodeStatus::Failed)
                .meta(meta::ERROR, reason)
                .meta(meta::RESUMABLE, resumable)
                .resuming(),
        )?;
        self.sessions
            .graph()
            .publish_session(*node, SessionPhase::Failed, resumable);
        Ok(())
    }
}

impl std::fmt::Debug for ResumeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumeCoordinator").finish_non_exhaustive()
    }
}
