//! Streaming Session Controller.
//!
//! One [`StreamingSession`] per node that is generating or paused with a
//! checkpoint. Each active session is a spawned task that selects over its
//! cancellation token and the backend event stream; every delta lands in the
//! graph through [`SharedGraph::update_node`] as it arrives.
//!
//! ```text
//!            start                 Done / end of stream
//! Pending ─────────▶ Streaming ─────────────────────────▶ Completed
//!                      │   ▲
//!              cancel  │   │ continue_session
//!                      ▼   │
//!                    Stopped
//!
//! Streaming ── error ──▶ Failed ── continue (durable task id only) ──▶ Streaming
//! ```
//!
//! # Concurrency Model
//!
//! - `DashMap<NodeId, Slot>`: refs are never held across an await
//! - Each slot carries an epoch. A driver writes to the graph and the
//!   checkpoint store only while holding the guard of the slot it was
//!   spawned for, so a replaced session cannot clobber its successor
//! - `watch` channel per slot for [`SessionController::wait_idle`]

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use tessera_crdt::{GraphError, NodeId, NodePatch, NodeStatus, meta};
use tessera_types::now_millis;

use crate::backend::{
    BackendError, EventStream, GenerationBackend, GenerationEvent, GenerationRequest, TaskHandle,
};
use crate::checkpoint::{Checkpoint, SessionPhase};
use crate::config::KernelConfig;
use crate::graph::SharedGraph;
use crate::persist::{CheckpointStore, PersistError};
use crate::registry::{FeatureRegistry, FeatureSpec};
use crate::sources::SourceSet;

/// Errors from session operations.
///
/// User cancellation is not here: it is [`SessionOutcome::Stopped`].
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("node {0} already has an active session")]
    AlreadyActive(NodeId),

    #[error("node {0} has no active session")]
    NoSession(NodeId),

    #[error("node {0} has no checkpoint to continue from")]
    NoCheckpoint(NodeId),

    #[error("node {0} cannot be continued")]
    NotResumable(NodeId),

    #[error("unknown or disabled feature: {0}")]
    UnknownFeature(String),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Persist(#[from] PersistError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    /// Cancelled by the user. Checkpoint retained.
    Stopped,
    Failed { resumable: bool },
    /// Dropped without a terminal write (discarded, or the node vanished).
    Discarded,
}

impl SessionOutcome {
    fn settled(phase: SessionPhase) -> Option<Self> {
        match phase {
            SessionPhase::Active => None,
            SessionPhase::Stopped => Some(Self::Stopped),
            SessionPhase::Failed => Some(Self::Failed { resumable: true }),
            SessionPhase::Completed => Some(Self::Completed),
            SessionPhase::Discarded => Some(Self::Discarded),
        }
    }
}

/// Runtime record for one node's generation.
#[derive(Debug, Clone)]
pub struct StreamingSession {
    pub node_id: NodeId,
    pub feature_id: String,
    pub token: CancellationToken,
    pub checkpoint: Checkpoint,
    pub created_at: u64,
}

impl StreamingSession {
    pub fn new(checkpoint: Checkpoint) -> Self {
        Self {
            node_id: checkpoint.node_id,
            feature_id: checkpoint.feature_id.clone(),
            token: CancellationToken::new(),
            checkpoint,
            created_at: now_millis(),
        }
    }
}

struct Slot {
    session: StreamingSession,
    epoch: u64,
    phase: SessionPhase,
    /// Whether a spawned task drives this slot.
    driven: bool,
    done: watch::Sender<Option<SessionOutcome>>,
}

impl Slot {
    fn new(session: StreamingSession, epoch: u64, phase: SessionPhase, driven: bool) -> Self {
        let (done, _) = watch::channel(SessionOutcome::settled(phase));
        Self {
            session,
            epoch,
            phase,
            driven,
            done,
        }
    }
}

/// One driver's view of its session.
struct Run {
    node_id: NodeId,
    epoch: u64,
    token: CancellationToken,
    checkpoint: Checkpoint,
    feature_resumable: bool,
}

/// Why a driver stopped writing mid-stream.
enum Halt {
    /// Its slot was unregistered or taken by a newer session.
    Superseded,
    Graph(GraphError),
}

impl From<GraphError> for Halt {
    fn from(e: GraphError) -> Self {
        Self::Graph(e)
    }
}

#[derive(Clone, Copy)]
enum Launch {
    Start,
    Resume,
}

struct Inner {
    graph: Arc<SharedGraph>,
    backend: Arc<dyn GenerationBackend>,
    features: Arc<FeatureRegistry>,
    checkpoints: CheckpointStore,
    config: KernelConfig,
    sessions: DashMap<NodeId, Slot>,
    epochs: AtomicU64,
}

/// Owns every streaming session for one graph.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    pub fn new(
        graph: Arc<SharedGraph>,
        backend: Arc<dyn GenerationBackend>,
        features: Arc<FeatureRegistry>,
        checkpoints: CheckpointStore,
        config: KernelConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                graph,
                backend,
                features,
                checkpoints,
                config,
                sessions: DashMap::new(),
                epochs: AtomicU64::new(0),
            }),
        }
    }

    pub fn graph(&self) -> &Arc<SharedGraph> {
        &self.inner.graph
    }

    pub fn backend(&self) -> &Arc<dyn GenerationBackend> {
        &self.inner.backend
    }

    pub fn features(&self) -> &FeatureRegistry {
        &self.inner.features
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.inner.checkpoints
    }

    pub fn config(&self) -> &KernelConfig {
        &self.inner.config
    }

    // =========================================================================
    // Registry primitives
    // =========================================================================

    /// Register a session. Fails if the node already has one; cancel first.
    pub fn register(&self, session: StreamingSession) -> Result<()> {
        let phase = session.checkpoint.phase;
        self.insert_slot(session, phase, false).map(|_| ())
    }

    /// Remove a session record. Absent is fine.
    ///
    /// A running driver is cancelled and exits without writing to the node
    /// again; use [`cancel`](Self::cancel) first to leave it `Stopped`.
    pub fn unregister(&self, node: &NodeId) -> Option<StreamingSession> {
        let (_, slot) = self.inner.sessions.remove(node)?;
        if slot.phase.is_active() {
            slot.session.token.cancel();
        }
        slot.done.send_replace(Some(SessionOutcome::Discarded));
        Some(slot.session)
    }

    pub fn is_active(&self, node: &NodeId) -> bool {
        self.phase(node).is_some_and(|p| p.is_active())
    }

    pub fn is_stopped(&self, node: &NodeId) -> bool {
        self.phase(node) == Some(SessionPhase::Stopped)
    }

    pub fn phase(&self, node: &NodeId) -> Option<SessionPhase> {
        self.inner.sessions.get(node).map(|slot| slot.phase)
    }

    /// In-memory checkpoint of a registered session.
    pub fn checkpoint(&self, node: &NodeId) -> Option<Checkpoint> {
        self.inner
            .sessions
            .get(node)
            .map(|slot| slot.session.checkpoint.clone())
    }

    /// Nodes with a running session, in id (creation) order.
    pub fn active_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .inner
            .sessions
            .iter()
            .filter(|slot| slot.phase.is_active())
            .map(|slot| *slot.key())
            .collect();
        nodes.sort();
        nodes
    }

    /// Wait until the node's session leaves `Active`.
    ///
    /// `None` when the node has no session record.
    pub async fn wait_idle(&self, node: &NodeId) -> Option<SessionOutcome> {
        let mut rx = self.inner.sessions.get(node)?.done.subscribe();
        match rx.wait_for(|outcome| outcome.is_some()).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => Some(SessionOutcome::Discarded),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start a fresh generation for `node`, cancelling any session it has.
    ///
    /// Returns once the session is registered and the node is `Streaming`;
    /// backend failures after that point land on the node, not here.
    #[tracing::instrument(skip(self, request), name = "session.start", fields(feature = %request.feature))]
    pub async fn start(&self, node: NodeId, request: GenerationRequest) -> Result<()> {
        let feature = self.feature(&request.feature)?;
        let current = self
            .inner
            .graph
            .node(&node)
            .ok_or(GraphError::NotFound(node))?;
        if self.is_active(&node) {
            self.cancel(&node).await?;
        }
        self.unregister(&node);

        let checkpoint = Checkpoint::new(node, &feature.id, request.clone());
        let session = StreamingSession::new(checkpoint.clone());
        let (epoch, token) = self.insert_slot(session, SessionPhase::Active, true)?;

        let mut patch = NodePatch::new()
            .replace("")
            .status(NodeStatus::Streaming)
            .meta(meta::FEATURE_ID, feature.id.clone());
        for key in [
            meta::STOPPED,
            meta::ERROR,
            meta::RESUMABLE,
            meta::UPSTREAM_TASK_ID,
            meta::LOCAL_TASK_ID,
            meta::SOURCES,
            meta::STATUS_MESSAGE,
        ] {
            patch = patch.unset(key);
        }
        if let Some(model) = &request.model {
            patch = patch.meta(meta::MODEL, model.clone());
        }
        // A failed node may be retried as a new task; completed ones stay final.
        if current.status == NodeStatus::Failed {
            patch = patch.resuming();
        }
        if let Err(e) = self.begin(&node, &patch, &checkpoint) {
            self.drop_slot(&node, epoch);
            return Err(e);
        }

        tracing::info!(%node, "session started");
        self.spawn(
            Run {
                node_id: node,
                epoch,
                token,
                checkpoint,
                feature_resumable: feature.resumable,
            },
            Launch::Start,
        );
        Ok(())
    }

    /// Cancel the node's running session. The node ends `Stopped` with its
    /// partial content and the checkpoint is kept for continue.
    #[tracing::instrument(skip(self), name = "session.cancel")]
    pub async fn cancel(&self, node: &NodeId) -> Result<SessionOutcome> {
        let (token, driven) = {
            let slot = self
                .inner
                .sessions
                .get(node)
                .ok_or(SessionError::NoSession(*node))?;
            if !slot.phase.is_active() {
                return Err(SessionError::NoSession(*node));
            }
            (slot.session.token.clone(), slot.driven)
        };
        token.cancel();

        if !driven {
            // Externally driven: settle here.
            let run = self.inner.sessions.get(node).map(|slot| Run {
                node_id: *node,
                epoch: slot.epoch,
                token: slot.session.token.clone(),
                checkpoint: slot.session.checkpoint.clone(),
                feature_resumable: true,
            });
            if let Some(mut run) = run {
                return Ok(self.inner.finish_stopped(&mut run));
            }
        }
        Ok(self
            .wait_idle(node)
            .await
            .unwrap_or(SessionOutcome::Discarded))
    }

    /// Alias of [`cancel`](Self::cancel).
    pub async fn stop(&self, node: &NodeId) -> Result<SessionOutcome> {
        self.cancel(node).await
    }

    /// Continue a stopped (or resumably failed) session. New content is
    /// appended to what the node already holds.
    #[tracing::instrument(skip(self), name = "session.continue")]
    pub async fn continue_session(&self, node: &NodeId) -> Result<()> {
        let (checkpoint, phase) = match self.inner.sessions.get(node) {
            Some(slot) => (slot.session.checkpoint.clone(), slot.phase),
            None => {
                let cp = self
                    .inner
                    .checkpoints
                    .load(node)?
                    .ok_or(SessionError::NoCheckpoint(*node))?;
                let phase = cp.phase;
                (cp, phase)
            }
        };
        if phase.is_active() {
            return Err(SessionError::AlreadyActive(*node));
        }
        if !phase.is_continuable() {
            return Err(SessionError::NoCheckpoint(*node));
        }
        if phase == SessionPhase::Failed && !checkpoint.is_durable() {
            return Err(SessionError::NotResumable(*node));
        }
        let feature = self.feature(&checkpoint.feature_id)?;
        if !feature.resumable {
            return Err(SessionError::NotResumable(*node));
        }
        let current = self
            .inner
            .graph
            .node(node)
            .ok_or(GraphError::NotFound(*node))?;

        let mut checkpoint = checkpoint;
        checkpoint.content = current.content;
        self.relaunch(checkpoint, &feature, phase == SessionPhase::Failed, false)
    }

    /// Drop the session and its checkpoint. Running sessions are cancelled
    /// first, so the node keeps whatever content it had.
    #[tracing::instrument(skip(self), name = "session.discard")]
    pub async fn discard(&self, node: &NodeId) -> Result<()> {
        if self.is_active(node) {
            self.cancel(node).await?;
        }
        let had_session = self.unregister(node).is_some();
        self.inner.checkpoints.delete(node)?;
        self.clear_continue_markers(node)?;
        if had_session {
            tracing::debug!(%node, "session discarded");
            self.inner
                .graph
                .publish_session(*node, SessionPhase::Discarded, false);
        }
        Ok(())
    }

    /// Delete a node, clearing any session bound to it first.
    pub async fn remove_node(&self, node: &NodeId) -> Result<()> {
        self.discard(node).await?;
        self.inner.graph.remove_node(node)?;
        self.inner.persist_graph();
        Ok(())
    }

    // =========================================================================
    // Resume entry points
    // =========================================================================

    /// Reopen the stream of a task that is still running upstream. The node
    /// content is reset to the checkpoint, which is where the stream resumes.
    pub(crate) fn reattach(&self, checkpoint: Checkpoint) -> Result<()> {
        let feature = self.feature(&checkpoint.feature_id)?;
        self.relaunch(checkpoint, &feature, true, true)
    }

    /// Re-register a paused session without driving it.
    pub(crate) fn restore(&self, checkpoint: Checkpoint) -> Result<()> {
        let phase = checkpoint.phase;
        self.insert_slot(StreamingSession::new(checkpoint), phase, false)
            .map(|_| ())
    }

    /// Drop the stopped marker and resumable flag once a node has no
    /// checkpoint left to continue from. Status and content are kept.
    pub(crate) fn clear_continue_markers(&self, node: &NodeId) -> Result<()> {
        let Some(current) = self.inner.graph.node(node) else {
            return Ok(());
        };
        let stopped = current.metadata.contains_key(meta::STOPPED);
        if !stopped && !current.is_resumable() {
            return Ok(());
        }
        self.inner.graph.update_node(
            node,
            &NodePatch::new()
                .unset(meta::STOPPED)
                .meta(meta::RESUMABLE, false),
        )?;
        tracing::debug!(%node, "cleared continue markers");
        Ok(())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn feature(&self, id: &str) -> Result<FeatureSpec> {
        self.inner
            .features
            .get(id)
            .filter(|f| f.enabled)
            .cloned()
            .ok_or_else(|| SessionError::UnknownFeature(id.to_string()))
    }

    fn insert_slot(
        &self,
        session: StreamingSession,
        phase: SessionPhase,
        driven: bool,
    ) -> Result<(u64, CancellationToken)> {
        use dashmap::mapref::entry::Entry;

        let node = session.node_id;
        match self.inner.sessions.entry(node) {
            Entry::Occupied(_) => Err(SessionError::AlreadyActive(node)),
            Entry::Vacant(vacant) => {
                let epoch = self.inner.epochs.fetch_add(1, Ordering::SeqCst) + 1;
                let token = session.token.clone();
                vacant.insert(Slot::new(session, epoch, phase, driven));
                Ok((epoch, token))
            }
        }
    }

    fn drop_slot(&self, node: &NodeId, epoch: u64) {
        self.inner
            .sessions
            .remove_if(node, |_, slot| slot.epoch == epoch);
    }

    /// Persist the checkpoint and move the node into `Streaming`.
    fn begin(&self, node: &NodeId, patch: &NodePatch, checkpoint: &Checkpoint) -> Result<()> {
        self.inner.checkpoints.save(checkpoint)?;
        if let Err(e) = self.inner.graph.update_node(node, patch) {
            // Best effort; the slot is being dropped anyway.
            let _ = self.inner.checkpoints.delete(node);
            return Err(e.into());
        }
        self.inner
            .graph
            .publish_session(*node, SessionPhase::Active, false);
        Ok(())
    }

    fn relaunch(
        &self,
        mut checkpoint: Checkpoint,
        feature: &FeatureSpec,
        resume_authority: bool,
        reset_content: bool,
    ) -> Result<()> {
        let node = checkpoint.node_id;
        checkpoint.phase = SessionPhase::Active;
        checkpoint.touch();

        // Swap whatever paused record exists for a fresh driven one.
        if self.is_active(&node) {
            return Err(SessionError::AlreadyActive(node));
        }
        self.inner.sessions.remove(&node);
        let session = StreamingSession::new(checkpoint.clone());
        let (epoch, token) = self.insert_slot(session, SessionPhase::Active, true)?;

        let mut patch = NodePatch::new()
            .status(NodeStatus::Streaming)
            .unset(meta::STOPPED)
            .unset(meta::ERROR)
            .unset(meta::RESUMABLE);
        if reset_content {
            patch = patch.replace(checkpoint.content.clone());
        }
        if resume_authority {
            patch = patch.resuming();
        }
        if let Err(e) = self.begin(&node, &patch, &checkpoint) {
            self.drop_slot(&node, epoch);
            return Err(e);
        }

        tracing::info!(%node, content_len = checkpoint.content.len(), "session resumed");
        self.spawn(
            Run {
                node_id: node,
                epoch,
                token,
                checkpoint,
                feature_resumable: feature.resumable,
            },
            Launch::Resume,
        );
        Ok(())
    }

    fn spawn(&self, run: Run, launch: Launch) {
        let inner = self.inner.clone();
        let span = tracing::info_span!("session", node = %run.node_id);
        tokio::spawn(async move { inner.drive(run, launch).await }.instrument(span));
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("sessions", &self.inner.sessions.len())
            .finish_non_exhaustive()
    }
}

async fn within<T>(
    limit: Option<Duration>,
    fut: impl Future<Output = std::result::Result<T, BackendError>>,
) -> std::result::Result<T, BackendError> {
    match limit {
        Some(d) => tokio::time::timeout(d, fut)
            .await
            .unwrap_or(Err(BackendError::Timeout(d))),
        None => fut.await,
    }
}

async fn next_event(
    stream: &mut EventStream,
    limit: Option<Duration>,
) -> Option<std::result::Result<GenerationEvent, BackendError>> {
    match limit {
        Some(d) => tokio::time::timeout(d, stream.next())
            .await
            .unwrap_or(Some(Err(BackendError::Timeout(d)))),
        None => stream.next().await,
    }
}

impl Inner {
    async fn drive(self: Arc<Self>, mut run: Run, launch: Launch) -> SessionOutcome {
        let limit = self.config.chunk_timeout();

        let opened = tokio::select! {
            biased;
            _ = run.token.cancelled() => return self.finish_stopped(&mut run),
            handle = within(limit, async {
                match launch {
                    Launch::Start => self.backend.start(&run.checkpoint.request).await,
                    Launch::Resume => self.backend.resume(&run.checkpoint).await,
                }
            }) => handle,
        };
        let handle = match opened {
            Ok(handle) => handle,
            Err(e) => return self.finish_failed(&mut run, e),
        };
        match self.bind(&mut run, &handle) {
            Ok(()) => {}
            Err(Halt::Superseded) => return self.superseded(&run),
            Err(Halt::Graph(e)) => return self.abandon(&mut run, e),
        }

        let opened = tokio::select! {
            biased;
            _ = run.token.cancelled() => return self.finish_stopped(&mut run),
            stream = within(limit, self.backend.stream(&handle)) => stream,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => return self.finish_failed(&mut run, e),
        };

        loop {
            let item = tokio::select! {
                biased;
                _ = run.token.cancelled() => return self.finish_stopped(&mut run),
                item = next_event(&mut stream, limit) => item,
            };
            let event = match item {
                None => return self.finish_completed(&mut run, None),
                Some(Err(e)) => return self.finish_failed(&mut run, e),
                Some(Ok(event)) => event,
            };
            let applied = match event {
                GenerationEvent::ContentDelta(text) => self.apply_delta(&mut run, &text),
                GenerationEvent::Status(line) => self.apply_status(&run, line),
                GenerationEvent::Sources(sources) => self.merge_sources(&run, sources),
                GenerationEvent::Error(reason) => {
                    return self.finish_failed(&mut run, BackendError::Upstream(reason));
                }
                GenerationEvent::Done { content } => {
                    return self.finish_completed(&mut run, content);
                }
            };
            match applied {
                Ok(()) => {}
                Err(Halt::Superseded) => return self.superseded(&run),
                Err(Halt::Graph(e)) => return self.abandon(&mut run, e),
            }
        }
    }

    /// Run `f` only while this driver's slot is still registered. The slot
    /// guard is held across `f`, so `f` must not touch `self.sessions`.
    fn owned<R>(&self, node: NodeId, epoch: u64, f: impl FnOnce() -> R) -> Option<R> {
        let slot = self.sessions.get(&node)?;
        if slot.epoch != epoch {
            return None;
        }
        let result = f();
        drop(slot);
        Some(result)
    }

    /// The slot was unregistered or replaced. Leave without writing.
    fn superseded(&self, run: &Run) -> SessionOutcome {
        tracing::debug!(node = %run.node_id, epoch = run.epoch, "session superseded");
        run.token.cancel();
        SessionOutcome::Discarded
    }

    fn bind(&self, run: &mut Run, handle: &TaskHandle) -> std::result::Result<(), Halt> {
        let (node, epoch) = (run.node_id, run.epoch);
        let key = if handle.durable {
            meta::UPSTREAM_TASK_ID
        } else {
            meta::LOCAL_TASK_ID
        };
        self.owned(node, epoch, || {
            self.graph
                .stream_update(&node, &NodePatch::new().meta(key, handle.id.clone()))?;
            run.checkpoint.bind(handle);
            self.save_checkpoint(run);
            self.persist_graph();
            Ok::<_, GraphError>(())
        })
        .ok_or(Halt::Superseded)??;
        tracing::debug!(%node, task = %handle.id, durable = handle.durable, "bound task handle");
        Ok(())
    }

    fn apply_delta(&self, run: &mut Run, text: &str) -> std::result::Result<(), Halt> {
        let (node, epoch) = (run.node_id, run.epoch);
        let every = self.config.checkpoint_interval.max(1);
        self.owned(node, epoch, || {
            self.graph
                .stream_update(&node, &NodePatch::new().append(text))?;
            run.checkpoint.content.push_str(text);
            run.checkpoint.deltas += 1;
            if run.checkpoint.deltas % every == 0 {
                self.save_checkpoint(run);
            }
            Ok::<_, GraphError>(())
        })
        .ok_or(Halt::Superseded)??;
        Ok(())
    }

    fn apply_status(&self, run: &Run, line: String) -> std::result::Result<(), Halt> {
        let node = run.node_id;
        self.owned(node, run.epoch, || {
            self.graph
                .stream_update(&node, &NodePatch::new().meta(meta::STATUS_MESSAGE, line))
                .map(|_| ())
        })
        .ok_or(Halt::Superseded)??;
        Ok(())
    }

    fn merge_sources(
        &self,
        run: &Run,
        incoming: Vec<crate::sources::Source>,
    ) -> std::result::Result<(), Halt> {
        let node = run.node_id;
        self.owned(node, run.epoch, || {
            let current = self.graph.node(&node).ok_or(GraphError::NotFound(node))?;
            let mut sources = SourceSet::from_value(current.metadata.get(meta::SOURCES));
            if sources.extend(incoming) > 0 {
                self.graph.stream_update(
                    &node,
                    &NodePatch::new().meta(meta::SOURCES, sources.to_value()),
                )?;
            }
            Ok::<_, GraphError>(())
        })
        .ok_or(Halt::Superseded)??;
        Ok(())
    }

    fn save_checkpoint(&self, run: &mut Run) {
        run.checkpoint.touch();
        if let Err(e) = self.checkpoints.save(&run.checkpoint) {
            tracing::warn!(node = %run.node_id, error = %e, "failed to save checkpoint");
        }
    }

    fn delete_checkpoint(&self, node: &NodeId) {
        if let Err(e) = self.checkpoints.delete(node) {
            tracing::warn!(%node, error = %e, "failed to delete checkpoint");
        }
    }

    fn persist_graph(&self) {
        if let Err(e) = self.graph.persist() {
            tracing::warn!(error = %e, "failed to persist graph snapshot");
        }
    }

    fn write_terminal(&self, run: &Run, patch: NodePatch) {
        if let Err(e) = self.graph.stream_update(&run.node_id, &patch) {
            tracing::warn!(node = %run.node_id, error = %e, "failed to write terminal node state");
        }
    }

    /// Record the final phase on the slot this driver owns. Kept slots stay
    /// registered for continue; others are removed.
    fn settle(&self, run: &Run, phase: SessionPhase, outcome: SessionOutcome, keep: bool) {
        if keep {
            if let Some(mut slot) = self.sessions.get_mut(&run.node_id)
                && slot.epoch == run.epoch
            {
                slot.session.checkpoint = run.checkpoint.clone();
                slot.phase = phase;
                slot.done.send_replace(Some(outcome));
            }
        } else if let Some((_, slot)) = self
            .sessions
            .remove_if(&run.node_id, |_, slot| slot.epoch == run.epoch)
        {
            slot.done.send_replace(Some(outcome));
        }
    }

    fn finish_stopped(&self, run: &mut Run) -> SessionOutcome {
        let (node, epoch) = (run.node_id, run.epoch);
        let written = self.owned(node, epoch, || {
            self.write_terminal(
                run,
                NodePatch::new()
                    .status(NodeStatus::Stopped)
                    .meta(meta::STOPPED, true),
            );
            if let Some(current) = self.graph.node(&node) {
                run.checkpoint.content = current.content;
            }
            run.checkpoint.phase = SessionPhase::Stopped;
            self.save_checkpoint(run);
            self.persist_graph();
        });
        if written.is_none() {
            return self.superseded(run);
        }
        tracing::debug!(%node, "session stopped by user");
        self.settle(run, SessionPhase::Stopped, SessionOutcome::Stopped, true);
        self.graph
            .publish_session(run.node_id, SessionPhase::Stopped, run.feature_resumable);
        SessionOutcome::Stopped
    }

    fn finish_completed(&self, run: &mut Run, content: Option<String>) -> SessionOutcome {
        let mut patch = NodePatch::new()
            .status(NodeStatus::Completed)
            .unset(meta::STOPPED)
            .unset(meta::STATUS_MESSAGE);
        if let Some(content) = content {
            patch = patch.replace(content);
        }
        let written = self.owned(run.node_id, run.epoch, || {
            self.write_terminal(run, patch);
            self.delete_checkpoint(&run.node_id);
            self.persist_graph();
        });
        if written.is_none() {
            return self.superseded(run);
        }
        run.checkpoint.phase = SessionPhase::Completed;
        self.settle(run, SessionPhase::Completed, SessionOutcome::Completed, false);
        self.graph
            .publish_session(run.node_id, SessionPhase::Completed, false);
        tracing::info!(node = %run.node_id, deltas = run.checkpoint.deltas, "session completed");
        SessionOutcome::Completed
    }

    fn finish_failed(&self, run: &mut Run, error: BackendError) -> SessionOutcome {
        let (node, epoch) = (run.node_id, run.epoch);
        let resumable = run.checkpoint.is_durable() && run.feature_resumable;
        let written = self.owned(node, epoch, || {
            self.write_terminal(
                run,
                NodePatch::new()
                    .status(NodeStatus::Failed)
                    .meta(meta::ERROR, error.to_string())
                    .meta(meta::RESUMABLE, resumable),
            );
            run.checkpoint.phase = SessionPhase::Failed;
            if resumable {
                if let Some(current) = self.graph.node(&node) {
                    run.checkpoint.content = current.content;
                }
                self.save_checkpoint(run);
            } else {
                self.delete_checkpoint(&node);
            }
            self.persist_graph();
        });
        if written.is_none() {
            return self.superseded(run);
        }
        tracing::warn!(%node, error = %error, resumable, "session failed");
        let outcome = SessionOutcome::Failed { resumable };
        self.settle(run, SessionPhase::Failed, outcome.clone(), resumable);
        self.graph
            .publish_session(run.node_id, SessionPhase::Failed, resumable);
        outcome
    }

    /// The node went away or rejected a write (removed or finalized by a
    /// merge). Nothing more can be written.
    fn abandon(&self, run: &mut Run, error: GraphError) -> SessionOutcome {
        run.token.cancel();
        let written = self.owned(run.node_id, run.epoch, || {
            self.delete_checkpoint(&run.node_id);
        });
        if written.is_none() {
            return self.superseded(run);
        }
        tracing::warn!(node = %run.node_id, error = %error, "session abandoned");
        self.settle(run, SessionPhase::Discarded, SessionOutcome::Discarded, false);
        self.graph
            .publish_session(run.node_id, SessionPhase::Discarded, false);
        SessionOutcome::Discarded
    }
}
