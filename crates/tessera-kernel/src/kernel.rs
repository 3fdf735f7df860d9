//! The Kernel: one graph, its sessions, and where they persist.
//!
//! A kernel owns:
//! - The shared graph and its flow bus
//! - The session controller (and through it the backend and features)
//! - The key-value store both snapshot into

use std::sync::Arc;

use tessera_crdt::{KindRegistry, ReplicaId};

use crate::backend::GenerationBackend;
use crate::config::{ConfigError, KernelConfig};
use crate::db::SqliteKv;
use crate::flows::FlowBus;
use crate::graph::{DEFAULT_GRAPH, SharedGraph};
use crate::persist::{CheckpointStore, GraphSnapshots, MemoryKv, PersistError, SharedKv};
use crate::registry::FeatureRegistry;
use crate::resume::{ResumeCoordinator, ResumeReport};
use crate::session::{SessionController, SessionError};

#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

pub struct Kernel {
    kv: SharedKv,
    graph: Arc<SharedGraph>,
    sessions: SessionController,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("graph", &self.graph)
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}

impl Kernel {
    /// Open the store named by `config.db_path` (in memory when unset) and
    /// load the default graph from it.
    ///
    /// Does not reconcile checkpoints; call [`resume`](Self::resume) once
    /// the caller is ready for sessions to start streaming.
    pub fn open(
        config: KernelConfig,
        backend: Arc<dyn GenerationBackend>,
        features: FeatureRegistry,
        kinds: KindRegistry,
    ) -> Result<Self, KernelError> {
        config.validate()?;
        let kv: SharedKv = match &config.db_path {
            Some(path) => Arc::new(SqliteKv::open(path)?),
            None => Arc::new(MemoryKv::new()),
        };
        Self::with_kv(kv, config, backend, features, kinds)
    }

    /// Build a kernel over an already-open store.
    pub fn with_kv(
        kv: SharedKv,
        config: KernelConfig,
        backend: Arc<dyn GenerationBackend>,
        features: FeatureRegistry,
        kinds: KindRegistry,
    ) -> Result<Self, KernelError> {
        let replica = ReplicaId::new();
        let graph = Arc::new(SharedGraph::load(
            GraphSnapshots::new(kv.clone()),
            DEFAULT_GRAPH,
            replica,
            Arc::new(kinds),
            FlowBus::new(config.event_capacity),
        )?);
        let sessions = SessionController::new(
            graph.clone(),
            backend,
            Arc::new(features),
            CheckpointStore::new(kv.clone()),
            config,
        );
        tracing::info!(replica = %replica.short(), "kernel opened");
        Ok(Self {
            kv,
            graph,
            sessions,
        })
    }

    pub fn graph(&self) -> &Arc<SharedGraph> {
        &self.graph
    }

    pub fn sessions(&self) -> &SessionController {
        &self.sessions
    }

    pub fn kv(&self) -> &SharedKv {
        &self.kv
    }

    pub fn config(&self) -> &KernelConfig {
        self.sessions.config()
    }

    /// Reconcile checkpoints left by a previous process.
    pub async fn resume(&self) -> Result<ResumeReport, KernelError> {
        Ok(ResumeCoordinator::new(self.sessions.clone())
            .reconcile()
            .await?)
    }

    /// Snapshot the graph now.
    pub fn persist(&self) -> Result<(), KernelError> {
        Ok(self.graph.persist()?)
    }
}
