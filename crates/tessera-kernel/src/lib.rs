//! # tessera-kernel
//!
//! Generation sessions around the replicated graph.
//!
//! The kernel binds long-running generation tasks to graph nodes:
//! - Streams each task's deltas into its node as they arrive
//! - Stops, continues, and discards sessions on request
//! - Checkpoints progress so a restart can reattach to tasks still running
//!   upstream, or finish them from the upstream result
//! - Persists graph snapshots and checkpoints into a key-value store
//!   (SQLite or memory)
//!
//! Everything the UI needs arrives on the [`FlowBus`] owned by [`SharedGraph`].

pub mod backend;
pub mod checkpoint;
pub mod config;
pub mod db;
pub mod flows;
pub mod graph;
pub mod kernel;
pub mod persist;
pub mod registry;
pub mod resume;
pub mod session;
pub mod sources;

#[cfg(any(test, feature = "test-mock"))]
pub mod mock;

pub use backend::{
    BackendError, EventStream, FinalizedTask, GenerationBackend, GenerationEvent,
    GenerationRequest, TaskHandle, UpstreamStatus,
};
pub use checkpoint::{Checkpoint, SessionPhase};
pub use config::{ConfigError, KernelConfig};
pub use db::SqliteKv;
pub use flows::{FlowBus, FlowEvent, GraphFlow, OpSource, Subscription, matches_pattern};
pub use graph::{DEFAULT_GRAPH, SharedGraph};
pub use kernel::{Kernel, KernelError};
pub use persist::{CheckpointStore, GraphSnapshots, KvStore, MemoryKv, PersistError, SharedKv};
pub use registry::{
    FeatureRegistry, FeatureSpec, PRIORITY_BUILTIN, PRIORITY_COMMUNITY, PRIORITY_OFFICIAL,
    RegistryError,
};
pub use resume::{ResumeCoordinator, ResumeReport};
pub use session::{SessionController, SessionError, SessionOutcome, StreamingSession};
pub use sources::{Source, SourceSet};
