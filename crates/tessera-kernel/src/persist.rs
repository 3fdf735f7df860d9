//! Durable key-value storage for graph snapshots and session checkpoints.
//!
//! The kernel only needs `get`/`put`/`delete`/`list_by_prefix`. Anything that
//! can do those four (SQLite, an in-memory map, browser storage behind a
//! bridge) can back it.
//!
//! Key layout:
//!
//! | Prefix               | Value                          |
//! |----------------------|--------------------------------|
//! | `graph/<name>`       | `GraphState` as JSON            |
//! | `checkpoint/<node>`  | [`Checkpoint`] as JSON          |

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tessera_crdt::GraphState;
use tessera_types::NodeId;

use crate::checkpoint::Checkpoint;

const GRAPH_PREFIX: &str = "graph/";
const CHECKPOINT_PREFIX: &str = "checkpoint/";

/// Errors from the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("corrupt entry {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Minimal durable key-value contract.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistError>;

    fn put(&self, key: &str, value: &[u8]) -> Result<(), PersistError>;

    /// Removing an absent key is not an error.
    fn delete(&self, key: &str) -> Result<(), PersistError>;

    /// All entries whose key starts with `prefix`, ordered by key.
    fn list_by_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, PersistError>;
}

pub type SharedKv = Arc<dyn KvStore>;

/// In-process store for tests and ephemeral tabs.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), PersistError> {
        self.entries.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), PersistError> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn list_by_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, PersistError> {
        Ok(self
            .entries
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

fn get_json<T: DeserializeOwned>(kv: &dyn KvStore, key: &str) -> Result<Option<T>, PersistError> {
    match kv.get(key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

fn put_json<T: Serialize>(kv: &dyn KvStore, key: &str, value: &T) -> Result<(), PersistError> {
    let bytes = serde_json::to_vec(value)?;
    kv.put(key, &bytes)
}

/// Named graph snapshots.
#[derive(Clone)]
pub struct GraphSnapshots {
    kv: SharedKv,
}

impl GraphSnapshots {
    pub fn new(kv: SharedKv) -> Self {
        Self { kv }
    }

    pub fn save(&self, name: &str, state: &GraphState) -> Result<(), PersistError> {
        put_json(self.kv.as_ref(), &format!("{GRAPH_PREFIX}{name}"), state)
    }

    pub fn load(&self, name: &str) -> Result<Option<GraphState>, PersistError> {
        get_json(self.kv.as_ref(), &format!("{GRAPH_PREFIX}{name}"))
    }

    pub fn names(&self) -> Result<Vec<String>, PersistError> {
        Ok(self
            .kv
            .list_by_prefix(GRAPH_PREFIX)?
            .into_iter()
            .map(|(k, _)| k[GRAPH_PREFIX.len()..].to_string())
            .collect())
    }
}

impl std::fmt::Debug for GraphSnapshots {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphSnapshots").finish_non_exhaustive()
    }
}

/// Session checkpoints keyed by node.
#[derive(Clone)]
pub struct CheckpointStore {
    kv: SharedKv,
}

impl CheckpointStore {
    pub fn new(kv: SharedKv) -> Self {
        Self { kv }
    }

    fn key(node: &NodeId) -> String {
        format!("{CHECKPOINT_PREFIX}{node}")
    }

    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), PersistError> {
        put_json(self.kv.as_ref(), &Self::key(&checkpoint.node_id), checkpoint)
    }

    pub fn load(&self, node: &NodeId) -> Result<Option<Checkpoint>, PersistError> {
        get_json(self.kv.as_ref(), &Self::key(node))
    }

    pub fn delete(&self, node: &NodeId) -> Result<(), PersistError> {
        self.kv.delete(&Self::key(node))
    }

    /// Every decodable checkpoint. Entries that fail to decode are skipped
    /// and returned separately so callers can report or purge them.
    pub fn list(&self) -> Result<(Vec<Checkpoint>, Vec<PersistError>), PersistError> {
        let mut checkpoints = Vec::new();
        let mut corrupt = Vec::new();
        for (key, bytes) in self.kv.list_by_prefix(CHECKPOINT_PREFIX)? {
            match serde_json::from_slice::<Checkpoint>(&bytes) {
                Ok(cp) => checkpoints.push(cp),
                Err(e) => {
                    tracing::warn!(%key, error = %e, "skipping undecodable checkpoint");
                    corrupt.push(PersistError::Corrupt {
                        key,
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok((checkpoints, corrupt))
    }

    /// Remove a raw key (used to purge corrupt entries).
    pub fn purge_key(&self, key: &str) -> Result<(), PersistError> {
        self.kv.delete(key)
    }
}

impl std::fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::GenerationRequest;
    use crate::checkpoint::SessionPhase;

    #[test]
    fn test_memory_kv_prefix_listing() {
        let kv = MemoryKv::new();
        kv.put("checkpoint/a", b"1").unwrap();
        kv.put("checkpoint/b", b"2").unwrap();
        kv.put("checkpoints", b"x").unwrap();
        kv.put("graph/main", b"{}").unwrap();

        let keys: Vec<_> = kv
            .list_by_prefix("checkpoint/")
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["checkpoint/a", "checkpoint/b"]);

        kv.delete("checkpoint/a").unwrap();
        kv.delete("checkpoint/a").unwrap();
        assert_eq!(kv.len(), 3);
    }

    #[test]
    fn test_checkpoint_store_roundtrip() {
        let kv: SharedKv = Arc::new(MemoryKv::new());
        let store = CheckpointStore::new(kv.clone());
        let node = NodeId::new();
        let mut cp = Checkpoint::new(node, "chat", GenerationRequest::new("chat", "hello"));
        cp.content = "partial".into();
        cp.phase = SessionPhase::Stopped;
        store.save(&cp).unwrap();

        let loaded = store.load(&node).unwrap().unwrap();
        assert_eq!(loaded, cp);

        kv.put("checkpoint/garbage", b"not json").unwrap();
        let (all, corrupt) = store.list().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(corrupt.len(), 1);

        store.delete(&node).unwrap();
        assert!(store.load(&node).unwrap().is_none());
    }

    #[test]
    fn test_graph_snapshots() {
        let kv: SharedKv = Arc::new(MemoryKv::new());
        let snapshots = GraphSnapshots::new(kv);
        assert!(snapshots.load("main").unwrap().is_none());

        snapshots.save("main", &GraphState::new()).unwrap();
        assert_eq!(snapshots.load("main").unwrap(), Some(GraphState::new()));
        assert_eq!(snapshots.names().unwrap(), vec!["main"]);
    }
}
