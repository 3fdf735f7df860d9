//! Typed identifiers for nodes, edges, and replicas.
//!
//! All ID types wrap UUIDv7 (time-ordered, globally unique), so sorting IDs
//! recovers creation order without consulting any other field. They display
//! as standard UUID text for logging. The `short()` form (first 8 hex chars)
//! is for human-facing output only, never used as a lookup key.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A graph node identifier (UUIDv7).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(uuid::Uuid);

/// A graph edge identifier (UUIDv7).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeId(uuid::Uuid);

/// A replica identifier (UUIDv7): one per open tab, device, or process that
/// writes to a graph. Breaks revision ties between concurrent writers.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(uuid::Uuid);

// ── Shared behavior ─────────────────────────────────────────────────────────

macro_rules! impl_typed_id {
    ($T:ident, $name:literal) => {
        impl $T {
            /// Create a new time-ordered ID (UUIDv7).
            pub fn new() -> Self {
                Self(uuid::Uuid::now_v7())
            }

            /// First 8 hex characters, for display only.
            pub fn short(&self) -> String {
                self.0.as_simple().to_string()[..8].to_string()
            }

            /// Full 32-character hex string (no hyphens).
            pub fn to_hex(&self) -> String {
                self.0.as_simple().to_string()
            }

            /// The raw 16 bytes.
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }

            /// Reconstruct from 16 bytes.
            pub fn from_bytes(b: [u8; 16]) -> Self {
                Self(uuid::Uuid::from_bytes(b))
            }

            /// Parse from a hex string (32 chars, no hyphens) or standard UUID format.
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                uuid::Uuid::parse_str(s).map(Self)
            }

            /// Check if a query string matches this ID by hex prefix.
            pub fn matches_hex_prefix(&self, prefix: &str) -> bool {
                self.to_hex().starts_with(prefix)
            }

            /// A nil (all-zero) id for sentinel values.
            pub fn nil() -> Self {
                Self(uuid::Uuid::nil())
            }

            /// Check if this is the nil ID.
            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }
        }

        impl Default for $T {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<uuid::Uuid> for $T {
            fn from(u: uuid::Uuid) -> Self {
                Self(u)
            }
        }

        impl From<$T> for uuid::Uuid {
            fn from(id: $T) -> uuid::Uuid {
                id.0
            }
        }

        impl fmt::Display for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                // Full UUID with hyphens for log readability
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $name, self.short())
            }
        }

        impl std::str::FromStr for $T {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }
    };
}

impl_typed_id!(NodeId, "NodeId");
impl_typed_id!(EdgeId, "EdgeId");
impl_typed_id!(ReplicaId, "ReplicaId");

// ── Prefix resolution ───────────────────────────────────────────────────────

/// Error from prefix resolution.
#[derive(Debug, thiserror::Error)]
pub enum PrefixError {
    #[error("no match for prefix '{0}'")]
    NoMatch(String),
    #[error("ambiguous prefix '{prefix}': matches {candidates:?}")]
    Ambiguous {
        prefix: String,
        candidates: Vec<String>,
    },
}

/// Resolve a hex prefix against a set of node IDs.
///
/// Exact full-hex matches win; otherwise the prefix must be unique.
pub fn resolve_node_prefix(
    ids: impl Iterator<Item = NodeId>,
    query: &str,
) -> Result<NodeId, PrefixError> {
    let query = query.replace('-', "");
    let matches: Vec<NodeId> = ids.filter(|id| id.matches_hex_prefix(&query)).collect();

    if let Some(exact) = matches.iter().find(|id| id.to_hex() == query) {
        return Ok(*exact);
    }

    match matches.len() {
        0 => Err(PrefixError::NoMatch(query)),
        1 => Ok(matches[0]),
        _ => Err(PrefixError::Ambiguous {
            prefix: query,
            candidates: matches.iter().map(|id| id.short()).collect(),
        }),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_unique() {
        let a = NodeId::new();
        let b = NodeId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_creation_order_is_recoverable() {
        let ids: Vec<NodeId> = (0..64).map(|_| NodeId::new()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn test_short_and_hex_lengths() {
        let id = EdgeId::new();
        assert_eq!(id.short().len(), 8);
        assert_eq!(id.to_hex().len(), 32);
    }

    #[test]
    fn test_parse_hex_and_hyphenated() {
        let id = ReplicaId::new();
        assert_eq!(ReplicaId::parse(&id.to_hex()).unwrap(), id);
        assert_eq!(ReplicaId::parse(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn test_serde_is_transparent() {
        let id = NodeId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_resolve_unique_prefix() {
        let a = NodeId::from(uuid::uuid!("aaaa0000-0000-7000-8000-000000000000"));
        let b = NodeId::from(uuid::uuid!("bbbb0000-0000-7000-8000-000000000000"));
        let got = resolve_node_prefix([a, b].into_iter(), "bb").unwrap();
        assert_eq!(got, b);
    }

    #[test]
    fn test_resolve_ambiguous_and_missing() {
        let a = NodeId::from(uuid::uuid!("abcd0000-0000-7000-8000-000000000000"));
        let b = NodeId::from(uuid::uuid!("abce0000-0000-7000-8000-000000000000"));
        assert!(matches!(
            resolve_node_prefix([a, b].into_iter(), "abc"),
            Err(PrefixError::Ambiguous { .. })
        ));
        assert!(matches!(
            resolve_node_prefix([a, b].into_iter(), "ff"),
            Err(PrefixError::NoMatch(_))
        ));
    }
}
