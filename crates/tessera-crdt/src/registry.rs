//! Explicit registry of custom node kinds.
//!
//! Passed into each [`GraphStore`](crate::GraphStore) at construction, so
//! independent graphs (and tests) never share registration state.

use std::collections::BTreeSet;

use tessera_types::NodeKind;

use crate::GraphError;

#[derive(Debug, Clone, Default)]
pub struct KindRegistry {
    custom: BTreeSet<String>,
}

impl KindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a custom kind name. Built-in names are rejected.
    pub fn register(&mut self, name: impl Into<String>) -> Result<(), GraphError> {
        let name = name.into();
        if name.is_empty() || !NodeKind::from_str(&name).is_custom() {
            return Err(GraphError::UnknownKind(name));
        }
        self.custom.insert(name);
        Ok(())
    }

    pub fn with(mut self, name: impl Into<String>) -> Result<Self, GraphError> {
        self.register(name)?;
        Ok(self)
    }

    /// Whether local writes may create nodes of `kind`.
    pub fn allows(&self, kind: &NodeKind) -> bool {
        match kind {
            NodeKind::Custom(name) => self.custom.contains(name),
            _ => true,
        }
    }

    pub fn custom_kinds(&self) -> impl Iterator<Item = &str> {
        self.custom.iter().map(String::as_str)
    }
}
