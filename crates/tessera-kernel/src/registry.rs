//! Registry of generation features (pipelines).
//!
//! A feature is whatever owns a node's content while it generates: plain
//! chat, deep research, web search. The registry is an explicit object handed
//! to the [`SessionController`](crate::SessionController); nothing registers
//! itself globally.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Shipped with the kernel.
pub const PRIORITY_BUILTIN: u32 = 100;
/// First-party add-ons.
pub const PRIORITY_OFFICIAL: u32 = 50;
/// Everything else.
pub const PRIORITY_COMMUNITY: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub id: String,
    pub label: String,
    pub priority: u32,
    pub enabled: bool,
    /// Whether stopped or failed sessions of this feature can be continued.
    pub resumable: bool,
}

impl FeatureSpec {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            priority: PRIORITY_COMMUNITY,
            enabled: true,
            resumable: true,
        }
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn not_resumable(mut self) -> Self {
        self.resumable = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("feature id must not be empty")]
    EmptyId,

    #[error("feature already registered: {0}")]
    Duplicate(String),
}

#[derive(Debug, Clone, Default)]
pub struct FeatureRegistry {
    features: BTreeMap<String, FeatureSpec>,
}

impl FeatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chat, research and search, all at builtin priority.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for spec in [
            FeatureSpec::new("chat", "Chat").priority(PRIORITY_BUILTIN),
            FeatureSpec::new("research", "Deep research").priority(PRIORITY_BUILTIN),
            FeatureSpec::new("search", "Web search")
                .priority(PRIORITY_BUILTIN)
                .not_resumable(),
        ] {
            // Ids above are distinct and non-empty.
            let _ = registry.register(spec);
        }
        registry
    }

    pub fn register(&mut self, spec: FeatureSpec) -> Result<(), RegistryError> {
        if spec.id.trim().is_empty() {
            return Err(RegistryError::EmptyId);
        }
        if self.features.contains_key(&spec.id) {
            return Err(RegistryError::Duplicate(spec.id));
        }
        tracing::debug!(feature = %spec.id, priority = spec.priority, "registered feature");
        self.features.insert(spec.id.clone(), spec);
        Ok(())
    }

    pub fn with(mut self, spec: FeatureSpec) -> Result<Self, RegistryError> {
        self.register(spec)?;
        Ok(self)
    }

    pub fn get(&self, id: &str) -> Option<&FeatureSpec> {
        self.features.get(id)
    }

    /// Enabled features, highest priority first, then by id.
    pub fn enabled(&self) -> Vec<&FeatureSpec> {
        let mut enabled: Vec<_> = self.features.values().filter(|f| f.enabled).collect();
        enabled.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        enabled
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_validation() {
        let mut registry = FeatureRegistry::new();
        assert_eq!(
            registry.register(FeatureSpec::new("  ", "blank")),
            Err(RegistryError::EmptyId)
        );
        registry.register(FeatureSpec::new("chat", "Chat")).unwrap();
        assert_eq!(
            registry.register(FeatureSpec::new("chat", "Again")),
            Err(RegistryError::Duplicate("chat".into()))
        );
    }

    #[test]
    fn test_enabled_sorted_by_priority() {
        let registry = FeatureRegistry::builtin()
            .with(FeatureSpec::new("plugin", "Plugin"))
            .unwrap()
            .with(FeatureSpec::new("beta", "Beta").priority(PRIORITY_OFFICIAL).disabled())
            .unwrap()
            .with(FeatureSpec::new("images", "Images").priority(PRIORITY_OFFICIAL))
            .unwrap();

        let ids: Vec<_> = registry.enabled().iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["chat", "research", "search", "images", "plugin"]);
        assert!(!registry.get("search").unwrap().resumable);
    }
}
