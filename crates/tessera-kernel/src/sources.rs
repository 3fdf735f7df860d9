//! Citation aggregation for generated nodes.
//!
//! Sources arrive in batches while a task streams. The set keeps first-seen
//! order and drops repeats by exact URL string; `https://a/` and `https://a`
//! are different sources.

use serde::{Deserialize, Serialize};

/// One cited source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl Source {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// Ordered, de-duplicated source list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceSet {
    items: Vec<Source>,
}

impl SourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the set stored in node metadata. Missing or malformed → empty.
    pub fn from_value(value: Option<&serde_json::Value>) -> Self {
        value
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(&self.items).unwrap_or(serde_json::Value::Null)
    }

    /// Insert unless the URL is already present. A later title fills in a
    /// missing one but never overwrites.
    pub fn insert(&mut self, source: Source) -> bool {
        if let Some(existing) = self.items.iter_mut().find(|s| s.url == source.url) {
            if existing.title.is_none() && source.title.is_some() {
                existing.title = source.title;
            }
            return false;
        }
        self.items.push(source);
        true
    }

    /// Returns how many new URLs were added.
    pub fn extend(&mut self, sources: impl IntoIterator<Item = Source>) -> usize {
        sources.into_iter().filter(|s| self.insert(s.clone())).count()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Source> {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_by_exact_url() {
        let mut set = SourceSet::new();
        assert!(set.insert(Source::new("https://example.com/a")));
        assert!(!set.insert(Source::new("https://example.com/a")));
        // Near-duplicates are distinct.
        assert!(set.insert(Source::new("https://example.com/a/")));
        assert!(set.insert(Source::new("https://example.com/a?utm=x")));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_title_fills_in_once() {
        let mut set = SourceSet::new();
        set.insert(Source::new("u"));
        set.insert(Source::new("u").with_title("First"));
        set.insert(Source::new("u").with_title("Second"));
        assert_eq!(set.iter().next().unwrap().title.as_deref(), Some("First"));
    }

    #[test]
    fn test_metadata_roundtrip_keeps_order() {
        let mut set = SourceSet::new();
        let added = set.extend([Source::new("b"), Source::new("a"), Source::new("b")]);
        assert_eq!(added, 2);

        let restored = SourceSet::from_value(Some(&set.to_value()));
        let urls: Vec<_> = restored.iter().map(|s| s.url.as_str()).collect();
        assert_eq!(urls, vec!["b", "a"]);

        assert!(SourceSet::from_value(Some(&serde_json::json!("nope"))).is_empty());
        assert!(SourceSet::from_value(None).is_empty());
    }
}
