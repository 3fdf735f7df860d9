//! Kernel configuration loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file) is valid:
//!
//! ```toml
//! staleness_window_secs = 3600
//! chunk_timeout_secs = 120      # 0 disables the per-chunk timeout
//! checkpoint_interval = 16
//! event_capacity = 1024
//! db_path = "tessera.db"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    /// Checkpoints idle longer than this are presumed abandoned on resume.
    pub staleness_window_secs: u64,
    /// Fail a session when no event arrives for this long. 0 = never.
    pub chunk_timeout_secs: u64,
    /// Persist the checkpoint every N content deltas.
    pub checkpoint_interval: u64,
    /// FlowBus channel capacity.
    pub event_capacity: usize,
    /// SQLite database path. `None` keeps everything in memory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            staleness_window_secs: 3600,
            chunk_timeout_secs: 120,
            checkpoint_interval: 16,
            event_capacity: 1024,
            db_path: None,
        }
    }
}

impl KernelConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: KernelConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.checkpoint_interval == 0 {
            return Err(ConfigError::InvalidValue {
                field: "checkpoint_interval",
                reason: "must be > 0".to_string(),
            });
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "event_capacity",
                reason: "must be > 0".to_string(),
            });
        }
        Ok(())
    }

    pub fn staleness_window(&self) -> Duration {
        Duration::from_secs(self.staleness_window_secs)
    }

    pub fn chunk_timeout(&self) -> Option<Duration> {
        (self.chunk_timeout_secs > 0).then(|| Duration::from_secs(self.chunk_timeout_secs))
    }

    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    pub fn with_chunk_timeout_secs(mut self, secs: u64) -> Self {
        self.chunk_timeout_secs = secs;
        self
    }

    pub fn with_staleness_window_secs(mut self, secs: u64) -> Self {
        self.staleness_window_secs = secs;
        self
    }

    pub fn with_checkpoint_interval(mut self, every: u64) -> Self {
        self.checkpoint_interval = every;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_default() {
        let config = KernelConfig::from_toml_str("").unwrap();
        assert_eq!(config, KernelConfig::default());
        assert_eq!(config.staleness_window(), Duration::from_secs(3600));
        assert_eq!(config.chunk_timeout(), Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_overrides() {
        let config = KernelConfig::from_toml_str(
            r#"
            staleness_window_secs = 60
            chunk_timeout_secs = 0
            db_path = "/tmp/tessera.db"
            "#,
        )
        .unwrap();
        assert_eq!(config.staleness_window_secs, 60);
        assert_eq!(config.chunk_timeout(), None);
        assert_eq!(config.db_path.as_deref(), Some(Path::new("/tmp/tessera.db")));
        assert_eq!(config.checkpoint_interval, 16);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            KernelConfig::from_toml_str("checkpoint_interval = 0"),
            Err(ConfigError::InvalidValue { field: "checkpoint_interval", .. })
        ));
        assert!(matches!(
            KernelConfig::from_toml_str("no_such_field = 1"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tessera.toml");
        std::fs::write(&path, "event_capacity = 8\n").unwrap();
        assert_eq!(KernelConfig::load(&path).unwrap().event_capacity, 8);
    }
}
