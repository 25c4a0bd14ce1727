use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;
use crate::location::LocationGenerator;

pub const DEFAULT_STORE_FILE_NAME: &str = "index";
pub const DEFAULT_FLUSH_THRESHOLD: usize = 20;

/// Resolved settings for bucket stores.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexConfig {
    /// Root directory holding one sub-directory per bucket.
    pub base_path: PathBuf,
    /// Engine directory name inside each bucket directory.
    #[serde(default = "default_store_file_name")]
    pub store_file_name: String,
    /// Maximum records per engine flush.
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,
    /// fsync the journal after every flush.
    #[serde(default)]
    pub sync_on_flush: bool,
}

fn default_store_file_name() -> String {
    DEFAULT_STORE_FILE_NAME.to_string()
}

fn default_flush_threshold() -> usize {
    DEFAULT_FLUSH_THRESHOLD
}

impl IndexConfig {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            store_file_name: default_store_file_name(),
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            sync_on_flush: false,
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_threshold == 0 {
            return Err(ConfigError::Invalid(
                "flush_threshold must be at least 1".into(),
            ));
        }
        if self.store_file_name.is_empty() {
            return Err(ConfigError::Invalid("store_file_name is empty".into()));
        }
        if self.store_file_name.contains(['/', '\\']) {
            return Err(ConfigError::Invalid(format!(
                "store_file_name {:?} must not contain path separators",
                self.store_file_name
            )));
        }
        Ok(())
    }

    pub fn location_generator(&self) -> LocationGenerator {
        LocationGenerator::new(&self.base_path, &self.store_file_name)
    }
}
