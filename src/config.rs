use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// SQLite file backing the store. `None` keeps the store in memory.
    pub database_path: Option<PathBuf>,
    pub channel_name: String,
    pub channel_capacity: usize,
    pub cross_tab_enabled: bool,
    pub max_display_name_len: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            channel_name: "offline-patients".to_string(),
            channel_capacity: 256,
            cross_tab_enabled: true,
            max_display_name_len: 256,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_name.trim().is_empty() {
            return Err(ConfigError::Invalid("channel_name must not be empty".into()));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid("channel_capacity must be > 0".into()));
        }
        if self.max_display_name_len == 0 {
            return Err(ConfigError::Invalid(
                "max_display_name_len must be > 0".into(),
            ));
        }
        if let Some(path) = &self.database_path {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(
                    "database_path must not be empty when set".into(),
                ));
            }
        }
        Ok(())
    }
}
