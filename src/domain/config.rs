//! Server-side channel configuration
//!
//! The owning server supplies these values once, at `initialize` time.
//! Field names on disk match the server's option names exactly
//! (`ComReadBufferSize`, `ComReadTimeout`, ...). Timeouts and the loop
//! interval are in milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{ChannelError, ChannelResult};

/// COM options of the owning server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ComConfig {
    /// Size of the read buffer allocated by the channel
    pub com_read_buffer_size: usize,
    /// Per-call timeout for bounded reads (ms)
    pub com_read_timeout: u64,
    /// Largest chunk handed to a single bounded write
    pub com_write_buffer_size: usize,
    /// Per-call timeout for bounded writes (ms)
    pub com_write_timeout: u64,
    /// Pacing delay applied once per `read()` (ms)
    pub com_loop_interval: u64,
}

impl Default for ComConfig {
    fn default() -> Self {
        Self {
            com_read_buffer_size: 1024,
            com_read_timeout: 1000,
            com_write_buffer_size: 1024,
            com_write_timeout: 1000,
            com_loop_interval: 1000,
        }
    }
}

impl ComConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.com_read_timeout)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.com_write_timeout)
    }

    pub fn loop_interval(&self) -> Duration {
        Duration::from_millis(self.com_loop_interval)
    }

    /// Reject values the channel cannot operate with.
    pub fn validate(&self) -> ChannelResult<()> {
        if self.com_read_buffer_size == 0 {
            return Err(ChannelError::Config(
                "ComReadBufferSize must be greater than zero".to_string(),
            ));
        }
        if self.com_write_buffer_size == 0 {
            return Err(ChannelError::Config(
                "ComWriteBufferSize must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Load and validate a configuration from a JSON file.
    pub fn load(path: &Path) -> ChannelResult<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            ChannelError::Config(format!("Failed to read config '{}': {e}", path.display()))
        })?;
        let config: ComConfig = serde_json::from_str(&json).map_err(|e| {
            ChannelError::Config(format!("Failed to parse config '{}': {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty JSON.
    pub fn save(&self, path: &Path) -> ChannelResult<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ChannelError::Config(format!("Serialization error: {e}")))?;
        std::fs::write(path, json).map_err(|e| {
            ChannelError::Config(format!("Failed to write config '{}': {e}", path.display()))
        })
    }
}
