// Dotlanth
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

// Engine configuration
// Loaded from JSON; every field falls back to its default when omitted.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Errors raised while loading or validating a configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Record buffer pool options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferPoolConfig {
    /// Maximum number of segments that may be checked out at once
    pub size_limit: usize,
    /// Maximum number of released segments kept for reuse
    pub reuse_limit: usize,
    /// Number of undo records a single segment holds
    pub segment_capacity: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            size_limit: 100_000,
            reuse_limit: 10_000,
            segment_capacity: 32,
        }
    }
}

/// Garbage collector options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Whether the background collector thread is started.
    /// When disabled, watermarks are still tracked and reclamation only
    /// happens when a caller drives the collector by hand.
    pub enabled: bool,
    /// Pause between two background collection passes, in milliseconds
    pub interval_ms: u64,
}

impl GcConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self { enabled: true, interval_ms: 10 }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub buffer_pool: BufferPoolConfig,
    pub gc: GcConfig,
    /// Number of independently latched shards in the active transaction set
    pub active_set_shards: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_pool: BufferPoolConfig::default(),
            gc: GcConfig::default(),
            active_set_shards: 16,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a configuration from a JSON string
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a configuration file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!("Loading engine configuration from {}", path.display());
        let contents = fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// A configuration with the background collector turned off
    pub fn with_gc_disabled(mut self) -> Self {
        self.gc.enabled = false;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_pool.size_limit == 0 {
            return Err(ConfigError::Invalid("buffer_pool.size_limit must be positive".to_string()));
        }
        if self.buffer_pool.segment_capacity == 0 {
            return Err(ConfigError::Invalid("buffer_pool.segment_capacity must be positive".to_string()));
        }
        if self.buffer_pool.reuse_limit > self.buffer_pool.size_limit {
            return Err(ConfigError::Invalid(format!(
                "buffer_pool.reuse_limit ({}) exceeds size_limit ({})",
                self.buffer_pool.reuse_limit, self.buffer_pool.size_limit
            )));
        }
        if self.active_set_shards == 0 {
            return Err(ConfigError::Invalid("active_set_shards must be at least 1".to_string()));
        }
        if self.gc.enabled && self.gc.interval_ms == 0 {
            return Err(ConfigError::Invalid("gc.interval_ms must be positive when gc is enabled".to_string()));
        }
        Ok(())
    }
}
