//! Engine configuration.

use std::path::Path;
use std::time::Duration;

use driveup_transfer::ChunkLimits;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Errors from loading or validating an [`EngineConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Tunables of the upload engine.
///
/// Every field has a default, so a config file only needs the keys it
/// overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub limits: ChunkLimits,
    /// Minimum delay between two progress updates.
    pub progress_interval_ms: u64,
    /// Attempts per chunk before a transport failure escapes the engine.
    pub max_chunk_attempts: u32,
    /// Base of the linear backoff between chunk attempts.
    pub chunk_retry_delay_ms: u64,
    /// Session restarts allowed within one `upload` call.
    pub max_session_restarts: u32,
    /// Age after which a persisted session is no longer resumed.
    pub session_ttl_secs: u64,
    /// Retry hint attached to `LockError` failures.
    pub lock_retry_delay_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            limits: ChunkLimits::default(),
            progress_interval_ms: 200,
            max_chunk_attempts: 3,
            chunk_retry_delay_ms: 500,
            max_session_restarts: 1,
            session_ttl_secs: 24 * 60 * 60,
            lock_retry_delay_secs: 60,
        }
    }
}

impl EngineConfig {
    /// Loads the config from a JSON file.
    ///
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!(path = %path.display(), "no engine config, using defaults");
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        debug!(path = %path.display(), "loaded engine config");
        Ok(config)
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let limits = &self.limits;
        if limits.min_chunk_size == 0 {
            return Err(ConfigError::Invalid("min_chunk_size must be positive".into()));
        }
        if limits.min_chunk_size > limits.max_chunk_size {
            return Err(ConfigError::Invalid(format!(
                "min_chunk_size {} exceeds max_chunk_size {}",
                limits.min_chunk_size, limits.max_chunk_size
            )));
        }
        if limits.optimal_chunk_count == 0 || limits.max_chunk_count == 0 {
            return Err(ConfigError::Invalid("chunk counts must be positive".into()));
        }
        if limits.max_parallel_chunks == 0 {
            return Err(ConfigError::Invalid(
                "max_parallel_chunks must be positive".into(),
            ));
        }
        if self.progress_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "progress_interval_ms must be positive".into(),
            ));
        }
        if self.max_chunk_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_chunk_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn chunk_retry_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_retry_delay_ms)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn lock_retry_delay(&self) -> Duration {
        Duration::from_secs(self.lock_retry_delay_secs)
    }
}
