//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// Tuning for the background job runtime and the progress surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker threads running whole-organization jobs.
    pub job_workers: usize,
    /// Maximum queued jobs before submissions fail with `QueueFull`.
    pub queue_capacity: usize,
    /// How long progress records stay readable after their last update.
    pub progress_ttl_secs: u64,
    /// Expiry of the per-(organization, kind) run lock, so a crashed worker
    /// cannot hold it forever.
    pub lock_ttl_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            job_workers: 2,
            queue_capacity: 64,
            progress_ttl_secs: 3600,
            lock_ttl_secs: 6 * 3600,
        }
    }
}

impl EngineConfig {
    /// Parses a JSON document; missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// [`ConfigurationError::InvalidConfig`] when the document does not parse
    /// or a value is zero.
    pub fn from_json(raw: &str) -> Result<Self, ConfigurationError> {
        let config: Self = serde_json::from_str(raw).map_err(|e| ConfigurationError::InvalidConfig {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects zero-sized pools, queues and expiries.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let zero = [
            ("job_workers", self.job_workers as u64),
            ("queue_capacity", self.queue_capacity as u64),
            ("progress_ttl_secs", self.progress_ttl_secs),
            ("lock_ttl_secs", self.lock_ttl_secs),
        ]
        .into_iter()
        .find(|(_, v)| *v == 0);
        match zero {
            Some((name, _)) => Err(ConfigurationError::InvalidConfig {
                reason: format!("{name} must be greater than zero"),
            }),
            None => Ok(()),
        }
    }

    /// Lifetime of progress records.
    #[must_use]
    pub const fn progress_ttl(&self) -> Duration {
        Duration::from_secs(self.progress_ttl_secs)
    }

    /// Lifetime of a run lock whose job never released it.
    #[must_use]
    pub const fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
}
