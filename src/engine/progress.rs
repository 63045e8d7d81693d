//! Progress records and run locks kept in the injected key-value store.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ExecutionError, MatchError, MatchResult};
use crate::ids::OrganizationId;
use crate::inventory::InventoryKind;
use crate::storage::{KeyValueStore, StorageError};

/// Lifecycle of a tracked operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProgressStatus {
    /// Record created, work not picked up yet.
    NotStarted,
    /// Work in progress.
    Running,
    /// Finished without failures.
    Success,
    /// Finished, but cancelled or with per-cycle failures.
    Warning,
    /// Failed as a whole; see `trace`.
    Error,
}

impl ProgressStatus {
    /// Returns true once no further update will follow.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Warning | Self::Error)
    }
}

/// The record a progress key resolves to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressData {
    /// Current lifecycle state.
    pub status: ProgressStatus,
    /// Percent complete, 0 to 100.
    pub progress: u8,
    /// Human-readable status line.
    pub message: String,
    /// Serialized run summary, once available.
    pub summary: Option<serde_json::Value>,
    /// Error chain captured when the run failed.
    pub trace: Option<String>,
}

/// Writes progress for one operation under `progress:{func}:{id}`.
pub struct ProgressTracker {
    store: Arc<dyn KeyValueStore>,
    key: String,
    ttl: Duration,
    total: usize,
    done: usize,
}

impl fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("key", &self.key)
            .field("total", &self.total)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl ProgressTracker {
    /// Progress key for an operation.
    #[must_use]
    pub fn key_for(func: &str, id: impl fmt::Display) -> String {
        format!("progress:{func}:{id}")
    }

    /// Creates a tracker and records `not-started`.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        func: &str,
        id: impl fmt::Display,
        ttl: Duration,
    ) -> MatchResult<Self> {
        let tracker = Self {
            store,
            key: Self::key_for(func, id),
            ttl,
            total: 0,
            done: 0,
        };
        tracker.write(&ProgressData {
            status: ProgressStatus::NotStarted,
            progress: 0,
            message: "Queued".to_string(),
            summary: None,
            trace: None,
        })?;
        Ok(tracker)
    }

    /// Key this tracker writes under.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Marks the run as started with `total` units of work.
    pub fn start(&mut self, total: usize, message: impl Into<String>) -> MatchResult<()> {
        self.total = total;
        self.done = 0;
        self.write(&ProgressData {
            status: ProgressStatus::Running,
            progress: 0,
            message: message.into(),
            summary: None,
            trace: None,
        })
    }

    /// Records one finished unit. Stays below 100 until [`Self::finish`].
    pub fn step(&mut self, message: impl Into<String>, summary: Option<serde_json::Value>) -> MatchResult<()> {
        self.done += 1;
        let progress = if self.total == 0 {
            0
        } else {
            (self.done * 100 / self.total).min(99)
        };
        self.write(&ProgressData {
            status: ProgressStatus::Running,
            progress: u8::try_from(progress).unwrap_or(99),
            message: message.into(),
            summary,
            trace: None,
        })
    }

    /// Records a terminal `success` or `warning`.
    ///
    /// `trace` carries the error chains of units that failed without failing the run.
    pub fn finish(
        &self,
        status: ProgressStatus,
        message: impl Into<String>,
        summary: serde_json::Value,
        trace: Option<String>,
    ) -> MatchResult<()> {
        self.write(&ProgressData {
            status,
            progress: 100,
            message: message.into(),
            summary: Some(summary),
            trace,
        })
    }

    /// Records a terminal `error` with the error chain as trace.
    pub fn fail(&self, error: &MatchError) -> MatchResult<()> {
        self.write(&ProgressData {
            status: ProgressStatus::Error,
            progress: 100,
            message: error.to_string(),
            summary: None,
            trace: Some(error.trace()),
        })
    }

    /// Records a terminal `error` for a run that died without an error value.
    pub fn abort(&self, message: impl Into<String>) -> MatchResult<()> {
        self.write(&ProgressData {
            status: ProgressStatus::Error,
            progress: 100,
            message: message.into(),
            summary: None,
            trace: None,
        })
    }

    /// Reads the record behind a progress key.
    pub fn read(store: &dyn KeyValueStore, key: &str) -> MatchResult<Option<ProgressData>> {
        store
            .get(key)?
            .map(|raw| {
                serde_json::from_value(raw)
                    .map_err(|e| StorageError::SerializationError(e.to_string()).into())
            })
            .transpose()
    }

    fn write(&self, data: &ProgressData) -> MatchResult<()> {
        let raw = serde_json::to_value(data).map_err(|e| StorageError::SerializationError(e.to_string()))?;
        self.store.set(&self.key, raw, Some(self.ttl))?;
        Ok(())
    }
}

/// Non-reentrant lock on whole-organization runs for one (organization, kind).
///
/// Released when dropped.
pub struct RunLock {
    store: Arc<dyn KeyValueStore>,
    key: String,
}

impl fmt::Debug for RunLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLock").field("key", &self.key).finish_non_exhaustive()
    }
}

impl RunLock {
    /// Key guarding runs for one (organization, kind).
    #[must_use]
    pub fn key_for(organization: OrganizationId, kind: InventoryKind) -> String {
        format!("lock:whole_org_match_merge_link:{organization}:{kind}")
    }

    /// Takes the lock or fails with [`ExecutionError::Locked`].
    pub fn acquire(
        store: Arc<dyn KeyValueStore>,
        organization: OrganizationId,
        kind: InventoryKind,
        ttl: Duration,
    ) -> MatchResult<Self> {
        let key = Self::key_for(organization, kind);
        if !store.set_if_absent(&key, serde_json::Value::Bool(true), Some(ttl))? {
            return Err(ExecutionError::Locked { key }.into());
        }
        Ok(Self { store, key })
    }

    /// Key held by this lock.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = self.store.delete(&self.key) {
            warn!(key = %self.key, error = %e, "failed to release run lock");
        }
    }
}
