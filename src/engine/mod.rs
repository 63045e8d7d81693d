//! Matching engine.
//!
//! [`MatchEngine`] runs the match, merge and link pipeline against pluggable
//! storage. Targeted calls are synchronous and run in one transaction; whole
//! organization runs commit cycle by cycle and report through the progress
//! surface. [`runtime::JobRuntime`] moves whole-organization runs onto a
//! bounded worker pool.

mod batch;
mod import;
mod progress;
mod single;

/// Background job runtime for whole-organization runs.
pub mod runtime;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tracing::{instrument, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{ExecutionError, MatchResult};
use crate::ids::{BindingId, CycleId, IdentityId, OrganizationId, SnapshotId};
use crate::inventory::InventoryKind;
use crate::link::LinkManager;
use crate::matching::{CriteriaResolver, MatchCriteria};
use crate::meter::MeterKey;
use crate::reconcile::{MeterReconciler, ReadingImport, ReadingInput};
use crate::storage::{
    InMemoryInventoryStore, InMemoryKeyValueStore, InventoryStore, KeyValueStore, StorageError,
};

pub use batch::{CyclePreview, CycleSummary, PreviewRecord, RunSummary, WholeOrgOutcome};
pub use import::ImportSummary;
pub use progress::{ProgressData, ProgressStatus, ProgressTracker, RunLock};
pub use single::MatchMergeLinkOutcome;

/// Progress function name of whole-organization runs.
pub const WHOLE_ORG_FUNC: &str = "whole_org_match_merge_link";

/// Match, merge and link engine.
#[derive(Clone)]
pub struct MatchEngine {
    store: Arc<dyn InventoryStore>,
    kv: Arc<dyn KeyValueStore>,
    config: EngineConfig,
}

impl std::fmt::Debug for MatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatchEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MatchEngine {
    /// Create a new engine using the given stores.
    #[must_use]
    pub fn new(store: Arc<dyn InventoryStore>, kv: Arc<dyn KeyValueStore>, config: EngineConfig) -> Self {
        Self { store, kv, config }
    }

    /// Engine over fresh in-memory stores.
    #[must_use]
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::new(
            Arc::new(InMemoryInventoryStore::new()),
            Arc::new(InMemoryKeyValueStore::new()),
            config,
        )
    }

    /// Inventory store the engine reads and writes.
    #[must_use]
    pub fn store(&self) -> &dyn InventoryStore {
        self.store.as_ref()
    }

    /// Key-value store holding progress records and run locks.
    #[must_use]
    pub fn kv(&self) -> &Arc<dyn KeyValueStore> {
        &self.kv
    }

    /// Engine configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Resolves criteria, applying `proposed` for this call only.
    pub fn resolve_criteria(
        &self,
        organization: OrganizationId,
        kind: InventoryKind,
        proposed: Option<&[String]>,
    ) -> MatchResult<MatchCriteria> {
        let tx = self.store.begin()?;
        CriteriaResolver::resolve(tx.as_ref(), organization, kind, proposed)
    }

    /// Matches, merges and links one binding in a single transaction.
    ///
    /// Duplicates in the binding's cycle merge into it with the binding ranked
    /// highest; matches in other cycles merge by recency and are then linked to
    /// it. A [`crate::LinkIntegrityError`] from the link step is returned after
    /// the merges are committed.
    #[instrument(skip(self), level = "debug")]
    pub fn match_merge_link(&self, binding: BindingId, kind: InventoryKind) -> MatchResult<MatchMergeLinkOutcome> {
        let mut tx = self.store.begin()?;
        let target = tx
            .binding(binding)?
            .ok_or(ExecutionError::BindingNotFound { id: binding })?;
        if target.kind != kind {
            return Err(ExecutionError::KindMismatch {
                id: binding,
                expected: kind,
                actual: target.kind,
            }
            .into());
        }
        let criteria = CriteriaResolver::resolve(tx.as_ref(), target.organization, kind, None)?;

        let phase = single::merge_phase(tx.as_mut(), &target, &criteria)?;
        let Some(merged) = phase.target else {
            return Ok(MatchMergeLinkOutcome {
                merged_count: 0,
                linked_count: 0,
                binding: None,
            });
        };
        match LinkManager::link(tx.as_mut(), &merged, &phase.representatives) {
            Ok(outcome) => {
                tx.commit()?;
                Ok(MatchMergeLinkOutcome {
                    merged_count: phase.merged_count,
                    linked_count: outcome.repointed.len(),
                    binding: Some(merged.id),
                })
            }
            Err(e) if e.is_link_integrity() => {
                warn!(binding = %merged.id, error = %e, "link step aborted, keeping merges");
                tx.commit()?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Runs the whole organization synchronously.
    ///
    /// Without `proposed` every cycle is committed as its own unit. With
    /// `proposed` the criteria override applies and nothing is committed; the
    /// simulated per-cycle records are returned instead. Fails with
    /// [`ExecutionError::Locked`] while another run holds the organization.
    ///
    /// Synchronous runs leave no progress record; submit through
    /// [`crate::JobRuntime`] to get a progress key.
    #[instrument(skip(self, proposed), level = "debug")]
    pub fn whole_org_match_merge_link(
        &self,
        organization: OrganizationId,
        kind: InventoryKind,
        proposed: Option<&[String]>,
    ) -> MatchResult<WholeOrgOutcome> {
        let criteria = self.resolve_criteria(organization, kind, proposed)?;
        let _lock = RunLock::acquire(Arc::clone(&self.kv), organization, kind, self.config.lock_ttl())?;
        self.execute_whole_org(
            organization,
            kind,
            &criteria,
            proposed.is_some(),
            &AtomicBool::new(false),
            None,
        )
    }

    /// Promotes mapped snapshots into a cycle, drops exact duplicates and
    /// matches the rest, all in one transaction.
    #[instrument(skip(self, snapshots), fields(rows = snapshots.len()), level = "debug")]
    pub fn match_incoming(
        &self,
        organization: OrganizationId,
        kind: InventoryKind,
        cycle: CycleId,
        snapshots: &[SnapshotId],
    ) -> MatchResult<ImportSummary> {
        let mut tx = self.store.begin()?;
        let criteria = CriteriaResolver::resolve(tx.as_ref(), organization, kind, None)?;
        let summary = import::match_incoming(tx.as_mut(), organization, kind, cycle, snapshots, &criteria)?;
        tx.commit()?;
        Ok(summary)
    }

    /// Imports meter readings for an identity.
    pub fn import_meter_readings(
        &self,
        identity: IdentityId,
        key: &MeterKey,
        batch: Vec<ReadingInput>,
    ) -> MatchResult<ReadingImport> {
        let mut tx = self.store.begin()?;
        if tx.identity(identity)?.is_none() {
            return Err(ExecutionError::IdentityNotFound { id: identity }.into());
        }
        let imported = MeterReconciler::import_readings(tx.as_mut(), identity, key, batch)?;
        tx.commit()?;
        Ok(imported)
    }

    /// Detaches a binding onto its own identity, copying meters.
    pub fn unlink(&self, binding: BindingId) -> MatchResult<IdentityId> {
        let mut tx = self.store.begin()?;
        let identity = LinkManager::unlink(tx.as_mut(), binding)?;
        tx.commit()?;
        Ok(identity)
    }

    /// Reads a progress record.
    pub fn progress(&self, key: &str) -> MatchResult<Option<ProgressData>> {
        ProgressTracker::read(self.kv.as_ref(), key)
    }

    pub(crate) fn tracker(&self, job: Uuid) -> MatchResult<ProgressTracker> {
        ProgressTracker::new(Arc::clone(&self.kv), WHOLE_ORG_FUNC, job, self.config.progress_ttl())
    }

    /// Runs a whole-organization job. With a tracker it leaves a terminal
    /// progress record.
    pub(crate) fn execute_whole_org(
        &self,
        organization: OrganizationId,
        kind: InventoryKind,
        criteria: &MatchCriteria,
        preview: bool,
        cancel: &AtomicBool,
        mut tracker: Option<&mut ProgressTracker>,
    ) -> MatchResult<WholeOrgOutcome> {
        let result = if preview {
            if let Some(tracker) = tracker.as_deref_mut() {
                tracker.start(1, "Previewing matching criteria")?;
            }
            batch::preview(self.store.as_ref(), organization, kind, criteria)
                .map(|cycles| WholeOrgOutcome::Preview { cycles })
        } else {
            let total = self.store.begin()?.cycles(organization)?.len();
            if let Some(tracker) = tracker.as_deref_mut() {
                tracker.start(total, "Matching, merging and linking")?;
            }
            let mut on_cycle = |unit: &CycleSummary, done: usize, total: usize| {
                let Some(tracker) = tracker.as_deref_mut() else {
                    return;
                };
                let summary = serde_json::to_value(unit).ok();
                if let Err(e) = tracker.step(format!("Processed cycle {done} of {total}"), summary) {
                    warn!(error = %e, "failed to record progress");
                }
            };
            batch::run(self.store.as_ref(), organization, kind, criteria, cancel, &mut on_cycle)
                .map(WholeOrgOutcome::Committed)
        };

        let Some(tracker) = tracker else {
            return result;
        };
        match &result {
            Ok(outcome) => {
                let (status, message) = match outcome {
                    WholeOrgOutcome::Committed(run) if run.cancelled => (
                        ProgressStatus::Warning,
                        format!("Cancelled after {} cycle(s)", run.cycles.len()),
                    ),
                    WholeOrgOutcome::Committed(run) if run.has_failures() => {
                        (ProgressStatus::Warning, "Finished with cycle failures".to_string())
                    }
                    WholeOrgOutcome::Committed(_) => (ProgressStatus::Success, "Finished".to_string()),
                    WholeOrgOutcome::Preview { .. } => (ProgressStatus::Success, "Preview ready".to_string()),
                };
                let summary =
                    serde_json::to_value(outcome).map_err(|e| StorageError::SerializationError(e.to_string()))?;
                let trace = match outcome {
                    WholeOrgOutcome::Committed(run) => run.failure_trace(),
                    WholeOrgOutcome::Preview { .. } => None,
                };
                tracker.finish(status, message, summary, trace)?;
            }
            Err(e) => tracker.fail(e)?,
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_binding_is_execution_error() {
        let engine = MatchEngine::in_memory(EngineConfig::default());
        let err = engine
            .match_merge_link(BindingId::new(), InventoryKind::Property)
            .unwrap_err();
        assert!(matches!(
            err,
            crate::MatchError::Execution(ExecutionError::BindingNotFound { .. })
        ));
    }

    #[test]
    fn test_empty_org_run_succeeds() {
        let engine = MatchEngine::in_memory(EngineConfig::default());
        let outcome = engine
            .whole_org_match_merge_link(OrganizationId::new(), InventoryKind::TaxLot, None)
            .unwrap();
        let WholeOrgOutcome::Committed(run) = outcome else {
            panic!("expected a committed run");
        };
        assert!(run.cycles.is_empty());
        assert!(!run.cancelled);
    }

    /// Key-value store that remembers every key passed to `set`.
    #[derive(Default)]
    struct RecordingKv {
        inner: InMemoryKeyValueStore,
        written: std::sync::Mutex<Vec<String>>,
    }

    impl KeyValueStore for RecordingKv {
        fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError> {
            self.inner.get(key)
        }

        fn set(
            &self,
            key: &str,
            value: serde_json::Value,
            ttl: Option<std::time::Duration>,
        ) -> Result<(), StorageError> {
            self.written.lock().unwrap().push(key.to_string());
            self.inner.set(key, value, ttl)
        }

        fn set_if_absent(
            &self,
            key: &str,
            value: serde_json::Value,
            ttl: Option<std::time::Duration>,
        ) -> Result<bool, StorageError> {
            self.inner.set_if_absent(key, value, ttl)
        }

        fn delete(&self, key: &str) -> Result<bool, StorageError> {
            self.inner.delete(key)
        }
    }

    #[test]
    fn test_sync_run_leaves_no_orphan_progress() {
        let kv = Arc::new(RecordingKv::default());
        let engine = MatchEngine::new(
            Arc::new(InMemoryInventoryStore::new()),
            kv.clone(),
            EngineConfig::default(),
        );
        let org = OrganizationId::new();
        engine
            .whole_org_match_merge_link(org, InventoryKind::Property, None)
            .unwrap();
        engine
            .whole_org_match_merge_link(org, InventoryKind::Property, Some(&["ubid".to_string()]))
            .unwrap();

        let written = kv.written.lock().unwrap();
        assert!(
            written.iter().all(|k| !k.starts_with("progress:")),
            "unexpected progress writes: {written:?}"
        );
    }
}
