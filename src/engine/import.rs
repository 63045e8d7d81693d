//! Matching of freshly mapped import rows.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::binding::Binding;
use crate::engine::single;
use crate::error::{ExecutionError, MatchResult};
use crate::ids::{BindingId, CycleId, OrganizationId, SnapshotId};
use crate::inventory::{InventoryKind, InventoryRecord};
use crate::link::LinkManager;
use crate::matching::MatchCriteria;
use crate::snapshot::{DataStage, MergeState};
use crate::storage::InventoryTx;

/// Counts reported after matching an import batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    /// Rows promoted to live bindings.
    pub promoted: Vec<BindingId>,
    /// Rows identical to an earlier row of the same batch.
    pub duplicates_in_import: usize,
    /// Rows identical to a live snapshot already in the cycle.
    pub duplicates_of_existing: usize,
    /// Rows skipped because they were not in the mapped stage.
    pub skipped: usize,
    /// Snapshots that took part in a merge.
    pub merged_count: usize,
    /// Bindings moved onto a shared identity.
    pub linked_count: usize,
    /// Link steps skipped because they would bind one identity twice in a cycle.
    pub link_errors: Vec<String>,
}

/// Promotes mapped snapshots into `cycle` and matches each one.
pub(crate) fn match_incoming(
    tx: &mut dyn InventoryTx,
    organization: OrganizationId,
    kind: InventoryKind,
    cycle: CycleId,
    snapshots: &[SnapshotId],
    criteria: &MatchCriteria,
) -> MatchResult<ImportSummary> {
    let owner = tx.cycle(cycle)?.map(|c| c.organization);
    if owner != Some(organization) {
        return Err(ExecutionError::ForeignCycle { cycle, organization }.into());
    }

    let mut existing: HashSet<blake3::Hash> = HashSet::new();
    for binding in tx.bindings_in_cycle(organization, kind, cycle)? {
        if let Some(snapshot) = tx.snapshot(binding.snapshot)? {
            existing.insert(snapshot.content_hash());
        }
    }

    let mut summary = ImportSummary::default();
    let mut seen: HashSet<blake3::Hash> = HashSet::new();
    for id in snapshots {
        let mut snapshot = tx
            .snapshot(*id)?
            .ok_or(ExecutionError::SnapshotNotFound { id: *id })?;
        if snapshot.organization != organization || snapshot.kind != kind {
            return Err(ExecutionError::SnapshotNotFound { id: *id }.into());
        }
        if snapshot.data_stage != DataStage::Mapped {
            summary.skipped += 1;
            continue;
        }

        let hash = snapshot.content_hash();
        let duplicate_in_import = !seen.insert(hash);
        if duplicate_in_import || existing.contains(&hash) {
            if duplicate_in_import {
                summary.duplicates_in_import += 1;
            } else {
                summary.duplicates_of_existing += 1;
            }
            snapshot.merge_state = MergeState::Duplicate;
            snapshot.data_stage = DataStage::Deleted;
            tx.update_snapshot(snapshot)?;
            continue;
        }

        snapshot.merge_state = MergeState::New;
        snapshot.data_stage = DataStage::Matching;
        let record = InventoryRecord::new(organization, kind);
        let binding = Binding::new(organization, kind, record.id, cycle, snapshot.id);
        tx.insert_identity(record)?;
        tx.update_snapshot(snapshot)?;
        tx.insert_binding(binding.clone())?;
        summary.promoted.push(binding.id);
    }

    for id in summary.promoted.clone() {
        // An earlier promotion may already have merged this one away.
        let Some(binding) = tx.binding(id)? else {
            continue;
        };
        let merged = single::merge_phase(tx, &binding, criteria)?;
        summary.merged_count += merged.merged_count;
        let Some(target) = merged.target else {
            continue;
        };
        match LinkManager::link(tx, &target, &merged.representatives) {
            Ok(outcome) => summary.linked_count += outcome.repointed.len(),
            Err(e) if e.is_link_integrity() => {
                warn!(binding = %target.id, error = %e, "link step skipped during import");
                summary.link_errors.push(e.to_string());
            }
            Err(e) => return Err(e),
        }
    }

    debug!(
        cycle = %cycle,
        promoted = summary.promoted.len(),
        duplicates = summary.duplicates_in_import + summary.duplicates_of_existing,
        merged = summary.merged_count,
        linked = summary.linked_count,
        "matched import batch"
    );
    Ok(summary)
}
