//! Merge engine: folds matching snapshots of one cycle into one.
//!
//! Inputs are ordered lowest to highest precedence. Precedence is modification
//! recency; equal timestamps rank the lower snapshot id higher, and an
//! explicitly targeted snapshot always ranks highest. Each field then resolves
//! by its [`MergeProtection`]:
//!
//! - `FavorNew`: the highest-precedence populated value wins.
//! - `FavorExisting`: the lowest-precedence populated value wins; later values
//!   only fill a slot nobody populated.
//!
//! Both rules pick one input value per field, so the fold is associative.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::audit::{AuditEntry, FieldChange, SYSTEM_MATCH};
use crate::binding::Binding;
use crate::column::{ColumnPolicies, MergeProtection};
use crate::error::{ExecutionError, MatchError, MatchResult};
use crate::ids::{AuditId, BindingId, IdentityId, SnapshotId};
use crate::reconcile::{MeterReconciler, ReconcileSummary};
use crate::snapshot::{MergeState, Snapshot};
use crate::storage::InventoryTx;
use crate::value::Value;

/// Result of the pure field fold.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedFields {
    /// Winning canonical values.
    pub fields: BTreeMap<String, Value>,
    /// Winning extra data values.
    pub extra_data: BTreeMap<String, Value>,
    /// Fields on which the inputs disagreed.
    pub changes: Vec<FieldChange>,
}

/// What a committed merge wrote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeCommit {
    /// The new snapshot.
    pub snapshot: SnapshotId,
    /// The single binding replacing all inputs.
    pub binding: Binding,
    /// Input snapshots in precedence order (lowest first).
    pub parents: Vec<SnapshotId>,
    /// Identities left without bindings and removed.
    pub pruned: Vec<IdentityId>,
    /// Meters moved from losing identities.
    pub meters: ReconcileSummary,
    /// Audit entry describing the merge.
    pub audit: AuditId,
}

/// Folds matching snapshots into one.
#[derive(Debug, Default, Clone, Copy)]
pub struct MergeEngine;

impl MergeEngine {
    /// Compares two snapshots by merge precedence, lowest first.
    #[must_use]
    pub fn precedence_cmp(a: &Snapshot, b: &Snapshot, explicit_target: Option<SnapshotId>) -> Ordering {
        let a_target = explicit_target == Some(a.id);
        let b_target = explicit_target == Some(b.id);
        a_target
            .cmp(&b_target)
            .then_with(|| a.updated_at.cmp(&b.updated_at))
            .then_with(|| b.id.cmp(&a.id))
    }

    /// Sorts snapshots lowest to highest precedence.
    pub fn precedence_order(snapshots: &mut [Snapshot], explicit_target: Option<SnapshotId>) {
        snapshots.sort_by(|a, b| Self::precedence_cmp(a, b, explicit_target));
    }

    /// Folds snapshots already in precedence order.
    #[must_use]
    pub fn fold(ordered: &[&Snapshot], policies: &ColumnPolicies) -> MergedFields {
        let mut merged = MergedFields::default();
        for is_extra_data in [false, true] {
            let columns: BTreeSet<&String> = ordered
                .iter()
                .flat_map(|s| section(s, is_extra_data).keys())
                .collect();

            for column in columns {
                let values: Vec<&Value> = ordered
                    .iter()
                    .map(|s| section(s, is_extra_data).get(column).unwrap_or(&Value::Null))
                    .collect();
                let mut populated = values.iter().filter(|v| v.is_populated());
                let winner = match policies.protection(column, is_extra_data) {
                    MergeProtection::FavorNew => populated.last(),
                    MergeProtection::FavorExisting => populated.next(),
                }
                .map_or(Value::Null, |v| (*v).clone());

                if values.iter().any(|v| **v != winner) {
                    merged.changes.push(FieldChange {
                        field: column.clone(),
                        is_extra_data,
                        before: ordered
                            .iter()
                            .zip(&values)
                            .map(|(s, v)| (s.id, (*v).clone()))
                            .collect(),
                        after: winner.clone(),
                    });
                }
                let target = if is_extra_data {
                    &mut merged.extra_data
                } else {
                    &mut merged.fields
                };
                target.insert(column.clone(), winner);
            }
        }
        merged
    }

    /// Merges the snapshots bound by `bindings` (all in one cycle) into one.
    ///
    /// Writes one new snapshot, replaces every input binding with one binding
    /// on the identity of the highest-precedence input, folds losing
    /// identities' meters into it, prunes identities left without bindings and
    /// appends a "System Match" audit entry.
    #[instrument(skip(tx, bindings), fields(inputs = bindings.len()), level = "debug")]
    pub fn merge(
        tx: &mut dyn InventoryTx,
        bindings: &[Binding],
        explicit_target: Option<BindingId>,
    ) -> MatchResult<MergeCommit> {
        let Some(first) = bindings.first() else {
            return Err(MatchError::internal("merge requires at least one binding"));
        };
        if let Some(stray) = bindings
            .iter()
            .find(|b| b.cycle != first.cycle || b.kind != first.kind || b.organization != first.organization)
        {
            return Err(MatchError::internal(format!(
                "binding {} is not in the cycle of binding {}",
                stray.id, first.id
            )));
        }

        let mut inputs: Vec<(Binding, Snapshot)> = Vec::with_capacity(bindings.len());
        for binding in bindings {
            let snapshot = tx
                .snapshot(binding.snapshot)?
                .ok_or(ExecutionError::SnapshotNotFound { id: binding.snapshot })?;
            inputs.push((binding.clone(), snapshot));
        }
        let target_snapshot = explicit_target
            .and_then(|t| inputs.iter().find(|(b, _)| b.id == t))
            .map(|(_, s)| s.id);
        inputs.sort_by(|(_, a), (_, b)| Self::precedence_cmp(a, b, target_snapshot));

        let policies = ColumnPolicies::new(&tx.column_policies(first.organization, first.kind)?);
        let ordered: Vec<&Snapshot> = inputs.iter().map(|(_, s)| s).collect();
        let merged = Self::fold(&ordered, &policies);

        let newest = ordered.iter().map(|s| s.updated_at).max().unwrap_or_else(Utc::now);
        let mut child = Snapshot::builder()
            .organization(first.organization)
            .kind(first.kind)
            .merge_state(MergeState::Merged)
            .updated_at(newest.max(Utc::now()))
            .build()?;
        child.fields = merged.fields;
        child.extra_data = merged.extra_data;
        let child_id = child.id;
        tx.insert_snapshot(child)?;

        let winner = inputs
            .last()
            .map(|(b, _)| b.identity)
            .ok_or_else(|| MatchError::internal("merge lost its inputs"))?;
        for (binding, _) in &inputs {
            tx.delete_binding(binding.id)?;
        }
        let binding = Binding::new(first.organization, first.kind, winner, first.cycle, child_id);
        tx.insert_binding(binding.clone())?;

        let mut losers: Vec<IdentityId> = Vec::new();
        for (b, _) in &inputs {
            if b.identity != winner && !losers.contains(&b.identity) {
                losers.push(b.identity);
            }
        }
        let meters = MeterReconciler::reconcile(tx, winner, &losers)?;
        let mut pruned = Vec::new();
        for loser in losers {
            if MeterReconciler::prune_identity(tx, loser)? {
                pruned.push(loser);
            }
        }

        let parents: Vec<SnapshotId> = ordered.iter().map(|s| s.id).collect();
        let audit = AuditEntry {
            id: AuditId::new(),
            organization: first.organization,
            kind: first.kind,
            name: SYSTEM_MATCH.to_string(),
            parents: parents.clone(),
            child: child_id,
            binding: binding.id,
            identity: winner,
            cycle: first.cycle,
            changes: merged.changes,
            created_at: Utc::now(),
        };
        let audit_id = audit.id;
        tx.append_audit(audit)?;

        debug!(
            cycle = %first.cycle,
            identity = %winner,
            snapshot = %child_id,
            merged = parents.len(),
            pruned = pruned.len(),
            "merged snapshots"
        );
        Ok(MergeCommit {
            snapshot: child_id,
            binding,
            parents,
            pruned,
            meters,
            audit: audit_id,
        })
    }
}

fn section(snapshot: &Snapshot, is_extra_data: bool) -> &BTreeMap<String, Value> {
    if is_extra_data {
        &snapshot.extra_data
    } else {
        &snapshot.fields
    }
}
