//! Whole-organization runs: merge within each cycle, then link across cycles.
//!
//! Every cycle is one atomic unit with its own transaction. A failing unit rolls
//! back alone and the run moves on; cancellation is honored between units only.
//! Preview runs the same algorithm inside one transaction that is never
//! committed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::binding::Binding;
use crate::cycle::Cycle;
use crate::error::{ExecutionError, MatchResult};
use crate::ids::{BindingId, CycleId, IdentityId, OrganizationId};
use crate::inventory::InventoryKind;
use crate::link::LinkManager;
use crate::matching::{CandidateFinder, MatchCriteria, MatchKey};
use crate::merge::MergeEngine;
use crate::storage::{InventoryStore, InventoryTx};
use crate::value::Value;

/// Outcome of one cycle unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleSummary {
    /// Cycle the unit processed.
    pub cycle: CycleId,
    /// Cycle name.
    pub name: String,
    /// Snapshots that took part in a merge.
    pub merged_count: usize,
    /// Linked sets whose membership changed.
    pub linked_sets_count: usize,
    /// Link steps skipped because the set would bind one identity twice in a cycle.
    pub link_errors: Vec<String>,
    /// Set when the unit rolled back.
    pub error: Option<String>,
    /// Error chain of the rollback cause.
    pub trace: Option<String>,
}

impl CycleSummary {
    fn empty(cycle: &Cycle) -> Self {
        Self {
            cycle: cycle.id,
            name: cycle.name.clone(),
            merged_count: 0,
            linked_sets_count: 0,
            link_errors: Vec::new(),
            error: None,
            trace: None,
        }
    }
}

/// Outcome of a committed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Organization that was run.
    pub organization: OrganizationId,
    /// Record kind that was run.
    pub kind: InventoryKind,
    /// One entry per cycle that ran, in start order.
    pub cycles: Vec<CycleSummary>,
    /// Stopped before every cycle ran.
    pub cancelled: bool,
}

impl RunSummary {
    /// Snapshots merged over all cycles.
    #[must_use]
    pub fn merged_count(&self) -> usize {
        self.cycles.iter().map(|c| c.merged_count).sum()
    }

    /// Linked sets changed over all cycles.
    #[must_use]
    pub fn linked_sets_count(&self) -> usize {
        self.cycles.iter().map(|c| c.linked_sets_count).sum()
    }

    /// Returns true if some unit rolled back or skipped a link step.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.cycles
            .iter()
            .any(|c| c.error.is_some() || !c.link_errors.is_empty())
    }

    /// Error chains of the rolled-back cycles, one block per cycle.
    #[must_use]
    pub fn failure_trace(&self) -> Option<String> {
        let blocks: Vec<String> = self
            .cycles
            .iter()
            .filter_map(|c| c.trace.as_ref().map(|t| format!("cycle {} ({}):\n{t}", c.name, c.cycle)))
            .collect();
        (!blocks.is_empty()).then(|| blocks.join("\n\n"))
    }
}

/// A binding as it would look after the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewRecord {
    /// Binding that would exist.
    pub binding: BindingId,
    /// Identity it would belong to.
    pub identity: IdentityId,
    /// Canonical values it would hold.
    pub fields: BTreeMap<String, Value>,
    /// Extra data it would hold.
    pub extra_data: BTreeMap<String, Value>,
}

/// Simulated contents of one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CyclePreview {
    /// Cycle previewed.
    pub cycle: CycleId,
    /// Cycle name.
    pub name: String,
    /// Snapshots that would be merged.
    pub merged_count: usize,
    /// Linked sets that would change.
    pub linked_sets_count: usize,
    /// Every binding of the cycle after the simulated run.
    pub records: Vec<PreviewRecord>,
}

/// Result of a whole-organization call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum WholeOrgOutcome {
    /// Every cycle unit ran and committed on its own.
    Committed(RunSummary),
    /// Nothing was written.
    Preview {
        /// Simulated result per cycle.
        cycles: Vec<CyclePreview>,
    },
}

/// Runs every cycle of an organization and commits each unit.
///
/// `on_cycle` is called after each unit with the number of units finished and
/// the total.
pub(crate) fn run(
    store: &dyn InventoryStore,
    organization: OrganizationId,
    kind: InventoryKind,
    criteria: &MatchCriteria,
    cancel: &AtomicBool,
    on_cycle: &mut dyn FnMut(&CycleSummary, usize, usize),
) -> MatchResult<RunSummary> {
    let cycles = {
        let tx = store.begin()?;
        tx.cycles(organization)?
    };
    info!(
        organization = %organization,
        kind = %kind,
        cycles = cycles.len(),
        "starting whole-organization match, merge and link"
    );

    let mut summary = RunSummary {
        organization,
        kind,
        cycles: Vec::with_capacity(cycles.len()),
        cancelled: false,
    };
    for (idx, cycle) in cycles.iter().enumerate() {
        if cancel.load(Ordering::SeqCst) {
            info!(organization = %organization, finished = idx, "run cancelled");
            summary.cancelled = true;
            break;
        }
        let unit = match run_unit(store, organization, kind, cycle, criteria) {
            Ok(unit) => unit,
            Err(e) => {
                warn!(cycle = %cycle.id, error = %e, "cycle unit rolled back");
                CycleSummary {
                    error: Some(e.to_string()),
                    trace: Some(e.trace()),
                    ..CycleSummary::empty(cycle)
                }
            }
        };
        on_cycle(&unit, idx + 1, cycles.len());
        summary.cycles.push(unit);
    }

    info!(
        organization = %organization,
        merged = summary.merged_count(),
        linked_sets = summary.linked_sets_count(),
        "whole-organization run finished"
    );
    Ok(summary)
}

/// Runs every cycle in one transaction and reports the result without committing.
pub(crate) fn preview(
    store: &dyn InventoryStore,
    organization: OrganizationId,
    kind: InventoryKind,
    criteria: &MatchCriteria,
) -> MatchResult<Vec<CyclePreview>> {
    let mut tx = store.begin()?;
    let cycles = tx.cycles(organization)?;

    let mut units = Vec::with_capacity(cycles.len());
    for cycle in &cycles {
        units.push(process_cycle(tx.as_mut(), organization, kind, cycle, criteria)?);
    }

    let mut out = Vec::with_capacity(cycles.len());
    for (cycle, unit) in cycles.iter().zip(units) {
        let mut records = Vec::new();
        for binding in tx.bindings_in_cycle(organization, kind, cycle.id)? {
            let snapshot = tx
                .snapshot(binding.snapshot)?
                .ok_or(ExecutionError::SnapshotNotFound { id: binding.snapshot })?;
            records.push(PreviewRecord {
                binding: binding.id,
                identity: binding.identity,
                fields: snapshot.fields,
                extra_data: snapshot.extra_data,
            });
        }
        out.push(CyclePreview {
            cycle: cycle.id,
            name: cycle.name.clone(),
            merged_count: unit.merged_count,
            linked_sets_count: unit.linked_sets_count,
            records,
        });
    }
    debug!(organization = %organization, cycles = out.len(), "preview computed, rolling back");
    Ok(out)
}

fn run_unit(
    store: &dyn InventoryStore,
    organization: OrganizationId,
    kind: InventoryKind,
    cycle: &Cycle,
    criteria: &MatchCriteria,
) -> MatchResult<CycleSummary> {
    let mut tx = store.begin()?;
    let unit = process_cycle(tx.as_mut(), organization, kind, cycle, criteria)?;
    tx.commit()?;
    Ok(unit)
}

/// Merges equal-key groups of one cycle, then links each survivor with its
/// best match in every other cycle.
fn process_cycle(
    tx: &mut dyn InventoryTx,
    organization: OrganizationId,
    kind: InventoryKind,
    cycle: &Cycle,
    criteria: &MatchCriteria,
) -> MatchResult<CycleSummary> {
    let mut unit = CycleSummary::empty(cycle);

    let mut groups: BTreeMap<MatchKey, Vec<Binding>> = BTreeMap::new();
    for binding in tx.bindings_in_cycle(organization, kind, cycle.id)? {
        let snapshot = tx
            .snapshot(binding.snapshot)?
            .ok_or(ExecutionError::SnapshotNotFound { id: binding.snapshot })?;
        if !snapshot.is_live() {
            continue;
        }
        if let Some(key) = criteria.key_for(&snapshot) {
            groups.entry(key).or_default().push(binding);
        }
    }

    let mut survivors = Vec::with_capacity(groups.len());
    for group in groups.into_values() {
        if group.len() > 1 {
            let commit = MergeEngine::merge(tx, &group, None)?;
            unit.merged_count += group.len();
            survivors.push(commit.binding);
        } else {
            survivors.extend(group);
        }
    }

    for survivor in survivors {
        let Some(candidates) = CandidateFinder::find_candidates(tx, &survivor, criteria)? else {
            continue;
        };
        let mut others = Vec::with_capacity(candidates.other_cycles.len());
        for candidate in &candidates.other_cycles {
            others.push(
                tx.binding(candidate.binding)?
                    .ok_or(ExecutionError::BindingNotFound { id: candidate.binding })?,
            );
        }
        match LinkManager::link(tx, &survivor, &others) {
            Ok(outcome) if outcome.changed() => unit.linked_sets_count += 1,
            Ok(_) => {}
            Err(e) if e.is_link_integrity() => {
                warn!(cycle = %cycle.id, binding = %survivor.id, error = %e, "link step skipped");
                unit.link_errors.push(e.to_string());
            }
            Err(e) => return Err(e),
        }
    }

    debug!(
        cycle = %cycle.id,
        merged = unit.merged_count,
        linked_sets = unit.linked_sets_count,
        "cycle unit processed"
    );
    Ok(unit)
}
