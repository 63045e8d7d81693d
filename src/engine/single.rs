//! Targeted match, merge and link for one binding.

use serde::{Deserialize, Serialize};

use crate::binding::Binding;
use crate::error::{ExecutionError, MatchResult};
use crate::ids::BindingId;
use crate::matching::{CandidateFinder, MatchCriteria};
use crate::merge::MergeEngine;
use crate::storage::InventoryTx;

/// Result of [`crate::engine::MatchEngine::match_merge_link`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchMergeLinkOutcome {
    /// Snapshots that took part in a merge, over all cycles.
    pub merged_count: usize,
    /// Bindings moved onto the shared identity.
    pub linked_count: usize,
    /// Binding now holding the target's data; `None` when the target has no
    /// populated criteria column and was left alone.
    pub binding: Option<BindingId>,
}

/// Bindings left after merging every cycle's matches.
#[derive(Debug, Clone, Default)]
pub(crate) struct MergePhase {
    pub merged_count: usize,
    /// Binding carrying the target's data after its own cycle merged.
    pub target: Option<Binding>,
    /// One binding per other cycle.
    pub representatives: Vec<Binding>,
}

/// Merges the target's cycle with the target ranked highest, then every other
/// cycle holding matches by recency.
pub(crate) fn merge_phase(
    tx: &mut dyn InventoryTx,
    binding: &Binding,
    criteria: &MatchCriteria,
) -> MatchResult<MergePhase> {
    let Some(candidates) = CandidateFinder::find_candidates(tx, binding, criteria)? else {
        return Ok(MergePhase::default());
    };
    if candidates.is_alone() {
        return Ok(MergePhase {
            target: Some(binding.clone()),
            ..MergePhase::default()
        });
    }
    let mut phase = MergePhase::default();

    let target = if candidates.same_cycle.len() > 1 {
        let group = load(tx, candidates.same_cycle.iter().map(|c| c.binding))?;
        let commit = MergeEngine::merge(tx, &group, Some(binding.id))?;
        phase.merged_count += group.len();
        commit.binding
    } else {
        binding.clone()
    };

    for best in &candidates.other_cycles {
        let matches = tx.find_candidate_bindings(
            binding.organization,
            binding.kind,
            Some(best.cycle),
            criteria,
            &candidates.key,
        )?;
        let representative = if matches.len() > 1 {
            let group = load(tx, matches.iter().map(|m| m.binding))?;
            let commit = MergeEngine::merge(tx, &group, None)?;
            phase.merged_count += group.len();
            commit.binding
        } else {
            load(tx, std::iter::once(best.binding))?
                .pop()
                .ok_or(ExecutionError::BindingNotFound { id: best.binding })?
        };
        phase.representatives.push(representative);
    }

    phase.target = Some(target);
    Ok(phase)
}

fn load(tx: &dyn InventoryTx, ids: impl Iterator<Item = BindingId>) -> MatchResult<Vec<Binding>> {
    ids.map(|id| {
        tx.binding(id)?
            .ok_or_else(|| ExecutionError::BindingNotFound { id }.into())
    })
    .collect()
}
