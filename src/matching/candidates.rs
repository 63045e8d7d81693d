//! Candidate finding: duplicates within a cycle and matches in other cycles.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::binding::{Binding, BindingRef};
use crate::error::{ExecutionError, MatchResult};
use crate::ids::{BindingId, CycleId};
use crate::matching::criteria::{MatchCriteria, MatchKey};
use crate::storage::InventoryTx;

/// Candidates for one target binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidates {
    /// Key shared by every candidate.
    pub key: MatchKey,
    /// Matching bindings in the target's cycle, target first.
    pub same_cycle: Vec<BindingRef>,
    /// Best match in each other cycle, most recent first.
    pub other_cycles: Vec<BindingRef>,
}

impl Candidates {
    /// Returns true if the target has no duplicate and no cross-cycle match.
    #[must_use]
    pub fn is_alone(&self) -> bool {
        self.same_cycle.len() <= 1 && self.other_cycles.is_empty()
    }
}

/// Ranking used everywhere candidates are ordered.
///
/// The explicit target comes first, then the most recently modified snapshot;
/// equal timestamps fall back to the lowest binding id.
#[must_use]
pub fn compare_rank(a: &BindingRef, b: &BindingRef, target: Option<BindingId>) -> Ordering {
    let a_target = target == Some(a.binding);
    let b_target = target == Some(b.binding);
    b_target
        .cmp(&a_target)
        .then_with(|| b.updated_at.cmp(&a.updated_at))
        .then_with(|| a.binding.cmp(&b.binding))
}

/// Sorts candidates best first.
pub fn rank(refs: &mut [BindingRef], target: Option<BindingId>) {
    refs.sort_by(|a, b| compare_rank(a, b, target));
}

/// Locates matches for a binding through the repository.
#[derive(Debug, Default, Clone, Copy)]
pub struct CandidateFinder;

impl CandidateFinder {
    /// Finds candidates for `binding` under `criteria`.
    ///
    /// Returns `None` when the binding's snapshot has no populated criteria
    /// column; such a binding is excluded from all automatic matching.
    pub fn find_candidates(
        tx: &dyn InventoryTx,
        binding: &Binding,
        criteria: &MatchCriteria,
    ) -> MatchResult<Option<Candidates>> {
        let snapshot = tx
            .snapshot(binding.snapshot)?
            .ok_or(ExecutionError::SnapshotNotFound {
                id: binding.snapshot,
            })?;
        let Some(key) = criteria.key_for(&snapshot) else {
            return Ok(None);
        };

        let found =
            tx.find_candidate_bindings(binding.organization, binding.kind, None, criteria, &key)?;
        let target = Some(binding.id);

        let mut same_cycle = Vec::new();
        let mut per_cycle: BTreeMap<CycleId, BindingRef> = BTreeMap::new();
        for candidate in found {
            if candidate.cycle == binding.cycle {
                same_cycle.push(candidate);
                continue;
            }
            let better = per_cycle
                .get(&candidate.cycle)
                .map_or(true, |best| compare_rank(best, &candidate, None) == Ordering::Greater);
            if better {
                per_cycle.insert(candidate.cycle, candidate);
            }
        }
        if !same_cycle.iter().any(|c| c.binding == binding.id) {
            same_cycle.push(BindingRef::new(binding, snapshot.updated_at));
        }
        rank(&mut same_cycle, target);

        let mut other_cycles: Vec<BindingRef> = per_cycle.into_values().collect();
        rank(&mut other_cycles, None);

        Ok(Some(Candidates {
            key,
            same_cycle,
            other_cycles,
        }))
    }
}
