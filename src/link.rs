//! Link manager: one shared identity per entity across cycles.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::binding::Binding;
use crate::error::{ExecutionError, LinkIntegrityError, MatchError, MatchResult};
use crate::ids::{BindingId, CycleId, IdentityId};
use crate::inventory::InventoryRecord;
use crate::reconcile::{MeterReconciler, ReconcileSummary};
use crate::storage::{InventoryTx, StorageError};

/// What a link step changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkOutcome {
    /// Identity now shared by every member.
    pub identity: IdentityId,
    /// Members moved onto `identity`.
    pub repointed: Vec<BindingId>,
    /// A fresh identity had to be allocated.
    pub unlinked: bool,
    /// Identities left without bindings and removed.
    pub pruned: Vec<IdentityId>,
    /// Meter changes caused by repointing.
    pub meters: ReconcileSummary,
}

impl LinkOutcome {
    /// Returns true if set membership changed.
    #[must_use]
    pub fn changed(&self) -> bool {
        !self.repointed.is_empty()
    }
}

/// Maintains shared identities.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinkManager;

impl LinkManager {
    /// Gives `target` and `representatives` (at most one binding per cycle) one identity.
    ///
    /// An identity already shared by several members is reused; otherwise the
    /// identity of the most recently established member is. Identities still
    /// bound outside the set are never chosen, and when none qualifies a fresh
    /// identity is allocated. Meters follow the members and identities left
    /// without bindings are pruned.
    ///
    /// # Errors
    ///
    /// [`LinkIntegrityError`] before any write when two members share a cycle.
    #[instrument(skip(tx, target, representatives), fields(target = %target.id, members = representatives.len() + 1), level = "debug")]
    pub fn link(
        tx: &mut dyn InventoryTx,
        target: &Binding,
        representatives: &[Binding],
    ) -> MatchResult<LinkOutcome> {
        let members: Vec<&Binding> = std::iter::once(target)
            .chain(representatives.iter().filter(|r| r.id != target.id))
            .collect();

        let mut by_cycle: HashMap<CycleId, &Binding> = HashMap::with_capacity(members.len());
        for member in &members {
            if let Some(existing) = by_cycle.insert(member.cycle, *member) {
                return Err(LinkIntegrityError {
                    identity: existing.identity,
                    cycle: member.cycle,
                    existing: existing.id,
                    incoming: member.id,
                }
                .into());
            }
        }

        let member_ids: HashSet<BindingId> = members.iter().map(|m| m.id).collect();
        let mut tally: Vec<(IdentityId, usize)> = Vec::new();
        for member in &members {
            match tally.iter_mut().find(|(id, _)| *id == member.identity) {
                Some((_, count)) => *count += 1,
                None => tally.push((member.identity, 1)),
            }
        }
        let mut eligible: HashSet<IdentityId> = HashSet::with_capacity(tally.len());
        for (identity, _) in &tally {
            let outsiders = tx
                .bindings_for_identity(*identity)?
                .iter()
                .any(|b| !member_ids.contains(&b.id));
            if !outsiders {
                eligible.insert(*identity);
            }
        }

        // Tally is in member order and `min_by_key` keeps the first of equal
        // elements, so ties go to the best-ranked holder.
        let shared = tally
            .iter()
            .filter(|(id, count)| *count > 1 && eligible.contains(id))
            .min_by_key(|(_, count)| std::cmp::Reverse(*count))
            .map(|(id, _)| *id);
        let latest = || {
            members
                .iter()
                .filter(|m| eligible.contains(&m.identity))
                .max_by(|a, b| {
                    a.established_at
                        .cmp(&b.established_at)
                        .then_with(|| b.id.cmp(&a.id))
                })
                .map(|m| m.identity)
        };

        let (identity, unlinked) = match shared.or_else(latest) {
            Some(identity) => (identity, false),
            None => {
                let fresh = InventoryRecord::new(target.organization, target.kind);
                let id = fresh.id;
                tx.insert_identity(fresh)?;
                (id, true)
            }
        };

        let mut repointed = Vec::new();
        let mut previous: Vec<IdentityId> = Vec::new();
        for member in &members {
            if member.identity == identity {
                continue;
            }
            tx.repoint_binding(member.id, identity)
                .map_err(|e| integrity_violation(e, member.id))?;
            repointed.push(member.id);
            if !previous.contains(&member.identity) {
                previous.push(member.identity);
            }
        }

        // Best-ranked member's meters go last so they win creation-time ties.
        previous.reverse();
        let meters = MeterReconciler::reconcile(tx, identity, &previous)?;
        let mut pruned = Vec::new();
        for old in previous {
            if MeterReconciler::prune_identity(tx, old)? {
                pruned.push(old);
            }
        }

        if !repointed.is_empty() {
            debug!(
                identity = %identity,
                repointed = repointed.len(),
                pruned = pruned.len(),
                unlinked,
                "linked bindings"
            );
        }
        Ok(LinkOutcome {
            identity,
            repointed,
            unlinked,
            pruned,
            meters,
        })
    }

    /// Detaches a binding onto an identity of its own.
    ///
    /// Meters are copied, so both identities keep their full history. A binding
    /// that is already alone on its identity is left as is.
    pub fn unlink(tx: &mut dyn InventoryTx, binding: BindingId) -> MatchResult<IdentityId> {
        let current = tx
            .binding(binding)?
            .ok_or(ExecutionError::BindingNotFound { id: binding })?;
        let shared = tx
            .bindings_for_identity(current.identity)?
            .iter()
            .any(|b| b.id != current.id);
        if !shared {
            return Ok(current.identity);
        }

        let fresh = InventoryRecord::new(current.organization, current.kind);
        let identity = fresh.id;
        tx.insert_identity(fresh)?;
        tx.repoint_binding(current.id, identity)
            .map_err(|e| integrity_violation(e, current.id))?;
        let copied = MeterReconciler::copy_meters(tx, current.identity, identity)?;
        debug!(
            binding = %binding,
            from = %current.identity,
            to = %identity,
            meters = copied.meters_created,
            "unlinked binding"
        );
        Ok(identity)
    }
}

fn integrity_violation(err: StorageError, incoming: BindingId) -> MatchError {
    match err {
        StorageError::UniqueViolation {
            identity,
            cycle,
            existing,
        } => LinkIntegrityError {
            identity,
            cycle,
            existing,
            incoming,
        }
        .into(),
        other => other.into(),
    }
}
