//! Bindings join an identity to one snapshot within one cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{BindingId, CycleId, IdentityId, OrganizationId, SnapshotId};
use crate::inventory::InventoryKind;

/// The (identity, cycle, snapshot) join.
///
/// At most one live binding exists per (identity, cycle); the store enforces it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    /// Binding id.
    pub id: BindingId,
    /// Owning organization.
    pub organization: OrganizationId,
    /// Record kind of the bound snapshot.
    pub kind: InventoryKind,
    /// Identity the binding belongs to.
    pub identity: IdentityId,
    /// Cycle the binding lives in.
    pub cycle: CycleId,
    /// Current data of the record in this cycle.
    pub snapshot: SnapshotId,
    /// When the binding was created or last repointed to its current identity.
    pub established_at: DateTime<Utc>,
}

impl Binding {
    /// Creates a binding established now.
    #[must_use]
    pub fn new(
        organization: OrganizationId,
        kind: InventoryKind,
        identity: IdentityId,
        cycle: CycleId,
        snapshot: SnapshotId,
    ) -> Self {
        Self {
            id: BindingId::new(),
            organization,
            kind,
            identity,
            cycle,
            snapshot,
            established_at: Utc::now(),
        }
    }
}

/// Lightweight view of a candidate binding returned by repository queries.
///
/// Carries what ranking needs so the engine does not re-read snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingRef {
    /// Candidate binding.
    pub binding: BindingId,
    /// Identity the candidate belongs to.
    pub identity: IdentityId,
    /// Cycle of the candidate.
    pub cycle: CycleId,
    /// Snapshot bound by the candidate.
    pub snapshot: SnapshotId,
    /// Modification time of the bound snapshot.
    pub updated_at: DateTime<Utc>,
    /// See [`Binding::established_at`].
    pub established_at: DateTime<Utc>,
}

impl BindingRef {
    /// Builds a reference from a binding and its snapshot's modification time.
    #[must_use]
    pub fn new(binding: &Binding, updated_at: DateTime<Utc>) -> Self {
        Self {
            binding: binding.id,
            identity: binding.identity,
            cycle: binding.cycle,
            snapshot: binding.snapshot,
            updated_at,
            established_at: binding.established_at,
        }
    }
}
