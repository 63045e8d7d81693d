//! Append-only provenance for automatic merges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AuditId, BindingId, CycleId, IdentityId, OrganizationId, SnapshotId};
use crate::inventory::InventoryKind;
use crate::value::Value;

/// Name carried by every audit entry the engine writes on its own.
pub const SYSTEM_MATCH: &str = "System Match";

/// How one field was resolved during a merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    /// Column name.
    pub field: String,
    /// Whether the column lives in extra data.
    pub is_extra_data: bool,
    /// Value held by each parent, in precedence order (lowest first).
    pub before: Vec<(SnapshotId, Value)>,
    /// Value kept in the merged snapshot.
    pub after: Value,
}

/// Provenance record for one merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Entry id.
    pub id: AuditId,
    /// Organization that owns the merged records.
    pub organization: OrganizationId,
    /// Record kind of the merged snapshots.
    pub kind: InventoryKind,
    /// Entry name; [`SYSTEM_MATCH`] for automatic merges.
    pub name: String,
    /// Merged snapshots in precedence order (lowest first).
    pub parents: Vec<SnapshotId>,
    /// Snapshot produced by the merge.
    pub child: SnapshotId,
    /// Binding that now holds the merged snapshot.
    pub binding: BindingId,
    /// Identity the merged binding belongs to.
    pub identity: IdentityId,
    /// Cycle the merge happened in.
    pub cycle: CycleId,
    /// Fields on which the parents disagreed.
    pub changes: Vec<FieldChange>,
    /// When the merge was recorded.
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    /// Returns the change recorded for a field, if it was contested.
    #[must_use]
    pub fn change_for(&self, field: &str) -> Option<&FieldChange> {
        self.changes.iter().find(|c| c.field == field)
    }
}
