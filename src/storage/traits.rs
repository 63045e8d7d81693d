//! Abstract storage traits for matchlink.
//!
//! The engine never talks to a database directly. It opens a transaction on an
//! [`InventoryStore`], reads and writes through [`InventoryTx`], and commits. A
//! transaction dropped without `commit` is rolled back in full. By using traits,
//! we enable:
//! - In-memory backends for testing and embedded use
//! - Relational backends for production
//!
//! Progress records and run locks go through a separate [`KeyValueStore`]
//! capability that is injected into the engine.

use std::time::Duration;

use thiserror::Error;

use crate::audit::AuditEntry;
use crate::binding::{Binding, BindingRef};
use crate::column::ColumnPolicy;
use crate::cycle::Cycle;
use crate::ids::{BindingId, CycleId, IdentityId, MeterId, OrganizationId, SnapshotId};
use crate::inventory::{InventoryKind, InventoryRecord};
use crate::matching::{MatchCriteria, MatchKey};
use crate::meter::{Meter, MeterReading};
use crate::snapshot::Snapshot;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Row not found.
    #[error("{table} not found: {id}")]
    NotFound {
        /// Table name.
        table: &'static str,
        /// Row key.
        id: String,
    },

    /// Key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// A second live binding for one (identity, cycle) was rejected.
    #[error("Identity {identity} already has live binding {existing} in cycle {cycle}")]
    UniqueViolation {
        /// Identity.
        identity: IdentityId,
        /// Cycle.
        cycle: CycleId,
        /// The binding that already holds the slot.
        existing: BindingId,
    },

    /// Any other integrity rule was violated.
    #[error("Constraint violated: {0}")]
    Constraint(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Connection failed.
    #[error("Connection error: {0}")]
    ConnectionError(String),
}

impl StorageError {
    pub(crate) fn not_found(table: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            table,
            id: id.to_string(),
        }
    }

    /// Returns true if the operation may succeed when retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionError(_))
    }
}

/// Transactional access to inventory data.
///
/// # Safety Considerations
/// - `begin` must isolate the transaction from concurrent writers
/// - `commit` applies every write atomically or none of them
pub trait InventoryStore: Send + Sync {
    /// Opens a transaction.
    fn begin(&self) -> Result<Box<dyn InventoryTx + '_>, StorageError>;
}

/// One open transaction.
pub trait InventoryTx {
    /// Cycles of an organization ordered by start.
    fn cycles(&self, organization: OrganizationId) -> Result<Vec<Cycle>, StorageError>;

    /// Get a cycle by ID.
    fn cycle(&self, id: CycleId) -> Result<Option<Cycle>, StorageError>;

    /// Insert a cycle. Rejects overlapping windows within one organization.
    fn insert_cycle(&mut self, cycle: Cycle) -> Result<(), StorageError>;

    /// Column policies configured for (organization, kind).
    fn column_policies(
        &self,
        organization: OrganizationId,
        kind: InventoryKind,
    ) -> Result<Vec<ColumnPolicy>, StorageError>;

    /// Insert or replace a column policy.
    fn put_column_policy(
        &mut self,
        organization: OrganizationId,
        policy: ColumnPolicy,
    ) -> Result<(), StorageError>;

    /// Get a snapshot by ID.
    fn snapshot(&self, id: SnapshotId) -> Result<Option<Snapshot>, StorageError>;

    /// Insert a new snapshot. Returns error if ID already exists.
    fn insert_snapshot(&mut self, snapshot: Snapshot) -> Result<(), StorageError>;

    /// Replace a snapshot that has not been superseded.
    fn update_snapshot(&mut self, snapshot: Snapshot) -> Result<(), StorageError>;

    /// Get an identity by ID.
    fn identity(&self, id: IdentityId) -> Result<Option<InventoryRecord>, StorageError>;

    /// Insert a new identity.
    fn insert_identity(&mut self, record: InventoryRecord) -> Result<(), StorageError>;

    /// Delete an identity. Its meters must already be gone.
    fn delete_identity(&mut self, id: IdentityId) -> Result<(), StorageError>;

    /// Get a binding by ID.
    fn binding(&self, id: BindingId) -> Result<Option<Binding>, StorageError>;

    /// Live bindings of one kind in one cycle.
    fn bindings_in_cycle(
        &self,
        organization: OrganizationId,
        kind: InventoryKind,
        cycle: CycleId,
    ) -> Result<Vec<Binding>, StorageError>;

    /// Live bindings referencing an identity, in any cycle.
    fn bindings_for_identity(&self, identity: IdentityId) -> Result<Vec<Binding>, StorageError>;

    /// Bindings whose snapshot produces `key` under `criteria`.
    ///
    /// Restricted to one cycle when `cycle` is set. Snapshots without a key
    /// never match.
    fn find_candidate_bindings(
        &self,
        organization: OrganizationId,
        kind: InventoryKind,
        cycle: Option<CycleId>,
        criteria: &MatchCriteria,
        key: &MatchKey,
    ) -> Result<Vec<BindingRef>, StorageError>;

    /// Insert a binding. Rejects a second live binding for (identity, cycle).
    fn insert_binding(&mut self, binding: Binding) -> Result<(), StorageError>;

    /// Point a binding at another identity and refresh `established_at`.
    fn repoint_binding(
        &mut self,
        id: BindingId,
        identity: IdentityId,
    ) -> Result<Binding, StorageError>;

    /// Delete a binding.
    fn delete_binding(&mut self, id: BindingId) -> Result<(), StorageError>;

    /// Meters owned by an identity.
    fn meters_for_identity(&self, identity: IdentityId) -> Result<Vec<Meter>, StorageError>;

    /// Insert a meter. Rejects a second meter with the same key on one identity.
    fn insert_meter(&mut self, meter: Meter) -> Result<(), StorageError>;

    /// Delete a meter and its readings.
    fn delete_meter(&mut self, id: MeterId) -> Result<(), StorageError>;

    /// Readings of a meter ordered by window.
    fn readings(&self, meter: MeterId) -> Result<Vec<MeterReading>, StorageError>;

    /// Insert or replace the reading for (meter, start, end); returns the replaced row.
    fn put_reading(&mut self, reading: MeterReading) -> Result<Option<MeterReading>, StorageError>;

    /// Append an audit entry.
    fn append_audit(&mut self, entry: AuditEntry) -> Result<(), StorageError>;

    /// Audit entries of an organization in insertion order.
    fn audit_entries(&self, organization: OrganizationId) -> Result<Vec<AuditEntry>, StorageError>;

    /// Apply all writes atomically.
    fn commit(self: Box<Self>) -> Result<(), StorageError>;
}

/// Key-value capability with expiry, used for progress records and run locks.
pub trait KeyValueStore: Send + Sync {
    /// Get a live value.
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError>;

    /// Set a value, replacing any previous one.
    fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError>;

    /// Set a value only if no live value exists. Returns true if it was set.
    fn set_if_absent(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<bool, StorageError>;

    /// Delete a value. Returns true if a live value was removed.
    fn delete(&self, key: &str) -> Result<bool, StorageError>;
}
