//! In-memory storage backend.
//!
//! This module provides thread-safe in-memory implementations of the storage traits.
//! It is intended for embedded usage, tests, and as a reference implementation.
//!
//! Transactions are serializable: `begin` takes the store lock for the lifetime of
//! the transaction and works on a staged copy that `commit` swaps in. Opening a
//! transaction therefore costs a full copy of the state, which suits tests and
//! small embedded inventories rather than large deployments.
//!
//! Candidate lookups go through a per-transaction [`KeyIndex`] built on first use
//! for an (organization, kind, criteria) scope and maintained as bindings and
//! snapshots change, so a batch cycle does not rescan every binding per survivor.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::audit::AuditEntry;
use crate::binding::{Binding, BindingRef};
use crate::column::ColumnPolicy;
use crate::cycle::Cycle;
use crate::ids::{BindingId, CycleId, IdentityId, MeterId, OrganizationId, SnapshotId};
use crate::inventory::{InventoryKind, InventoryRecord};
use crate::matching::{MatchCriteria, MatchKey};
use crate::meter::{Meter, MeterReading};
use crate::snapshot::Snapshot;
use crate::storage::traits::{InventoryStore, InventoryTx, KeyValueStore, StorageError};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

type Window = (DateTime<Utc>, DateTime<Utc>);

#[derive(Debug, Clone, Default)]
struct InventoryState {
    cycles: HashMap<CycleId, Cycle>,
    policies: HashMap<(OrganizationId, InventoryKind), BTreeMap<(bool, String), ColumnPolicy>>,
    snapshots: HashMap<SnapshotId, Snapshot>,
    identities: HashMap<IdentityId, InventoryRecord>,
    bindings: HashMap<BindingId, Binding>,
    slots: HashMap<(IdentityId, CycleId), BindingId>,
    meters: HashMap<MeterId, Meter>,
    readings: HashMap<MeterId, BTreeMap<Window, MeterReading>>,
    audit: Vec<AuditEntry>,
}

impl InventoryState {
    fn claim_slot(&mut self, binding: &Binding) -> Result<(), StorageError> {
        let slot = (binding.identity, binding.cycle);
        match self.slots.get(&slot) {
            Some(existing) if *existing != binding.id => Err(StorageError::UniqueViolation {
                identity: binding.identity,
                cycle: binding.cycle,
                existing: *existing,
            }),
            _ => {
                self.slots.insert(slot, binding.id);
                Ok(())
            }
        }
    }

    fn release_slot(&mut self, binding: &Binding) {
        let slot = (binding.identity, binding.cycle);
        if self.slots.get(&slot) == Some(&binding.id) {
            self.slots.remove(&slot);
        }
    }
}

/// Match keys of the live bindings in one (organization, kind) scope.
///
/// Entries may go stale as bindings are deleted or snapshots change key;
/// lookups re-check every hit against the staged state.
#[derive(Debug)]
struct KeyIndex {
    organization: OrganizationId,
    kind: InventoryKind,
    criteria: MatchCriteria,
    by_key: HashMap<MatchKey, BTreeSet<BindingId>>,
    by_snapshot: HashMap<SnapshotId, BTreeSet<BindingId>>,
}

impl KeyIndex {
    fn build(
        state: &InventoryState,
        organization: OrganizationId,
        kind: InventoryKind,
        criteria: &MatchCriteria,
    ) -> Self {
        let mut index = Self {
            organization,
            kind,
            criteria: criteria.clone(),
            by_key: HashMap::new(),
            by_snapshot: HashMap::new(),
        };
        for binding in state.bindings.values() {
            index.add(state, binding);
        }
        index
    }

    fn covers(&self, organization: OrganizationId, kind: InventoryKind, criteria: &MatchCriteria) -> bool {
        self.organization == organization && self.kind == kind && &self.criteria == criteria
    }

    fn add(&mut self, state: &InventoryState, binding: &Binding) {
        if binding.organization != self.organization || binding.kind != self.kind {
            return;
        }
        self.by_snapshot.entry(binding.snapshot).or_default().insert(binding.id);
        if let Some(key) = state.snapshots.get(&binding.snapshot).and_then(|s| self.criteria.key_for(s)) {
            self.by_key.entry(key).or_default().insert(binding.id);
        }
    }

    fn rekey(&mut self, snapshot: &Snapshot) {
        let Some(bindings) = self.by_snapshot.get(&snapshot.id) else {
            return;
        };
        if let Some(key) = self.criteria.key_for(snapshot) {
            self.by_key.entry(key).or_default().extend(bindings.iter().copied());
        }
    }
}

/// Thread-safe in-memory inventory store.
///
/// Reference backend for tests and small embedded use; see the module docs for
/// its cost model.
#[derive(Debug, Default)]
pub struct InMemoryInventoryStore {
    state: Mutex<InventoryState>,
}

impl InMemoryInventoryStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl InventoryStore for InMemoryInventoryStore {
    fn begin(&self) -> Result<Box<dyn InventoryTx + '_>, StorageError> {
        let guard = self.state.lock().map_err(|_| lock_err("inventory.begin"))?;
        let staged = guard.clone();
        Ok(Box::new(InMemoryInventoryTx {
            guard,
            staged,
            index: RefCell::new(None),
        }))
    }
}

/// Transaction over [`InMemoryInventoryStore`].
pub struct InMemoryInventoryTx<'a> {
    guard: MutexGuard<'a, InventoryState>,
    staged: InventoryState,
    index: RefCell<Option<KeyIndex>>,
}

impl InventoryTx for InMemoryInventoryTx<'_> {
    fn cycles(&self, organization: OrganizationId) -> Result<Vec<Cycle>, StorageError> {
        let mut out: Vec<Cycle> = self
            .staged
            .cycles
            .values()
            .filter(|c| c.organization == organization)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.start.cmp(&b.start).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    fn cycle(&self, id: CycleId) -> Result<Option<Cycle>, StorageError> {
        Ok(self.staged.cycles.get(&id).cloned())
    }

    fn insert_cycle(&mut self, cycle: Cycle) -> Result<(), StorageError> {
        if self.staged.cycles.contains_key(&cycle.id) {
            return Err(StorageError::DuplicateKey(cycle.id.to_string()));
        }
        if !cycle.is_valid() {
            return Err(StorageError::Constraint(format!(
                "cycle '{}' must start before it ends",
                cycle.name
            )));
        }
        if let Some(other) = self
            .staged
            .cycles
            .values()
            .find(|c| c.organization == cycle.organization && c.overlaps(&cycle))
        {
            return Err(StorageError::Constraint(format!(
                "cycle '{}' overlaps cycle '{}'",
                cycle.name, other.name
            )));
        }
        self.staged.cycles.insert(cycle.id, cycle);
        Ok(())
    }

    fn column_policies(
        &self,
        organization: OrganizationId,
        kind: InventoryKind,
    ) -> Result<Vec<ColumnPolicy>, StorageError> {
        Ok(self
            .staged
            .policies
            .get(&(organization, kind))
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default())
    }

    fn put_column_policy(
        &mut self,
        organization: OrganizationId,
        policy: ColumnPolicy,
    ) -> Result<(), StorageError> {
        self.staged
            .policies
            .entry((organization, policy.kind))
            .or_default()
            .insert((policy.is_extra_data, policy.name.clone()), policy);
        Ok(())
    }

    fn snapshot(&self, id: SnapshotId) -> Result<Option<Snapshot>, StorageError> {
        Ok(self.staged.snapshots.get(&id).cloned())
    }

    fn insert_snapshot(&mut self, snapshot: Snapshot) -> Result<(), StorageError> {
        if self.staged.snapshots.contains_key(&snapshot.id) {
            return Err(StorageError::DuplicateKey(snapshot.id.to_string()));
        }
        self.staged.snapshots.insert(snapshot.id, snapshot);
        Ok(())
    }

    fn update_snapshot(&mut self, snapshot: Snapshot) -> Result<(), StorageError> {
        if !self.staged.snapshots.contains_key(&snapshot.id) {
            return Err(StorageError::not_found("snapshot", snapshot.id));
        }
        let superseded = self.staged.audit.iter().any(|a| a.parents.contains(&snapshot.id));
        if superseded {
            return Err(StorageError::Constraint(format!(
                "snapshot {} has been superseded and is immutable",
                snapshot.id
            )));
        }
        if let Some(index) = self.index.get_mut().as_mut() {
            index.rekey(&snapshot);
        }
        self.staged.snapshots.insert(snapshot.id, snapshot);
        Ok(())
    }

    fn identity(&self, id: IdentityId) -> Result<Option<InventoryRecord>, StorageError> {
        Ok(self.staged.identities.get(&id).cloned())
    }

    fn insert_identity(&mut self, record: InventoryRecord) -> Result<(), StorageError> {
        if self.staged.identities.contains_key(&record.id) {
            return Err(StorageError::DuplicateKey(record.id.to_string()));
        }
        self.staged.identities.insert(record.id, record);
        Ok(())
    }

    fn delete_identity(&mut self, id: IdentityId) -> Result<(), StorageError> {
        if self.staged.slots.keys().any(|(identity, _)| *identity == id) {
            return Err(StorageError::Constraint(format!(
                "identity {id} still has live bindings"
            )));
        }
        if self.staged.meters.values().any(|m| m.identity == id) {
            return Err(StorageError::Constraint(format!("identity {id} still owns meters")));
        }
        self.staged
            .identities
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StorageError::not_found("identity", id))
    }

    fn binding(&self, id: BindingId) -> Result<Option<Binding>, StorageError> {
        Ok(self.staged.bindings.get(&id).cloned())
    }

    fn bindings_in_cycle(
        &self,
        organization: OrganizationId,
        kind: InventoryKind,
        cycle: CycleId,
    ) -> Result<Vec<Binding>, StorageError> {
        let mut out: Vec<Binding> = self
            .staged
            .bindings
            .values()
            .filter(|b| b.organization == organization && b.kind == kind && b.cycle == cycle)
            .cloned()
            .collect();
        out.sort_by_key(|b| b.id);
        Ok(out)
    }

    fn bindings_for_identity(&self, identity: IdentityId) -> Result<Vec<Binding>, StorageError> {
        let mut out: Vec<Binding> = self
            .staged
            .slots
            .iter()
            .filter(|((id, _), _)| *id == identity)
            .filter_map(|(_, binding)| self.staged.bindings.get(binding).cloned())
            .collect();
        out.sort_by_key(|b| b.id);
        Ok(out)
    }

    fn find_candidate_bindings(
        &self,
        organization: OrganizationId,
        kind: InventoryKind,
        cycle: Option<CycleId>,
        criteria: &MatchCriteria,
        key: &MatchKey,
    ) -> Result<Vec<BindingRef>, StorageError> {
        let mut index = self.index.borrow_mut();
        if !index.as_ref().is_some_and(|i| i.covers(organization, kind, criteria)) {
            *index = Some(KeyIndex::build(&self.staged, organization, kind, criteria));
        }
        let Some(hits) = index.as_ref().and_then(|i| i.by_key.get(key)) else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        for id in hits {
            let Some(binding) = self.staged.bindings.get(id) else {
                continue;
            };
            if cycle.is_some_and(|c| c != binding.cycle) {
                continue;
            }
            let snapshot = self
                .staged
                .snapshots
                .get(&binding.snapshot)
                .ok_or_else(|| StorageError::not_found("snapshot", binding.snapshot))?;
            if !snapshot.is_live() {
                continue;
            }
            if criteria.key_for(snapshot).as_ref() == Some(key) {
                out.push(BindingRef::new(binding, snapshot.updated_at));
            }
        }
        out.sort_by_key(|r| r.binding);
        Ok(out)
    }

    fn insert_binding(&mut self, binding: Binding) -> Result<(), StorageError> {
        if self.staged.bindings.contains_key(&binding.id) {
            return Err(StorageError::DuplicateKey(binding.id.to_string()));
        }
        if !self.staged.identities.contains_key(&binding.identity) {
            return Err(StorageError::not_found("identity", binding.identity));
        }
        if !self.staged.snapshots.contains_key(&binding.snapshot) {
            return Err(StorageError::not_found("snapshot", binding.snapshot));
        }
        self.staged.claim_slot(&binding)?;
        if let Some(index) = self.index.get_mut().as_mut() {
            index.add(&self.staged, &binding);
        }
        self.staged.bindings.insert(binding.id, binding);
        Ok(())
    }

    fn repoint_binding(
        &mut self,
        id: BindingId,
        identity: IdentityId,
    ) -> Result<Binding, StorageError> {
        if !self.staged.identities.contains_key(&identity) {
            return Err(StorageError::not_found("identity", identity));
        }
        let current = self
            .staged
            .bindings
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("binding", id))?;
        let updated = Binding {
            identity,
            established_at: Utc::now(),
            ..current.clone()
        };
        self.staged.claim_slot(&updated)?;
        self.staged.release_slot(&current);
        self.staged.bindings.insert(id, updated.clone());
        Ok(updated)
    }

    fn delete_binding(&mut self, id: BindingId) -> Result<(), StorageError> {
        let binding = self
            .staged
            .bindings
            .remove(&id)
            .ok_or_else(|| StorageError::not_found("binding", id))?;
        self.staged.release_slot(&binding);
        Ok(())
    }

    fn meters_for_identity(&self, identity: IdentityId) -> Result<Vec<Meter>, StorageError> {
        let mut out: Vec<Meter> = self
            .staged
            .meters
            .values()
            .filter(|m| m.identity == identity)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    fn insert_meter(&mut self, meter: Meter) -> Result<(), StorageError> {
        if self.staged.meters.contains_key(&meter.id) {
            return Err(StorageError::DuplicateKey(meter.id.to_string()));
        }
        if self
            .staged
            .meters
            .values()
            .any(|m| m.identity == meter.identity && m.key == meter.key)
        {
            return Err(StorageError::DuplicateKey(format!(
                "meter {} on identity {}",
                meter.key, meter.identity
            )));
        }
        self.staged.meters.insert(meter.id, meter);
        Ok(())
    }

    fn delete_meter(&mut self, id: MeterId) -> Result<(), StorageError> {
        self.staged
            .meters
            .remove(&id)
            .ok_or_else(|| StorageError::not_found("meter", id))?;
        self.staged.readings.remove(&id);
        Ok(())
    }

    fn readings(&self, meter: MeterId) -> Result<Vec<MeterReading>, StorageError> {
        Ok(self
            .staged
            .readings
            .get(&meter)
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default())
    }

    fn put_reading(&mut self, reading: MeterReading) -> Result<Option<MeterReading>, StorageError> {
        if !self.staged.meters.contains_key(&reading.meter) {
            return Err(StorageError::not_found("meter", reading.meter));
        }
        if reading.start_time >= reading.end_time {
            return Err(StorageError::Constraint(format!(
                "reading window {}..{} is empty",
                reading.start_time, reading.end_time
            )));
        }
        Ok(self
            .staged
            .readings
            .entry(reading.meter)
            .or_default()
            .insert(reading.window(), reading))
    }

    fn append_audit(&mut self, entry: AuditEntry) -> Result<(), StorageError> {
        if self.staged.audit.iter().any(|a| a.id == entry.id) {
            return Err(StorageError::DuplicateKey(entry.id.to_string()));
        }
        self.staged.audit.push(entry);
        Ok(())
    }

    fn audit_entries(&self, organization: OrganizationId) -> Result<Vec<AuditEntry>, StorageError> {
        Ok(self
            .staged
            .audit
            .iter()
            .filter(|a| a.organization == organization)
            .cloned()
            .collect())
    }

    fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let Self { mut guard, staged, .. } = *self;
        *guard = staged;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct KvEntry {
    value: serde_json::Value,
    expires_at: Option<Instant>,
}

impl KvEntry {
    fn new(value: serde_json::Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Thread-safe in-memory key-value store with per-key expiry.
#[derive(Debug, Default)]
pub struct InMemoryKeyValueStore {
    state: RwLock<HashMap<String, KvEntry>>,
}

impl InMemoryKeyValueStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for InMemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("kv.get"))?;
        let now = Instant::now();
        Ok(state
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("kv.set"))?;
        state.insert(key.to_string(), KvEntry::new(value, ttl));
        Ok(())
    }

    fn set_if_absent(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<bool, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("kv.set_if_absent"))?;
        let now = Instant::now();
        if state.get(key).is_some_and(|e| e.is_live(now)) {
            return Ok(false);
        }
        state.insert(key.to_string(), KvEntry::new(value, ttl));
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("kv.delete"))?;
        let now = Instant::now();
        Ok(state.remove(key).is_some_and(|e| e.is_live(now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use crate::ids::OrganizationId;

    fn cycle(org: OrganizationId, year: i32) -> Cycle {
        Cycle::new(
            org,
            year.to_string(),
            Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(year + 1, 1, 1, 0, 0, 0).unwrap(),
        )
    }

    fn snapshot(org: OrganizationId) -> Snapshot {
        Snapshot::builder()
            .organization(org)
            .kind(InventoryKind::Property)
            .field("custom_id_1", "A")
            .build()
            .unwrap()
    }

    #[test]
    fn test_uncommitted_tx_rolls_back() {
        let store = InMemoryInventoryStore::new();
        let org = OrganizationId::new();
        {
            let mut tx = store.begin().unwrap();
            tx.insert_cycle(cycle(org, 2020)).unwrap();
        }
        let tx = store.begin().unwrap();
        assert!(tx.cycles(org).unwrap().is_empty());
    }

    #[test]
    fn test_committed_tx_is_visible() {
        let store = InMemoryInventoryStore::new();
        let org = OrganizationId::new();
        let mut tx = store.begin().unwrap();
        tx.insert_cycle(cycle(org, 2021)).unwrap();
        tx.insert_cycle(cycle(org, 2020)).unwrap();
        tx.commit().unwrap();

        let tx = store.begin().unwrap();
        let names: Vec<String> = tx.cycles(org).unwrap().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["2020", "2021"]);
    }

    #[test]
    fn test_overlapping_cycles_rejected() {
        let store = InMemoryInventoryStore::new();
        let org = OrganizationId::new();
        let mut tx = store.begin().unwrap();
        tx.insert_cycle(cycle(org, 2020)).unwrap();
        let mut overlapping = cycle(org, 2020);
        overlapping.name = "dup".to_string();
        let err = tx.insert_cycle(overlapping).unwrap_err();
        assert!(matches!(err, StorageError::Constraint(_)));
        // Other organizations may reuse the window.
        tx.insert_cycle(cycle(OrganizationId::new(), 2020)).unwrap();
    }

    #[test]
    fn test_second_binding_for_identity_and_cycle_rejected() {
        let store = InMemoryInventoryStore::new();
        let org = OrganizationId::new();
        let mut tx = store.begin().unwrap();
        let c = cycle(org, 2020);
        let cycle_id = c.id;
        tx.insert_cycle(c).unwrap();
        let identity = InventoryRecord::new(org, InventoryKind::Property);
        let identity_id = identity.id;
        tx.insert_identity(identity).unwrap();
        let (s1, s2) = (snapshot(org), snapshot(org));
        let (s1_id, s2_id) = (s1.id, s2.id);
        tx.insert_snapshot(s1).unwrap();
        tx.insert_snapshot(s2).unwrap();

        let first = Binding::new(org, InventoryKind::Property, identity_id, cycle_id, s1_id);
        let first_id = first.id;
        tx.insert_binding(first).unwrap();
        let second = Binding::new(org, InventoryKind::Property, identity_id, cycle_id, s2_id);
        let err = tx.insert_binding(second).unwrap_err();
        assert!(matches!(err, StorageError::UniqueViolation { existing, .. } if existing == first_id));

        tx.delete_binding(first_id).unwrap();
        assert!(tx.bindings_for_identity(identity_id).unwrap().is_empty());
        tx.delete_identity(identity_id).unwrap();
    }

    #[test]
    fn test_candidates_follow_writes_and_skip_unpromoted() {
        let store = InMemoryInventoryStore::new();
        let org = OrganizationId::new();
        let criteria = MatchCriteria::canonical(&["custom_id_1"]);
        let mut tx = store.begin().unwrap();
        let c = cycle(org, 2020);
        let cycle_id = c.id;
        tx.insert_cycle(c).unwrap();

        fn bind(tx: &mut dyn InventoryTx, cycle: CycleId, snapshot: Snapshot) -> Binding {
            let identity = InventoryRecord::new(snapshot.organization, InventoryKind::Property);
            let binding =
                Binding::new(snapshot.organization, InventoryKind::Property, identity.id, cycle, snapshot.id);
            tx.insert_identity(identity).unwrap();
            tx.insert_snapshot(snapshot).unwrap();
            tx.insert_binding(binding.clone()).unwrap();
            binding
        }

        let first = snapshot(org);
        let key = criteria.key_for(&first).unwrap();
        let live = bind(tx.as_mut(), cycle_id, first);
        let mut mapped = snapshot(org);
        mapped.data_stage = crate::snapshot::DataStage::Mapped;
        bind(tx.as_mut(), cycle_id, mapped);

        let found = tx
            .find_candidate_bindings(org, InventoryKind::Property, None, &criteria, &key)
            .unwrap();
        assert_eq!(found.iter().map(|r| r.binding).collect::<Vec<_>>(), vec![live.id]);

        // Written after the first lookup.
        let mut other = snapshot(org);
        other.set_field("custom_id_1", "B");
        let other_id = other.id;
        let late = bind(tx.as_mut(), cycle_id, other);
        let mut other = tx.snapshot(other_id).unwrap().unwrap();
        other.set_field("custom_id_1", "A");
        tx.update_snapshot(other).unwrap();
        let mut moved = tx.snapshot(live.snapshot).unwrap().unwrap();
        moved.set_field("custom_id_1", "C");
        tx.update_snapshot(moved).unwrap();

        let found = tx
            .find_candidate_bindings(org, InventoryKind::Property, Some(cycle_id), &criteria, &key)
            .unwrap();
        assert_eq!(found.iter().map(|r| r.binding).collect::<Vec<_>>(), vec![late.id]);

        tx.delete_binding(late.id).unwrap();
        assert!(tx
            .find_candidate_bindings(org, InventoryKind::Property, None, &criteria, &key)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_put_reading_replaces_same_window() {
        let store = InMemoryInventoryStore::new();
        let mut tx = store.begin().unwrap();
        let org = OrganizationId::new();
        let identity = InventoryRecord::new(org, InventoryKind::Property);
        let meter = Meter::new(
            identity.id,
            crate::meter::MeterKey::new(crate::meter::MeterSource::Manual, "m1", "Electric"),
        );
        let meter_id = meter.id;
        tx.insert_identity(identity).unwrap();
        tx.insert_meter(meter).unwrap();

        let start = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let reading = MeterReading {
            meter: meter_id,
            start_time: start,
            end_time: start + chrono::Duration::days(31),
            value: 1.0,
            unit: "kWh".to_string(),
            conversion_factor: 3.412,
            created_at: start,
        };
        assert!(tx.put_reading(reading.clone()).unwrap().is_none());
        let replaced = tx
            .put_reading(MeterReading {
                value: 2.0,
                ..reading
            })
            .unwrap();
        assert_eq!(replaced.map(|r| r.value), Some(1.0));
        assert_eq!(tx.readings(meter_id).unwrap().len(), 1);
    }

    #[test]
    fn test_kv_set_if_absent_and_expiry() {
        let kv = InMemoryKeyValueStore::new();
        assert!(kv.set_if_absent("lock", serde_json::json!(1), None).unwrap());
        assert!(!kv.set_if_absent("lock", serde_json::json!(2), None).unwrap());
        assert_eq!(kv.get("lock").unwrap(), Some(serde_json::json!(1)));
        assert!(kv.delete("lock").unwrap());
        assert!(!kv.delete("lock").unwrap());

        kv.set("short", serde_json::json!("x"), Some(Duration::from_millis(1))).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(kv.get("short").unwrap(), None);
        assert!(kv.set_if_absent("short", serde_json::json!("y"), None).unwrap());
    }
}
