use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, TimeZone, Utc};
use crossbeam_channel::{bounded, Receiver, Sender};

use matchlink::{
    AuditEntry, Binding, BindingId, BindingRef, ColumnPolicy, Cycle, CycleId, EngineConfig, IdentityId,
    InMemoryInventoryStore, InMemoryKeyValueStore, InventoryKind, InventoryRecord, InventoryStore, InventoryTx,
    JobRuntime, MatchCriteria, MatchEngine, MatchKey, Meter, MeterId, MeterReading, OrganizationId,
    ProgressStatus, RunSummary, Snapshot, SnapshotId, StorageError, WholeOrgOutcome,
};

const KIND: InventoryKind = InventoryKind::Property;

/// Interception points on top of the in-memory backend.
trait Hooks: Send + Sync {
    fn before_scan(&self, _cycle: CycleId) {}

    fn before_insert(&self, _binding: &Binding) -> Result<(), StorageError> {
        Ok(())
    }
}

struct HookedStore {
    inner: InMemoryInventoryStore,
    hooks: Arc<dyn Hooks>,
}

impl InventoryStore for HookedStore {
    fn begin(&self) -> Result<Box<dyn InventoryTx + '_>, StorageError> {
        Ok(Box::new(HookedTx {
            inner: self.inner.begin()?,
            hooks: self.hooks.as_ref(),
        }))
    }
}

struct HookedTx<'a> {
    inner: Box<dyn InventoryTx + 'a>,
    hooks: &'a dyn Hooks,
}

impl InventoryTx for HookedTx<'_> {
    fn cycles(&self, organization: OrganizationId) -> Result<Vec<Cycle>, StorageError> {
        self.inner.cycles(organization)
    }

    fn cycle(&self, id: CycleId) -> Result<Option<Cycle>, StorageError> {
        self.inner.cycle(id)
    }

    fn insert_cycle(&mut self, cycle: Cycle) -> Result<(), StorageError> {
        self.inner.insert_cycle(cycle)
    }

    fn column_policies(
        &self,
        organization: OrganizationId,
        kind: InventoryKind,
    ) -> Result<Vec<ColumnPolicy>, StorageError> {
        self.inner.column_policies(organization, kind)
    }

    fn put_column_policy(&mut self, organization: OrganizationId, policy: ColumnPolicy) -> Result<(), StorageError> {
        self.inner.put_column_policy(organization, policy)
    }

    fn snapshot(&self, id: SnapshotId) -> Result<Option<Snapshot>, StorageError> {
        self.inner.snapshot(id)
    }

    fn insert_snapshot(&mut self, snapshot: Snapshot) -> Result<(), StorageError> {
        self.inner.insert_snapshot(snapshot)
    }

    fn update_snapshot(&mut self, snapshot: Snapshot) -> Result<(), StorageError> {
        self.inner.update_snapshot(snapshot)
    }

    fn identity(&self, id: IdentityId) -> Result<Option<InventoryRecord>, StorageError> {
        self.inner.identity(id)
    }

    fn insert_identity(&mut self, record: InventoryRecord) -> Result<(), StorageError> {
        self.inner.insert_identity(record)
    }

    fn delete_identity(&mut self, id: IdentityId) -> Result<(), StorageError> {
        self.inner.delete_identity(id)
    }

    fn binding(&self, id: BindingId) -> Result<Option<Binding>, StorageError> {
        self.inner.binding(id)
    }

    fn bindings_in_cycle(
        &self,
        organization: OrganizationId,
        kind: InventoryKind,
        cycle: CycleId,
    ) -> Result<Vec<Binding>, StorageError> {
        self.hooks.before_scan(cycle);
        self.inner.bindings_in_cycle(organization, kind, cycle)
    }

    fn bindings_for_identity(&self, identity: IdentityId) -> Result<Vec<Binding>, StorageError> {
        self.inner.bindings_for_identity(identity)
    }

    fn find_candidate_bindings(
        &self,
        organization: OrganizationId,
        kind: InventoryKind,
        cycle: Option<CycleId>,
        criteria: &MatchCriteria,
        key: &MatchKey,
    ) -> Result<Vec<BindingRef>, StorageError> {
        self.inner
            .find_candidate_bindings(organization, kind, cycle, criteria, key)
    }

    fn insert_binding(&mut self, binding: Binding) -> Result<(), StorageError> {
        self.hooks.before_insert(&binding)?;
        self.inner.insert_binding(binding)
    }

    fn repoint_binding(&mut self, id: BindingId, identity: IdentityId) -> Result<Binding, StorageError> {
        self.inner.repoint_binding(id, identity)
    }

    fn delete_binding(&mut self, id: BindingId) -> Result<(), StorageError> {
        self.inner.delete_binding(id)
    }

    fn meters_for_identity(&self, identity: IdentityId) -> Result<Vec<Meter>, StorageError> {
        self.inner.meters_for_identity(identity)
    }

    fn insert_meter(&mut self, meter: Meter) -> Result<(), StorageError> {
        self.inner.insert_meter(meter)
    }

    fn delete_meter(&mut self, id: MeterId) -> Result<(), StorageError> {
        self.inner.delete_meter(id)
    }

    fn readings(&self, meter: MeterId) -> Result<Vec<MeterReading>, StorageError> {
        self.inner.readings(meter)
    }

    fn put_reading(&mut self, reading: MeterReading) -> Result<Option<MeterReading>, StorageError> {
        self.inner.put_reading(reading)
    }

    fn append_audit(&mut self, entry: AuditEntry) -> Result<(), StorageError> {
        self.inner.append_audit(entry)
    }

    fn audit_entries(&self, organization: OrganizationId) -> Result<Vec<AuditEntry>, StorageError> {
        self.inner.audit_entries(organization)
    }

    fn commit(self: Box<Self>) -> Result<(), StorageError> {
        self.inner.commit()
    }
}

/// Fails binding inserts into one cycle while armed.
struct FailInserts {
    cycle: CycleId,
    armed: AtomicBool,
}

impl Hooks for FailInserts {
    fn before_insert(&self, binding: &Binding) -> Result<(), StorageError> {
        if binding.cycle == self.cycle && self.armed.load(Ordering::SeqCst) {
            return Err(StorageError::BackendError("disk gone".to_string()));
        }
        Ok(())
    }
}

/// Parks the first scan of one cycle until released.
struct Gate {
    cycle: CycleId,
    armed: AtomicBool,
    reached: Sender<()>,
    release: Receiver<()>,
}

impl Hooks for Gate {
    fn before_scan(&self, cycle: CycleId) {
        if cycle == self.cycle && self.armed.swap(false, Ordering::SeqCst) {
            let _ = self.reached.send(());
            let _ = self.release.recv_timeout(StdDuration::from_secs(5));
        }
    }
}

struct Fixture {
    runtime: JobRuntime,
    org: OrganizationId,
    cycles: Vec<CycleId>,
    /// Two duplicate bindings per cycle.
    bindings: Vec<[Binding; 2]>,
}

/// Every cycle holds a duplicate pair keyed "A".
///
/// Cycle ids are drawn up front so the hooks can target one before the store exists.
fn fixture(cycles: Vec<Cycle>, hooks: Arc<dyn Hooks>) -> Fixture {
    let org = cycles[0].organization;
    let store = HookedStore {
        inner: InMemoryInventoryStore::new(),
        hooks,
    };
    let engine = MatchEngine::new(
        Arc::new(store),
        Arc::new(InMemoryKeyValueStore::new()),
        EngineConfig::default(),
    );

    let ids: Vec<CycleId> = cycles.iter().map(|c| c.id).collect();
    let mut bindings = Vec::new();
    {
        let mut tx = engine.store().begin().unwrap();
        for cycle in cycles {
            tx.insert_cycle(cycle).unwrap();
        }
        for (c, cycle) in ids.iter().enumerate() {
            let mut pair = Vec::new();
            for n in 0..2i64 {
                let snapshot = Snapshot::builder()
                    .organization(org)
                    .kind(KIND)
                    .field("custom_id_1", "A")
                    .updated_at(Utc::now() - Duration::days(1) + Duration::minutes(c as i64 * 10 + n))
                    .build()
                    .unwrap();
                let record = InventoryRecord::new(org, KIND);
                let binding = Binding::new(org, KIND, record.id, *cycle, snapshot.id);
                tx.insert_identity(record).unwrap();
                tx.insert_snapshot(snapshot).unwrap();
                tx.insert_binding(binding.clone()).unwrap();
                pair.push(binding);
            }
            bindings.push([pair[0].clone(), pair[1].clone()]);
        }
        tx.commit().unwrap();
    }

    Fixture {
        runtime: JobRuntime::new(engine),
        org,
        cycles: ids,
        bindings,
    }
}

fn cycles(org: OrganizationId, count: i32) -> Vec<Cycle> {
    (0..count)
        .map(|y| {
            Cycle::new(
                org,
                format!("{}", 2020 + y),
                Utc.with_ymd_and_hms(2020 + y, 1, 1, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2021 + y, 1, 1, 0, 0, 0).unwrap(),
            )
        })
        .collect()
}

fn live_ids(f: &Fixture, cycle: usize) -> HashSet<BindingId> {
    let tx = f.runtime.engine().store().begin().unwrap();
    tx.bindings_in_cycle(f.org, KIND, f.cycles[cycle])
        .unwrap()
        .into_iter()
        .map(|b| b.id)
        .collect()
}

fn committed(outcome: WholeOrgOutcome) -> RunSummary {
    match outcome {
        WholeOrgOutcome::Committed(run) => run,
        WholeOrgOutcome::Preview { .. } => panic!("expected a committed run"),
    }
}

#[test]
fn failing_cycle_rolls_back_alone_and_run_warns() {
    let org = OrganizationId::new();
    let planned = cycles(org, 3);
    let hooks = Arc::new(FailInserts {
        cycle: planned[1].id,
        armed: AtomicBool::new(false),
    });
    let f = fixture(planned, hooks.clone());

    hooks.armed.store(true, Ordering::SeqCst);
    let handle = f.runtime.submit_whole_org(f.org, KIND, None).unwrap();
    let key = handle.progress_key().to_string();
    let run = committed(handle.join_timeout(StdDuration::from_secs(5)).unwrap());
    hooks.armed.store(false, Ordering::SeqCst);

    assert!(run.has_failures());
    assert!(!run.cancelled);
    assert_eq!(run.cycles.len(), 3);
    assert_eq!(run.cycles[0].merged_count, 2);
    assert_eq!(run.cycles[2].merged_count, 2);

    let failed = &run.cycles[1];
    assert_eq!(failed.merged_count, 0);
    assert!(failed.error.as_deref().unwrap().contains("disk gone"));
    let trace = failed.trace.as_deref().unwrap();
    assert!(trace.starts_with("Storage(BackendError("));
    assert!(trace.contains("caused by: Storage backend error: disk gone"));

    // The merge child was staged, then discarded with the whole unit.
    let original: HashSet<BindingId> = f.bindings[1].iter().map(|b| b.id).collect();
    assert_eq!(live_ids(&f, 1), original);
    assert_eq!(live_ids(&f, 0).len(), 1);
    assert_eq!(live_ids(&f, 2).len(), 1);
    {
        let tx = f.runtime.engine().store().begin().unwrap();
        assert_eq!(tx.audit_entries(f.org).unwrap().len(), 2);
    }

    let progress = f.runtime.progress(&key).unwrap().unwrap();
    assert_eq!(progress.status, ProgressStatus::Warning);
    assert_eq!(progress.progress, 100);
    let trace = progress.trace.unwrap();
    assert!(trace.contains("cycle 2021"));
    assert!(trace.contains("disk gone"));
    let summary = progress.summary.unwrap();
    assert!(summary["cycles"][1]["error"].as_str().unwrap().contains("disk gone"));
}

#[test]
fn cancellation_keeps_committed_cycles_and_warns() {
    let org = OrganizationId::new();
    let planned = cycles(org, 3);
    let (reached_tx, reached) = bounded(1);
    let (release, release_rx) = bounded(1);
    let gate = Arc::new(Gate {
        cycle: planned[1].id,
        armed: AtomicBool::new(false),
        reached: reached_tx,
        release: release_rx,
    });
    let f = fixture(planned, gate.clone());

    gate.armed.store(true, Ordering::SeqCst);
    let handle = f.runtime.submit_whole_org(f.org, KIND, None).unwrap();
    let key = handle.progress_key().to_string();

    // The worker is inside cycle 1; cancel takes effect before cycle 2.
    reached.recv_timeout(StdDuration::from_secs(5)).unwrap();
    handle.cancel();
    release.send(()).unwrap();

    let run = committed(handle.join_timeout(StdDuration::from_secs(5)).unwrap());
    assert!(run.cancelled);
    assert!(!run.has_failures());
    assert_eq!(run.cycles.len(), 2);
    assert_eq!(run.merged_count(), 4);

    assert_eq!(live_ids(&f, 0).len(), 1);
    assert_eq!(live_ids(&f, 1).len(), 1);
    let untouched: HashSet<BindingId> = f.bindings[2].iter().map(|b| b.id).collect();
    assert_eq!(live_ids(&f, 2), untouched);

    let progress = f.runtime.progress(&key).unwrap().unwrap();
    assert_eq!(progress.status, ProgressStatus::Warning);
    assert!(progress.message.starts_with("Cancelled after 2"));
    assert!(progress.trace.is_none());
}
