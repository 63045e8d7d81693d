use std::collections::{HashMap, HashSet};
use std::time::Duration as StdDuration;

use chrono::{Duration, TimeZone, Utc};

use matchlink::engine::RunLock;
use matchlink::{
    Binding, ConfigurationError, Cycle, CycleId, DataStage, EngineConfig, ExecutionError, IdentityId,
    InventoryKind, InventoryRecord, JobRuntime, MatchEngine, MatchError, MergeState, OrganizationId,
    ProgressStatus, Snapshot, Value, WholeOrgOutcome,
};

const KIND: InventoryKind = InventoryKind::Property;

fn setup(engine: &MatchEngine, cycles: i32) -> (OrganizationId, Vec<CycleId>) {
    let org = OrganizationId::new();
    let mut tx = engine.store().begin().unwrap();
    let mut ids = Vec::new();
    for y in 0..cycles {
        let cycle = Cycle::new(
            org,
            format!("{}", 2020 + y),
            Utc.with_ymd_and_hms(2020 + y, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2021 + y, 1, 1, 0, 0, 0).unwrap(),
        );
        ids.push(cycle.id);
        tx.insert_cycle(cycle).unwrap();
    }
    tx.commit().unwrap();
    (org, ids)
}

fn add(engine: &MatchEngine, org: OrganizationId, cycle: CycleId, fields: &[(&str, Value)], minutes: i64) -> Binding {
    let mut builder = Snapshot::builder()
        .organization(org)
        .kind(KIND)
        .updated_at(Utc::now() - Duration::days(1) + Duration::minutes(minutes));
    for (k, v) in fields {
        builder = builder.field(*k, v.clone());
    }
    let snapshot = builder.build().unwrap();
    let record = InventoryRecord::new(org, KIND);
    let binding = Binding::new(org, KIND, record.id, cycle, snapshot.id);

    let mut tx = engine.store().begin().unwrap();
    tx.insert_identity(record).unwrap();
    tx.insert_snapshot(snapshot).unwrap();
    tx.insert_binding(binding.clone()).unwrap();
    tx.commit().unwrap();
    binding
}

/// (custom_id_1 or None, binding) for every live binding of the organization.
fn inventory(engine: &MatchEngine, org: OrganizationId, cycles: &[CycleId]) -> Vec<(Option<String>, Binding)> {
    let tx = engine.store().begin().unwrap();
    let mut out = Vec::new();
    for cycle in cycles {
        for binding in tx.bindings_in_cycle(org, KIND, *cycle).unwrap() {
            let snapshot = tx.snapshot(binding.snapshot).unwrap().unwrap();
            let id = snapshot
                .fields
                .get("custom_id_1")
                .and_then(Value::as_string)
                .map(str::to_string);
            out.push((id, binding));
        }
    }
    out
}

fn committed(outcome: WholeOrgOutcome) -> matchlink::RunSummary {
    match outcome {
        WholeOrgOutcome::Committed(run) => run,
        WholeOrgOutcome::Preview { .. } => panic!("expected a committed run"),
    }
}

#[test]
fn whole_org_run_converges_and_is_idempotent() {
    let engine = MatchEngine::in_memory(EngineConfig::default());
    let (org, cycles) = setup(&engine, 3);

    let mut expected_merged = 0;
    let mut minute = 0;
    for (c, cycle) in cycles.iter().enumerate() {
        for k in 0..6usize {
            let copies = (c + k) % 3;
            if copies > 1 {
                expected_merged += copies;
            }
            for n in 0..copies {
                minute += 1;
                let fields = [
                    ("custom_id_1", Value::from(format!("K{k}"))),
                    ("city", Value::from(format!("city-{c}-{n}"))),
                ];
                add(&engine, org, *cycle, &fields, minute);
            }
        }
        add(&engine, org, *cycle, &[("city", "Nowhere".into())], 0);
    }

    let first = committed(engine.whole_org_match_merge_link(org, KIND, None).unwrap());
    assert!(!first.has_failures());
    assert_eq!(first.cycles.len(), 3);
    assert_eq!(first.merged_count(), expected_merged);
    assert!(first.linked_sets_count() > 0);

    let rows = inventory(&engine, org, &cycles);
    let mut by_key: HashMap<String, Vec<&Binding>> = HashMap::new();
    let mut keyless: Vec<IdentityId> = Vec::new();
    for (key, binding) in &rows {
        match key {
            Some(key) => by_key.entry(key.clone()).or_default().push(binding),
            None => keyless.push(binding.identity),
        }
    }
    assert_eq!(keyless.len(), 3);
    assert_eq!(keyless.iter().collect::<HashSet<_>>().len(), 3);

    let mut shared = HashSet::new();
    for (key, bindings) in &by_key {
        let cycles_seen: HashSet<_> = bindings.iter().map(|b| b.cycle).collect();
        assert_eq!(cycles_seen.len(), bindings.len(), "{key} has duplicates in a cycle");
        let identities: HashSet<_> = bindings.iter().map(|b| b.identity).collect();
        assert_eq!(identities.len(), 1, "{key} is split across identities");
        assert!(shared.insert(bindings[0].identity), "{key} shares an identity");
    }

    let second = committed(engine.whole_org_match_merge_link(org, KIND, None).unwrap());
    assert_eq!(second.merged_count(), 0);
    assert_eq!(second.linked_sets_count(), 0);
}

#[test]
fn preview_applies_override_without_committing() {
    let engine = MatchEngine::in_memory(EngineConfig::default());
    let (org, cycles) = setup(&engine, 1);
    add(&engine, org, cycles[0], &[("custom_id_1", "P1".into()), ("ubid", "U1".into())], 1);
    add(&engine, org, cycles[0], &[("custom_id_1", "P1".into()), ("ubid", "U2".into())], 2);

    let proposed = vec!["custom_id_1".to_string()];
    let outcome = engine
        .whole_org_match_merge_link(org, KIND, Some(&proposed))
        .unwrap();
    let WholeOrgOutcome::Preview { cycles: previews } = outcome else {
        panic!("expected a preview");
    };
    assert_eq!(previews.len(), 1);
    assert_eq!(previews[0].merged_count, 2);
    assert_eq!(previews[0].records.len(), 1);
    assert_eq!(previews[0].records[0].fields["ubid"], Value::from("U2"));

    assert_eq!(inventory(&engine, org, &cycles).len(), 2);

    // Default criteria include ubid, so nothing matches for real.
    let run = committed(engine.whole_org_match_merge_link(org, KIND, None).unwrap());
    assert_eq!(run.merged_count(), 0);
}

#[test]
fn unknown_override_column_is_rejected_before_any_write() {
    let engine = MatchEngine::in_memory(EngineConfig::default());
    let (org, cycles) = setup(&engine, 1);
    add(&engine, org, cycles[0], &[("custom_id_1", "P1".into())], 1);
    add(&engine, org, cycles[0], &[("custom_id_1", "P1".into())], 2);

    let proposed = vec!["custom_id_1".to_string(), "no_such_column".to_string()];
    let err = engine
        .whole_org_match_merge_link(org, KIND, Some(&proposed))
        .unwrap_err();
    match err {
        MatchError::Configuration(ConfigurationError::UnknownColumns { columns, .. }) => {
            assert_eq!(columns, vec!["no_such_column".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(inventory(&engine, org, &cycles).len(), 2);
}

#[test]
fn concurrent_run_is_locked_out() {
    let engine = MatchEngine::in_memory(EngineConfig::default());
    let (org, _) = setup(&engine, 1);

    let held = RunLock::acquire(engine.kv().clone(), org, KIND, StdDuration::from_secs(60)).unwrap();
    let err = engine.whole_org_match_merge_link(org, KIND, None).unwrap_err();
    assert!(matches!(err, MatchError::Execution(ExecutionError::Locked { .. })));

    // Other kinds are not blocked.
    engine
        .whole_org_match_merge_link(org, InventoryKind::TaxLot, None)
        .unwrap();

    drop(held);
    engine.whole_org_match_merge_link(org, KIND, None).unwrap();
}

#[test]
fn background_job_reports_progress() {
    let engine = MatchEngine::in_memory(EngineConfig::default());
    let (org, cycles) = setup(&engine, 2);
    add(&engine, org, cycles[0], &[("custom_id_1", "A".into())], 1);
    add(&engine, org, cycles[0], &[("custom_id_1", "A".into())], 2);
    add(&engine, org, cycles[1], &[("custom_id_1", "A".into())], 3);

    let runtime = JobRuntime::new(engine);
    let handle = runtime.submit_whole_org(org, KIND, None).unwrap();
    let key = handle.progress_key().to_string();
    assert!(key.starts_with("progress:whole_org_match_merge_link:"));

    let run = committed(handle.join_timeout(StdDuration::from_secs(5)).unwrap());
    assert_eq!(run.merged_count(), 2);
    assert_eq!(run.linked_sets_count(), 1);

    let progress = runtime.progress(&key).unwrap().unwrap();
    assert_eq!(progress.status, ProgressStatus::Success);
    assert_eq!(progress.progress, 100);
    let summary = progress.summary.unwrap();
    assert_eq!(summary["mode"], "committed");
    assert_eq!(summary["cycles"].as_array().unwrap().len(), 2);
}

#[test]
fn incoming_rows_drop_exact_duplicates_and_merge_the_rest() {
    let engine = MatchEngine::in_memory(EngineConfig::default());
    let (org, cycles) = setup(&engine, 1);
    let existing = add(&engine, org, cycles[0], &[("custom_id_1", "P1".into()), ("city", "Denver".into())], 0);

    let mapped = |fields: &[(&str, &str)]| {
        let mut builder = Snapshot::builder()
            .organization(org)
            .kind(KIND)
            .data_stage(DataStage::Mapped);
        for (k, v) in fields {
            builder = builder.field(*k, *v);
        }
        builder.build().unwrap()
    };
    let rows = vec![
        mapped(&[("custom_id_1", "P1"), ("city", "Golden")]),
        mapped(&[("custom_id_1", "P2")]),
        mapped(&[("custom_id_1", "P2")]),
        mapped(&[("custom_id_1", "P1"), ("city", "Denver")]),
        Snapshot::builder().organization(org).kind(KIND).build().unwrap(),
    ];
    let ids: Vec<_> = rows.iter().map(|s| s.id).collect();
    {
        let mut tx = engine.store().begin().unwrap();
        for row in rows {
            tx.insert_snapshot(row).unwrap();
        }
        tx.commit().unwrap();
    }

    let summary = engine.match_incoming(org, KIND, cycles[0], &ids).unwrap();
    assert_eq!(summary.promoted.len(), 2);
    assert_eq!(summary.duplicates_in_import, 1);
    assert_eq!(summary.duplicates_of_existing, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.merged_count, 2);

    let tx = engine.store().begin().unwrap();
    let dup = tx.snapshot(ids[2]).unwrap().unwrap();
    assert_eq!(dup.merge_state, MergeState::Duplicate);
    assert_eq!(dup.data_stage, DataStage::Deleted);
    assert!(tx.binding(existing.id).unwrap().is_none());

    let live = tx.bindings_in_cycle(org, KIND, cycles[0]).unwrap();
    assert_eq!(live.len(), 2);
    let cities: Vec<_> = live
        .iter()
        .map(|b| tx.snapshot(b.snapshot).unwrap().unwrap().fields.get("city").cloned())
        .collect();
    assert!(cities.contains(&Some(Value::from("Golden"))));
}

#[test]
fn foreign_cycle_is_rejected() {
    let engine = MatchEngine::in_memory(EngineConfig::default());
    let (_, cycles) = setup(&engine, 1);
    let err = engine
        .match_incoming(OrganizationId::new(), KIND, cycles[0], &[])
        .unwrap_err();
    assert!(matches!(err, MatchError::Execution(ExecutionError::ForeignCycle { .. })));
}
