//! Meter reconciliation.
//!
//! Meters hang off identities, not snapshots, so every identity change has to
//! carry them along. Meters with the same [`MeterKey`] are one logical meter;
//! their readings are unioned by window and the newest-created reading of a
//! window wins, replacing the older row in place.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{MatchResult, ValidationError};
use crate::ids::{IdentityId, MeterId};
use crate::meter::{Meter, MeterKey, MeterReading, OverlapWarning};
use crate::storage::InventoryTx;

type Window = (DateTime<Utc>, DateTime<Utc>);

/// Counts produced by a reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    /// Survivor meters created for keys it did not have.
    pub meters_created: usize,
    /// Source meters folded into an existing survivor meter.
    pub meters_matched: usize,
    /// Readings added to survivor meters.
    pub readings_inserted: usize,
    /// Survivor readings overwritten by newer ones.
    pub readings_updated: usize,
}

impl ReconcileSummary {
    fn absorb(&mut self, other: Self) {
        self.meters_created += other.meters_created;
        self.meters_matched += other.meters_matched;
        self.readings_inserted += other.readings_inserted;
        self.readings_updated += other.readings_updated;
    }
}

/// One inbound reading, before it is attached to a meter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingInput {
    /// Window start.
    pub start_time: DateTime<Utc>,
    /// Window end (exclusive).
    pub end_time: DateTime<Utc>,
    /// Reading in `unit`.
    pub value: f64,
    /// Reporting unit.
    pub unit: String,
    /// Factor converting `unit` to kBtu.
    pub conversion_factor: f64,
    /// When the reading was produced.
    pub created_at: DateTime<Utc>,
}

/// Outcome of importing a batch of readings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingImport {
    /// Meter the batch was written to.
    pub meter: MeterId,
    /// Readings for new windows.
    pub inserted: usize,
    /// Existing readings replaced.
    pub updated: usize,
    /// Readings discarded because the batch held a newer one for the same window.
    pub dropped_overlaps: usize,
    /// One warning per window that had several readings.
    pub warnings: Vec<OverlapWarning>,
}

/// Consolidates meters and readings across identities.
#[derive(Debug, Default, Clone, Copy)]
pub struct MeterReconciler;

impl MeterReconciler {
    /// Folds the meters of `sources` into `survivor`.
    ///
    /// `sources` are processed in order, so on equal creation times a later
    /// source wins. Source meters are left in place; callers prune identities
    /// that end up without bindings.
    pub fn reconcile(
        tx: &mut dyn InventoryTx,
        survivor: IdentityId,
        sources: &[IdentityId],
    ) -> MatchResult<ReconcileSummary> {
        let mut summary = ReconcileSummary::default();
        let mut survivor_meters: HashMap<MeterKey, MeterId> = tx
            .meters_for_identity(survivor)?
            .into_iter()
            .map(|m| (m.key, m.id))
            .collect();

        for source in sources.iter().filter(|s| **s != survivor) {
            for meter in tx.meters_for_identity(*source)? {
                let target = match survivor_meters.get(&meter.key) {
                    Some(id) => {
                        summary.meters_matched += 1;
                        *id
                    }
                    None => {
                        let created = Meter::new(survivor, meter.key.clone());
                        let id = created.id;
                        tx.insert_meter(created)?;
                        survivor_meters.insert(meter.key.clone(), id);
                        summary.meters_created += 1;
                        id
                    }
                };
                let readings = tx.readings(meter.id)?;
                summary.absorb(Self::upsert_newest(tx, target, readings)?);
            }
        }

        debug!(
            survivor = %survivor,
            sources = sources.len(),
            meters_created = summary.meters_created,
            readings_inserted = summary.readings_inserted,
            readings_updated = summary.readings_updated,
            "reconciled meters"
        );
        Ok(summary)
    }

    /// Deep-copies every meter and reading of `from` onto `to`.
    ///
    /// Both identities keep a full, independent history afterwards.
    pub fn copy_meters(
        tx: &mut dyn InventoryTx,
        from: IdentityId,
        to: IdentityId,
    ) -> MatchResult<ReconcileSummary> {
        Self::reconcile(tx, to, &[from])
    }

    /// Deletes an identity, its meters and readings if no binding references it.
    ///
    /// Returns true if the identity was pruned.
    pub fn prune_identity(tx: &mut dyn InventoryTx, identity: IdentityId) -> MatchResult<bool> {
        if !tx.bindings_for_identity(identity)?.is_empty() {
            return Ok(false);
        }
        if tx.identity(identity)?.is_none() {
            return Ok(false);
        }
        for meter in tx.meters_for_identity(identity)? {
            tx.delete_meter(meter.id)?;
        }
        tx.delete_identity(identity)?;
        debug!(identity = %identity, "pruned orphaned identity");
        Ok(true)
    }

    /// Imports a batch of readings for one meter of an identity.
    ///
    /// The meter is created when missing. When the batch itself holds several
    /// readings for one window the newest is kept and an [`OverlapWarning`] is
    /// reported; this is never fatal.
    pub fn import_readings(
        tx: &mut dyn InventoryTx,
        identity: IdentityId,
        key: &MeterKey,
        batch: Vec<ReadingInput>,
    ) -> MatchResult<ReadingImport> {
        for input in &batch {
            if input.start_time >= input.end_time {
                return Err(ValidationError::InvalidWindow {
                    start: input.start_time,
                    end: input.end_time,
                }
                .into());
            }
        }

        let meter = match tx
            .meters_for_identity(identity)?
            .into_iter()
            .find(|m| &m.key == key)
        {
            Some(meter) => meter.id,
            None => {
                let meter = Meter::new(identity, key.clone());
                let id = meter.id;
                tx.insert_meter(meter)?;
                id
            }
        };

        let mut by_window: BTreeMap<Window, Vec<ReadingInput>> = BTreeMap::new();
        for input in batch {
            by_window
                .entry((input.start_time, input.end_time))
                .or_default()
                .push(input);
        }

        let mut kept = Vec::with_capacity(by_window.len());
        let mut warnings = Vec::new();
        let mut dropped_overlaps = 0;
        for ((start_time, end_time), mut inputs) in by_window {
            // Stable sort keeps batch order among equal creation times; last wins.
            inputs.sort_by_key(|i| i.created_at);
            let dropped = inputs.len() - 1;
            if dropped > 0 {
                let warning = OverlapWarning {
                    meter: key.clone(),
                    start_time,
                    end_time,
                    dropped,
                };
                warn!(identity = %identity, %warning, "overlapping readings in inbound batch");
                warnings.push(warning);
                dropped_overlaps += dropped;
            }
            if let Some(newest) = inputs.pop() {
                kept.push(MeterReading {
                    meter,
                    start_time,
                    end_time,
                    value: newest.value,
                    unit: newest.unit,
                    conversion_factor: newest.conversion_factor,
                    created_at: newest.created_at,
                });
            }
        }

        let applied = Self::upsert_newest(tx, meter, kept)?;
        Ok(ReadingImport {
            meter,
            inserted: applied.readings_inserted,
            updated: applied.readings_updated,
            dropped_overlaps,
            warnings,
        })
    }

    fn upsert_newest(
        tx: &mut dyn InventoryTx,
        target: MeterId,
        incoming: Vec<MeterReading>,
    ) -> MatchResult<ReconcileSummary> {
        let mut summary = ReconcileSummary::default();
        let mut existing: HashMap<Window, MeterReading> = tx
            .readings(target)?
            .into_iter()
            .map(|r| (r.window(), r))
            .collect();

        for reading in incoming {
            let reading = reading.rebind(target);
            let window = reading.window();
            match existing.get(&window) {
                None => summary.readings_inserted += 1,
                Some(current) if reading.created_at >= current.created_at => {
                    if *current == reading {
                        continue;
                    }
                    summary.readings_updated += 1;
                }
                Some(_) => continue,
            }
            tx.put_reading(reading.clone())?;
            existing.insert(window, reading);
        }
        Ok(summary)
    }
}
