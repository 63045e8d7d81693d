//! # matchlink - matching, merging and cross-cycle linking of inventory records
//!
//! Building and parcel records arrive again and again, from several sources and
//! for several reporting periods ("cycles"). matchlink decides when two records
//! describe the same real-world entity, folds duplicates within a cycle into one
//! record with field-level precedence, keeps one stable identity per entity
//! across cycles, and carries meter readings along whenever identities change.
//!
//! ## Core Concepts
//!
//! - **Identity** ([`InventoryRecord`]): a stable anchor for one building or parcel
//! - **Snapshot**: a versioned data row; merges create new snapshots, never edit old ones
//! - **Binding**: joins identity, cycle and snapshot; one live binding per (identity, cycle)
//! - **Matching criteria**: the columns whose values decide equivalence
//! - **Merge protection**: per-column precedence (favor new or favor existing)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use matchlink::{EngineConfig, InventoryKind, MatchEngine};
//!
//! let engine = MatchEngine::in_memory(EngineConfig::default());
//! // ... load cycles, snapshots and bindings through engine.store() ...
//! let outcome = engine.match_merge_link(binding_id, InventoryKind::Property)?;
//! println!("merged {} and linked {}", outcome.merged_count, outcome.linked_count);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod audit;
pub mod binding;
pub mod column;
pub mod cycle;
pub mod error;
pub mod ids;
pub mod inventory;
pub mod meter;
pub mod snapshot;
pub mod value;

// Storage and configuration
pub mod config;
pub mod storage;

// Matching pipeline
pub mod engine;
pub mod link;
pub mod matching;
pub mod merge;
pub mod reconcile;

// Re-export primary types at crate root for convenience
pub use audit::{AuditEntry, FieldChange, SYSTEM_MATCH};
pub use binding::{Binding, BindingRef};
pub use column::{ColumnPolicies, ColumnPolicy, MergeProtection};
pub use cycle::Cycle;
pub use error::{
    ConfigurationError, ExecutionError, LinkIntegrityError, MatchError, MatchResult, ValidationError,
};
pub use ids::{AuditId, BindingId, CycleId, IdentityId, MeterId, OrganizationId, SnapshotId};
pub use inventory::{InventoryKind, InventoryRecord};
pub use meter::{Meter, MeterKey, MeterReading, MeterSource, OverlapWarning};
pub use snapshot::{DataStage, MergeState, Snapshot, SnapshotBuilder};
pub use value::Value;

pub use config::EngineConfig;
pub use storage::{
    InMemoryInventoryStore, InMemoryKeyValueStore, InventoryStore, InventoryTx, KeyValueStore,
    StorageError,
};

pub use engine::runtime::{JobHandle, JobRuntime};
pub use engine::{
    CyclePreview, CycleSummary, ImportSummary, MatchEngine, MatchMergeLinkOutcome, PreviewRecord,
    ProgressData, ProgressStatus, RunSummary, WholeOrgOutcome,
};
pub use link::{LinkManager, LinkOutcome};
pub use matching::{CandidateFinder, Candidates, CriteriaResolver, MatchCriteria, MatchKey};
pub use merge::{MergeCommit, MergeEngine, MergedFields};
pub use reconcile::{MeterReconciler, ReadingImport, ReadingInput, ReconcileSummary};
