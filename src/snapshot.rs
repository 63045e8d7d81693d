//! Snapshots: versioned data rows describing a record at one point in the pipeline.
//!
//! A snapshot is never edited once something supersedes it. Merging produces a
//! brand-new snapshot; the inputs stay behind untouched for audit purposes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::ids::{OrganizationId, SnapshotId};
use crate::inventory::InventoryKind;
use crate::value::Value;

/// Processing stage of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataStage {
    /// Raw row from an import file.
    Imported,
    /// Columns mapped; ready to match.
    Mapped,
    /// Promoted and participating in matching.
    Matching,
    /// Dropped (for example as an exact duplicate).
    Deleted,
}

/// How a snapshot came to exist relative to matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeState {
    /// Not yet classified.
    Unknown,
    /// Promoted without merging.
    New,
    /// Produced by a merge.
    Merged,
    /// Dropped as an exact duplicate.
    Duplicate,
}

/// A data row for a property or tax lot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Snapshot id.
    pub id: SnapshotId,
    /// Owning organization.
    pub organization: OrganizationId,
    /// Property or tax lot.
    pub kind: InventoryKind,
    /// Canonical columns.
    pub fields: BTreeMap<String, Value>,
    /// Free-form attributes.
    pub extra_data: BTreeMap<String, Value>,
    /// Pipeline stage.
    pub data_stage: DataStage,
    /// How the snapshot relates to matching.
    pub merge_state: MergeState,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification; drives merge precedence.
    pub updated_at: DateTime<Utc>,
}

impl Snapshot {
    /// Creates a new snapshot builder.
    #[must_use]
    pub fn builder() -> SnapshotBuilder {
        SnapshotBuilder::new()
    }

    /// Looks up a column value, from extra data when `is_extra_data` is set.
    #[must_use]
    pub fn value(&self, column: &str, is_extra_data: bool) -> Option<&Value> {
        if is_extra_data {
            self.extra_data.get(column)
        } else {
            self.fields.get(column)
        }
    }

    /// Sets a canonical column, bumping `updated_at`.
    pub fn set_field(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(column.into(), value.into());
        self.updated_at = Utc::now().max(self.updated_at);
    }

    /// Returns true if the snapshot takes part in matching.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.data_stage == DataStage::Matching
    }

    /// Stable content hash over canonical columns and extra data.
    ///
    /// Unpopulated values are skipped so that `{a: null}` and `{}` hash alike.
    #[must_use]
    pub fn content_hash(&self) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.kind.as_str().as_bytes());
        for (section, map) in [("f", &self.fields), ("x", &self.extra_data)] {
            for (key, value) in map.iter().filter(|(_, v)| v.is_populated()) {
                hasher.update(section.as_bytes());
                hasher.update(&(key.len() as u64).to_le_bytes());
                hasher.update(key.as_bytes());
                let encoded = serde_json::to_vec(value).unwrap_or_default();
                hasher.update(&(encoded.len() as u64).to_le_bytes());
                hasher.update(&encoded);
            }
        }
        hasher.finalize()
    }
}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Snapshot {}

/// Builder for [`Snapshot`].
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    id: Option<SnapshotId>,
    organization: Option<OrganizationId>,
    kind: Option<InventoryKind>,
    fields: BTreeMap<String, Value>,
    extra_data: BTreeMap<String, Value>,
    data_stage: Option<DataStage>,
    merge_state: Option<MergeState>,
    updated_at: Option<DateTime<Utc>>,
}

impl SnapshotBuilder {
    /// Creates a new snapshot builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the snapshot ID (optional, will be generated if not set).
    #[must_use]
    pub fn id(mut self, id: SnapshotId) -> Self {
        self.id = Some(id);
        self
    }

    /// Sets the owning organization (required).
    #[must_use]
    pub fn organization(mut self, organization: OrganizationId) -> Self {
        self.organization = Some(organization);
        self
    }

    /// Sets the record kind (required).
    #[must_use]
    pub fn kind(mut self, kind: InventoryKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Sets a canonical column.
    #[must_use]
    pub fn field(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(column.into(), value.into());
        self
    }

    /// Sets a free-form attribute.
    #[must_use]
    pub fn extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra_data.insert(key.into(), value.into());
        self
    }

    /// Defaults to [`DataStage::Matching`].
    #[must_use]
    pub fn data_stage(mut self, stage: DataStage) -> Self {
        self.data_stage = Some(stage);
        self
    }

    /// Defaults to [`MergeState::Unknown`].
    #[must_use]
    pub fn merge_state(mut self, state: MergeState) -> Self {
        self.merge_state = Some(state);
        self
    }

    /// Sets the modification time (defaults to now).
    #[must_use]
    pub fn updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = Some(at);
        self
    }

    /// Builds the snapshot.
    pub fn build(self) -> Result<Snapshot, ValidationError> {
        let organization = self.organization.ok_or(ValidationError::MissingField {
            field: "organization".to_string(),
        })?;
        let kind = self.kind.ok_or(ValidationError::MissingField {
            field: "kind".to_string(),
        })?;
        let now = Utc::now();
        let updated_at = self.updated_at.unwrap_or(now);

        Ok(Snapshot {
            id: self.id.unwrap_or_else(SnapshotId::new),
            organization,
            kind,
            fields: self.fields,
            extra_data: self.extra_data,
            data_stage: self.data_stage.unwrap_or(DataStage::Matching),
            merge_state: self.merge_state.unwrap_or(MergeState::Unknown),
            created_at: updated_at.min(now),
            updated_at,
        })
    }
}
