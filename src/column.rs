//! Column policy: which fields define equivalence and how merges resolve them.

use serde::{Deserialize, Serialize};

use crate::inventory::InventoryKind;

/// Precedence rule applied to one field during a merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeProtection {
    /// The highest-precedence populated value wins.
    #[default]
    FavorNew,
    /// The oldest populated value wins; later values only fill empty slots.
    FavorExisting,
}

/// Per-organization policy for one column of one record kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnPolicy {
    /// Column name.
    pub name: String,
    /// Record kind the policy applies to.
    pub kind: InventoryKind,
    /// Stored in free-form extra data rather than as a canonical column.
    pub is_extra_data: bool,
    /// Whether the column decides equivalence.
    pub is_matching_criteria: bool,
    /// How merges resolve conflicting values.
    pub merge_protection: MergeProtection,
}

impl ColumnPolicy {
    /// A canonical column with default protection and no matching role.
    #[must_use]
    pub fn canonical(kind: InventoryKind, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            is_extra_data: false,
            is_matching_criteria: false,
            merge_protection: MergeProtection::FavorNew,
        }
    }

    /// An extra-data column with default protection and no matching role.
    #[must_use]
    pub fn extra(kind: InventoryKind, name: impl Into<String>) -> Self {
        Self {
            is_extra_data: true,
            ..Self::canonical(kind, name)
        }
    }

    /// Marks the column as matching criteria.
    #[must_use]
    pub fn matching(mut self) -> Self {
        self.is_matching_criteria = true;
        self
    }

    /// Overrides the merge protection.
    #[must_use]
    pub fn protection(mut self, protection: MergeProtection) -> Self {
        self.merge_protection = protection;
        self
    }

    /// Built-in policy set used when an organization has not configured a kind.
    #[must_use]
    pub fn defaults(kind: InventoryKind) -> Vec<Self> {
        kind.default_matching_columns()
            .iter()
            .map(|name| Self::canonical(kind, *name).matching())
            .collect()
    }
}

/// Lookup table of merge protection for one (organization, kind).
#[derive(Debug, Clone, Default)]
pub struct ColumnPolicies {
    canonical: std::collections::HashMap<String, MergeProtection>,
    extra: std::collections::HashMap<String, MergeProtection>,
}

impl ColumnPolicies {
    /// Indexes a list of policies by column.
    #[must_use]
    pub fn new(policies: &[ColumnPolicy]) -> Self {
        let mut out = Self::default();
        for policy in policies {
            let table = if policy.is_extra_data {
                &mut out.extra
            } else {
                &mut out.canonical
            };
            table.insert(policy.name.clone(), policy.merge_protection);
        }
        out
    }

    /// Protection for a column; unknown columns favor new values.
    #[must_use]
    pub fn protection(&self, column: &str, is_extra_data: bool) -> MergeProtection {
        let table = if is_extra_data { &self.extra } else { &self.canonical };
        table.get(column).copied().unwrap_or_default()
    }
}
