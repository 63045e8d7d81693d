//! Matching criteria: which columns define equivalence for (organization, kind).

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::column::ColumnPolicy;
use crate::error::{ConfigurationError, MatchResult};
use crate::ids::OrganizationId;
use crate::inventory::InventoryKind;
use crate::matching::address::normalize_address;
use crate::snapshot::Snapshot;
use crate::storage::InventoryTx;

/// Column compared through address normalization instead of raw equality.
pub const ADDRESS_COLUMN: &str = "address_line_1";

/// One column taking part in matching.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CriterionColumn {
    /// Column name.
    pub name: String,
    /// Whether the column lives in extra data.
    pub is_extra_data: bool,
}

/// Per-column comparison tokens for one snapshot, aligned with [`MatchCriteria`].
///
/// Two snapshots match exactly when their keys are equal: a column populated on
/// one side must be populated with the same token on the other, and columns
/// empty on both sides are ignored.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MatchKey(Vec<Option<String>>);

impl MatchKey {
    /// Number of populated columns.
    #[must_use]
    pub fn populated(&self) -> usize {
        self.0.iter().filter(|t| t.is_some()).count()
    }
}

/// Ordered set of matching columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchCriteria {
    columns: Vec<CriterionColumn>,
}

impl MatchCriteria {
    /// Builds criteria ordered by column name; duplicates collapse.
    #[must_use]
    pub fn new(columns: impl IntoIterator<Item = CriterionColumn>) -> Self {
        let set: BTreeSet<CriterionColumn> = columns.into_iter().collect();
        let mut columns: Vec<CriterionColumn> = set.into_iter().collect();
        columns.sort_by(|a, b| a.name.cmp(&b.name).then(a.is_extra_data.cmp(&b.is_extra_data)));
        Self { columns }
    }

    /// Criteria over canonical columns.
    #[must_use]
    pub fn canonical<S: AsRef<str>>(names: &[S]) -> Self {
        Self::new(names.iter().map(|n| CriterionColumn {
            name: n.as_ref().to_string(),
            is_extra_data: false,
        }))
    }

    /// Columns in key order.
    #[must_use]
    pub fn columns(&self) -> &[CriterionColumn] {
        &self.columns
    }

    /// Column names in key order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Returns true if no column is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Computes the match key of a snapshot.
    ///
    /// Returns `None` when no criteria column is populated; such a snapshot
    /// takes part in no automatic match.
    #[must_use]
    pub fn key_for(&self, snapshot: &Snapshot) -> Option<MatchKey> {
        let tokens: Vec<Option<String>> = self
            .columns
            .iter()
            .map(|column| {
                let value = snapshot.value(&column.name, column.is_extra_data)?;
                let token = value.match_token()?;
                if !column.is_extra_data && column.name == ADDRESS_COLUMN {
                    normalize_address(&token)
                } else {
                    Some(token)
                }
            })
            .collect();
        let key = MatchKey(tokens);
        (key.populated() > 0).then_some(key)
    }

    /// Returns true if the two snapshots denote the same entity.
    #[must_use]
    pub fn matches(&self, a: &Snapshot, b: &Snapshot) -> bool {
        match (self.key_for(a), self.key_for(b)) {
            (Some(ka), Some(kb)) => ka == kb,
            _ => false,
        }
    }
}

/// Resolves the matching criteria for an organization and kind.
#[derive(Debug, Default, Clone, Copy)]
pub struct CriteriaResolver;

impl CriteriaResolver {
    /// Resolves criteria from the column policy table.
    ///
    /// A caller-supplied `override_columns` replaces the configured criteria for
    /// this call only and is never persisted. Every name must be a known column of
    /// the kind, either configured for the organization or built in.
    pub fn resolve(
        tx: &dyn InventoryTx,
        organization: OrganizationId,
        kind: InventoryKind,
        override_columns: Option<&[String]>,
    ) -> MatchResult<MatchCriteria> {
        let mut policies = tx.column_policies(organization, kind)?;
        if policies.is_empty() {
            policies = ColumnPolicy::defaults(kind);
        }

        let criteria = match override_columns {
            None => MatchCriteria::new(policies.iter().filter(|p| p.is_matching_criteria).map(
                |p| CriterionColumn {
                    name: p.name.clone(),
                    is_extra_data: p.is_extra_data,
                },
            )),
            Some([]) => return Err(ConfigurationError::EmptyCriteria.into()),
            Some(names) => {
                let mut columns = Vec::with_capacity(names.len());
                let mut unknown = Vec::new();
                for name in names {
                    let known = policies.iter().find(|p| &p.name == name).map(|p| p.is_extra_data).or_else(
                        || kind.default_matching_columns().contains(&name.as_str()).then_some(false),
                    );
                    match known {
                        Some(is_extra_data) => columns.push(CriterionColumn {
                            name: name.clone(),
                            is_extra_data,
                        }),
                        None => unknown.push(name.clone()),
                    }
                }
                if !unknown.is_empty() {
                    return Err(ConfigurationError::UnknownColumns {
                        kind,
                        columns: unknown,
                    }
                    .into());
                }
                MatchCriteria::new(columns)
            }
        };

        debug!(
            organization = %organization,
            kind = %kind,
            columns = ?criteria.names(),
            overridden = override_columns.is_some(),
            "resolved matching criteria"
        );
        Ok(criteria)
    }
}
