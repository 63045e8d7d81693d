//! Inventory records: the long-lived identities of buildings and parcels.
//!
//! An [`InventoryRecord`] carries no field data of its own. Field data lives in
//! snapshots, which are attached to an identity per cycle through bindings.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{IdentityId, OrganizationId};

/// The two record variants the engine handles.
///
/// Every generic piece of the engine takes the kind as data instead of
/// dispatching on a type name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InventoryKind {
    /// A building or campus.
    Property,
    /// A tax parcel.
    TaxLot,
}

impl InventoryKind {
    /// Matching criteria used when an organization has no column policies for the kind.
    #[must_use]
    pub const fn default_matching_columns(self) -> &'static [&'static str] {
        match self {
            Self::Property => &["address_line_1", "custom_id_1", "pm_property_id", "ubid"],
            Self::TaxLot => &["address_line_1", "custom_id_1", "jurisdiction_tax_lot_id", "ulid"],
        }
    }

    /// Stable short name used in lock and progress keys.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Property => "property",
            Self::TaxLot => "taxlot",
        }
    }
}

impl fmt::Display for InventoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identity for one real-world entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryRecord {
    /// Identity.
    pub id: IdentityId,
    /// Owning organization.
    pub organization: OrganizationId,
    /// Property or tax lot.
    pub kind: InventoryKind,
    /// When the identity was allocated.
    pub created_at: DateTime<Utc>,
}

impl InventoryRecord {
    /// Allocates a new identity.
    #[must_use]
    pub fn new(organization: OrganizationId, kind: InventoryKind) -> Self {
        Self {
            id: IdentityId::new(),
            organization,
            kind,
            created_at: Utc::now(),
        }
    }
}

impl PartialEq for InventoryRecord {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for InventoryRecord {}
