//! Stable identifiers.
//!
//! Every row the engine touches is addressed by a UUID newtype. Identifiers are
//! totally ordered so that "lowest identifier wins" is a usable deterministic
//! tie-break when timestamps collide.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Creates an identifier from an existing UUID.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            /// Returns true if this is a nil (all zeros) UUID.
            #[must_use]
            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }

            /// Creates a nil identifier (for testing or sentinel values).
            #[must_use]
            pub const fn nil() -> Self {
                Self(Uuid::nil())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_id!(
    /// Organization that owns records, columns and cycles.
    OrganizationId
);
define_id!(
    /// Stable identity of one real-world building or parcel (an Inventory Record).
    IdentityId
);
define_id!(
    /// Versioned data row.
    SnapshotId
);
define_id!(
    /// Join of (identity, cycle, snapshot).
    BindingId
);
define_id!(
    /// Reporting time window.
    CycleId
);
define_id!(
    /// Time-series meter attached to an identity.
    MeterId
);
define_id!(
    /// Append-only audit entry.
    AuditId
);
