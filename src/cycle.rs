//! Reporting cycles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{CycleId, OrganizationId};

/// A named, non-overlapping reporting window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cycle {
    /// Cycle id.
    pub id: CycleId,
    /// Owning organization.
    pub organization: OrganizationId,
    /// Display name, usually the year.
    pub name: String,
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Exclusive end.
    pub end: DateTime<Utc>,
}

impl Cycle {
    /// Creates a cycle covering `[start, end)`.
    #[must_use]
    pub fn new(
        organization: OrganizationId,
        name: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        Self {
            id: CycleId::new(),
            organization,
            name: name.into(),
            start,
            end,
        }
    }

    /// Returns true if the window has positive length.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }

    /// Returns true if the two windows share any instant.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn year(org: OrganizationId, y: i32) -> Cycle {
        Cycle::new(
            org,
            y.to_string(),
            Utc.with_ymd_and_hms(y, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(y + 1, 1, 1, 0, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_adjacent_cycles_do_not_overlap() {
        let org = OrganizationId::new();
        let a = year(org, 2020);
        let b = year(org, 2021);
        assert!(a.is_valid());
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&a.clone()));
    }
}
