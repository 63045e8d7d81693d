//! Meters and meter readings attached to identities.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{IdentityId, MeterId};

/// Where a meter's data comes from.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeterSource {
    /// ENERGY STAR Portfolio Manager.
    PortfolioManager,
    /// Green Button utility export.
    GreenButton,
    /// Entered by hand.
    Manual,
    /// Any other named source.
    Other(String),
}

impl fmt::Display for MeterSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PortfolioManager => write!(f, "portfolio_manager"),
            Self::GreenButton => write!(f, "green_button"),
            Self::Manual => write!(f, "manual"),
            Self::Other(name) => write!(f, "other:{name}"),
        }
    }
}

/// Logical identity of a meter: two meters with equal keys are the same meter.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MeterKey {
    /// Data source.
    pub source: MeterSource,
    /// Meter id within the source.
    pub source_id: String,
    /// Energy type, e.g. `Electric - Grid`.
    pub meter_type: String,
}

impl MeterKey {
    /// Creates a meter key.
    #[must_use]
    pub fn new(source: MeterSource, source_id: impl Into<String>, meter_type: impl Into<String>) -> Self {
        Self {
            source,
            source_id: source_id.into(),
            meter_type: meter_type.into(),
        }
    }
}

impl fmt::Display for MeterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.source, self.source_id, self.meter_type)
    }
}

/// A meter owned by an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meter {
    /// Meter id.
    pub id: MeterId,
    /// Identity owning the meter.
    pub identity: IdentityId,
    /// Logical key.
    pub key: MeterKey,
}

impl Meter {
    /// Creates a meter with a fresh id.
    #[must_use]
    pub fn new(identity: IdentityId, key: MeterKey) -> Self {
        Self {
            id: MeterId::new(),
            identity,
            key,
        }
    }
}

/// One reading over `[start_time, end_time)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterReading {
    /// Owning meter.
    pub meter: MeterId,
    /// Window start.
    pub start_time: DateTime<Utc>,
    /// Window end (exclusive).
    pub end_time: DateTime<Utc>,
    /// Reading in `unit`.
    pub value: f64,
    /// Unit the reading was reported in.
    pub unit: String,
    /// Factor converting `unit` to kBtu.
    pub conversion_factor: f64,
    /// Import time; the newest reading wins a window.
    pub created_at: DateTime<Utc>,
}

impl MeterReading {
    /// The (start, end) window that keys a reading within its meter.
    #[must_use]
    pub const fn window(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.start_time, self.end_time)
    }

    /// Returns a copy owned by another meter.
    #[must_use]
    pub fn rebind(&self, meter: MeterId) -> Self {
        Self {
            meter,
            ..self.clone()
        }
    }
}

/// Non-fatal notice that an inbound batch held several readings for one window.
///
/// The newest reading was kept; `dropped` counts the discarded ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlapWarning {
    /// Meter the readings belong to.
    pub meter: MeterKey,
    /// Window start.
    pub start_time: DateTime<Utc>,
    /// Window end.
    pub end_time: DateTime<Utc>,
    /// Readings discarded for this window.
    pub dropped: usize,
}

impl fmt::Display for OverlapWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} overlapping reading(s) dropped for meter {} in window {}..{}",
            self.dropped, self.meter, self.start_time, self.end_time
        )
    }
}
