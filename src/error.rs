//! Error types for matchlink.
//!
//! All errors are strongly typed using thiserror so callers can match on the
//! failure that stopped an operation. Overlapping meter readings are not an
//! error; they surface as [`crate::meter::OverlapWarning`] values in summaries.

use thiserror::Error;

use crate::ids::{BindingId, CycleId, IdentityId, OrganizationId, SnapshotId};
use crate::inventory::InventoryKind;
use crate::storage::StorageError;

/// Errors raised while building domain values.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A builder was finished without a required field.
    #[error("Required field '{field}' is missing")]
    MissingField {
        /// Name of the missing field.
        field: String,
    },

    /// A cycle or reading window that is empty or reversed.
    #[error("Invalid time window: start ({start}) must be before end ({end})")]
    InvalidWindow {
        /// Window start.
        start: chrono::DateTime<chrono::Utc>,
        /// Window end.
        end: chrono::DateTime<chrono::Utc>,
    },
}

/// Invalid matching configuration. Raised before any write.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// A criteria override names columns the organization does not have.
    #[error("Unknown matching criteria column(s) for {kind}: {}", .columns.join(", "))]
    UnknownColumns {
        /// Record kind the override was resolved for.
        kind: InventoryKind,
        /// Names that are neither configured nor default columns.
        columns: Vec<String>,
    },

    /// A criteria override with no columns.
    #[error("Matching criteria override must name at least one column")]
    EmptyCriteria,

    /// Engine configuration failed to load or validate.
    #[error("Invalid engine configuration: {reason}")]
    InvalidConfig {
        /// What was wrong.
        reason: String,
    },
}

/// Linking would leave two live bindings for one (identity, cycle).
///
/// The caller must merge the two bindings before linking them.
#[derive(Debug, Error)]
#[error("Link would bind identity {identity} twice in cycle {cycle} (bindings {existing} and {incoming})")]
pub struct LinkIntegrityError {
    /// Identity that would be bound twice.
    pub identity: IdentityId,
    /// Cycle holding both bindings.
    pub cycle: CycleId,
    /// Binding already on the identity in that cycle.
    pub existing: BindingId,
    /// Binding that would be repointed onto it.
    pub incoming: BindingId,
}

/// Errors that occur while executing an operation.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// No binding with this id.
    #[error("Binding not found: {id}")]
    BindingNotFound {
        /// Requested binding.
        id: BindingId,
    },

    /// No snapshot with this id in the caller's organization and kind.
    #[error("Snapshot not found: {id}")]
    SnapshotNotFound {
        /// Requested snapshot.
        id: SnapshotId,
    },

    /// No identity with this id.
    #[error("Identity not found: {id}")]
    IdentityNotFound {
        /// Requested identity.
        id: IdentityId,
    },

    /// The binding belongs to the other record kind.
    #[error("Binding {id} is a {actual}, not a {expected}")]
    KindMismatch {
        /// Requested binding.
        id: BindingId,
        /// Kind the caller asked for.
        expected: InventoryKind,
        /// Kind of the binding.
        actual: InventoryKind,
    },

    /// The cycle is missing or owned by another organization.
    #[error("Cycle {cycle} does not belong to organization {organization}")]
    ForeignCycle {
        /// Requested cycle.
        cycle: CycleId,
        /// Organization of the caller.
        organization: OrganizationId,
    },

    /// Another whole-organization run holds the lock.
    #[error("A matching run is already active for {key}")]
    Locked {
        /// Lock key that was taken.
        key: String,
    },

    /// The job queue rejected the submission.
    #[error("Job queue is full (capacity: {capacity})")]
    QueueFull {
        /// Configured queue capacity.
        capacity: usize,
    },

    /// The worker pool shut down before replying.
    #[error("Job worker disconnected")]
    Disconnected,

    /// A join gave up waiting.
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        /// How long the caller waited.
        duration_ms: u64,
    },
}

/// Top-level error type for matchlink.
#[derive(Debug, Error)]
pub enum MatchError {
    /// Invalid domain value.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Invalid matching or engine configuration.
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// A link step would bind one identity twice in a cycle.
    #[error("Link integrity error: {0}")]
    LinkIntegrity(#[from] LinkIntegrityError),

    /// Operation-level failure.
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// Backend failure.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Broken invariant inside the engine.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
    },
}

impl MatchError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true for configuration errors.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Returns true for link integrity errors.
    #[must_use]
    pub const fn is_link_integrity(&self) -> bool {
        matches!(self, Self::LinkIntegrity(_))
    }

    /// Returns true for storage errors.
    #[must_use]
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Returns true if this error may clear up on retry.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Execution(e) => matches!(
                e,
                ExecutionError::Locked { .. }
                    | ExecutionError::QueueFull { .. }
                    | ExecutionError::Timeout { .. }
            ),
            Self::Storage(e) => e.is_retryable(),
            Self::Validation(_)
            | Self::Configuration(_)
            | Self::LinkIntegrity(_)
            | Self::Internal { .. } => false,
        }
    }
}

impl MatchError {
    /// Debug rendering followed by every source in the chain.
    ///
    /// Stored in progress records so failures stay diagnosable after the job ends.
    #[must_use]
    pub fn trace(&self) -> String {
        let mut trace = format!("{self:?}");
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            trace.push_str("\ncaused by: ");
            trace.push_str(&cause.to_string());
            source = cause.source();
        }
        trace
    }
}

/// Result type alias for matchlink operations.
pub type MatchResult<T> = Result<T, MatchError>;
