//! Matching: criteria resolution, key computation and candidate finding.

mod address;
mod candidates;
mod criteria;

pub use address::normalize_address;
pub use candidates::{compare_rank, rank, CandidateFinder, Candidates};
pub use criteria::{CriteriaResolver, CriterionColumn, MatchCriteria, MatchKey, ADDRESS_COLUMN};
