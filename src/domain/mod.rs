//! Core data model for Reflexio: interactions, requests, profiles, feedback,
//! evaluation results, and versioned-operation bookkeeping.

mod interaction;
pub mod profile;
pub mod feedback;
mod evaluation;
pub mod operation;

pub use interaction::{Interaction, Request, Role, ToolUse};
pub use profile::{UserProfile, ProfileState};
pub use feedback::{RawFeedback, AggregatedFeedback, BlockingIssue, FeedbackState};
pub use evaluation::{EvaluationResult, Comparison};
pub use operation::{OperationState, OperationKind, OperationStatus};

/// Unix timestamp in seconds, used throughout the domain model instead of a
/// richer time type so that store backends can compare/sort on a plain
/// integer column.
pub type Timestamp = i64;

/// Returns the current unix timestamp in seconds.
pub fn now_ts() -> Timestamp {
    chrono::Utc::now().timestamp()
}
