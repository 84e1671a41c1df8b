use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::profile::ProfileState;
use super::Timestamp;

/// Re-exported under the feedback module: raw and aggregated feedback share
/// the same four-state lifecycle as `UserProfile`.
pub type FeedbackState = ProfileState;

/// A typed capability gap that prevented the agent from completing the
/// request (spec §3 `BlockingIssue`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockingIssueKind {
    MissingTool,
    PermissionDenied,
    ExternalDependency,
    PolicyRestriction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockingIssue {
    pub kind: BlockingIssueKind,
    pub details: String,
}

/// Structured developer-facing feedback extracted from a single window
/// (spec §3 `RawFeedback`). `feedback_content` is the pre-structuring text,
/// retained for audit; `indexed_content` is derived from the structured
/// fields and is what the embedding is computed over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawFeedback {
    pub raw_feedback_id: String,
    pub agent_version: String,
    pub request_id: String,
    pub feedback_name: String,
    pub created_at: Timestamp,
    pub feedback_content: String,
    pub do_action: String,
    pub do_not_action: String,
    pub when_condition: String,
    pub blocking_issue: Option<BlockingIssue>,
    pub indexed_content: String,
    pub status: FeedbackState,
    pub embedding: Vec<f32>,
    pub archived_at: Option<Timestamp>,
}

impl RawFeedback {
    /// `when_condition + ' ' + do_action + ' ' + do_not_action`, per spec §4.4.
    pub fn derive_indexed_content(
        when_condition: &str,
        do_action: &str,
        do_not_action: &str,
    ) -> String {
        format!("{when_condition} {do_action} {do_not_action}")
    }
}

/// Human-approval state layered on top of an `AggregatedFeedback`'s
/// lifecycle `status`. `feedback_status` and `status` are independent axes:
/// an `APPROVED` feedback can still be `CURRENT` or (rarely) `ARCHIVED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeedbackApproval {
    Pending,
    Approved,
    Rejected,
}

/// A cluster-consolidated, developer-facing feedback item (spec §3
/// `AggregatedFeedback`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedFeedback {
    pub feedback_id: String,
    pub feedback_name: String,
    pub agent_version: String,
    pub feedback_content: String,
    pub do_action: String,
    pub do_not_action: String,
    pub when_condition: String,
    pub blocking_issue: Option<BlockingIssue>,
    pub feedback_status: FeedbackApproval,
    pub feedback_metadata: HashMap<String, Value>,
    pub embedding: Vec<f32>,
    pub status: FeedbackState,
    pub archived_at: Option<Timestamp>,
}

impl AggregatedFeedback {
    /// APPROVED aggregated feedbacks are never archived by automated flows
    /// (spec §4.4); this guards every call site that would otherwise
    /// archive-on-disappear.
    pub fn is_protected_from_auto_archive(&self) -> bool {
        self.feedback_status == FeedbackApproval::Approved
    }
}
