use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::Timestamp;

/// Distinguishes the six `OperationState` payload shapes named in spec §3.
/// Every key is composed as `{service}::{org_id}[::scope]::{suffix}`; this
/// enum captures the suffix and payload, key composition itself lives in
/// `operation_state::OperationKey`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationKind {
    Progress(ProgressRecord),
    Lock(LockRecord),
    Bookmark(BookmarkRecord),
    ClusterFingerprints(ClusterFingerprintRecord),
    SimpleLock(SimpleLockRecord),
    Cancellation(CancellationRecord),
}

/// Status of a long-running versioned batch operation (rerun, upgrade,
/// downgrade) or of a generation service run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedUser {
    pub user_id: String,
    pub error: String,
}

/// Progress tracking for a batch job (spec §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub status: OperationStatus,
    pub started_at: Timestamp,
    pub completed_at: Option<Timestamp>,
    pub total_users: usize,
    pub processed_users: usize,
    pub failed_users: usize,
    pub current_user_id: Option<String>,
    pub processed_user_ids: Vec<String>,
    pub failed_user_ids: Vec<FailedUser>,
    pub error_message: Option<String>,
    /// Free-form echo of the request parameters that kicked off the job,
    /// surfaced to `get_operation_status` callers.
    pub request_params: Option<serde_json::Value>,
}

impl ProgressRecord {
    pub fn progress_percentage(&self) -> f64 {
        if self.total_users == 0 {
            return 100.0;
        }
        (self.processed_users as f64 / self.total_users as f64) * 100.0
    }
}

/// A concurrency lock record (spec §4.1, §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub holder_request_id: String,
    pub acquired_at: Timestamp,
    pub pending_request_id: Option<String>,
}

/// A per-extractor stride bookmark (spec §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookmarkRecord {
    pub last_processed_interaction_id: String,
    pub last_processed_ts: Timestamp,
}

/// cluster_fingerprint → feedback_id, per `(agent_version, feedback_name)`
/// (spec §4.4).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterFingerprintRecord {
    pub fingerprints: HashMap<String, String>,
}

/// A simple advisory lock with no pending-request queuing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleLockRecord {
    pub acquired_at: Timestamp,
}

/// Cooperative cancellation request, stored in its own row to avoid
/// lost-update races against progress writes (spec §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancellationRecord {
    pub requested_at: Timestamp,
    pub reason: Option<String>,
}

/// A full `OperationState` row: a composite key plus its typed payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationState {
    pub key: String,
    pub payload: OperationKind,
}
