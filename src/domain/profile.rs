use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::Timestamp;

/// The four-state content lifecycle shared by `UserProfile` and
/// `RawFeedback` (spec §4.3/§4.4). `ARCHIVE_IN_PROGRESS` exists only to make
/// the downgrade swap safe under concurrent readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProfileState {
    Current,
    Pending,
    Archived,
    ArchiveInProgress,
}

/// How long an added/mentioned profile item remains valid; mapped to an
/// absolute `expiration_timestamp` at write time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TtlKind {
    OneDay,
    OneWeek,
    OneMonth,
    OneQuarter,
    OneYear,
    Infinity,
}

impl TtlKind {
    /// Seconds added to `now` to compute `expiration_timestamp`. `Infinity`
    /// returns `None`, meaning the row never expires on its own.
    pub fn expires_at(self, now: Timestamp) -> Option<Timestamp> {
        const DAY: i64 = 86_400;
        let secs = match self {
            TtlKind::OneDay => DAY,
            TtlKind::OneWeek => 7 * DAY,
            TtlKind::OneMonth => 30 * DAY,
            TtlKind::OneQuarter => 91 * DAY,
            TtlKind::OneYear => 365 * DAY,
            TtlKind::Infinity => return None,
        };
        Some(now + secs)
    }
}

/// A per-user structured memory item (spec §3 `UserProfile`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub profile_id: String,
    pub user_id: String,
    pub profile_content: String,
    pub generated_from_request_id: String,
    pub last_modified_timestamp: Timestamp,
    pub expiration_timestamp: Option<Timestamp>,
    pub source: String,
    pub status: ProfileState,
    pub embedding: Vec<f32>,
    pub custom_features: HashMap<String, Value>,
    /// Set the instant a row transitions into `Archived`; used by `upgrade`
    /// to distinguish rows archived before the upgrade from the ones the
    /// upgrade itself just archived (spec §9 open question #3).
    pub archived_at: Option<Timestamp>,
}

impl UserProfile {
    /// Normalization rule used by the profile-uniqueness invariant: trimmed,
    /// lower-cased content. Two profiles are "semantically equal" for the
    /// purposes of the CURRENT-set uniqueness invariant iff this matches.
    pub fn normalized_content(&self) -> String {
        self.profile_content.trim().to_lowercase()
    }
}

/// A single entry in the append-only audit log of profile mutations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileChangeLog {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub mentioned: Vec<String>,
    pub user_id: String,
    pub request_id: String,
    pub created_at: Timestamp,
}
