//! The durable state boundary: CRUD for every domain entity plus the atomic
//! conditional-upsert primitive the lock protocol depends on.

mod memory;
mod postgres;

pub use memory::InMemoryStore;
pub use postgres::{PostgresConfig, PostgresStore};

use async_trait::async_trait;

use crate::domain::{
    operation::OperationKind, AggregatedFeedback, Interaction, ProfileState, Request,
    RawFeedback, Timestamp, UserProfile,
};
use crate::domain::feedback::FeedbackState;
use crate::domain::profile::ProfileChangeLog;
use crate::error::Result;

/// Which entity a `search` call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchEntity {
    Profile,
    RawFeedback,
    AggregatedFeedback,
    Interaction,
}

/// A semantic search request. `query_embedding` is mandatory; the core
/// always passes a pre-computed embedding (spec §6) so the store never
/// needs its own LLM client.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub entity: SearchEntity,
    pub user_id: Option<String>,
    pub query_embedding: Vec<f32>,
    pub threshold: f32,
    pub top_k: usize,
}

/// The durable state boundary. Implementations must make
/// `upsert_operation_state_with` atomic with respect to concurrent callers
/// on the same key — this is the "conditional atomic upsert, return prior
/// value" primitive spec §4.7/§6 requires.
#[async_trait]
pub trait Store: Send + Sync {
    // --- requests & interactions -------------------------------------
    async fn put_request(&self, request: Request) -> Result<()>;
    async fn get_request(&self, request_id: &str) -> Result<Option<Request>>;
    async fn delete_request(&self, request_id: &str) -> Result<()>;
    async fn delete_request_group(&self, request_group: &str) -> Result<()>;

    async fn put_interactions(&self, interactions: Vec<Interaction>) -> Result<()>;
    async fn get_interactions_for_request(&self, request_id: &str) -> Result<Vec<Interaction>>;

    /// Number of interactions for `user_id` (optionally filtered by
    /// `source`) strictly newer than `since_interaction_id` (`None` means
    /// "all of them" — used the first time an extractor ever runs).
    async fn count_new_interactions_since(
        &self,
        user_id: &str,
        source: Option<&str>,
        since_interaction_id: Option<&str>,
    ) -> Result<usize>;

    /// The last `window_size` interactions for `user_id` ending at the
    /// current cursor — a context window, not just the unprocessed tail
    /// (spec §4.2 step d).
    async fn get_interaction_window(
        &self,
        user_id: &str,
        source: Option<&str>,
        window_size: usize,
    ) -> Result<Vec<Interaction>>;

    // --- profiles -------------------------------------------------------
    async fn put_profile(&self, profile: UserProfile) -> Result<()>;
    async fn get_profile(&self, profile_id: &str) -> Result<Option<UserProfile>>;
    async fn get_profiles_by_status(
        &self,
        user_id: &str,
        status: ProfileState,
    ) -> Result<Vec<UserProfile>>;
    async fn set_profile_status(
        &self,
        profile_id: &str,
        status: ProfileState,
        archived_at: Option<Timestamp>,
    ) -> Result<()>;
    /// Soft-deletes (archives) `profile_id` only if it is owned by
    /// `user_id` and currently `Current` (spec §4.3 Updater invariant).
    async fn soft_delete_current_profile(&self, profile_id: &str, user_id: &str) -> Result<bool>;
    async fn append_profile_change_log(&self, log: ProfileChangeLog) -> Result<()>;
    async fn delete_profiles_archived_before(
        &self,
        user_id: &str,
        before: Timestamp,
    ) -> Result<()>;
    async fn search(&self, query: SearchQuery) -> Result<Vec<UserProfile>>;

    // --- raw feedback ----------------------------------------------------
    async fn put_raw_feedback(&self, feedback: RawFeedback) -> Result<()>;
    async fn get_raw_feedbacks(
        &self,
        agent_version: &str,
        feedback_name: &str,
        status: FeedbackState,
    ) -> Result<Vec<RawFeedback>>;
    async fn set_raw_feedback_status(
        &self,
        raw_feedback_id: &str,
        status: FeedbackState,
        archived_at: Option<Timestamp>,
    ) -> Result<()>;
    async fn delete_raw_feedbacks_archived_before(
        &self,
        agent_version: &str,
        before: Timestamp,
    ) -> Result<()>;
    /// Distinct `feedback_name`s with at least one raw feedback row under
    /// `agent_version` — the enumeration `upgrade_all_raw_feedbacks` and
    /// `downgrade_all_raw_feedbacks` iterate over (spec §4.6's "all raw
    /// feedbacks" batch scope).
    async fn list_feedback_names(&self, agent_version: &str) -> Result<Vec<String>>;

    /// Distinct `user_id`s with at least one profile row, in any status —
    /// the enumeration `upgrade_all_profiles`, `downgrade_all_profiles`,
    /// and an org-wide `rerun_profile_generation` iterate over (spec §4.6).
    async fn list_profile_user_ids(&self) -> Result<Vec<String>>;

    // --- aggregated feedback ---------------------------------------------
    async fn put_aggregated_feedback(&self, feedback: AggregatedFeedback) -> Result<()>;
    async fn get_aggregated_feedback(&self, feedback_id: &str) -> Result<Option<AggregatedFeedback>>;
    async fn get_aggregated_feedbacks(
        &self,
        agent_version: &str,
        feedback_name: &str,
        status: FeedbackState,
    ) -> Result<Vec<AggregatedFeedback>>;
    /// Selective bulk operations over aggregated feedback (spec §6).
    async fn archive_by_ids(&self, ids: &[String]) -> Result<()>;
    async fn restore_by_ids(&self, ids: &[String]) -> Result<()>;
    async fn delete_by_ids(&self, ids: &[String]) -> Result<()>;

    // --- evaluation -------------------------------------------------------
    async fn put_evaluation_result(&self, result: crate::domain::EvaluationResult) -> Result<()>;
    async fn get_evaluation_results(
        &self,
        request_id: &str,
    ) -> Result<Vec<crate::domain::EvaluationResult>>;

    // --- operation state ---------------------------------------------------
    async fn get_operation_state(&self, key: &str) -> Result<Option<OperationKind>>;

    /// Atomically read the current value for `key` (or `None`), compute
    /// `f(prior)`, write it back, and return `(prior, new)` — all within a
    /// single transaction/critical section so no other caller can observe
    /// an intermediate state. This is the primitive the lock protocol,
    /// bookmark advancement, and cluster-fingerprint replacement all build
    /// on (spec §4.7, §6).
    async fn upsert_operation_state_with(
        &self,
        key: &str,
        f: Box<dyn FnOnce(Option<OperationKind>) -> OperationKind + Send>,
    ) -> Result<(Option<OperationKind>, OperationKind)>;

    async fn delete_operation_state(&self, key: &str) -> Result<()>;
}
