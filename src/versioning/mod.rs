//! Versioned batch operations (spec §4.6): rerun, upgrade, and downgrade
//! across an org's users and raw-feedback names, progress-tracked through
//! `OperationStateManager` and cooperatively cancellable between items.
//!
//! Grounded on the teacher's `batch::scheduler::ParallelScheduler` for the
//! job-loop shape and `batch::error_handling::BatchErrorHandler`'s error
//! classification, adapted from "retry transient, dead-letter permanent" to
//! spec §4.6's simpler "record per-user failure and continue, unless
//! `stop_on_error`" policy. The loop itself is intentionally sequential, not
//! pooled like the generation services: cancellation must be observed
//! strictly between items, never mid-item (spec §4.6, §5).

use std::future::Future;
use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::domain::feedback::FeedbackState;
use crate::domain::operation::ProgressRecord;
use crate::domain::{now_ts, OperationStatus, ProfileState};
use crate::error::Result;
use crate::extractor::{ExtractorConfig, GenerationMode, GenerationServiceConfig};
use crate::operation_state::OperationStateManager;
use crate::services::aggregator::FeedbackAggregator;
use crate::services::feedback::FeedbackService;
use crate::services::profile::ProfileService;
use crate::store::Store;

/// Service names batch jobs key their progress/lock/cancellation rows under.
/// Kept distinct per operation kind so two concurrently running batch jobs
/// for the same org (e.g. an upgrade and a rerun) never collide on the same
/// `OperationState` row.
pub const PROFILE_UPGRADE: &str = "profile_upgrade";
pub const PROFILE_DOWNGRADE: &str = "profile_downgrade";
pub const PROFILE_RERUN: &str = "profile_rerun";
pub const RAW_FEEDBACK_UPGRADE: &str = "raw_feedback_upgrade";
pub const RAW_FEEDBACK_DOWNGRADE: &str = "raw_feedback_downgrade";
pub const FEEDBACK_RERUN: &str = "feedback_rerun";
pub const FEEDBACK_AGGREGATION_RUN: &str = "feedback_aggregation_run";

/// Sequentially drives `work` over `items`, persisting progress after each
/// one and checking the cancellation row between items. A per-item failure
/// is recorded and the loop continues unless `stop_on_error` is set (spec
/// §4.6's per-user failure policy).
async fn run_batch<T, F, Fut>(
    operation_state: &OperationStateManager,
    service: &str,
    org_id: &str,
    items: Vec<T>,
    item_id: impl Fn(&T) -> String,
    stop_on_error: bool,
    mut work: F,
) -> Result<()>
where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    operation_state.init_progress(service, org_id, items.len(), None).await?;

    for item in items {
        if operation_state.is_cancellation_requested(service, org_id).await? {
            operation_state.finalize_progress(service, org_id, OperationStatus::Cancelled, None).await?;
            operation_state.clear_cancellation(service, org_id).await?;
            info!(service, org_id, "batch job cancelled between items");
            return Ok(());
        }

        let id = item_id(&item);
        match work(item).await {
            Ok(()) => operation_state.record_user_outcome(service, org_id, &id, None).await?,
            Err(e) => {
                warn!(service, org_id, item = %id, error = %e, "batch item failed");
                operation_state.record_user_outcome(service, org_id, &id, Some(e.to_string())).await?;
                if stop_on_error {
                    operation_state
                        .finalize_progress(service, org_id, OperationStatus::Failed, Some(e.to_string()))
                        .await?;
                    return Err(e);
                }
            }
        }
    }

    operation_state.finalize_progress(service, org_id, OperationStatus::Completed, None).await?;
    Ok(())
}

/// Reverts the profile `id`s in `staged` back to `Current` on a failed
/// transition; best-effort, errors are logged rather than propagated since
/// the caller is already on its own error path.
async fn revert_profiles_to_current(store: &dyn Store, staged: &[String]) {
    for id in staged {
        if let Err(e) = store.set_profile_status(id, ProfileState::Current, None).await {
            warn!(profile_id = %id, error = %e, "failed to revert profile during rollback");
        }
    }
}

/// The three-step CURRENT→ARCHIVED / PENDING→CURRENT transition for one
/// user (spec §8 invariant 3/4, §9 open question on the archived-before
/// marker). Idempotent: a user with no PENDING profiles is a no-op.
async fn upgrade_one_profile_user(store: &dyn Store, user_id: &str) -> Result<()> {
    let pending = store.get_profiles_by_status(user_id, ProfileState::Pending).await?;
    if pending.is_empty() {
        return Ok(());
    }
    let job_started_at = now_ts();
    let current = store.get_profiles_by_status(user_id, ProfileState::Current).await?;

    let mut archived_ids = Vec::new();
    for c in &current {
        store.set_profile_status(&c.profile_id, ProfileState::Archived, Some(job_started_at)).await?;
        archived_ids.push(c.profile_id.clone());
    }

    for p in &pending {
        if let Err(e) = store.set_profile_status(&p.profile_id, ProfileState::Current, None).await {
            revert_profiles_to_current(store, &archived_ids).await;
            return Err(e);
        }
    }

    // Rows archived by this very job carry `archived_at == job_started_at`,
    // so only strictly-older (pre-existing) archived rows are swept here.
    store.delete_profiles_archived_before(user_id, job_started_at).await?;
    Ok(())
}

/// Reverses `upgrade_one_profile_user` (spec §8 invariant 4: downgrade
/// involution). A user with no ARCHIVED profiles is a no-op — there is
/// nothing to restore.
async fn downgrade_one_profile_user(store: &dyn Store, user_id: &str) -> Result<()> {
    let archived = store.get_profiles_by_status(user_id, ProfileState::Archived).await?;
    if archived.is_empty() {
        return Ok(());
    }
    let current = store.get_profiles_by_status(user_id, ProfileState::Current).await?;

    // Stage the current set through ARCHIVE_IN_PROGRESS so concurrent
    // readers never observe both the old and new CURRENT sets at once.
    let mut staged = Vec::new();
    for c in &current {
        store.set_profile_status(&c.profile_id, ProfileState::ArchiveInProgress, None).await?;
        staged.push(c.profile_id.clone());
    }

    let swap = async {
        for a in &archived {
            store.set_profile_status(&a.profile_id, ProfileState::Current, None).await?;
        }
        for id in &staged {
            store.set_profile_status(id, ProfileState::Pending, None).await?;
        }
        Ok(())
    }
    .await;

    if let Err(e) = swap {
        revert_profiles_to_current(store, &staged).await;
        return Err(e);
    }
    Ok(())
}

/// Mirrors `upgrade_one_profile_user` for raw feedback, scoped by
/// `(agent_version, feedback_name)` instead of `user_id` (raw feedback has
/// no `user_id` field, spec §3).
async fn upgrade_one_feedback_name(store: &dyn Store, agent_version: &str, feedback_name: &str) -> Result<()> {
    let pending = store.get_raw_feedbacks(agent_version, feedback_name, FeedbackState::Pending).await?;
    if pending.is_empty() {
        return Ok(());
    }
    let job_started_at = now_ts();
    let current = store.get_raw_feedbacks(agent_version, feedback_name, FeedbackState::Current).await?;

    let mut archived_ids = Vec::new();
    for c in &current {
        store.set_raw_feedback_status(&c.raw_feedback_id, FeedbackState::Archived, Some(job_started_at)).await?;
        archived_ids.push(c.raw_feedback_id.clone());
    }

    for p in &pending {
        if let Err(e) = store.set_raw_feedback_status(&p.raw_feedback_id, FeedbackState::Current, None).await {
            for id in &archived_ids {
                let _ = store.set_raw_feedback_status(id, FeedbackState::Current, None).await;
            }
            return Err(e);
        }
    }

    store.delete_raw_feedbacks_archived_before(agent_version, job_started_at).await?;
    Ok(())
}

async fn downgrade_one_feedback_name(store: &dyn Store, agent_version: &str, feedback_name: &str) -> Result<()> {
    let archived = store.get_raw_feedbacks(agent_version, feedback_name, FeedbackState::Archived).await?;
    if archived.is_empty() {
        return Ok(());
    }
    let current = store.get_raw_feedbacks(agent_version, feedback_name, FeedbackState::Current).await?;

    let mut staged = Vec::new();
    for c in &current {
        store.set_raw_feedback_status(&c.raw_feedback_id, FeedbackState::ArchiveInProgress, None).await?;
        staged.push(c.raw_feedback_id.clone());
    }

    let swap = async {
        for a in &archived {
            store.set_raw_feedback_status(&a.raw_feedback_id, FeedbackState::Current, None).await?;
        }
        for id in &staged {
            store.set_raw_feedback_status(id, FeedbackState::Pending, None).await?;
        }
        Ok(())
    }
    .await;

    if let Err(e) = swap {
        for id in &staged {
            let _ = store.set_raw_feedback_status(id, FeedbackState::Current, None).await;
        }
        return Err(e);
    }
    Ok(())
}

/// Entry point for every versioned batch operation the external API exposes
/// (spec §6): upgrade/downgrade/rerun for profiles and raw feedback, plus
/// on-demand feedback aggregation, cancellation, and status lookup.
pub struct VersioningService {
    store: Arc<dyn Store>,
    operation_state: OperationStateManager,
    profile: Arc<ProfileService>,
    feedback: Arc<FeedbackService>,
    aggregator: Arc<FeedbackAggregator>,
}

impl VersioningService {
    pub fn new(
        store: Arc<dyn Store>,
        operation_state: OperationStateManager,
        profile: Arc<ProfileService>,
        feedback: Arc<FeedbackService>,
        aggregator: Arc<FeedbackAggregator>,
    ) -> Self {
        Self { store, operation_state, profile, feedback, aggregator }
    }

    #[instrument(skip(self))]
    pub async fn upgrade_all_profiles(&self, org_id: &str, stop_on_error: bool) -> Result<()> {
        let user_ids = self.store.list_profile_user_ids().await?;
        let store = self.store.clone();
        run_batch(&self.operation_state, PROFILE_UPGRADE, org_id, user_ids, |id| id.clone(), stop_on_error, move |user_id| {
            let store = store.clone();
            async move { upgrade_one_profile_user(store.as_ref(), &user_id).await }
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn downgrade_all_profiles(&self, org_id: &str, stop_on_error: bool) -> Result<()> {
        let user_ids = self.store.list_profile_user_ids().await?;
        let store = self.store.clone();
        run_batch(&self.operation_state, PROFILE_DOWNGRADE, org_id, user_ids, |id| id.clone(), stop_on_error, move |user_id| {
            let store = store.clone();
            async move { downgrade_one_profile_user(store.as_ref(), &user_id).await }
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn upgrade_all_raw_feedbacks(&self, org_id: &str, stop_on_error: bool) -> Result<()> {
        let names = self.store.list_feedback_names(org_id).await?;
        let store = self.store.clone();
        let org_id_owned = org_id.to_string();
        run_batch(&self.operation_state, RAW_FEEDBACK_UPGRADE, org_id, names, |name| name.clone(), stop_on_error, move |name| {
            let store = store.clone();
            let org_id = org_id_owned.clone();
            async move { upgrade_one_feedback_name(store.as_ref(), &org_id, &name).await }
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn downgrade_all_raw_feedbacks(&self, org_id: &str, stop_on_error: bool) -> Result<()> {
        let names = self.store.list_feedback_names(org_id).await?;
        let store = self.store.clone();
        let org_id_owned = org_id.to_string();
        run_batch(&self.operation_state, RAW_FEEDBACK_DOWNGRADE, org_id, names, |name| name.clone(), stop_on_error, move |name| {
            let store = store.clone();
            let org_id = org_id_owned.clone();
            async move { downgrade_one_feedback_name(store.as_ref(), &org_id, &name).await }
        })
        .await
    }

    /// Re-extracts profiles for every known user (or just `user_ids`, if
    /// given) in `GenerationMode::Rerun`, which is not stride-gated and
    /// writes PENDING rows rather than CURRENT ones (spec §4.2 mode table).
    /// A subsequent `upgrade_all_profiles` promotes the results.
    #[instrument(skip(self, extractor_configs))]
    pub async fn rerun_profile_generation(
        &self,
        org_id: &str,
        user_ids: Option<Vec<String>>,
        extractor_configs: Vec<ExtractorConfig>,
        global_window_size: usize,
        global_stride: usize,
        request_id: &str,
        stop_on_error: bool,
    ) -> Result<()> {
        let user_ids = match user_ids {
            Some(ids) => ids,
            None => self.store.list_profile_user_ids().await?,
        };
        let profile = self.profile.clone();
        let org_id_owned = org_id.to_string();
        let request_id_owned = request_id.to_string();
        run_batch(&self.operation_state, PROFILE_RERUN, org_id, user_ids, |id| id.clone(), stop_on_error, move |user_id| {
            let profile = profile.clone();
            let extractor_configs = extractor_configs.clone();
            let service_config = GenerationServiceConfig {
                org_id: org_id_owned.clone(),
                user_id,
                source: String::new(),
                agent_version: org_id_owned.clone(),
                request_id: request_id_owned.clone(),
                request_created_at: now_ts(),
                start_time: None,
                end_time: None,
                extractor_names: None,
                allow_manual_trigger: true,
                mode: GenerationMode::Rerun,
                global_window_size,
                global_stride,
            };
            async move { profile.run(&service_config, &extractor_configs).await.map(|_| ()) }
        })
        .await
    }

    /// Reruns feedback extraction for the org in `GenerationMode::Rerun`.
    /// Feedback locks per-org rather than per-user (spec §4.1), so this is a
    /// single-item batch — kept on the same progress/cancellation machinery
    /// as the per-user jobs for a uniform `get_operation_status` surface.
    #[instrument(skip(self, extractor_configs))]
    pub async fn rerun_feedback_generation(
        &self,
        org_id: &str,
        extractor_configs: Vec<ExtractorConfig>,
        global_window_size: usize,
        global_stride: usize,
        request_id: &str,
    ) -> Result<()> {
        let feedback = self.feedback.clone();
        let service_config = GenerationServiceConfig {
            org_id: org_id.to_string(),
            user_id: String::new(),
            source: String::new(),
            agent_version: org_id.to_string(),
            request_id: request_id.to_string(),
            request_created_at: now_ts(),
            start_time: None,
            end_time: None,
            extractor_names: None,
            allow_manual_trigger: true,
            mode: GenerationMode::Rerun,
            global_window_size,
            global_stride,
        };
        run_batch(
            &self.operation_state,
            FEEDBACK_RERUN,
            org_id,
            vec![org_id.to_string()],
            |id| id.clone(),
            false,
            move |_| {
                let feedback = feedback.clone();
                let service_config = service_config.clone();
                let extractor_configs = extractor_configs.clone();
                async move { feedback.run(&service_config, &extractor_configs).await.map(|_| ()) }
            },
        )
        .await
    }

    /// Runs cluster aggregation for every `feedback_name` under `org_id` (or
    /// just `feedback_names`, if given) — spec §4.4's `run_aggregation`,
    /// invoked as a batch across names rather than one at a time.
    #[instrument(skip(self))]
    pub async fn run_feedback_aggregation(
        &self,
        org_id: &str,
        feedback_names: Option<Vec<String>>,
        mode: GenerationMode,
    ) -> Result<()> {
        let feedback_names = match feedback_names {
            Some(names) => names,
            None => self.store.list_feedback_names(org_id).await?,
        };
        let aggregator = self.aggregator.clone();
        let org_id_owned = org_id.to_string();
        run_batch(
            &self.operation_state,
            FEEDBACK_AGGREGATION_RUN,
            org_id,
            feedback_names,
            |name| name.clone(),
            false,
            move |name| {
                let aggregator = aggregator.clone();
                let org_id = org_id_owned.clone();
                async move { aggregator.run_aggregation(&org_id, &org_id, &name, mode).await.map(|_| ()) }
            },
        )
        .await
    }

    /// Requests cooperative cancellation of the named batch job for `org_id`
    /// (spec §4.6, §6 `POST /cancel_operation`).
    pub async fn cancel_operation(&self, service_name: &str, org_id: &str, reason: Option<String>) -> Result<()> {
        self.operation_state.request_cancellation(service_name, org_id, reason).await
    }

    /// Spec §6 `GET /get_operation_status`. `ProgressRecord::progress_percentage`
    /// gives callers the derived percentage without re-deriving it here.
    pub async fn get_operation_status(&self, service_name: &str, org_id: &str) -> Result<Option<ProgressRecord>> {
        self.operation_state.get_progress(service_name, org_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::UserProfile;
    use crate::llm::{MockLlmClient, PromptManager};
    use crate::operation_state::OperationStateManager;
    use crate::store::InMemoryStore;

    fn profile(id: &str, user_id: &str, status: ProfileState) -> UserProfile {
        UserProfile {
            profile_id: id.into(),
            user_id: user_id.into(),
            profile_content: format!("content {id}"),
            generated_from_request_id: "r0".into(),
            last_modified_timestamp: 0,
            expiration_timestamp: None,
            source: "chat".into(),
            status,
            embedding: vec![],
            custom_features: Default::default(),
            archived_at: None,
        }
    }

    fn versioning(store: Arc<dyn Store>) -> VersioningService {
        let operation_state = OperationStateManager::new(store.clone());
        let llm = Arc::new(MockLlmClient::new());
        let prompts = Arc::new(PromptManager::with_defaults());
        let profile = Arc::new(ProfileService::new(store.clone(), operation_state.clone(), llm.clone(), prompts.clone(), "gpt-test"));
        let feedback = Arc::new(FeedbackService::new(store.clone(), operation_state.clone(), llm.clone(), prompts.clone(), "gpt-test"));
        let aggregator = Arc::new(FeedbackAggregator::new(store.clone(), operation_state.clone(), llm, prompts, "gpt-test"));
        VersioningService::new(store, operation_state, profile, feedback, aggregator)
    }

    #[tokio::test]
    async fn upgrade_promotes_pending_and_archives_current_and_sweeps_old_archived() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        store.put_profile(profile("stale", "u1", ProfileState::Archived)).await.unwrap();
        store.put_profile(profile("p_current", "u1", ProfileState::Current)).await.unwrap();
        store.put_profile(profile("p_pending", "u1", ProfileState::Pending)).await.unwrap();

        let versioning = versioning(store.clone());
        versioning.upgrade_all_profiles("org1", false).await.unwrap();

        assert!(store.get_profile("p_current").await.unwrap().unwrap().status == ProfileState::Archived);
        assert!(store.get_profile("p_pending").await.unwrap().unwrap().status == ProfileState::Current);
        assert!(store.get_profile("stale").await.unwrap().is_none());

        let progress = versioning.get_operation_status(PROFILE_UPGRADE, "org1").await.unwrap().unwrap();
        assert_eq!(progress.status, OperationStatus::Completed);
    }

    #[tokio::test]
    async fn upgrade_is_a_no_op_without_pending_profiles() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        store.put_profile(profile("p_current", "u1", ProfileState::Current)).await.unwrap();

        let versioning = versioning(store.clone());
        versioning.upgrade_all_profiles("org1", false).await.unwrap();
        versioning.upgrade_all_profiles("org1", false).await.unwrap();

        assert!(store.get_profile("p_current").await.unwrap().unwrap().status == ProfileState::Current);
    }

    #[tokio::test]
    async fn downgrade_restores_prior_current_set() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        store.put_profile(profile("p_current", "u1", ProfileState::Current)).await.unwrap();
        store.put_profile(profile("p_pending", "u1", ProfileState::Pending)).await.unwrap();

        let versioning = versioning(store.clone());
        versioning.upgrade_all_profiles("org1", false).await.unwrap();
        versioning.downgrade_all_profiles("org1", false).await.unwrap();

        assert!(store.get_profile("p_current").await.unwrap().unwrap().status == ProfileState::Current);
        assert!(store.get_profile("p_pending").await.unwrap().unwrap().status == ProfileState::Pending);
    }

    #[tokio::test]
    async fn cancellation_between_items_stops_the_batch() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        for user in ["u1", "u2", "u3"] {
            store
                .put_profile(profile(&format!("pending_{user}"), user, ProfileState::Pending))
                .await
                .unwrap();
        }

        let versioning = versioning(store.clone());
        versioning.operation_state.request_cancellation(PROFILE_UPGRADE, "org1", None).await.unwrap();
        versioning.upgrade_all_profiles("org1", false).await.unwrap();

        let progress = versioning.get_operation_status(PROFILE_UPGRADE, "org1").await.unwrap().unwrap();
        assert_eq!(progress.status, OperationStatus::Cancelled);
        // Nothing was processed: cancellation was observed before the first item.
        assert_eq!(progress.processed_users, 0);
    }

    fn raw_feedback(id: &str, embedding: Vec<f32>) -> crate::domain::RawFeedback {
        crate::domain::RawFeedback {
            raw_feedback_id: id.into(),
            agent_version: "org1".into(),
            request_id: "r1".into(),
            feedback_name: "fn_tone".into(),
            created_at: 0,
            feedback_content: "be concise".into(),
            do_action: "be concise".into(),
            do_not_action: "ramble".into(),
            when_condition: "always".into(),
            blocking_issue: None,
            indexed_content: "always be concise ramble".into(),
            status: FeedbackState::Current,
            embedding,
            archived_at: None,
        }
    }

    #[tokio::test]
    async fn aggregation_batch_iterates_discovered_feedback_names() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        store.put_raw_feedback(raw_feedback("f1", vec![1.0, 0.0])).await.unwrap();
        store.put_raw_feedback(raw_feedback("f2", vec![0.99, 0.01])).await.unwrap();

        let operation_state = OperationStateManager::new(store.clone());
        let llm = Arc::new(MockLlmClient::new());
        llm.push_response(
            "feedback_consolidation_output",
            serde_json::json!({
                "feedback_content": "be concise",
                "do_action": "be concise",
                "do_not_action": "ramble",
                "when_condition": "always",
                "blocking_issue": null
            }),
        );
        let prompts = Arc::new(PromptManager::with_defaults());
        let profile = Arc::new(ProfileService::new(store.clone(), operation_state.clone(), llm.clone(), prompts.clone(), "gpt-test"));
        let feedback = Arc::new(FeedbackService::new(store.clone(), operation_state.clone(), llm.clone(), prompts.clone(), "gpt-test"));
        let aggregator = Arc::new(
            FeedbackAggregator::new(store.clone(), operation_state.clone(), llm, prompts, "gpt-test")
                .with_clustering_config(crate::cluster::ClusteringConfig { min_feedback_threshold: 1, ..Default::default() }),
        );
        let versioning = VersioningService::new(store, operation_state, profile, feedback, aggregator);

        versioning.run_feedback_aggregation("org1", None, GenerationMode::Regular).await.unwrap();
        let progress = versioning.get_operation_status(FEEDBACK_AGGREGATION_RUN, "org1").await.unwrap().unwrap();
        assert_eq!(progress.status, OperationStatus::Completed);
        assert_eq!(progress.total_users, 1);
    }
}
