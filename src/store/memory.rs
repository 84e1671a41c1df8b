use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::domain::feedback::FeedbackState;
use crate::domain::operation::OperationKind;
use crate::domain::profile::ProfileChangeLog;
use crate::domain::{
    AggregatedFeedback, EvaluationResult, Interaction, ProfileState, Request, RawFeedback,
    Timestamp, UserProfile,
};
use crate::error::{ReflexioError, Result};

use super::{SearchEntity, SearchQuery, Store};

/// Thread-safe in-memory `Store`, used by tests and local development.
/// Every map is a `DashMap` keyed by id, mirroring the teacher's
/// `MemoryCheckpointer` shape; the operation-state map is additionally
/// guarded by a `parking_lot::Mutex` so `upsert_operation_state_with` can
/// run its read-modify-write as one atomic critical section.
#[derive(Default)]
pub struct InMemoryStore {
    requests: DashMap<String, Request>,
    interactions_by_request: DashMap<String, Vec<Interaction>>,
    interactions_by_user: DashMap<String, Vec<Interaction>>,
    profiles: DashMap<String, UserProfile>,
    change_logs: Mutex<Vec<ProfileChangeLog>>,
    raw_feedbacks: DashMap<String, RawFeedback>,
    aggregated_feedbacks: DashMap<String, AggregatedFeedback>,
    evaluation_results: DashMap<String, Vec<EvaluationResult>>,
    operation_state: Mutex<std::collections::HashMap<String, OperationKind>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
        crate::cluster::cosine_distance(a, b)
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn put_request(&self, request: Request) -> Result<()> {
        self.requests.insert(request.request_id.clone(), request);
        Ok(())
    }

    async fn get_request(&self, request_id: &str) -> Result<Option<Request>> {
        Ok(self.requests.get(request_id).map(|r| r.clone()))
    }

    async fn delete_request(&self, request_id: &str) -> Result<()> {
        self.requests.remove(request_id);
        if let Some((_, interactions)) = self.interactions_by_request.remove(request_id) {
            for interaction in interactions {
                if let Some(mut per_user) = self.interactions_by_user.get_mut(&interaction.user_id) {
                    per_user.retain(|i| i.interaction_id != interaction.interaction_id);
                }
            }
        }
        Ok(())
    }

    async fn delete_request_group(&self, request_group: &str) -> Result<()> {
        let ids: Vec<String> = self
            .requests
            .iter()
            .filter(|r| r.request_group.as_deref() == Some(request_group))
            .map(|r| r.request_id.clone())
            .collect();
        for id in ids {
            self.delete_request(&id).await?;
        }
        Ok(())
    }

    async fn put_interactions(&self, interactions: Vec<Interaction>) -> Result<()> {
        for interaction in interactions {
            self.interactions_by_request
                .entry(interaction.request_id.clone())
                .or_default()
                .push(interaction.clone());
            self.interactions_by_user
                .entry(interaction.user_id.clone())
                .or_default()
                .push(interaction);
        }
        Ok(())
    }

    async fn get_interactions_for_request(&self, request_id: &str) -> Result<Vec<Interaction>> {
        Ok(self
            .interactions_by_request
            .get(request_id)
            .map(|v| v.clone())
            .unwrap_or_default())
    }

    async fn count_new_interactions_since(
        &self,
        user_id: &str,
        source: Option<&str>,
        since_interaction_id: Option<&str>,
    ) -> Result<usize> {
        let Some(all) = self.interactions_by_user.get(user_id) else {
            return Ok(0);
        };
        // Source filtering requires joining against the owning Request; the
        // in-memory store is used for tests and single-source scenarios, so
        // it treats all interactions for a user as one stream.
        let _ = source;
        match since_interaction_id {
            None => Ok(all.len()),
            Some(bookmark) => match all.iter().position(|i| i.interaction_id == bookmark) {
                Some(idx) => Ok(all.len().saturating_sub(idx + 1)),
                None => Ok(all.len()),
            },
        }
    }

    async fn get_interaction_window(
        &self,
        user_id: &str,
        _source: Option<&str>,
        window_size: usize,
    ) -> Result<Vec<Interaction>> {
        let Some(all) = self.interactions_by_user.get(user_id) else {
            return Ok(Vec::new());
        };
        let len = all.len();
        let start = len.saturating_sub(window_size);
        Ok(all[start..].to_vec())
    }

    async fn put_profile(&self, profile: UserProfile) -> Result<()> {
        self.profiles.insert(profile.profile_id.clone(), profile);
        Ok(())
    }

    async fn get_profile(&self, profile_id: &str) -> Result<Option<UserProfile>> {
        Ok(self.profiles.get(profile_id).map(|p| p.clone()))
    }

    async fn get_profiles_by_status(
        &self,
        user_id: &str,
        status: ProfileState,
    ) -> Result<Vec<UserProfile>> {
        Ok(self
            .profiles
            .iter()
            .filter(|p| p.user_id == user_id && p.status == status)
            .map(|p| p.clone())
            .collect())
    }

    async fn set_profile_status(
        &self,
        profile_id: &str,
        status: ProfileState,
        archived_at: Option<Timestamp>,
    ) -> Result<()> {
        if let Some(mut profile) = self.profiles.get_mut(profile_id) {
            profile.status = status;
            if archived_at.is_some() {
                profile.archived_at = archived_at;
            }
            Ok(())
        } else {
            Err(ReflexioError::Store(format!("profile not found: {profile_id}")))
        }
    }

    async fn soft_delete_current_profile(&self, profile_id: &str, user_id: &str) -> Result<bool> {
        if let Some(mut profile) = self.profiles.get_mut(profile_id) {
            if profile.user_id == user_id && profile.status == ProfileState::Current {
                profile.status = ProfileState::Archived;
                profile.archived_at = Some(crate::domain::now_ts());
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn append_profile_change_log(&self, log: ProfileChangeLog) -> Result<()> {
        self.change_logs.lock().push(log);
        Ok(())
    }

    async fn delete_profiles_archived_before(
        &self,
        user_id: &str,
        before: Timestamp,
    ) -> Result<()> {
        self.profiles.retain(|_, p| {
            !(p.user_id == user_id
                && p.status == ProfileState::Archived
                && p.archived_at.map_or(true, |t| t < before))
        });
        Ok(())
    }

    async fn search(&self, query: SearchQuery) -> Result<Vec<UserProfile>> {
        if query.entity != SearchEntity::Profile {
            return Err(ReflexioError::Internal(
                "InMemoryStore::search only implements profile search".into(),
            ));
        }
        let mut scored: Vec<(f32, UserProfile)> = self
            .profiles
            .iter()
            .filter(|p| query.user_id.as_deref().map_or(true, |u| u == p.user_id))
            .map(|p| (Self::cosine_distance(&p.embedding, &query.query_embedding), p.clone()))
            .filter(|(distance, _)| *distance <= query.threshold)
            .collect();
        scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(query.top_k);
        Ok(scored.into_iter().map(|(_, p)| p).collect())
    }

    async fn put_raw_feedback(&self, feedback: RawFeedback) -> Result<()> {
        self.raw_feedbacks.insert(feedback.raw_feedback_id.clone(), feedback);
        Ok(())
    }

    async fn get_raw_feedbacks(
        &self,
        agent_version: &str,
        feedback_name: &str,
        status: FeedbackState,
    ) -> Result<Vec<RawFeedback>> {
        Ok(self
            .raw_feedbacks
            .iter()
            .filter(|f| {
                f.agent_version == agent_version && f.feedback_name == feedback_name && f.status == status
            })
            .map(|f| f.clone())
            .collect())
    }

    async fn set_raw_feedback_status(
        &self,
        raw_feedback_id: &str,
        status: FeedbackState,
        archived_at: Option<Timestamp>,
    ) -> Result<()> {
        if let Some(mut feedback) = self.raw_feedbacks.get_mut(raw_feedback_id) {
            feedback.status = status;
            if archived_at.is_some() {
                feedback.archived_at = archived_at;
            }
            Ok(())
        } else {
            Err(ReflexioError::Store(format!(
                "raw feedback not found: {raw_feedback_id}"
            )))
        }
    }

    async fn delete_raw_feedbacks_archived_before(
        &self,
        agent_version: &str,
        before: Timestamp,
    ) -> Result<()> {
        self.raw_feedbacks.retain(|_, f| {
            !(f.agent_version == agent_version
                && f.status == ProfileState::Archived
                && f.archived_at.map_or(true, |t| t < before))
        });
        Ok(())
    }

    async fn list_profile_user_ids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .profiles
            .iter()
            .map(|p| p.user_id.clone())
            .collect::<std::collections::HashSet<_>>()
            .into_iter()
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn list_feedback_names(&self, agent_version: &str) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .raw_feedbacks
            .iter()
            .filter(|f| f.agent_version == agent_version)
            .map(|f| f.feedback_name.clone())
            .collect::<std::collections::HashSet<_>>()
            .into_iter()
            .collect();
        names.sort();
        Ok(names)
    }

    async fn put_aggregated_feedback(&self, feedback: AggregatedFeedback) -> Result<()> {
        self.aggregated_feedbacks
            .insert(feedback.feedback_id.clone(), feedback);
        Ok(())
    }

    async fn get_aggregated_feedback(&self, feedback_id: &str) -> Result<Option<AggregatedFeedback>> {
        Ok(self.aggregated_feedbacks.get(feedback_id).map(|f| f.clone()))
    }

    async fn get_aggregated_feedbacks(
        &self,
        agent_version: &str,
        feedback_name: &str,
        status: FeedbackState,
    ) -> Result<Vec<AggregatedFeedback>> {
        Ok(self
            .aggregated_feedbacks
            .iter()
            .filter(|f| {
                f.agent_version == agent_version && f.feedback_name == feedback_name && f.status == status
            })
            .map(|f| f.clone())
            .collect())
    }

    async fn archive_by_ids(&self, ids: &[String]) -> Result<()> {
        for id in ids {
            if let Some(mut feedback) = self.aggregated_feedbacks.get_mut(id) {
                feedback.status = ProfileState::Archived;
                feedback.archived_at = Some(crate::domain::now_ts());
            }
        }
        Ok(())
    }

    async fn restore_by_ids(&self, ids: &[String]) -> Result<()> {
        for id in ids {
            if let Some(mut feedback) = self.aggregated_feedbacks.get_mut(id) {
                feedback.status = ProfileState::Current;
                feedback.archived_at = None;
            }
        }
        Ok(())
    }

    async fn delete_by_ids(&self, ids: &[String]) -> Result<()> {
        for id in ids {
            self.aggregated_feedbacks.remove(id);
        }
        Ok(())
    }

    async fn put_evaluation_result(&self, result: EvaluationResult) -> Result<()> {
        self.evaluation_results
            .entry(result.request_id.clone())
            .or_default()
            .push(result);
        Ok(())
    }

    async fn get_evaluation_results(&self, request_id: &str) -> Result<Vec<EvaluationResult>> {
        Ok(self
            .evaluation_results
            .get(request_id)
            .map(|v| v.clone())
            .unwrap_or_default())
    }

    async fn get_operation_state(&self, key: &str) -> Result<Option<OperationKind>> {
        Ok(self.operation_state.lock().get(key).cloned())
    }

    async fn upsert_operation_state_with(
        &self,
        key: &str,
        f: Box<dyn FnOnce(Option<OperationKind>) -> OperationKind + Send>,
    ) -> Result<(Option<OperationKind>, OperationKind)> {
        let mut guard = self.operation_state.lock();
        let prior = guard.get(key).cloned();
        let new_value = f(prior.clone());
        guard.insert(key.to_string(), new_value.clone());
        Ok((prior, new_value))
    }

    async fn delete_operation_state(&self, key: &str) -> Result<()> {
        self.operation_state.lock().remove(key);
        Ok(())
    }
}

// Allow `store/mod.rs`'s `Arc<dyn Store>` pattern used by services/orchestrator.
pub type SharedStore = Arc<dyn Store>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::operation::LockRecord;

    #[tokio::test]
    async fn lock_upsert_is_atomic_and_returns_prior() {
        let store = InMemoryStore::new();
        let (prior, new) = store
            .upsert_operation_state_with(
                "profile::org1::u1::lock",
                Box::new(|prior| {
                    assert!(prior.is_none());
                    OperationKind::Lock(LockRecord {
                        holder_request_id: "r1".into(),
                        acquired_at: 100,
                        pending_request_id: None,
                    })
                }),
            )
            .await
            .unwrap();
        assert!(prior.is_none());
        assert!(matches!(new, OperationKind::Lock(_)));

        let (prior2, _) = store
            .upsert_operation_state_with(
                "profile::org1::u1::lock",
                Box::new(|prior| match prior {
                    Some(OperationKind::Lock(mut lock)) => {
                        lock.pending_request_id = Some("r2".into());
                        OperationKind::Lock(lock)
                    }
                    _ => unreachable!(),
                }),
            )
            .await
            .unwrap();
        assert!(matches!(prior2, Some(OperationKind::Lock(lock)) if lock.holder_request_id == "r1"));
    }

    #[tokio::test]
    async fn soft_delete_only_archives_current_and_owned() {
        let store = InMemoryStore::new();
        let profile = UserProfile {
            profile_id: "p1".into(),
            user_id: "u1".into(),
            profile_content: "likes rust".into(),
            generated_from_request_id: "r1".into(),
            last_modified_timestamp: 1,
            expiration_timestamp: None,
            source: "chat".into(),
            status: ProfileState::Current,
            embedding: vec![],
            custom_features: Default::default(),
            archived_at: None,
        };
        store.put_profile(profile).await.unwrap();

        assert!(!store.soft_delete_current_profile("p1", "someone-else").await.unwrap());
        assert!(store.soft_delete_current_profile("p1", "u1").await.unwrap());
        let loaded = store.get_profile("p1").await.unwrap().unwrap();
        assert_eq!(loaded.status, ProfileState::Archived);
        assert!(loaded.archived_at.is_some());
    }
}
