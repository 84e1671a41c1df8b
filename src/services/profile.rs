//! The profile generation service (spec §4.3): extractor invocation,
//! cross-extractor deduplication, and the Updater that applies the add/
//! delete/mention diff to the store within the per-user lifecycle
//! invariants.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;
use uuid::Uuid;

use crate::domain::profile::{ProfileChangeLog, TtlKind};
use crate::domain::{now_ts, Interaction, ProfileState, UserProfile};
use crate::error::Result;
use crate::extractor::{Extractor, ExtractorConfig, GenerationServiceConfig};
use crate::llm::{generate, LlmClient, Message, PromptManager, StructuredOutput};
use crate::operation_state::OperationStateManager;
use crate::store::Store;

use super::{run_extractors, ExtractorRunOutcome, DEFAULT_EXTRACTOR_CONCURRENCY};

pub const SERVICE_NAME: &str = "profile";

/// One candidate profile item, shared shape for adds and mentions (spec
/// §4.3: "Each added/mentioned item has `{content, metadata, ttl_kind}`").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileItem {
    pub content: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub ttl_kind: TtlKind,
}

/// The three ordered lists an extractor returns for one window (spec §4.3).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProfileExtractionOutput {
    pub profiles_to_add: Vec<ProfileItem>,
    /// Referenced by existing `profile_id`.
    pub profiles_to_delete: Vec<String>,
    pub profiles_to_mention: Vec<ProfileItem>,
}

impl StructuredOutput for ProfileExtractionOutput {
    fn schema_name() -> &'static str {
        "profile_extraction_output"
    }
}

/// Pairwise semantic-match verdict used by the deduplicator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileDedupVerdict {
    pub is_match: bool,
}

impl StructuredOutput for ProfileDedupVerdict {
    fn schema_name() -> &'static str {
        "profile_dedup_verdict"
    }
}

/// An LLM-backed extractor: renders the `profile_extraction` prompt over a
/// window and decodes a `ProfileExtractionOutput`.
pub struct LlmProfileExtractor {
    name: String,
    model: String,
    llm: Arc<dyn LlmClient>,
    prompts: Arc<PromptManager>,
}

impl LlmProfileExtractor {
    pub fn new(name: impl Into<String>, model: impl Into<String>, llm: Arc<dyn LlmClient>, prompts: Arc<PromptManager>) -> Self {
        Self { name: name.into(), model: model.into(), llm, prompts }
    }
}

#[async_trait]
impl Extractor for LlmProfileExtractor {
    type Output = ProfileExtractionOutput;

    fn name(&self) -> &str {
        &self.name
    }

    async fn extract(&self, window: &[Interaction]) -> Result<Self::Output> {
        let transcript = render_window(window);
        let mut vars = HashMap::new();
        vars.insert("user_id", window.first().map(|i| i.user_id.clone()).unwrap_or_default());
        vars.insert("window", transcript);
        let prompt = self
            .prompts
            .render("profile_extraction", &vars)
            .unwrap_or_else(|| "Extract profile updates.".to_string());
        generate(
            self.llm.as_ref(),
            &self.model,
            vec![Message::system("You extract durable user profile facts."), Message::user(prompt)],
        )
        .await
    }
}

fn render_window(window: &[Interaction]) -> String {
    window
        .iter()
        .map(|i| format!("[{:?}] {}", i.role, i.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Normalization rule used for the profile-uniqueness invariant: delegates
/// to `UserProfile::normalized_content` so the same rule governs both a
/// stored row and a freshly-extracted candidate.
fn normalize(content: &str) -> String {
    content.trim().to_lowercase()
}

/// Merges candidate adds across extractors via pairwise LLM semantic
/// match, keeping the longer/more-specific content and unioning metadata
/// (spec §4.3 Deduplicator). A no-op when only one extractor ran.
pub struct ProfileDeduplicator {
    llm: Arc<dyn LlmClient>,
    prompts: Arc<PromptManager>,
    model: String,
}

impl ProfileDeduplicator {
    pub fn new(llm: Arc<dyn LlmClient>, prompts: Arc<PromptManager>, model: String) -> Self {
        Self { llm, prompts, model }
    }

    #[instrument(skip(self, candidates))]
    pub async fn dedup(&self, candidates: Vec<ProfileItem>) -> Result<Vec<ProfileItem>> {
        let mut merged: Vec<ProfileItem> = Vec::new();
        'candidate: for candidate in candidates {
            for existing in merged.iter_mut() {
                if self.is_match(existing, &candidate).await? {
                    if candidate.content.len() > existing.content.len() {
                        existing.content = candidate.content;
                    }
                    for (k, v) in candidate.metadata {
                        existing.metadata.entry(k).or_insert(v);
                    }
                    continue 'candidate;
                }
            }
            merged.push(candidate);
        }
        Ok(merged)
    }

    async fn is_match(&self, a: &ProfileItem, b: &ProfileItem) -> Result<bool> {
        if normalize(&a.content) == normalize(&b.content) {
            return Ok(true);
        }
        let mut vars = HashMap::new();
        vars.insert("a", a.content.clone());
        vars.insert("b", b.content.clone());
        let prompt = self.prompts.render("profile_dedup", &vars).unwrap_or_default();
        let verdict: ProfileDedupVerdict = generate(
            self.llm.as_ref(),
            &self.model,
            vec![Message::system("You judge whether two facts are the same."), Message::user(prompt)],
        )
        .await?;
        Ok(verdict.is_match)
    }
}

/// Result of one profile-service run, surfaced to callers and tests (spec
/// §8 scenario 1/2 assertions).
#[derive(Debug, Default)]
pub struct ProfileServiceReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub mentioned: usize,
    pub extractor_failures: Vec<(String, String)>,
}

/// The profile generation service (spec §4.3): orchestrates extractor
/// invocation, deduplication, and the Updater's transactional diff apply.
pub struct ProfileService {
    store: Arc<dyn Store>,
    operation_state: OperationStateManager,
    llm: Arc<dyn LlmClient>,
    prompts: Arc<PromptManager>,
    model: String,
    extractor_concurrency: usize,
}

impl ProfileService {
    pub fn new(
        store: Arc<dyn Store>,
        operation_state: OperationStateManager,
        llm: Arc<dyn LlmClient>,
        prompts: Arc<PromptManager>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            store,
            operation_state,
            llm,
            prompts,
            model: model.into(),
            extractor_concurrency: DEFAULT_EXTRACTOR_CONCURRENCY,
        }
    }

    pub fn with_extractor_concurrency(mut self, n: usize) -> Self {
        self.extractor_concurrency = n;
        self
    }

    #[instrument(skip(self, extractor_configs))]
    pub async fn run(
        &self,
        service_config: &GenerationServiceConfig,
        extractor_configs: &[ExtractorConfig],
    ) -> Result<ProfileServiceReport> {
        let mut implementations: HashMap<String, Arc<dyn Extractor<Output = ProfileExtractionOutput>>> =
            HashMap::new();
        for config in extractor_configs {
            implementations.insert(
                config.name.clone(),
                Arc::new(LlmProfileExtractor::new(config.name.clone(), self.model.clone(), self.llm.clone(), self.prompts.clone())),
            );
        }

        let runs = run_extractors(
            SERVICE_NAME,
            Some(&service_config.user_id),
            extractor_configs,
            &implementations,
            service_config,
            &self.store,
            &self.operation_state,
            self.extractor_concurrency,
        )
        .await;

        let mut report = ProfileServiceReport::default();
        let mut adds: Vec<ProfileItem> = Vec::new();
        let mut mentions: Vec<ProfileItem> = Vec::new();
        let mut deletes: Vec<String> = Vec::new();
        let mut succeeded = Vec::new();

        for run in runs {
            match run.outcome {
                ExtractorRunOutcome::Produced { output, window } => {
                    adds.extend(output.profiles_to_add);
                    mentions.extend(output.profiles_to_mention);
                    deletes.extend(output.profiles_to_delete);
                    if let Some(last) = window.last() {
                        succeeded.push((run.extractor_name, last.interaction_id.clone(), last.created_at));
                    }
                }
                ExtractorRunOutcome::Failed(e) => report.extractor_failures.push((run.extractor_name, e)),
                ExtractorRunOutcome::TimedOut => {
                    report.extractor_failures.push((run.extractor_name, "timed out".to_string()))
                }
                ExtractorRunOutcome::SkippedFilter | ExtractorRunOutcome::SkippedStride => {}
            }
        }

        let extractor_count = extractor_configs.len();
        let adds = if extractor_count > 1 && !adds.is_empty() {
            let dedup = ProfileDeduplicator::new(self.llm.clone(), self.prompts.clone(), self.model.clone());
            dedup.dedup(adds).await?
        } else {
            adds
        };

        self.apply_diff(service_config, adds, deletes, mentions, &mut report).await?;

        for (extractor_name, last_id, last_ts) in succeeded {
            self.operation_state
                .advance_bookmark(
                    SERVICE_NAME,
                    &service_config.org_id,
                    Some(&service_config.user_id),
                    &extractor_name,
                    &last_id,
                    last_ts,
                )
                .await?;
        }

        Ok(report)
    }

    /// Applies the add/delete/mention diff within the Updater's invariants
    /// (spec §4.3): no add exactly equal (after normalization) to a CURRENT
    /// profile; deletes only apply to CURRENT profiles owned by the user;
    /// `last_modified_timestamp` is the driving request's `created_at`.
    async fn apply_diff(
        &self,
        service_config: &GenerationServiceConfig,
        adds: Vec<ProfileItem>,
        deletes: Vec<String>,
        mentions: Vec<ProfileItem>,
        report: &mut ProfileServiceReport,
    ) -> Result<()> {
        let now = now_ts();
        let status = service_config.mode.output_status();
        let current = self
            .store
            .get_profiles_by_status(&service_config.user_id, ProfileState::Current)
            .await?;
        let current_normalized: std::collections::HashSet<String> =
            current.iter().map(|p| p.normalized_content()).collect();

        for item in adds {
            if current_normalized.contains(&normalize(&item.content)) {
                continue;
            }
            let embedding = self.llm.embed(&item.content).await.unwrap_or_default();
            let profile = UserProfile {
                profile_id: Uuid::new_v4().to_string(),
                user_id: service_config.user_id.clone(),
                profile_content: item.content.clone(),
                generated_from_request_id: service_config.request_id.clone(),
                last_modified_timestamp: service_config.request_created_at,
                expiration_timestamp: item.ttl_kind.expires_at(now),
                source: service_config.source.clone(),
                status,
                embedding,
                custom_features: item.metadata,
                archived_at: None,
            };
            report.added.push(profile.profile_id.clone());
            self.store.put_profile(profile).await?;
        }

        for profile_id in deletes {
            if self
                .store
                .soft_delete_current_profile(&profile_id, &service_config.user_id)
                .await?
            {
                report.removed.push(profile_id);
            }
        }

        report.mentioned = mentions.len();

        self.store
            .append_profile_change_log(ProfileChangeLog {
                added: report.added.clone(),
                removed: report.removed.clone(),
                mentioned: mentions.iter().map(|m| m.content.clone()).collect(),
                user_id: service_config.user_id.clone(),
                request_id: service_config.request_id.clone(),
                created_at: now,
            })
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::GenerationMode;
    use crate::llm::MockLlmClient;
    use crate::store::InMemoryStore;

    fn service_config(mode: GenerationMode) -> GenerationServiceConfig {
        GenerationServiceConfig {
            org_id: "org1".into(),
            user_id: "u1".into(),
            source: "chat".into(),
            agent_version: "v1".into(),
            request_id: "r1".into(),
            request_created_at: 42,
            start_time: None,
            end_time: None,
            extractor_names: None,
            allow_manual_trigger: false,
            mode,
            global_window_size: 10,
            global_stride: 2,
        }
    }

    fn interaction(id: &str, ts: i64) -> Interaction {
        Interaction {
            interaction_id: id.into(),
            user_id: "u1".into(),
            request_id: "r1".into(),
            created_at: ts,
            role: crate::domain::Role::User,
            content: "hi".into(),
            shadow_content: None,
            tools_used: vec![],
            image: None,
            embedding: vec![],
        }
    }

    #[tokio::test]
    async fn window_triggers_profile_add_and_advances_bookmark() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let operation_state = OperationStateManager::new(store.clone());
        let llm = Arc::new(MockLlmClient::new());
        llm.push_response(
            "profile_extraction_output",
            serde_json::json!({
                "profiles_to_add": [{"content": "likes rust", "metadata": {}, "ttl_kind": "INFINITY"}],
                "profiles_to_delete": [],
                "profiles_to_mention": []
            }),
        );
        store
            .put_interactions(vec![interaction("i1", 1), interaction("i2", 2), interaction("i3", 3)])
            .await
            .unwrap();

        let service = ProfileService::new(store.clone(), operation_state.clone(), llm.clone(), Arc::new(PromptManager::with_defaults()), "gpt-test");
        let extractor = ExtractorConfig {
            name: "extractor1".into(),
            request_sources_enabled: None,
            allow_manual_trigger: false,
            window_size: Some(3),
            stride: Some(2),
        };
        let report = service.run(&service_config(GenerationMode::Regular), &[extractor]).await.unwrap();
        assert_eq!(report.added.len(), 1);

        let bookmark = operation_state
            .get_bookmark("profile", "org1", Some("u1"), "extractor1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bookmark.last_processed_interaction_id, "i3");
    }

    #[tokio::test]
    async fn stride_skip_leaves_bookmark_unchanged() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let operation_state = OperationStateManager::new(store.clone());
        let llm = Arc::new(MockLlmClient::new());
        store
            .put_interactions(vec![interaction("i1", 1), interaction("i2", 2), interaction("i3", 3)])
            .await
            .unwrap();
        operation_state
            .advance_bookmark("profile", "org1", Some("u1"), "extractor1", "i3", 3)
            .await
            .unwrap();
        store.put_interactions(vec![interaction("i4", 4)]).await.unwrap();

        let service = ProfileService::new(store.clone(), operation_state.clone(), llm, Arc::new(PromptManager::with_defaults()), "gpt-test");
        let extractor = ExtractorConfig {
            name: "extractor1".into(),
            request_sources_enabled: None,
            allow_manual_trigger: false,
            window_size: Some(3),
            stride: Some(2),
        };
        let report = service.run(&service_config(GenerationMode::Regular), &[extractor]).await.unwrap();
        assert!(report.added.is_empty());
        let bookmark = operation_state
            .get_bookmark("profile", "org1", Some("u1"), "extractor1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bookmark.last_processed_interaction_id, "i3");
    }

    #[tokio::test]
    async fn add_exactly_equal_to_current_profile_is_rejected() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        store
            .put_profile(UserProfile {
                profile_id: "p0".into(),
                user_id: "u1".into(),
                profile_content: "Likes Rust".into(),
                generated_from_request_id: "r0".into(),
                last_modified_timestamp: 0,
                expiration_timestamp: None,
                source: "chat".into(),
                status: ProfileState::Current,
                embedding: vec![],
                custom_features: Default::default(),
                archived_at: None,
            })
            .await
            .unwrap();
        let operation_state = OperationStateManager::new(store.clone());
        let llm = Arc::new(MockLlmClient::new());
        llm.push_response(
            "profile_extraction_output",
            serde_json::json!({
                "profiles_to_add": [{"content": "likes rust", "metadata": {}, "ttl_kind": "INFINITY"}],
                "profiles_to_delete": [],
                "profiles_to_mention": []
            }),
        );
        store.put_interactions(vec![interaction("i1", 1), interaction("i2", 2)]).await.unwrap();

        let service = ProfileService::new(store.clone(), operation_state, llm, Arc::new(PromptManager::with_defaults()), "gpt-test");
        let extractor = ExtractorConfig {
            name: "extractor1".into(),
            request_sources_enabled: None,
            allow_manual_trigger: false,
            window_size: Some(2),
            stride: Some(1),
        };
        let report = service.run(&service_config(GenerationMode::Regular), &[extractor]).await.unwrap();
        assert!(report.added.is_empty());
    }
}
