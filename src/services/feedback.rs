//! The feedback generation service (spec §4.4, extraction half):
//! structured `{do_action, do_not_action, when_condition, blocking_issue?}`
//! extraction, cross-extractor deduplication by `feedback_name`, and
//! persistence of `RawFeedback` rows. Cluster aggregation into
//! `AggregatedFeedback` lives in `services::aggregator`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use crate::domain::feedback::FeedbackState;
use crate::domain::{now_ts, BlockingIssue, Interaction, RawFeedback};
use crate::error::Result;
use crate::extractor::{Extractor, ExtractorConfig, GenerationServiceConfig};
use crate::llm::{generate, LlmClient, Message, PromptManager, StructuredOutput};
use crate::operation_state::OperationStateManager;
use crate::store::Store;

use super::{run_extractors, ExtractorRunOutcome, DEFAULT_EXTRACTOR_CONCURRENCY};

pub const SERVICE_NAME: &str = "feedback";

/// One extractor's structured output for a window (spec §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackExtractionOutput {
    pub feedback_name: String,
    pub feedback_content: String,
    pub do_action: String,
    pub do_not_action: String,
    pub when_condition: String,
    pub blocking_issue: Option<BlockingIssue>,
}

impl StructuredOutput for FeedbackExtractionOutput {
    fn schema_name() -> &'static str {
        "feedback_extraction_output"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackDedupVerdict {
    pub is_match: bool,
}

impl StructuredOutput for FeedbackDedupVerdict {
    fn schema_name() -> &'static str {
        "feedback_dedup_verdict"
    }
}

pub struct LlmFeedbackExtractor {
    name: String,
    model: String,
    llm: Arc<dyn LlmClient>,
    prompts: Arc<PromptManager>,
}

impl LlmFeedbackExtractor {
    pub fn new(name: impl Into<String>, model: impl Into<String>, llm: Arc<dyn LlmClient>, prompts: Arc<PromptManager>) -> Self {
        Self { name: name.into(), model: model.into(), llm, prompts }
    }
}

#[async_trait]
impl Extractor for LlmFeedbackExtractor {
    type Output = FeedbackExtractionOutput;

    fn name(&self) -> &str {
        &self.name
    }

    async fn extract(&self, window: &[Interaction]) -> Result<Self::Output> {
        let transcript = window
            .iter()
            .map(|i| format!("[{:?}] {}", i.role, i.content))
            .collect::<Vec<_>>()
            .join("\n");
        let mut vars = HashMap::new();
        vars.insert("window", transcript);
        let prompt = self
            .prompts
            .render("feedback_extraction", &vars)
            .unwrap_or_else(|| "Extract developer feedback.".to_string());
        generate(
            self.llm.as_ref(),
            &self.model,
            vec![Message::system("You extract structured developer-facing feedback."), Message::user(prompt)],
        )
        .await
    }
}

/// Dedups overlapping feedback across extractors that produced the same
/// `feedback_name`, mirroring `ProfileDeduplicator`'s merge policy (spec
/// §4.4).
pub struct FeedbackDeduplicator {
    llm: Arc<dyn LlmClient>,
    prompts: Arc<PromptManager>,
    model: String,
}

impl FeedbackDeduplicator {
    pub fn new(llm: Arc<dyn LlmClient>, prompts: Arc<PromptManager>, model: String) -> Self {
        Self { llm, prompts, model }
    }

    #[instrument(skip(self, candidates))]
    pub async fn dedup(&self, candidates: Vec<FeedbackExtractionOutput>) -> Result<Vec<FeedbackExtractionOutput>> {
        let mut by_name: HashMap<String, Vec<FeedbackExtractionOutput>> = HashMap::new();
        for candidate in candidates {
            by_name.entry(candidate.feedback_name.clone()).or_default().push(candidate);
        }

        let mut merged = Vec::new();
        for (_, group) in by_name {
            merged.extend(self.dedup_group(group).await?);
        }
        Ok(merged)
    }

    async fn dedup_group(&self, group: Vec<FeedbackExtractionOutput>) -> Result<Vec<FeedbackExtractionOutput>> {
        let mut result: Vec<FeedbackExtractionOutput> = Vec::new();
        'candidate: for candidate in group {
            for existing in result.iter_mut() {
                if self.is_match(existing, &candidate).await? {
                    if candidate.feedback_content.len() > existing.feedback_content.len() {
                        *existing = candidate;
                    }
                    continue 'candidate;
                }
            }
            result.push(candidate);
        }
        Ok(result)
    }

    async fn is_match(&self, a: &FeedbackExtractionOutput, b: &FeedbackExtractionOutput) -> Result<bool> {
        let mut vars = HashMap::new();
        vars.insert("a", a.feedback_content.clone());
        vars.insert("b", b.feedback_content.clone());
        let prompt = self.prompts.render("profile_dedup", &vars).unwrap_or_default();
        let verdict: FeedbackDedupVerdict = generate(
            self.llm.as_ref(),
            &self.model,
            vec![Message::system("You judge whether two feedback items describe the same thing."), Message::user(prompt)],
        )
        .await?;
        Ok(verdict.is_match)
    }
}

#[derive(Debug, Default)]
pub struct FeedbackServiceReport {
    pub raw_feedback_ids: Vec<String>,
    pub extractor_failures: Vec<(String, String)>,
}

/// The feedback generation service (spec §4.4): extraction, dedup, and raw
/// feedback persistence. Locks per org, not per user (spec §4.1).
pub struct FeedbackService {
    store: Arc<dyn Store>,
    operation_state: OperationStateManager,
    llm: Arc<dyn LlmClient>,
    prompts: Arc<PromptManager>,
    model: String,
    extractor_concurrency: usize,
}

impl FeedbackService {
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
    ) -> Result<FeedbackServiceReport> {
        let mut implementations: HashMap<String, Arc<dyn Extractor<Output = FeedbackExtractionOutput>>> =
            HashMap::new();
        for config in extractor_configs {
            implementations.insert(
                config.name.clone(),
                Arc::new(LlmFeedbackExtractor::new(config.name.clone(), self.model.clone(), self.llm.clone(), self.prompts.clone())),
            );
        }

        // Feedback locks are per-org (spec §4.1), so the bookmark scope is
        // `None` rather than per-user.
        let runs = run_extractors(
            SERVICE_NAME,
            None,
            extractor_configs,
            &implementations,
            service_config,
            &self.store,
            &self.operation_state,
            self.extractor_concurrency,
        )
        .await;

        let mut report = FeedbackServiceReport::default();
        let mut candidates = Vec::new();
        let mut succeeded = Vec::new();

        for run in runs {
            match run.outcome {
                ExtractorRunOutcome::Produced { output, window } => {
                    candidates.push(output);
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
        let candidates = if extractor_count > 1 && candidates.len() > 1 {
            let dedup = FeedbackDeduplicator::new(self.llm.clone(), self.prompts.clone(), self.model.clone());
            dedup.dedup(candidates).await?
        } else {
            candidates
        };

        let now = now_ts();
        let status = service_config.mode.output_status();
        for candidate in candidates {
            let indexed_content = RawFeedback::derive_indexed_content(
                &candidate.when_condition,
                &candidate.do_action,
                &candidate.do_not_action,
            );
            let embedding = self.llm.embed(&indexed_content).await.unwrap_or_default();
            let raw_feedback = RawFeedback {
                raw_feedback_id: Uuid::new_v4().to_string(),
                agent_version: service_config.agent_version.clone(),
                request_id: service_config.request_id.clone(),
                feedback_name: candidate.feedback_name,
                created_at: now,
                feedback_content: candidate.feedback_content,
                do_action: candidate.do_action,
                do_not_action: candidate.do_not_action,
                when_condition: candidate.when_condition,
                blocking_issue: candidate.blocking_issue,
                indexed_content,
                status,
                embedding,
                archived_at: None,
            };
            report.raw_feedback_ids.push(raw_feedback.raw_feedback_id.clone());
            self.store.put_raw_feedback(raw_feedback).await?;
        }

        for (extractor_name, last_id, last_ts) in succeeded {
            self.operation_state
                .advance_bookmark(SERVICE_NAME, &service_config.org_id, None, &extractor_name, &last_id, last_ts)
                .await?;
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BlockingIssueKind;
    use crate::extractor::GenerationMode;
    use crate::llm::MockLlmClient;
    use crate::store::InMemoryStore;

    fn service_config() -> GenerationServiceConfig {
        GenerationServiceConfig {
            org_id: "org1".into(),
            user_id: "u1".into(),
            source: "chat".into(),
            agent_version: "v1".into(),
            request_id: "r1".into(),
            request_created_at: 1,
            start_time: None,
            end_time: None,
            extractor_names: None,
            allow_manual_trigger: false,
            mode: GenerationMode::Regular,
            global_window_size: 10,
            global_stride: 1,
        }
    }

    fn interaction(id: &str, ts: i64) -> Interaction {
        Interaction {
            interaction_id: id.into(),
            user_id: "u1".into(),
            request_id: "r1".into(),
            created_at: ts,
            role: crate::domain::Role::Agent,
            content: "let me help".into(),
            shadow_content: None,
            tools_used: vec![],
            image: None,
            embedding: vec![],
        }
    }

    #[tokio::test]
    async fn indexed_content_is_derived_from_structured_fields() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let operation_state = OperationStateManager::new(store.clone());
        let llm = Arc::new(MockLlmClient::new());
        llm.push_response(
            "feedback_extraction_output",
            serde_json::json!({
                "feedback_name": "fn_tone",
                "feedback_content": "agent was too formal",
                "do_action": "use a casual tone",
                "do_not_action": "use corporate jargon",
                "when_condition": "when the user is a first-time visitor",
                "blocking_issue": null
            }),
        );
        store.put_interactions(vec![interaction("i1", 1)]).await.unwrap();

        let service = FeedbackService::new(store.clone(), operation_state, llm, Arc::new(PromptManager::with_defaults()), "gpt-test");
        let extractor = ExtractorConfig {
            name: "e1".into(),
            request_sources_enabled: None,
            allow_manual_trigger: false,
            window_size: Some(1),
            stride: Some(1),
        };
        let report = service.run(&service_config(), &[extractor]).await.unwrap();
        assert_eq!(report.raw_feedback_ids.len(), 1);

        let stored = store
            .get_raw_feedbacks("v1", "fn_tone", FeedbackState::Current)
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(
            stored[0].indexed_content,
            "when the user is a first-time visitor use a casual tone use corporate jargon"
        );
    }

    #[tokio::test]
    async fn blocking_issue_round_trips() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let operation_state = OperationStateManager::new(store.clone());
        let llm = Arc::new(MockLlmClient::new());
        llm.push_response(
            "feedback_extraction_output",
            serde_json::json!({
                "feedback_name": "fn_capability",
                "feedback_content": "agent could not book the flight",
                "do_action": "ask the user to book manually",
                "do_not_action": "claim the booking succeeded",
                "when_condition": "when no booking tool is configured",
                "blocking_issue": {"kind": "MISSING_TOOL", "details": "no flight booking tool registered"}
            }),
        );
        store.put_interactions(vec![interaction("i1", 1)]).await.unwrap();

        let service = FeedbackService::new(store.clone(), operation_state, llm, Arc::new(PromptManager::with_defaults()), "gpt-test");
        let extractor = ExtractorConfig {
            name: "e1".into(),
            request_sources_enabled: None,
            allow_manual_trigger: false,
            window_size: Some(1),
            stride: Some(1),
        };
        service.run(&service_config(), &[extractor]).await.unwrap();
        let stored = store
            .get_raw_feedbacks("v1", "fn_capability", FeedbackState::Current)
            .await
            .unwrap();
        let issue = stored[0].blocking_issue.as_ref().unwrap();
        assert_eq!(issue.kind, BlockingIssueKind::MissingTool);
    }
}
