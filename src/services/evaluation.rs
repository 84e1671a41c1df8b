//! The evaluation service (spec §4.5): shadow-content A/B comparison,
//! success judgment, and deterministic sampling. Unlike profile/feedback,
//! evaluation runs once per request rather than over a sliding window, so it
//! does not use the `Extractor`/bookmark machinery in `crate::extractor`.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::instrument;
use uuid::Uuid;

use crate::domain::{now_ts, Comparison, EvaluationResult, Interaction};
use crate::error::Result;
use crate::llm::{generate, LlmClient, Message, PromptManager, StructuredOutput};
use crate::store::Store;

/// Static per-org, per-`evaluation_name` configuration (spec §4.5 Inputs:
/// `AgentSuccessConfig`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    pub evaluation_name: String,
    pub success_definition: String,
    pub tool_set: Vec<String>,
    pub action_space: Vec<String>,
    /// `[0,1]`, default 1.0 (spec §4.5 Sampling).
    pub sampling_rate: f64,
    pub model: String,
}

/// Structured judgment for the success-only path (no shadow content).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessOnlyVerdict {
    pub is_success: bool,
    pub failure_type: Option<String>,
    pub failure_reason: Option<String>,
    pub agent_prompt_update: Option<String>,
}

impl StructuredOutput for SuccessOnlyVerdict {
    fn schema_name() -> &'static str {
        "success_only_verdict"
    }
}

/// Raw LLM judgment for the shadow-comparison path, expressed in
/// anonymized A/B terms (spec §4.5 step 1) so the model's verdict can't be
/// skewed by knowing in advance which transcript is "regular". The caller
/// maps this back to `regular_vs_shadow` using the position assignment it
/// made before prompting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowComparisonVerdict {
    pub is_success_a: bool,
    pub is_success_b: bool,
    pub failure_type: Option<String>,
    pub failure_reason: Option<String>,
    pub agent_prompt_update: Option<String>,
    pub comparison: AbComparison,
}

/// `ShadowComparisonVerdict` translated back from anonymized A/B terms into
/// the regular/shadow terms `EvaluationResult` stores.
struct ResolvedShadowVerdict {
    is_success_regular: bool,
    failure_type: Option<String>,
    failure_reason: Option<String>,
    agent_prompt_update: Option<String>,
    comparison: Comparison,
}

fn regular_vs_shadow(comparison: AbComparison, regular_is_a: bool) -> Comparison {
    use AbComparison::*;
    match (comparison, regular_is_a) {
        (AIsBetter, true) | (BIsBetter, false) => Comparison::RegularIsBetter,
        (AIsSlightlyBetter, true) | (BIsSlightlyBetter, false) => Comparison::RegularIsSlightlyBetter,
        (BIsBetter, true) | (AIsBetter, false) => Comparison::ShadowIsBetter,
        (BIsSlightlyBetter, true) | (AIsSlightlyBetter, false) => Comparison::ShadowIsSlightlyBetter,
        (Tied, _) => Comparison::Tied,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AbComparison {
    AIsBetter,
    AIsSlightlyBetter,
    BIsBetter,
    BIsSlightlyBetter,
    Tied,
}

impl StructuredOutput for ShadowComparisonVerdict {
    fn schema_name() -> &'static str {
        "shadow_comparison_verdict"
    }
}

/// Deterministic sampling function (spec §4.5 invariant 9, SPEC_FULL.md
/// §4.5 supplement): SHA-256 of `request_id`, low 53 bits as an integer
/// divided by 2^53, compared against `sampling_rate`. Stable across
/// processes and restarts.
pub fn is_sampled(request_id: &str, sampling_rate: f64) -> bool {
    if sampling_rate >= 1.0 {
        return true;
    }
    if sampling_rate <= 0.0 {
        return false;
    }
    let digest = Sha256::digest(request_id.as_bytes());
    let mut low53: u64 = 0;
    for byte in &digest[digest.len() - 7..] {
        low53 = (low53 << 8) | *byte as u64;
    }
    low53 &= (1u64 << 53) - 1;
    let fraction = low53 as f64 / (1u64 << 53) as f64;
    fraction < sampling_rate
}

#[derive(Debug, Default)]
pub struct EvaluationServiceReport {
    pub result_ids: Vec<String>,
    pub skipped_by_sampling: Vec<String>,
    pub failures: Vec<(String, String)>,
}

/// The evaluation service (spec §4.5). Locks per org, same as feedback
/// (spec §4.1), but does not touch bookmarks: every request is judged at
/// most once per `evaluation_name`, independent of stride/windowing.
pub struct EvaluationService {
    store: Arc<dyn Store>,
    llm: Arc<dyn LlmClient>,
    prompts: Arc<PromptManager>,
}

impl EvaluationService {
    pub fn new(store: Arc<dyn Store>, llm: Arc<dyn LlmClient>, prompts: Arc<PromptManager>) -> Self {
        Self { store, llm, prompts }
    }

    #[instrument(skip(self, interactions, configs))]
    pub async fn run(
        &self,
        request_id: &str,
        agent_version: &str,
        interactions: &[Interaction],
        configs: &[EvaluationConfig],
    ) -> Result<EvaluationServiceReport> {
        let mut report = EvaluationServiceReport::default();

        for config in configs {
            if !is_sampled(request_id, config.sampling_rate) {
                report.skipped_by_sampling.push(config.evaluation_name.clone());
                continue;
            }

            match self.evaluate_one(request_id, agent_version, interactions, config).await {
                Ok(result_id) => report.result_ids.push(result_id),
                Err(e) => report.failures.push((config.evaluation_name.clone(), e.to_string())),
            }
        }

        Ok(report)
    }

    async fn evaluate_one(
        &self,
        request_id: &str,
        agent_version: &str,
        interactions: &[Interaction],
        config: &EvaluationConfig,
    ) -> Result<String> {
        let shadow_turns: Vec<&Interaction> = interactions.iter().filter(|i| i.is_shadow_candidate()).collect();

        let (is_success, failure_type, failure_reason, agent_prompt_update, comparison, indexed_content) =
            if shadow_turns.is_empty() {
                let verdict = self.run_success_only(interactions, config).await?;
                let indexed = format!(
                    "{} success={} {}",
                    config.evaluation_name,
                    verdict.is_success,
                    verdict.failure_reason.clone().unwrap_or_default()
                );
                (
                    verdict.is_success,
                    verdict.failure_type,
                    verdict.failure_reason,
                    verdict.agent_prompt_update,
                    None,
                    indexed,
                )
            } else {
                let verdict = self.run_shadow_comparison(interactions, &shadow_turns, config).await?;
                let indexed = format!(
                    "{} success={} comparison={:?} {}",
                    config.evaluation_name,
                    verdict.is_success_regular,
                    verdict.comparison,
                    verdict.failure_reason.clone().unwrap_or_default()
                );
                (
                    verdict.is_success_regular,
                    verdict.failure_type,
                    verdict.failure_reason,
                    verdict.agent_prompt_update,
                    Some(verdict.comparison),
                    indexed,
                )
            };

        let embedding = self.llm.embed(&indexed_content).await.unwrap_or_default();
        let result = EvaluationResult {
            result_id: Uuid::new_v4().to_string(),
            request_id: request_id.to_string(),
            agent_version: agent_version.to_string(),
            evaluation_name: config.evaluation_name.clone(),
            is_success,
            failure_type,
            failure_reason,
            agent_prompt_update,
            regular_vs_shadow: comparison,
            created_at: now_ts(),
            embedding,
        };
        let result_id = result.result_id.clone();
        self.store.put_evaluation_result(result).await?;
        Ok(result_id)
    }

    async fn run_success_only(&self, interactions: &[Interaction], config: &EvaluationConfig) -> Result<SuccessOnlyVerdict> {
        let request = format!("{}\n\nTranscript:\n{}", self.success_definition_block(config), self.transcript(interactions));
        let mut vars = HashMap::new();
        vars.insert("request", request);
        let prompt = self.prompts.render("evaluation_success_only", &vars).unwrap_or_default();
        generate(self.llm.as_ref(), &config.model, vec![Message::system("You judge whether an agent succeeded at the user's request."), Message::user(prompt)]).await
    }

    async fn run_shadow_comparison(
        &self,
        interactions: &[Interaction],
        shadow_turns: &[&Interaction],
        config: &EvaluationConfig,
    ) -> Result<ResolvedShadowVerdict> {
        // Uniform random A/B position assignment to avoid position bias
        // (spec §4.5 step 1).
        let regular_is_a = rand::thread_rng().gen_bool(0.5);
        let shadow_text = shadow_turns.iter().filter_map(|i| i.shadow_content.as_deref()).collect::<Vec<_>>().join("\n");
        let regular_text = self.transcript(interactions);
        let (request_a, request_b) = if regular_is_a { (regular_text, shadow_text) } else { (shadow_text, regular_text) };

        let request = self.success_definition_block(config);
        let mut vars = HashMap::new();
        vars.insert("request", request);
        vars.insert("request_a", request_a);
        vars.insert("request_b", request_b);
        let prompt = self.prompts.render("evaluation_shadow_comparison", &vars).unwrap_or_default();

        let raw: ShadowComparisonVerdict = generate(
            self.llm.as_ref(),
            &config.model,
            vec![
                Message::system("You judge two anonymized agent responses, Request A and Request B, for success and relative quality."),
                Message::user(prompt),
            ],
        )
        .await?;

        let is_success_regular = if regular_is_a { raw.is_success_a } else { raw.is_success_b };
        let comparison = regular_vs_shadow(raw.comparison, regular_is_a);

        Ok(ResolvedShadowVerdict {
            is_success_regular,
            failure_type: raw.failure_type,
            failure_reason: raw.failure_reason,
            agent_prompt_update: raw.agent_prompt_update,
            comparison,
        })
    }

    fn success_definition_block(&self, config: &EvaluationConfig) -> String {
        format!(
            "Success definition: {}\nAvailable tools: {}\nAction space: {}",
            config.success_definition,
            config.tool_set.join(", "),
            config.action_space.join(", ")
        )
    }

    fn transcript(&self, interactions: &[Interaction]) -> String {
        interactions.iter().map(|i| format!("[{:?}] {}", i.role, i.content)).collect::<Vec<_>>().join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::store::InMemoryStore;

    fn config() -> EvaluationConfig {
        EvaluationConfig {
            evaluation_name: "booking_success".into(),
            success_definition: "the agent completed the booking".into(),
            tool_set: vec!["book_flight".into()],
            action_space: vec!["ask".into(), "book".into()],
            sampling_rate: 1.0,
            model: "gpt-test".into(),
        }
    }

    fn interaction(id: &str, role: crate::domain::Role, content: &str, shadow: Option<&str>) -> Interaction {
        Interaction {
            interaction_id: id.into(),
            user_id: "u1".into(),
            request_id: "r1".into(),
            created_at: 1,
            role,
            content: content.into(),
            shadow_content: shadow.map(|s| s.to_string()),
            tools_used: vec![],
            image: None,
            embedding: vec![],
        }
    }

    #[test]
    fn sampling_is_deterministic_across_calls() {
        let first = is_sampled("req-123", 0.3);
        let second = is_sampled("req-123", 0.3);
        assert_eq!(first, second);
    }

    #[test]
    fn sampling_rate_one_always_includes() {
        assert!(is_sampled("anything", 1.0));
    }

    #[test]
    fn sampling_rate_zero_never_includes() {
        assert!(!is_sampled("anything", 0.0));
    }

    #[tokio::test]
    async fn success_only_path_used_when_no_shadow_content() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let llm = Arc::new(MockLlmClient::new());
        llm.push_response(
            "success_only_verdict",
            serde_json::json!({"is_success": true, "failure_type": null, "failure_reason": null, "agent_prompt_update": null}),
        );
        let service = EvaluationService::new(store.clone(), llm.clone(), Arc::new(PromptManager::with_defaults()));
        let interactions = vec![
            interaction("i1", crate::domain::Role::User, "book me a flight", None),
            interaction("i2", crate::domain::Role::Agent, "done, booked", None),
        ];
        let report = service.run("r1", "v1", &interactions, &[config()]).await.unwrap();
        assert_eq!(report.result_ids.len(), 1);
        assert_eq!(llm.generate_call_count(), 1);

        let results = store.get_evaluation_results("r1").await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_success);
        assert!(results[0].regular_vs_shadow.is_none());
    }

    #[tokio::test]
    async fn shadow_comparison_path_used_when_shadow_content_present() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let llm = Arc::new(MockLlmClient::new());
        llm.push_response(
            "shadow_comparison_verdict",
            serde_json::json!({
                "is_success_a": true,
                "is_success_b": true,
                "failure_type": null,
                "failure_reason": null,
                "agent_prompt_update": null,
                "comparison": "TIED"
            }),
        );
        let service = EvaluationService::new(store.clone(), llm.clone(), Arc::new(PromptManager::with_defaults()));
        let interactions = vec![
            interaction("i1", crate::domain::Role::User, "book me a flight", None),
            interaction("i2", crate::domain::Role::Agent, "done, booked", Some("sure, I booked it for you")),
        ];
        let report = service.run("r1", "v1", &interactions, &[config()]).await.unwrap();
        assert_eq!(report.result_ids.len(), 1);

        let results = store.get_evaluation_results("r1").await.unwrap();
        assert_eq!(results[0].regular_vs_shadow, Some(Comparison::Tied));
    }

    #[tokio::test]
    async fn below_threshold_sampling_rate_skips_without_llm_call() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let llm = Arc::new(MockLlmClient::new());
        let service = EvaluationService::new(store.clone(), llm.clone(), Arc::new(PromptManager::with_defaults()));
        let mut cfg = config();
        cfg.sampling_rate = 0.0;
        let interactions = vec![interaction("i1", crate::domain::Role::User, "hi", None)];
        let report = service.run("r1", "v1", &interactions, &[cfg]).await.unwrap();
        assert_eq!(report.result_ids.len(), 0);
        assert_eq!(report.skipped_by_sampling.len(), 1);
        assert_eq!(llm.generate_call_count(), 0);
    }
}
