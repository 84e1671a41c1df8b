//! Feedback cluster aggregation (spec §4.4's `run_aggregation`): clusters
//! CURRENT raw feedback by embedding, compares cluster fingerprints against
//! the previous run to avoid redundant LLM calls, and consolidates new
//! clusters into `AggregatedFeedback` via the LLM.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::cluster::{cluster, Cluster, ClusterPoint, ClusteringConfig};
use crate::domain::feedback::{FeedbackApproval, FeedbackState};
use crate::domain::{now_ts, AggregatedFeedback, BlockingIssue, RawFeedback};
use crate::error::Result;
use crate::extractor::GenerationMode;
use crate::llm::{generate, LlmClient, Message, PromptManager, StructuredOutput};
use crate::operation_state::OperationStateManager;
use crate::store::Store;

pub const SERVICE_NAME: &str = "feedback";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackConsolidationOutput {
    pub feedback_content: String,
    pub do_action: String,
    pub do_not_action: String,
    pub when_condition: String,
    pub blocking_issue: Option<BlockingIssue>,
}

impl StructuredOutput for FeedbackConsolidationOutput {
    fn schema_name() -> &'static str {
        "feedback_consolidation_output"
    }
}

#[derive(Debug, Default)]
pub struct AggregationReport {
    pub carried_forward: usize,
    pub regenerated: usize,
    pub archived: usize,
}

/// Runs `run_aggregation(agent_version, feedback_name)` (spec §4.4 steps
/// 1-9). Scoped per org/feedback_name/agent_version; callers are expected to
/// hold the feedback service's per-org lock for the duration of the call
/// (spec §5 ordering guarantees).
pub struct FeedbackAggregator {
    store: Arc<dyn Store>,
    operation_state: OperationStateManager,
    llm: Arc<dyn LlmClient>,
    prompts: Arc<PromptManager>,
    model: String,
    clustering: ClusteringConfig,
}

impl FeedbackAggregator {
    pub fn new(
        store: Arc<dyn Store>,
        operation_state: OperationStateManager,
        llm: Arc<dyn LlmClient>,
        prompts: Arc<PromptManager>,
        model: impl Into<String>,
    ) -> Self {
        Self { store, operation_state, llm, prompts, model: model.into(), clustering: ClusteringConfig::default() }
    }

    pub fn with_clustering_config(mut self, config: ClusteringConfig) -> Self {
        self.clustering = config;
        self
    }

    #[instrument(skip(self))]
    pub async fn run_aggregation(
        &self,
        org_id: &str,
        agent_version: &str,
        feedback_name: &str,
        mode: GenerationMode,
    ) -> Result<AggregationReport> {
        let raw_feedbacks = self.store.get_raw_feedbacks(agent_version, feedback_name, FeedbackState::Current).await?;
        let by_id: HashMap<String, RawFeedback> =
            raw_feedbacks.iter().cloned().map(|f| (f.raw_feedback_id.clone(), f)).collect();

        let points: Vec<ClusterPoint> =
            raw_feedbacks.iter().map(|f| ClusterPoint { id: f.raw_feedback_id.clone(), embedding: f.embedding.clone() }).collect();
        let clusters = cluster(&points, &self.clustering);

        // Rerun bypasses the fingerprint comparison entirely (spec §4.4
        // step 7): every cluster is treated as new.
        let is_rerun = matches!(mode, GenerationMode::Rerun);
        let previous_fingerprints = if is_rerun {
            HashMap::new()
        } else {
            self.operation_state.get_cluster_fingerprints(SERVICE_NAME, org_id, feedback_name, agent_version).await?
        };

        let mut report = AggregationReport::default();
        let mut new_fingerprints: HashMap<String, String> = HashMap::new();
        let mut archived_ids: Vec<String> = Vec::new();

        let consolidation_result = self
            .consolidate_clusters(&clusters, &by_id, &previous_fingerprints, agent_version, feedback_name, mode, &mut report, &mut new_fingerprints)
            .await;

        if let Err(e) = consolidation_result {
            return Err(e);
        }

        let archive_result = self
            .archive_disappeared(&previous_fingerprints, &new_fingerprints, &mut archived_ids, &mut report)
            .await;

        if let Err(e) = archive_result {
            // spec §4.4 step 9: restore anything archived in this run before
            // propagating the error.
            if !archived_ids.is_empty() {
                let _ = self.store.restore_by_ids(&archived_ids).await;
            }
            return Err(e);
        }

        self.operation_state
            .replace_cluster_fingerprints(SERVICE_NAME, org_id, feedback_name, agent_version, new_fingerprints)
            .await?;

        info!(
            org_id,
            agent_version,
            feedback_name,
            carried_forward = report.carried_forward,
            regenerated = report.regenerated,
            archived = report.archived,
            "aggregation complete"
        );
        Ok(report)
    }

    async fn consolidate_clusters(
        &self,
        clusters: &[Cluster],
        by_id: &HashMap<String, RawFeedback>,
        previous_fingerprints: &HashMap<String, String>,
        agent_version: &str,
        feedback_name: &str,
        mode: GenerationMode,
        report: &mut AggregationReport,
        new_fingerprints: &mut HashMap<String, String>,
    ) -> Result<()> {
        let is_rerun = matches!(mode, GenerationMode::Rerun);
        for c in clusters {
            let fp = c.fingerprint();
            if !is_rerun {
                if let Some(existing_feedback_id) = previous_fingerprints.get(&fp) {
                    if self.store.get_aggregated_feedback(existing_feedback_id).await?.is_some() {
                        new_fingerprints.insert(fp, existing_feedback_id.clone());
                        report.carried_forward += 1;
                        continue;
                    }
                }
            }

            let members: Vec<&RawFeedback> = c.member_ids.iter().filter_map(|id| by_id.get(id)).collect();
            let consolidated = self.consolidate(&members).await?;
            let embedding = self.llm.embed(&consolidated.feedback_content).await.unwrap_or_default();
            let feedback_id = Uuid::new_v4().to_string();
            let aggregated = AggregatedFeedback {
                feedback_id: feedback_id.clone(),
                feedback_name: feedback_name.to_string(),
                agent_version: agent_version.to_string(),
                feedback_content: consolidated.feedback_content,
                do_action: consolidated.do_action,
                do_not_action: consolidated.do_not_action,
                when_condition: consolidated.when_condition,
                blocking_issue: consolidated.blocking_issue,
                feedback_status: FeedbackApproval::Pending,
                feedback_metadata: HashMap::new(),
                embedding,
                status: mode.output_status(),
                archived_at: None,
            };
            self.store.put_aggregated_feedback(aggregated).await?;
            new_fingerprints.insert(fp, feedback_id);
            report.regenerated += 1;
        }
        Ok(())
    }

    async fn archive_disappeared(
        &self,
        previous_fingerprints: &HashMap<String, String>,
        new_fingerprints: &HashMap<String, String>,
        archived_ids: &mut Vec<String>,
        report: &mut AggregationReport,
    ) -> Result<()> {
        let new_fps: HashSet<&String> = new_fingerprints.keys().collect();
        for (fp, feedback_id) in previous_fingerprints {
            if new_fps.contains(fp) {
                continue;
            }
            let Some(existing) = self.store.get_aggregated_feedback(feedback_id).await? else {
                continue;
            };
            if existing.is_protected_from_auto_archive() {
                continue;
            }
            self.store.archive_by_ids(&[feedback_id.clone()]).await?;
            archived_ids.push(feedback_id.clone());
            report.archived += 1;
        }
        Ok(())
    }

    async fn consolidate(&self, members: &[&RawFeedback]) -> Result<FeedbackConsolidationOutput> {
        let items = members
            .iter()
            .map(|f| format!("- do: {} | don't: {} | when: {}", f.do_action, f.do_not_action, f.when_condition))
            .collect::<Vec<_>>()
            .join("\n");
        let mut vars = HashMap::new();
        vars.insert("items", items);
        let prompt = self.prompts.render("feedback_cluster_consolidation", &vars).unwrap_or_default();
        generate(
            self.llm.as_ref(),
            &self.model,
            vec![Message::system("You merge a cluster of similar developer feedback items into one consolidated item."), Message::user(prompt)],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::store::InMemoryStore;

    fn raw_feedback(id: &str, embedding: Vec<f32>) -> RawFeedback {
        RawFeedback {
            raw_feedback_id: id.into(),
            agent_version: "v1".into(),
            request_id: "r1".into(),
            feedback_name: "fn_tone".into(),
            created_at: now_ts(),
            feedback_content: format!("content for {id}"),
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
    async fn unchanged_membership_carries_forward_with_zero_llm_calls() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
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

        store.put_raw_feedback(raw_feedback("f1", vec![1.0, 0.0])).await.unwrap();
        store.put_raw_feedback(raw_feedback("f2", vec![0.99, 0.01])).await.unwrap();

        let aggregator = FeedbackAggregator::new(store.clone(), operation_state, llm.clone(), Arc::new(PromptManager::with_defaults()), "gpt-test")
            .with_clustering_config(ClusteringConfig { min_feedback_threshold: 1, ..Default::default() });

        let first = aggregator.run_aggregation("org1", "v1", "fn_tone", GenerationMode::Regular).await.unwrap();
        assert_eq!(first.regenerated, 1);
        assert_eq!(llm.generate_call_count(), 1);

        // Second run over the same raw feedback set produces the same
        // cluster fingerprint, so it should be carried forward with zero
        // additional LLM calls (invariant 7).
        let second = aggregator.run_aggregation("org1", "v1", "fn_tone", GenerationMode::Regular).await.unwrap();
        assert_eq!(second.carried_forward, 1);
        assert_eq!(second.regenerated, 0);
        assert_eq!(llm.generate_call_count(), 1);
    }

    #[tokio::test]
    async fn disappeared_cluster_is_archived_unless_approved() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let operation_state = OperationStateManager::new(store.clone());
        let llm = Arc::new(MockLlmClient::new());
        for _ in 0..2 {
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
        }
        store.put_raw_feedback(raw_feedback("f1", vec![1.0, 0.0])).await.unwrap();
        store.put_raw_feedback(raw_feedback("f2", vec![0.99, 0.01])).await.unwrap();

        let aggregator = FeedbackAggregator::new(store.clone(), operation_state, llm.clone(), Arc::new(PromptManager::with_defaults()), "gpt-test")
            .with_clustering_config(ClusteringConfig { min_feedback_threshold: 1, ..Default::default() });
        aggregator.run_aggregation("org1", "v1", "fn_tone", GenerationMode::Regular).await.unwrap();

        // Archive the source rows and add an unrelated feedback so the
        // cluster membership (and hence fingerprint) changes entirely.
        store.set_raw_feedback_status("f1", FeedbackState::Archived, Some(now_ts())).await.unwrap();
        store.set_raw_feedback_status("f2", FeedbackState::Archived, Some(now_ts())).await.unwrap();
        store.put_raw_feedback(raw_feedback("f3", vec![0.0, 1.0])).await.unwrap();
        store.put_raw_feedback(raw_feedback("f4", vec![0.01, 0.99])).await.unwrap();

        let second = aggregator.run_aggregation("org1", "v1", "fn_tone", GenerationMode::Regular).await.unwrap();
        assert_eq!(second.archived, 1);
        assert_eq!(second.regenerated, 1);
    }
}
