//! The `Orchestrator`: `publish(request)` persists interactions and fans out
//! to the three generation services under independent timeouts and the
//! per-(service, scope) lock protocol (spec §4.1).
//!
//! Grounded on the teacher's `engine::parallel_executor::ParallelExecutor`
//! for the bounded-pool fan-out/fan-in shape, generalized from N identical
//! graph-node tasks to exactly three heterogeneous service tasks.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tracing::{instrument, warn};

use crate::config::OrgConfig;
use crate::domain::{Interaction, Request};
use crate::error::Result;
use crate::extractor::{GenerationMode, GenerationServiceConfig};
use crate::llm::LlmClient;
use crate::metrics;
use crate::operation_state::{LockOutcome, OperationStateManager};
use crate::services::evaluation::EvaluationService;
use crate::services::feedback::FeedbackService;
use crate::services::profile::ProfileService;
use crate::store::Store;

/// Hard deadline for the whole `publish` call (spec §4.1).
pub const PUBLISH_DEADLINE: Duration = Duration::from_secs(600);
/// Exactly three services run per publish; the pool bound is 3 by
/// definition (spec §4.1 step 2), kept as a named constant rather than a
/// magic `3` at the call site.
pub const SERVICE_POOL_SIZE: usize = 3;

#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub success: bool,
    pub message: String,
}

/// Per-service result, surfaced to the caller via `PublishOutcome.message`
/// and recorded in metrics; never fails the overall `publish` call (spec
/// §4.1: "service failures do not fail the publish").
#[derive(Debug, Clone)]
enum ServiceOutcome {
    Success,
    Queued,
    TimedOut,
    Failed(String),
}

impl ServiceOutcome {
    fn label(&self) -> &'static str {
        match self {
            ServiceOutcome::Success => "success",
            ServiceOutcome::Queued => "queued",
            ServiceOutcome::TimedOut => "timed_out",
            ServiceOutcome::Failed(_) => "failed",
        }
    }
}

/// Wires the three generation services, the store, and the coordination
/// layer together behind one `publish` entry point.
pub struct Orchestrator {
    store: Arc<dyn Store>,
    operation_state: OperationStateManager,
    llm: Arc<dyn LlmClient>,
    profile: Arc<ProfileService>,
    feedback: Arc<FeedbackService>,
    evaluation: Arc<EvaluationService>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        operation_state: OperationStateManager,
        llm: Arc<dyn LlmClient>,
        profile: ProfileService,
        feedback: FeedbackService,
        evaluation: EvaluationService,
    ) -> Self {
        Self {
            store,
            operation_state,
            llm,
            profile: Arc::new(profile),
            feedback: Arc::new(feedback),
            evaluation: Arc::new(evaluation),
        }
    }

    /// Spec §4.1 algorithm: persist, fan out to three locked service runs,
    /// wait for all under `PUBLISH_DEADLINE`. Service failures are recorded
    /// but never turn `publish` itself into an error.
    #[instrument(skip(self, request, interactions, org_config))]
    pub async fn publish(
        &self,
        mut request: Request,
        mut interactions: Vec<Interaction>,
        org_config: &OrgConfig,
    ) -> Result<PublishOutcome> {
        let start = std::time::Instant::now();
        let outcome = tokio::time::timeout(PUBLISH_DEADLINE, self.publish_inner(&mut request, &mut interactions, org_config)).await;

        let result = match outcome {
            Ok(result) => result,
            Err(_) => Ok(PublishOutcome { success: false, message: "publish exceeded PUBLISH_DEADLINE".to_string() }),
        };

        let elapsed = start.elapsed().as_secs_f64();
        let label = result.as_ref().map(|r| if r.success { "success" } else { "partial_failure" }).unwrap_or("error");
        metrics::record_publish_duration(label, elapsed);
        result
    }

    async fn publish_inner(
        &self,
        request: &mut Request,
        interactions: &mut [Interaction],
        org_config: &OrgConfig,
    ) -> Result<PublishOutcome> {
        for interaction in interactions.iter_mut() {
            if interaction.embedding.is_empty() {
                interaction.embedding = self.llm.embed(&interaction.content).await.unwrap_or_default();
            }
        }

        self.store.put_request(request.clone()).await?;
        self.store.put_interactions(interactions.to_vec()).await?;

        let service_config = GenerationServiceConfig {
            org_id: org_request_org(request),
            user_id: request.user_id.clone(),
            source: request.source.clone(),
            agent_version: request.agent_version.clone(),
            request_id: request.request_id.clone(),
            request_created_at: request.created_at,
            start_time: None,
            end_time: None,
            extractor_names: None,
            allow_manual_trigger: false,
            mode: GenerationMode::Regular,
            global_window_size: org_config.global_window_size,
            global_stride: org_config.global_stride,
        };

        let semaphore = Arc::new(Semaphore::new(SERVICE_POOL_SIZE));
        let mut tasks = FuturesUnordered::new();

        let org_id = service_config.org_id.clone();
        let request_id = service_config.request_id.clone();
        let user_id = service_config.user_id.clone();

        {
            let profile = self.profile.clone();
            let operation_state = self.operation_state.clone();
            let service_config = service_config.clone();
            let extractor_configs = org_config.profile_extractors.clone();
            let semaphore = semaphore.clone();
            let org_id = org_id.clone();
            let request_id = request_id.clone();
            let scope = user_id.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let outcome = run_locked_service("profile", &org_id, Some(&scope), &request_id, &operation_state, crate::services::GENERATION_SERVICE_TIMEOUT, |rid| {
                    let profile = profile.clone();
                    let mut cfg = service_config.clone();
                    cfg.request_id = rid;
                    let extractor_configs = extractor_configs.clone();
                    async move { profile.run(&cfg, &extractor_configs).await.map(|_| ()) }
                })
                .await;
                ("profile", outcome)
            }));
        }

        {
            let feedback = self.feedback.clone();
            let operation_state = self.operation_state.clone();
            let service_config = service_config.clone();
            let extractor_configs = org_config.feedback_extractors.clone();
            let semaphore = semaphore.clone();
            let org_id = org_id.clone();
            let request_id = request_id.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let outcome = run_locked_service("feedback", &org_id, None, &request_id, &operation_state, crate::services::GENERATION_SERVICE_TIMEOUT, |rid| {
                    let feedback = feedback.clone();
                    let mut cfg = service_config.clone();
                    cfg.request_id = rid;
                    let extractor_configs = extractor_configs.clone();
                    async move { feedback.run(&cfg, &extractor_configs).await.map(|_| ()) }
                })
                .await;
                ("feedback", outcome)
            }));
        }

        {
            let evaluation = self.evaluation.clone();
            let operation_state = self.operation_state.clone();
            let semaphore = semaphore.clone();
            let org_id = org_id.clone();
            let request_id = request_id.clone();
            let agent_version = request.agent_version.clone();
            let interactions = interactions.to_vec();
            let evaluation_configs = org_config.evaluation_configs.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let outcome = run_locked_service("evaluation", &org_id, None, &request_id, &operation_state, crate::services::GENERATION_SERVICE_TIMEOUT, |rid| {
                    let evaluation = evaluation.clone();
                    let agent_version = agent_version.clone();
                    let interactions = interactions.clone();
                    let evaluation_configs = evaluation_configs.clone();
                    async move { evaluation.run(&rid, &agent_version, &interactions, &evaluation_configs).await.map(|_| ()) }
                })
                .await;
                ("evaluation", outcome)
            }));
        }

        let mut messages = Vec::new();
        let mut any_failed = false;
        while let Some(joined) = tasks.next().await {
            match joined {
                Ok((service_name, outcome)) => {
                    metrics::record_service_outcome(service_name, outcome.label());
                    if let ServiceOutcome::Failed(e) = &outcome {
                        any_failed = true;
                        warn!(service = service_name, org_id = %org_id, error = %e, "service run failed");
                        messages.push(format!("{service_name}: failed ({e})"));
                    } else {
                        messages.push(format!("{service_name}: {}", outcome.label()));
                    }
                }
                Err(join_error) => {
                    any_failed = true;
                    warn!(%join_error, "service task panicked");
                    messages.push(format!("task panicked: {join_error}"));
                }
            }
        }

        Ok(PublishOutcome { success: !any_failed, message: messages.join("; ") })
    }
}

/// `Request` doesn't carry an explicit `org_id` field (spec §3 lists none);
/// orgs are identified by the agent/source configuration boundary, so we
/// derive the lock/config scope from `agent_version` — the same key
/// `OrgConfigCache` is keyed on (spec §9 Open Question: org resolution).
fn org_request_org(request: &Request) -> String {
    request.agent_version.clone()
}

/// Runs `run_once(request_id)` under the service's per-(service, scope)
/// lock, honoring the "at most one re-run per release" rule (spec §4.7
/// step 2): if a newer request queued while this one ran, the service is
/// re-run exactly once for that request id before returning.
async fn run_locked_service<F, Fut>(
    service: &str,
    org_id: &str,
    scope: Option<&str>,
    request_id: &str,
    operation_state: &OperationStateManager,
    timeout: Duration,
    mut run_once: F,
) -> ServiceOutcome
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    match operation_state.try_acquire_lock(service, org_id, scope, request_id).await {
        Ok(LockOutcome::Acquired) => {}
        Ok(LockOutcome::Queued) => {
            metrics::record_lock_outcome(service, "queued");
            return ServiceOutcome::Queued;
        }
        Ok(LockOutcome::Rejected) => return ServiceOutcome::Failed("lock rejected".to_string()),
        Err(e) => return ServiceOutcome::Failed(e.to_string()),
    }
    metrics::record_lock_outcome(service, "acquired");

    let outcome = run_one_attempt(&mut run_once, request_id, timeout).await;
    let pending = operation_state.release(service, org_id, scope, request_id).await.unwrap_or(None);

    let Some(pending_request_id) = pending else {
        return outcome;
    };

    match operation_state.try_acquire_lock(service, org_id, scope, &pending_request_id).await {
        Ok(LockOutcome::Acquired) => {
            let rerun_outcome = run_one_attempt(&mut run_once, &pending_request_id, timeout).await;
            operation_state.release(service, org_id, scope, &pending_request_id).await.ok();
            rerun_outcome
        }
        _ => outcome,
    }
}

async fn run_one_attempt<F, Fut>(run_once: &mut F, request_id: &str, timeout: Duration) -> ServiceOutcome
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    match tokio::time::timeout(timeout, run_once(request_id.to_string())).await {
        Ok(Ok(())) => ServiceOutcome::Success,
        Ok(Err(e)) => ServiceOutcome::Failed(e.to_string()),
        Err(_) => ServiceOutcome::TimedOut,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrgConfig;
    use crate::domain::Role;
    use crate::llm::{MockLlmClient, PromptManager};
    use crate::store::InMemoryStore;

    fn request() -> Request {
        Request {
            request_id: "r1".into(),
            user_id: "u1".into(),
            created_at: 1,
            source: "chat".into(),
            agent_version: "v1".into(),
            request_group: None,
        }
    }

    fn interaction(id: &str) -> Interaction {
        Interaction {
            interaction_id: id.into(),
            user_id: "u1".into(),
            request_id: "r1".into(),
            created_at: 1,
            role: Role::User,
            content: "hello".into(),
            shadow_content: None,
            tools_used: vec![],
            image: None,
            embedding: vec![],
        }
    }

    #[tokio::test]
    async fn publish_persists_request_and_interactions_and_reports_per_service_outcomes() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let operation_state = OperationStateManager::new(store.clone());
        let llm = Arc::new(MockLlmClient::new());
        let prompts = Arc::new(PromptManager::with_defaults());

        let profile = ProfileService::new(store.clone(), operation_state.clone(), llm.clone(), prompts.clone(), "gpt-test");
        let feedback = FeedbackService::new(store.clone(), operation_state.clone(), llm.clone(), prompts.clone(), "gpt-test");
        let evaluation = EvaluationService::new(store.clone(), llm.clone(), prompts.clone());

        let orchestrator = Orchestrator::new(store.clone(), operation_state, llm, profile, feedback, evaluation);
        let org_config = OrgConfig::default();

        let result = orchestrator.publish(request(), vec![interaction("i1")], &org_config).await.unwrap();
        assert!(result.success);

        let stored = store.get_interactions_for_request("r1").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(!stored[0].embedding.is_empty(), "embedding should be computed during publish");
    }
}
