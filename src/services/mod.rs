//! Shared plumbing for the three generation services (spec §4.2): parallel
//! extractor invocation under a bounded worker pool with per-extractor
//! timeouts, built on top of the `Extractor` trait and window/stride
//! utilities in `crate::extractor`.
//!
//! Grounded on the teacher's `engine::parallel_executor::ParallelExecutor`
//! (`Arc<Semaphore>` bounded pool, `FuturesUnordered` result collection,
//! per-task timeout).

pub mod aggregator;
pub mod evaluation;
pub mod feedback;
pub mod profile;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tracing::{instrument, warn};

use crate::domain::Interaction;
use crate::extractor::{
    effective_window, extractor_is_selected, should_skip_for_stride, Extractor, ExtractorConfig,
    GenerationServiceConfig,
};
use crate::operation_state::OperationStateManager;
use crate::store::Store;

/// Per-extractor hard deadline (spec §4.1, §4.2).
pub const EXTRACTOR_TIMEOUT: Duration = Duration::from_secs(300);
/// Per-service deadline the orchestrator enforces around a whole service run
/// (spec §4.1).
pub const GENERATION_SERVICE_TIMEOUT: Duration = Duration::from_secs(600);
/// Default bounded pool size for extractors within one service (spec §4.2
/// step 2, overridable via `REFLEXIO_EXTRACTOR_CONCURRENCY`).
pub const DEFAULT_EXTRACTOR_CONCURRENCY: usize = 8;

/// One extractor's outcome for a single service invocation.
pub enum ExtractorRunOutcome<O> {
    /// The extractor ran to completion and produced `output` over `window`.
    Produced { output: O, window: Vec<Interaction> },
    /// Filtered out by source/manual-trigger/allowlist (spec §4.2 step 1).
    SkippedFilter,
    /// New-interaction count was below stride in a Regular run (step c).
    SkippedStride,
    /// Exceeded `EXTRACTOR_TIMEOUT`; bookmark preserved (step e).
    TimedOut,
    /// The extractor returned an error; bookmark preserved.
    Failed(String),
}

pub struct ExtractorRun<O> {
    pub extractor_name: String,
    pub outcome: ExtractorRunOutcome<O>,
}

impl<O> ExtractorRun<O> {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, ExtractorRunOutcome::Produced { .. })
    }
}

/// Runs every extractor in `configs` that passes selection and stride
/// filtering, bounded by a `concurrency`-wide semaphore, each under
/// `EXTRACTOR_TIMEOUT`. Does not advance bookmarks or persist anything —
/// that is the caller's job once dedup/update succeeds (spec §4.2 step f).
#[instrument(skip(configs, implementations, store, operation_state))]
pub async fn run_extractors<O: Send + 'static>(
    service_name: &str,
    scope: Option<&str>,
    configs: &[ExtractorConfig],
    implementations: &HashMap<String, Arc<dyn Extractor<Output = O>>>,
    service_config: &GenerationServiceConfig,
    store: &Arc<dyn Store>,
    operation_state: &OperationStateManager,
    concurrency: usize,
) -> Vec<ExtractorRun<O>> {
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut futures = FuturesUnordered::new();

    for config in configs {
        let Some(implementation) = implementations.get(&config.name).cloned() else {
            continue;
        };
        let config = config.clone();
        let semaphore = semaphore.clone();
        let service_config = service_config.clone();
        let store = store.clone();
        let operation_state = operation_state.clone();
        let service_name = service_name.to_string();
        let scope = scope.map(|s| s.to_string());

        futures.push(tokio::spawn(async move {
            if !extractor_is_selected(&config, &service_config) {
                return ExtractorRun {
                    extractor_name: config.name,
                    outcome: ExtractorRunOutcome::SkippedFilter,
                };
            }

            let window_params = effective_window(&config, &service_config);
            let bookmark = operation_state
                .get_bookmark(&service_name, &service_config.org_id, scope.as_deref(), &config.name)
                .await
                .unwrap_or(None);

            let new_count = store
                .count_new_interactions_since(
                    &service_config.user_id,
                    Some(&service_config.source),
                    bookmark.as_ref().map(|b| b.last_processed_interaction_id.as_str()),
                )
                .await
                .unwrap_or(0);

            if should_skip_for_stride(service_config.mode, new_count, window_params.stride) {
                return ExtractorRun {
                    extractor_name: config.name,
                    outcome: ExtractorRunOutcome::SkippedStride,
                };
            }

            let window = match store
                .get_interaction_window(
                    &service_config.user_id,
                    Some(&service_config.source),
                    window_params.window_size,
                )
                .await
            {
                Ok(window) => window,
                Err(e) => {
                    return ExtractorRun {
                        extractor_name: config.name,
                        outcome: ExtractorRunOutcome::Failed(e.to_string()),
                    }
                }
            };

            let _permit = semaphore.acquire_owned().await;
            let extraction = tokio::time::timeout(EXTRACTOR_TIMEOUT, implementation.extract(&window)).await;

            match extraction {
                Ok(Ok(output)) => ExtractorRun {
                    extractor_name: config.name,
                    outcome: ExtractorRunOutcome::Produced { output, window },
                },
                Ok(Err(e)) => {
                    warn!(extractor = %config.name, error = %e, "extractor failed");
                    ExtractorRun { extractor_name: config.name, outcome: ExtractorRunOutcome::Failed(e.to_string()) }
                }
                Err(_) => {
                    warn!(extractor = %config.name, "extractor timed out");
                    ExtractorRun { extractor_name: config.name, outcome: ExtractorRunOutcome::TimedOut }
                }
            }
        }));
    }

    let mut results = Vec::new();
    while let Some(joined) = futures.next().await {
        match joined {
            Ok(run) => results.push(run),
            Err(join_error) => warn!(%join_error, "extractor task panicked"),
        }
    }
    results
}
