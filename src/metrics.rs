//! Ambient observability: publish latency, per-service outcome counts, lock
//! contention, and aggregation cluster counts (spec §7's "[AMBIENT]
//! Metrics"). Carried even though spec.md's Non-goals exclude a concrete
//! metrics backend choice.
//!
//! Grounded on the teacher's `engine::metrics` (`register_*_vec!` macros
//! behind `lazy_static!`), generalized from graph execution to publish/
//! service/lock/cluster counters.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec,
};

lazy_static! {
    static ref PUBLISH_DURATION: HistogramVec = register_histogram_vec!(
        "reflexio_publish_duration_seconds",
        "publish() duration in seconds",
        &["outcome"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 60.0]
    )
    .unwrap();

    static ref SERVICE_OUTCOMES: IntCounterVec = register_int_counter_vec!(
        "reflexio_service_outcomes_total",
        "Outcomes of generation-service runs",
        &["service", "outcome"]
    )
    .unwrap();

    static ref EXTRACTOR_OUTCOMES: IntCounterVec = register_int_counter_vec!(
        "reflexio_extractor_outcomes_total",
        "Outcomes of individual extractor runs",
        &["service", "extractor", "outcome"]
    )
    .unwrap();

    static ref LOCK_CONTENTION: IntCounterVec = register_int_counter_vec!(
        "reflexio_lock_contention_total",
        "Lock acquisition outcomes",
        &["service", "outcome"]
    )
    .unwrap();

    static ref AGGREGATION_CLUSTERS: IntCounterVec = register_int_counter_vec!(
        "reflexio_aggregation_clusters_total",
        "Clusters produced per run_aggregation call",
        &["feedback_name", "kind"]
    )
    .unwrap();

    static ref LLM_CALLS: IntCounterVec = register_int_counter_vec!(
        "reflexio_llm_calls_total",
        "LLM calls issued, by call site",
        &["call_site", "outcome"]
    )
    .unwrap();
}

pub fn record_publish_duration(outcome: &str, seconds: f64) {
    PUBLISH_DURATION.with_label_values(&[outcome]).observe(seconds);
}

pub fn record_service_outcome(service: &str, outcome: &str) {
    SERVICE_OUTCOMES.with_label_values(&[service, outcome]).inc();
}

pub fn record_extractor_outcome(service: &str, extractor: &str, outcome: &str) {
    EXTRACTOR_OUTCOMES.with_label_values(&[service, extractor, outcome]).inc();
}

pub fn record_lock_outcome(service: &str, outcome: &str) {
    LOCK_CONTENTION.with_label_values(&[service, outcome]).inc();
}

/// `kind` is `"carried_forward"`, `"regenerated"`, or `"archived"`.
pub fn record_cluster_outcome(feedback_name: &str, kind: &str, count: u64) {
    AGGREGATION_CLUSTERS
        .with_label_values(&[feedback_name, kind])
        .inc_by(count);
}

pub fn record_llm_call(call_site: &str, outcome: &str) {
    LLM_CALLS.with_label_values(&[call_site, outcome]).inc();
}
