use serde::{Deserialize, Serialize};

use super::Timestamp;

/// Outcome of an A/B shadow comparison (spec §3 `EvaluationResult`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Comparison {
    RegularIsBetter,
    RegularIsSlightlyBetter,
    ShadowIsBetter,
    ShadowIsSlightlyBetter,
    Tied,
}

/// A success judgment for one request under one named evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub result_id: String,
    pub request_id: String,
    pub agent_version: String,
    pub evaluation_name: String,
    pub is_success: bool,
    pub failure_type: Option<String>,
    pub failure_reason: Option<String>,
    pub agent_prompt_update: Option<String>,
    pub regular_vs_shadow: Option<Comparison>,
    pub created_at: Timestamp,
    pub embedding: Vec<f32>,
}
