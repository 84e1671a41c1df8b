//! The `Extractor` trait and the window/stride/bookmark utilities shared by
//! all three generation services (spec §4.2).
//!
//! Grounded on the teacher's `engine::traits` trait-object service
//! abstractions (`ExecutionEngine`, `HealthCheck`) for the trait shape, and
//! `engine::rate_limiter`'s sliding-window bookkeeping style for the
//! stride/window arithmetic.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::Interaction;
use crate::error::Result;

/// How a generation run was triggered (spec §4.2's mode table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GenerationMode {
    /// Triggered by `publish`; stride-gated, single user, outputs CURRENT.
    Regular,
    /// Explicitly triggered; not stride-gated, single user or batch,
    /// outputs CURRENT.
    Manual,
    /// Rerun over a (optional) time range; not stride-gated, outputs
    /// PENDING.
    Rerun,
}

impl GenerationMode {
    /// Regular runs are the only mode subject to the stride check (spec
    /// §4.2 step c).
    pub fn is_stride_checked(self) -> bool {
        matches!(self, GenerationMode::Regular)
    }

    /// The lifecycle status newly produced content is written with (spec
    /// §4.2's mode table).
    pub fn output_status(self) -> crate::domain::ProfileState {
        match self {
            GenerationMode::Regular | GenerationMode::Manual => crate::domain::ProfileState::Current,
            GenerationMode::Rerun => crate::domain::ProfileState::Pending,
        }
    }
}

/// Static, per-org YAML configuration for one extractor (spec §4.2 Inputs).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractorConfig {
    pub name: String,
    /// If set, the extractor only runs for requests whose `source` is in
    /// this list.
    pub request_sources_enabled: Option<Vec<String>>,
    pub allow_manual_trigger: bool,
    /// Per-extractor override of the service's global window size/stride.
    pub window_size: Option<usize>,
    pub stride: Option<usize>,
}

/// Runtime parameters for one generation-service invocation (spec §4.2
/// Inputs: `GenerationServiceConfig`).
#[derive(Debug, Clone)]
pub struct GenerationServiceConfig {
    pub org_id: String,
    pub user_id: String,
    pub source: String,
    pub agent_version: String,
    pub request_id: String,
    /// The driving request's `created_at` (spec §3/§4.3: a profile's
    /// `last_modified_timestamp` is set to this, not to wall-clock time).
    pub request_created_at: i64,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    /// Explicit extractor-name allowlist; `None` means "all extractors
    /// that pass the other filters".
    pub extractor_names: Option<Vec<String>>,
    pub allow_manual_trigger: bool,
    pub mode: GenerationMode,
    pub global_window_size: usize,
    pub global_stride: usize,
}

/// The effective window size/stride for one extractor after applying its
/// override, if any, over the service's global defaults.
#[derive(Debug, Clone, Copy)]
pub struct EffectiveWindow {
    pub window_size: usize,
    pub stride: usize,
}

pub fn effective_window(extractor: &ExtractorConfig, service: &GenerationServiceConfig) -> EffectiveWindow {
    EffectiveWindow {
        window_size: extractor.window_size.unwrap_or(service.global_window_size),
        stride: extractor.stride.unwrap_or(service.global_stride),
    }
}

/// Whether `extractor` should run for this service invocation, applying
/// spec §4.2 step 1's three filters in order: `request_sources_enabled`,
/// `allow_manual_trigger`, and the explicit name allowlist.
pub fn extractor_is_selected(extractor: &ExtractorConfig, service: &GenerationServiceConfig) -> bool {
    if let Some(sources) = &extractor.request_sources_enabled {
        if !sources.iter().any(|s| s == &service.source) {
            return false;
        }
    }
    if matches!(service.mode, GenerationMode::Manual) && !extractor.allow_manual_trigger {
        return false;
    }
    if let Some(names) = &service.extractor_names {
        if !names.iter().any(|n| n == &extractor.name) {
            return false;
        }
    }
    true
}

/// Whether the stride check should skip this extractor run (spec §4.2 step
/// c): only applies in `Regular` mode, and only when the count of new
/// interactions since the bookmark is strictly less than the effective
/// stride.
pub fn should_skip_for_stride(mode: GenerationMode, new_interaction_count: usize, stride: usize) -> bool {
    mode.is_stride_checked() && new_interaction_count < stride
}

/// A pluggable, config-defined unit that consumes a window of interactions
/// and produces a typed structured output (spec GLOSSARY, §9 REDESIGN FLAG
/// on dynamic Pydantic models — never a raw JSON blob).
#[async_trait]
pub trait Extractor: Send + Sync {
    type Output: Send;

    fn name(&self) -> &str;

    async fn extract(&self, window: &[Interaction]) -> Result<Self::Output>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor(name: &str) -> ExtractorConfig {
        ExtractorConfig {
            name: name.to_string(),
            request_sources_enabled: None,
            allow_manual_trigger: false,
            window_size: None,
            stride: None,
        }
    }

    fn service(mode: GenerationMode) -> GenerationServiceConfig {
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
            mode,
            global_window_size: 10,
            global_stride: 3,
        }
    }

    #[test]
    fn manual_mode_excludes_extractors_without_allow_manual_trigger() {
        let extractor = extractor("e1");
        let service = service(GenerationMode::Manual);
        assert!(!extractor_is_selected(&extractor, &service));
    }

    #[test]
    fn source_filter_excludes_non_matching_source() {
        let mut extractor = extractor("e1");
        extractor.request_sources_enabled = Some(vec!["web".to_string()]);
        let service = service(GenerationMode::Regular);
        assert!(!extractor_is_selected(&extractor, &service));
    }

    #[test]
    fn explicit_allowlist_excludes_unlisted_extractors() {
        let extractor = extractor("e1");
        let mut service = service(GenerationMode::Regular);
        service.extractor_names = Some(vec!["e2".to_string()]);
        assert!(!extractor_is_selected(&extractor, &service));
    }

    #[test]
    fn stride_check_only_applies_in_regular_mode() {
        assert!(should_skip_for_stride(GenerationMode::Regular, 1, 2));
        assert!(!should_skip_for_stride(GenerationMode::Regular, 2, 2));
        assert!(!should_skip_for_stride(GenerationMode::Manual, 0, 2));
        assert!(!should_skip_for_stride(GenerationMode::Rerun, 0, 2));
    }

    #[test]
    fn per_extractor_override_wins_over_service_global() {
        let mut extractor = extractor("e1");
        extractor.window_size = Some(50);
        let service = service(GenerationMode::Regular);
        let window = effective_window(&extractor, &service);
        assert_eq!(window.window_size, 50);
        assert_eq!(window.stride, 3);
    }
}
