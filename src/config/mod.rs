//! Per-org YAML configuration and the TTL+LRU org cache (spec §5, §9).
//!
//! Grounded on the teacher's `engine::metrics`'s lazy-static "load once,
//! reuse everywhere" registration style, generalized from metrics to
//! config via `arc-swap` rather than a process-global `lazy_static!`
//! (spec §9's guidance against singletons: the cache is an explicit handle
//! passed through service constructors).

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::extractor::ExtractorConfig;
use crate::services::evaluation::EvaluationConfig;

/// One org's static configuration, normally loaded from per-org YAML.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OrgConfig {
    pub org_id: String,
    pub profile_extractors: Vec<ExtractorConfig>,
    pub feedback_extractors: Vec<ExtractorConfig>,
    /// Evaluation has no window/stride/bookmark, so it uses
    /// `EvaluationConfig` (success definition, sampling rate) rather than
    /// `ExtractorConfig` (spec §4.5 Inputs).
    pub evaluation_configs: Vec<EvaluationConfig>,
    pub global_window_size: usize,
    pub global_stride: usize,
    /// Per-org feature flag allowlist; resolution is fail-open (spec §6:
    /// "unknown flag ⇒ enabled").
    pub feature_flags: HashMap<String, bool>,
}

impl OrgConfig {
    /// Resolves a feature flag for this org. Per spec §6, an unknown flag
    /// resolves to enabled (fail-open) rather than disabled.
    pub fn feature_enabled(&self, flag: &str) -> bool {
        self.feature_flags.get(flag).copied().unwrap_or(true)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }
}

struct CacheEntry {
    config: Arc<OrgConfig>,
    loaded_at: Instant,
}

/// TTL (1 hour) + LRU (max 100 orgs) cache over `OrgConfig`, matching
/// spec §9's "TTL-caches (org ⇒ Reflexio instance)" redesign guidance.
/// Invalidation on a config write is synchronous: `invalidate` removes the
/// entry before returning, so the next `get_or_load` call always re-loads.
pub struct OrgConfigCache {
    entries: ArcSwap<HashMap<String, Arc<CacheEntryHandle>>>,
    ttl: Duration,
    max_entries: usize,
}

struct CacheEntryHandle {
    entry: parking_lot::Mutex<CacheEntry>,
}

impl Default for OrgConfigCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600), 100)
    }
}

impl OrgConfigCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: ArcSwap::from_pointee(HashMap::new()),
            ttl,
            max_entries,
        }
    }

    /// Returns the cached config for `org_id` if present and not expired.
    pub fn get(&self, org_id: &str) -> Option<Arc<OrgConfig>> {
        let map = self.entries.load();
        let handle = map.get(org_id)?;
        let entry = handle.entry.lock();
        if entry.loaded_at.elapsed() > self.ttl {
            return None;
        }
        Some(entry.config.clone())
    }

    /// Inserts or refreshes `org_id`'s config, evicting the oldest entry if
    /// the cache is at capacity.
    pub fn put(&self, org_id: &str, config: Arc<OrgConfig>) {
        let mut map: HashMap<String, Arc<CacheEntryHandle>> = (**self.entries.load()).clone();
        if map.len() >= self.max_entries && !map.contains_key(org_id) {
            if let Some(oldest_key) = self.oldest_key(&map) {
                map.remove(&oldest_key);
            }
        }
        map.insert(
            org_id.to_string(),
            Arc::new(CacheEntryHandle {
                entry: parking_lot::Mutex::new(CacheEntry { config, loaded_at: Instant::now() }),
            }),
        );
        self.entries.store(Arc::new(map));
    }

    /// Synchronous invalidation: a config write must complete this before
    /// returning (spec §5's "cache invalidation on config write is
    /// immediate").
    pub fn invalidate(&self, org_id: &str) {
        let mut map: HashMap<String, Arc<CacheEntryHandle>> = (**self.entries.load()).clone();
        map.remove(org_id);
        self.entries.store(Arc::new(map));
    }

    fn oldest_key(&self, map: &HashMap<String, Arc<CacheEntryHandle>>) -> Option<String> {
        map.iter()
            .min_by_key(|(_, handle)| handle.entry.lock().loaded_at)
            .map(|(key, _)| key.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(org_id: &str) -> Arc<OrgConfig> {
        Arc::new(OrgConfig { org_id: org_id.to_string(), ..Default::default() })
    }

    #[test]
    fn feature_flag_resolution_is_fail_open() {
        let mut cfg = OrgConfig::default();
        cfg.feature_flags.insert("query_rewrite".to_string(), false);
        assert!(!cfg.feature_enabled("query_rewrite"));
        assert!(cfg.feature_enabled("unknown_flag"));
    }

    #[test]
    fn cache_put_then_get_round_trips() {
        let cache = OrgConfigCache::default();
        cache.put("org1", config("org1"));
        assert!(cache.get("org1").is_some());
        assert!(cache.get("org2").is_none());
    }

    #[test]
    fn invalidate_forces_a_reload() {
        let cache = OrgConfigCache::default();
        cache.put("org1", config("org1"));
        cache.invalidate("org1");
        assert!(cache.get("org1").is_none());
    }

    #[test]
    fn lru_eviction_respects_capacity() {
        let cache = OrgConfigCache::new(Duration::from_secs(3600), 2);
        cache.put("org1", config("org1"));
        std::thread::sleep(Duration::from_millis(5));
        cache.put("org2", config("org2"));
        std::thread::sleep(Duration::from_millis(5));
        cache.put("org3", config("org3"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("org1").is_none());
        assert!(cache.get("org3").is_some());
    }

    #[test]
    fn expired_entry_is_not_returned() {
        let cache = OrgConfigCache::new(Duration::from_millis(1), 100);
        cache.put("org1", config("org1"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("org1").is_none());
    }
}
