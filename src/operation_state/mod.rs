//! The durable coordination layer: atomic in-progress locks with
//! pending-request queuing (spec §4.7), per-extractor stride bookmarks
//! (§4.2), batch-job progress tracking (§4.6), cooperative cancellation
//! (§4.6), and cluster fingerprints (§4.4).
//!
//! Grounded on the teacher's `checkpoint::postgres` upsert-on-conflict
//! pattern for the atomic read-modify-write shape, and
//! `state::versioning::StateVersioningSystem`'s separation of version
//! bookkeeping from its backing store for the manager/`Store` split.

mod keys;

pub use keys::OperationKey;

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::domain::now_ts;
use crate::domain::operation::{
    BookmarkRecord, CancellationRecord, ClusterFingerprintRecord, LockRecord, OperationKind,
    ProgressRecord, SimpleLockRecord,
};
use crate::domain::{OperationStatus, Timestamp};
use crate::error::{ReflexioError, Result};
use crate::store::Store;

/// Locks older than this are presumed held by a crashed process and may be
/// forcibly taken (spec §4.1, §4.7, §7's "stale lock detected" row).
pub const STALE_LOCK_TIMEOUT_SECS: i64 = 300;

/// Outcome of `try_acquire_lock` (spec §4.7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    /// The caller now holds the lock.
    Acquired,
    /// Another request holds the lock; `request_id` was recorded as the
    /// (sole) pending request, overwriting any previous one.
    Queued,
    /// The lock could not be acquired or queued (reserved for future use —
    /// the documented protocol never rejects outright).
    Rejected,
}

/// Coordinates all `OperationState` reads/writes against a `Store`. Stateless
/// beyond the `Arc<dyn Store>` it wraps, so it can be cheaply cloned and
/// shared across services (spec §9's guidance against a process-global
/// singleton).
#[derive(Clone)]
pub struct OperationStateManager {
    store: Arc<dyn Store>,
}

impl OperationStateManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Attempts to acquire the lock at `{service}::{org}[::scope]::lock`
    /// for `request_id` (spec §4.7 step 1).
    ///
    /// - No row yet ⇒ insert and `Acquired`.
    /// - Row older than `STALE_LOCK_TIMEOUT_SECS` ⇒ overwrite and
    ///   `Acquired` (previous holder presumed crashed).
    /// - Otherwise ⇒ record `request_id` as `pending_request_id`
    ///   (overwriting any previous pending id) and return `Queued`.
    #[instrument(skip(self))]
    pub async fn try_acquire_lock(
        &self,
        service: &str,
        org_id: &str,
        scope: Option<&str>,
        request_id: &str,
    ) -> Result<LockOutcome> {
        let key = OperationKey::lock(service, org_id, scope);
        let now = now_ts();
        let request_id_owned = request_id.to_string();

        let (prior, _new) = self
            .store
            .upsert_operation_state_with(
                &key,
                Box::new(move |prior| match prior {
                    None => OperationKind::Lock(LockRecord {
                        holder_request_id: request_id_owned.clone(),
                        acquired_at: now,
                        pending_request_id: None,
                    }),
                    Some(OperationKind::Lock(lock)) if now - lock.acquired_at > STALE_LOCK_TIMEOUT_SECS => {
                        OperationKind::Lock(LockRecord {
                            holder_request_id: request_id_owned.clone(),
                            acquired_at: now,
                            pending_request_id: None,
                        })
                    }
                    Some(OperationKind::Lock(mut lock)) => {
                        lock.pending_request_id = Some(request_id_owned.clone());
                        OperationKind::Lock(lock)
                    }
                    Some(other) => other,
                }),
            )
            .await?;

        match prior {
            None => Ok(LockOutcome::Acquired),
            Some(OperationKind::Lock(lock)) if now - lock.acquired_at > STALE_LOCK_TIMEOUT_SECS => {
                warn!(service, org_id, holder = %lock.holder_request_id, "stale lock reclaimed");
                Ok(LockOutcome::Acquired)
            }
            Some(OperationKind::Lock(lock)) if lock.holder_request_id == request_id => Ok(LockOutcome::Acquired),
            Some(OperationKind::Lock(_)) => Ok(LockOutcome::Queued),
            Some(_) => Err(ReflexioError::Internal(format!("key {key} holds a non-lock payload"))),
        }
    }

    /// Releases the lock if held by `request_id`; deletes the row
    /// regardless of whether a pending request was recorded. Returns the
    /// pending request id, if any, so the caller can re-invoke
    /// `try_acquire_lock` exactly once (spec §4.7 step 2: "at most one
    /// re-run is performed per release").
    #[instrument(skip(self))]
    pub async fn release(
        &self,
        service: &str,
        org_id: &str,
        scope: Option<&str>,
        request_id: &str,
    ) -> Result<Option<String>> {
        let key = OperationKey::lock(service, org_id, scope);
        let current = self.store.get_operation_state(&key).await?;
        match current {
            Some(OperationKind::Lock(lock)) if lock.holder_request_id == request_id => {
                self.store.delete_operation_state(&key).await?;
                Ok(lock.pending_request_id)
            }
            _ => Ok(None),
        }
    }

    // --- bookmarks ----------------------------------------------------

    pub async fn get_bookmark(
        &self,
        service: &str,
        org_id: &str,
        scope: Option<&str>,
        extractor_name: &str,
    ) -> Result<Option<BookmarkRecord>> {
        let key = OperationKey::bookmark(service, org_id, scope, extractor_name);
        match self.store.get_operation_state(&key).await? {
            Some(OperationKind::Bookmark(b)) => Ok(Some(b)),
            _ => Ok(None),
        }
    }

    /// Advances the bookmark, enforcing invariant 5 (monotonicity): the
    /// write is a no-op if `last_processed_ts` would move backwards.
    #[instrument(skip(self))]
    pub async fn advance_bookmark(
        &self,
        service: &str,
        org_id: &str,
        scope: Option<&str>,
        extractor_name: &str,
        last_processed_interaction_id: &str,
        last_processed_ts: Timestamp,
    ) -> Result<()> {
        let key = OperationKey::bookmark(service, org_id, scope, extractor_name);
        let new_id = last_processed_interaction_id.to_string();
        self.store
            .upsert_operation_state_with(
                &key,
                Box::new(move |prior| match prior {
                    Some(OperationKind::Bookmark(existing)) if existing.last_processed_ts > last_processed_ts => {
                        OperationKind::Bookmark(existing)
                    }
                    _ => OperationKind::Bookmark(BookmarkRecord {
                        last_processed_interaction_id: new_id,
                        last_processed_ts,
                    }),
                }),
            )
            .await?;
        Ok(())
    }

    // --- progress -------------------------------------------------------

    pub async fn init_progress(
        &self,
        service: &str,
        org_id: &str,
        total_users: usize,
        request_params: Option<serde_json::Value>,
    ) -> Result<()> {
        let key = OperationKey::progress(service, org_id);
        let record = ProgressRecord {
            status: OperationStatus::InProgress,
            started_at: now_ts(),
            completed_at: None,
            total_users,
            processed_users: 0,
            failed_users: 0,
            current_user_id: None,
            processed_user_ids: Vec::new(),
            failed_user_ids: Vec::new(),
            error_message: None,
            request_params,
        };
        self.store
            .upsert_operation_state_with(&key, Box::new(move |_| OperationKind::Progress(record.clone())))
            .await?;
        Ok(())
    }

    pub async fn get_progress(&self, service: &str, org_id: &str) -> Result<Option<ProgressRecord>> {
        let key = OperationKey::progress(service, org_id);
        match self.store.get_operation_state(&key).await? {
            Some(OperationKind::Progress(p)) => Ok(Some(p)),
            _ => Ok(None),
        }
    }

    /// Records the outcome of processing one user within a batch job (spec
    /// §4.6's per-user failure policy: record and continue).
    #[instrument(skip(self, error))]
    pub async fn record_user_outcome(
        &self,
        service: &str,
        org_id: &str,
        user_id: &str,
        error: Option<String>,
    ) -> Result<()> {
        let key = OperationKey::progress(service, org_id);
        let user_id_owned = user_id.to_string();
        self.store
            .upsert_operation_state_with(
                &key,
                Box::new(move |prior| {
                    let mut progress = match prior {
                        Some(OperationKind::Progress(p)) => p,
                        _ => ProgressRecord {
                            status: OperationStatus::InProgress,
                            started_at: now_ts(),
                            completed_at: None,
                            total_users: 0,
                            processed_users: 0,
                            failed_users: 0,
                            current_user_id: None,
                            processed_user_ids: Vec::new(),
                            failed_user_ids: Vec::new(),
                            error_message: None,
                            request_params: None,
                        },
                    };
                    progress.current_user_id = Some(user_id_owned.clone());
                    progress.processed_users += 1;
                    progress.processed_user_ids.push(user_id_owned.clone());
                    if let Some(err) = &error {
                        progress.failed_users += 1;
                        progress.failed_user_ids.push(crate::domain::operation::FailedUser {
                            user_id: user_id_owned.clone(),
                            error: err.clone(),
                        });
                    }
                    OperationKind::Progress(progress)
                }),
            )
            .await?;
        Ok(())
    }

    pub async fn finalize_progress(
        &self,
        service: &str,
        org_id: &str,
        status: OperationStatus,
        error_message: Option<String>,
    ) -> Result<()> {
        let key = OperationKey::progress(service, org_id);
        self.store
            .upsert_operation_state_with(
                &key,
                Box::new(move |prior| {
                    let mut progress = match prior {
                        Some(OperationKind::Progress(p)) => p,
                        _ => ProgressRecord {
                            status,
                            started_at: now_ts(),
                            completed_at: Some(now_ts()),
                            total_users: 0,
                            processed_users: 0,
                            failed_users: 0,
                            current_user_id: None,
                            processed_user_ids: Vec::new(),
                            failed_user_ids: Vec::new(),
                            error_message: error_message.clone(),
                            request_params: None,
                        },
                    };
                    progress.status = status;
                    progress.completed_at = Some(now_ts());
                    progress.error_message = error_message.clone();
                    OperationKind::Progress(progress)
                }),
            )
            .await?;
        info!(service, org_id, ?status, "batch job finalized");
        Ok(())
    }

    // --- cancellation -----------------------------------------------------

    /// Stored in its own row, separate from progress, to avoid lost-update
    /// races (spec §4.6).
    pub async fn request_cancellation(&self, service: &str, org_id: &str, reason: Option<String>) -> Result<()> {
        let key = OperationKey::cancellation(service, org_id);
        let record = CancellationRecord { requested_at: now_ts(), reason };
        self.store
            .upsert_operation_state_with(&key, Box::new(move |_| OperationKind::Cancellation(record.clone())))
            .await?;
        Ok(())
    }

    pub async fn is_cancellation_requested(&self, service: &str, org_id: &str) -> Result<bool> {
        let key = OperationKey::cancellation(service, org_id);
        Ok(matches!(
            self.store.get_operation_state(&key).await?,
            Some(OperationKind::Cancellation(_))
        ))
    }

    pub async fn clear_cancellation(&self, service: &str, org_id: &str) -> Result<()> {
        let key = OperationKey::cancellation(service, org_id);
        self.store.delete_operation_state(&key).await
    }

    // --- cluster fingerprints ---------------------------------------------

    pub async fn get_cluster_fingerprints(
        &self,
        service: &str,
        org_id: &str,
        feedback_name: &str,
        agent_version: &str,
    ) -> Result<HashMap<String, String>> {
        let key = OperationKey::cluster_fingerprints(service, org_id, feedback_name, Some(agent_version));
        match self.store.get_operation_state(&key).await? {
            Some(OperationKind::ClusterFingerprints(record)) => Ok(record.fingerprints),
            _ => Ok(HashMap::new()),
        }
    }

    /// Atomically replaces the entire fingerprint map for
    /// `(agent_version, feedback_name)` (spec §4.4 step 8).
    pub async fn replace_cluster_fingerprints(
        &self,
        service: &str,
        org_id: &str,
        feedback_name: &str,
        agent_version: &str,
        fingerprints: HashMap<String, String>,
    ) -> Result<()> {
        let key = OperationKey::cluster_fingerprints(service, org_id, feedback_name, Some(agent_version));
        self.store
            .upsert_operation_state_with(
                &key,
                Box::new(move |_| OperationKind::ClusterFingerprints(ClusterFingerprintRecord { fingerprints })),
            )
            .await?;
        Ok(())
    }

    // --- simple lock --------------------------------------------------------

    pub async fn try_acquire_simple_lock(&self, service: &str, org_id: &str) -> Result<bool> {
        let key = OperationKey::simple_lock(service, org_id);
        let now = now_ts();
        let (prior, _) = self
            .store
            .upsert_operation_state_with(
                &key,
                Box::new(move |prior| match prior {
                    None => OperationKind::SimpleLock(SimpleLockRecord { acquired_at: now }),
                    Some(other) => other,
                }),
            )
            .await?;
        Ok(prior.is_none())
    }

    pub async fn release_simple_lock(&self, service: &str, org_id: &str) -> Result<()> {
        let key = OperationKey::simple_lock(service, org_id);
        self.store.delete_operation_state(&key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn manager() -> OperationStateManager {
        OperationStateManager::new(Arc::new(InMemoryStore::new()))
    }

    #[tokio::test]
    async fn second_acquire_is_queued_and_release_returns_pending() {
        let mgr = manager();
        assert_eq!(
            mgr.try_acquire_lock("profile", "org1", Some("u1"), "r1").await.unwrap(),
            LockOutcome::Acquired
        );
        assert_eq!(
            mgr.try_acquire_lock("profile", "org1", Some("u1"), "r2").await.unwrap(),
            LockOutcome::Queued
        );
        // A third pending request overwrites the second (only the latest kept).
        assert_eq!(
            mgr.try_acquire_lock("profile", "org1", Some("u1"), "r3").await.unwrap(),
            LockOutcome::Queued
        );
        let pending = mgr.release("profile", "org1", Some("u1"), "r1").await.unwrap();
        assert_eq!(pending.as_deref(), Some("r3"));

        // Re-run for the pending request then succeeds and releases cleanly.
        assert_eq!(
            mgr.try_acquire_lock("profile", "org1", Some("u1"), "r3").await.unwrap(),
            LockOutcome::Acquired
        );
        assert_eq!(mgr.release("profile", "org1", Some("u1"), "r3").await.unwrap(), None);
    }

    #[tokio::test]
    async fn release_by_non_holder_is_a_no_op() {
        let mgr = manager();
        mgr.try_acquire_lock("profile", "org1", Some("u1"), "r1").await.unwrap();
        let pending = mgr.release("profile", "org1", Some("u1"), "someone-else").await.unwrap();
        assert_eq!(pending, None);
        // Lock is still held by r1.
        assert_eq!(
            mgr.try_acquire_lock("profile", "org1", Some("u1"), "r2").await.unwrap(),
            LockOutcome::Queued
        );
    }

    #[tokio::test]
    async fn bookmark_never_moves_backwards() {
        let mgr = manager();
        mgr.advance_bookmark("profile", "org1", Some("u1"), "e1", "i5", 500).await.unwrap();
        mgr.advance_bookmark("profile", "org1", Some("u1"), "e1", "i3", 300).await.unwrap();
        let bookmark = mgr.get_bookmark("profile", "org1", Some("u1"), "e1").await.unwrap().unwrap();
        assert_eq!(bookmark.last_processed_interaction_id, "i5");
        assert_eq!(bookmark.last_processed_ts, 500);
    }

    #[tokio::test]
    async fn cancellation_is_a_separate_row_from_progress() {
        let mgr = manager();
        mgr.init_progress("versioning", "org1", 3, None).await.unwrap();
        assert!(!mgr.is_cancellation_requested("versioning", "org1").await.unwrap());
        mgr.request_cancellation("versioning", "org1", Some("user requested".into())).await.unwrap();
        assert!(mgr.is_cancellation_requested("versioning", "org1").await.unwrap());
        // Progress is untouched by the cancellation write.
        let progress = mgr.get_progress("versioning", "org1").await.unwrap().unwrap();
        assert_eq!(progress.total_users, 3);
    }

    #[tokio::test]
    async fn cluster_fingerprints_round_trip() {
        let mgr = manager();
        let mut map = HashMap::new();
        map.insert("fp1".to_string(), "feedback1".to_string());
        mgr.replace_cluster_fingerprints("feedback", "org1", "fn_tone", "v1", map.clone())
            .await
            .unwrap();
        let loaded = mgr.get_cluster_fingerprints("feedback", "org1", "fn_tone", "v1").await.unwrap();
        assert_eq!(loaded, map);
    }
}
