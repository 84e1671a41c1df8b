//! The production `Store` backend: PostgreSQL via `sqlx`.
//!
//! Grounded on the teacher's `checkpoint::postgres::PostgresCheckpointer`:
//! same `PgPoolOptions` connection-pool configuration, the same "a handful
//! of indexed columns plus a `JSONB` payload column" table shape (there, a
//! `state JSONB` column next to `thread_id`; here, `data JSONB` next to the
//! columns every query actually filters on), and the same
//! `initialize_schema` entry point using `table_prefix`-qualified
//! `CREATE TABLE IF NOT EXISTS` statements. The one primitive the teacher's
//! checkpointer never needed — atomic conditional upsert with the prior
//! value returned — is implemented here as a single `sqlx` transaction doing
//! `SELECT ... FOR UPDATE` followed by `INSERT ... ON CONFLICT DO UPDATE`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

use crate::domain::feedback::FeedbackState;
use crate::domain::operation::OperationKind;
use crate::domain::profile::ProfileChangeLog;
use crate::domain::{
    AggregatedFeedback, EvaluationResult, Interaction, ProfileState, Request, RawFeedback,
    Timestamp, UserProfile,
};
use crate::error::Result;

use super::{SearchEntity, SearchQuery, Store};

/// Connection and schema configuration, mirroring the teacher's
/// `checkpoint::postgres::PostgresConfig` field-for-field where the concern
/// is identical (pool sizing, table prefix) and dropping what doesn't apply
/// here (this store has no checkpoint-retention sweep).
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub max_lifetime_secs: u64,
    pub idle_timeout_secs: u64,
    /// Prefixes every table name, so one database can host several
    /// environments (spec §9's guidance against a shared global namespace).
    pub table_prefix: String,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            max_connections: 10,
            min_connections: 1,
            max_lifetime_secs: 1800,
            idle_timeout_secs: 600,
            table_prefix: "reflexio_".to_string(),
        }
    }
}

/// PostgreSQL-backed `Store`. Each entity table carries the handful of
/// columns its own queries filter on (`user_id`, `status`, `agent_version`,
/// `feedback_name`, ...) plus a `data JSONB` column holding the full
/// serialized domain struct, so adding a field to a domain type never
/// requires a migration.
pub struct PostgresStore {
    pool: PgPool,
    table_prefix: String,
}

impl PostgresStore {
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .connect(&config.database_url)
            .await?;
        let store = Self { pool, table_prefix: config.table_prefix.clone() };
        store.initialize_schema().await?;
        Ok(store)
    }

    fn table(&self, name: &str) -> String {
        format!("{}{}", self.table_prefix, name)
    }

    /// Creates every table this store needs if it doesn't already exist.
    /// Idempotent, so it's safe to run on every `connect`.
    async fn initialize_schema(&self) -> Result<()> {
        let statements = [
            format!(
                r#"CREATE TABLE IF NOT EXISTS {} (
                    request_id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    source TEXT NOT NULL,
                    request_group TEXT,
                    created_at BIGINT NOT NULL,
                    data JSONB NOT NULL
                )"#,
                self.table("requests")
            ),
            format!(
                r#"CREATE TABLE IF NOT EXISTS {} (
                    interaction_id TEXT PRIMARY KEY,
                    request_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    created_at BIGINT NOT NULL,
                    seq BIGSERIAL,
                    data JSONB NOT NULL
                )"#,
                self.table("interactions")
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{0}_user_seq ON {0} (user_id, seq)",
                self.table("interactions")
            ),
            format!(
                r#"CREATE TABLE IF NOT EXISTS {} (
                    profile_id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    status TEXT NOT NULL,
                    archived_at BIGINT,
                    data JSONB NOT NULL
                )"#,
                self.table("profiles")
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{0}_user_status ON {0} (user_id, status)",
                self.table("profiles")
            ),
            format!(
                r#"CREATE TABLE IF NOT EXISTS {} (
                    id BIGSERIAL PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    created_at BIGINT NOT NULL,
                    data JSONB NOT NULL
                )"#,
                self.table("profile_change_logs")
            ),
            format!(
                r#"CREATE TABLE IF NOT EXISTS {} (
                    raw_feedback_id TEXT PRIMARY KEY,
                    agent_version TEXT NOT NULL,
                    feedback_name TEXT NOT NULL,
                    status TEXT NOT NULL,
                    archived_at BIGINT,
                    data JSONB NOT NULL
                )"#,
                self.table("raw_feedbacks")
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{0}_version_name_status ON {0} (agent_version, feedback_name, status)",
                self.table("raw_feedbacks")
            ),
            format!(
                r#"CREATE TABLE IF NOT EXISTS {} (
                    feedback_id TEXT PRIMARY KEY,
                    agent_version TEXT NOT NULL,
                    feedback_name TEXT NOT NULL,
                    status TEXT NOT NULL,
                    data JSONB NOT NULL
                )"#,
                self.table("aggregated_feedbacks")
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{0}_version_name_status ON {0} (agent_version, feedback_name, status)",
                self.table("aggregated_feedbacks")
            ),
            format!(
                r#"CREATE TABLE IF NOT EXISTS {} (
                    result_id TEXT PRIMARY KEY,
                    request_id TEXT NOT NULL,
                    data JSONB NOT NULL
                )"#,
                self.table("evaluation_results")
            ),
            format!(
                r#"CREATE TABLE IF NOT EXISTS {} (
                    key TEXT PRIMARY KEY,
                    payload JSONB NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )"#,
                self.table("operation_state")
            ),
        ];

        for statement in &statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    fn decode<T: for<'de> Deserialize<'de>>(row: &PgRow, column: &str) -> Result<T> {
        let value: serde_json::Value = row.try_get(column)?;
        Ok(serde_json::from_value(value)?)
    }

    fn encode<T: Serialize>(value: &T) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(value)?)
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn put_request(&self, request: Request) -> Result<()> {
        let data = Self::encode(&request)?;
        sqlx::query(&format!(
            r#"INSERT INTO {} (request_id, user_id, source, request_group, created_at, data)
               VALUES ($1, $2, $3, $4, $5, $6)
               ON CONFLICT (request_id) DO UPDATE SET data = EXCLUDED.data"#,
            self.table("requests")
        ))
        .bind(&request.request_id)
        .bind(&request.user_id)
        .bind(&request.source)
        .bind(&request.request_group)
        .bind(request.created_at)
        .bind(data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_request(&self, request_id: &str) -> Result<Option<Request>> {
        let row = sqlx::query(&format!("SELECT data FROM {} WHERE request_id = $1", self.table("requests")))
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::decode(&r, "data")).transpose()
    }

    async fn delete_request(&self, request_id: &str) -> Result<()> {
        sqlx::query(&format!("DELETE FROM {} WHERE request_id = $1", self.table("interactions")))
            .bind(request_id)
            .execute(&self.pool)
            .await?;
        sqlx::query(&format!("DELETE FROM {} WHERE request_id = $1", self.table("requests")))
            .bind(request_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_request_group(&self, request_group: &str) -> Result<()> {
        let request_ids: Vec<(String,)> = sqlx::query_as(&format!(
            "SELECT request_id FROM {} WHERE request_group = $1",
            self.table("requests")
        ))
        .bind(request_group)
        .fetch_all(&self.pool)
        .await?;
        for (request_id,) in request_ids {
            self.delete_request(&request_id).await?;
        }
        Ok(())
    }

    async fn put_interactions(&self, interactions: Vec<Interaction>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for interaction in interactions {
            let data = Self::encode(&interaction)?;
            sqlx::query(&format!(
                r#"INSERT INTO {} (interaction_id, request_id, user_id, created_at, data)
                   VALUES ($1, $2, $3, $4, $5)
                   ON CONFLICT (interaction_id) DO NOTHING"#,
                self.table("interactions")
            ))
            .bind(&interaction.interaction_id)
            .bind(&interaction.request_id)
            .bind(&interaction.user_id)
            .bind(interaction.created_at)
            .bind(data)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_interactions_for_request(&self, request_id: &str) -> Result<Vec<Interaction>> {
        let rows = sqlx::query(&format!(
            "SELECT data FROM {} WHERE request_id = $1 ORDER BY seq ASC",
            self.table("interactions")
        ))
        .bind(request_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|r| Self::decode(r, "data")).collect()
    }

    async fn count_new_interactions_since(
        &self,
        user_id: &str,
        source: Option<&str>,
        since_interaction_id: Option<&str>,
    ) -> Result<usize> {
        let since_seq: Option<i64> = match since_interaction_id {
            Some(id) => {
                let row = sqlx::query(&format!("SELECT seq FROM {} WHERE interaction_id = $1", self.table("interactions")))
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?;
                row.map(|r| r.try_get::<i64, _>("seq")).transpose()?
            }
            None => None,
        };

        let sql = format!(
            r#"SELECT COUNT(*) FROM {interactions} i
               JOIN {requests} r ON i.request_id = r.request_id
               WHERE i.user_id = $1
                 AND ($2::text IS NULL OR r.source = $2)
                 AND ($3::bigint IS NULL OR i.seq > $3)"#,
            interactions = self.table("interactions"),
            requests = self.table("requests"),
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(user_id)
            .bind(source)
            .bind(since_seq)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as usize)
    }

    async fn get_interaction_window(
        &self,
        user_id: &str,
        source: Option<&str>,
        window_size: usize,
    ) -> Result<Vec<Interaction>> {
        let sql = format!(
            r#"SELECT i.data FROM {interactions} i
               JOIN {requests} r ON i.request_id = r.request_id
               WHERE i.user_id = $1 AND ($2::text IS NULL OR r.source = $2)
               ORDER BY i.seq DESC
               LIMIT $3"#,
            interactions = self.table("interactions"),
            requests = self.table("requests"),
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .bind(source)
            .bind(window_size as i64)
            .fetch_all(&self.pool)
            .await?;
        let mut window: Vec<Interaction> = rows.iter().map(|r| Self::decode(r, "data")).collect::<Result<_>>()?;
        window.reverse();
        Ok(window)
    }

    async fn put_profile(&self, profile: UserProfile) -> Result<()> {
        let data = Self::encode(&profile)?;
        sqlx::query(&format!(
            r#"INSERT INTO {} (profile_id, user_id, status, archived_at, data)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT (profile_id) DO UPDATE SET
                 status = EXCLUDED.status, archived_at = EXCLUDED.archived_at, data = EXCLUDED.data"#,
            self.table("profiles")
        ))
        .bind(&profile.profile_id)
        .bind(&profile.user_id)
        .bind(status_label(profile.status))
        .bind(profile.archived_at)
        .bind(data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_profile(&self, profile_id: &str) -> Result<Option<UserProfile>> {
        let row = sqlx::query(&format!("SELECT data FROM {} WHERE profile_id = $1", self.table("profiles")))
            .bind(profile_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::decode(&r, "data")).transpose()
    }

    async fn get_profiles_by_status(&self, user_id: &str, status: ProfileState) -> Result<Vec<UserProfile>> {
        let rows = sqlx::query(&format!(
            "SELECT data FROM {} WHERE user_id = $1 AND status = $2",
            self.table("profiles")
        ))
        .bind(user_id)
        .bind(status_label(status))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|r| Self::decode(r, "data")).collect()
    }

    async fn set_profile_status(&self, profile_id: &str, status: ProfileState, archived_at: Option<Timestamp>) -> Result<()> {
        let result = sqlx::query(&format!(
            r#"UPDATE {} SET
                 status = $2,
                 archived_at = CASE WHEN $3::bigint IS NOT NULL THEN $3 ELSE archived_at END,
                 data = jsonb_set(jsonb_set(data, '{{status}}', to_jsonb($2::text)),
                                  '{{archived_at}}', CASE WHEN $3::bigint IS NOT NULL THEN to_jsonb($3::bigint) ELSE data->'archived_at' END)
               WHERE profile_id = $1"#,
            self.table("profiles")
        ))
        .bind(profile_id)
        .bind(status_label(status))
        .bind(archived_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(crate::error::ReflexioError::Store(format!("profile not found: {profile_id}")));
        }
        Ok(())
    }

    async fn soft_delete_current_profile(&self, profile_id: &str, user_id: &str) -> Result<bool> {
        let now = crate::domain::now_ts();
        let result = sqlx::query(&format!(
            r#"UPDATE {} SET
                 status = $4,
                 archived_at = $3,
                 data = jsonb_set(jsonb_set(data, '{{status}}', to_jsonb($4::text)), '{{archived_at}}', to_jsonb($3::bigint))
               WHERE profile_id = $1 AND user_id = $2 AND status = $5"#,
            self.table("profiles")
        ))
        .bind(profile_id)
        .bind(user_id)
        .bind(now)
        .bind(status_label(ProfileState::Archived))
        .bind(status_label(ProfileState::Current))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn append_profile_change_log(&self, log: ProfileChangeLog) -> Result<()> {
        let data = Self::encode(&log)?;
        sqlx::query(&format!(
            "INSERT INTO {} (user_id, created_at, data) VALUES ($1, $2, $3)",
            self.table("profile_change_logs")
        ))
        .bind(&log.user_id)
        .bind(log.created_at)
        .bind(data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_profiles_archived_before(&self, user_id: &str, before: Timestamp) -> Result<()> {
        sqlx::query(&format!(
            "DELETE FROM {} WHERE user_id = $1 AND status = $2 AND (archived_at IS NULL OR archived_at < $3)",
            self.table("profiles")
        ))
        .bind(user_id)
        .bind(status_label(ProfileState::Archived))
        .bind(before)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Only `SearchEntity::Profile` is implemented, matching `InMemoryStore`
    /// (spec §6 names `search` over all four entities; the shared single-
    /// embedding-column scan below generalizes trivially once the other
    /// three entities need it — see DESIGN.md).
    async fn search(&self, query: SearchQuery) -> Result<Vec<UserProfile>> {
        if query.entity != SearchEntity::Profile {
            return Err(crate::error::ReflexioError::Internal(
                "PostgresStore::search only implements profile search".into(),
            ));
        }
        let sql = match &query.user_id {
            Some(_) => format!("SELECT data FROM {} WHERE user_id = $1", self.table("profiles")),
            None => format!("SELECT data FROM {}", self.table("profiles")),
        };
        let rows = match &query.user_id {
            Some(user_id) => sqlx::query(&sql).bind(user_id).fetch_all(&self.pool).await?,
            None => sqlx::query(&sql).fetch_all(&self.pool).await?,
        };
        let candidates: Vec<UserProfile> = rows.iter().map(|r| Self::decode(r, "data")).collect::<Result<_>>()?;

        let mut scored: Vec<(f32, UserProfile)> = candidates
            .into_iter()
            .map(|p| (crate::cluster::cosine_distance(&p.embedding, &query.query_embedding), p))
            .filter(|(distance, _)| *distance <= query.threshold)
            .collect();
        scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(query.top_k);
        Ok(scored.into_iter().map(|(_, p)| p).collect())
    }

    async fn put_raw_feedback(&self, feedback: RawFeedback) -> Result<()> {
        let data = Self::encode(&feedback)?;
        sqlx::query(&format!(
            r#"INSERT INTO {} (raw_feedback_id, agent_version, feedback_name, status, archived_at, data)
               VALUES ($1, $2, $3, $4, $5, $6)
               ON CONFLICT (raw_feedback_id) DO UPDATE SET
                 status = EXCLUDED.status, archived_at = EXCLUDED.archived_at, data = EXCLUDED.data"#,
            self.table("raw_feedbacks")
        ))
        .bind(&feedback.raw_feedback_id)
        .bind(&feedback.agent_version)
        .bind(&feedback.feedback_name)
        .bind(status_label(feedback.status))
        .bind(feedback.archived_at)
        .bind(data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_raw_feedbacks(&self, agent_version: &str, feedback_name: &str, status: FeedbackState) -> Result<Vec<RawFeedback>> {
        let rows = sqlx::query(&format!(
            "SELECT data FROM {} WHERE agent_version = $1 AND feedback_name = $2 AND status = $3",
            self.table("raw_feedbacks")
        ))
        .bind(agent_version)
        .bind(feedback_name)
        .bind(status_label(status))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|r| Self::decode(r, "data")).collect()
    }

    async fn set_raw_feedback_status(&self, raw_feedback_id: &str, status: FeedbackState, archived_at: Option<Timestamp>) -> Result<()> {
        let result = sqlx::query(&format!(
            r#"UPDATE {} SET
                 status = $2,
                 archived_at = CASE WHEN $3::bigint IS NOT NULL THEN $3 ELSE archived_at END,
                 data = jsonb_set(jsonb_set(data, '{{status}}', to_jsonb($2::text)),
                                  '{{archived_at}}', CASE WHEN $3::bigint IS NOT NULL THEN to_jsonb($3::bigint) ELSE data->'archived_at' END)
               WHERE raw_feedback_id = $1"#,
            self.table("raw_feedbacks")
        ))
        .bind(raw_feedback_id)
        .bind(status_label(status))
        .bind(archived_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(crate::error::ReflexioError::Store(format!("raw feedback not found: {raw_feedback_id}")));
        }
        Ok(())
    }

    async fn delete_raw_feedbacks_archived_before(&self, agent_version: &str, before: Timestamp) -> Result<()> {
        sqlx::query(&format!(
            "DELETE FROM {} WHERE agent_version = $1 AND status = $2 AND (archived_at IS NULL OR archived_at < $3)",
            self.table("raw_feedbacks")
        ))
        .bind(agent_version)
        .bind(status_label(ProfileState::Archived))
        .bind(before)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_profile_user_ids(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(&format!(
            "SELECT DISTINCT user_id FROM {} ORDER BY user_id",
            self.table("profiles")
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn list_feedback_names(&self, agent_version: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(&format!(
            "SELECT DISTINCT feedback_name FROM {} WHERE agent_version = $1 ORDER BY feedback_name",
            self.table("raw_feedbacks")
        ))
        .bind(agent_version)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    async fn put_aggregated_feedback(&self, feedback: AggregatedFeedback) -> Result<()> {
        let data = Self::encode(&feedback)?;
        sqlx::query(&format!(
            r#"INSERT INTO {} (feedback_id, agent_version, feedback_name, status, data)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT (feedback_id) DO UPDATE SET
                 status = EXCLUDED.status, data = EXCLUDED.data"#,
            self.table("aggregated_feedbacks")
        ))
        .bind(&feedback.feedback_id)
        .bind(&feedback.agent_version)
        .bind(&feedback.feedback_name)
        .bind(status_label(feedback.status))
        .bind(data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_aggregated_feedback(&self, feedback_id: &str) -> Result<Option<AggregatedFeedback>> {
        let row = sqlx::query(&format!(
            "SELECT data FROM {} WHERE feedback_id = $1",
            self.table("aggregated_feedbacks")
        ))
        .bind(feedback_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| Self::decode(&r, "data")).transpose()
    }

    async fn get_aggregated_feedbacks(&self, agent_version: &str, feedback_name: &str, status: FeedbackState) -> Result<Vec<AggregatedFeedback>> {
        let rows = sqlx::query(&format!(
            "SELECT data FROM {} WHERE agent_version = $1 AND feedback_name = $2 AND status = $3",
            self.table("aggregated_feedbacks")
        ))
        .bind(agent_version)
        .bind(feedback_name)
        .bind(status_label(status))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|r| Self::decode(r, "data")).collect()
    }

    async fn archive_by_ids(&self, ids: &[String]) -> Result<()> {
        let now = crate::domain::now_ts();
        sqlx::query(&format!(
            r#"UPDATE {} SET
                 status = $2,
                 data = jsonb_set(jsonb_set(data, '{{status}}', to_jsonb($2::text)), '{{archived_at}}', to_jsonb($3::bigint))
               WHERE feedback_id = ANY($1)"#,
            self.table("aggregated_feedbacks")
        ))
        .bind(ids)
        .bind(status_label(ProfileState::Archived))
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn restore_by_ids(&self, ids: &[String]) -> Result<()> {
        sqlx::query(&format!(
            r#"UPDATE {} SET
                 status = $2,
                 data = jsonb_set(jsonb_set(data, '{{status}}', to_jsonb($2::text)), '{{archived_at}}', 'null'::jsonb)
               WHERE feedback_id = ANY($1)"#,
            self.table("aggregated_feedbacks")
        ))
        .bind(ids)
        .bind(status_label(ProfileState::Current))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_by_ids(&self, ids: &[String]) -> Result<()> {
        sqlx::query(&format!("DELETE FROM {} WHERE feedback_id = ANY($1)", self.table("aggregated_feedbacks")))
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn put_evaluation_result(&self, result: EvaluationResult) -> Result<()> {
        let data = Self::encode(&result)?;
        sqlx::query(&format!(
            "INSERT INTO {} (result_id, request_id, data) VALUES ($1, $2, $3) ON CONFLICT (result_id) DO UPDATE SET data = EXCLUDED.data",
            self.table("evaluation_results")
        ))
        .bind(&result.result_id)
        .bind(&result.request_id)
        .bind(data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_evaluation_results(&self, request_id: &str) -> Result<Vec<EvaluationResult>> {
        let rows = sqlx::query(&format!(
            "SELECT data FROM {} WHERE request_id = $1",
            self.table("evaluation_results")
        ))
        .bind(request_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|r| Self::decode(r, "data")).collect()
    }

    async fn get_operation_state(&self, key: &str) -> Result<Option<OperationKind>> {
        let row = sqlx::query(&format!("SELECT payload FROM {} WHERE key = $1", self.table("operation_state")))
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::decode(&r, "payload")).transpose()
    }

    /// The atomic primitive every lock/bookmark/progress/cancellation write
    /// builds on (spec §4.7): a single transaction reads the current row
    /// with `FOR UPDATE` (blocking any concurrent upsert on the same key
    /// until this transaction commits), computes `f(prior)`, and writes the
    /// result back via `ON CONFLICT DO UPDATE`.
    async fn upsert_operation_state_with(
        &self,
        key: &str,
        f: Box<dyn FnOnce(Option<OperationKind>) -> OperationKind + Send>,
    ) -> Result<(Option<OperationKind>, OperationKind)> {
        let table = self.table("operation_state");
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!("SELECT payload FROM {table} WHERE key = $1 FOR UPDATE"))
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?;
        let prior: Option<OperationKind> = row.map(|r| Self::decode(&r, "payload")).transpose()?;

        let new_value = f(prior.clone());
        let encoded = Self::encode(&new_value)?;

        sqlx::query(&format!(
            r#"INSERT INTO {table} (key, payload, updated_at) VALUES ($1, $2, NOW())
               ON CONFLICT (key) DO UPDATE SET payload = EXCLUDED.payload, updated_at = NOW()"#
        ))
        .bind(key)
        .bind(&encoded)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((prior, new_value))
    }

    async fn delete_operation_state(&self, key: &str) -> Result<()> {
        sqlx::query(&format!("DELETE FROM {} WHERE key = $1", self.table("operation_state")))
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// The four-state lifecycle enum serializes via serde as `SCREAMING_SNAKE_CASE`
/// for the JSONB payload; indexed columns use the same labels so `WHERE
/// status = $1` and `data->>'status'` always agree.
fn status_label(status: ProfileState) -> &'static str {
    match status {
        ProfileState::Current => "CURRENT",
        ProfileState::Pending => "PENDING",
        ProfileState::Archived => "ARCHIVED",
        ProfileState::ArchiveInProgress => "ARCHIVE_IN_PROGRESS",
    }
}
