use thiserror::Error;

/// Result type for Reflexio operations.
pub type Result<T> = std::result::Result<T, ReflexioError>;

/// Crate-wide error type. Variants mirror the error taxonomy of spec §7;
/// each carries exactly the context its recovery policy needs.
#[derive(Error, Debug)]
pub enum ReflexioError {
    /// A store read/write failed. Transient store errors are retried with
    /// backoff by the caller (see `resilience::retry`) before this variant
    /// is ever surfaced.
    #[error("store error: {0}")]
    Store(String),

    /// The LLM client failed (timeout, 5xx, or schema violation). Extractor
    /// and evaluator call sites decide whether this aborts just their unit
    /// of work or the whole service.
    #[error("llm error: {0}")]
    Llm(String),

    /// A publish-time validation failure. Nothing is persisted when this is
    /// returned; callers translate this to a 4xx at the collaborator's HTTP
    /// boundary.
    #[error("validation error: {0}")]
    Validation(String),

    /// The atomic conditional upsert lost a race. The lock primitive itself
    /// absorbs this internally (re-read and retry); it only escapes to a
    /// caller that bypassed the lock helpers.
    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    /// A batch job observed a cancellation request between users and
    /// finalized as `CANCELLED` rather than `FAILED`.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// A lock was held past `STALE_LOCK_TIMEOUT` and was forcibly taken.
    /// Surfaced as a warning-level condition, not a hard failure.
    #[error("stale lock reclaimed: {0}")]
    StaleLock(String),

    /// A unit of work exceeded its deadline (`EXTRACTOR_TIMEOUT`,
    /// `GENERATION_SERVICE_TIMEOUT`, or `PUBLISH_DEADLINE`).
    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// `sqlx` errors surface through `PostgresStore` as retryable store errors —
/// the recovery policy (spec §7's "transient store error" row) doesn't
/// distinguish connection loss from a constraint violation at this layer.
impl From<sqlx::Error> for ReflexioError {
    fn from(e: sqlx::Error) -> Self {
        ReflexioError::Store(e.to_string())
    }
}

impl ReflexioError {
    /// Whether this error represents a retryable condition per the §7
    /// recovery table (transient store error, LLM timeout/5xx).
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReflexioError::Store(_) | ReflexioError::Llm(_) | ReflexioError::Timeout(_))
    }
}
