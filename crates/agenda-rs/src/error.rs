//! Unified error taxonomy for the scheduler engine.

use thiserror::Error;

/// Result type for fallible agenda operations.
pub type AgendaResult<T> = Result<T, AgendaError>;

/// Errors surfaced by the scheduler, executor, recurrence calculator and
/// the repository/notification backends.
///
/// `LockContentionMiss` deliberately has no variant here: failing to win a
/// claim is an expected outcome of `getNextJobToRun`/`lockJobById` and is
/// represented as `Ok(None)`, not an error, at the repository boundary.
#[derive(Debug, Error)]
pub enum AgendaError {
    /// `repeatInterval`/`repeatAt` did not parse as cron, human interval or
    /// clock phrase.
    #[error("invalid recurrence for job {name:?}: {reason}")]
    InvalidRecurrence { name: String, reason: String },

    /// The repository or notification backend is unreachable.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A job was dispatched locally but its lock had already expired by the
    /// time the executor reached it.
    #[error("lock expired for job {0}")]
    LockExpired(String),

    /// The registered handler returned an error.
    #[error("handler for {name:?} failed: {source}")]
    Handler {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// `drain` did not observe `running == 0` within its timeout.
    #[error("drain timed out after {0:?}")]
    DrainTimeout(std::time::Duration),

    /// `drain` was cancelled via its abort signal before completing.
    #[error("drain aborted")]
    DrainAborted,

    /// `saveJobState` raced a concurrent `cancel`/`purge` and lost.
    #[error("job {0} was modified or removed concurrently")]
    StaleJob(String),

    /// A name, query fragment or option combination that the orchestrator
    /// refuses to guess at (e.g. an empty `unique` fragment).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Serialization of job payloads or notification events failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "redis-backend")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[cfg(feature = "redis-backend")]
    #[error("redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),
}

impl AgendaError {
    /// True for errors the scheduler should just log and keep running past
    /// (§7's "Runtime errors are always funneled to the `error` event").
    pub fn is_runtime(&self) -> bool {
        !matches!(self, AgendaError::Configuration(_))
    }
}
