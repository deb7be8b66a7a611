//! Core error kinds, per spec §7. Adapters and the executor never panic;
//! every fallible operation returns one of these.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("step not found: {0}")]
    StepNotFound(Uuid),

    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("project not found: {0}")]
    ProjectNotFound(Uuid),

    #[error("unknown block kind: {0}")]
    UnknownBlock(String),

    #[error("cycle detected at step {0}")]
    Cycle(Uuid),

    #[error("invalid edge: source step {0} does not exist")]
    InvalidEdge(Uuid),

    #[error("adapter error in step {step_id} ({step_name}, attempt {attempt}): {source}")]
    Adapter {
        step_id: Uuid,
        step_name: String,
        attempt: i64,
        #[source]
        source: anyhow::Error,
    },

    #[error("step {step_id} ({step_name}) timed out after {duration_ms}ms")]
    Timeout {
        step_id: Uuid,
        step_name: String,
        duration_ms: u64,
    },

    #[error("execution cancelled: {0}")]
    Cancelled(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Redis(#[from] redis::RedisError),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// The short error-kind tag persisted alongside a failed step/run, e.g.
    /// `"timeout"` per spec §5's timeout error category.
    pub fn category(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "validation",
            CoreError::StepNotFound(_) => "not_found",
            CoreError::RunNotFound(_) => "not_found",
            CoreError::ProjectNotFound(_) => "not_found",
            CoreError::UnknownBlock(_) => "not_found",
            CoreError::Cycle(_) => "cycle",
            CoreError::InvalidEdge(_) => "validation",
            CoreError::Adapter { .. } => "adapter",
            CoreError::Timeout { .. } => "timeout",
            CoreError::Cancelled(_) => "cancelled",
            CoreError::Internal(_) => "internal",
            CoreError::Sqlx(_) => "internal",
            CoreError::Redis(_) => "internal",
        }
    }
}
