// Error taxonomy for the ingestion and session coordination substrate.
//
// Every public method on every component returns `Result<T>` with this error
// type, or emits a typed event on a channel the caller subscribed to. Internal
// causes are never exposed beyond one level of context.

use thiserror::Error;

/// Crate-wide error type.
///
/// Each variant carries a `context` string describing what was being
/// attempted; structured fields are added where callers need to branch on a
/// specific value (e.g. `QueueOverflow`'s depth/threshold).
#[derive(Error, Debug, Clone)]
pub enum IngestError {
    #[error("pipeline is not running: {context}")]
    PipelineNotRunning { context: String },

    #[error("invalid state transition: {context}")]
    InvalidState { context: String },

    #[error("queue overflow: depth {depth} >= threshold {threshold}")]
    QueueOverflow { depth: usize, threshold: usize },

    #[error("connection acquisition timed out after {waited_ms}ms: {context}")]
    AcquireTimeout { waited_ms: u64, context: String },

    #[error("pool is shutting down: {context}")]
    PoolShuttingDown { context: String },

    #[error("worker timed out after {timeout_ms}ms: {context}")]
    WorkerTimeout { timeout_ms: u64, context: String },

    #[error("batch processing failed: {context}")]
    BatchProcessing { context: String },

    #[error("idempotency conflict: {context}")]
    IdempotencyConflict { context: String },

    #[error("dependency DAG deadlocked: {context}")]
    DAGCycleDeadlock { context: String },

    #[error("session already exists: {session_id}")]
    SessionExists { session_id: String },

    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("session expired: {session_id}")]
    SessionExpired { session_id: String },

    #[error("external store unavailable: {context}")]
    StoreUnavailable { context: String },

    #[error("retries exhausted after {attempts} attempts: {context}")]
    RetryExhausted { attempts: u32, context: String },

    #[error("parse error: {context}")]
    ParseError { context: String },

    #[error("validation error: {context}")]
    ValidationError { context: String },

    #[error("operation cancelled: {context}")]
    Cancelled { context: String },
}

impl IngestError {
    /// Stable machine-readable code for the `{code, message, context}` shape
    /// callers are promised at the public-method boundary.
    pub fn code(&self) -> &'static str {
        match self {
            IngestError::PipelineNotRunning { .. } => "PipelineNotRunning",
            IngestError::InvalidState { .. } => "InvalidState",
            IngestError::QueueOverflow { .. } => "QueueOverflow",
            IngestError::AcquireTimeout { .. } => "AcquireTimeout",
            IngestError::PoolShuttingDown { .. } => "PoolShuttingDown",
            IngestError::WorkerTimeout { .. } => "WorkerTimeout",
            IngestError::BatchProcessing { .. } => "BatchProcessing",
            IngestError::IdempotencyConflict { .. } => "IdempotencyConflict",
            IngestError::DAGCycleDeadlock { .. } => "DAGCycleDeadlock",
            IngestError::SessionExists { .. } => "SessionExists",
            IngestError::SessionNotFound { .. } => "SessionNotFound",
            IngestError::SessionExpired { .. } => "SessionExpired",
            IngestError::StoreUnavailable { .. } => "StoreUnavailable",
            IngestError::RetryExhausted { .. } => "RetryExhausted",
            IngestError::ParseError { .. } => "ParseError",
            IngestError::ValidationError { .. } => "ValidationError",
            IngestError::Cancelled { .. } => "Cancelled",
        }
    }

    pub fn invalid_state(context: impl Into<String>) -> Self {
        IngestError::InvalidState { context: context.into() }
    }

    pub fn validation(context: impl Into<String>) -> Self {
        IngestError::ValidationError { context: context.into() }
    }

    pub fn store_unavailable(context: impl Into<String>) -> Self {
        IngestError::StoreUnavailable { context: context.into() }
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;

impl From<serde_json::Error> for IngestError {
    fn from(e: serde_json::Error) -> Self {
        IngestError::ValidationError { context: e.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_is_stable_per_variant() {
        let err = IngestError::QueueOverflow { depth: 101, threshold: 100 };
        assert_eq!(err.code(), "QueueOverflow");
        assert!(err.to_string().contains("101"));
    }
}
