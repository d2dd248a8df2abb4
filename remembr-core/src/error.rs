use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::embeddings::EmbeddingError;
use crate::tenancy::AuthorityLevel;

/// Stage of a cascading forget operation. Carried by
/// [`MemoryError::PartialDeletionFailure`] so callers know where to resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionStage {
    /// Episodes, embeddings, checkpoints and the session row.
    EpisodicStore,
    /// The session's short-term window in the fast tier.
    ShortTermWindow,
    /// Sessionless episodes owned by a user.
    UserEpisodes,
}

impl std::fmt::Display for DeletionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeletionStage::EpisodicStore => "episodic_store",
            DeletionStage::ShortTermWindow => "short_term_window",
            DeletionStage::UserEpisodes => "user_episodes",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Scope violation: operation bound to org {expected_org} touched org {actual_org}")]
    ScopeViolation { expected_org: Uuid, actual_org: Uuid },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("Session {0} not found")]
    SessionNotFound(Uuid),

    #[error("Checkpoint {checkpoint_id} not found for session {session_id}")]
    CheckpointNotFound { session_id: Uuid, checkpoint_id: Uuid },

    #[error("Invalid time range: from {from} is after to {to}")]
    InvalidTimeRange {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },

    #[error("Invalid limit {0}: must be at least 1")]
    InvalidLimit(i64),

    #[error("Dimension mismatch for model {model}: expected {expected}, got {actual}")]
    DimensionMismatch {
        model: String,
        expected: usize,
        actual: usize,
    },

    #[error("Unknown embedding model: {0}")]
    UnknownModel(String),

    #[error("Embedding provider unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("Insufficient authority: {required:?} required, caller has {actual:?}")]
    AuthorityInsufficient {
        required: AuthorityLevel,
        actual: AuthorityLevel,
    },

    #[error("Partial deletion of {target}: stage {stage} failed after {completed} completed stage(s): {reason}")]
    PartialDeletionFailure {
        target: Uuid,
        stage: DeletionStage,
        completed: usize,
        reason: String,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("Database error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Stable, machine-readable error kind for callers that map errors onto
/// transport status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ScopeViolation,
    NotFound,
    InvalidInput,
    DimensionMismatch,
    EmbeddingUnavailable,
    AuthorityInsufficient,
    PartialDeletionFailure,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ScopeViolation => "scope_violation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::DimensionMismatch => "dimension_mismatch",
            ErrorKind::EmbeddingUnavailable => "embedding_unavailable",
            ErrorKind::AuthorityInsufficient => "authority_insufficient",
            ErrorKind::PartialDeletionFailure => "partial_deletion_failure",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

impl MemoryError {
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        MemoryError::NotFound { entity, id }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            MemoryError::ScopeViolation { .. } => ErrorKind::ScopeViolation,
            MemoryError::NotFound { .. }
            | MemoryError::SessionNotFound(_)
            | MemoryError::CheckpointNotFound { .. } => ErrorKind::NotFound,
            MemoryError::InvalidTimeRange { .. }
            | MemoryError::InvalidLimit(_)
            | MemoryError::UnknownModel(_) => ErrorKind::InvalidInput,
            MemoryError::DimensionMismatch { .. } => ErrorKind::DimensionMismatch,
            MemoryError::EmbeddingUnavailable(_) => ErrorKind::EmbeddingUnavailable,
            MemoryError::AuthorityInsufficient { .. } => ErrorKind::AuthorityInsufficient,
            MemoryError::PartialDeletionFailure { .. } => ErrorKind::PartialDeletionFailure,
            MemoryError::Cancelled => ErrorKind::Cancelled,
            MemoryError::Storage(_)
            | MemoryError::Timeout { .. }
            | MemoryError::Backend(_)
            | MemoryError::Config(_)
            | MemoryError::Serialization(_) => ErrorKind::Internal,
        }
    }

    /// Transient infrastructure failures that a bounded local retry may fix.
    /// Scope, input and contract errors are never transient.
    pub fn is_transient(&self) -> bool {
        match self {
            MemoryError::Storage(e) => is_transient_sqlx(e),
            MemoryError::Timeout { .. } => true,
            _ => false,
        }
    }
}

/// Connection-level failures and serialization conflicts are retryable;
/// constraint violations and malformed queries are not.
pub fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Tls(_) => true,
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            // connection exceptions, serialization failure, deadlock, admin shutdown
            Some("08000" | "08003" | "08006" | "08001" | "08004" | "40001" | "40P01" | "57P01")
        ),
        _ => false,
    }
}

impl From<EmbeddingError> for MemoryError {
    fn from(err: EmbeddingError) -> Self {
        match err {
            EmbeddingError::InvalidDimensions {
                model,
                expected,
                actual,
            } => MemoryError::DimensionMismatch {
                model,
                expected,
                actual,
            },
            other => MemoryError::EmbeddingUnavailable(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, MemoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_groups_not_found_variants() {
        let id = Uuid::new_v4();
        assert_eq!(MemoryError::not_found("episode", id).kind(), ErrorKind::NotFound);
        assert_eq!(MemoryError::SessionNotFound(id).kind(), ErrorKind::NotFound);
        assert_eq!(
            MemoryError::CheckpointNotFound {
                session_id: id,
                checkpoint_id: id
            }
            .kind()
            .as_str(),
            "not_found"
        );
    }

    #[test]
    fn test_scope_violation_is_never_transient() {
        let err = MemoryError::ScopeViolation {
            expected_org: Uuid::new_v4(),
            actual_org: Uuid::new_v4(),
        };
        assert!(!err.is_transient());
        assert_eq!(err.kind(), ErrorKind::ScopeViolation);
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        assert!(MemoryError::Storage(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!MemoryError::Storage(sqlx::Error::RowNotFound).is_transient());
    }

    #[test]
    fn test_embedding_dimension_error_maps_to_dimension_mismatch() {
        let err: MemoryError = EmbeddingError::InvalidDimensions {
            model: "jina-embeddings-v3".to_string(),
            expected: 1024,
            actual: 3,
        }
        .into();
        assert!(matches!(
            err,
            MemoryError::DimensionMismatch { expected: 1024, actual: 3, .. }
        ));
    }

    #[test]
    fn test_partial_deletion_message_names_stage() {
        let err = MemoryError::PartialDeletionFailure {
            target: Uuid::nil(),
            stage: DeletionStage::ShortTermWindow,
            completed: 1,
            reason: "fast tier offline".to_string(),
        };
        assert!(err.to_string().contains("short_term_window"));
    }
}
