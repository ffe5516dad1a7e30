//! ShardFollow Error Types

use thiserror::Error;

use crate::follow::FollowTaskState;
use crate::shard::SeqNo;

/// Result type alias for ShardFollow operations
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classes of failure, used to decide retry and escalation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected synchronously before anything was created
    Precondition,
    /// Network or availability problem, retried with backoff
    Transient,
    /// The follow task cannot continue
    Permanent,
    /// Command addressed to an unknown or wrong-state follower
    User,
    /// Local bookkeeping failure or cancellation
    Internal,
}

/// ShardFollow error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Precondition errors
    #[error("leader index [{leader_index}] does not have soft deletes enabled")]
    RetentionDisabled { leader_index: String },

    #[error("no such index [{0}]")]
    IndexNotFound(String),

    #[error("index [{0}] already exists")]
    IndexAlreadyExists(String),

    #[error("follower index [{0}] is already following a leader index")]
    AlreadyFollowing(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Transient errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    #[error("shard [{index}][{shard}] is not available")]
    ShardUnavailable { index: String, shard: u32 },

    #[error("mapping for index [{0}] has not been propagated yet")]
    MappingNotPropagated(String),

    // Permanent errors
    #[error("no such shard [{index}][{shard}]")]
    ShardNotFound { index: String, shard: u32 },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("operation history for [{index}][{shard}] below seq_no {requested} is no longer retained")]
    HistoryNotRetained { index: String, shard: u32, requested: SeqNo },

    #[error("out of order batch: expected seq_no {expected}, got {got}")]
    OutOfOrderBatch { expected: SeqNo, got: SeqNo },

    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    #[error("index [{0}] is a follower index and cannot be written to directly")]
    FollowerIndexReadOnly(String),

    // User errors
    #[error("follower index [{0}] is not being followed")]
    FollowerNotFound(String),

    #[error("cannot {operation} follower index [{follower_index}] shard [{shard}]: task is {state}")]
    InvalidState {
        follower_index: String,
        shard: u32,
        state: FollowTaskState,
        operation: &'static str,
    },

    // Internal errors
    #[error("State error: {0}")]
    State(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_)
            | Error::ConfigParse(_)
            | Error::RetentionDisabled { .. }
            | Error::IndexNotFound(_)
            | Error::IndexAlreadyExists(_)
            | Error::AlreadyFollowing(_)
            | Error::InvalidRequest(_) => ErrorKind::Precondition,

            Error::Network(_)
            | Error::Timeout { .. }
            | Error::ShardUnavailable { .. }
            | Error::MappingNotPropagated(_) => ErrorKind::Transient,

            Error::ShardNotFound { .. }
            | Error::PermissionDenied(_)
            | Error::HistoryNotRetained { .. }
            | Error::OutOfOrderBatch { .. }
            | Error::RetriesExhausted { .. }
            | Error::FollowerIndexReadOnly(_) => ErrorKind::Permanent,

            Error::FollowerNotFound(_) | Error::InvalidState { .. } => ErrorKind::User,

            Error::State(_) | Error::Io(_) | Error::Cancelled | Error::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Check if this error must stop a follow task.
    ///
    /// Anything that is neither retryable nor a cancellation ends the task:
    /// a checkpoint store failure is as fatal to the pipeline as a vanished leader.
    pub fn is_permanent(&self) -> bool {
        !self.is_retryable() && !matches!(self, Error::Cancelled)
    }

    /// Short machine-readable code, used in API error bodies
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) | Error::ConfigParse(_) => "config_error",
            Error::RetentionDisabled { .. } => "retention_disabled",
            Error::IndexNotFound(_) => "index_not_found",
            Error::IndexAlreadyExists(_) => "index_already_exists",
            Error::AlreadyFollowing(_) => "already_following",
            Error::InvalidRequest(_) => "invalid_request",
            Error::Network(_) => "network_error",
            Error::Timeout { .. } => "timeout",
            Error::ShardUnavailable { .. } => "shard_unavailable",
            Error::MappingNotPropagated(_) => "mapping_not_propagated",
            Error::ShardNotFound { .. } => "shard_not_found",
            Error::PermissionDenied(_) => "permission_denied",
            Error::HistoryNotRetained { .. } => "history_not_retained",
            Error::OutOfOrderBatch { .. } => "out_of_order_batch",
            Error::RetriesExhausted { .. } => "retries_exhausted",
            Error::FollowerIndexReadOnly(_) => "follower_index_read_only",
            Error::FollowerNotFound(_) => "follower_not_found",
            Error::InvalidState { .. } => "invalid_state",
            Error::State(_) => "state_error",
            Error::Io(_) => "io_error",
            Error::Cancelled => "cancelled",
            Error::Internal(_) => "internal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retention_message_names_leader() {
        let err = Error::RetentionDisabled {
            leader_index: "leader-index".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "leader index [leader-index] does not have soft deletes enabled"
        );
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }

    #[test]
    fn test_classification() {
        assert!(Error::Network("reset".into()).is_retryable());
        assert!(Error::ShardUnavailable { index: "a".into(), shard: 0 }.is_retryable());
        assert!(!Error::PermissionDenied("revoked".into()).is_retryable());
        assert!(Error::PermissionDenied("revoked".into()).is_permanent());
        assert!(Error::State("disk full".into()).is_permanent());
        assert!(!Error::Cancelled.is_permanent());
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn test_invalid_state_names_state() {
        let err = Error::InvalidState {
            follower_index: "follower".into(),
            shard: 1,
            state: FollowTaskState::Failed,
            operation: "resume",
        };
        assert_eq!(
            err.to_string(),
            "cannot resume follower index [follower] shard [1]: task is FAILED"
        );
        assert_eq!(err.kind(), ErrorKind::User);
    }
}
