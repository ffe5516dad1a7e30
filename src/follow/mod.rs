//! Follow Module
//!
//! Per-shard follow tasks: the fetch -> buffer -> apply pipeline, its
//! lifecycle, and the coordinator that fans follow relationships out
//! into one task per shard.

pub mod retry;
pub mod retention;
mod fetcher;
mod buffer;
mod applier;
mod task;
mod stats;
mod coordinator;
#[cfg(test)]
mod testing;

pub use retry::RetryPolicy;
pub use retention::RetentionGuard;
pub use fetcher::ChangesFetcher;
pub use buffer::{WriteBuffer, Discarded};
pub use applier::Applier;
pub use task::ShardFollowTask;
pub use stats::{StatsAggregator, StatsSnapshot, TaskCounters};
pub use coordinator::{Coordinator, FollowInfo, PutFollowRequest};

use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::shard::{Operation, SeqNo, ShardRef};

/// Tunable parameters of a follow relationship
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowParameters {
    /// Maximum operations per leader read
    #[serde(default = "default_max_read_request_operation_count")]
    pub max_read_request_operation_count: usize,

    /// Maximum concurrent leader reads per shard
    #[serde(default = "default_max_outstanding_read_requests")]
    pub max_outstanding_read_requests: usize,

    /// Maximum batches held in the write buffer
    #[serde(default = "default_max_write_buffer_count")]
    pub max_write_buffer_count: usize,

    /// Maximum operations held in the write buffer
    #[serde(default = "default_max_write_buffer_size")]
    pub max_write_buffer_size: usize,

    /// Idle time before re-reading a leader shard that had nothing new
    #[serde(default = "default_read_poll_timeout_ms")]
    pub read_poll_timeout_ms: u64,

    /// Timeout of a single leader read attempt
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Timeout of a single follower write attempt
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Attempts per read or write before the task fails
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    /// First backoff delay
    #[serde(default = "default_initial_retry_delay_ms")]
    pub initial_retry_delay_ms: u64,

    /// Backoff delay cap
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
}

fn default_max_read_request_operation_count() -> usize {
    5120
}

fn default_max_outstanding_read_requests() -> usize {
    12
}

fn default_max_write_buffer_count() -> usize {
    64
}

fn default_max_write_buffer_size() -> usize {
    10240
}

fn default_read_poll_timeout_ms() -> u64 {
    1000
}

fn default_read_timeout_ms() -> u64 {
    30_000
}

fn default_write_timeout_ms() -> u64 {
    30_000
}

fn default_max_retry_attempts() -> u32 {
    16
}

fn default_initial_retry_delay_ms() -> u64 {
    50
}

fn default_max_retry_delay_ms() -> u64 {
    500
}

impl Default for FollowParameters {
    fn default() -> Self {
        Self {
            max_read_request_operation_count: default_max_read_request_operation_count(),
            max_outstanding_read_requests: default_max_outstanding_read_requests(),
            max_write_buffer_count: default_max_write_buffer_count(),
            max_write_buffer_size: default_max_write_buffer_size(),
            read_poll_timeout_ms: default_read_poll_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            max_retry_attempts: default_max_retry_attempts(),
            initial_retry_delay_ms: default_initial_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
        }
    }
}

impl FollowParameters {
    /// Check that every limit is usable
    pub fn validate(&self) -> crate::Result<()> {
        let counts = [
            ("max_read_request_operation_count", self.max_read_request_operation_count),
            ("max_outstanding_read_requests", self.max_outstanding_read_requests),
            ("max_write_buffer_count", self.max_write_buffer_count),
            ("max_write_buffer_size", self.max_write_buffer_size),
            ("max_retry_attempts", self.max_retry_attempts as usize),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(crate::Error::InvalidRequest(format!(
                    "{} must be at least 1",
                    name
                )));
            }
        }

        if self.read_timeout_ms == 0 || self.write_timeout_ms == 0 {
            return Err(crate::Error::InvalidRequest(
                "read_timeout_ms and write_timeout_ms must be positive".into(),
            ));
        }

        if self.max_retry_delay_ms < self.initial_retry_delay_ms {
            return Err(crate::Error::InvalidRequest(format!(
                "max_retry_delay_ms ({}) must not be below initial_retry_delay_ms ({})",
                self.max_retry_delay_ms, self.initial_retry_delay_ms
            )));
        }

        Ok(())
    }

    /// Retry policy shared by the fetcher and the applier
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retry_attempts,
            initial_backoff: Duration::from_millis(self.initial_retry_delay_ms),
            max_backoff: Duration::from_millis(self.max_retry_delay_ms),
            ..RetryPolicy::default()
        }
    }

    pub fn read_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.read_poll_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Per-request overrides; unset fields fall back to a base set of parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FollowParametersUpdate {
    #[serde(default)]
    pub max_read_request_operation_count: Option<usize>,
    #[serde(default)]
    pub max_outstanding_read_requests: Option<usize>,
    #[serde(default)]
    pub max_write_buffer_count: Option<usize>,
    #[serde(default)]
    pub max_write_buffer_size: Option<usize>,
    #[serde(default)]
    pub read_poll_timeout_ms: Option<u64>,
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,
    #[serde(default)]
    pub write_timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_retry_attempts: Option<u32>,
    #[serde(default)]
    pub initial_retry_delay_ms: Option<u64>,
    #[serde(default)]
    pub max_retry_delay_ms: Option<u64>,
}

impl FollowParametersUpdate {
    /// Overlay these overrides on `base`
    pub fn apply_to(&self, base: &FollowParameters) -> FollowParameters {
        FollowParameters {
            max_read_request_operation_count: self
                .max_read_request_operation_count
                .unwrap_or(base.max_read_request_operation_count),
            max_outstanding_read_requests: self
                .max_outstanding_read_requests
                .unwrap_or(base.max_outstanding_read_requests),
            max_write_buffer_count: self
                .max_write_buffer_count
                .unwrap_or(base.max_write_buffer_count),
            max_write_buffer_size: self.max_write_buffer_size.unwrap_or(base.max_write_buffer_size),
            read_poll_timeout_ms: self.read_poll_timeout_ms.unwrap_or(base.read_poll_timeout_ms),
            read_timeout_ms: self.read_timeout_ms.unwrap_or(base.read_timeout_ms),
            write_timeout_ms: self.write_timeout_ms.unwrap_or(base.write_timeout_ms),
            max_retry_attempts: self.max_retry_attempts.unwrap_or(base.max_retry_attempts),
            initial_retry_delay_ms: self
                .initial_retry_delay_ms
                .unwrap_or(base.initial_retry_delay_ms),
            max_retry_delay_ms: self.max_retry_delay_ms.unwrap_or(base.max_retry_delay_ms),
        }
    }
}

/// Lifecycle state of a follow task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FollowTaskState {
    /// Created, pipeline not yet running
    Starting,
    /// Fetching and applying leader operations
    Following,
    /// Drained and idle until resumed
    Paused,
    /// Stopped by a non-retryable error
    Failed,
    /// Removed
    Stopped,
}

impl FollowTaskState {
    /// Whether the state machine permits moving from `self` to `next`
    pub fn can_transition_to(self, next: FollowTaskState) -> bool {
        use FollowTaskState::*;
        matches!(
            (self, next),
            (Starting, Following)
                | (Following, Paused)
                | (Paused, Following)
                | (Following, Failed)
                | (Paused, Failed)
                | (Starting, Stopped)
                | (Following, Stopped)
                | (Paused, Stopped)
        )
    }

    /// FAILED and STOPPED accept no further transitions
    pub fn is_terminal(self) -> bool {
        matches!(self, FollowTaskState::Failed | FollowTaskState::Stopped)
    }
}

impl std::fmt::Display for FollowTaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FollowTaskState::Starting => write!(f, "STARTING"),
            FollowTaskState::Following => write!(f, "FOLLOWING"),
            FollowTaskState::Paused => write!(f, "PAUSED"),
            FollowTaskState::Failed => write!(f, "FAILED"),
            FollowTaskState::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// One directed leader shard -> follower shard replication link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardPairing {
    pub leader: ShardRef,
    pub follower: ShardRef,
    pub leader_index_uuid: uuid::Uuid,
}

impl std::fmt::Display for ShardPairing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.leader, self.follower)
    }
}

/// Contiguous run of leader operations covering `[from_seq_no, to_seq_no]`
#[derive(Debug, Clone)]
pub struct OperationBatch {
    pub from_seq_no: SeqNo,
    pub to_seq_no: SeqNo,
    pub operations: Vec<Operation>,
    /// Leader's highest seq_no when this batch was read
    pub leader_max_seq_no: SeqNo,
}

impl OperationBatch {
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use FollowTaskState::*;
        assert!(Starting.can_transition_to(Following));
        assert!(Following.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Following));
        assert!(Paused.can_transition_to(Failed));
        assert!(Following.can_transition_to(Stopped));

        assert!(!Failed.can_transition_to(Following));
        assert!(!Stopped.can_transition_to(Following));
        assert!(!Starting.can_transition_to(Paused));
        assert!(!Failed.can_transition_to(Stopped));
        assert!(Failed.is_terminal() && Stopped.is_terminal());
        assert!(!Paused.is_terminal());
    }

    #[test]
    fn test_parameter_overrides() {
        let base = FollowParameters::default();
        let update = FollowParametersUpdate {
            max_read_request_operation_count: Some(10),
            read_poll_timeout_ms: Some(5),
            ..Default::default()
        };
        let params = update.apply_to(&base);
        assert_eq!(params.max_read_request_operation_count, 10);
        assert_eq!(params.read_poll_timeout_ms, 5);
        assert_eq!(params.max_write_buffer_size, base.max_write_buffer_size);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_parameter_validation() {
        let mut params = FollowParameters::default();
        params.max_write_buffer_count = 0;
        assert!(params.validate().is_err());

        let mut params = FollowParameters::default();
        params.initial_retry_delay_ms = 1000;
        params.max_retry_delay_ms = 10;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_state_serializes_upper_case() {
        let json = serde_json::to_string(&FollowTaskState::Following).unwrap();
        assert_eq!(json, "\"FOLLOWING\"");
    }
}
