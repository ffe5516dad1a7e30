//! Follow Stats
//!
//! Live per-task counters and the snapshot view answered to stats queries.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use serde::{Deserialize, Serialize};

use super::{FollowTaskState, ShardFollowTask};
use crate::shard::SeqNo;

/// Atomic counters of one follow task, updated lock-free by its pipeline
#[derive(Debug, Default)]
pub struct TaskCounters {
    operations_received: AtomicU64,
    operations_applied: AtomicU64,
    successful_read_requests: AtomicU64,
    failed_read_requests: AtomicU64,
    successful_write_requests: AtomicU64,
    failed_write_requests: AtomicU64,
    outstanding_read_requests: AtomicU64,
    total_read_time_millis: AtomicU64,
    total_write_time_millis: AtomicU64,
    leader_max_seq_no: AtomicU64,
    /// Wall clock of the last successful read, epoch millis (0 = never)
    last_read_at_millis: AtomicI64,
    last_failure_reason: Mutex<Option<String>>,
}

impl TaskCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_started(&self) {
        self.outstanding_read_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn read_finished(&self) {
        self.outstanding_read_requests.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_read(&self, operations: usize, leader_max_seq_no: SeqNo, elapsed: Duration) {
        self.successful_read_requests.fetch_add(1, Ordering::Relaxed);
        self.operations_received.fetch_add(operations as u64, Ordering::Relaxed);
        self.total_read_time_millis
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        self.leader_max_seq_no.fetch_max(leader_max_seq_no, Ordering::Relaxed);
        self.last_read_at_millis
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn record_read_failure(&self) {
        self.failed_read_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self, operations: usize, elapsed: Duration) {
        self.successful_write_requests.fetch_add(1, Ordering::Relaxed);
        self.operations_applied.fetch_add(operations as u64, Ordering::Relaxed);
        self.total_write_time_millis
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_write_failure(&self) {
        self.failed_write_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_failure(&self, reason: String) {
        *self
            .last_failure_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reason);
    }

    pub fn failure_reason(&self) -> Option<String> {
        self.last_failure_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn operations_received(&self) -> u64 {
        self.operations_received.load(Ordering::Relaxed)
    }

    pub fn operations_applied(&self) -> u64 {
        self.operations_applied.load(Ordering::Relaxed)
    }

    pub fn failed_read_requests(&self) -> u64 {
        self.failed_read_requests.load(Ordering::Relaxed)
    }

    pub fn leader_max_seq_no(&self) -> SeqNo {
        self.leader_max_seq_no.load(Ordering::Relaxed)
    }
}

/// Point-in-time progress of one follow task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub follower_index: String,
    pub leader_index: String,
    pub shard_id: u32,
    pub state: FollowTaskState,
    pub last_applied_seq_no: SeqNo,
    pub last_applied_primary_term: u64,
    pub leader_max_seq_no: SeqNo,
    /// Operations the follower is behind the leader's last observed seq_no
    pub lag: u64,
    pub operations_received: u64,
    pub operations_applied: u64,
    pub fetch_failure_count: u64,
    pub successful_read_requests: u64,
    pub successful_write_requests: u64,
    pub failed_write_requests: u64,
    pub outstanding_read_requests: u64,
    pub write_buffer_batch_count: u64,
    pub write_buffer_operation_count: u64,
    pub total_read_time_millis: u64,
    pub total_write_time_millis: u64,
    pub time_since_last_read_millis: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_reason: Option<String>,
    pub taken_at: chrono::DateTime<chrono::Utc>,
}

impl StatsSnapshot {
    pub(crate) fn build(
        task: &ShardFollowTask,
        counters: &TaskCounters,
        buffered: (u64, u64),
    ) -> Self {
        let pairing = task.pairing();
        let checkpoint = task.checkpoint();
        let leader_max_seq_no = counters.leader_max_seq_no().max(checkpoint.seq_no);
        let now = chrono::Utc::now();
        let last_read = counters.last_read_at_millis.load(Ordering::Relaxed);

        Self {
            follower_index: pairing.follower.index.clone(),
            leader_index: pairing.leader.index.clone(),
            shard_id: pairing.follower.shard,
            state: task.state(),
            last_applied_seq_no: checkpoint.seq_no,
            last_applied_primary_term: checkpoint.primary_term,
            leader_max_seq_no,
            lag: leader_max_seq_no - checkpoint.seq_no,
            operations_received: counters.operations_received(),
            operations_applied: counters.operations_applied(),
            fetch_failure_count: counters.failed_read_requests(),
            successful_read_requests: counters.successful_read_requests.load(Ordering::Relaxed),
            successful_write_requests: counters.successful_write_requests.load(Ordering::Relaxed),
            failed_write_requests: counters.failed_write_requests.load(Ordering::Relaxed),
            outstanding_read_requests: counters.outstanding_read_requests.load(Ordering::Relaxed),
            write_buffer_batch_count: buffered.0,
            write_buffer_operation_count: buffered.1,
            total_read_time_millis: counters.total_read_time_millis.load(Ordering::Relaxed),
            total_write_time_millis: counters.total_write_time_millis.load(Ordering::Relaxed),
            time_since_last_read_millis: (last_read > 0)
                .then(|| (now.timestamp_millis() - last_read).max(0) as u64),
            last_failure_reason: counters.failure_reason(),
            taken_at: now,
        }
    }
}

/// Answers stats queries over a set of follow tasks
pub struct StatsAggregator;

impl StatsAggregator {
    /// One snapshot per task whose follower index is named in `filter`,
    /// or per task when the filter is absent or empty. Each snapshot is
    /// read independently; ordering is unspecified.
    pub fn query<'a>(
        tasks: impl IntoIterator<Item = &'a Arc<ShardFollowTask>>,
        filter: Option<&[String]>,
    ) -> Vec<StatsSnapshot> {
        let filter = filter.filter(|names| !names.is_empty());
        tasks
            .into_iter()
            .filter(|task| match filter {
                Some(names) => names.iter().any(|n| n == task.follower_index()),
                None => true,
            })
            .map(|task| task.stats())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let counters = TaskCounters::new();
        counters.read_started();
        counters.record_read(10, 25, Duration::from_millis(3));
        counters.read_finished();
        counters.record_read(5, 20, Duration::from_millis(2));
        counters.record_read_failure();
        counters.record_write(15, Duration::from_millis(4));

        assert_eq!(counters.operations_received(), 15);
        assert_eq!(counters.operations_applied(), 15);
        assert_eq!(counters.failed_read_requests(), 1);
        // leader max only moves forward
        assert_eq!(counters.leader_max_seq_no(), 25);
        assert_eq!(counters.outstanding_read_requests.load(Ordering::Relaxed), 0);
        assert_eq!(counters.total_read_time_millis.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn test_failure_reason() {
        let counters = TaskCounters::new();
        assert!(counters.failure_reason().is_none());
        counters.set_failure("no such index [leader]".into());
        assert_eq!(counters.failure_reason().as_deref(), Some("no such index [leader]"));
    }
}
