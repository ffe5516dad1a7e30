//! Applier
//!
//! Writes buffered batches to the follower shard strictly in sequence
//! order and advances the checkpoint once a write is acknowledged.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::{FollowParameters, OperationBatch, RetryPolicy, TaskCounters};
use crate::error::{Error, Result};
use crate::shard::{FollowerCluster, Operation, ShardRef};
use crate::state::{Checkpoint, CheckpointTracker};

/// Follower-side writer for one shard
pub struct Applier {
    follower: Arc<dyn FollowerCluster>,
    shard: ShardRef,
    tracker: Arc<CheckpointTracker>,
    retry: RetryPolicy,
    write_timeout: Duration,
    counters: Arc<TaskCounters>,
}

impl Applier {
    pub fn new(
        follower: Arc<dyn FollowerCluster>,
        tracker: Arc<CheckpointTracker>,
        params: &FollowParameters,
        counters: Arc<TaskCounters>,
    ) -> Self {
        Self {
            follower,
            shard: tracker.follower().clone(),
            tracker,
            retry: params.retry_policy(),
            write_timeout: params.write_timeout(),
            counters,
        }
    }

    /// Apply `batch` and return the resulting checkpoint.
    ///
    /// Operations at or below the checkpoint are skipped, so re-delivered
    /// batches are harmless. A batch starting beyond the next expected
    /// seq_no is rejected; a gap is never written.
    pub async fn apply(&self, batch: OperationBatch, cancel: &CancellationToken) -> Result<Checkpoint> {
        let checkpoint = self.tracker.checkpoint();
        let expected = checkpoint.next_seq_no();

        if batch.to_seq_no < expected {
            tracing::debug!(
                "Skipping already applied batch {}..={} for {}",
                batch.from_seq_no,
                batch.to_seq_no,
                self.shard
            );
            return Ok(checkpoint);
        }
        if batch.from_seq_no > expected {
            return Err(Error::OutOfOrderBatch {
                expected,
                got: batch.from_seq_no,
            });
        }

        let pending: Vec<Operation> = batch
            .operations
            .into_iter()
            .filter(|op| op.seq_no >= expected)
            .collect();
        let (first, last) = match (pending.first(), pending.last()) {
            (Some(first), Some(last)) => (first.seq_no, last.clone()),
            _ => return Ok(checkpoint),
        };
        if first != expected {
            return Err(Error::OutOfOrderBatch { expected, got: first });
        }

        let started = Instant::now();
        let operation = format!("write {} seq_no {}..={}", self.shard, first, last.seq_no);
        let acked = self
            .retry
            .run(
                &operation,
                cancel,
                |_| self.counters.record_write_failure(),
                || self.write_once(&pending),
            )
            .await?;

        if acked < last.seq_no {
            return Err(Error::Internal(format!(
                "follower {} acknowledged seq_no {} after writing up to {}",
                self.shard, acked, last.seq_no
            )));
        }

        self.counters.record_write(pending.len(), started.elapsed());
        self.tracker
            .advance(Checkpoint {
                seq_no: last.seq_no,
                primary_term: last.primary_term,
            })
            .await
    }

    async fn write_once(&self, operations: &[Operation]) -> Result<u64> {
        tokio::time::timeout(
            self.write_timeout,
            self.follower.apply_operations(&self.shard, operations),
        )
        .await
        .map_err(|_| Error::Timeout {
            operation: format!("write {}", self.shard),
            after_ms: self.write_timeout.as_millis() as u64,
        })?
    }
}
