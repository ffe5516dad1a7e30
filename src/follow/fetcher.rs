//! Changes Fetcher
//!
//! Reads operation batches from a leader shard, starting just after the
//! follower's checkpoint, and feeds them to the write buffer in order.

use std::sync::Arc;
use std::time::{Duration, Instant};
use futures::stream::{FuturesOrdered, StreamExt};
use tokio_util::sync::CancellationToken;

use super::{FollowParameters, OperationBatch, RetryPolicy, TaskCounters, WriteBuffer};
use crate::shard::{LeaderCluster, SeqNo, ShardRef};
use crate::error::{Error, Result};

/// Keeps the outstanding-read gauge honest even if a read is abandoned
struct OutstandingRead<'a>(&'a TaskCounters);

impl<'a> OutstandingRead<'a> {
    fn begin(counters: &'a TaskCounters) -> Self {
        counters.read_started();
        Self(counters)
    }
}

impl Drop for OutstandingRead<'_> {
    fn drop(&mut self) {
        self.0.read_finished();
    }
}

/// Leader-side reader for one shard
pub struct ChangesFetcher {
    leader: Arc<dyn LeaderCluster>,
    shard: ShardRef,
    retry: RetryPolicy,
    read_timeout: Duration,
    poll_timeout: Duration,
    max_operations: usize,
    max_outstanding: usize,
    counters: Arc<TaskCounters>,
}

impl ChangesFetcher {
    /// Create a fetcher for `shard`
    pub fn new(
        leader: Arc<dyn LeaderCluster>,
        shard: ShardRef,
        params: &FollowParameters,
        counters: Arc<TaskCounters>,
    ) -> Self {
        Self {
            leader,
            shard,
            retry: params.retry_policy(),
            read_timeout: params.read_timeout(),
            poll_timeout: params.read_poll_timeout(),
            max_operations: params.max_read_request_operation_count,
            max_outstanding: params.max_outstanding_read_requests,
            counters,
        }
    }

    /// Fetch up to `max_count` operations starting at `from_seq_no`,
    /// retrying transient failures. An empty batch means the leader has
    /// nothing that new yet.
    pub async fn fetch(
        &self,
        from_seq_no: SeqNo,
        max_count: usize,
        cancel: &CancellationToken,
    ) -> Result<OperationBatch> {
        let operation = format!("read {} from seq_no {}", self.shard, from_seq_no);
        self.retry
            .run(
                &operation,
                cancel,
                |_| self.counters.record_read_failure(),
                || self.read_once(from_seq_no, max_count),
            )
            .await
    }

    async fn read_once(&self, from_seq_no: SeqNo, max_count: usize) -> Result<OperationBatch> {
        let _outstanding = OutstandingRead::begin(&self.counters);
        let started = Instant::now();

        let response = tokio::time::timeout(
            self.read_timeout,
            self.leader.read_operations(&self.shard, from_seq_no, max_count),
        )
        .await
        .map_err(|_| Error::Timeout {
            operation: format!("read {}", self.shard),
            after_ms: self.read_timeout.as_millis() as u64,
        })??;

        if response.operations.len() > max_count {
            return Err(Error::Network(format!(
                "leader returned {} operations for {} when {} were requested",
                response.operations.len(),
                self.shard,
                max_count
            )));
        }
        for (offset, op) in response.operations.iter().enumerate() {
            let expected = from_seq_no + offset as u64;
            if op.seq_no != expected {
                return Err(Error::Network(format!(
                    "leader returned seq_no {} for {} where {} was expected",
                    op.seq_no, self.shard, expected
                )));
            }
        }

        self.counters
            .record_read(response.operations.len(), response.max_seq_no, started.elapsed());

        let to_seq_no = from_seq_no + response.operations.len() as u64 - 1;
        Ok(OperationBatch {
            from_seq_no,
            to_seq_no,
            operations: response.operations,
            leader_max_seq_no: response.max_seq_no,
        })
    }

    /// Read `[from_seq_no, from_seq_no + count)`, returning the requested
    /// count alongside the batch so short reads can be detected
    async fn fetch_range(
        &self,
        from_seq_no: SeqNo,
        count: u64,
        cancel: &CancellationToken,
    ) -> Result<(u64, OperationBatch)> {
        let batch = self.fetch(from_seq_no, count as usize, cancel).await?;
        Ok((count, batch))
    }

    /// Read loop: tail the leader from `next_seq_no` and offer every
    /// non-empty batch to `buffer` in sequence order until `halt` fires.
    ///
    /// Up to `max_outstanding` reads run concurrently over contiguous
    /// ranges below the leader's last known max seq_no; results are
    /// consumed in issue order. A short read drops the reads issued after
    /// it and restarts right after the last operation received.
    pub async fn run(
        &self,
        next_seq_no: SeqNo,
        buffer: &WriteBuffer,
        halt: &CancellationToken,
    ) -> Result<()> {
        let mut next_issue = next_seq_no;
        let mut leader_max = self.counters.leader_max_seq_no();
        let mut in_flight = FuturesOrdered::new();

        tracing::debug!("Fetcher for {} starting at seq_no {}", self.shard, next_seq_no);

        loop {
            if !halt.is_cancelled() {
                while in_flight.len() < self.max_outstanding {
                    let count = if next_issue <= leader_max {
                        (leader_max - next_issue + 1).min(self.max_operations as u64)
                    } else if in_flight.is_empty() {
                        self.max_operations as u64
                    } else {
                        break;
                    };
                    in_flight.push_back(self.fetch_range(next_issue, count, halt));
                    next_issue += count;
                }
            }

            let Some(result) = in_flight.next().await else {
                // only reachable once halted with nothing in flight
                return Ok(());
            };

            let (requested, batch) = match result {
                Ok(read) => read,
                Err(Error::Cancelled) => return Ok(()),
                Err(e) => {
                    tracing::error!("Fetcher for {} failed: {}", self.shard, e);
                    return Err(e);
                }
            };

            leader_max = leader_max.max(batch.leader_max_seq_no);
            let received = batch.len() as u64;
            let resume_at = batch.from_seq_no + received;
            let caught_up = batch.is_empty();

            if !caught_up {
                tracing::debug!(
                    "Fetched {} operations for {} (seq_no {} to {}), leader max {}",
                    received,
                    self.shard,
                    batch.from_seq_no,
                    batch.to_seq_no,
                    leader_max
                );
                buffer.offer(batch).await?;
            }

            if received < requested {
                in_flight = FuturesOrdered::new();
                next_issue = resume_at;

                if caught_up && !halt.is_cancelled() {
                    tokio::select! {
                        _ = halt.cancelled() => {}
                        _ = tokio::time::sleep(self.poll_timeout) => {}
                    }
                }
            }
        }
    }
}
