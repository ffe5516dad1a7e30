//! Write Buffer
//!
//! Bounded FIFO between the changes fetcher and the applier. Capacity is
//! counted both in batches and in operations; a full buffer suspends the
//! producer instead of dropping or reordering anything.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

use super::OperationBatch;
use crate::error::{Error, Result};

/// A buffered batch together with the capacity it occupies
struct Buffered {
    batch: OperationBatch,
    _batch_slot: OwnedSemaphorePermit,
    _operation_slots: OwnedSemaphorePermit,
}

/// What `discard` threw away
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Discarded {
    pub batches: usize,
    pub operations: usize,
}

/// Bounded batch buffer with backpressure
pub struct WriteBuffer {
    batch_slots: Arc<Semaphore>,
    operation_slots: Arc<Semaphore>,
    max_operations: u32,
    queue: Mutex<VecDeque<Buffered>>,
    not_empty: Notify,
    closed: AtomicBool,
    batch_count: AtomicU64,
    operation_count: AtomicU64,
}

impl WriteBuffer {
    /// Create a buffer holding at most `max_batches` batches and
    /// `max_operations` operations
    pub fn new(max_batches: usize, max_operations: usize) -> Self {
        let max_batches = max_batches.clamp(1, Semaphore::MAX_PERMITS);
        let max_operations = max_operations.clamp(1, u32::MAX as usize) as u32;
        Self {
            batch_slots: Arc::new(Semaphore::new(max_batches)),
            operation_slots: Arc::new(Semaphore::new(max_operations as usize)),
            max_operations,
            queue: Mutex::new(VecDeque::new()),
            not_empty: Notify::new(),
            closed: AtomicBool::new(false),
            batch_count: AtomicU64::new(0),
            operation_count: AtomicU64::new(0),
        }
    }

    /// Add a batch, waiting while the buffer is full. A batch larger than
    /// the operation limit waits for an empty buffer and is then admitted.
    /// Fails with `Cancelled` once the buffer is closed.
    pub async fn offer(&self, batch: OperationBatch) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Cancelled);
        }

        let operations = batch.len();
        let wanted = (operations.max(1) as u64).min(self.max_operations as u64) as u32;

        let batch_slot = Arc::clone(&self.batch_slots)
            .acquire_owned()
            .await
            .map_err(|_| Error::Cancelled)?;
        let operation_slots = Arc::clone(&self.operation_slots)
            .acquire_many_owned(wanted)
            .await
            .map_err(|_| Error::Cancelled)?;

        {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            if self.is_closed() {
                return Err(Error::Cancelled);
            }
            queue.push_back(Buffered {
                batch,
                _batch_slot: batch_slot,
                _operation_slots: operation_slots,
            });
            self.batch_count.fetch_add(1, Ordering::Relaxed);
            self.operation_count.fetch_add(operations as u64, Ordering::Relaxed);
        }

        self.not_empty.notify_one();
        Ok(())
    }

    /// Next batch in arrival order; waits while empty. Returns `None` once
    /// the buffer is closed and fully drained.
    ///
    /// Single consumer: only the applier takes from a buffer.
    pub async fn take(&self) -> Option<OperationBatch> {
        loop {
            {
                let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(buffered) = queue.pop_front() {
                    self.batch_count.fetch_sub(1, Ordering::Relaxed);
                    self.operation_count
                        .fetch_sub(buffered.batch.len() as u64, Ordering::Relaxed);
                    return Some(buffered.batch);
                }
                if self.is_closed() {
                    return None;
                }
            }
            self.not_empty.notified().await;
        }
    }

    /// Stop accepting batches. Pending offers fail; what is already
    /// buffered can still be taken.
    pub fn close(&self) {
        {
            let _queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            self.closed.store(true, Ordering::Release);
        }
        self.batch_slots.close();
        self.operation_slots.close();
        self.not_empty.notify_one();
    }

    /// Drop everything buffered without applying it
    pub fn discard(&self) -> Discarded {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let mut discarded = Discarded::default();
        for buffered in queue.drain(..) {
            discarded.batches += 1;
            discarded.operations += buffered.batch.len();
        }
        self.batch_count.store(0, Ordering::Relaxed);
        self.operation_count.store(0, Ordering::Relaxed);
        discarded
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of buffered batches
    pub fn batch_count(&self) -> u64 {
        self.batch_count.load(Ordering::Relaxed)
    }

    /// Number of buffered operations
    pub fn operation_count(&self) -> u64 {
        self.operation_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::shard::{Operation, OperationKind, SeqNo};

    fn batch(from: SeqNo, to: SeqNo) -> OperationBatch {
        let operations = (from..=to)
            .map(|seq_no| Operation {
                seq_no,
                primary_term: 1,
                id: format!("doc-{}", seq_no),
                kind: OperationKind::Delete,
            })
            .collect();
        OperationBatch {
            from_seq_no: from,
            to_seq_no: to,
            operations,
            leader_max_seq_no: to,
        }
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let buffer = WriteBuffer::new(10, 100);
        buffer.offer(batch(1, 3)).await.unwrap();
        buffer.offer(batch(4, 4)).await.unwrap();
        assert_eq!(buffer.batch_count(), 2);
        assert_eq!(buffer.operation_count(), 4);

        assert_eq!(buffer.take().await.unwrap().from_seq_no, 1);
        assert_eq!(buffer.take().await.unwrap().from_seq_no, 4);
        assert_eq!(buffer.operation_count(), 0);
    }

    #[tokio::test]
    async fn test_full_buffer_suspends_producer() {
        let buffer = Arc::new(WriteBuffer::new(10, 5));
        buffer.offer(batch(1, 4)).await.unwrap();

        let producer = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.offer(batch(5, 7)).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished());
        assert_eq!(buffer.batch_count(), 1);

        assert_eq!(buffer.take().await.unwrap().to_seq_no, 4);
        producer.await.unwrap().unwrap();
        assert_eq!(buffer.take().await.unwrap().from_seq_no, 5);
    }

    #[tokio::test]
    async fn test_batch_count_limit() {
        let buffer = Arc::new(WriteBuffer::new(1, 1000));
        buffer.offer(batch(1, 1)).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), buffer.offer(batch(2, 2))).await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn test_oversized_batch_is_admitted_alone() {
        let buffer = WriteBuffer::new(10, 3);
        buffer.offer(batch(1, 10)).await.unwrap();
        assert_eq!(buffer.operation_count(), 10);
        assert_eq!(buffer.take().await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let buffer = WriteBuffer::new(10, 100);
        buffer.offer(batch(1, 2)).await.unwrap();
        buffer.close();

        assert!(matches!(buffer.offer(batch(3, 3)).await, Err(Error::Cancelled)));
        assert_eq!(buffer.take().await.unwrap().from_seq_no, 1);
        assert!(buffer.take().await.is_none());
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_producer_and_consumer() {
        let buffer = Arc::new(WriteBuffer::new(1, 100));
        buffer.offer(batch(1, 1)).await.unwrap();

        let producer = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.offer(batch(2, 2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.close();
        assert!(matches!(producer.await.unwrap(), Err(Error::Cancelled)));

        let empty = Arc::new(WriteBuffer::new(1, 100));
        let consumer = {
            let empty = Arc::clone(&empty);
            tokio::spawn(async move { empty.take().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        empty.close();
        assert!(consumer.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_discard() {
        let buffer = WriteBuffer::new(10, 100);
        buffer.offer(batch(1, 3)).await.unwrap();
        buffer.offer(batch(4, 5)).await.unwrap();

        let discarded = buffer.discard();
        assert_eq!(discarded, Discarded { batches: 2, operations: 5 });
        assert_eq!(buffer.batch_count(), 0);
        assert_eq!(buffer.operation_count(), 0);
    }
}
