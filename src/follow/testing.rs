//! Test support: fault-injecting collaborators and polling helpers.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::FollowParameters;
use crate::error::{Error, Result};
use crate::shard::{
    ChangesResponse, FollowerCluster, IndexMetadata, LeaderCluster, LocalCluster, Operation,
    SeqNo, ShardRef,
};

/// Parameters tuned for fast tests
pub fn fast_params() -> FollowParameters {
    FollowParameters {
        max_read_request_operation_count: 8,
        max_outstanding_read_requests: 3,
        max_write_buffer_count: 4,
        max_write_buffer_size: 32,
        read_poll_timeout_ms: 5,
        read_timeout_ms: 1000,
        write_timeout_ms: 1000,
        max_retry_attempts: 5,
        initial_retry_delay_ms: 1,
        max_retry_delay_ms: 5,
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Leader that fails reads on demand
pub struct FlakyLeader {
    pub inner: Arc<LocalCluster>,
    /// Remaining reads to fail with a transient error
    pub transient_failures: AtomicU32,
    /// Fail every read with a permanent error
    pub revoked: AtomicBool,
    /// Reads attempted
    pub reads: AtomicU32,
}

impl FlakyLeader {
    pub fn new(inner: Arc<LocalCluster>) -> Self {
        Self {
            inner,
            transient_failures: AtomicU32::new(0),
            revoked: AtomicBool::new(false),
            reads: AtomicU32::new(0),
        }
    }
}

#[async_trait::async_trait]
impl LeaderCluster for FlakyLeader {
    async fn index_metadata(&self, index: &str) -> Result<IndexMetadata> {
        self.inner.index_metadata(index).await
    }

    async fn read_operations(
        &self,
        shard: &ShardRef,
        from_seq_no: SeqNo,
        max_count: usize,
    ) -> Result<ChangesResponse> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.revoked.load(Ordering::SeqCst) {
            return Err(Error::PermissionDenied(format!("read access to {} revoked", shard)));
        }
        let failed = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Error::ShardUnavailable {
                index: shard.index.clone(),
                shard: shard.shard,
            });
        }
        self.inner.read_operations(shard, from_seq_no, max_count).await
    }
}

/// Follower that fails writes on demand
pub struct FlakyFollower {
    pub inner: Arc<LocalCluster>,
    pub transient_failures: AtomicU32,
    pub broken: AtomicBool,
}

impl FlakyFollower {
    pub fn new(inner: Arc<LocalCluster>) -> Self {
        Self {
            inner,
            transient_failures: AtomicU32::new(0),
            broken: AtomicBool::new(false),
        }
    }
}

#[async_trait::async_trait]
impl FollowerCluster for FlakyFollower {
    async fn index_exists(&self, index: &str) -> Result<bool> {
        self.inner.index_exists(index).await
    }

    async fn create_follower_index(&self, index: &str, leader: &IndexMetadata) -> Result<()> {
        self.inner.create_follower_index(index, leader).await
    }

    async fn delete_index(&self, index: &str) -> Result<()> {
        self.inner.delete_index(index).await
    }

    async fn apply_operations(&self, shard: &ShardRef, operations: &[Operation]) -> Result<SeqNo> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(Error::ShardNotFound {
                index: shard.index.clone(),
                shard: shard.shard,
            });
        }
        let failed = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Error::Network("connection reset by follower".into()));
        }
        self.inner.apply_operations(shard, operations).await
    }
}

/// Follower whose writes each take `delay`
pub struct SlowFollower {
    pub inner: Arc<LocalCluster>,
    pub delay: Duration,
}

impl SlowFollower {
    pub fn new(inner: Arc<LocalCluster>, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait::async_trait]
impl FollowerCluster for SlowFollower {
    async fn index_exists(&self, index: &str) -> Result<bool> {
        self.inner.index_exists(index).await
    }

    async fn create_follower_index(&self, index: &str, leader: &IndexMetadata) -> Result<()> {
        self.inner.create_follower_index(index, leader).await
    }

    async fn delete_index(&self, index: &str) -> Result<()> {
        self.inner.delete_index(index).await
    }

    async fn apply_operations(&self, shard: &ShardRef, operations: &[Operation]) -> Result<SeqNo> {
        tokio::time::sleep(self.delay).await;
        self.inner.apply_operations(shard, operations).await
    }
}
