//! Checkpoint Tracker
//!
//! Single-writer holder of a follower shard's last durably applied
//! operation. Readers get a monotonic view through a watch channel.

use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::CheckpointStore;
use crate::shard::{SeqNo, ShardRef, NO_OPS_PERFORMED};
use crate::error::Result;

/// Last operation durably applied on a follower shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub seq_no: SeqNo,
    pub primary_term: u64,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self {
            seq_no: NO_OPS_PERFORMED,
            primary_term: 0,
        }
    }
}

impl Checkpoint {
    /// First sequence number still to be applied
    pub fn next_seq_no(&self) -> SeqNo {
        self.seq_no + 1
    }
}

/// Per-shard checkpoint tracker
pub struct CheckpointTracker {
    follower: ShardRef,
    store: Arc<CheckpointStore>,
    current: watch::Sender<Checkpoint>,
}

impl CheckpointTracker {
    /// Create a tracker positioned at the persisted checkpoint
    pub async fn open(follower: ShardRef, store: Arc<CheckpointStore>) -> Result<Self> {
        let persisted = store.load(&follower).await?;
        let (current, _) = watch::channel(persisted);
        Ok(Self {
            follower,
            store,
            current,
        })
    }

    /// Current checkpoint
    pub fn checkpoint(&self) -> Checkpoint {
        *self.current.borrow()
    }

    /// Persist then publish a new checkpoint. A checkpoint at or below the
    /// current one leaves everything as is.
    pub async fn advance(&self, checkpoint: Checkpoint) -> Result<Checkpoint> {
        let current = self.checkpoint();
        if checkpoint.seq_no <= current.seq_no {
            return Ok(current);
        }

        self.store.save(&self.follower, checkpoint).await?;
        self.current.send_replace(checkpoint);
        Ok(checkpoint)
    }

    /// Re-read the persisted checkpoint, discarding any in-memory view
    pub async fn reload(&self) -> Result<Checkpoint> {
        let persisted = self.store.load(&self.follower).await?;
        self.current.send_replace(persisted);
        Ok(persisted)
    }

    pub fn follower(&self) -> &ShardRef {
        &self.follower
    }
}
