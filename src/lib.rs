//! ShardFollow - Per-Shard Index Replication
//!
//! Keeps a follower index in sync with a leader index, shard by shard.
//! Each shard pairing runs its own follow task: a fetch -> buffer -> apply
//! pipeline that reads operations from the leader shard in sequence order,
//! applies them to the follower shard and records a durable checkpoint.
//!
//! # Architecture
//!
//! A coordinator owns one follow task per shard of every followed index.
//! Tasks are independent; they share nothing but the checkpoint store.
//!
//! # Features
//!
//! - Concurrent, bounded leader reads completed in sequence order
//! - Backpressure through a bounded write buffer
//! - Retry with exponential backoff for transient failures
//! - Graceful pause, resume from the persisted checkpoint, hard stop
//! - History retention check before a follow is created
//! - Per-shard follow stats
//! - HTTP API and CLI

pub mod config;
pub mod error;
pub mod shard;
pub mod state;
pub mod follow;
pub mod api;

pub use config::NodeConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::NodeConfig;
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::follow::{
        Coordinator, FollowParameters, FollowTaskState, PutFollowRequest, ShardFollowTask,
        StatsSnapshot,
    };
    pub use crate::shard::{FollowerCluster, LeaderCluster, LocalCluster, SeqNo, ShardRef};
    pub use crate::state::{Checkpoint, CheckpointStore};
}
