//! Shard Module
//!
//! Operation and shard types shared by leader and follower, and the
//! collaborator traits the follow pipeline reads from and writes to.

mod local;

pub use local::{LocalCluster, IndexSettings};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Sequence number - per-shard position of each write operation
pub type SeqNo = u64;

/// Sequence number meaning "nothing applied yet"; the first operation is 1
pub const NO_OPS_PERFORMED: SeqNo = 0;

/// Reference to one shard of an index
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardRef {
    pub index: String,
    pub shard: u32,
}

impl ShardRef {
    pub fn new(index: impl Into<String>, shard: u32) -> Self {
        Self {
            index: index.into(),
            shard,
        }
    }
}

impl std::fmt::Display for ShardRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}][{}]", self.index, self.shard)
    }
}

/// What a single operation does to its document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum OperationKind {
    /// Create or overwrite the document
    Index { source: serde_json::Value },
    /// Remove the document
    Delete,
}

/// A single write operation in a shard's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub seq_no: SeqNo,
    pub primary_term: u64,
    pub id: String,
    #[serde(flatten)]
    pub kind: OperationKind,
}

/// Leader-side index facts needed to follow it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub name: String,
    pub uuid: uuid::Uuid,
    pub number_of_shards: u32,
    /// History retention ("soft deletes"); following requires it
    pub soft_deletes_enabled: bool,
}

/// Result of reading operations from a leader shard
#[derive(Debug, Clone, Default)]
pub struct ChangesResponse {
    /// Operations in sequence number order, starting at the requested seq_no
    pub operations: Vec<Operation>,
    /// Highest sequence number the leader shard has assigned
    pub max_seq_no: SeqNo,
}

/// Read side of a leader cluster
#[async_trait::async_trait]
pub trait LeaderCluster: Send + Sync {
    /// Look up an index's metadata
    async fn index_metadata(&self, index: &str) -> Result<IndexMetadata>;

    /// Read up to `max_count` operations with seq_no >= `from_seq_no`.
    /// Returns an empty batch when the shard has nothing that new yet.
    async fn read_operations(
        &self,
        shard: &ShardRef,
        from_seq_no: SeqNo,
        max_count: usize,
    ) -> Result<ChangesResponse>;
}

/// Write side of a follower cluster
#[async_trait::async_trait]
pub trait FollowerCluster: Send + Sync {
    /// Check whether an index exists
    async fn index_exists(&self, index: &str) -> Result<bool>;

    /// Create a follower index shaped after the leader
    async fn create_follower_index(&self, index: &str, leader: &IndexMetadata) -> Result<()>;

    /// Delete an index
    async fn delete_index(&self, index: &str) -> Result<()>;

    /// Apply operations preserving their sequence numbers. Must be
    /// idempotent: replaying an applied operation changes nothing.
    /// Returns the shard's highest applied seq_no once durable.
    async fn apply_operations(&self, shard: &ShardRef, operations: &[Operation]) -> Result<SeqNo>;
}
