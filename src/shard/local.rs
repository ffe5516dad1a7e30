//! Local Cluster
//!
//! In-process index store implementing both collaborator traits, so a
//! leader index and its follower can live in the same node.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use super::{
    ChangesResponse, FollowerCluster, IndexMetadata, LeaderCluster, Operation, OperationKind,
    SeqNo, ShardRef, NO_OPS_PERFORMED,
};
use crate::error::{Error, Result};

/// Settings accepted when creating an index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSettings {
    #[serde(default = "default_number_of_shards")]
    pub number_of_shards: u32,
    /// Retain operation history so the index can be followed
    #[serde(default = "default_soft_deletes")]
    pub soft_deletes: bool,
}

fn default_number_of_shards() -> u32 {
    1
}

fn default_soft_deletes() -> bool {
    true
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            number_of_shards: default_number_of_shards(),
            soft_deletes: default_soft_deletes(),
        }
    }
}

/// Latest version of a document; `source` is `None` once deleted
struct DocVersion {
    seq_no: SeqNo,
    source: Option<serde_json::Value>,
}

struct LocalShard {
    primary_term: u64,
    max_seq_no: SeqNo,
    /// Retained operations, position `i` holds seq_no `i + 1`
    history: Vec<Operation>,
    retain_history: bool,
    docs: HashMap<String, DocVersion>,
}

impl LocalShard {
    fn new(retain_history: bool) -> Self {
        Self {
            primary_term: 1,
            max_seq_no: NO_OPS_PERFORMED,
            history: Vec::new(),
            retain_history,
            docs: HashMap::new(),
        }
    }

    /// Apply one operation, last writer wins on seq_no per document
    fn apply(&mut self, op: &Operation) -> bool {
        if let Some(existing) = self.docs.get(&op.id) {
            if existing.seq_no >= op.seq_no {
                return false;
            }
        }

        let source = match &op.kind {
            OperationKind::Index { source } => Some(source.clone()),
            OperationKind::Delete => None,
        };
        self.docs.insert(op.id.clone(), DocVersion { seq_no: op.seq_no, source });

        if op.seq_no > self.max_seq_no {
            if self.retain_history {
                self.history.push(op.clone());
            }
            self.max_seq_no = op.seq_no;
        }
        true
    }

    /// Assign the next seq_no to a new leader-side operation
    fn record(&mut self, id: String, kind: OperationKind) -> SeqNo {
        let op = Operation {
            seq_no: self.max_seq_no + 1,
            primary_term: self.primary_term,
            id,
            kind,
        };
        self.apply(&op);
        op.seq_no
    }

    fn doc_count(&self) -> u64 {
        self.docs.values().filter(|d| d.source.is_some()).count() as u64
    }
}

struct LocalIndex {
    metadata: IndexMetadata,
    /// Name of the leader index when this is a follower
    follower_of: Option<String>,
    shards: Vec<Mutex<LocalShard>>,
}

impl LocalIndex {
    fn shard(&self, shard: u32) -> Result<&Mutex<LocalShard>> {
        self.shards.get(shard as usize).ok_or_else(|| Error::ShardNotFound {
            index: self.metadata.name.clone(),
            shard,
        })
    }

    fn route(&self, id: &str) -> u32 {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as u32
    }
}

/// In-memory cluster of indices
#[derive(Default)]
pub struct LocalCluster {
    indices: RwLock<HashMap<String, Arc<LocalIndex>>>,
}

impl LocalCluster {
    /// Create an empty cluster
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a regular (writable) index
    pub async fn create_index(&self, name: &str, settings: IndexSettings) -> Result<IndexMetadata> {
        self.insert_index(name, settings.number_of_shards, settings.soft_deletes, None)
            .await
    }

    async fn insert_index(
        &self,
        name: &str,
        number_of_shards: u32,
        soft_deletes: bool,
        follower_of: Option<String>,
    ) -> Result<IndexMetadata> {
        if name.is_empty() {
            return Err(Error::InvalidRequest("index name cannot be empty".into()));
        }
        if number_of_shards == 0 {
            return Err(Error::InvalidRequest(format!(
                "index [{}] must have at least one shard",
                name
            )));
        }

        let mut indices = self.indices.write().await;
        if indices.contains_key(name) {
            return Err(Error::IndexAlreadyExists(name.to_string()));
        }

        let metadata = IndexMetadata {
            name: name.to_string(),
            uuid: uuid::Uuid::new_v4(),
            number_of_shards,
            soft_deletes_enabled: soft_deletes,
        };
        let shards = (0..number_of_shards)
            .map(|_| Mutex::new(LocalShard::new(soft_deletes)))
            .collect();

        indices.insert(
            name.to_string(),
            Arc::new(LocalIndex {
                metadata: metadata.clone(),
                follower_of,
                shards,
            }),
        );
        tracing::info!(
            "Created index [{}] with {} shards (soft_deletes={})",
            name,
            number_of_shards,
            soft_deletes
        );
        Ok(metadata)
    }

    async fn get(&self, index: &str) -> Result<Arc<LocalIndex>> {
        self.indices
            .read()
            .await
            .get(index)
            .cloned()
            .ok_or_else(|| Error::IndexNotFound(index.to_string()))
    }

    async fn writable(&self, index: &str) -> Result<Arc<LocalIndex>> {
        let idx = self.get(index).await?;
        if idx.follower_of.is_some() {
            return Err(Error::FollowerIndexReadOnly(index.to_string()));
        }
        Ok(idx)
    }

    /// Index a document, generating an id when none is given
    pub async fn index_document(
        &self,
        index: &str,
        id: Option<String>,
        source: serde_json::Value,
    ) -> Result<(ShardRef, SeqNo)> {
        let idx = self.writable(index).await?;
        let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let shard = idx.route(&id);
        let seq_no = idx
            .shard(shard)?
            .lock()
            .await
            .record(id, OperationKind::Index { source });
        Ok((ShardRef::new(index, shard), seq_no))
    }

    /// Delete a document; the delete is recorded even if the id is unknown
    pub async fn delete_document(&self, index: &str, id: &str) -> Result<(ShardRef, SeqNo)> {
        let idx = self.writable(index).await?;
        let shard = idx.route(id);
        let seq_no = idx
            .shard(shard)?
            .lock()
            .await
            .record(id.to_string(), OperationKind::Delete);
        Ok((ShardRef::new(index, shard), seq_no))
    }

    /// Number of live documents across all shards
    pub async fn doc_count(&self, index: &str) -> Result<u64> {
        let idx = self.get(index).await?;
        let mut total = 0;
        for shard in &idx.shards {
            total += shard.lock().await.doc_count();
        }
        Ok(total)
    }

    /// Current source of a document, if it exists
    pub async fn document(&self, index: &str, id: &str) -> Result<Option<serde_json::Value>> {
        let idx = self.get(index).await?;
        let shard = idx.shard(idx.route(id))?.lock().await;
        Ok(shard.docs.get(id).and_then(|d| d.source.clone()))
    }

    /// Retained operation history of one shard
    pub async fn operations(&self, shard: &ShardRef) -> Result<Vec<Operation>> {
        let idx = self.get(&shard.index).await?;
        let history = idx.shard(shard.shard)?.lock().await.history.clone();
        Ok(history)
    }

    /// List index names
    pub async fn index_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.indices.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait::async_trait]
impl LeaderCluster for LocalCluster {
    async fn index_metadata(&self, index: &str) -> Result<IndexMetadata> {
        Ok(self.get(index).await?.metadata.clone())
    }

    async fn read_operations(
        &self,
        shard: &ShardRef,
        from_seq_no: SeqNo,
        max_count: usize,
    ) -> Result<ChangesResponse> {
        let idx = self.get(&shard.index).await?;
        let local = idx.shard(shard.shard)?.lock().await;

        if !local.retain_history {
            return Err(Error::HistoryNotRetained {
                index: shard.index.clone(),
                shard: shard.shard,
                requested: from_seq_no,
            });
        }

        let start = from_seq_no.max(1) as usize - 1;
        let end = start.saturating_add(max_count).min(local.history.len());
        let operations = if start < end {
            local.history[start..end].to_vec()
        } else {
            Vec::new()
        };

        Ok(ChangesResponse {
            operations,
            max_seq_no: local.max_seq_no,
        })
    }
}

#[async_trait::async_trait]
impl FollowerCluster for LocalCluster {
    async fn index_exists(&self, index: &str) -> Result<bool> {
        Ok(self.indices.read().await.contains_key(index))
    }

    async fn create_follower_index(&self, index: &str, leader: &IndexMetadata) -> Result<()> {
        self.insert_index(index, leader.number_of_shards, true, Some(leader.name.clone()))
            .await?;
        Ok(())
    }

    async fn delete_index(&self, index: &str) -> Result<()> {
        match self.indices.write().await.remove(index) {
            Some(_) => {
                tracing::info!("Deleted index [{}]", index);
                Ok(())
            }
            None => Err(Error::IndexNotFound(index.to_string())),
        }
    }

    async fn apply_operations(&self, shard: &ShardRef, operations: &[Operation]) -> Result<SeqNo> {
        let idx = self.get(&shard.index).await?;
        let mut local = idx.shard(shard.shard)?.lock().await;
        for op in operations {
            local.apply(op);
        }
        Ok(local.max_seq_no)
    }
}
