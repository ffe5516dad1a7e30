//! Follow Coordinator
//!
//! Registry of follow relationships. Each follower index maps to one
//! follow task per shard; commands addressed to a follower index are
//! routed to all of its tasks.

use std::collections::HashMap;
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use super::{
    FollowParameters, FollowParametersUpdate, FollowTaskState, RetentionGuard, ShardFollowTask,
    ShardPairing, StatsAggregator, StatsSnapshot,
};
use crate::error::{Error, Result};
use crate::shard::{FollowerCluster, IndexMetadata, LeaderCluster, ShardRef};
use crate::state::CheckpointStore;

/// Request to start following a leader index
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PutFollowRequest {
    pub leader_index: String,
    #[serde(default)]
    pub follower_index: String,
    #[serde(flatten)]
    pub params: FollowParametersUpdate,
}

impl PutFollowRequest {
    pub fn new(leader_index: impl Into<String>, follower_index: impl Into<String>) -> Self {
        Self {
            leader_index: leader_index.into(),
            follower_index: follower_index.into(),
            params: FollowParametersUpdate::default(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.leader_index.trim().is_empty() {
            return Err(Error::InvalidRequest("leader_index is missing".into()));
        }
        if self.follower_index.trim().is_empty() {
            return Err(Error::InvalidRequest("follower_index is missing".into()));
        }
        if self.leader_index == self.follower_index {
            return Err(Error::InvalidRequest(format!(
                "follower index [{}] cannot follow itself",
                self.follower_index
            )));
        }
        Ok(())
    }
}

struct FollowRelationship {
    leader_index: String,
    tasks: Vec<Arc<ShardFollowTask>>,
}

/// Summary of one follow relationship
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowInfo {
    pub follower_index: String,
    pub leader_index: String,
    pub shards: usize,
    /// Task states, indexed by shard
    pub states: Vec<FollowTaskState>,
}

/// Creates, routes commands to, and tears down follow tasks
pub struct Coordinator {
    leader: Arc<dyn LeaderCluster>,
    follower: Arc<dyn FollowerCluster>,
    store: Arc<CheckpointStore>,
    defaults: FollowParameters,
    follows: RwLock<HashMap<String, Arc<FollowRelationship>>>,
    /// Serializes put and remove
    admin: Mutex<()>,
}

impl Coordinator {
    pub fn new(
        leader: Arc<dyn LeaderCluster>,
        follower: Arc<dyn FollowerCluster>,
        store: Arc<CheckpointStore>,
        defaults: FollowParameters,
    ) -> Self {
        Self {
            leader,
            follower,
            store,
            defaults,
            follows: RwLock::new(HashMap::new()),
            admin: Mutex::new(()),
        }
    }

    /// Create the follower index and start one task per shard.
    ///
    /// Precondition failures leave nothing behind; a failure after the
    /// follower index exists rolls everything back.
    pub async fn put_follow(&self, request: PutFollowRequest) -> Result<FollowInfo> {
        let _admin = self.admin.lock().await;
        request.validate()?;
        let params = request.params.apply_to(&self.defaults);
        params.validate()?;

        let follower_index = request.follower_index.as_str();
        if self.follows.read().await.contains_key(follower_index) {
            return Err(Error::AlreadyFollowing(follower_index.to_string()));
        }
        if self.follower.index_exists(follower_index).await? {
            return Err(Error::IndexAlreadyExists(follower_index.to_string()));
        }

        let metadata = RetentionGuard::check(self.leader.as_ref(), &request.leader_index).await?;
        self.follower
            .create_follower_index(follower_index, &metadata)
            .await?;

        // A freshly created follower index has nothing applied
        match self.store.remove_follower(follower_index).await {
            Ok(0) => {}
            Ok(stale) => tracing::warn!(
                "Discarded {} stale checkpoints of [{}]",
                stale,
                follower_index
            ),
            Err(e) => {
                self.rollback(follower_index).await;
                return Err(e);
            }
        }

        let tasks = match self.start_tasks(follower_index, &metadata, &params).await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::error!(
                    "Failed to start following [{}] as [{}], rolling back: {}",
                    metadata.name,
                    follower_index,
                    e
                );
                self.rollback(follower_index).await;
                return Err(e);
            }
        };

        tracing::info!(
            "Follower index [{}] now follows [{}] ({} shards)",
            follower_index,
            metadata.name,
            tasks.len()
        );

        let relationship = Arc::new(FollowRelationship {
            leader_index: metadata.name.clone(),
            tasks,
        });
        let info = Self::info(follower_index, &relationship);
        self.follows
            .write()
            .await
            .insert(follower_index.to_string(), relationship);
        Ok(info)
    }

    async fn start_tasks(
        &self,
        follower_index: &str,
        metadata: &IndexMetadata,
        params: &FollowParameters,
    ) -> Result<Vec<Arc<ShardFollowTask>>> {
        let mut tasks = Vec::with_capacity(metadata.number_of_shards as usize);
        for shard in 0..metadata.number_of_shards {
            let pairing = ShardPairing {
                leader: ShardRef::new(metadata.name.clone(), shard),
                follower: ShardRef::new(follower_index, shard),
                leader_index_uuid: metadata.uuid,
            };
            let started = async {
                let task = ShardFollowTask::new(
                    pairing,
                    params.clone(),
                    Arc::clone(&self.leader),
                    Arc::clone(&self.follower),
                    Arc::clone(&self.store),
                )
                .await?;
                task.start().await?;
                Ok::<_, Error>(task)
            }
            .await;

            match started {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    for task in &tasks {
                        if let Err(stop_err) = task.stop().await {
                            tracing::warn!("{}", stop_err);
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(tasks)
    }

    async fn rollback(&self, follower_index: &str) {
        if let Err(e) = self.store.remove_follower(follower_index).await {
            tracing::warn!("Failed to remove checkpoints of [{}]: {}", follower_index, e);
        }
        if let Err(e) = self.follower.delete_index(follower_index).await {
            tracing::warn!("Failed to delete follower index [{}]: {}", follower_index, e);
        }
    }

    async fn relationship(&self, follower_index: &str) -> Result<Arc<FollowRelationship>> {
        self.follows
            .read()
            .await
            .get(follower_index)
            .cloned()
            .ok_or_else(|| Error::FollowerNotFound(follower_index.to_string()))
    }

    /// Pause every shard task; returns once all are drained
    pub async fn pause_follow(&self, follower_index: &str) -> Result<()> {
        let relationship = self.relationship(follower_index).await?;
        let results =
            futures::future::join_all(relationship.tasks.iter().map(|task| task.pause())).await;
        results.into_iter().collect::<Result<Vec<()>>>()?;

        tracing::info!("Paused following of [{}]", follower_index);
        Ok(())
    }

    /// Resume every shard task from its persisted checkpoint. Nothing is
    /// resumed unless every shard is paused.
    pub async fn resume_follow(
        &self,
        follower_index: &str,
        update: Option<FollowParametersUpdate>,
    ) -> Result<()> {
        let relationship = self.relationship(follower_index).await?;

        if let Some(task) = relationship
            .tasks
            .iter()
            .find(|task| task.state() != FollowTaskState::Paused)
        {
            return Err(Error::InvalidState {
                follower_index: follower_index.to_string(),
                shard: task.pairing().follower.shard,
                state: task.state(),
                operation: "resume",
            });
        }

        for task in &relationship.tasks {
            let params = match &update {
                Some(update) => Some(update.apply_to(&task.params().await)),
                None => None,
            };
            task.resume(params).await?;
        }

        tracing::info!("Resumed following of [{}]", follower_index);
        Ok(())
    }

    /// Stop every shard task and forget the relationship along with its
    /// checkpoints. The follower index itself stays.
    pub async fn remove_follow(&self, follower_index: &str) -> Result<()> {
        let _admin = self.admin.lock().await;
        let relationship = self
            .follows
            .write()
            .await
            .remove(follower_index)
            .ok_or_else(|| Error::FollowerNotFound(follower_index.to_string()))?;

        Self::stop_all(&relationship).await;
        let removed = self.store.remove_follower(follower_index).await?;
        tracing::info!(
            "Follower index [{}] no longer follows [{}] ({} checkpoints removed)",
            follower_index,
            relationship.leader_index,
            removed
        );
        Ok(())
    }

    async fn stop_all(relationship: &FollowRelationship) {
        let results =
            futures::future::join_all(relationship.tasks.iter().map(|task| task.stop())).await;
        for result in results {
            if let Err(e) = result {
                tracing::warn!("{}", e);
            }
        }
    }

    /// Snapshots of the tasks of the named follower indices, or of every
    /// task when `filter` is absent or empty
    pub async fn stats(&self, filter: Option<&[String]>) -> Vec<StatsSnapshot> {
        let follows = self.follows.read().await;
        StatsAggregator::query(follows.values().flat_map(|r| r.tasks.iter()), filter)
    }

    /// Describe one follow relationship
    pub async fn follow_info(&self, follower_index: &str) -> Result<FollowInfo> {
        let relationship = self.relationship(follower_index).await?;
        Ok(Self::info(follower_index, &relationship))
    }

    /// Names of the followed indices
    pub async fn follower_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.follows.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop every task, for process exit. Checkpoints are kept.
    pub async fn shutdown(&self) {
        let follows: Vec<Arc<FollowRelationship>> =
            self.follows.write().await.drain().map(|(_, r)| r).collect();
        for relationship in &follows {
            Self::stop_all(relationship).await;
        }
        tracing::info!("Stopped {} follow relationships", follows.len());
    }

    fn info(follower_index: &str, relationship: &FollowRelationship) -> FollowInfo {
        FollowInfo {
            follower_index: follower_index.to_string(),
            leader_index: relationship.leader_index.clone(),
            shards: relationship.tasks.len(),
            states: relationship.tasks.iter().map(|t| t.state()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use serde_json::json;
    use crate::follow::testing::{fast_params, wait_until, FlakyLeader};
    use crate::shard::{IndexSettings, LocalCluster};

    async fn cluster_with_leader(shards: u32, soft_deletes: bool) -> Arc<LocalCluster> {
        let cluster = Arc::new(LocalCluster::new());
        cluster
            .create_index("leader", IndexSettings { number_of_shards: shards, soft_deletes })
            .await
            .unwrap();
        cluster
    }

    fn coordinator(leader: Arc<dyn LeaderCluster>, follower: Arc<LocalCluster>) -> Coordinator {
        Coordinator::new(
            leader,
            follower,
            Arc::new(CheckpointStore::in_memory().unwrap()),
            fast_params(),
        )
    }

    async fn index_docs(cluster: &LocalCluster, count: usize) {
        for _ in 0..count {
            cluster
                .index_document("leader", None, json!({ "field": "value" }))
                .await
                .unwrap();
        }
    }

    async fn hits(cluster: &LocalCluster, expected: u64) -> bool {
        wait_until(Duration::from_secs(5), || async move {
            cluster.doc_count("follower").await.unwrap_or(0) == expected
        })
        .await
    }

    #[tokio::test]
    async fn test_follow_pause_resume_scenario() {
        let cluster = cluster_with_leader(2, true).await;
        let coordinator = coordinator(cluster.clone(), cluster.clone());

        let info = coordinator
            .put_follow(PutFollowRequest::new("leader", "follower"))
            .await
            .unwrap();
        assert_eq!(info.shards, 2);

        index_docs(&cluster, 50).await;
        assert!(hits(&cluster, 50).await);
        index_docs(&cluster, 30).await;
        assert!(hits(&cluster, 80).await);

        coordinator.pause_follow("follower").await.unwrap();
        index_docs(&cluster, 10).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cluster.doc_count("follower").await.unwrap(), 80);

        coordinator.resume_follow("follower", None).await.unwrap();
        assert!(hits(&cluster, 90).await);
        assert_eq!(cluster.doc_count("leader").await.unwrap(), 90);

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_stats_filter() {
        let cluster = cluster_with_leader(2, true).await;
        let coordinator = coordinator(cluster.clone(), cluster.clone());
        coordinator
            .put_follow(PutFollowRequest::new("leader", "follower"))
            .await
            .unwrap();
        coordinator
            .put_follow(PutFollowRequest::new("leader", "follower-2"))
            .await
            .unwrap();

        let all = coordinator.stats(None).await;
        assert_eq!(all.len(), 4);
        assert_eq!(coordinator.stats(Some(&[][..])).await.len(), 4);

        let one = coordinator.stats(Some(&["follower-2".to_string()][..])).await;
        assert_eq!(one.len(), 2);
        assert!(one.iter().all(|s| s.follower_index == "follower-2"));

        let unknown = coordinator.stats(Some(&["nope".to_string()][..])).await;
        assert!(unknown.is_empty());

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_retention_disabled_creates_nothing() {
        let cluster = cluster_with_leader(2, false).await;
        let coordinator = coordinator(cluster.clone(), cluster.clone());

        let err = coordinator
            .put_follow(PutFollowRequest::new("leader", "follower"))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "leader index [leader] does not have soft deletes enabled"
        );
        assert!(!cluster.index_exists("follower").await.unwrap());
        assert!(coordinator.follower_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_put_follow_preconditions() {
        let cluster = cluster_with_leader(1, true).await;
        cluster
            .create_index("taken", IndexSettings::default())
            .await
            .unwrap();
        let coordinator = coordinator(cluster.clone(), cluster.clone());

        let err = coordinator
            .put_follow(PutFollowRequest::new("missing", "follower"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IndexNotFound(_)));
        assert!(!cluster.index_exists("follower").await.unwrap());

        let err = coordinator
            .put_follow(PutFollowRequest::new("leader", "taken"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IndexAlreadyExists(_)));

        let err = coordinator
            .put_follow(PutFollowRequest::new("leader", "leader"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));

        coordinator
            .put_follow(PutFollowRequest::new("leader", "follower"))
            .await
            .unwrap();
        let err = coordinator
            .put_follow(PutFollowRequest::new("leader", "follower"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyFollowing(_)));

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_transient_leader_failures_are_invisible() {
        let cluster = cluster_with_leader(1, true).await;
        let leader = Arc::new(FlakyLeader::new(cluster.clone()));
        let coordinator = coordinator(leader.clone(), cluster.clone());
        coordinator
            .put_follow(PutFollowRequest::new("leader", "follower"))
            .await
            .unwrap();

        leader.transient_failures.store(3, Ordering::SeqCst);
        index_docs(&cluster, 20).await;
        assert!(hits(&cluster, 20).await);

        let stats = coordinator.stats(None).await;
        assert_eq!(stats[0].state, FollowTaskState::Following);
        assert_eq!(stats[0].fetch_failure_count, 3);
        assert!(stats[0].last_failure_reason.is_none());

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_task_rejects_resume() {
        let cluster = cluster_with_leader(1, true).await;
        let leader = Arc::new(FlakyLeader::new(cluster.clone()));
        let coordinator = coordinator(leader.clone(), cluster.clone());
        coordinator
            .put_follow(PutFollowRequest::new("leader", "follower"))
            .await
            .unwrap();

        leader.revoked.store(true, Ordering::SeqCst);
        let coordinator_ref = &coordinator;
        let failed = wait_until(Duration::from_secs(5), || async move {
            coordinator_ref.stats(None).await[0].state == FollowTaskState::Failed
        })
        .await;
        assert!(failed);

        let stats = coordinator.stats(None).await;
        assert!(stats[0].last_failure_reason.is_some());

        let err = coordinator.resume_follow("follower", None).await.unwrap_err();
        assert!(err.to_string().contains("FAILED"), "{}", err);

        coordinator.remove_follow("follower").await.unwrap();
        assert!(coordinator.stats(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_follower() {
        let cluster = cluster_with_leader(1, true).await;
        let coordinator = coordinator(cluster.clone(), cluster.clone());

        assert!(matches!(
            coordinator.pause_follow("ghost").await,
            Err(Error::FollowerNotFound(_))
        ));
        assert!(matches!(
            coordinator.resume_follow("ghost", None).await,
            Err(Error::FollowerNotFound(_))
        ));
        assert!(matches!(
            coordinator.remove_follow("ghost").await,
            Err(Error::FollowerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_keeps_index_and_drops_checkpoints() {
        let cluster = cluster_with_leader(2, true).await;
        let store = Arc::new(CheckpointStore::in_memory().unwrap());
        let coordinator = Coordinator::new(cluster.clone(), cluster.clone(), store.clone(), fast_params());
        coordinator
            .put_follow(PutFollowRequest::new("leader", "follower"))
            .await
            .unwrap();
        index_docs(&cluster, 10).await;
        assert!(hits(&cluster, 10).await);

        coordinator.remove_follow("follower").await.unwrap();
        assert!(cluster.index_exists("follower").await.unwrap());
        assert!(store.checkpoints_for("follower").await.unwrap().is_empty());
        assert!(coordinator.follower_names().await.is_empty());

        // no longer replicated
        index_docs(&cluster, 5).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cluster.doc_count("follower").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_new_follow_ignores_checkpoints_from_previous_run() {
        let dir = tempfile::tempdir().unwrap();

        {
            let cluster = cluster_with_leader(1, true).await;
            let store = Arc::new(CheckpointStore::new(dir.path().to_path_buf()).unwrap());
            let coordinator =
                Coordinator::new(cluster.clone(), cluster.clone(), store, fast_params());
            coordinator
                .put_follow(PutFollowRequest::new("leader", "follower"))
                .await
                .unwrap();
            index_docs(&cluster, 20).await;
            assert!(hits(&cluster, 20).await);
            coordinator.shutdown().await;
        }

        // new process: indices are gone, checkpoints are still on disk
        let cluster = cluster_with_leader(1, true).await;
        let store = Arc::new(CheckpointStore::new(dir.path().to_path_buf()).unwrap());
        assert_eq!(store.checkpoints_for("follower").await.unwrap().len(), 1);
        let coordinator =
            Coordinator::new(cluster.clone(), cluster.clone(), store.clone(), fast_params());
        coordinator
            .put_follow(PutFollowRequest::new("leader", "follower"))
            .await
            .unwrap();

        let stats = coordinator.stats(None).await;
        assert_eq!(stats[0].last_applied_seq_no, 0);

        index_docs(&cluster, 10).await;
        assert!(hits(&cluster, 10).await);
        let stats = coordinator.stats(None).await;
        assert_eq!(stats[0].last_applied_seq_no, 10);
        assert_eq!(stats[0].operations_applied, 10);
        assert_eq!(store.checkpoints_for("follower").await.unwrap()[0].1.seq_no, 10);

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_resume_with_overrides() {
        let cluster = cluster_with_leader(1, true).await;
        let coordinator = coordinator(cluster.clone(), cluster.clone());
        coordinator
            .put_follow(PutFollowRequest::new("leader", "follower"))
            .await
            .unwrap();
        coordinator.pause_follow("follower").await.unwrap();
        // pausing twice is fine
        coordinator.pause_follow("follower").await.unwrap();

        let update = FollowParametersUpdate {
            max_read_request_operation_count: Some(3),
            ..Default::default()
        };
        coordinator.resume_follow("follower", Some(update)).await.unwrap();
        let info = coordinator.follow_info("follower").await.unwrap();
        assert_eq!(info.states, vec![FollowTaskState::Following]);

        index_docs(&cluster, 10).await;
        assert!(hits(&cluster, 10).await);
        coordinator.shutdown().await;
    }
}
