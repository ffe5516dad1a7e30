//! Retention Guard
//!
//! A leader index can only be followed if it retains the history of
//! deleted and overwritten operations (soft deletes). The check runs
//! before any follower artifact is created.

use crate::error::{Error, Result};
use crate::shard::{IndexMetadata, LeaderCluster};

/// Precondition check on the leader's history retention
pub struct RetentionGuard;

impl RetentionGuard {
    /// Fail if the leader index does not retain operation history
    pub fn validate(leader: &IndexMetadata) -> Result<()> {
        if !leader.soft_deletes_enabled {
            tracing::warn!(
                "Refusing to follow leader index [{}]: soft deletes disabled",
                leader.name
            );
            return Err(Error::RetentionDisabled {
                leader_index: leader.name.clone(),
            });
        }
        Ok(())
    }

    /// Look up the leader index and validate it, returning its metadata
    pub async fn check(leader: &dyn LeaderCluster, leader_index: &str) -> Result<IndexMetadata> {
        let metadata = leader.index_metadata(leader_index).await?;
        Self::validate(&metadata)?;
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::{IndexSettings, LocalCluster};

    #[tokio::test]
    async fn test_retention_enabled_passes() {
        let cluster = LocalCluster::new();
        cluster
            .create_index("leader", IndexSettings { number_of_shards: 2, soft_deletes: true })
            .await
            .unwrap();

        let metadata = RetentionGuard::check(&cluster, "leader").await.unwrap();
        assert_eq!(metadata.number_of_shards, 2);
    }

    #[tokio::test]
    async fn test_retention_disabled_fails() {
        let cluster = LocalCluster::new();
        cluster
            .create_index("leader-index", IndexSettings { number_of_shards: 2, soft_deletes: false })
            .await
            .unwrap();

        let err = RetentionGuard::check(&cluster, "leader-index").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "leader index [leader-index] does not have soft deletes enabled"
        );
    }

    #[tokio::test]
    async fn test_missing_leader_fails() {
        let cluster = LocalCluster::new();
        let err = RetentionGuard::check(&cluster, "missing").await.unwrap_err();
        assert!(matches!(err, Error::IndexNotFound(name) if name == "missing"));
    }
}
