//! Checkpoint Store
//!
//! Persistent storage for follow checkpoints, recording the last
//! operation durably applied to each follower shard.

use std::path::PathBuf;
use rusqlite::{Connection, params};
use tokio::sync::Mutex;

use super::Checkpoint;
use crate::shard::ShardRef;
use crate::error::{Error, Result};

/// Persistent checkpoint store backed by SQLite
pub struct CheckpointStore {
    /// Database connection
    conn: Mutex<Connection>,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS follow_checkpoints (
    follower_index TEXT NOT NULL,
    shard INTEGER NOT NULL,
    seq_no INTEGER NOT NULL,
    primary_term INTEGER NOT NULL,
    updated_at TEXT DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (follower_index, shard)
);
"#;

impl CheckpointStore {
    /// Create or open the checkpoint database
    pub fn new(data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)?;

        let db_path = data_dir.join("checkpoints.db");
        let conn = Connection::open(&db_path)?;
        conn.execute_batch(SCHEMA)?;

        tracing::debug!("Opened checkpoint store at {:?}", db_path);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a throwaway store that lives only as long as the process
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Get the checkpoint of a follower shard (empty if never saved)
    pub async fn load(&self, follower: &ShardRef) -> Result<Checkpoint> {
        let conn = self.conn.lock().await;
        let result: std::result::Result<(i64, i64), _> = conn.query_row(
            "SELECT seq_no, primary_term FROM follow_checkpoints WHERE follower_index = ?1 AND shard = ?2",
            params![follower.index, follower.shard as i64],
            |row| Ok((row.get(0)?, row.get(1)?)),
        );

        match result {
            Ok((seq_no, primary_term)) => Ok(Checkpoint {
                seq_no: seq_no as u64,
                primary_term: primary_term as u64,
            }),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(Checkpoint::default()),
            Err(e) => Err(Error::State(format!("Failed to load checkpoint for {}: {}", follower, e))),
        }
    }

    /// Save a checkpoint. A checkpoint below the stored one is ignored,
    /// so the persisted value never moves backwards.
    pub async fn save(&self, follower: &ShardRef, checkpoint: Checkpoint) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO follow_checkpoints (follower_index, shard, seq_no, primary_term)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(follower_index, shard) DO UPDATE SET
                seq_no = excluded.seq_no,
                primary_term = excluded.primary_term,
                updated_at = CURRENT_TIMESTAMP
            WHERE excluded.seq_no >= follow_checkpoints.seq_no
            "#,
            params![
                follower.index,
                follower.shard as i64,
                checkpoint.seq_no as i64,
                checkpoint.primary_term as i64
            ],
        )?;
        Ok(())
    }

    /// All saved checkpoints of a follower index, ordered by shard
    pub async fn checkpoints_for(&self, follower_index: &str) -> Result<Vec<(u32, Checkpoint)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT shard, seq_no, primary_term FROM follow_checkpoints WHERE follower_index = ?1 ORDER BY shard",
        )?;
        let rows = stmt.query_map(params![follower_index], |row| {
            Ok((
                row.get::<_, i64>(0)? as u32,
                Checkpoint {
                    seq_no: row.get::<_, i64>(1)? as u64,
                    primary_term: row.get::<_, i64>(2)? as u64,
                },
            ))
        })?;

        let mut checkpoints = Vec::new();
        for result in rows {
            checkpoints.push(result?);
        }

        Ok(checkpoints)
    }

    /// Forget every checkpoint of a follower index
    pub async fn remove_follower(&self, follower_index: &str) -> Result<u64> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM follow_checkpoints WHERE follower_index = ?1",
            params![follower_index],
        )?;
        Ok(deleted as u64)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::State(format!("SQLite error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_checkpoint_store_basic() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().to_path_buf()).unwrap();
        let shard = ShardRef::new("follower", 0);

        assert_eq!(store.load(&shard).await.unwrap(), Checkpoint::default());

        store.save(&shard, Checkpoint { seq_no: 100, primary_term: 1 }).await.unwrap();
        assert_eq!(store.load(&shard).await.unwrap().seq_no, 100);
    }

    #[tokio::test]
    async fn test_checkpoint_never_regresses() {
        let store = CheckpointStore::in_memory().unwrap();
        let shard = ShardRef::new("follower", 1);

        store.save(&shard, Checkpoint { seq_no: 50, primary_term: 2 }).await.unwrap();
        store.save(&shard, Checkpoint { seq_no: 20, primary_term: 1 }).await.unwrap();

        assert_eq!(
            store.load(&shard).await.unwrap(),
            Checkpoint { seq_no: 50, primary_term: 2 }
        );
    }

    #[tokio::test]
    async fn test_checkpoints_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = CheckpointStore::new(dir.path().to_path_buf()).unwrap();
            store.save(&ShardRef::new("follower", 0), Checkpoint { seq_no: 7, primary_term: 1 }).await.unwrap();
            store.save(&ShardRef::new("follower", 1), Checkpoint { seq_no: 9, primary_term: 1 }).await.unwrap();
            store.save(&ShardRef::new("other", 0), Checkpoint { seq_no: 3, primary_term: 1 }).await.unwrap();
        }

        let store = CheckpointStore::new(dir.path().to_path_buf()).unwrap();
        let all = store.checkpoints_for("follower").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], (0, Checkpoint { seq_no: 7, primary_term: 1 }));
        assert_eq!(all[1].1.seq_no, 9);

        assert_eq!(store.remove_follower("follower").await.unwrap(), 2);
        assert!(store.checkpoints_for("follower").await.unwrap().is_empty());
        assert_eq!(store.load(&ShardRef::new("other", 0)).await.unwrap().seq_no, 3);
    }
}
