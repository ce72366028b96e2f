//! Persistent dedup and checkpoint state

use std::collections::HashSet;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};

use crate::error::{IngestError, IngestResult};
use crate::models::NaturalKey;

/// Bound parameters per statement, well under SQLite's limit
const BIND_BATCH: usize = 400;

/// Resume state for the feed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checkpoint {
    /// Offset of the first record not yet committed
    pub offset: u64,
    /// The last run reached the end of the feed at `offset`
    pub completed: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    pub fn at(offset: u64) -> Self {
        Self {
            offset,
            completed: false,
            updated_at: None,
        }
    }

    pub fn completed_at(offset: u64) -> Self {
        Self {
            offset,
            completed: true,
            updated_at: None,
        }
    }
}

/// Durable membership of emitted keys plus the feed checkpoint
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn seen(&self, key: &NaturalKey) -> IngestResult<bool>;

    /// Subset of `keys` already recorded as emitted
    async fn seen_many(&self, keys: &[NaturalKey]) -> IngestResult<HashSet<NaturalKey>>;

    async fn mark_seen(&self, keys: &[NaturalKey]) -> IngestResult<()>;

    async fn checkpoint(&self, checkpoint: &Checkpoint) -> IngestResult<()>;

    async fn last_checkpoint(&self) -> IngestResult<Checkpoint>;

    /// Mark `keys` seen and move the checkpoint to `next_offset` atomically
    async fn commit_chunk(&self, keys: &[NaturalKey], next_offset: u64) -> IngestResult<()>;

    /// Force the next run back to offset 0. Membership is kept.
    async fn reset_checkpoint(&self) -> IngestResult<()>;
}

/// SQLite-backed state store
#[derive(Clone)]
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    /// Open (creating if needed) the state database and run migrations
    pub async fn new(database_url: &str) -> IngestResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        // A single connection serializes every writer, and keeps in-memory
        // databases from splitting across connections.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        store.verify_integrity().await?;
        Ok(store)
    }

    /// Run database migrations
    pub async fn migrate(&self) -> IngestResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn verify_integrity(&self) -> IngestResult<()> {
        let status: String = sqlx::query_scalar("PRAGMA quick_check")
            .fetch_one(&self.pool)
            .await?;

        if status != "ok" {
            return Err(IngestError::StateCorrupted(format!("quick_check reported: {status}")));
        }
        Ok(())
    }

    /// Number of keys recorded as emitted
    pub async fn seen_count(&self) -> IngestResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM seen_keys")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn insert_keys(conn: &mut SqliteConnection, keys: &[NaturalKey]) -> Result<(), sqlx::Error> {
    let now = Utc::now();

    for batch in keys.chunks(BIND_BATCH) {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "INSERT INTO seen_keys (natural_key, algorithm, digest, first_seen) ",
        );
        qb.push_values(batch, |mut row, key| {
            row.push_bind(key.to_string())
                .push_bind(key.algorithm.as_str())
                .push_bind(key.value.clone())
                .push_bind(now);
        });
        qb.push(" ON CONFLICT(natural_key) DO NOTHING");
        qb.build().execute(&mut *conn).await?;
    }

    Ok(())
}

async fn write_checkpoint(conn: &mut SqliteConnection, checkpoint: &Checkpoint) -> IngestResult<()> {
    let offset = i64::try_from(checkpoint.offset)
        .map_err(|_| IngestError::StateStore(format!("offset {} out of range", checkpoint.offset)))?;

    sqlx::query(
        r#"
        INSERT INTO checkpoint (id, next_offset, completed, updated_at)
        VALUES (1, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            next_offset = excluded.next_offset,
            completed = excluded.completed,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(offset)
    .bind(i64::from(checkpoint.completed))
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn seen(&self, key: &NaturalKey) -> IngestResult<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM seen_keys WHERE natural_key = ?")
            .bind(key.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn seen_many(&self, keys: &[NaturalKey]) -> IngestResult<HashSet<NaturalKey>> {
        let mut found = HashSet::new();

        for batch in keys.chunks(BIND_BATCH) {
            let mut qb = QueryBuilder::<Sqlite>::new("SELECT natural_key FROM seen_keys WHERE natural_key IN (");
            let mut separated = qb.separated(", ");
            for key in batch {
                separated.push_bind(key.to_string());
            }
            separated.push_unseparated(")");

            let rows: HashSet<String> = qb
                .build_query_scalar::<String>()
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .collect();

            found.extend(batch.iter().filter(|k| rows.contains(&k.to_string())).cloned());
        }

        Ok(found)
    }

    async fn mark_seen(&self, keys: &[NaturalKey]) -> IngestResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        insert_keys(&mut tx, keys).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn checkpoint(&self, checkpoint: &Checkpoint) -> IngestResult<()> {
        let mut conn = self.pool.acquire().await?;
        write_checkpoint(&mut conn, checkpoint).await
    }

    async fn last_checkpoint(&self) -> IngestResult<Checkpoint> {
        let row: Option<(i64, i64, String)> =
            sqlx::query_as("SELECT next_offset, completed, updated_at FROM checkpoint WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;

        let Some((offset, completed, updated_at)) = row else {
            return Ok(Checkpoint::default());
        };

        let offset = u64::try_from(offset)
            .map_err(|_| IngestError::StateCorrupted(format!("negative checkpoint offset {offset}")))?;
        let completed = match completed {
            0 => false,
            1 => true,
            other => {
                return Err(IngestError::StateCorrupted(format!("invalid completed flag {other}")));
            }
        };
        let updated_at = DateTime::parse_from_rfc3339(&updated_at)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| IngestError::StateCorrupted(format!("invalid checkpoint timestamp: {e}")))?;

        Ok(Checkpoint {
            offset,
            completed,
            updated_at: Some(updated_at),
        })
    }

    async fn commit_chunk(&self, keys: &[NaturalKey], next_offset: u64) -> IngestResult<()> {
        let mut tx = self.pool.begin().await?;
        insert_keys(&mut tx, keys).await?;
        write_checkpoint(&mut tx, &Checkpoint::at(next_offset)).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn reset_checkpoint(&self) -> IngestResult<()> {
        tracing::warn!("Resetting checkpoint to offset 0");
        self.checkpoint(&Checkpoint::default()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HashAlgorithm;

    fn key(value: &str) -> NaturalKey {
        NaturalKey::new(HashAlgorithm::Sha256, value)
    }

    async fn memory_store() -> SqliteStateStore {
        SqliteStateStore::new("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_empty_store_starts_at_zero() {
        let store = memory_store().await;
        assert_eq!(store.last_checkpoint().await.unwrap(), Checkpoint::default());
        assert!(!store.seen(&key("abc123")).await.unwrap());
        assert_eq!(store.seen_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mark_and_query_membership() {
        let store = memory_store().await;
        store.mark_seen(&[key("aa"), key("bb")]).await.unwrap();
        store.mark_seen(&[key("aa")]).await.unwrap();

        assert!(store.seen(&key("aa")).await.unwrap());
        assert!(!store.seen(&NaturalKey::new(HashAlgorithm::Md5, "aa")).await.unwrap());

        let found = store.seen_many(&[key("aa"), key("bb"), key("cc")]).await.unwrap();
        assert_eq!(found, HashSet::from([key("aa"), key("bb")]));
        assert_eq!(store.seen_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_seen_many_spans_batches() {
        let store = memory_store().await;
        let keys: Vec<_> = (0..1000).map(|i| key(&format!("{i:04x}"))).collect();
        store.mark_seen(&keys[..900]).await.unwrap();

        let found = store.seen_many(&keys).await.unwrap();
        assert_eq!(found.len(), 900);
        assert!(!found.contains(&keys[950]));
    }

    #[tokio::test]
    async fn test_commit_chunk_moves_keys_and_offset_together() {
        let store = memory_store().await;
        store.commit_chunk(&[key("aa")], 5000).await.unwrap();

        let cp = store.last_checkpoint().await.unwrap();
        assert_eq!(cp.offset, 5000);
        assert!(!cp.completed);
        let age = Utc::now() - cp.updated_at.unwrap();
        assert!(age.num_seconds().abs() < 60, "updated_at is {age} old");
        assert!(store.seen(&key("aa")).await.unwrap());

        let (first_seen,): (String,) = sqlx::query_as("SELECT first_seen FROM seen_keys WHERE digest = 'aa'")
            .fetch_one(store.pool())
            .await
            .unwrap();
        let first_seen = DateTime::parse_from_rfc3339(&first_seen).unwrap();
        assert!((Utc::now() - first_seen.with_timezone(&Utc)).num_seconds().abs() < 60);

        store.checkpoint(&Checkpoint::completed_at(7000)).await.unwrap();
        let cp = store.last_checkpoint().await.unwrap();
        assert_eq!((cp.offset, cp.completed), (7000, true));

        store.reset_checkpoint().await.unwrap();
        assert_eq!(store.last_checkpoint().await.unwrap().offset, 0);
        assert!(store.seen(&key("aa")).await.unwrap());
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("state.db").display());

        {
            let store = SqliteStateStore::new(&url).await.unwrap();
            store.commit_chunk(&[key("abc123")], 10).await.unwrap();
            store.pool().close().await;
        }

        let store = SqliteStateStore::new(&url).await.unwrap();
        assert!(store.seen(&key("abc123")).await.unwrap());
        assert_eq!(store.last_checkpoint().await.unwrap().offset, 10);
    }

    #[tokio::test]
    async fn test_detects_corrupt_checkpoint() {
        let store = memory_store().await;
        sqlx::query("INSERT INTO checkpoint (id, next_offset, completed, updated_at) VALUES (1, -4, 0, '2024-01-01T00:00:00Z')")
            .execute(store.pool())
            .await
            .unwrap();

        let err = store.last_checkpoint().await.unwrap_err();
        assert!(matches!(err, IngestError::StateCorrupted(_)));

        store.reset_checkpoint().await.unwrap();
        let cp = store.last_checkpoint().await.unwrap();
        assert_eq!((cp.offset, cp.completed), (0, false));
    }
}
