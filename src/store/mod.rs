// Local SQLite store for Docker state snapshots.
// Tables are keyed by millisecond timestamp; every write evicts rows older than the TTL
// inside the same transaction, so snapshots, labels and usage rows never drift apart.

mod blob;

use crate::models::{ContainerUsage, DockerStateSnapshot};
use chrono::TimeZone;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::instrument;

/// Default retention window for persisted snapshots.
pub const DEFAULT_TTL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Error)]
pub enum StoreError {
    /// A record with this timestamp already exists; the write was dropped.
    #[error("record with key {ts} already exists")]
    Constraint { ts: i64 },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),
}

/// Snapshot as read back from the store.
#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub ts: i64,
    pub ids: Vec<String>,
    pub state: DockerStateSnapshot,
}

/// Human-readable `HH:MM:SS` chart label for a snapshot key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineLabel {
    pub ts: i64,
    pub label: String,
}

/// Row counts removed by one cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub snapshots: u64,
    pub labels: u64,
    pub usage: u64,
}

pub struct LocalStore {
    pool: SqlitePool,
    ttl_ms: i64,
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// `HH:MM:SS` in local time; falls back to UTC for timestamps the local zone cannot map.
pub fn timeline_label(ts: i64) -> String {
    match chrono::Local.timestamp_millis_opt(ts).single() {
        Some(t) => t.format("%H:%M:%S").to_string(),
        None => chrono::Utc
            .timestamp_millis_opt(ts)
            .single()
            .map(|t| t.format("%H:%M:%S").to_string())
            .unwrap_or_else(|| "00:00:00".into()),
    }
}

impl LocalStore {
    /// Open (creating if missing) the store at `path` for writing. WAL so readers never block the writer.
    pub async fn connect(path: &str, ttl: Duration, max_pool_size: u32) -> anyhow::Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_pool_size)
            .connect_with(opts)
            .await?;
        Ok(Self {
            pool,
            ttl_ms: ttl.as_millis() as i64,
        })
    }

    /// Open an existing store read-only (consumers other than the relay).
    pub async fn connect_read_only(path: &str) -> anyhow::Result<Self> {
        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path))?
            .read_only(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new().connect_with(opts).await?;
        Ok(Self {
            pool,
            ttl_ms: DEFAULT_TTL.as_millis() as i64,
        })
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms as u64)
    }

    pub async fn init(&self) -> anyhow::Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_version (key TEXT PRIMARY KEY, value INTEGER NOT NULL)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("INSERT OR IGNORE INTO schema_version (key, value) VALUES ('store', 1)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS docker_state (
                ts INTEGER PRIMARY KEY,
                ids TEXT NOT NULL,
                data BLOB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS timeline_labels (ts INTEGER PRIMARY KEY, label TEXT NOT NULL)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS container_usage (
                container_id TEXT NOT NULL,
                ts INTEGER NOT NULL,
                data BLOB NOT NULL,
                PRIMARY KEY (container_id, ts)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_container_usage_ts ON container_usage(ts)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Insert `snapshot` keyed by the current time. See [`LocalStore::put_at`].
    pub async fn put(&self, snapshot: &DockerStateSnapshot) -> Result<i64, StoreError> {
        self.put_at(now_ms(), snapshot).await
    }

    /// Insert the snapshot, its timeline label and per-container usage rows under `ts`,
    /// then delete everything older than `ts - ttl`. One transaction.
    /// A second write with the same `ts` fails with [`StoreError::Constraint`] and changes nothing.
    #[instrument(skip(self, snapshot), fields(repo = "store", operation = "put", containers = snapshot.containers.len()))]
    pub async fn put_at(&self, ts: i64, snapshot: &DockerStateSnapshot) -> Result<i64, StoreError> {
        let ids = serde_json::to_string(&snapshot.ids())
            .map_err(|e| StoreError::Encode(e.to_string()))?;
        let data = blob::with_version_prefix(
            blob::SNAPSHOT_BLOB_VERSION,
            serde_json::to_vec(snapshot).map_err(|e| StoreError::Encode(e.to_string()))?,
        );

        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO docker_state (ts, ids, data) VALUES ($1, $2, $3)")
            .bind(ts)
            .bind(&ids)
            .bind(&data)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_insert_error(e, ts))?;

        sqlx::query("INSERT INTO timeline_labels (ts, label) VALUES ($1, $2)")
            .bind(ts)
            .bind(timeline_label(ts))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_insert_error(e, ts))?;

        for (id, container) in &snapshot.containers {
            let usage = ContainerUsage::from_snapshot(container);
            let usage_blob = blob::with_version_prefix(
                blob::USAGE_BLOB_VERSION,
                wincode::serialize(&usage).map_err(|e| StoreError::Encode(e.to_string()))?,
            );
            sqlx::query("INSERT INTO container_usage (container_id, ts, data) VALUES ($1, $2, $3)")
                .bind(id)
                .bind(ts)
                .bind(&usage_blob)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_insert_error(e, ts))?;
        }

        let removed = delete_older_than(&mut tx, ts - self.ttl_ms).await?;
        tx.commit().await?;

        if removed.snapshots > 0 {
            tracing::debug!(
                operation = "cleanup",
                snapshots = removed.snapshots,
                labels = removed.labels,
                usage = removed.usage,
                "expired records removed"
            );
        }
        Ok(ts)
    }

    /// Delete all records older than `now - ttl`.
    pub async fn cleanup(&self) -> Result<CleanupStats, StoreError> {
        self.cleanup_at(now_ms()).await
    }

    #[instrument(skip(self), fields(repo = "store", operation = "cleanup"))]
    pub async fn cleanup_at(&self, now: i64) -> Result<CleanupStats, StoreError> {
        let mut tx = self.pool.begin().await?;
        let stats = delete_older_than(&mut tx, now - self.ttl_ms).await?;
        tx.commit().await?;
        Ok(stats)
    }

    /// Newest snapshot, if any.
    pub async fn latest(&self) -> Result<Option<StoredSnapshot>, StoreError> {
        let row = sqlx::query("SELECT ts, ids, data FROM docker_state ORDER BY ts DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| parse_snapshot_row(&r)).transpose()
    }

    /// Up to `limit` newest snapshots, returned oldest first.
    pub async fn recent(&self, limit: u32) -> Result<Vec<StoredSnapshot>, StoreError> {
        let rows = sqlx::query("SELECT ts, ids, data FROM docker_state ORDER BY ts DESC LIMIT $1")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        let mut out = rows
            .iter()
            .map(parse_snapshot_row)
            .collect::<Result<Vec<_>, _>>()?;
        out.reverse();
        Ok(out)
    }

    /// Snapshots in [from_ts, to_ts), ascending.
    #[instrument(skip(self), fields(repo = "store", operation = "range"))]
    pub async fn range(&self, from_ts: i64, to_ts: i64) -> Result<Vec<StoredSnapshot>, StoreError> {
        let rows = sqlx::query(
            "SELECT ts, ids, data FROM docker_state WHERE ts >= $1 AND ts < $2 ORDER BY ts ASC",
        )
        .bind(from_ts)
        .bind(to_ts)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_snapshot_row).collect()
    }

    /// Timeline labels in [from_ts, to_ts), ascending.
    pub async fn labels(&self, from_ts: i64, to_ts: i64) -> Result<Vec<TimelineLabel>, StoreError> {
        let rows = sqlx::query(
            "SELECT ts, label FROM timeline_labels WHERE ts >= $1 AND ts < $2 ORDER BY ts ASC",
        )
        .bind(from_ts)
        .bind(to_ts)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| -> Result<TimelineLabel, StoreError> {
                Ok(TimelineLabel {
                    ts: r.try_get("ts")?,
                    label: r.try_get("label")?,
                })
            })
            .collect()
    }

    /// Usage samples for one container, ascending by time.
    pub async fn memory_history(
        &self,
        container_id: &str,
    ) -> Result<Vec<(i64, ContainerUsage)>, StoreError> {
        let rows = sqlx::query(
            "SELECT ts, data FROM container_usage WHERE container_id = $1 ORDER BY ts ASC",
        )
        .bind(container_id)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let ts: i64 = row.try_get("ts")?;
            let data: Vec<u8> = row.try_get("data")?;
            let payload = blob::blob_payload(&data, blob::USAGE_BLOB_VERSION)
                .ok_or_else(|| StoreError::Decode(format!("usage blob at {}: unknown version", ts)))?;
            let usage: ContainerUsage = wincode::deserialize(payload)
                .map_err(|e| StoreError::Decode(format!("usage blob at {}: {}", ts, e)))?;
            out.push((ts, usage));
        }
        Ok(out)
    }

    /// Number of (snapshots, labels) currently stored.
    pub async fn count(&self) -> Result<(u64, u64), StoreError> {
        let snapshots: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM docker_state")
            .fetch_one(&self.pool)
            .await?;
        let labels: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM timeline_labels")
            .fetch_one(&self.pool)
            .await?;
        Ok((snapshots as u64, labels as u64))
    }

    #[instrument(skip(self), fields(repo = "store", operation = "vacuum"))]
    pub async fn vacuum(&self) -> Result<(), StoreError> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn delete_older_than(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    cutoff: i64,
) -> Result<CleanupStats, StoreError> {
    let snapshots = sqlx::query("DELETE FROM docker_state WHERE ts < $1")
        .bind(cutoff)
        .execute(&mut **tx)
        .await?
        .rows_affected();
    let labels = sqlx::query("DELETE FROM timeline_labels WHERE ts < $1")
        .bind(cutoff)
        .execute(&mut **tx)
        .await?
        .rows_affected();
    let usage = sqlx::query("DELETE FROM container_usage WHERE ts < $1")
        .bind(cutoff)
        .execute(&mut **tx)
        .await?
        .rows_affected();
    Ok(CleanupStats {
        snapshots,
        labels,
        usage,
    })
}

fn map_insert_error(e: sqlx::Error, ts: i64) -> StoreError {
    if let sqlx::Error::Database(db) = &e
        && db.is_unique_violation()
    {
        return StoreError::Constraint { ts };
    }
    StoreError::Database(e)
}

fn parse_snapshot_row(row: &sqlx::sqlite::SqliteRow) -> Result<StoredSnapshot, StoreError> {
    let ts: i64 = row.try_get("ts")?;
    let ids: String = row.try_get("ids")?;
    let data: Vec<u8> = row.try_get("data")?;
    let ids: Vec<String> =
        serde_json::from_str(&ids).map_err(|e| StoreError::Decode(format!("ids at {}: {}", ts, e)))?;
    let payload = blob::blob_payload(&data, blob::SNAPSHOT_BLOB_VERSION)
        .ok_or_else(|| StoreError::Decode(format!("snapshot blob at {}: unknown version", ts)))?;
    let state: DockerStateSnapshot = serde_json::from_slice(payload)
        .map_err(|e| StoreError::Decode(format!("snapshot blob at {}: {}", ts, e)))?;
    Ok(StoredSnapshot { ts, ids, state })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeline_label_is_hh_mm_ss() {
        let label = timeline_label(1_700_000_000_000);
        assert_eq!(label.len(), 8);
        assert_eq!(label.as_bytes()[2], b':');
        assert_eq!(label.as_bytes()[5], b':');
    }
}
