use crate::error::Result;
use crate::{validate_batch, LatestQuery, ReplaceOptions, ReplaceOutcome, SnapshotStore};
use chrono::Utc;
use cloudmon_common::types::{Provider, ResourceMetricsRecord};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const DB_FILE: &str = "snapshots.db";

const SNAPSHOT_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS latest_resource_metrics (
    provider TEXT NOT NULL,
    resource_id TEXT NOT NULL,
    resource_type TEXT NOT NULL,
    record_json TEXT NOT NULL,
    sync_token TEXT NOT NULL,
    fetched_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (provider, resource_id)
);
CREATE INDEX IF NOT EXISTS idx_latest_provider_token
    ON latest_resource_metrics(provider, sync_token);
";

/// [`SnapshotStore`] backed by a single WAL-mode SQLite database.
pub struct SqliteSnapshotStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl SqliteSnapshotStore {
    /// Open (or create) `snapshots.db` under `data_dir`.
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join(DB_FILE);
        let conn = Connection::open(&db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SNAPSHOT_SCHEMA)?;
        tracing::info!(path = %db_path.display(), "Initialized snapshot store");
        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Lock the connection, recovering from a poisoned Mutex if necessary.
    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SnapshotStore for SqliteSnapshotStore {
    fn replace_latest(
        &self,
        provider: Provider,
        records: &[ResourceMetricsRecord],
        options: &ReplaceOptions,
    ) -> Result<ReplaceOutcome> {
        validate_batch(provider, records, options)?;

        let fetched_ms = options.fetched_at.timestamp_millis();
        let now_ms = Utc::now().timestamp_millis();
        let conn = self.lock_conn();
        let tx = conn.unchecked_transaction()?;
        let mut upserted_count = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO latest_resource_metrics
                    (provider, resource_id, resource_type, record_json, sync_token, fetched_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(provider, resource_id) DO UPDATE SET
                    resource_type = excluded.resource_type,
                    record_json = excluded.record_json,
                    sync_token = excluded.sync_token,
                    fetched_at = excluded.fetched_at,
                    updated_at = excluded.updated_at",
            )?;
            for record in records {
                let record_json = serde_json::to_string(record)?;
                upserted_count += stmt.execute(rusqlite::params![
                    provider.as_str(),
                    record.resource_id(),
                    &record.resource.resource_type,
                    record_json,
                    &options.sync_token,
                    fetched_ms,
                    now_ms,
                ])?;
            }
        }
        let stale_deleted_count = tx.execute(
            "DELETE FROM latest_resource_metrics WHERE provider = ?1 AND sync_token <> ?2",
            rusqlite::params![provider.as_str(), &options.sync_token],
        )?;
        tx.commit()?;

        tracing::debug!(
            provider = %provider,
            upserted = upserted_count,
            stale_deleted = stale_deleted_count,
            "Replaced snapshot"
        );
        Ok(ReplaceOutcome {
            upserted_count,
            stale_deleted_count,
        })
    }

    fn list_latest(&self, query: &LatestQuery) -> Result<Vec<ResourceMetricsRecord>> {
        let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);
        let provider = query.provider.map(|p| p.as_str());

        let conn = self.lock_conn();
        let mut stmt = conn.prepare_cached(
            "SELECT record_json FROM latest_resource_metrics
             WHERE (?1 IS NULL OR provider = ?1)
             ORDER BY provider ASC, resource_id ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![provider, limit], |row| {
            row.get::<_, String>(0)
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(serde_json::from_str(&row?)?);
        }
        Ok(records)
    }
}
