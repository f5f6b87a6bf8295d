use crate::error::Result;
use crate::{validate_batch, LatestQuery, ReplaceOptions, ReplaceOutcome, SnapshotStore};
use cloudmon_common::types::{Provider, ResourceMetricsRecord};
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

struct StoredRecord {
    record: ResourceMetricsRecord,
    sync_token: String,
}

/// Keyed by provider name so iteration matches the SQLite ordering.
type SnapshotMap = BTreeMap<(&'static str, String), StoredRecord>;

/// Process-local [`SnapshotStore`]. Contents are lost on restart.
#[derive(Default)]
pub struct MemorySnapshotStore {
    rows: RwLock<SnapshotMap>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, SnapshotMap> {
        self.rows.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, SnapshotMap> {
        self.rows.write().unwrap_or_else(|p| p.into_inner())
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn replace_latest(
        &self,
        provider: Provider,
        records: &[ResourceMetricsRecord],
        options: &ReplaceOptions,
    ) -> Result<ReplaceOutcome> {
        validate_batch(provider, records, options)?;

        let mut rows = self.write();
        for record in records {
            rows.insert(
                (provider.as_str(), record.resource_id().to_string()),
                StoredRecord {
                    record: record.clone(),
                    sync_token: options.sync_token.clone(),
                },
            );
        }
        let before = rows.len();
        rows.retain(|(p, _), stored| {
            *p != provider.as_str() || stored.sync_token == options.sync_token
        });

        let outcome = ReplaceOutcome {
            upserted_count: records.len(),
            stale_deleted_count: before - rows.len(),
        };
        tracing::debug!(
            provider = %provider,
            upserted = outcome.upserted_count,
            stale_deleted = outcome.stale_deleted_count,
            "Replaced in-memory snapshot"
        );
        Ok(outcome)
    }

    fn list_latest(&self, query: &LatestQuery) -> Result<Vec<ResourceMetricsRecord>> {
        let rows = self.read();
        Ok(rows
            .iter()
            .filter(|((p, _), _)| query.provider.map_or(true, |wanted| *p == wanted.as_str()))
            .take(query.limit)
            .map(|(_, stored)| stored.record.clone())
            .collect())
    }
}
