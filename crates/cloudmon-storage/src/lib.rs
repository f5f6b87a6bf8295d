//! Latest-snapshot storage for normalized resource metrics.
//!
//! Each provider owns one snapshot: the records written by its most recent
//! successful sync. [`SnapshotStore::replace_latest`] swaps a provider's
//! snapshot in one step, tagging every written row with the run's sync token
//! and deleting rows that carry any other token. Two backends are provided:
//! [`sqlite::SqliteSnapshotStore`] (WAL-mode SQLite) and
//! [`memory::MemorySnapshotStore`].

pub mod error;
pub mod memory;
pub mod sqlite;

#[cfg(test)]
mod tests;

use chrono::{DateTime, Utc};
use cloudmon_common::types::{Provider, ResourceMetricsRecord};
use error::{Result, StorageError};
use std::collections::HashSet;

pub use memory::MemorySnapshotStore;
pub use sqlite::SqliteSnapshotStore;

/// Run identity attached to a replace-latest commit.
#[derive(Debug, Clone)]
pub struct ReplaceOptions {
    pub fetched_at: DateTime<Utc>,
    pub sync_token: String,
}

/// Row counts of one replace-latest commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaceOutcome {
    pub upserted_count: usize,
    pub stale_deleted_count: usize,
}

/// Filter for reading stored snapshots.
///
/// # Examples
///
/// ```
/// use cloudmon_common::types::Provider;
/// use cloudmon_storage::LatestQuery;
///
/// let query = LatestQuery::for_provider(Provider::Aws, 50);
/// assert_eq!(query.provider, Some(Provider::Aws));
/// assert_eq!(query.limit, 50);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatestQuery {
    pub provider: Option<Provider>,
    pub limit: usize,
}

impl LatestQuery {
    pub fn all(limit: usize) -> Self {
        Self {
            provider: None,
            limit,
        }
    }

    pub fn for_provider(provider: Provider, limit: usize) -> Self {
        Self {
            provider: Some(provider),
            limit,
        }
    }
}

/// Persistence backend for per-provider latest snapshots.
///
/// Implementations must be safe to share across threads (`Send + Sync`)
/// because the orchestrator commits from whichever task finished a run
/// while readers list records concurrently.
pub trait SnapshotStore: Send + Sync {
    /// Upserts every record under `options.sync_token`, then deletes every
    /// row of `provider` carrying a different token. Either both happen or
    /// neither does.
    ///
    /// Records must belong to `provider`, have a non-empty resource id, and
    /// be unique by resource id.
    fn replace_latest(
        &self,
        provider: Provider,
        records: &[ResourceMetricsRecord],
        options: &ReplaceOptions,
    ) -> Result<ReplaceOutcome>;

    /// Stored records ordered by provider, then resource id, at most
    /// `query.limit` of them.
    fn list_latest(&self, query: &LatestQuery) -> Result<Vec<ResourceMetricsRecord>>;
}

/// Reject a batch that would break the one-row-per-resource snapshot.
pub(crate) fn validate_batch(
    provider: Provider,
    records: &[ResourceMetricsRecord],
    options: &ReplaceOptions,
) -> Result<()> {
    if options.sync_token.is_empty() {
        return Err(StorageError::InvalidRecord(
            "sync token must not be empty".to_string(),
        ));
    }
    let mut seen = HashSet::with_capacity(records.len());
    for record in records {
        if record.provider() != provider {
            return Err(StorageError::InvalidRecord(format!(
                "record {} belongs to {}, not {}",
                record.resource_id(),
                record.provider(),
                provider
            )));
        }
        if record.resource_id().is_empty() {
            return Err(StorageError::InvalidRecord(format!(
                "{provider} record has an empty resource id"
            )));
        }
        if !seen.insert(record.resource_id()) {
            return Err(StorageError::InvalidRecord(format!(
                "duplicate {} resource id {}",
                provider,
                record.resource_id()
            )));
        }
    }
    Ok(())
}
