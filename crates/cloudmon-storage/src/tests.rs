use crate::error::StorageError;
use crate::memory::MemorySnapshotStore;
use crate::sqlite::SqliteSnapshotStore;
use crate::{LatestQuery, ReplaceOptions, SnapshotStore};
use chrono::Utc;
use cloudmon_common::types::{MetricSample, Provider, ResourceDescriptor, ResourceMetricsRecord};
use tempfile::TempDir;

fn setup() -> (TempDir, SqliteSnapshotStore) {
    let dir = TempDir::new().unwrap();
    let store = SqliteSnapshotStore::new(dir.path()).unwrap();
    (dir, store)
}

fn make_record(provider: Provider, id: &str, value: f64) -> ResourceMetricsRecord {
    let desc = ResourceDescriptor::new(provider, id, id, format!("{provider}/test"), "acct-1");
    let mut record = ResourceMetricsRecord::new(desc, Utc::now());
    record.metrics.push(MetricSample {
        name: "cpu".to_string(),
        namespace: None,
        unit: Some("Percent".to_string()),
        value,
        average: Some(value),
        minimum: None,
        maximum: None,
        total: None,
        count: None,
        timestamp: Some(Utc::now()),
    });
    record
}

fn options(token: &str) -> ReplaceOptions {
    ReplaceOptions {
        fetched_at: Utc::now(),
        sync_token: token.to_string(),
    }
}

fn ids(records: &[ResourceMetricsRecord]) -> Vec<&str> {
    records.iter().map(|r| r.resource_id()).collect()
}

fn replace_deletes_records_missing_from_new_run(store: &dyn SnapshotStore) {
    let first = vec![
        make_record(Provider::Aws, "a", 1.0),
        make_record(Provider::Aws, "b", 2.0),
        make_record(Provider::Aws, "c", 3.0),
    ];
    let outcome = store.replace_latest(Provider::Aws, &first, &options("t1")).unwrap();
    assert_eq!(outcome.upserted_count, 3);
    assert_eq!(outcome.stale_deleted_count, 0);

    let second = vec![
        make_record(Provider::Aws, "b", 20.0),
        make_record(Provider::Aws, "d", 4.0),
    ];
    let outcome = store.replace_latest(Provider::Aws, &second, &options("t2")).unwrap();
    assert_eq!(outcome.upserted_count, 2);
    assert_eq!(outcome.stale_deleted_count, 2);

    let stored = store.list_latest(&LatestQuery::for_provider(Provider::Aws, 100)).unwrap();
    assert_eq!(ids(&stored), vec!["b", "d"]);
    assert_eq!(stored[0].metrics[0].value, 20.0);
}

fn replace_leaves_other_providers_alone(store: &dyn SnapshotStore) {
    store
        .replace_latest(Provider::Azure, &[make_record(Provider::Azure, "/vm1", 1.0)], &options("az"))
        .unwrap();
    store
        .replace_latest(Provider::Aws, &[make_record(Provider::Aws, "i-1", 1.0)], &options("aws1"))
        .unwrap();
    let outcome = store.replace_latest(Provider::Aws, &[], &options("aws2")).unwrap();
    assert_eq!(outcome.stale_deleted_count, 1);

    let stored = store.list_latest(&LatestQuery::all(100)).unwrap();
    assert_eq!(ids(&stored), vec!["/vm1"]);
}

fn invalid_batch_writes_nothing(store: &dyn SnapshotStore) {
    let good = vec![make_record(Provider::Rackspace, "e1", 1.0)];
    store.replace_latest(Provider::Rackspace, &good, &options("t1")).unwrap();

    let duplicate = vec![
        make_record(Provider::Rackspace, "e2", 1.0),
        make_record(Provider::Rackspace, "e2", 2.0),
    ];
    let err = store
        .replace_latest(Provider::Rackspace, &duplicate, &options("t2"))
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidRecord(_)));

    let foreign = vec![make_record(Provider::Aws, "e3", 1.0)];
    assert!(store.replace_latest(Provider::Rackspace, &foreign, &options("t3")).is_err());

    let empty_id = vec![make_record(Provider::Rackspace, "", 1.0)];
    assert!(store.replace_latest(Provider::Rackspace, &empty_id, &options("t4")).is_err());

    assert!(store.replace_latest(Provider::Rackspace, &good, &options("")).is_err());

    let stored = store.list_latest(&LatestQuery::all(100)).unwrap();
    assert_eq!(stored, good);
}

fn list_orders_by_provider_then_id_and_limits(store: &dyn SnapshotStore) {
    store
        .replace_latest(
            Provider::Rackspace,
            &[make_record(Provider::Rackspace, "r2", 1.0), make_record(Provider::Rackspace, "r1", 1.0)],
            &options("r"),
        )
        .unwrap();
    store
        .replace_latest(
            Provider::Azure,
            &[make_record(Provider::Azure, "z", 1.0)],
            &options("z"),
        )
        .unwrap();
    store
        .replace_latest(
            Provider::Aws,
            &[make_record(Provider::Aws, "y", 1.0), make_record(Provider::Aws, "x", 1.0)],
            &options("a"),
        )
        .unwrap();

    let all = store.list_latest(&LatestQuery::all(100)).unwrap();
    assert_eq!(ids(&all), vec!["x", "y", "z", "r1", "r2"]);

    let limited = store.list_latest(&LatestQuery::all(3)).unwrap();
    assert_eq!(ids(&limited), vec!["x", "y", "z"]);

    let rackspace = store
        .list_latest(&LatestQuery::for_provider(Provider::Rackspace, 1))
        .unwrap();
    assert_eq!(ids(&rackspace), vec!["r1"]);

    assert!(store.list_latest(&LatestQuery::all(0)).unwrap().is_empty());
}

#[test]
fn sqlite_replace_deletes_stale_rows() {
    let (_dir, store) = setup();
    replace_deletes_records_missing_from_new_run(&store);
}

#[test]
fn memory_replace_deletes_stale_rows() {
    replace_deletes_records_missing_from_new_run(&MemorySnapshotStore::new());
}

#[test]
fn sqlite_replace_is_scoped_to_provider() {
    let (_dir, store) = setup();
    replace_leaves_other_providers_alone(&store);
}

#[test]
fn memory_replace_is_scoped_to_provider() {
    replace_leaves_other_providers_alone(&MemorySnapshotStore::new());
}

#[test]
fn sqlite_rejects_invalid_batch_without_writing() {
    let (_dir, store) = setup();
    invalid_batch_writes_nothing(&store);
}

#[test]
fn memory_rejects_invalid_batch_without_writing() {
    invalid_batch_writes_nothing(&MemorySnapshotStore::new());
}

#[test]
fn sqlite_list_ordering_and_limit() {
    let (_dir, store) = setup();
    list_orders_by_provider_then_id_and_limits(&store);
}

#[test]
fn memory_list_ordering_and_limit() {
    list_orders_by_provider_then_id_and_limits(&MemorySnapshotStore::new());
}

#[test]
fn sqlite_snapshot_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let record = make_record(Provider::Azure, "/subscriptions/s1/vm", 42.5);
    {
        let store = SqliteSnapshotStore::new(dir.path()).unwrap();
        store
            .replace_latest(Provider::Azure, &[record.clone()], &options("t1"))
            .unwrap();
    }

    let store = SqliteSnapshotStore::new(dir.path()).unwrap();
    assert!(store.db_path().ends_with("snapshots.db"));
    let stored = store.list_latest(&LatestQuery::all(10)).unwrap();
    assert_eq!(stored, vec![record]);
}

#[test]
fn sqlite_same_token_rewrite_deletes_nothing() {
    let (_dir, store) = setup();
    let records = vec![make_record(Provider::Aws, "a", 1.0)];
    store.replace_latest(Provider::Aws, &records, &options("t1")).unwrap();
    let outcome = store.replace_latest(Provider::Aws, &records, &options("t1")).unwrap();
    assert_eq!(outcome.upserted_count, 1);
    assert_eq!(outcome.stale_deleted_count, 0);
}
