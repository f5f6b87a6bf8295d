#![allow(dead_code)]

use chrono::Utc;
use cloudmon_cloud::error::{CloudError, Result};
use cloudmon_cloud::{CollectionReport, ProviderCollector};
use cloudmon_common::{Provider, ResourceDescriptor, ResourceMetricsRecord};
use cloudmon_server::orchestrator::SyncOrchestrator;
use cloudmon_storage::{MemorySnapshotStore, SnapshotStore};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub const INTERVAL: Duration = Duration::from_secs(900);

/// Scripted collector: pops one queued result per run, or reports an empty
/// snapshot once the queue is drained.
pub struct FakeCollector {
    provider: Provider,
    configured: bool,
    results: Mutex<VecDeque<Result<CollectionReport>>>,
    calls: AtomicUsize,
    /// Notified when a run enters `collect`.
    pub entered: Arc<Notify>,
    /// When set, `collect` waits for a permit before returning.
    gate: Option<Arc<Notify>>,
}

impl FakeCollector {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            configured: true,
            results: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            entered: Arc::new(Notify::new()),
            gate: None,
        }
    }

    pub fn unconfigured(provider: Provider) -> Self {
        Self {
            configured: false,
            ..Self::new(provider)
        }
    }

    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn push(&self, result: Result<CollectionReport>) {
        self.results.lock().unwrap().push_back(result);
    }

    pub fn push_records(&self, ids: &[&str]) {
        self.push(Ok(report(self.provider, ids)));
    }

    pub fn push_discovery_failure(&self) {
        self.push(Err(CloudError::Discovery {
            provider: self.provider,
            message: "every region failed".to_string(),
        }));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ProviderCollector for FakeCollector {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn is_configured(&self) -> bool {
        self.configured
    }

    async fn collect(&self) -> Result<CollectionReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let next = self.results.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(CollectionReport::empty(self.provider)))
    }
}

pub fn record(provider: Provider, id: &str) -> ResourceMetricsRecord {
    let desc = ResourceDescriptor::new(provider, id, id, format!("{provider}/fake"), "acct-1");
    ResourceMetricsRecord::new(desc, Utc::now())
}

pub fn report(provider: Provider, ids: &[&str]) -> CollectionReport {
    let mut report = CollectionReport::empty(provider);
    report.records = ids.iter().map(|id| record(provider, id)).collect();
    report.resources_discovered = ids.len();
    report.resources_processed = ids.len();
    report
}

pub struct TestContext {
    pub orchestrator: Arc<SyncOrchestrator>,
    pub store: Arc<MemorySnapshotStore>,
    pub azure: Arc<FakeCollector>,
    pub aws: Arc<FakeCollector>,
    pub rackspace: Arc<FakeCollector>,
}

pub fn build_test_context(
    azure: FakeCollector,
    aws: FakeCollector,
    rackspace: FakeCollector,
) -> TestContext {
    let store = Arc::new(MemorySnapshotStore::new());
    let azure = Arc::new(azure);
    let aws = Arc::new(aws);
    let rackspace = Arc::new(rackspace);
    let collectors: Vec<Arc<dyn ProviderCollector>> =
        vec![azure.clone(), aws.clone(), rackspace.clone()];
    let orchestrator = Arc::new(SyncOrchestrator::new(
        collectors,
        store.clone() as Arc<dyn SnapshotStore>,
        INTERVAL,
    ));
    TestContext {
        orchestrator,
        store,
        azure,
        aws,
        rackspace,
    }
}

pub fn all_configured() -> TestContext {
    build_test_context(
        FakeCollector::new(Provider::Azure),
        FakeCollector::new(Provider::Aws),
        FakeCollector::new(Provider::Rackspace),
    )
}
