pub mod id;
pub mod types;

pub use types::{
    MetricSample, Provider, RecordMetadata, ResourceDescriptor, ResourceMetricsRecord,
    StageErrors, SyncDomain, SyncRunSummary, SyncState, SyncStatus, SyncTrigger,
};
