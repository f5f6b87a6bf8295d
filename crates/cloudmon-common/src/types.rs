use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Upper bound on warnings kept per record. Further warnings are counted
/// but dropped.
pub const MAX_RECORD_WARNINGS: usize = 10;

/// A cloud or monitoring platform this engine collects from.
///
/// # Examples
///
/// ```
/// use cloudmon_common::types::Provider;
///
/// let p: Provider = "AWS".parse().unwrap();
/// assert_eq!(p, Provider::Aws);
/// assert_eq!(p.to_string(), "aws");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Azure,
    Aws,
    Rackspace,
}

impl Provider {
    /// All providers, in the order an aggregate run visits them.
    pub const ALL: [Provider; 3] = [Provider::Azure, Provider::Aws, Provider::Rackspace];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Azure => "azure",
            Provider::Aws => "aws",
            Provider::Rackspace => "rackspace",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "azure" => Ok(Provider::Azure),
            "aws" => Ok(Provider::Aws),
            "rackspace" => Ok(Provider::Rackspace),
            _ => Err(format!("unknown provider: {s}")),
        }
    }
}

/// Unit of mutual exclusion for sync runs: one provider, or the aggregate.
///
/// Serialized as its string form (`"aws"`, `"all"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum SyncDomain {
    Provider(Provider),
    All,
}

impl SyncDomain {
    /// The providers a run of this domain covers, in execution order.
    pub fn providers(&self) -> Vec<Provider> {
        match self {
            SyncDomain::Provider(p) => vec![*p],
            SyncDomain::All => Provider::ALL.to_vec(),
        }
    }
}

impl std::fmt::Display for SyncDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncDomain::Provider(p) => write!(f, "{p}"),
            SyncDomain::All => f.write_str("all"),
        }
    }
}

impl std::str::FromStr for SyncDomain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("all") {
            return Ok(SyncDomain::All);
        }
        s.parse::<Provider>().map(SyncDomain::Provider)
    }
}

impl From<SyncDomain> for String {
    fn from(d: SyncDomain) -> Self {
        d.to_string()
    }
}

impl TryFrom<String> for SyncDomain {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Provider> for SyncDomain {
    fn from(p: Provider) -> Self {
        SyncDomain::Provider(p)
    }
}

/// One monitorable entity discovered within a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub provider: Provider,
    /// Provider-specific URI or path, unique within one provider snapshot.
    pub resource_id: String,
    pub resource_name: String,
    /// Lowercase, slash-delimited taxonomy, e.g. `microsoft.compute/virtualmachines`.
    pub resource_type: String,
    pub account_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Free-form attributes such as kind, sku or vm size.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl ResourceDescriptor {
    pub fn new(
        provider: Provider,
        resource_id: impl Into<String>,
        resource_name: impl Into<String>,
        resource_type: impl Into<String>,
        account_id: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            resource_id: resource_id.into(),
            resource_name: resource_name.into(),
            resource_type: resource_type.into().to_lowercase(),
            account_id: account_id.into(),
            subscription_id: None,
            resource_group: None,
            location: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Metadata value as a string, if present and a string.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

/// The single most recent observed sample for one named metric on one
/// resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Representative value derived from the native aggregations.
    pub value: f64,
    pub average: Option<f64>,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    pub total: Option<f64>,
    pub count: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Per-record diagnostics: a fatal-for-this-resource error and a bounded
/// list of non-fatal warnings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Warnings dropped after [`MAX_RECORD_WARNINGS`] was reached.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub warnings_dropped: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl RecordMetadata {
    /// Append a warning, keeping at most [`MAX_RECORD_WARNINGS`].
    ///
    /// ```
    /// use cloudmon_common::types::{RecordMetadata, MAX_RECORD_WARNINGS};
    ///
    /// let mut meta = RecordMetadata::default();
    /// for i in 0..(MAX_RECORD_WARNINGS + 3) {
    ///     meta.push_warning(format!("warning {i}"));
    /// }
    /// assert_eq!(meta.warnings.len(), MAX_RECORD_WARNINGS);
    /// assert_eq!(meta.warnings_dropped, 3);
    /// ```
    pub fn push_warning(&mut self, warning: impl Into<String>) {
        if self.warnings.len() < MAX_RECORD_WARNINGS {
            self.warnings.push(warning.into());
        } else {
            self.warnings_dropped += 1;
        }
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Unit of replacement in the snapshot store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetricsRecord {
    pub resource: ResourceDescriptor,
    pub metrics: Vec<MetricSample>,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: RecordMetadata,
}

impl ResourceMetricsRecord {
    pub fn new(resource: ResourceDescriptor, fetched_at: DateTime<Utc>) -> Self {
        Self {
            resource,
            metrics: Vec::new(),
            fetched_at,
            metadata: RecordMetadata::default(),
        }
    }

    /// A synthetic record describing a failed discovery unit (account,
    /// region or subscription) rather than a real resource.
    pub fn unit_failure(
        resource: ResourceDescriptor,
        fetched_at: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        let mut record = Self::new(resource, fetched_at);
        record.metadata.error = Some(error.into());
        record
    }

    pub fn provider(&self) -> Provider {
        self.resource.provider
    }

    pub fn resource_id(&self) -> &str {
        &self.resource.resource_id
    }
}

/// What caused a sync run to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncTrigger {
    Scheduled,
    Startup,
    Manual,
}

impl std::fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncTrigger::Scheduled => f.write_str("scheduled"),
            SyncTrigger::Startup => f.write_str("startup"),
            SyncTrigger::Manual => f.write_str("manual"),
        }
    }
}

/// Error counts per collection stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageErrors {
    pub discovery: u32,
    pub metric_definitions: u32,
    pub metrics: u32,
}

impl StageErrors {
    pub fn total(&self) -> u32 {
        self.discovery + self.metric_definitions + self.metrics
    }
}

/// Outcome of one provider's run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub provider: Provider,
    pub trigger: SyncTrigger,
    pub fetched_at: DateTime<Utc>,
    pub resources_discovered: usize,
    pub resources_processed: usize,
    pub errors: StageErrors,
    /// Discovery hit its configured cap.
    pub truncated: bool,
    pub sync_token: String,
    pub upserted_count: usize,
    pub stale_deleted_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Ok,
    Error,
    Skipped,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStatus::Ok => f.write_str("ok"),
            SyncStatus::Error => f.write_str("error"),
            SyncStatus::Skipped => f.write_str("skipped"),
        }
    }
}

/// Process-wide run state of one sync domain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub running: bool,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub last_status: Option<SyncStatus>,
    pub last_error: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_parse_sync_domain_from_provider_or_all() {
        assert_eq!("all".parse::<SyncDomain>(), Ok(SyncDomain::All));
        assert_eq!(
            "Rackspace".parse::<SyncDomain>(),
            Ok(SyncDomain::Provider(Provider::Rackspace))
        );
        assert!("gcp".parse::<SyncDomain>().is_err());
        assert_eq!(SyncDomain::All.providers().len(), 3);
    }

    #[test]
    fn should_lowercase_resource_type_on_construction() {
        let desc = ResourceDescriptor::new(
            Provider::Azure,
            "/subscriptions/s1/resourceGroups/rg/providers/Microsoft.Compute/virtualMachines/vm1",
            "vm1",
            "Microsoft.Compute/virtualMachines",
            "tenant-1",
        );
        assert_eq!(desc.resource_type, "microsoft.compute/virtualmachines");
    }

    #[test]
    fn should_keep_descriptor_and_record_metadata_apart_when_serializing() {
        let desc = ResourceDescriptor::new(Provider::Aws, "aws://1/us-east-1/x", "x", "aws/ec2/instanceid", "1");
        let record = ResourceMetricsRecord::new(desc, Utc::now());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["resource"]["resource_id"], "aws://1/us-east-1/x");
        assert_eq!(json["resource"]["provider"], "aws");
        assert!(json["metadata"].get("error").is_none());

        let back: ResourceMetricsRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
