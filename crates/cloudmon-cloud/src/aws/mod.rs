//! AWS collector built on CloudWatch.
//!
//! CloudWatch has no resource catalog of its own, so every account and
//! region is enumerated through `ListMetrics` and one resource is
//! synthesized per primary dimension value. Each metric definition then
//! gets one `GetMetricStatistics` call for its latest datapoint.

mod cloudwatch;
mod resources;
pub mod sigv4;

pub use cloudwatch::{statistics_period, RegionScope};
pub use resources::{
    group_into_resources, primary_dimension, resource_id, resource_type, AwsResource, Dimension,
    MetricDefinition, PRIMARY_DIMENSIONS,
};

use crate::config::AwsConfig;
use crate::credentials::CloudAccount;
use crate::error::{CloudError, Result};
use crate::http::RetryingHttpClient;
use crate::runner::map_with_concurrency;
use crate::{CollectionReport, Collector};
use chrono::{DateTime, Utc};
use cloudmon_common::{Provider, ResourceMetricsRecord, StageErrors};

pub struct AwsCollector {
    config: AwsConfig,
    accounts: Vec<CloudAccount>,
    http: RetryingHttpClient,
}

/// Resources found in one account/region.
#[derive(Debug)]
pub struct RegionResources {
    pub scope: RegionScope,
    pub resources: Vec<AwsResource>,
}

#[derive(Debug)]
pub struct AwsDiscovery {
    pub regions: Vec<RegionResources>,
    /// Summary records for account/regions whose listing failed.
    pub failures: Vec<ResourceMetricsRecord>,
    pub fetched_at: DateTime<Utc>,
    pub truncated: bool,
}

impl AwsCollector {
    pub fn new(config: AwsConfig, accounts: Vec<CloudAccount>, http: RetryingHttpClient) -> Self {
        Self {
            config,
            accounts,
            http,
        }
    }

    /// The global region list wins over the account's own list.
    fn regions_for(&self, account: &CloudAccount) -> Vec<String> {
        let source = if self.config.regions.is_empty() {
            &account.regions
        } else {
            &self.config.regions
        };
        let mut regions: Vec<String> = Vec::new();
        for region in source.iter().map(|r| r.trim()).filter(|r| !r.is_empty()) {
            if !regions.iter().any(|r| r == region) {
                regions.push(region.to_string());
            }
        }
        regions
    }

    fn scopes(&self) -> Vec<RegionScope> {
        let mut scopes = Vec::new();
        for account in &self.accounts {
            let regions = self.regions_for(account);
            if regions.is_empty() {
                tracing::warn!("AWS account {} has no regions configured, skipping", account.account_id);
            }
            for region in regions {
                scopes.push(RegionScope {
                    endpoint: self.config.endpoint_url.replace("{region}", &region),
                    account: account.clone(),
                    region,
                });
            }
        }
        scopes
    }
}

#[async_trait::async_trait]
impl Collector for AwsCollector {
    type Discovery = AwsDiscovery;

    fn provider(&self) -> Provider {
        Provider::Aws
    }

    fn is_configured(&self) -> bool {
        !self.accounts.is_empty()
    }

    async fn discover(&self) -> Result<AwsDiscovery> {
        let scopes = self.scopes();
        if scopes.is_empty() {
            return Err(CloudError::Config(
                "no AWS account has a usable region".to_string(),
            ));
        }

        let fetched_at = Utc::now();
        let unit_count = scopes.len();
        let listings = map_with_concurrency(scopes, self.config.concurrency, |scope| async move {
            let listing = cloudwatch::list_metrics(
                &self.http,
                &scope,
                &self.config.namespaces,
                self.config.max_metrics_per_region,
            )
            .await;
            (scope, listing)
        })
        .await;

        let mut discovery = AwsDiscovery {
            regions: Vec::new(),
            failures: Vec::new(),
            fetched_at,
            truncated: false,
        };
        let mut last_error = None;

        for (scope, listing) in listings {
            match listing {
                Ok(listing) => {
                    tracing::info!(
                        "Discovered {} metric definitions in AWS account {} region {}",
                        listing.definitions.len(),
                        scope.account.account_id,
                        scope.region
                    );
                    discovery.truncated |= listing.truncated;
                    let resources =
                        group_into_resources(&scope.account, &scope.region, listing.definitions);
                    discovery.regions.push(RegionResources { scope, resources });
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to list metrics for AWS account {} region {}: {}",
                        scope.account.account_id,
                        scope.region,
                        e
                    );
                    let message = format!("metric discovery failed: {e}");
                    discovery.failures.push(ResourceMetricsRecord::unit_failure(
                        scope.summary_descriptor(),
                        fetched_at,
                        message.clone(),
                    ));
                    last_error = Some(message);
                }
            }
        }

        if discovery.failures.len() == unit_count {
            return Err(CloudError::Discovery {
                provider: Provider::Aws,
                message: format!(
                    "all {unit_count} account/region units failed; last error: {}",
                    last_error.unwrap_or_default()
                ),
            });
        }

        Ok(discovery)
    }

    async fn collect_metrics(&self, discovery: AwsDiscovery) -> Result<CollectionReport> {
        let end = Utc::now();
        let start = end - chrono::Duration::minutes(self.config.lookback_minutes.max(1));
        let period = statistics_period(self.config.lookback_minutes);

        let mut records = Vec::new();
        let mut jobs = Vec::new();
        for region in &discovery.regions {
            for resource in &region.resources {
                let index = records.len();
                records.push(ResourceMetricsRecord::new(
                    resource.descriptor.clone(),
                    discovery.fetched_at,
                ));
                for definition in &resource.metrics {
                    jobs.push((index, &region.scope, definition));
                }
            }
        }
        let resources_discovered = records.len();

        let results = map_with_concurrency(
            jobs,
            self.config.concurrency,
            |(index, scope, definition)| async move {
                let outcome =
                    cloudwatch::get_statistics(&self.http, scope, definition, start, end, period)
                        .await;
                (index, definition, outcome)
            },
        )
        .await;

        let mut errors = StageErrors {
            discovery: discovery.failures.len() as u32,
            ..Default::default()
        };
        let mut failed_reads = vec![0usize; records.len()];

        for (index, definition, outcome) in results {
            match outcome {
                Ok(Some(sample)) => records[index].metrics.push(sample),
                Ok(None) => {}
                Err(e) => {
                    errors.metrics += 1;
                    failed_reads[index] += 1;
                    records[index]
                        .metadata
                        .push_warning(format!("{}: {e}", definition.sample_name()));
                }
            }
        }

        let mut resources_processed = 0;
        for (record, failed) in records.iter_mut().zip(failed_reads) {
            if record.metrics.is_empty() && failed > 0 {
                record.metadata.error = Some(format!("all {failed} metric reads failed"));
            } else {
                resources_processed += 1;
            }
        }

        records.extend(discovery.failures);

        Ok(CollectionReport {
            provider: Provider::Aws,
            records,
            resources_discovered,
            resources_processed,
            errors,
            truncated: discovery.truncated,
        })
    }
}
